//! The planner: per-node thread count and scratch sizing.
//!
//! Grounded on the original library's `lm_ggml_get_n_tasks` (the thread
//! count table) and the scratch-sizing block inside `lm_ggml_graph_plan`.
//! Every [`Op`] variant has a row here — including the ones this crate
//! does not implement a kernel body for (§4.7, `DESIGN.md` Open Question
//! decisions) — so planning a graph never has to special-case "unknown op".

use std::sync::Arc;

use crate::pool::ThreadPool;
use crate::scratch::SharedScratch;
use crate::tensor::{Graph, Op};

/// One byte-sized cache line; scratch regions that must not false-share
/// (the MoE per-expert chunk counters) are padded to this.
pub const CACHE_LINE: usize = 64;

/// Polled by the executor after every node, on the thread that calls
/// `compute` (ith == 0 for that node's round), with the just-finished
/// node's index. Returning `true` latches an abort at `n + 1`.
pub type AbortCallback = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// The output of planning a graph: how many threads to run it with, how
/// much scratch it needs, and (once attached) the scratch buffer itself
/// plus an optional abort callback. Revalidated against the graph on every
/// [`crate::executor::compute`] call rather than retaining any reference to
/// it.
pub struct Plan {
    pub n_threads: usize,
    pub work_size: usize,
    pub work_data: Option<SharedScratch>,
    pub abort_callback: Option<AbortCallback>,
}

impl Plan {
    /// Allocates `work_data` from `work_size` if it hasn't been attached
    /// yet. A no-op when `work_size` is `0` or a buffer is already present.
    pub fn alloc_scratch(&mut self) {
        if self.work_size > 0 && self.work_data.is_none() {
            self.work_data = Some(SharedScratch::zeroed(self.work_size));
        }
    }

    pub fn with_abort_callback(mut self, callback: AbortCallback) -> Self {
        self.abort_callback = Some(callback);
        self
    }
}

/// Thread count this op should run with, given a budget of `n_threads` and
/// the node's own shape. Mirrors `lm_ggml_get_n_tasks`'s per-op switch.
pub fn n_tasks(graph: &Graph, node_index: usize, n_threads: usize) -> usize {
    let node = &graph.nodes[node_index];
    let op = match node.op {
        Some(op) => op,
        None => return 1, // leaves are never dispatched; 1 keeps the table total
    };
    match op {
        Op::Neg | Op::Relu => 1,
        Op::Silu | Op::Gelu => n_threads,
        Op::Add | Op::Mul => n_threads,
        Op::Sum | Op::Mean => 1,
        Op::MatMul | Op::MatMulId => n_threads,
        Op::Norm | Op::RmsNorm | Op::L2Norm => n_threads,
        Op::SoftMax => {
            let src0 = &graph.nodes[node.src[0]];
            n_threads.min(src0.nrows()).max(1)
        }
        Op::Rope | Op::Conv1d | Op::Conv2d => n_threads,
        Op::Pool1d => 1,
        // Single-threaded: multi-threading this hurts flows where the
        // tensor is about to be offloaded to a GPU layer anyway.
        Op::GetRows => 1,
        Op::Reshape | Op::View | Op::Permute | Op::Transpose => 1,
        // TODO: carried over from the original — clamp could be
        // parallelized per-row like the other unary ops but never was.
        Op::Clamp => 1,
        Op::Custom(declared) => (declared as usize).clamp(1, n_threads),
    }
}

/// Scratch bytes a single invocation of this node needs, given it will run
/// with `tasks` threads. Mirrors the sizing block in `lm_ggml_graph_plan`.
pub fn cur_scratch(graph: &Graph, node_index: usize, tasks: usize) -> usize {
    let node = &graph.nodes[node_index];
    let op = match node.op {
        Some(op) => op,
        None => return 0,
    };
    match op {
        Op::MatMul => {
            let src0 = &graph.nodes[node.src[0]];
            let src1 = &graph.nodes[node.src[1]];
            let dot_type = src0.elem_type.vec_dot_type();
            if dot_type != src1.elem_type {
                crate::ops::matmul::quantized_rhs_size(dot_type, src1.ne[0], src1.nrows())
            } else {
                0
            }
        }
        Op::MatMulId => {
            let src0 = &graph.nodes[node.src[0]];
            let src1 = &graph.nodes[node.src[1]];
            let ids = &graph.nodes[node.src[2]];
            let n_as = src0.ne[2];
            let n_ids_total = ids.ne[0] * ids.ne[1];
            let dot_type = src0.elem_type.vec_dot_type();
            let quant = if dot_type != src1.elem_type {
                crate::ops::matmul::quantized_rhs_size(dot_type, src1.ne[0], src1.nrows())
            } else {
                0
            };
            // Mirrors the exact alignment `Cursor` applies as the kernel
            // pulls these sections out in order: `take_i64` rounds up to an
            // 8-byte boundary, `take_atomic_i32_padded` to `CACHE_LINE` —
            // both can add slack beyond the sections' own raw sizes.
            let counts = n_as * std::mem::size_of::<i64>();
            let row_mapping = n_as * n_ids_total * std::mem::size_of::<(i32, i32)>();
            let chunk_ctrs = n_as * CACHE_LINE;
            let before_chunk_ctrs = quant.next_multiple_of(8) + counts + row_mapping;
            before_chunk_ctrs.next_multiple_of(CACHE_LINE) + chunk_ctrs
        }
        Op::SoftMax | Op::Rope => {
            let src0 = &graph.nodes[node.src[0]];
            std::mem::size_of::<f32>() * src0.ne[0] * tasks
        }
        _ => 0,
    }
}

/// Plans the whole graph: the effective thread count (capped by the
/// largest task count any single node asks for, and by `pool`'s own
/// maximum when one is supplied) and the maximum scratch any node needs,
/// padded by one cache line per thread so each worker can align its own
/// partition inside it. Does not allocate `work_data` or retain any
/// reference to `graph` — call [`Plan::alloc_scratch`] before
/// [`crate::executor::compute`] if `work_size > 0`.
pub fn plan(graph: &Graph, n_threads: usize, pool: Option<&ThreadPool>) -> Plan {
    let n_threads = pool.map_or(n_threads, |p| n_threads.min(p.n_threads_max()));

    let mut max_tasks = 1;
    let mut max_scratch = 0;

    for i in 0..graph.len() {
        let tasks = n_tasks(graph, i, n_threads);
        max_tasks = max_tasks.max(tasks);
        let scratch = cur_scratch(graph, i, tasks);
        max_scratch = max_scratch.max(scratch);
    }

    let n_threads = max_tasks.min(n_threads).max(1);
    let work_size = if max_scratch > 0 { max_scratch + CACHE_LINE * n_threads } else { 0 };

    Plan { n_threads, work_size, work_data: None, abort_callback: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use crate::types::ElemType;

    #[test]
    fn elementwise_op_wants_all_threads() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [8, 1, 1, 1]));
        let b = g.push(Tensor::leaf(ElemType::F32, [8, 1, 1, 1]));
        let c = g.push(Tensor::node(ElemType::F32, [8, 1, 1, 1], Op::Add, vec![a, b]));
        assert_eq!(n_tasks(&g, c, 8), 8);
    }

    #[test]
    fn reduction_is_always_single_threaded() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [8, 1, 1, 1]));
        let s = g.push(Tensor::node(ElemType::F32, [1, 1, 1, 1], Op::Sum, vec![a]));
        assert_eq!(n_tasks(&g, s, 8), 1);
    }

    #[test]
    fn softmax_is_capped_by_row_count() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [8, 3, 1, 1]));
        let s = g.push(Tensor::node(ElemType::F32, [8, 3, 1, 1], Op::SoftMax, vec![a]));
        assert_eq!(n_tasks(&g, s, 16), 3);
    }

    #[test]
    fn matmul_scratch_is_zero_when_rhs_already_matches_dot_type() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [3, 2, 1, 1]));
        let b = g.push(Tensor::leaf(ElemType::F32, [3, 4, 1, 1]));
        let m = g.push(Tensor::node(ElemType::F32, [2, 4, 1, 1], Op::MatMul, vec![a, b]));
        assert_eq!(cur_scratch(&g, m, 4), 0);
    }

    #[test]
    fn plan_caps_threads_at_the_busiest_node() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [4, 1, 1, 1]));
        let _ = g.push(Tensor::node(ElemType::F32, [1, 1, 1, 1], Op::Sum, vec![a]));
        let p = plan(&g, 8, None);
        assert_eq!(p.n_threads, 1);
        assert_eq!(p.work_size, 0);
    }

    #[test]
    fn plan_clamps_to_a_supplied_pools_thread_max() {
        use crate::pool::PoolParams;

        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [8, 1, 1, 1]));
        let b = g.push(Tensor::leaf(ElemType::F32, [8, 1, 1, 1]));
        let _ = g.push(Tensor::node(ElemType::F32, [8, 1, 1, 1], Op::Add, vec![a, b]));

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(2));
        let p = plan(&g, 8, Some(&pool));
        assert_eq!(p.n_threads, 2);
    }
}
