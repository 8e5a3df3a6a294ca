//! Operator dispatch: turns a graph node's [`Op`] into a call into
//! [`crate::ops`], plus the registry that backs [`Op::Custom`].
//!
//! The contract every kernel in `ops::*` relies on: the executor only calls
//! a kernel with `ith < n_tasks(graph, node_index, n_threads)` (`plan::n_tasks`
//! decided that cutoff already); kernels that are documented single-threaded
//! never see `ith != 0`. Dispatch is where that filtering happens, not the
//! kernels themselves.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::ops::{elementwise, matmul, moe};
use crate::pool::ThreadPool;
use crate::tensor::{Graph, Op, Tensor};

/// A user-registered operator body: `(ith, nth, dst, srcs)`.
pub type CustomOpFn = Arc<dyn Fn(usize, usize, &Tensor, &[&Tensor]) + Send + Sync>;

/// Maps a [`Op::Custom`] id to the closure that implements it. Looked up
/// once per graph build, not per call, so an `FxHashMap` (no DoS-resistant
/// hashing needed for small, programmer-chosen ids) beats the stdlib default.
#[derive(Default, Clone)]
pub struct CustomOpRegistry {
    ops: FxHashMap<u32, CustomOpFn>,
}

impl CustomOpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u32, f: CustomOpFn) {
        self.ops.insert(id, f);
    }

    pub fn get(&self, id: u32) -> Option<&CustomOpFn> {
        self.ops.get(&id)
    }
}

/// Runs graph node `node_index`'s operator for one worker. `scratch` is the
/// slice this node was granted by the plan (possibly empty); `registry`
/// resolves `Op::Custom` ids.
pub fn dispatch(pool: &ThreadPool, graph: &Graph, node_index: usize, ith: usize, nth: usize, scratch: &mut [u8], registry: &CustomOpRegistry) {
    let node = &graph.nodes[node_index];
    let op = match node.op {
        Some(op) => op,
        None => return, // leaves have nothing to compute
    };

    let src = |n: usize| &graph.nodes[node.src[n]];

    match op {
        Op::Neg if ith == 0 => elementwise::neg(node, src(0)),
        Op::Neg => {}
        Op::Relu if ith == 0 => elementwise::relu(node, src(0)),
        Op::Relu => {}
        Op::Silu => elementwise::silu(ith, nth, node, src(0)),
        Op::Gelu => elementwise::gelu(ith, nth, node, src(0)),
        Op::Add => elementwise::add(ith, nth, node, src(0), src(1)),
        Op::Mul => elementwise::mul(ith, nth, node, src(0), src(1)),
        Op::Sum if ith == 0 => elementwise::sum(node, src(0)),
        Op::Sum => {}
        Op::Mean if ith == 0 => elementwise::mean(node, src(0)),
        Op::Mean => {}
        Op::MatMul => matmul::compute(pool, ith, nth, node, src(0), src(1), scratch),
        Op::MatMulId => moe::compute(pool, ith, nth, node, src(0), src(1), src(2), scratch),
        Op::SoftMax => elementwise::softmax(ith, nth, node, src(0)),
        Op::Custom(id) => {
            if let Some(f) = registry.get(id) {
                let srcs: Vec<&Tensor> = node.src.iter().map(|&i| &graph.nodes[i]).collect();
                f(ith, nth, node, &srcs);
            } else {
                panic!("no custom operator registered for id {id}");
            }
        }
        // Table rows with no kernel body (§4.7): reaching here means the
        // planner scheduled a node this crate never promised to compute.
        Op::Norm | Op::RmsNorm | Op::L2Norm | Op::Rope | Op::Conv1d | Op::Conv2d | Op::Pool1d | Op::GetRows | Op::Reshape | Op::View | Op::Permute
        | Op::Transpose | Op::Clamp => {
            panic!("{op:?} has no kernel body in this crate")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolParams;
    use crate::types::ElemType;

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    #[test]
    fn dispatch_runs_a_builtin_binary_op() {
        let mut g = Graph::new();
        let a = g.push(Tensor::from_bytes(ElemType::F32, [2, 1, 1, 1], f32_bytes(&[1.0, 2.0])));
        let b = g.push(Tensor::from_bytes(ElemType::F32, [2, 1, 1, 1], f32_bytes(&[10.0, 20.0])));
        let c = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Add, vec![a, b]));

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(1));
        let registry = CustomOpRegistry::new();
        dispatch(&pool, &g, c, 0, 1, &mut [], &registry);

        assert_eq!(g.nodes[c].as_f32_slice(), &[11.0, 22.0]);
    }

    #[test]
    fn dispatch_runs_a_registered_custom_op() {
        let mut g = Graph::new();
        let a = g.push(Tensor::from_bytes(ElemType::F32, [2, 1, 1, 1], f32_bytes(&[1.0, 2.0])));
        let c = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Custom(7), vec![a]));

        let mut registry = CustomOpRegistry::new();
        registry.register(
            7,
            Arc::new(|_ith, _nth, dst: &Tensor, srcs: &[&Tensor]| {
                let a = srcs[0].as_f32_slice();
                let out: Vec<u8> = a.iter().flat_map(|v| (v * 2.0).to_le_bytes()).collect();
                dst.row_mut(0).copy_from_slice(&out);
            }),
        );

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(1));
        dispatch(&pool, &g, c, 0, 1, &mut [], &registry);
        assert_eq!(g.nodes[c].as_f32_slice(), &[2.0, 4.0]);
    }

    #[test]
    #[should_panic(expected = "no kernel body")]
    fn dispatch_panics_on_a_table_only_op() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [2, 1, 1, 1]));
        let c = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Rope, vec![a]));
        let pool = ThreadPool::new(PoolParams::default().with_n_threads(1));
        let registry = CustomOpRegistry::new();
        dispatch(&pool, &g, c, 0, 1, &mut [], &registry);
    }
}
