//! The graph executor: `plan` a graph once, `compute` it against that plan
//! (node by node on a [`ThreadPool`], checking for cancellation between
//! nodes), or use [`Context::compute_with_ctx`] to do both in one call
//! against a reusable scratch buffer.
//!
//! Grounded on the original library's `lm_ggml_graph_compute` — the outer
//! loop that walks the graph, re-dispatches `execute` per node with that
//! node's own task count, and consults an abort flag — and
//! `lm_ggml_graph_compute_with_ctx`, which folds planning and a
//! context-owned scratch allocation into one convenience call.

use std::sync::atomic::Ordering;

use crate::dispatch::{self, CustomOpRegistry};
use crate::plan::{self, Plan};
use crate::pool::ThreadPool;
use crate::scratch::SharedScratch;
use crate::tensor::Graph;

/// How a graph run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Done,
    /// Cancelled before reaching this node index (see
    /// [`ThreadPool::abort_index`]).
    Aborted { stopped_at: usize },
}

/// Drives `graph` to completion on `pool` against an already-built `plan`
/// (see [`plan::plan`]), dispatching every node through `registry`.
///
/// # Panics
/// If `plan.work_size > 0` and no scratch buffer has been attached (see
/// [`Plan::alloc_scratch`]), or if a node's actual scratch need exceeds
/// what's attached — both indicate `plan` was not built for this `graph`.
pub fn compute(pool: &ThreadPool, graph: &Graph, plan: &Plan, registry: &CustomOpRegistry) -> Status {
    assert!(
        plan.work_size == 0 || plan.work_data.is_some(),
        "plan.work_size is {} but no scratch buffer is attached; call Plan::alloc_scratch first",
        plan.work_size
    );

    pool.reset_abort();

    for node_index in 0..graph.len() {
        let abort = pool.abort_index().load(Ordering::Relaxed);
        if abort >= 0 && node_index as i32 >= abort {
            return Status::Aborted { stopped_at: node_index };
        }

        if graph.nodes[node_index].op.is_none() {
            continue; // leaves are never dispatched
        }

        let tasks = plan::n_tasks(graph, node_index, plan.n_threads);
        let needed = plan::cur_scratch(graph, node_index, tasks);
        if let Some(scratch) = &plan.work_data {
            assert!(needed <= scratch.len(), "node {node_index} needs {needed} scratch bytes, plan granted {}", scratch.len());
        } else {
            assert_eq!(needed, 0, "node {node_index} needs {needed} scratch bytes but the plan has none attached");
        }

        pool.execute(tasks, &|ith, nth| {
            let mut none: [u8; 0] = [];
            let buf: &mut [u8] = match &plan.work_data {
                Some(scratch) => &mut scratch.as_mut_slice()[..needed],
                None => &mut none,
            };
            dispatch::dispatch(pool, graph, node_index, ith, nth, buf, registry);

            if ith == 0 {
                if let Some(callback) = &plan.abort_callback {
                    if callback(node_index) {
                        pool.abort_index().store(node_index as i32 + 1, Ordering::Relaxed);
                    }
                }
            }
        });
    }

    Status::Done
}

/// Bundles a pool, a custom-op registry, and a scratch buffer that's
/// reused (and grown, never shrunk) across calls — the
/// `lm_ggml_graph_compute_with_ctx` convenience path, as opposed to
/// [`compute`]'s "caller supplies an already-built, already-allocated
/// `Plan`" contract.
pub struct Context {
    pool: ThreadPool,
    registry: CustomOpRegistry,
    scratch: Option<SharedScratch>,
}

impl Context {
    pub fn new(pool: ThreadPool) -> Self {
        Context { pool, registry: CustomOpRegistry::new(), scratch: None }
    }

    pub fn with_registry(mut self, registry: CustomOpRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Plans `graph` for up to `n_threads` (clamped to the pool's own max),
    /// growing the context's reused scratch buffer if this plan needs more
    /// than it currently holds, then runs it.
    pub fn compute_with_ctx(&mut self, graph: &Graph, n_threads: usize) -> Status {
        let mut plan = plan::plan(graph, n_threads, Some(&self.pool));

        if plan.work_size > self.scratch.as_ref().map_or(0, SharedScratch::len) {
            self.scratch = Some(SharedScratch::zeroed(plan.work_size));
        }
        plan.work_data = self.scratch.take();

        let status = compute(&self.pool, graph, &plan, &self.registry);

        self.scratch = plan.work_data;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolParams;
    use crate::tensor::{Op, Tensor};
    use crate::types::ElemType;

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    /// `plan` then `compute` in one call, scratch allocated fresh each time
    /// — the shape most of these tests want; [`Context::compute_with_ctx`]
    /// and the abort-callback tests below exercise the rest of the surface.
    fn run(pool: &ThreadPool, graph: &Graph, registry: &CustomOpRegistry) -> Status {
        let mut plan = plan::plan(graph, pool.n_threads_max(), Some(pool));
        plan.alloc_scratch();
        compute(pool, graph, &plan, registry)
    }

    #[test]
    fn runs_a_small_graph_end_to_end() {
        let mut g = Graph::new();
        let a = g.push(Tensor::from_bytes(ElemType::F32, [2, 1, 1, 1], f32_bytes(&[1.0, 2.0])));
        let b = g.push(Tensor::from_bytes(ElemType::F32, [2, 1, 1, 1], f32_bytes(&[10.0, 20.0])));
        let sum = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Add, vec![a, b]));
        let relu = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Relu, vec![sum]));

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(2));
        let registry = CustomOpRegistry::new();
        let status = run(&pool, &g, &registry);

        assert_eq!(status, Status::Done);
        assert_eq!(g.nodes[relu].as_f32_slice(), &[11.0, 22.0]);
    }

    #[test]
    fn abort_index_stops_the_walk_early() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [2, 1, 1, 1]));
        let mut prev = a;
        for _ in 0..5 {
            prev = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Relu, vec![prev]));
        }

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(1));
        pool.abort_index().store(2, Ordering::Relaxed);
        let registry = CustomOpRegistry::new();
        let status = run(&pool, &g, &registry);

        assert_eq!(status, Status::Aborted { stopped_at: 2 });
    }

    #[test]
    fn abort_callback_on_the_plan_stops_the_walk_at_the_node_it_fires_on() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [2, 1, 1, 1]));
        let mut prev = a;
        for _ in 0..5 {
            prev = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Relu, vec![prev]));
        }

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(1));
        let registry = CustomOpRegistry::new();
        let mut plan = plan::plan(&g, pool.n_threads_max(), Some(&pool));
        plan.alloc_scratch();
        // Fires on node 2, same stopping point as the static-index test above.
        let plan = plan.with_abort_callback(std::sync::Arc::new(|node_index: usize| node_index == 2));

        let status = compute(&pool, &g, &plan, &registry);

        assert_eq!(status, Status::Aborted { stopped_at: 3 });
    }

    #[test]
    fn compute_panics_if_scratch_is_needed_but_never_attached() {
        let mut g = Graph::new();
        let a = g.push(Tensor::from_bytes(ElemType::F32, [4, 2, 1, 1], f32_bytes(&[1.0, 2.0, 3.0, 4.0, 1.0, 1.0, 1.0, 1.0])));
        let _ = g.push(Tensor::node(ElemType::F32, [4, 2, 1, 1], Op::SoftMax, vec![a]));

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(2));
        let registry = CustomOpRegistry::new();
        let plan = plan::plan(&g, pool.n_threads_max(), Some(&pool)); // no alloc_scratch()
        assert!(plan.work_size > 0);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| compute(&pool, &g, &plan, &registry)));
        assert!(result.is_err());
    }

    #[test]
    fn compute_with_ctx_reuses_and_grows_its_scratch_buffer() {
        let pool = ThreadPool::new(PoolParams::default().with_n_threads(2));
        let mut ctx = Context::new(pool);

        let mut g = Graph::new();
        let a = g.push(Tensor::from_bytes(ElemType::F32, [2, 1, 1, 1], f32_bytes(&[1.0, -2.0])));
        let relu = g.push(Tensor::node(ElemType::F32, [2, 1, 1, 1], Op::Relu, vec![a]));
        assert_eq!(ctx.compute_with_ctx(&g, 2), Status::Done);
        assert_eq!(g.nodes[relu].as_f32_slice(), &[1.0, 0.0]);

        let mut g2 = Graph::new();
        let a = g2.push(Tensor::from_bytes(ElemType::F32, [3, 2, 1, 1], f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])));
        let b = g2.push(Tensor::from_bytes(ElemType::F32, [3, 2, 1, 1], f32_bytes(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0])));
        let m = g2.push(Tensor::node(ElemType::F32, [2, 2, 1, 1], Op::MatMul, vec![a, b]));
        assert_eq!(ctx.compute_with_ctx(&g2, 2), Status::Done);
        assert_eq!(g2.nodes[m].as_f32_slice(), &[4.0, 5.0, 10.0, 11.0]);
    }

    /// Builds the three-node add/relu graph used above, but through a
    /// fallible constructor, the way a larger integration test might wire up
    /// several such helpers with `?` instead of unwrapping each step.
    fn build_add_relu_graph(lhs: &[f32], rhs: &[f32]) -> anyhow::Result<Graph> {
        anyhow::ensure!(lhs.len() == rhs.len(), "operand length mismatch: {} vs {}", lhs.len(), rhs.len());
        let mut g = Graph::new();
        let a = g.push(Tensor::from_bytes(ElemType::F32, [lhs.len(), 1, 1, 1], f32_bytes(lhs)));
        let b = g.push(Tensor::from_bytes(ElemType::F32, [rhs.len(), 1, 1, 1], f32_bytes(rhs)));
        let sum = g.push(Tensor::node(ElemType::F32, [lhs.len(), 1, 1, 1], Op::Add, vec![a, b]));
        g.push(Tensor::node(ElemType::F32, [lhs.len(), 1, 1, 1], Op::Relu, vec![sum]));
        Ok(g)
    }

    #[test]
    fn fallible_graph_builder_runs_the_same_as_the_manual_one() -> anyhow::Result<()> {
        let g = build_add_relu_graph(&[1.0, -5.0], &[2.0, 1.0])?;
        let relu = g.len() - 1;
        let pool = ThreadPool::new(PoolParams::default().with_n_threads(2));
        let registry = CustomOpRegistry::new();
        assert_eq!(run(&pool, &g, &registry), Status::Done);
        assert_eq!(g.nodes[relu].as_f32_slice(), &[3.0, 0.0]);
        Ok(())
    }

    #[test]
    fn fallible_graph_builder_rejects_mismatched_operands() {
        assert!(build_add_relu_graph(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn matmul_node_runs_through_the_full_planner_and_dispatcher() {
        let mut g = Graph::new();
        let a = g.push(Tensor::from_bytes(ElemType::F32, [3, 2, 1, 1], f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])));
        let b = g.push(Tensor::from_bytes(ElemType::F32, [3, 2, 1, 1], f32_bytes(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0])));
        let m = g.push(Tensor::node(ElemType::F32, [2, 2, 1, 1], Op::MatMul, vec![a, b]));

        let pool = ThreadPool::new(PoolParams::default().with_n_threads(3));
        let registry = CustomOpRegistry::new();
        assert_eq!(run(&pool, &g, &registry), Status::Done);
        assert_eq!(g.nodes[m].as_f32_slice(), &[4.0, 5.0, 10.0, 11.0]);
    }
}
