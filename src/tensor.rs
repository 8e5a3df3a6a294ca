//! The tensor/graph/op data model.
//!
//! Mirrors the original library's `struct lm_ggml_tensor` (`ne`, `nb`, `op`,
//! `src`) and its flat, externally-built compute graph. This crate never
//! resizes a tensor's storage and never topologically sorts a graph — both
//! are the job of whatever builds the graph (out of scope, §1).

use std::sync::Arc;

use crate::types::ElemType;

/// The operator an [`Op`] variant performs also determines its planner row
/// in [`crate::plan`] (thread count and scratch sizing). Variants without a
/// `(impl)` note below are present only so that planner dispatch is total
/// over `Op` — see `SPEC_FULL.md` §4.7 and `DESIGN.md`'s Open Question
/// decisions. Attempting to `compute` one of those is a precondition
/// violation (fatal assert), same as any other contract breach in this
/// crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // --- unary, single-threaded (impl) ---
    Neg,
    Relu,
    // --- unary, multi-threaded (impl) ---
    Silu,
    Gelu,
    // --- elementwise binary (impl) ---
    Add,
    Mul,
    // --- reductions, single-threaded (impl) ---
    Sum,
    Mean,
    // --- matmul family (impl) ---
    MatMul,
    MatMulId,
    // --- normalization (table row only) ---
    Norm,
    RmsNorm,
    L2Norm,
    // --- softmax (impl) ---
    SoftMax,
    // --- table rows only: no kernel body ships (§1, §4.7) ---
    Rope,
    Conv1d,
    Conv2d,
    Pool1d,
    /// Preserved single-threaded per the original's GPU-offload-cost note.
    GetRows,
    Reshape,
    View,
    Permute,
    Transpose,
    /// Preserved single-threaded; the original carries a TODO here too.
    Clamp,
    /// User-registered operator (see [`crate::dispatch::CustomOpRegistry`]).
    /// Its declared thread count is clamped to the plan's `n_threads`.
    Custom(u32),
}

/// Backing storage for tensor data: a single allocation shared (by
/// reference) across every tensor view into it.
///
/// Tensors hand out raw byte ranges rather than safe `&mut [u8]` borrows
/// because the executor's whole parallelism model is "many threads hold
/// disjoint byte ranges of the same allocation at once" — something the
/// borrow checker cannot express directly. Soundness rests on the
/// invariant documented on [`slice_mut`](TensorStorage::slice_mut): callers
/// (the operator kernels in [`crate::ops`]) must only ever request
/// non-overlapping ranges for concurrent writers, which the matmul tiling
/// and row-splitting in this crate are built to guarantee.
pub struct TensorStorage {
    ptr: *mut u8,
    len: usize,
    _owner: Box<[u8]>,
}

// SAFETY: `TensorStorage` is shared across worker threads by `Arc`; callers
// of `slice`/`slice_mut` uphold the disjoint-write invariant documented on
// `slice_mut`.
unsafe impl Send for TensorStorage {}
unsafe impl Sync for TensorStorage {}

impl TensorStorage {
    pub fn zeroed(len: usize) -> Self {
        let mut owner = vec![0u8; len].into_boxed_slice();
        let ptr = owner.as_mut_ptr();
        TensorStorage { ptr, len, _owner: owner }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut owner = bytes.into_boxed_slice();
        let ptr = owner.as_mut_ptr();
        TensorStorage { ptr, len: owner.len(), _owner: owner }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shared, read-only view of `len` bytes starting at `offset`.
    ///
    /// Safe to call concurrently with other readers. Calling it while
    /// another thread holds an overlapping [`slice_mut`](Self::slice_mut)
    /// is undefined behavior; the executor's tiling guarantees this does
    /// not happen for any operator shipped in this crate.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "tensor storage read out of bounds");
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Exclusive view of `len` bytes starting at `offset`.
    ///
    /// # Safety (invariant, not a `fn` contract)
    /// Two calls whose `[offset, offset+len)` ranges overlap must never be
    /// held at the same time from different threads. Every operator in
    /// [`crate::ops`] partitions its output before calling this so that no
    /// two workers ever claim the same byte range.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len, "tensor storage write out of bounds");
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }
}

/// A node in a compute graph.
///
/// `ne` are element extents (`ne[0]` is the innermost, fastest-varying
/// dimension — a row's length — following the original's convention); `nb`
/// are byte strides, with `nb[0]` the per-element stride along that same
/// innermost dimension.
/// `src` holds indices of this node's operands within the owning
/// [`Graph`]; leaves (no producing operator) have `op == None` handled at
/// the `Graph` level by simply never being a dispatch target.
#[derive(Clone)]
pub struct Tensor {
    pub elem_type: ElemType,
    pub ne: [usize; 4],
    pub nb: [usize; 4],
    pub op: Option<Op>,
    pub src: Vec<usize>,
    pub op_params: Vec<u8>,
    storage: Arc<TensorStorage>,
    pub byte_offset: usize,
}

impl Tensor {
    /// Builds a contiguous leaf tensor (no producing op) with freshly
    /// zeroed storage of `row_size(nelements) + padding` bytes.
    pub fn leaf(elem_type: ElemType, ne: [usize; 4]) -> Self {
        let nelements = ne[0] * ne[1] * ne[2] * ne[3];
        let storage = Arc::new(TensorStorage::zeroed(elem_type.row_size(nelements)));
        Self::contiguous(elem_type, ne, storage, 0)
    }

    /// Builds a leaf tensor from already-encoded bytes (used by tests to
    /// construct fixtures without going through `from_float`).
    pub fn from_bytes(elem_type: ElemType, ne: [usize; 4], bytes: Vec<u8>) -> Self {
        let storage = Arc::new(TensorStorage::from_bytes(bytes));
        Self::contiguous(elem_type, ne, storage, 0)
    }

    /// Builds a node computed by `op` from `src`, sharing a freshly
    /// allocated destination buffer sized for `ne` elements.
    pub fn node(elem_type: ElemType, ne: [usize; 4], op: Op, src: Vec<usize>) -> Self {
        let nelements = ne[0] * ne[1] * ne[2] * ne[3];
        let storage = Arc::new(TensorStorage::zeroed(elem_type.row_size(nelements)));
        let mut t = Self::contiguous(elem_type, ne, storage, 0);
        t.op = Some(op);
        t.src = src;
        t
    }

    fn contiguous(elem_type: ElemType, ne: [usize; 4], storage: Arc<TensorStorage>, byte_offset: usize) -> Self {
        let elem_bytes = match elem_type {
            ElemType::F32 => std::mem::size_of::<f32>(),
            ElemType::Q8 => 0, // quantized tensors are never strided directly; see row_size
        };
        let nb0 = elem_bytes.max(1);
        let nb1 = nb0 * ne[0];
        let nb2 = nb1 * ne[1];
        let nb3 = nb2 * ne[2];
        Tensor {
            elem_type,
            ne,
            nb: [nb0, nb1, nb2, nb3],
            op: None,
            src: Vec::new(),
            op_params: Vec::new(),
            storage,
            byte_offset,
        }
    }

    pub fn nelements(&self) -> usize {
        self.ne[0] * self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn nrows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn is_row_contiguous(&self) -> bool {
        self.nb[0] == std::mem::size_of::<f32>().max(1) || self.elem_type == ElemType::Q8
    }

    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.elem_type, ElemType::F32);
        let bytes = self.storage.slice(self.byte_offset, self.nelements() * 4);
        bytemuck_bytes_to_f32(bytes)
    }

    pub fn row(&self, row_index: usize) -> &[u8] {
        let off = self.byte_offset + row_index * self.nb[1];
        self.storage.slice(off, self.elem_type.row_size(self.ne[0]))
    }

    pub fn row_mut(&self, row_index: usize) -> &mut [u8] {
        let off = self.byte_offset + row_index * self.nb[1];
        self.storage.slice_mut(off, self.elem_type.row_size(self.ne[0]))
    }

    pub fn byte_range(&self, offset: usize, len: usize) -> &[u8] {
        self.storage.slice(self.byte_offset + offset, len)
    }

    pub fn byte_range_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        self.storage.slice_mut(self.byte_offset + offset, len)
    }
}

fn bytemuck_bytes_to_f32(bytes: &[u8]) -> &[f32] {
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<f32>(), 0, "misaligned f32 view");
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
}

/// An ordered, dependency-respecting list of nodes. The executor walks it
/// linearly; building that order is the caller's job (§1, §2 DATA MODEL).
#[derive(Default, Clone)]
pub struct Graph {
    pub nodes: Vec<Tensor>,
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::new() }
    }

    /// Appends `tensor` and returns its index, which later nodes reference
    /// through `src`.
    pub fn push(&mut self, tensor: Tensor) -> usize {
        self.nodes.push(tensor);
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_tensor_has_zeroed_storage_of_the_right_size() {
        let t = Tensor::leaf(ElemType::F32, [4, 2, 1, 1]);
        assert_eq!(t.nelements(), 8);
        assert_eq!(t.as_f32_slice(), &[0.0; 8]);
    }

    #[test]
    fn graph_push_returns_sequential_indices() {
        let mut g = Graph::new();
        let a = g.push(Tensor::leaf(ElemType::F32, [1, 1, 1, 1]));
        let b = g.push(Tensor::leaf(ElemType::F32, [1, 1, 1, 1]));
        assert_eq!((a, b), (0, 1));
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn row_mut_ranges_for_distinct_rows_do_not_overlap() {
        let t = Tensor::leaf(ElemType::F32, [3, 2, 1, 1]);
        let r0 = t.row_mut(0).as_ptr() as usize;
        let r1 = t.row_mut(1).as_ptr() as usize;
        assert!(r1 >= r0 + t.elem_type.row_size(t.ne[0]));
    }
}
