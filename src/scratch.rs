//! Bump allocator over caller-supplied scratch.
//!
//! Grounded on the original library's `incr_ptr_aligned` helper: operators
//! that need working memory (quantizing a matmul's right-hand side, the MoE
//! bucket tables) carve it out of one flat `&mut [u8]` handed in by the
//! plan, in a fixed order, with explicit alignment. There is no free: the
//! whole scratch buffer's lifetime is one graph execution.

/// A single-pass, one-directional allocator over a borrowed byte slice.
pub struct Cursor<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Cursor { buf, offset: 0 }
    }

    /// Bytes remaining after the current offset.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Bytes consumed so far (the plan's `cur_scratch` must be at least
    /// this much once every operator has pulled its partitions).
    pub fn consumed(&self) -> usize {
        self.offset
    }

    fn align_to(&mut self, align: usize) {
        let rem = self.offset % align;
        if rem != 0 {
            self.offset += align - rem;
        }
    }

    /// Carves out `len` bytes aligned to `align`, returning a mutable view.
    /// Panics if the buffer is exhausted — running out of scratch is a
    /// planner bug, not a recoverable condition (§7).
    pub fn take(&mut self, len: usize, align: usize) -> &'a mut [u8] {
        self.align_to(align);
        assert!(
            self.offset + len <= self.buf.len(),
            "scratch exhausted: need {len} bytes at offset {}, have {}",
            self.offset,
            self.buf.len()
        );
        // SAFETY: splits `self.buf` at a fresh, previously-unborrowed
        // offset; `self.offset` only ever advances, so no two `take` calls
        // can return overlapping ranges.
        let ptr = unsafe { self.buf.as_mut_ptr().add(self.offset) };
        self.offset += len;
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    pub fn take_u8(&mut self, len: usize) -> &'a mut [u8] {
        self.take(len, 1)
    }

    pub fn take_i64(&mut self, count: usize) -> &'a mut [i64] {
        let bytes = self.take(count * 8, 8);
        // SAFETY: `bytes` is exactly `count * size_of::<i64>()` long and
        // 8-byte aligned (requested alignment above).
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut i64, count) }
    }

    /// Carves out `count` atomics, each padded to its own cache line.
    ///
    /// Plain 4-byte-strided atomics would false-share a cache line whenever
    /// two different counters are hammered by different workers at once —
    /// exactly what the MoE kernel's per-expert chunk counters do in Phase C
    /// (different experts' counters, `fetch_add`-ed concurrently by whichever
    /// workers are currently stealing tiles from them). `#[repr(align(64))]`
    /// rounds `PaddedAtomicI32`'s size up to 64 bytes, so indexing the
    /// returned slice gives each counter its own line.
    pub fn take_atomic_i32_padded(&mut self, count: usize) -> &'a mut [PaddedAtomicI32] {
        let bytes = self.take(count * CACHE_LINE, CACHE_LINE);
        // SAFETY: `bytes` is exactly `count * size_of::<PaddedAtomicI32>()`
        // long (size is forced to 64 by `#[repr(align(64))]`) and aligned to
        // 64, which is also `PaddedAtomicI32`'s alignment.
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut PaddedAtomicI32, count) }
    }
}

/// One byte-sized cache line; mirrors [`crate::plan::CACHE_LINE`] without
/// introducing a dependency from `scratch` on `plan`.
const CACHE_LINE: usize = 64;

/// A single [`AtomicI32`](std::sync::atomic::AtomicI32) padded to occupy a
/// whole cache line, so a slice of them never false-shares. `Deref`s to the
/// atomic so callers use it exactly like a plain `&AtomicI32`.
#[repr(align(64))]
pub struct PaddedAtomicI32(std::sync::atomic::AtomicI32);

impl PaddedAtomicI32 {
    pub fn new(v: i32) -> Self {
        PaddedAtomicI32(std::sync::atomic::AtomicI32::new(v))
    }
}

impl std::ops::Deref for PaddedAtomicI32 {
    type Target = std::sync::atomic::AtomicI32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A scratch buffer shared by every worker in one [`crate::pool::ThreadPool::execute`]
/// round. Exists for the same reason [`crate::tensor::TensorStorage`] hands
/// out raw `&mut [u8]` views instead of a single safe borrow: each worker
/// needs simultaneous write access to its own disjoint region of the same
/// allocation, something one `&mut [u8]` argument to a `Fn` closure cannot
/// express. Callers (the executor) are responsible for partitioning access
/// the same way the matmul and MoE kernels partition a tensor's rows.
pub struct SharedScratch {
    buf: Box<[u8]>,
}

// SAFETY: callers uphold the disjoint-write invariant documented above.
unsafe impl Send for SharedScratch {}
unsafe impl Sync for SharedScratch {}

impl SharedScratch {
    pub fn zeroed(len: usize) -> Self {
        SharedScratch { buf: vec![0u8; len].into_boxed_slice() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the whole buffer mutably.
    ///
    /// # Safety (invariant, not a `fn` contract)
    /// Must not be called from two workers at once in a way that lets them
    /// write overlapping ranges; every kernel in [`crate::ops`] carves its
    /// own disjoint range out of the result via [`Cursor`] before writing.
    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        let ptr = self.buf.as_ptr() as *mut u8;
        unsafe { std::slice::from_raw_parts_mut(ptr, self.buf.len()) }
    }
}
