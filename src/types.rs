//! Per-element-encoding kernel table.
//!
//! Every tensor carries an [`ElemType`] describing how its bytes are laid
//! out. The matmul engine ([`crate::ops::matmul`]) and the indexed matmul
//! engine ([`crate::ops::moe`]) never hard-code a numeric type: they look up
//! a [`TypeTraits`] row and call through it. This mirrors the original
//! library's `type_traits_cpu` table (`vec_dot`, `vec_dot_type`,
//! `from_float`, `nrows`), trimmed to the two encodings this crate actually
//! ships: plain `f32` and a toy 8-wide block-quantized encoding used only to
//! exercise the "right-hand side must be requantized into scratch" path
//! (§1 keeps real quantization codecs out of scope).

/// Element encoding of a tensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    /// Plain row-major `f32`.
    F32,
    /// Toy block-quantized encoding: each block of [`Q8_BLOCK`] values is
    /// stored as one `f32` scale followed by `Q8_BLOCK` `i8` codes.
    Q8,
}

/// Number of values per quantized block.
pub const Q8_BLOCK: usize = 8;

impl ElemType {
    /// Bytes occupied by `n` contiguous elements of this encoding.
    pub fn row_size(self, n: usize) -> usize {
        match self {
            ElemType::F32 => n * std::mem::size_of::<f32>(),
            ElemType::Q8 => {
                let blocks = n.div_ceil(Q8_BLOCK);
                blocks * (std::mem::size_of::<f32>() + Q8_BLOCK)
            }
        }
    }

    /// The encoding a dot product expects its right-hand-side operand in.
    /// `F32 * F32` dots directly; anything quantized dots against `Q8`.
    pub fn vec_dot_type(self) -> ElemType {
        match self {
            ElemType::F32 => ElemType::F32,
            ElemType::Q8 => ElemType::Q8,
        }
    }

    /// Rows a single `vec_dot` call can produce at once. Real SIMD kernels
    /// sometimes process two interleaved rows per call; this crate's
    /// reference kernels always produce one.
    pub fn nrows(self) -> usize {
        1
    }

    /// Converts `n` `f32` values at `src` into this encoding at `dst`,
    /// returning the bytes written.
    pub fn from_float(self, src: &[f32], dst: &mut [u8]) -> usize {
        match self {
            ElemType::F32 => {
                let bytes = bytemuck_f32_to_bytes(src);
                dst[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
            ElemType::Q8 => quantize_q8(src, dst),
        }
    }

    /// Dot product of `n` elements starting at `a` (this encoding) against
    /// `n` elements starting at `b` (this encoding's [`vec_dot_type`]).
    pub fn vec_dot(self, n: usize, a: &[u8], b: &[u8]) -> f32 {
        match self {
            ElemType::F32 => {
                let a = f32_slice(a, n);
                let b = f32_slice(b, n);
                a.iter().zip(b).map(|(x, y)| x * y).sum()
            }
            ElemType::Q8 => dot_q8(n, a, b),
        }
    }
}

fn bytemuck_f32_to_bytes(src: &[f32]) -> Vec<u8> {
    src.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_slice(bytes: &[u8], n: usize) -> Vec<f32> {
    bytes[..n * 4]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn quantize_q8(src: &[f32], dst: &mut [u8]) -> usize {
    let mut written = 0;
    for block in src.chunks(Q8_BLOCK) {
        let amax = block.iter().fold(0f32, |m, v| m.max(v.abs()));
        let scale = if amax == 0.0 { 1.0 } else { amax / 127.0 };
        dst[written..written + 4].copy_from_slice(&scale.to_le_bytes());
        written += 4;
        for (i, v) in block.iter().enumerate() {
            let q = if scale == 0.0 { 0 } else { (v / scale).round() as i8 };
            dst[written + i] = q as u8;
        }
        written += Q8_BLOCK;
    }
    written
}

fn dot_q8(n: usize, a: &[u8], b: &[u8]) -> f32 {
    let blocks = n.div_ceil(Q8_BLOCK);
    let block_bytes = 4 + Q8_BLOCK;
    let mut acc = 0f32;
    let mut remaining = n;
    for blk in 0..blocks {
        let off = blk * block_bytes;
        let sa = f32::from_le_bytes(a[off..off + 4].try_into().unwrap());
        let sb = f32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        let count = remaining.min(Q8_BLOCK);
        for i in 0..count {
            let qa = a[off + 4 + i] as i8 as f32;
            let qb = b[off + 4 + i] as i8 as f32;
            acc += qa * sa * qb * sb;
        }
        remaining -= count;
    }
    acc
}
