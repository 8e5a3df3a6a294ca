//! Tiled matrix multiply.
//!
//! Grounded on the original library's `lm_ggml_compute_forward_mul_mat`
//! (Phases A/B/C) and `..._one_chunk` (tile computation). `src0` is
//! `(K, M, B02, B03)`, `src1` is `(K, N, B12, B13)`, `dst` is
//! `(M, N, B12, B13)`; broadcasting factors are `r2 = B12/B02`,
//! `r3 = B13/B03`. Row indices into a tensor's flattened row space follow
//! the same `i1 + ne1*(i2 + ne2*i3)` convention as `Tensor::row`.

use std::sync::atomic::Ordering;

use crate::pool::ThreadPool;
use crate::scratch::Cursor;
use crate::tensor::Tensor;
use crate::types::Q8_BLOCK;

const BLCK_0: usize = 16;
const BLCK_1: usize = 16;

fn row_index(ne1: usize, ne2: usize, i1: usize, i2: usize, i3: usize) -> usize {
    i1 + ne1 * (i2 + ne2 * i3)
}

/// Bytes needed to hold `src1` requantized into `dot_type`, one row per
/// `src1` row. Shared with [`crate::plan`]'s scratch sizing so the two
/// never drift apart.
pub fn quantized_rhs_size(dot_type: crate::types::ElemType, src1_ne0: usize, src1_nrows: usize) -> usize {
    dot_type.row_size(src1_ne0) * src1_nrows
}

fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect()
}

/// Phase A: each worker quantizes its shard of `src1`'s K dimension (the
/// same block range for every row) into `scratch`, laid out as one
/// `dot_type`-encoded row per `src1` row in the same flattened order
/// `Tensor::row` uses. No-op (and no scratch needed) when `src1` already
/// stores the encoding `src0`'s dot product expects.
pub fn quantize_rhs(ith: usize, nth: usize, src1: &Tensor, scratch: &mut [u8]) {
    let dot_type = src1.elem_type.vec_dot_type();
    let ne10 = src1.ne[0];
    let row_bytes = dot_type.row_size(ne10);
    let block_bytes = 4 + Q8_BLOCK;

    let n_blocks = ne10.div_ceil(Q8_BLOCK);
    let block_start = (ith * n_blocks) / nth;
    let block_end = ((ith + 1) * n_blocks) / nth;
    if block_end <= block_start {
        return;
    }
    let elem_start = block_start * Q8_BLOCK;
    let elem_end = (block_end * Q8_BLOCK).min(ne10);

    for row in 0..src1.nrows() {
        let f32_row = f32_from_bytes(src1.row(row));
        let row_off = row * row_bytes;
        let dst = &mut scratch[row_off + block_start * block_bytes..row_off + block_end * block_bytes];
        dot_type.from_float(&f32_row[elem_start..elem_end], dst);
    }
}

struct TileGrid {
    nchunk0: usize,
    nchunk1: usize,
    dr0: usize,
    dr1: usize,
}

/// Phase B: decides the tile grid for an `nr0 x nr1` output given `nth`
/// workers and whether NUMA is active.
fn plan_tiles(nr0: usize, nr1: usize, nth: usize, is_numa: bool) -> TileGrid {
    let chunk_size = if nr0 == 1 || nr1 == 1 { 64 } else { 16 };
    let mut nchunk0 = nr0.div_ceil(chunk_size).max(1);
    let mut nchunk1 = nr1.div_ceil(chunk_size).max(1);

    if nchunk0 * nchunk1 < nth * 4 || is_numa {
        if nr0 > nr1 {
            nchunk0 = nth.max(1);
            nchunk1 = 1;
        } else {
            nchunk0 = 1;
            nchunk1 = nth.max(1);
        }
    }

    let dr0 = nr0.div_ceil(nchunk0);
    let dr1 = nr1.div_ceil(nchunk1);
    TileGrid { nchunk0, nchunk1, dr0, dr1 }
}

/// Computes one `[ir0_start, ir0_end) x [ir1_start, ir1_end)` tile,
/// sub-tiled `BLCK_0 x BLCK_1`.
#[allow(clippy::too_many_arguments)]
fn one_chunk(
    dst: &Tensor,
    src0: &Tensor,
    src1: &Tensor,
    rhs_quantized: Option<&[u8]>,
    ir0_start: usize,
    ir0_end: usize,
    ir1_start: usize,
    ir1_end: usize,
    r2: usize,
    r3: usize,
) {
    let dot_type = src0.elem_type.vec_dot_type();
    let rhs_row_bytes = dot_type.row_size(src1.ne[0]);

    let mut iir1 = ir1_start;
    while iir1 < ir1_end {
        let ir1_top = (iir1 + BLCK_1).min(ir1_end);
        let mut iir0 = ir0_start;
        while iir0 < ir0_end {
            let ir0_top = (iir0 + BLCK_0).min(ir0_end);

            for ir1 in iir1..ir1_top {
                let i13 = ir1 / (dst.ne[1] * dst.ne[2]);
                let rem = ir1 % (dst.ne[1] * dst.ne[2]);
                let i12 = rem / dst.ne[1];
                let i11 = rem % dst.ne[1];
                let i03 = i13 / r3;
                let i02 = i12 / r2;

                let rhs_row: Vec<u8> = match rhs_quantized {
                    Some(buf) => buf[ir1 * rhs_row_bytes..(ir1 + 1) * rhs_row_bytes].to_vec(),
                    None => src1.row(ir1).to_vec(),
                };

                let mut tmp = [0f32; BLCK_0];
                let mut count = 0;
                for ir0 in iir0..ir0_top {
                    let src0_row = src0.row(row_index(src0.ne[1], src0.ne[2], ir0, i02, i03));
                    tmp[count] = dot_type.vec_dot(src0.ne[0], src0_row, &rhs_row);
                    count += 1;
                }

                let dst_row = dst.row_mut(row_index(dst.ne[1], dst.ne[2], i11, i12, i13));
                let bytes: Vec<u8> = tmp[..count].iter().flat_map(|v| v.to_le_bytes()).collect();
                let start = iir0 * 4;
                dst_row[start..start + bytes.len()].copy_from_slice(&bytes);
            }
            iir0 += BLCK_0;
        }
        iir1 += BLCK_1;
    }
}

/// Full matmul entry point: Phase A (optional quantization), Phase B (tile
/// planning), Phase C (work-stealing tile loop). Every one of the `nth`
/// participating workers must call this with the same `nth`, `scratch`,
/// and tensors; each calls it once with its own `ith`. The caller (the
/// pool's `execute`) barriers every participant once this returns; this
/// function only needs the internal Phase A -> B/C barrier below.
pub fn compute(pool: &ThreadPool, ith: usize, nth: usize, dst: &Tensor, src0: &Tensor, src1: &Tensor, scratch: &mut [u8]) {
    assert_eq!(dst.nb[0], 4, "dst must not be transposed");
    assert!(src0.is_row_contiguous() && src1.is_row_contiguous());

    let r2 = dst.ne[2] / src0.ne[2];
    let r3 = dst.ne[3] / src0.ne[3];
    assert_eq!(dst.ne[2] % src0.ne[2], 0, "broadcast factor r2 must be integral");
    assert_eq!(dst.ne[3] % src0.ne[3], 0, "broadcast factor r3 must be integral");

    let dot_type = src0.elem_type.vec_dot_type();
    let needs_quant = dot_type != src1.elem_type;

    let quantized_owned: Option<Vec<u8>> = if needs_quant {
        let mut cursor = Cursor::new(scratch);
        let buf = cursor.take_u8(quantized_rhs_size(dot_type, src1.ne[0], src1.nrows()));
        quantize_rhs(ith, nth, src1, buf);
        Some(buf.to_vec())
    } else {
        None
    };

    if ith == 0 {
        pool.current_chunk().store(nth as i32, Ordering::Relaxed);
    }
    pool.barrier().wait();

    let nr0 = src0.ne[1];
    let nr1 = dst.ne[1] * dst.ne[2] * dst.ne[3];
    let is_numa = crate::numa::topology().map(|t| t.is_numa()).unwrap_or(false);
    let tiles = plan_tiles(nr0, nr1, nth, is_numa);

    let mut current = ith as i32;
    loop {
        if current < 0 || current as usize >= tiles.nchunk0 * tiles.nchunk1 {
            break;
        }
        let c = current as usize;
        let c0 = c % tiles.nchunk0;
        let c1 = c / tiles.nchunk0;
        let ir0_start = tiles.dr0 * c0;
        let ir0_end = (ir0_start + tiles.dr0).min(nr0);
        let ir1_start = tiles.dr1 * c1;
        let ir1_end = (ir1_start + tiles.dr1).min(nr1);

        one_chunk(dst, src0, src1, quantized_owned.as_deref(), ir0_start, ir0_end, ir1_start, ir1_end, r2, r3);

        if nth >= tiles.nchunk0 * tiles.nchunk1 {
            break;
        }
        current = pool.current_chunk().fetch_add(1, Ordering::Relaxed) + 1;
    }
}
