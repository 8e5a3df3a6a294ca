//! Indexed (mixture-of-experts) matrix multiply.
//!
//! Grounded on the original library's `lm_ggml_compute_forward_mul_mat_id`
//! and `mmid_row_mapping`. `src0` is a bank of `n_as` expert matrices
//! (`ne = [K, M, n_as, 1]`); `src1` is `(K, B_ids, 1, 1)`, one row per
//! token; `ids` is `(n_ids, B_ids, 1, 1)`, each row naming the `n_ids`
//! experts that token is routed to. `dst` mirrors `ids`'s shape
//! (`[n_ids, B_ids, 1, 1]`, each element replaced by an `M`-length row):
//! slot `(slot, token)` holds the output of expert `ids[slot, token]`
//! applied to `src1`'s `token` row. Combining a token's per-slot outputs
//! (e.g. a weighted sum) is the caller's job, same as it is in the
//! original — this op only does the routed multiply.

use std::sync::atomic::Ordering;

use crate::ops::matmul::quantized_rhs_size;
use crate::pool::ThreadPool;
use crate::scratch::Cursor;
use crate::tensor::Tensor;

fn row_index(ne1: usize, ne2: usize, i1: usize, i2: usize, i3: usize) -> usize {
    i1 + ne1 * (i2 + ne2 * i3)
}

fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect()
}

struct TileGrid {
    nchunk0: usize,
    nchunk1: usize,
    dr0: usize,
    dr1: usize,
}

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

/// Full indexed matmul entry point. Every one of the `nth` participating
/// workers calls this once with its own `ith`; `scratch` must be at least
/// [`crate::plan::cur_scratch`]'s answer for this node. The caller (the
/// pool's `execute`) barriers every participant once this returns; this
/// function only needs its two internal phase-transition barriers below.
pub fn compute(pool: &ThreadPool, ith: usize, nth: usize, dst: &Tensor, src0: &Tensor, src1: &Tensor, ids: &Tensor, scratch: &mut [u8]) {
    let n_as = src0.ne[2];
    let n_ids = ids.ne[0];
    let b_ids = ids.ne[1];
    let total_slots = n_ids * b_ids;

    let dot_type = src0.elem_type.vec_dot_type();
    let needs_quant = dot_type != src1.elem_type;

    let mut cursor = Cursor::new(scratch);
    let quant_buf = needs_quant.then(|| cursor.take_u8(quantized_rhs_size(dot_type, src1.ne[0], src1.nrows())));
    let counts = cursor.take_i64(n_as);
    let row_mapping = cursor.take_u8(n_as * total_slots * 8);
    let chunk_ctrs = cursor.take_atomic_i32_padded(n_as);

    // --- Phase A: quantize src1 if needed ---
    if let Some(buf) = quant_buf {
        crate::ops::matmul::quantize_rhs(ith, nth, src1, buf);
    }
    pool.barrier().wait();

    // --- Phase B: bucket tokens by selected expert (single-threaded; the
    // scan builds variable-length per-expert lists, which doesn't split
    // across workers as cleanly as the fixed-size tiling phases do) ---
    if ith == 0 {
        for c in counts.iter_mut() {
            *c = 0;
        }
        for token in 0..b_ids {
            let selections = f32_from_bytes(ids.row(token));
            for (slot, &selected) in selections.iter().enumerate() {
                let a = selected.round() as usize;
                assert!(a < n_as, "expert index {a} out of range (n_as={n_as})");
                let dst_row = row_index(n_ids, b_ids, slot, token, 0) as i32;
                let bucket_idx = counts[a] as usize;
                let off = a * total_slots * 8 + bucket_idx * 8;
                row_mapping[off..off + 4].copy_from_slice(&dst_row.to_le_bytes());
                row_mapping[off + 4..off + 8].copy_from_slice(&(token as i32).to_le_bytes());
                counts[a] += 1;
            }
        }
        for ctr in chunk_ctrs.iter() {
            ctr.store(nth as i32, Ordering::Relaxed);
        }
    }
    pool.barrier().wait();

    // --- Phase C: serial outer loop over experts, work-stealing tiles
    // within each one via its own chunk counter ---
    let is_numa = crate::numa::topology().map(|t| t.is_numa()).unwrap_or(false);
    let nr0 = src0.ne[1];

    for a in 0..n_as {
        let count = counts[a] as usize;
        if count == 0 {
            continue;
        }
        let tiles = plan_tiles(nr0, count, nth, is_numa);
        let bucket = &row_mapping[a * total_slots * 8..a * total_slots * 8 + count * 8];

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
            let ir1_end = (ir1_start + tiles.dr1).min(count);

            for ir1 in ir1_start..ir1_end {
                let dst_row = i32::from_le_bytes(bucket[ir1 * 8..ir1 * 8 + 4].try_into().unwrap()) as usize;
                let token = i32::from_le_bytes(bucket[ir1 * 8 + 4..ir1 * 8 + 8].try_into().unwrap()) as usize;
                let src1_row = src1.row(token).to_vec();
                let dst_slice = dst.row_mut(dst_row);
                for ir0 in ir0_start..ir0_end {
                    let src0_row = src0.row(row_index(src0.ne[1], n_as, ir0, a, 0));
                    let v = dot_type.vec_dot(src0.ne[0], src0_row, &src1_row);
                    dst_slice[ir0 * 4..ir0 * 4 + 4].copy_from_slice(&v.to_le_bytes());
                }
            }

            if nth >= tiles.nchunk0 * tiles.nchunk1 {
                break;
            }
            current = chunk_ctrs[a].fetch_add(1, Ordering::Relaxed) + 1;
        }
    }
}
