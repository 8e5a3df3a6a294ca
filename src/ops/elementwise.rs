//! Reference leaf kernels: unary, binary, reduction, softmax.
//!
//! These exist to give the executor and planner real operators to drive
//! end to end (§1 keeps competitive kernel arithmetic out of scope — the
//! point here is the thread-participation contract of §4.2, not the math).
//! Unary ops are single-threaded per the planner table; binary and softmax
//! split rows round-robin by `ith`, the same row assignment the matmul
//! engine's Phase A quantization loop uses.

use crate::tensor::Tensor;

/// Rows `ith` owns out of `total_rows`, round-robin by thread.
pub fn rows_for(ith: usize, nth: usize, total_rows: usize) -> impl Iterator<Item = usize> {
    (ith..total_rows).step_by(nth)
}

/// Unary and reduction kernels below are single-threaded per the planner
/// table (`plan::n_tasks`) — the executor only ever calls them with
/// `ith == 0` (anyone else's `ith` is `>= n_tasks` for this node and is
/// filtered out by the dispatcher before the kernel runs, per the §4.2
/// contract). They don't re-check `ith` themselves.
pub fn neg(dst: &Tensor, src0: &Tensor) {
    for row in 0..src0.nrows() {
        let a = bytes_as_f32(src0.row(row));
        let out: Vec<u8> = a.iter().flat_map(|v| (-v).to_le_bytes()).collect();
        dst.row_mut(row).copy_from_slice(&out);
    }
}

pub fn relu(dst: &Tensor, src0: &Tensor) {
    for row in 0..src0.nrows() {
        let a = bytes_as_f32(src0.row(row));
        let out: Vec<u8> = a.iter().flat_map(|v| v.max(0.0).to_le_bytes()).collect();
        dst.row_mut(row).copy_from_slice(&out);
    }
}

pub fn silu(ith: usize, nth: usize, dst: &Tensor, src0: &Tensor) {
    for row in rows_for(ith, nth, src0.nrows()) {
        let a = bytes_as_f32(src0.row(row));
        let out: Vec<u8> = a.iter().flat_map(|v| (v / (1.0 + (-v).exp())).to_le_bytes()).collect();
        dst.row_mut(row).copy_from_slice(&out);
    }
}

pub fn gelu(ith: usize, nth: usize, dst: &Tensor, src0: &Tensor) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    for row in rows_for(ith, nth, src0.nrows()) {
        let a = bytes_as_f32(src0.row(row));
        let out: Vec<u8> = a
            .iter()
            .flat_map(|v| {
                let inner = SQRT_2_OVER_PI * (v + 0.044715 * v.powi(3));
                (0.5 * v * (1.0 + inner.tanh())).to_le_bytes()
            })
            .collect();
        dst.row_mut(row).copy_from_slice(&out);
    }
}

pub fn add(ith: usize, nth: usize, dst: &Tensor, src0: &Tensor, src1: &Tensor) {
    for row in rows_for(ith, nth, src0.nrows()) {
        let a = bytes_as_f32(src0.row(row));
        let b = bytes_as_f32(src1.row(row % src1.nrows()));
        let out: Vec<u8> = a.iter().zip(b).flat_map(|(x, y)| (x + y).to_le_bytes()).collect();
        dst.row_mut(row).copy_from_slice(&out);
    }
}

pub fn mul(ith: usize, nth: usize, dst: &Tensor, src0: &Tensor, src1: &Tensor) {
    for row in rows_for(ith, nth, src0.nrows()) {
        let a = bytes_as_f32(src0.row(row));
        let b = bytes_as_f32(src1.row(row % src1.nrows()));
        let out: Vec<u8> = a.iter().zip(b).flat_map(|(x, y)| (x * y).to_le_bytes()).collect();
        dst.row_mut(row).copy_from_slice(&out);
    }
}

pub fn sum(dst: &Tensor, src0: &Tensor) {
    let total: f32 = src0.as_f32_slice().iter().sum();
    dst.byte_range_mut(0, 4).copy_from_slice(&total.to_le_bytes());
}

pub fn mean(dst: &Tensor, src0: &Tensor) {
    let values = src0.as_f32_slice();
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    dst.byte_range_mut(0, 4).copy_from_slice(&mean.to_le_bytes());
}

pub fn softmax(ith: usize, nth: usize, dst: &Tensor, src0: &Tensor) {
    for row in rows_for(ith, nth, src0.nrows()) {
        let a = bytes_as_f32(src0.row(row));
        let max = a.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = a.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        let out: Vec<u8> = exps.iter().flat_map(|v| (v / sum).to_le_bytes()).collect();
        dst.row_mut(row).copy_from_slice(&out);
    }
}

fn bytes_as_f32(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use crate::types::ElemType;

    #[test]
    fn add_splits_rows_round_robin_across_threads() {
        let src0 = Tensor::from_bytes(
            ElemType::F32,
            [2, 4, 1, 1],
            vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0].iter().flat_map(|v| v.to_le_bytes()).collect(),
        );
        let src1 = Tensor::from_bytes(ElemType::F32, [2, 1, 1, 1], vec![10.0f32, 20.0].iter().flat_map(|v| v.to_le_bytes()).collect());
        let dst = Tensor::leaf(ElemType::F32, [2, 4, 1, 1]);
        add(0, 2, &dst, &src0, &src1);
        add(1, 2, &dst, &src0, &src1);
        assert_eq!(dst.as_f32_slice(), &[11.0, 22.0, 13.0, 24.0, 15.0, 26.0, 17.0, 28.0]);
    }

    #[test]
    fn sum_reduces_to_a_single_scalar() {
        let src0 = Tensor::from_bytes(ElemType::F32, [3, 1, 1, 1], vec![1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect());
        let dst = Tensor::leaf(ElemType::F32, [1, 1, 1, 1]);
        sum(&dst, &src0);
        assert_eq!(dst.as_f32_slice(), &[6.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let src0 = Tensor::from_bytes(ElemType::F32, [3, 2, 1, 1], vec![1.0f32, 2.0, 3.0, 0.0, 0.0, 0.0].iter().flat_map(|v| v.to_le_bytes()).collect());
        let dst = Tensor::leaf(ElemType::F32, [3, 2, 1, 1]);
        softmax(0, 1, &dst, &src0);
        let out = dst.as_f32_slice();
        assert!((out[0..3].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((out[3..6].iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
