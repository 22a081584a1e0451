//! Direct (non-streaming) attention used to score the device path.
//!
//! Attention(Q, K, V) = softmax(Q @ K^T) @ V
//!
//! There is no `1/sqrt(d)` scaling and no max subtraction inside the
//! softmax, so results match the device path bit for bit in the common
//! case. Large scores can overflow `exp`; that precision limit is shared
//! with the streaming driver.

use hbmsim_core::{Matrix, Result};
use hbmsim_device::kernels;
use hbmsim_device::Axis;

/// Row-wise softmax: each row is `exp(x) / sum(exp(x))`.
pub fn softmax_rows(scores: &Matrix) -> Result<Matrix> {
    let mut out: Option<Matrix> = None;
    for r in 0..scores.rows() {
        let e = kernels::exp(&kernels::get_row(scores, r)?);
        let p = kernels::div(&e, &kernels::sum(&e))?;
        out = Some(match out {
            None => p,
            Some(prev) => kernels::concat(&prev, &p, Axis::Rows)?,
        });
    }
    Ok(out.unwrap_or_else(|| Matrix::zeros(0, scores.cols())))
}

/// Vertically stack `parts`.
pub fn stack_rows(parts: &[Matrix]) -> Result<Matrix> {
    let mut iter = parts.iter();
    let Some(first) = iter.next() else {
        return Ok(Matrix::empty());
    };
    iter.try_fold(first.clone(), |acc, m| kernels::concat(&acc, m, Axis::Rows))
}

/// Attention output for `query` ([rows, d]) over `keys` ([n, d]) and `values` ([n, d_v]).
///
/// # Returns
/// * `output` - [rows, d_v]
pub fn attention(query: &Matrix, keys: &Matrix, values: &Matrix) -> Result<Matrix> {
    let scores = kernels::matmul(query, &kernels::transpose(keys))?;
    let probs = softmax_rows(&scores)?;
    kernels::matmul(&probs, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbmsim_core::ErrorKind;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
        }
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let s = Matrix::from_f32(&[0.0, 1.0, 2.0, -1.0, 0.5, 3.0], 2, 3);
        let p = softmax_rows(&s).unwrap();
        assert_eq!(p.shape(), (2, 3));
        for r in 0..2 {
            let total: f32 = p.row(r).unwrap().iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_single_key_returns_value() {
        let q = Matrix::from_f32(&[1.0, 0.0], 1, 2);
        let k = Matrix::from_f32(&[1.0, 0.0], 1, 2);
        let v = Matrix::from_f32(&[1.0, 0.0], 1, 2);
        let out = attention(&q, &k, &v).unwrap();
        assert_close(out.as_slice(), &[1.0, 0.0], 1e-6);
    }

    #[test]
    fn test_two_keys() {
        let q = Matrix::from_f32(&[0.0, 1.0], 1, 2);
        let k = stack_rows(&[
            Matrix::from_f32(&[1.0, 0.0], 1, 2),
            Matrix::from_f32(&[0.0, 1.0], 1, 2),
        ])
        .unwrap();
        let out = attention(&q, &k, &k).unwrap();
        assert_close(out.as_slice(), &[0.268_941_4, 0.731_058_6], 1e-6);
    }

    #[test]
    fn test_dim_mismatch() {
        let q = Matrix::zeros(1, 3);
        let k = Matrix::zeros(2, 2);
        let v = Matrix::zeros(2, 2);
        assert_eq!(attention(&q, &k, &v).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_stack_rows_empty() {
        assert!(stack_rows(&[]).unwrap().is_unassigned());
    }
}
