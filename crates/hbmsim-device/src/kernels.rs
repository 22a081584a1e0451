//! Reference kernels backing the simulated primitives.
//!
//! Kernels see plain [`Matrix`] values and know nothing about handles or
//! tiers; results come back HBM-tagged and the simulator re-tags them.

use hbmsim_core::{Matrix, Result, SimError};

use crate::op::Axis;

/// f32 matmul: C[M,N] = A[M,K] @ B[K,N]
pub fn matmul_f32(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = acc;
        }
    }
}

/// `a @ b`. Fails when `a.cols != b.rows`.
pub fn matmul(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.cols() != b.rows() {
        return Err(SimError::shape_mismatch("matmul", a.shape(), b.shape()));
    }
    let (m, k) = a.shape();
    let n = b.cols();
    let mut c = vec![0.0f32; m * n];
    matmul_f32(a.as_slice(), b.as_slice(), &mut c, m, n, k);
    Ok(Matrix::from_f32(&c, m, n))
}

pub fn transpose(src: &Matrix) -> Matrix {
    let (rows, cols) = src.shape();
    let data = src.as_slice();
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    Matrix::from_f32(&out, cols, rows)
}

/// Join `a` and `b` along `axis`; the other dimension must agree.
pub fn concat(a: &Matrix, b: &Matrix, axis: Axis) -> Result<Matrix> {
    match axis {
        Axis::Rows => {
            if a.cols() != b.cols() {
                return Err(SimError::shape_mismatch("concat", a.shape(), b.shape()));
            }
            let mut data = Vec::with_capacity(a.numel() + b.numel());
            data.extend_from_slice(a.as_slice());
            data.extend_from_slice(b.as_slice());
            Ok(Matrix::from_f32(&data, a.rows() + b.rows(), a.cols()))
        }
        Axis::Cols => {
            if a.rows() != b.rows() {
                return Err(SimError::shape_mismatch("concat", a.shape(), b.shape()));
            }
            let cols = a.cols() + b.cols();
            let mut data = Vec::with_capacity(a.rows() * cols);
            for r in 0..a.rows() {
                data.extend_from_slice(a.row(r)?);
                data.extend_from_slice(b.row(r)?);
            }
            Ok(Matrix::from_f32(&data, a.rows(), cols))
        }
    }
}

/// Row `index` of `src` as a 1xcols matrix.
pub fn get_row(src: &Matrix, index: usize) -> Result<Matrix> {
    let row = src.row(index)?;
    Ok(Matrix::from_f32(row, 1, src.cols()))
}

/// Elementwise `e^x`.
pub fn exp(src: &Matrix) -> Matrix {
    let data: Vec<f32> = src.as_slice().iter().map(|v| v.exp()).collect();
    Matrix::from_f32(&data, src.rows(), src.cols())
}

/// Sum of every element, as a 1x1 matrix.
pub fn sum(src: &Matrix) -> Matrix {
    let total: f32 = src.as_slice().iter().sum();
    Matrix::from_f32(&[total], 1, 1)
}

/// `num / den`, where `den` is 1x1 (broadcast) or the same shape as `num`.
pub fn div(num: &Matrix, den: &Matrix) -> Result<Matrix> {
    let data: Vec<f32> = if den.shape() == (1, 1) {
        let d = den.as_slice()[0];
        num.as_slice().iter().map(|v| v / d).collect()
    } else if den.shape() == num.shape() {
        num.as_slice()
            .iter()
            .zip(den.as_slice())
            .map(|(n, d)| n / d)
            .collect()
    } else {
        return Err(SimError::shape_mismatch("div", num.shape(), den.shape()));
    };
    Ok(Matrix::from_f32(&data, num.rows(), num.cols()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbmsim_core::ErrorKind;

    fn m(rows: &[&[f32]]) -> Matrix {
        Matrix::from_rows(&rows.iter().map(|r| r.to_vec()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_matmul() {
        let a = m(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let b = m(&[&[5.0, 6.0], &[7.0, 8.0]]);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.as_slice(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_mismatch() {
        let a = Matrix::zeros(1, 3);
        let b = Matrix::zeros(2, 4);
        assert_eq!(matmul(&a, &b).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_transpose() {
        let a = m(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
        let t = transpose(&a);
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(transpose(&t), a);
    }

    #[test]
    fn test_concat_rows() {
        let a = m(&[&[1.0, 2.0]]);
        let b = m(&[&[3.0, 4.0]]);
        let c = concat(&a, &b, Axis::Rows).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_concat_cols() {
        let a = m(&[&[1.0], &[2.0]]);
        let b = m(&[&[3.0], &[4.0]]);
        let c = concat(&a, &b, Axis::Cols).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.as_slice(), &[1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_concat_mismatch() {
        let a = Matrix::zeros(2, 1);
        let b = Matrix::zeros(3, 1);
        assert_eq!(concat(&a, &b, Axis::Cols).unwrap_err().kind(), ErrorKind::ShapeMismatch);
        assert!(concat(&a, &b, Axis::Rows).is_ok());
    }

    #[test]
    fn test_get_row() {
        let a = m(&[&[1.0, 2.0], &[3.0, 4.0]]);
        assert_eq!(get_row(&a, 1).unwrap().as_slice(), &[3.0, 4.0]);
        assert_eq!(get_row(&a, 2).unwrap_err().kind(), ErrorKind::IndexOutOfRange);
    }

    #[test]
    fn test_exp_sum_div_is_softmax() {
        let scores = m(&[&[0.0, 1.0]]);
        let e = exp(&scores);
        let s = sum(&e);
        assert_eq!(s.shape(), (1, 1));
        let p = div(&e, &s).unwrap();
        let p = p.as_slice();
        assert!((p[0] - 0.268_941_4).abs() < 1e-6);
        assert!((p[1] - 0.731_058_6).abs() < 1e-6);
        assert!((p[0] + p[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_div_shapes() {
        let a = m(&[&[2.0, 4.0]]);
        let same = m(&[&[2.0, 2.0]]);
        assert_eq!(div(&a, &same).unwrap().as_slice(), &[1.0, 2.0]);
        let bad = Matrix::zeros(1, 3);
        assert_eq!(div(&a, &bad).unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }
}
