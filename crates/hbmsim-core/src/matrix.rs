use std::fmt;

use crate::error::SimError;
use crate::residency::Residency;
use crate::Result;

/// Size of one element in bytes. Every matrix holds `f32`.
pub const ELEM_BYTES: usize = std::mem::size_of::<f32>();

/// A dense row-major 2-D `f32` buffer tagged with the tier it lives in.
///
/// A matrix fresh out of the allocator is 0x0 ("unassigned"); the first
/// operation that writes it fixes its shape. The residency tag is only ever
/// changed by the allocator's move path, never by arithmetic.
///
/// # Examples
///
/// ```
/// use hbmsim_core::{Matrix, Residency};
///
/// let m = Matrix::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
/// assert_eq!(m.shape(), (2, 3));
/// assert_eq!(m.residency(), Residency::Hbm);
/// assert_eq!(m.row(1).unwrap(), &[4.0, 5.0, 6.0]);
/// ```
#[derive(Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
    residency: Residency,
}

impl Matrix {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// An unassigned 0x0 matrix in HBM.
    pub fn empty() -> Self {
        Self {
            rows: 0,
            cols: 0,
            data: Vec::new(),
            residency: Residency::Hbm,
        }
    }

    /// A zero-filled matrix in HBM.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
            residency: Residency::Hbm,
        }
    }

    /// Build a matrix from row-major data.
    ///
    /// # Panics
    /// Panics if `data.len() != rows * cols`.
    pub fn from_f32(data: &[f32], rows: usize, cols: usize) -> Self {
        assert_eq!(
            rows * cols,
            data.len(),
            "Shape {}x{} requires {} elements, got {}",
            rows,
            cols,
            rows * cols,
            data.len()
        );
        Self {
            rows,
            cols,
            data: data.to_vec(),
            residency: Residency::Hbm,
        }
    }

    /// Build a matrix from a list of equally long rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(SimError::shape_mismatch("from_rows", (1, cols), (1, row.len())));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
            residency: Residency::Hbm,
        })
    }

    /// Same values, placed in `residency`.
    pub fn with_residency(mut self, residency: Residency) -> Self {
        self.residency = residency;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Bytes this matrix occupies in its tier.
    pub fn nbytes(&self) -> usize {
        self.data.len() * ELEM_BYTES
    }

    /// Whether no operation has written this matrix yet.
    pub fn is_unassigned(&self) -> bool {
        self.rows == 0 && self.cols == 0
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Row `index` as a slice.
    pub fn row(&self, index: usize) -> Result<&[f32]> {
        if index >= self.rows {
            return Err(SimError::IndexOutOfRange {
                index,
                len: self.rows,
            });
        }
        Ok(&self.data[index * self.cols..(index + 1) * self.cols])
    }

    /// Element at `(r, c)`, if in bounds.
    pub fn get(&self, r: usize, c: usize) -> Option<f32> {
        if r < self.rows && c < self.cols {
            Some(self.data[r * self.cols + c])
        } else {
            None
        }
    }

    /// Copy out as a list of rows.
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.data.chunks(self.cols).map(<[f32]>::to_vec).collect()
    }

    pub(crate) fn set_residency(&mut self, residency: Residency) {
        self.residency = residency;
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix({}x{}, {}) [", self.rows, self.cols, self.residency)?;
        for (i, row) in self.to_rows().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{row:?}")?;
        }
        write!(f, "]")
    }
}
