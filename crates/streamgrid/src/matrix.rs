//! Diagonal-format sparse matrices.

use streamgrid_core::error::{ExecutionError, Result};
use streamgrid_core::kernel::reference;

/// An `n x n` matrix stored by diagonals.
///
/// Diagonal `k` has column offset `offsets[k]`; the entry in row `r` on that
/// diagonal is `values[k * n + r]`. Slots whose column falls outside the
/// matrix are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct DiaMatrix {
    n: usize,
    offsets: Vec<i64>,
    values: Vec<f64>,
}

impl DiaMatrix {
    /// Build from explicit storage.
    pub fn new(n: usize, offsets: Vec<i64>, values: Vec<f64>) -> Result<Self> {
        let expected = n.checked_mul(offsets.len()).ok_or_else(|| {
            ExecutionError::ShapeMismatch("diagonal storage size overflows".to_string())
        })?;
        if values.len() != expected {
            return Err(ExecutionError::ShapeMismatch(format!(
                "{} diagonals of order {} need {} values, got {}",
                offsets.len(),
                n,
                expected,
                values.len()
            )));
        }
        Ok(Self { n, offsets, values })
    }

    /// Build by evaluating `f(row, diagonal)` for every slot.
    pub fn from_fn(n: usize, offsets: Vec<i64>, f: impl Fn(usize, usize) -> f64) -> Self {
        let values = (0..offsets.len())
            .flat_map(|k| (0..n).map(move |row| (row, k)))
            .map(|(row, k)| f(row, k))
            .collect();
        Self { n, offsets, values }
    }

    /// Five-point Laplacian on an `m x m` grid with `dof` unknowns per point.
    ///
    /// The centre diagonal holds 4, the neighbours -1.
    pub fn laplacian_2d(m: usize, dof: usize) -> Self {
        let offsets = reference::stencil_offsets(m, dof);
        Self::from_fn(m * m * dof, offsets, |_, k| if k == 2 { 4.0 } else { -1.0 })
    }

    /// Matrix order.
    pub fn order(&self) -> usize {
        self.n
    }

    /// Diagonal offsets.
    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }

    /// Number of stored diagonals.
    pub fn num_diagonals(&self) -> usize {
        self.offsets.len()
    }

    /// Diagonal-major value storage.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Offsets encoded as kernel scalar parameters.
    pub fn offset_scalars(&self) -> Vec<f64> {
        self.offsets.iter().map(|&o| o as f64).collect()
    }

    /// Dense row-major copy.
    pub fn to_dense(&self) -> Vec<f64> {
        reference::dia_to_dense(&self.values, &self.offsets, self.n)
    }

    /// Sequential `y += A * x`.
    pub fn matvec_reference(&self, x: &[f64], y: &mut [f64]) {
        reference::dia_matvec(&self.values, &self.offsets, x, y);
    }
}
