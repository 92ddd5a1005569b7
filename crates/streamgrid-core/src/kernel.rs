//! Kernel shapes and launch descriptions.
//!
//! The engine supports a closed set of computations selected by
//! [`KernelKind`]. This module validates a request against the shape of the
//! selected kernel, computes launch geometry, and carries the sequential
//! reference implementations every backend is checked against.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::array::{AccessRole, ArrayDescriptor};
use crate::device::BufferHandle;
use crate::error::{ExecutionError, Result};
use crate::params::{CachePreference, ParameterVector};
use crate::partition::Chunk;

/// Largest magnitude a diagonal offset may have (exactly representable in f64).
const MAX_DIA_OFFSET: f64 = 9_007_199_254_740_992.0;

/// Computation selected for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    /// `y[i] = a * x[i] + y[i]`.
    Axpy,
    /// `y += A * x` for a matrix stored by diagonals.
    SparseDiaMatVec,
}

impl KernelKind {
    /// All supported kernels.
    pub fn all() -> &'static [KernelKind] {
        &[KernelKind::Axpy, KernelKind::SparseDiaMatVec]
    }

    /// Stable name used in logs, the CLI and the CUDA module.
    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::Axpy => "axpy",
            KernelKind::SparseDiaMatVec => "dia_matvec",
        }
    }

    /// Block-local staging memory one launch needs, in bytes.
    ///
    /// AXPY stages `x[i]` and `y[i]` per thread.
    pub fn shared_mem_bytes(&self, threads_per_block: u32) -> usize {
        match self {
            KernelKind::Axpy => 2 * threads_per_block as usize * std::mem::size_of::<f64>(),
            KernelKind::SparseDiaMatVec => 0,
        }
    }

    /// Validate arrays and scalars against this kernel's shape for problem size `n`.
    pub fn layout(
        &self,
        arrays: &[ArrayDescriptor<'_>],
        scalars: &[f64],
        n: usize,
    ) -> Result<Vec<ArrayLayout>> {
        match self {
            KernelKind::Axpy => {
                if scalars.len() != 1 {
                    return Err(ExecutionError::ShapeMismatch(format!(
                        "axpy takes 1 scalar (a), got {}",
                        scalars.len()
                    )));
                }
                expect_roles(self, arrays, &[AccessRole::Input, AccessRole::InOut])?;
                expect_len(arrays, 0, "x", n)?;
                expect_len(arrays, 1, "y", n)?;
                Ok(vec![
                    ArrayLayout::chunked(AccessRole::Input, n, 1),
                    ArrayLayout::chunked(AccessRole::InOut, n, 1),
                ])
            }
            KernelKind::SparseDiaMatVec => {
                let offsets = dia_offsets(scalars)?;
                let planes = offsets.len();
                expect_roles(
                    self,
                    arrays,
                    &[AccessRole::Input, AccessRole::Input, AccessRole::InOut],
                )?;
                let values_len = n.checked_mul(planes).ok_or_else(|| {
                    ExecutionError::ShapeMismatch("diagonal storage size overflows".to_string())
                })?;
                expect_len(arrays, 0, "A", values_len)?;
                expect_len(arrays, 1, "x", n)?;
                expect_len(arrays, 2, "y", n)?;
                Ok(vec![
                    ArrayLayout::chunked(AccessRole::Input, values_len, planes),
                    ArrayLayout::broadcast(n),
                    ArrayLayout::chunked(AccessRole::InOut, n, 1),
                ])
            }
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KernelKind {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "axpy" => Ok(KernelKind::Axpy),
            "dia_matvec" | "dia" | "sparse_dia_mat_vec" => Ok(KernelKind::SparseDiaMatVec),
            _ => Err(ExecutionError::InvalidParameter(format!(
                "unknown kernel '{}'. Valid options: axpy, dia_matvec",
                s
            ))),
        }
    }
}

fn expect_roles(
    kind: &KernelKind,
    arrays: &[ArrayDescriptor<'_>],
    roles: &[AccessRole],
) -> Result<()> {
    if arrays.len() != roles.len() {
        return Err(ExecutionError::ShapeMismatch(format!(
            "{} takes {} arrays, got {}",
            kind,
            roles.len(),
            arrays.len()
        )));
    }
    for (i, (array, role)) in arrays.iter().zip(roles).enumerate() {
        if array.role() != *role {
            return Err(ExecutionError::ShapeMismatch(format!(
                "{} array {} must be {}, got {}",
                kind,
                i,
                role,
                array.role()
            )));
        }
    }
    Ok(())
}

fn expect_len(arrays: &[ArrayDescriptor<'_>], index: usize, name: &str, len: usize) -> Result<()> {
    let actual = arrays[index].len();
    if actual != len {
        return Err(ExecutionError::ShapeMismatch(format!(
            "array {} has {} elements, expected {}",
            name, actual, len
        )));
    }
    Ok(())
}

/// Decode diagonal offsets passed as scalar parameters.
pub fn dia_offsets(scalars: &[f64]) -> Result<Vec<i64>> {
    if scalars.is_empty() {
        return Err(ExecutionError::ShapeMismatch(
            "dia_matvec needs at least one diagonal offset".to_string(),
        ));
    }
    scalars
        .iter()
        .map(|&s| {
            if !s.is_finite() || s.fract() != 0.0 || s.abs() > MAX_DIA_OFFSET {
                Err(ExecutionError::ShapeMismatch(format!(
                    "diagonal offset {} is not an integer",
                    s
                )))
            } else {
                Ok(s as i64)
            }
        })
        .collect()
}

/// How an array moves between host and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Copied per chunk. Multi-plane arrays hold `planes` consecutive
    /// planes of `N` elements each and get one copy per plane.
    Chunked {
        /// Number of planes.
        planes: usize,
    },
    /// Copied whole and synchronously before any chunk starts.
    Broadcast,
}

/// Transfer layout of one kernel argument array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout {
    /// Access role.
    pub role: AccessRole,
    /// Total elements on the device.
    pub len: usize,
    /// Transfer mode.
    pub transfer: TransferMode,
}

impl ArrayLayout {
    fn chunked(role: AccessRole, len: usize, planes: usize) -> Self {
        Self {
            role,
            len,
            transfer: TransferMode::Chunked { planes },
        }
    }

    fn broadcast(len: usize) -> Self {
        Self {
            role: AccessRole::Input,
            len,
            transfer: TransferMode::Broadcast,
        }
    }

    /// Whether results are copied back to the host.
    pub fn is_output(&self) -> bool {
        self.role == AccessRole::InOut
    }
}

/// Grid shape of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchGeometry {
    /// Blocks in the grid.
    pub blocks: u32,
    /// Threads per block.
    pub threads_per_block: u32,
}

impl LaunchGeometry {
    /// Geometry for a chunk: `ceil(len / threads_per_block)` blocks, capped
    /// by the parameter vector's block count and the device grid limit.
    ///
    /// When capped, kernels cover the chunk with a grid-stride loop.
    pub fn for_chunk(len: usize, params: &ParameterVector, max_grid_blocks: u32) -> Self {
        let threads = params.threads_per_block();
        let needed = (len as u64).div_ceil(u64::from(threads)).max(1);
        let mut blocks = u32::try_from(needed).unwrap_or(u32::MAX);
        if let Some(cap) = params.block_count() {
            blocks = blocks.min(cap);
        }
        blocks = blocks.min(max_grid_blocks.max(1));
        Self {
            blocks,
            threads_per_block: threads,
        }
    }

    /// Total threads in the grid.
    pub fn total_threads(&self) -> u64 {
        u64::from(self.blocks) * u64::from(self.threads_per_block)
    }
}

/// Device buffers a launch operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArgs {
    /// AXPY operands. `scalars[0]` holds `a`.
    Axpy {
        /// Scalar block.
        scalars: BufferHandle,
        /// Input vector.
        x: BufferHandle,
        /// In/out vector.
        y: BufferHandle,
    },
    /// Diagonal matrix-vector operands. `scalars[k]` holds offset `k`.
    SparseDia {
        /// Scalar block with the diagonal offsets.
        scalars: BufferHandle,
        /// Diagonal values, `num_diagonals` planes of `N`.
        values: BufferHandle,
        /// Broadcast input vector.
        x: BufferHandle,
        /// In/out vector.
        y: BufferHandle,
        /// Number of diagonals.
        num_diagonals: u32,
    },
}

impl KernelArgs {
    /// Kernel these arguments belong to.
    pub fn kind(&self) -> KernelKind {
        match self {
            KernelArgs::Axpy { .. } => KernelKind::Axpy,
            KernelArgs::SparseDia { .. } => KernelKind::SparseDiaMatVec,
        }
    }
}

/// Everything a backend needs to run one launch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelLaunch {
    /// Grid shape.
    pub geometry: LaunchGeometry,
    /// Block-local staging memory in bytes.
    pub shared_mem_bytes: usize,
    /// Cache split requested for the launch.
    pub cache_preference: CachePreference,
    /// Inner-loop unroll factor.
    pub unroll_factor: u32,
    /// Rows/elements this launch may touch.
    pub chunk: Chunk,
    /// Problem size `N`.
    pub problem_size: usize,
    /// Buffers.
    pub args: KernelArgs,
}

impl KernelLaunch {
    /// Kernel being launched.
    pub fn kind(&self) -> KernelKind {
        self.args.kind()
    }
}

/// Accumulate one row of a diagonal-format product.
///
/// Diagonals are visited in index order, `unroll` per control step, so the
/// result is bit-identical for every unroll factor. `value(k)` yields the
/// row's entry on diagonal `k`.
pub fn dia_row(
    row: usize,
    offsets: &[i64],
    unroll: usize,
    x: &[f64],
    value: impl Fn(usize) -> f64,
) -> f64 {
    let n = x.len() as i64;
    let step = unroll.max(1);
    let mut acc = 0.0;
    let mut k = 0;
    while k < offsets.len() {
        let group_end = (k + step).min(offsets.len());
        for (j, offset) in offsets.iter().enumerate().take(group_end).skip(k) {
            let col = row as i64 + offset;
            if col >= 0 && col < n {
                acc += value(j) * x[col as usize];
            }
        }
        k = group_end;
    }
    acc
}

/// Sequential reference implementations.
pub mod reference {
    /// `y[i] = a * x[i] + y[i]`.
    pub fn axpy(a: f64, x: &[f64], y: &mut [f64]) {
        for (yi, xi) in y.iter_mut().zip(x) {
            *yi = a * *xi + *yi;
        }
    }

    /// `y += A * x` with `A` stored as `values[row + k * n]` for diagonal `k`.
    pub fn dia_matvec(values: &[f64], offsets: &[i64], x: &[f64], y: &mut [f64]) {
        let n = y.len();
        for i in 0..n {
            for (k, offset) in offsets.iter().enumerate() {
                let col = i as i64 + offset;
                if col >= 0 && (col as usize) < n {
                    y[i] += values[i + k * n] * x[col as usize];
                }
            }
        }
    }

    /// Expand diagonal storage into a dense row-major `n x n` matrix.
    pub fn dia_to_dense(values: &[f64], offsets: &[i64], n: usize) -> Vec<f64> {
        let mut dense = vec![0.0; n * n];
        for (k, offset) in offsets.iter().enumerate() {
            for row in 0..n {
                let col = row as i64 + offset;
                if col >= 0 && (col as usize) < n {
                    dense[row * n + col as usize] += values[row + k * n];
                }
            }
        }
        dense
    }

    /// `y += M * x` for a dense row-major matrix.
    pub fn dense_matvec(dense: &[f64], x: &[f64], y: &mut [f64]) {
        let n = x.len();
        for (row, yi) in y.iter_mut().enumerate() {
            let sum: f64 = dense[row * n..(row + 1) * n]
                .iter()
                .zip(x)
                .map(|(m, xv)| m * xv)
                .sum();
            *yi += sum;
        }
    }

    /// Five-point stencil offsets `{-m*dof, -dof, 0, dof, m*dof}` of a 2-D grid.
    pub fn stencil_offsets(m: usize, dof: usize) -> Vec<i64> {
        let m = m as i64;
        let dof = dof as i64;
        vec![-m * dof, -dof, 0, dof, m * dof]
    }
}

#[cfg(test)]
mod tests {
    use super::reference;
    use super::*;

    #[test]
    fn test_axpy_layout() {
        let x = vec![1.0; 4];
        let mut y = vec![0.0; 4];
        let arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        let layout = KernelKind::Axpy.layout(&arrays, &[2.0], 4).unwrap();
        assert_eq!(layout.len(), 2);
        assert!(layout[1].is_output());
        assert_eq!(layout[0].transfer, TransferMode::Chunked { planes: 1 });
    }

    #[test]
    fn test_axpy_shape_errors() {
        let x = vec![1.0; 4];
        let mut y = vec![0.0; 3];
        let arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        assert!(matches!(
            KernelKind::Axpy.layout(&arrays, &[2.0], 4),
            Err(ExecutionError::ShapeMismatch(_))
        ));
        assert!(KernelKind::Axpy.layout(&arrays, &[], 3).is_err());

        let a = vec![1.0; 4];
        let b = vec![1.0; 4];
        let wrong_roles = [ArrayDescriptor::input(&a), ArrayDescriptor::input(&b)];
        let err = KernelKind::Axpy.layout(&wrong_roles, &[1.0], 4).unwrap_err();
        assert!(err.to_string().contains("in/out"));
    }

    #[test]
    fn test_dia_layout() {
        let values = vec![1.0; 15];
        let x = vec![1.0; 5];
        let mut y = vec![0.0; 5];
        let arrays = [
            ArrayDescriptor::input(&values),
            ArrayDescriptor::input(&x),
            ArrayDescriptor::in_out(&mut y),
        ];
        let layout = KernelKind::SparseDiaMatVec
            .layout(&arrays, &[-1.0, 0.0, 1.0], 5)
            .unwrap();
        assert_eq!(layout[0].transfer, TransferMode::Chunked { planes: 3 });
        assert_eq!(layout[0].len, 15);
        assert_eq!(layout[1].transfer, TransferMode::Broadcast);
    }

    #[test]
    fn test_dia_offsets_must_be_integral() {
        assert_eq!(dia_offsets(&[-32.0, 0.0, 1.0]).unwrap(), vec![-32, 0, 1]);
        assert!(dia_offsets(&[0.5]).is_err());
        assert!(dia_offsets(&[f64::NAN]).is_err());
        assert!(dia_offsets(&[]).is_err());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("AXPY".parse::<KernelKind>().unwrap(), KernelKind::Axpy);
        assert_eq!(
            "dia-matvec".parse::<KernelKind>().unwrap(),
            KernelKind::SparseDiaMatVec
        );
        assert!("gemm".parse::<KernelKind>().is_err());
    }

    #[test]
    fn test_launch_geometry() {
        let params = ParameterVector::new(32, 4).unwrap();
        assert_eq!(LaunchGeometry::for_chunk(100, &params, 65_535).blocks, 4);
        assert_eq!(LaunchGeometry::for_chunk(96, &params, 65_535).blocks, 3);
        assert_eq!(LaunchGeometry::for_chunk(1, &params, 65_535).blocks, 1);
        assert_eq!(LaunchGeometry::for_chunk(1_000_000, &params, 1024).blocks, 1024);

        let capped = ParameterVector::builder()
            .threads_per_block(32)
            .block_count(2)
            .build()
            .unwrap();
        let geometry = LaunchGeometry::for_chunk(100, &capped, 65_535);
        assert_eq!(geometry.blocks, 2);
        assert_eq!(geometry.total_threads(), 64);
    }

    #[test]
    fn test_shared_mem() {
        assert_eq!(KernelKind::Axpy.shared_mem_bytes(16), 256);
        assert_eq!(KernelKind::SparseDiaMatVec.shared_mem_bytes(256), 0);
    }

    #[test]
    fn test_dia_row_unroll_invariant() {
        let n = 6;
        let offsets = reference::stencil_offsets(2, 1);
        let values: Vec<f64> = (0..n * offsets.len()).map(|i| 0.1 * i as f64 + 0.3).collect();
        let x: Vec<f64> = (0..n).map(|i| 1.0 / (i as f64 + 1.0)).collect();

        for row in 0..n {
            let base = dia_row(row, &offsets, 1, &x, |k| values[row + k * n]);
            for unroll in 2..=6 {
                let unrolled = dia_row(row, &offsets, unroll, &x, |k| values[row + k * n]);
                assert_eq!(base.to_bits(), unrolled.to_bits());
            }
        }
    }

    #[test]
    fn test_reference_dia_matches_dense() {
        let n = 9;
        let offsets = reference::stencil_offsets(3, 1);
        let values: Vec<f64> = (0..n * offsets.len()).map(|i| (i % 7) as f64 - 3.0).collect();
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.5).collect();

        let mut y_dia = vec![1.0; n];
        reference::dia_matvec(&values, &offsets, &x, &mut y_dia);

        let dense = reference::dia_to_dense(&values, &offsets, n);
        let mut y_dense = vec![1.0; n];
        reference::dense_matvec(&dense, &x, &mut y_dense);

        for (a, b) in y_dia.iter().zip(&y_dense) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reference_axpy() {
        let x = vec![1.0, 2.0, 3.0];
        let mut y = vec![1.0, 1.0, 1.0];
        reference::axpy(2.0, &x, &mut y);
        assert_eq!(y, vec![3.0, 5.0, 7.0]);
    }
}
