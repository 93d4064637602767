//! Jacobian determinant maps of warp fields.

use ndarray::Array3;

use super::grid::ReferenceGrid;
use crate::error::{CorrectionError, Result};

/// Per-voxel local volume-scaling factor of a warp, on the warp's grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Jacobian {
    grid: ReferenceGrid,
    values: Array3<f32>,
}

impl Jacobian {
    pub fn new(grid: ReferenceGrid, values: Array3<f32>) -> Result<Self> {
        let (nx, ny, nz) = values.dim();
        if [nx, ny, nz] != grid.shape() {
            return Err(CorrectionError::IncompatibleGrid {
                what: "jacobian",
                expected: grid.shape(),
                found: [nx, ny, nz],
            });
        }
        Ok(Self { grid, values })
    }

    pub(crate) fn from_parts(grid: ReferenceGrid, values: Array3<f32>) -> Self {
        Self { grid, values }
    }

    pub fn grid(&self) -> &ReferenceGrid {
        &self.grid
    }

    pub fn values(&self) -> &Array3<f32> {
        &self.values
    }

    pub fn mean(&self) -> f64 {
        self.values.iter().map(|&v| v as f64).sum::<f64>() / self.values.len().max(1) as f64
    }

    pub fn min_max(&self) -> (f32, f32) {
        self.values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }
}
