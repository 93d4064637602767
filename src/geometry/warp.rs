//! Dense nonlinear warp fields.
//!
//! A [`WarpField`] stores, for every voxel of its grid, a relative world-space
//! displacement. The field is a pull-back: a point `x` in the field's target
//! space maps to `x + d(x)` in the source space. Displacements between voxel
//! centres are trilinearly interpolated and held constant beyond the grid.

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, Array4, ArrayView3, Axis, Zip};

use super::grid::ReferenceGrid;
use super::jacobian::Jacobian;
use crate::error::{CorrectionError, Result};
use crate::interpolator::Interpolator;

#[derive(Debug, Clone, PartialEq)]
pub struct WarpField {
    grid: ReferenceGrid,
    /// Shape `(nx, ny, nz, 3)`, world units.
    displacement: Array4<f32>,
}

impl WarpField {
    pub fn new(grid: ReferenceGrid, displacement: Array4<f32>) -> Result<Self> {
        if grid.is_empty() {
            return Err(CorrectionError::EmptyReferenceGrid);
        }
        let [nx, ny, nz] = grid.shape();
        let dim = displacement.dim();
        if (dim.0, dim.1, dim.2) != (nx, ny, nz) || dim.3 != 3 {
            return Err(CorrectionError::IncompatibleGrid {
                what: "warp displacement",
                expected: grid.shape(),
                found: [dim.0, dim.1, dim.2],
            });
        }
        Ok(Self { grid, displacement })
    }

    pub fn zeros(grid: ReferenceGrid) -> Self {
        let [nx, ny, nz] = grid.shape();
        Self {
            displacement: Array4::zeros((nx, ny, nz, 3)),
            grid,
        }
    }

    /// Build a field by evaluating `f` at the world position of every voxel.
    pub fn from_fn<F>(grid: ReferenceGrid, f: F) -> Self
    where
        F: Fn(Vector3<f64>) -> Vector3<f64> + Sync,
    {
        let [nx, ny, nz] = grid.shape();
        let mut displacement = Array4::zeros((nx, ny, nz, 3));
        Zip::indexed(displacement.lanes_mut(Axis(3))).par_for_each(|(i, j, k), mut lane| {
            let world = grid.voxel_to_world(&Vector3::new(i as f64, j as f64, k as f64));
            let d = f(world);
            lane[0] = d.x as f32;
            lane[1] = d.y as f32;
            lane[2] = d.z as f32;
        });
        Self { grid, displacement }
    }

    pub fn grid(&self) -> &ReferenceGrid {
        &self.grid
    }

    pub fn displacement(&self) -> &Array4<f32> {
        &self.displacement
    }

    pub fn component(&self, axis: usize) -> ArrayView3<'_, f32> {
        self.displacement.index_axis(Axis(3), axis)
    }

    pub fn displacement_at_voxel(&self, i: usize, j: usize, k: usize) -> Vector3<f64> {
        Vector3::new(
            self.displacement[[i, j, k, 0]] as f64,
            self.displacement[[i, j, k, 1]] as f64,
            self.displacement[[i, j, k, 2]] as f64,
        )
    }

    /// Interpolated displacement at an arbitrary world position.
    pub fn displacement_at(&self, world: &Vector3<f64>) -> Vector3<f64> {
        let v = self.grid.world_to_voxel(world);
        let pos = [v.x, v.y, v.z];
        Vector3::new(
            Interpolator::trilinear(&self.component(0), pos) as f64,
            Interpolator::trilinear(&self.component(1), pos) as f64,
            Interpolator::trilinear(&self.component(2), pos) as f64,
        )
    }

    /// Map a target-space world point to its source-space position.
    pub fn pull_back(&self, world: &Vector3<f64>) -> Vector3<f64> {
        world + self.displacement_at(world)
    }

    /// Local volume scaling of the mapping `x -> x + d(x)`: the determinant of
    /// its world-space gradient, using central differences inside the grid
    /// and one-sided differences on its faces.
    pub fn jacobian(&self) -> Jacobian {
        let [nx, ny, nz] = self.grid.shape();
        // d(voxel)/d(world); identity fallback never triggers for a valid grid
        let to_voxel = self
            .grid
            .linear()
            .try_inverse()
            .unwrap_or_else(Matrix3::identity);
        let components = [self.component(0), self.component(1), self.component(2)];

        let mut values = Array3::<f32>::zeros((nx, ny, nz));
        Zip::indexed(&mut values).par_for_each(|(i, j, k), value| {
            let idx = [i, j, k];
            let dims = [nx, ny, nz];
            // gradient[(component, voxel axis)]
            let mut gradient = Matrix3::<f64>::zeros();
            for axis in 0..3 {
                let (lo, hi) = neighbours(idx[axis], dims[axis]);
                if lo == hi {
                    continue;
                }
                let span = (hi - lo) as f64;
                let mut lo_idx = idx;
                let mut hi_idx = idx;
                lo_idx[axis] = lo;
                hi_idx[axis] = hi;
                for (c, field) in components.iter().enumerate() {
                    let delta = field[hi_idx] as f64 - field[lo_idx] as f64;
                    gradient[(c, axis)] = delta / span;
                }
            }
            let world_gradient = gradient * to_voxel;
            *value = (Matrix3::identity() + world_gradient).determinant() as f32;
        });

        Jacobian::from_parts(self.grid.clone(), values)
    }
}

/// Neighbour indices for a finite difference along an axis of length `n`.
fn neighbours(i: usize, n: usize) -> (usize, usize) {
    if n < 2 {
        (i, i)
    } else if i == 0 {
        (0, 1)
    } else if i == n - 1 {
        (n - 2, n - 1)
    } else {
        (i - 1, i + 1)
    }
}
