//! Sample grids and the analysis reference space.

use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::error::{CorrectionError, Result};

/// Tolerance used when deciding whether two grids share geometry.
const GEOMETRY_TOLERANCE: f64 = 1e-6;

/// Shape plus voxel→world affine. The inverse is cached because every
/// resampled voxel needs a world→voxel lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceGrid {
    shape: [usize; 3],
    affine: Matrix4<f64>,
    inverse: Matrix4<f64>,
}

impl ReferenceGrid {
    pub fn new(shape: [usize; 3], affine: Matrix4<f64>) -> Result<Self> {
        let inverse = affine.try_inverse().ok_or_else(|| {
            CorrectionError::SingularTransform("voxel-to-world affine".to_string())
        })?;
        Ok(Self {
            shape,
            affine,
            inverse,
        })
    }

    /// Axis-aligned grid with the given voxel spacing and the first voxel at
    /// the world origin.
    pub fn with_spacing(shape: [usize; 3], spacing: [f64; 3]) -> Result<Self> {
        let affine = Matrix4::new_nonuniform_scaling(&Vector3::from(spacing));
        Self::new(shape, affine)
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    pub fn inverse_affine(&self) -> &Matrix4<f64> {
        &self.inverse
    }

    /// Linear part of the affine: world displacement per unit voxel step,
    /// one column per voxel axis.
    pub fn linear(&self) -> Matrix3<f64> {
        self.affine.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Voxel size along each axis (column norms of the linear part).
    pub fn spacing(&self) -> [f64; 3] {
        let linear = self.linear();
        [
            linear.column(0).norm(),
            linear.column(1).norm(),
            linear.column(2).norm(),
        ]
    }

    pub fn voxel_to_world(&self, voxel: &Vector3<f64>) -> Vector3<f64> {
        apply(&self.affine, voxel)
    }

    pub fn world_to_voxel(&self, world: &Vector3<f64>) -> Vector3<f64> {
        apply(&self.inverse, world)
    }

    pub fn same_geometry(&self, other: &ReferenceGrid) -> bool {
        self.shape == other.shape && (self.affine - other.affine).amax() < GEOMETRY_TOLERANCE
    }

    /// Fail with [`CorrectionError::IncompatibleGrid`] unless `other` shares
    /// this grid's geometry.
    pub fn ensure_same(&self, other: &ReferenceGrid, what: &'static str) -> Result<()> {
        if self.same_geometry(other) {
            Ok(())
        } else {
            Err(CorrectionError::IncompatibleGrid {
                what,
                expected: self.shape,
                found: other.shape,
            })
        }
    }
}

pub(crate) fn apply(matrix: &Matrix4<f64>, point: &Vector3<f64>) -> Vector3<f64> {
    let p = matrix * point.push(1.0);
    Vector3::new(p.x, p.y, p.z)
}

/// Where the analysis grid came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceOrigin {
    /// Central timepoint of the ASL series.
    SeriesMiddle { index: usize },
    /// Explicitly supplied grid.
    External,
}

/// The single analysis grid every combined transform resamples into.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSpace {
    grid: ReferenceGrid,
    origin: ReferenceOrigin,
}

impl ReferenceSpace {
    pub fn new(grid: ReferenceGrid, origin: ReferenceOrigin) -> Result<Self> {
        if grid.is_empty() {
            return Err(CorrectionError::EmptyReferenceGrid);
        }
        Ok(Self { grid, origin })
    }

    pub fn grid(&self) -> &ReferenceGrid {
        &self.grid
    }

    pub fn origin(&self) -> &ReferenceOrigin {
        &self.origin
    }
}
