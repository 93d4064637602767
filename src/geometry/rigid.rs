//! Rigid (linear) transforms between volume spaces.
//!
//! A [`RigidTransform`] wraps a 4×4 homogeneous matrix mapping world
//! coordinates of a source space into world coordinates of a target space.
//! Estimated motion matrices are not guaranteed to be strictly orthonormal,
//! so the general affine inverse is used throughout.

use nalgebra::{Matrix4, Rotation3, Vector3};

use super::grid::apply;
use crate::error::{CorrectionError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    matrix: Matrix4<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    /// Build from four rows, as stored in motion matrix files.
    pub fn from_rows(rows: [[f64; 4]; 4]) -> Self {
        Self {
            matrix: Matrix4::from_fn(|r, c| rows[r][c]),
        }
    }

    /// Pure translation in world units (mm).
    pub fn translation(offset: [f64; 3]) -> Self {
        Self {
            matrix: Matrix4::new_translation(&Vector3::from(offset)),
        }
    }

    /// Rotation about the world origin (roll, pitch, yaw in radians)
    /// followed by a translation.
    pub fn from_euler(angles: [f64; 3], offset: [f64; 3]) -> Self {
        let rotation = Rotation3::from_euler_angles(angles[0], angles[1], angles[2]);
        let mut matrix = rotation.to_homogeneous();
        matrix[(0, 3)] = offset[0];
        matrix[(1, 3)] = offset[1];
        matrix[(2, 3)] = offset[2];
        Self { matrix }
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn rows(&self) -> [[f64; 4]; 4] {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = self.matrix[(r, c)];
            }
        }
        rows
    }

    /// Apply `self`, then `next`. For `self: A→B` and `next: B→C` the result
    /// maps A→C.
    pub fn then(&self, next: &RigidTransform) -> RigidTransform {
        RigidTransform {
            matrix: next.matrix * self.matrix,
        }
    }

    /// `compose(A→B, B→C) = A→C`.
    pub fn compose(first: &RigidTransform, second: &RigidTransform) -> RigidTransform {
        first.then(second)
    }

    /// `inverse(A→B) = B→A`.
    pub fn inverse(&self) -> Result<RigidTransform> {
        self.matrix
            .try_inverse()
            .map(|matrix| RigidTransform { matrix })
            .ok_or_else(|| CorrectionError::SingularTransform(format!("{:?}", self.rows())))
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        apply(&self.matrix, point)
    }

    pub fn max_abs_deviation(&self, other: &RigidTransform) -> f64 {
        (self.matrix - other.matrix).amax()
    }

    /// Exact comparison against the identity matrix.
    pub fn is_identity(&self) -> bool {
        self.matrix == Matrix4::identity()
    }

    pub fn approx_identity(&self, tolerance: f64) -> bool {
        self.max_abs_deviation(&RigidTransform::identity()) < tolerance
    }

    pub fn translation_part(&self) -> Vector3<f64> {
        Vector3::new(self.matrix[(0, 3)], self.matrix[(1, 3)], self.matrix[(2, 3)])
    }
}
