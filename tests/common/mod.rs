#![allow(dead_code)]

use asl_corrections::distortion::{
    NonlinearRegistration, PhaseReversedEstimator, RegistrationOutcome, RegistrationRequest,
    TopupParams,
};
use asl_corrections::motion::VolumeRegistration;
use asl_corrections::{
    EstimatorError, Metadata, MotionEstimator, ReferenceGrid, RigidTransform, Volume, WarpField,
};
use nalgebra::Vector3;
use ndarray::Array4;

pub fn grid(shape: [usize; 3], spacing: f64) -> ReferenceGrid {
    ReferenceGrid::with_spacing(shape, [spacing; 3]).unwrap()
}

/// A series whose volume `t` holds a bright 2×2×2 block starting at
/// x = `start + t * step` voxels.
pub fn moving_block_series(grid: &ReferenceGrid, n: usize, start: usize, step: usize) -> Volume {
    let [nx, ny, nz] = grid.shape();
    let data = Array4::from_shape_fn((nx, ny, nz, n), |(x, y, z, t)| {
        let x0 = start + t * step;
        let inside = (x0..x0 + 2).contains(&x) && (3..5).contains(&y) && (3..5).contains(&z);
        if inside { 100.0 } else { 0.0 }
    });
    let metadata = Metadata::named("asldata").with_attribute("tis", "1.8");
    Volume::new(data, grid.clone(), metadata).unwrap()
}

/// Single volume with a sharp step along x at `edge`.
pub fn step_image(grid: &ReferenceGrid, edge: usize) -> Volume {
    let [nx, ny, nz] = grid.shape();
    let data =
        Array4::from_shape_fn((nx, ny, nz, 1), |(x, _, _, _)| if x < edge { 0.0 } else { 50.0 });
    Volume::new(data, grid.clone(), Metadata::named("step")).unwrap()
}

pub fn constant_image(grid: &ReferenceGrid, nt: usize, value: f32) -> Volume {
    let [nx, ny, nz] = grid.shape();
    Volume::new(
        Array4::from_elem((nx, ny, nz, nt), value),
        grid.clone(),
        Metadata::named("constant"),
    )
    .unwrap()
}

pub fn constant_warp(grid: &ReferenceGrid, d: [f64; 3]) -> WarpField {
    WarpField::from_fn(grid.clone(), move |_| Vector3::from(d))
}

/// Registers volumes by matching intensity-weighted centroids in world
/// space. Exact for pure translations of a single object.
pub struct CentroidEstimator;

impl CentroidEstimator {
    fn centroid(volume: &Volume) -> Vector3<f64> {
        let mut sum = Vector3::zeros();
        let mut mass = 0.0;
        for ((x, y, z), &v) in volume.frame(0).indexed_iter() {
            let w = v as f64;
            let voxel = Vector3::new(x as f64, y as f64, z as f64);
            sum += volume.grid().voxel_to_world(&voxel) * w;
            mass += w;
        }
        sum / mass
    }
}

impl VolumeRegistration for CentroidEstimator {
    fn register(
        &self,
        _index: usize,
        moving: &Volume,
        reference: &Volume,
    ) -> Result<RigidTransform, EstimatorError> {
        let offset = Self::centroid(reference) - Self::centroid(moving);
        Ok(RigidTransform::translation([offset.x, offset.y, offset.z]))
    }
}

/// Fails to converge on one volume.
pub struct DivergingEstimator {
    pub volume: usize,
}

impl MotionEstimator for DivergingEstimator {
    fn estimate_motion(
        &self,
        _series: &Volume,
        _reference: Option<&Volume>,
    ) -> Result<Vec<RigidTransform>, EstimatorError> {
        Err(EstimatorError::NoConvergence { volume: self.volume })
    }
}

/// Topup stand-in returning a constant shift along the phase-encode axis,
/// scaled by `mm_per_unit`.
pub struct ShiftTopup {
    pub mm_per_unit: f64,
}

impl PhaseReversedEstimator for ShiftTopup {
    fn estimate(
        &self,
        image: &Volume,
        _reversed: &Volume,
        params: &TopupParams,
    ) -> Result<WarpField, EstimatorError> {
        let [x, y, z, _] = params.rows()[0];
        let d = [x * self.mm_per_unit, y * self.mm_per_unit, z * self.mm_per_unit];
        Ok(constant_warp(image.grid(), d))
    }
}

/// Nonlinear registration stand-in whose warp is a constant shift equal to
/// the translation of the fieldmap→structural matrix it was handed.
pub struct FieldmapOffsetRegistration;

impl NonlinearRegistration for FieldmapOffsetRegistration {
    fn register(
        &self,
        request: &RegistrationRequest<'_>,
    ) -> Result<RegistrationOutcome, EstimatorError> {
        let offset = request
            .fieldmap
            .as_ref()
            .and_then(|prior| prior.fmap2struct)
            .map(|t| t.translation_part())
            .unwrap_or_else(Vector3::zeros);
        Ok(RegistrationOutcome {
            warp: constant_warp(request.fixed.grid(), [offset.x, offset.y, offset.z]),
            forward: request.init.unwrap_or_default(),
        })
    }
}

pub fn max_abs_diff(a: &Volume, b: &Volume) -> f32 {
    a.data()
        .iter()
        .zip(b.data().iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
