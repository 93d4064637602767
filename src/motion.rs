//! Motion correction: per-volume rigid transforms into the space of the
//! series' own middle volume.
//!
//! The estimator itself is external. When a calibration image is available
//! it is used as the estimation reference (it is the most consistent target
//! across TIs and background suppression). The resulting volume→calibration
//! matrices are then re-anchored on the middle ASL volume so that volume is
//! never resampled, and the calibration↔ASL transforms are recorded so the
//! calibration family can be brought into the same space.

use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{CorrectionError, EstimatorError, Result};
use crate::geometry::RigidTransform;
use crate::registry::{TransformRegistry, keys};
use crate::volume::Volume;

/// External rigid-body motion estimator.
///
/// Returns one transform per volume of `series`, each mapping that volume
/// into the space of `reference`, or of the series' middle volume when no
/// reference is given.
pub trait MotionEstimator: Sync {
    fn estimate_motion(
        &self,
        series: &Volume,
        reference: Option<&Volume>,
    ) -> std::result::Result<Vec<RigidTransform>, EstimatorError>;
}

/// Registers a single 3D volume onto a reference.
pub trait VolumeRegistration: Sync {
    fn register(
        &self,
        index: usize,
        moving: &Volume,
        reference: &Volume,
    ) -> std::result::Result<RigidTransform, EstimatorError>;
}

/// Runs a [`VolumeRegistration`] over every volume of a series in parallel.
/// Results land in volume order regardless of completion order.
#[derive(Debug, Clone)]
pub struct PerVolumeEstimator<R> {
    registration: R,
}

impl<R: VolumeRegistration> PerVolumeEstimator<R> {
    pub fn new(registration: R) -> Self {
        Self { registration }
    }
}

impl<R: VolumeRegistration> MotionEstimator for PerVolumeEstimator<R> {
    fn estimate_motion(
        &self,
        series: &Volume,
        reference: Option<&Volume>,
    ) -> std::result::Result<Vec<RigidTransform>, EstimatorError> {
        let middle;
        let reference = match reference {
            Some(r) => r,
            None => {
                middle = series
                    .frame_volume(series.middle_index())
                    .map_err(|e| EstimatorError::Failed(e.to_string()))?;
                &middle
            }
        };

        (0..series.n_volumes())
            .into_par_iter()
            .map(|i| {
                let moving = series
                    .frame_volume(i)
                    .map_err(|e| EstimatorError::Failed(e.to_string()))?;
                self.registration.register(i, &moving, reference)
            })
            .collect()
    }
}

/// Transforms already estimated elsewhere, e.g. read from a matrix file.
#[derive(Debug, Clone)]
pub struct PrecomputedMotion {
    transforms: Vec<RigidTransform>,
}

impl PrecomputedMotion {
    pub fn new(transforms: Vec<RigidTransform>) -> Self {
        Self { transforms }
    }
}

impl MotionEstimator for PrecomputedMotion {
    fn estimate_motion(
        &self,
        series: &Volume,
        _reference: Option<&Volume>,
    ) -> std::result::Result<Vec<RigidTransform>, EstimatorError> {
        if self.transforms.len() != series.n_volumes() {
            return Err(EstimatorError::TransformCount {
                expected: series.n_volumes(),
                found: self.transforms.len(),
            });
        }
        Ok(self.transforms.clone())
    }
}

/// Output of the motion stage.
#[derive(Debug, Clone)]
pub struct MotionCorrection {
    transforms: Vec<RigidTransform>,
    asl2calib: Option<RigidTransform>,
    calib2asl: Option<RigidTransform>,
}

impl MotionCorrection {
    /// Estimate and re-anchor motion for `series`.
    ///
    /// With a `calibration` reference, the estimator's volume→calibration
    /// transforms `T_i` become `T_mid⁻¹ ∘ T_i` (volume→middle volume), and
    /// `asl2calib = T_mid`, `calib2asl = T_mid⁻¹` are kept. The middle
    /// transform is set to exactly the identity in every case.
    pub fn estimate(
        series: &Volume,
        calibration: Option<&Volume>,
        estimator: &dyn MotionEstimator,
    ) -> Result<Self> {
        let n = series.n_volumes();
        if n == 0 {
            return Err(CorrectionError::MotionEstimation {
                volume: None,
                reason: format!("{} has no volumes", series.name()),
            });
        }
        let mid = series.middle_index();

        let reference = calibration.map(Self::reference_frame).transpose()?;
        match &reference {
            Some(r) => tracing::info!(
                reference = r.name(),
                "motion correction using calibration image as reference"
            ),
            None => tracing::info!(
                middle = mid,
                "motion correction using ASL middle volume as reference"
            ),
        }

        let mut transforms = estimator
            .estimate_motion(series, reference.as_ref())
            .map_err(CorrectionError::motion)?;
        if transforms.len() != n {
            return Err(CorrectionError::motion(EstimatorError::TransformCount {
                expected: n,
                found: transforms.len(),
            }));
        }

        let to_middle = transforms[mid].inverse().map_err(|_| CorrectionError::MotionEstimation {
            volume: Some(mid),
            reason: "middle volume transform is singular".into(),
        })?;
        let (asl2calib, calib2asl) = match reference {
            Some(_) => {
                tracing::debug!(
                    matrix = %transforms[mid].matrix(),
                    "ASL middle volume -> calibration"
                );
                tracing::debug!(matrix = %to_middle.matrix(), "calibration -> ASL middle volume");
                (Some(transforms[mid]), Some(to_middle))
            }
            None => {
                if !transforms[mid].approx_identity(1e-6) {
                    tracing::warn!(
                        deviation = transforms[mid].max_abs_deviation(&RigidTransform::identity()),
                        "middle volume transform is not identity, re-anchoring"
                    );
                }
                (None, None)
            }
        };

        for t in transforms.iter_mut() {
            *t = RigidTransform::compose(t, &to_middle);
        }
        transforms[mid] = RigidTransform::identity();

        for (volume, t) in transforms.iter().enumerate() {
            tracing::debug!(volume, matrix = %t.matrix(), "motion transform");
        }

        Ok(Self {
            transforms,
            asl2calib,
            calib2asl,
        })
    }

    /// Estimate from the registry's original ASL data (and calibration image
    /// when present) and register the results.
    pub fn run(registry: &mut TransformRegistry, estimator: &dyn MotionEstimator) -> Result<Self> {
        let asldata = registry.require_volume(keys::ASLDATA_ORIG)?;
        let calib = registry.volume(keys::CALIB_ORIG)?;
        let motion = Self::estimate(&asldata, calib.as_deref(), estimator)?;
        motion.register(registry)?;
        Ok(motion)
    }

    pub fn register(&self, registry: &mut TransformRegistry) -> Result<()> {
        registry.insert_rigid_series(keys::ASLDATA_MC_MATS, self.transforms.clone())?;
        if let Some(t) = self.asl2calib {
            registry.insert_rigid(keys::ASL2CALIB, t)?;
        }
        if let Some(t) = self.calib2asl {
            registry.insert_rigid(keys::CALIB2ASL, t)?;
        }
        Ok(())
    }

    fn reference_frame(calibration: &Volume) -> Result<Volume> {
        if calibration.n_volumes() == 1 {
            Ok(calibration.clone())
        } else {
            calibration.mean_frame()
        }
    }

    pub fn transforms(&self) -> &[RigidTransform] {
        &self.transforms
    }

    pub fn asl2calib(&self) -> Option<&RigidTransform> {
        self.asl2calib.as_ref()
    }

    pub fn calib2asl(&self) -> Option<&RigidTransform> {
        self.calib2asl.as_ref()
    }

    /// All transforms stacked into a `(4 * n, 4)` matrix, one 4×4 block per
    /// volume in volume order.
    pub fn stacked_matrices(&self) -> Array2<f64> {
        stack_matrices(&self.transforms)
    }
}

pub fn stack_matrices(transforms: &[RigidTransform]) -> Array2<f64> {
    let mut stacked = Array2::zeros((4 * transforms.len(), 4));
    for (block, t) in transforms.iter().enumerate() {
        for (r, row) in t.rows().iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                stacked[[4 * block + r, c]] = v;
            }
        }
    }
    stacked
}

pub fn unstack_matrices(stacked: &Array2<f64>) -> Result<Vec<RigidTransform>> {
    let (rows, cols) = stacked.dim();
    if cols != 4 || rows % 4 != 0 {
        return Err(CorrectionError::InvalidInput(format!(
            "motion matrices must be (4n, 4), got ({rows}, {cols})"
        )));
    }
    Ok((0..rows / 4)
        .map(|block| {
            let mut m = [[0.0; 4]; 4];
            for (r, row) in m.iter_mut().enumerate() {
                for (c, v) in row.iter_mut().enumerate() {
                    *v = stacked[[4 * block + r, c]];
                }
            }
            RigidTransform::from_rows(m)
        })
        .collect())
}
