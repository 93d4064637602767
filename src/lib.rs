//! # ASL corrections library
//!
//! This crate composes and applies motion and distortion corrections for
//! Arterial Spin Labeling (ASL) MRI data.

//!
//! Rigid motion matrices, nonlinear distortion warps and an optional
//! gradient distortion warp are estimated elsewhere. This library represents
//! them as first-class objects, folds them into a single combined transform
//! per image and resamples the raw data in one interpolation pass. Where the
//! combined warp locally compresses or expands tissue the resampled signal is
//! rescaled by the warp's Jacobian.
//!
//! Corrections are applied to:
//!  - The ASL time series (one transform per volume)
//!  - The calibration image, calibration reference and phase-encode-reversed
//!    calibration image (one shared transform)
//!
//!  All outputs land on the grid of the ASL series' middle volume, which is
//!  itself never resampled by motion correction. Per-volume resampling and
//!  voxel loops run in parallel using rayon.
//!
//!   The estimators (rigid registration, nonlinear registration, topup-style
//!   phase-reversed estimation) are pluggable through the traits in
//!   [`motion`] and [`distortion`].
//!
//! # Examples
//!
//! ## Applying precomputed motion correction
//!
//! Load an ASL series, apply motion matrices estimated against its middle
//! volume and write the corrected series.
//!
//! ```no_run
//! # use asl_corrections::{
//! #     CorrectionOrchestrator, MotionCorrection, PrecomputedMotion, TransformRegistry,
//! #     VolumeLoader, keys,
//! # };
//! # use asl_corrections::enums::InterpolationKernel;
//! let mut registry = TransformRegistry::new();
//! let asl = VolumeLoader::load("asl.nii.gz", "asldata")?;
//! registry.insert_volume(keys::ASLDATA_ORIG, asl)?;
//!
//! let mats = VolumeLoader::read_motion_matrices("asl_mc.mat")?;
//! MotionCorrection::run(&mut registry, &PrecomputedMotion::new(mats))?;
//!
//! CorrectionOrchestrator::new(InterpolationKernel::Sinc).run(&mut registry)?;
//! let corrected = registry.require_volume(keys::ASLDATA)?;
//! VolumeLoader::save(&corrected, "asl_corrected.nii.gz")?;
//! # Ok::<(), asl_corrections::CorrectionError>(())
//! ```

pub mod compose;
pub mod config;
pub mod distortion;
pub mod enums;
pub mod error;
pub mod geometry;
mod interpolator;
pub mod motion;
pub mod orchestrator;
pub mod registry;
pub mod resample;
pub mod sensitivity;
pub mod volume;
pub mod volume_loader;

pub use compose::{CombinedTransform, CorrectionElement, TransformComposer};
pub use config::CorrectionConfig;
pub use distortion::{
    DistortionCorrection, DistortionEstimators, DistortionOptions, DistortionOutcome,
    PrecomputedWarp, TopupParams,
};
pub use error::{CorrectionError, EstimatorError, Result, Warning};
pub use geometry::{Jacobian, ReferenceGrid, ReferenceSpace, RigidTransform, WarpField};
pub use motion::{MotionCorrection, MotionEstimator, PrecomputedMotion};
pub use orchestrator::{ApplyOutcome, CorrectionOrchestrator, CorrectionPlan};
pub use registry::{TransformRegistry, keys};
pub use resample::Resampler;
pub use sensitivity::SensitivityMap;
pub use volume::{Metadata, Volume};
pub use volume_loader::VolumeLoader;
