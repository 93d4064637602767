//! Distortion correction: at most one susceptibility warp per run, from
//! either a fieldmap or a phase-encode-reversed calibration pair.
//!
//! Both estimators are external. This module checks their inputs, calls
//! them through narrow traits and records where the resulting warp lives so
//! the orchestrator can place it correctly in the correction list.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compose::{CorrectionElement, TransformComposer};
use crate::enums::{DistortionSource, PhaseEncodeDirection, WarpSpace};
use crate::error::{CorrectionError, EstimatorError, Result, Warning};
use crate::geometry::{RigidTransform, WarpField};
use crate::motion::VolumeRegistration;
use crate::registry::{TransformRegistry, keys};
use crate::volume::Volume;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionOptions {
    /// Effective EPI echo spacing (dwell time) in seconds.
    pub echo_spacing: Option<f64>,
    pub pe_dir: Option<PhaseEncodeDirection>,
    /// The fieldmap is already in structural space.
    pub nofmapreg: bool,
}

/// Acquisition parameters for a phase-encode-reversed pair: the unit
/// phase-encode vector scaled by echo spacing, then its negation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopupParams {
    direction: PhaseEncodeDirection,
    echo_spacing: f64,
}

impl TopupParams {
    pub fn new(direction: PhaseEncodeDirection, echo_spacing: f64) -> Result<Self> {
        if !echo_spacing.is_finite() || echo_spacing <= 0.0 {
            return Err(CorrectionError::InvalidInput(format!(
                "echo spacing must be positive, got {echo_spacing}"
            )));
        }
        Ok(Self {
            direction,
            echo_spacing,
        })
    }

    pub fn direction(&self) -> PhaseEncodeDirection {
        self.direction
    }

    pub fn echo_spacing(&self) -> f64 {
        self.echo_spacing
    }

    /// `[x, y, z, echo_spacing]` for the calibration image and its reversed
    /// partner.
    pub fn rows(&self) -> [[f64; 4]; 2] {
        let [x, y, z] = self.direction.unit_vector().map(f64::from);
        [
            [x, y, z, self.echo_spacing],
            [-x, -y, -z, self.echo_spacing],
        ]
    }
}

impl fmt::Display for TopupParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for [x, y, z, es] in self.rows() {
            // negating 0 gives -0, which should print as 0
            writeln!(f, "{} {} {} {es:.6}", x + 0.0, y + 0.0, z + 0.0)?;
        }
        Ok(())
    }
}

/// Fieldmap in rad/s with its magnitude images.
#[derive(Debug, Clone)]
pub struct FieldmapImages {
    pub fmap: Arc<Volume>,
    pub fmapmag: Arc<Volume>,
    pub fmapmagbrain: Arc<Volume>,
}

impl FieldmapImages {
    /// All three images from the registry, or `None` when no fieldmap was
    /// given. A partial triplet is an error.
    pub fn from_registry(registry: &TransformRegistry) -> Result<Option<Self>> {
        let fmap = registry.volume(keys::FMAP)?;
        let fmapmag = registry.volume(keys::FMAPMAG)?;
        let fmapmagbrain = registry.volume(keys::FMAPMAGBRAIN)?;
        match (fmap, fmapmag, fmapmagbrain) {
            (None, None, None) => Ok(None),
            (Some(fmap), Some(fmapmag), Some(fmapmagbrain)) => Ok(Some(Self {
                fmap,
                fmapmag,
                fmapmagbrain,
            })),
            (fmap, fmapmag, _) => {
                let missing = if fmap.is_none() {
                    keys::FMAP
                } else if fmapmag.is_none() {
                    keys::FMAPMAG
                } else {
                    keys::FMAPMAGBRAIN
                };
                Err(CorrectionError::MissingInput(missing.to_string()))
            }
        }
    }
}

/// Fieldmap information handed to the nonlinear registration.
#[derive(Debug, Clone)]
pub struct FieldmapPrior<'a> {
    pub images: &'a FieldmapImages,
    /// Fieldmap → structural, `None` when the fieldmap is already there.
    pub fmap2struct: Option<RigidTransform>,
    pub echo_spacing: f64,
    pub pe_dir: PhaseEncodeDirection,
}

#[derive(Debug, Clone)]
pub struct RegistrationRequest<'a> {
    pub moving: &'a Volume,
    pub fixed: &'a Volume,
    pub init: Option<RigidTransform>,
    pub mask: Option<&'a Volume>,
    pub fieldmap: Option<FieldmapPrior<'a>>,
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// Pull-back warp on the fixed image's grid.
    pub warp: WarpField,
    /// Refined moving → fixed matrix.
    pub forward: RigidTransform,
}

/// External nonlinear registration service.
pub trait NonlinearRegistration: Sync {
    fn register(
        &self,
        request: &RegistrationRequest<'_>,
    ) -> std::result::Result<RegistrationOutcome, EstimatorError>;
}

/// External phase-encode-reversed (topup-style) distortion estimator.
pub trait PhaseReversedEstimator: Sync {
    /// Warp on the grid of `image`, correcting `image`'s distortion.
    fn estimate(
        &self,
        image: &Volume,
        reversed: &Volume,
        params: &TopupParams,
    ) -> std::result::Result<WarpField, EstimatorError>;
}

/// A warp estimated ahead of time, e.g. loaded from disk.
#[derive(Debug, Clone)]
pub struct PrecomputedWarp {
    warp: Arc<WarpField>,
}

impl PrecomputedWarp {
    pub fn new(warp: impl Into<Arc<WarpField>>) -> Self {
        Self { warp: warp.into() }
    }
}

impl NonlinearRegistration for PrecomputedWarp {
    fn register(
        &self,
        request: &RegistrationRequest<'_>,
    ) -> std::result::Result<RegistrationOutcome, EstimatorError> {
        Ok(RegistrationOutcome {
            warp: self.warp.as_ref().clone(),
            forward: request.init.unwrap_or_default(),
        })
    }
}

impl PhaseReversedEstimator for PrecomputedWarp {
    fn estimate(
        &self,
        _image: &Volume,
        _reversed: &Volume,
        _params: &TopupParams,
    ) -> std::result::Result<WarpField, EstimatorError> {
        Ok(self.warp.as_ref().clone())
    }
}

/// Estimators available to the distortion stage. Absent ones make the
/// corresponding path unavailable.
#[derive(Clone, Copy, Default)]
pub struct DistortionEstimators<'a> {
    pub registration: Option<&'a dyn NonlinearRegistration>,
    pub fieldmap_registration: Option<&'a dyn VolumeRegistration>,
    pub phase_reversed: Option<&'a dyn PhaseReversedEstimator>,
}

/// The single distortion warp for a run and where it lives.
#[derive(Debug, Clone)]
pub struct DistortionWarp {
    pub warp: Arc<WarpField>,
    pub source: DistortionSource,
    pub space: WarpSpace,
}

impl DistortionWarp {
    pub fn element(&self) -> CorrectionElement {
        CorrectionElement::Warp(Arc::clone(&self.warp))
    }
}

#[derive(Debug, Clone)]
pub enum DistortionOutcome {
    Applied(DistortionWarp),
    Skipped(Warning),
    NotRequested,
}

impl DistortionOutcome {
    pub fn warp(&self) -> Option<&DistortionWarp> {
        match self {
            DistortionOutcome::Applied(w) => Some(w),
            _ => None,
        }
    }
}

pub struct DistortionCorrection;

impl DistortionCorrection {
    /// Pick the distortion path from the registry inputs and run it.
    ///
    /// A fieldmap together with a reversed-phase calibration image is a
    /// configuration error.
    pub fn run(
        registry: &mut TransformRegistry,
        options: &DistortionOptions,
        estimators: DistortionEstimators<'_>,
    ) -> Result<DistortionOutcome> {
        let fieldmap = FieldmapImages::from_registry(registry)?;
        let cblip = registry.contains(keys::CBLIP_ORIG);

        match (fieldmap, cblip) {
            (Some(_), true) => Err(CorrectionError::MutuallyExclusive(
                keys::FMAP,
                keys::CBLIP_ORIG,
            )),
            (Some(images), false) => {
                let registration = estimators.registration.ok_or_else(|| {
                    CorrectionError::MissingInput("nonlinear registration estimator".into())
                })?;
                Self::fieldmap(
                    registry,
                    options,
                    &images,
                    registration,
                    estimators.fieldmap_registration,
                )
                .map(DistortionOutcome::Applied)
            }
            (None, true) => match estimators.phase_reversed {
                Some(estimator) => Self::phase_reversed(registry, options, estimator),
                None => {
                    let warning = Warning::PhaseReversedSkipped {
                        reason: "no phase-reversed estimator available".into(),
                    };
                    registry.warn(warning.clone());
                    Ok(DistortionOutcome::Skipped(warning))
                }
            },
            (None, false) => {
                tracing::debug!("no distortion correction requested");
                Ok(DistortionOutcome::NotRequested)
            }
        }
    }

    /// Fieldmap-based warp, mapped into analysis (ASL) space.
    ///
    /// The ASL base image is registered to the structural image with the
    /// fieldmap as a prior, initialised from `asl2struct`. The resulting
    /// structural-grid warp is followed by `struct2asl` and resolved on the
    /// ASL grid.
    pub fn fieldmap(
        registry: &mut TransformRegistry,
        options: &DistortionOptions,
        images: &FieldmapImages,
        registration: &dyn NonlinearRegistration,
        fieldmap_registration: Option<&dyn VolumeRegistration>,
    ) -> Result<DistortionWarp> {
        tracing::info!("distortion correction using fieldmap");
        let echo_spacing = options
            .echo_spacing
            .ok_or_else(|| CorrectionError::MissingInput("echo_spacing".into()))?;
        let pe_dir = options
            .pe_dir
            .ok_or_else(|| CorrectionError::MissingInput("pe_dir".into()))?;
        let structural = registry.require_volume(keys::STRUCTURAL)?;
        let asl2struct = registry.require_rigid(keys::ASL2STRUCT)?;
        let asldata = registry.require_volume(keys::ASLDATA_ORIG)?;
        let mask = registry.volume(keys::MASK)?;

        let fmap2struct = match (options.nofmapreg, fieldmap_registration) {
            (true, _) => {
                tracing::info!("fieldmap assumed to be in structural space");
                None
            }
            (false, Some(reg)) => {
                let t = reg
                    .register(0, &images.fmapmagbrain, &structural)
                    .map_err(|source| CorrectionError::Estimator {
                        stage: "fieldmap to structural registration",
                        source,
                    })?;
                tracing::debug!(matrix = %t.matrix(), "fieldmap -> structural");
                registry.insert_rigid(keys::FMAP2STRUCT, t)?;
                Some(t)
            }
            (false, None) => {
                tracing::info!("no fieldmap registration available, using fieldmap as given");
                None
            }
        };

        let base = asldata.mean_frame()?;
        let request = RegistrationRequest {
            moving: &base,
            fixed: &structural,
            init: Some(asl2struct),
            mask: mask.as_deref(),
            fieldmap: Some(FieldmapPrior {
                images,
                fmap2struct,
                echo_spacing,
                pe_dir,
            }),
        };
        let outcome = registration
            .register(&request)
            .map_err(|source| CorrectionError::Estimator {
                stage: "fieldmap distortion registration",
                source,
            })?;

        let struct2asl = outcome.forward.inverse()?;
        let composer = TransformComposer::new(asldata.grid().clone())?;
        let in_asl_space = composer.compose(&[
            CorrectionElement::Warp(Arc::new(outcome.warp)),
            CorrectionElement::Rigid(struct2asl),
        ])?;
        let warp = in_asl_space
            .warp()
            .cloned()
            .ok_or_else(|| {
                CorrectionError::InvalidInput("fieldmap registration produced no warp".into())
            })?;

        registry.insert_warp(keys::FMAP_WARP, Arc::clone(&warp))?;
        Ok(DistortionWarp {
            warp,
            source: DistortionSource::Fieldmap,
            space: WarpSpace::Analysis,
        })
    }

    /// Phase-encode-reversed warp in calibration space. Missing parameters
    /// or a missing calibration partner skip the correction with a warning.
    pub fn phase_reversed(
        registry: &mut TransformRegistry,
        options: &DistortionOptions,
        estimator: &dyn PhaseReversedEstimator,
    ) -> Result<DistortionOutcome> {
        tracing::info!("distortion correction using phase-encode-reversed calibration image");
        let calib = registry.volume(keys::CALIB_ORIG)?;
        let cblip = registry.volume(keys::CBLIP_ORIG)?;

        let missing = [
            (options.echo_spacing.is_none(), "echo spacing not given"),
            (options.pe_dir.is_none(), "phase encode direction not given"),
            (calib.is_none(), "no calibration image to pair with the reversed image"),
            (cblip.is_none(), "no phase-encode-reversed calibration image"),
        ]
        .into_iter()
        .find_map(|(absent, reason)| absent.then_some(reason));

        let (Some(echo_spacing), Some(pe_dir), Some(calib), Some(cblip)) =
            (options.echo_spacing, options.pe_dir, calib, cblip)
        else {
            let warning = Warning::PhaseReversedSkipped {
                reason: missing.unwrap_or("incomplete inputs").to_string(),
            };
            registry.warn(warning.clone());
            return Ok(DistortionOutcome::Skipped(warning));
        };

        let params = TopupParams::new(pe_dir, echo_spacing)?;
        tracing::debug!(params = %params, "phase-reversed acquisition parameters");
        let warp = estimator
            .estimate(&calib, &cblip, &params)
            .map_err(|source| CorrectionError::Estimator {
                stage: "phase-reversed distortion estimation",
                source,
            })?;
        calib.grid().ensure_same(warp.grid(), "phase-reversed warp")?;

        let warp = Arc::new(warp);
        registry.insert_warp(keys::CBLIP_WARP, Arc::clone(&warp))?;
        Ok(DistortionOutcome::Applied(DistortionWarp {
            warp,
            source: DistortionSource::PhaseReversed,
            space: WarpSpace::Calibration,
        }))
    }
}
