//! Applies every available correction to the ASL series and the
//! calibration family with one resampling pass per image.
//!
//! The run is a fixed sequence of stages:
//!
//! 1. **Collect** reads the registry once and fixes which corrections exist.
//! 2. **Compose (series)** builds one combined transform per ASL volume. The
//!    shared warps are composed once and reused with each volume's motion
//!    matrix as its premat.
//! 3. **Compose (calibration)** builds the single transform shared by the
//!    calibration, calibration-reference and reversed-phase images.
//! 4. **Apply** resamples everything, then registers the results. With no
//!    corrections at all the originals are passed through untouched.
//!
//! A failure in any stage leaves no corrected image in the registry.

use std::sync::Arc;

use crate::compose::{CombinedTransform, CorrectionElement, TransformComposer};
use crate::enums::{DistortionSource, InterpolationKernel, WarpSpace};
use crate::error::{CorrectionError, Result};
use crate::geometry::{ReferenceGrid, ReferenceOrigin, ReferenceSpace, RigidTransform, WarpField};
use crate::registry::{TransformRegistry, keys};
use crate::resample::Resampler;
use crate::volume::Volume;

/// Calibration-family images: original key and corrected key.
const CALIBRATION_FAMILY: [(&str, &str); 3] = [
    (keys::CALIB_ORIG, keys::CALIB),
    (keys::CREF_ORIG, keys::CREF),
    (keys::CBLIP_ORIG, keys::CBLIP),
];

/// Which corrections are available for this run.
#[derive(Debug, Clone, Default)]
pub struct CorrectionPlan {
    motion: Option<Arc<[RigidTransform]>>,
    asl2calib: Option<RigidTransform>,
    calib2asl: Option<RigidTransform>,
    distortion: Option<(Arc<WarpField>, DistortionSource, WarpSpace)>,
    gdc: Option<Arc<WarpField>>,
}

impl CorrectionPlan {
    pub fn collect(registry: &TransformRegistry) -> Result<Self> {
        let fmap_warp = registry.warp(keys::FMAP_WARP)?;
        let cblip_warp = registry.warp(keys::CBLIP_WARP)?;
        let distortion = match (fmap_warp, cblip_warp) {
            (Some(_), Some(_)) => {
                return Err(CorrectionError::MutuallyExclusive(keys::FMAP_WARP, keys::CBLIP_WARP));
            }
            (Some(w), None) => Some((w, DistortionSource::Fieldmap, WarpSpace::Analysis)),
            (None, Some(w)) => Some((w, DistortionSource::PhaseReversed, WarpSpace::Calibration)),
            (None, None) => None,
        };

        let plan = Self {
            motion: registry.rigid_series(keys::ASLDATA_MC_MATS)?,
            asl2calib: registry.rigid(keys::ASL2CALIB)?,
            calib2asl: registry.rigid(keys::CALIB2ASL)?,
            distortion,
            gdc: registry.warp(keys::GDC_WARP)?,
        };
        tracing::info!(
            motion = plan.has_motion(),
            distortion = ?plan.distortion_source(),
            gdc = plan.has_gdc(),
            calib2asl = plan.calib2asl.is_some(),
            "collected corrections"
        );
        Ok(plan)
    }

    pub fn has_motion(&self) -> bool {
        self.motion.is_some()
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.is_some()
    }

    pub fn has_gdc(&self) -> bool {
        self.gdc.is_some()
    }

    pub fn distortion_source(&self) -> Option<DistortionSource> {
        self.distortion.as_ref().map(|(_, source, _)| *source)
    }

    /// Nothing to apply to any image.
    pub fn is_empty(&self) -> bool {
        !self.has_motion() && !self.has_distortion() && !self.has_gdc() && self.calib2asl.is_none()
    }

    /// Elements shared by every ASL volume, following its motion matrix.
    pub fn series_tail(&self) -> Vec<CorrectionElement> {
        let mut elements = Vec::new();
        if let Some((warp, _, space)) = &self.distortion {
            let warp = CorrectionElement::Warp(Arc::clone(warp));
            match (space, self.asl2calib, self.calib2asl) {
                (WarpSpace::Calibration, Some(asl2calib), Some(calib2asl)) => {
                    elements.push(CorrectionElement::Rigid(asl2calib));
                    elements.push(warp);
                    elements.push(CorrectionElement::Rigid(calib2asl));
                }
                _ => elements.push(warp),
            }
        }
        if let Some(gdc) = &self.gdc {
            elements.push(CorrectionElement::Warp(Arc::clone(gdc)));
        }
        elements
    }

    /// Elements taking a calibration-family image into analysis space.
    pub fn calibration_elements(&self) -> Vec<CorrectionElement> {
        let to_asl = self.calib2asl.map(CorrectionElement::Rigid);
        let mut elements = Vec::new();
        match &self.distortion {
            Some((warp, _, WarpSpace::Calibration)) => {
                elements.push(CorrectionElement::Warp(Arc::clone(warp)));
                elements.extend(to_asl);
            }
            Some((warp, _, WarpSpace::Analysis)) => {
                elements.extend(to_asl);
                elements.push(CorrectionElement::Warp(Arc::clone(warp)));
            }
            None => elements.extend(to_asl),
        }
        if let Some(gdc) = &self.gdc {
            elements.push(CorrectionElement::Warp(Arc::clone(gdc)));
        }
        elements
    }

    /// One combined transform per ASL volume.
    pub fn compose_series(
        &self,
        composer: &TransformComposer,
        n_volumes: usize,
    ) -> Result<(CombinedTransform, Vec<CombinedTransform>)> {
        let shared = composer.compose(&self.series_tail())?;
        let per_volume = match &self.motion {
            Some(mats) => {
                if mats.len() != n_volumes {
                    return Err(CorrectionError::TransformCountMismatch {
                        expected: n_volumes,
                        found: mats.len(),
                    });
                }
                mats.iter()
                    .map(|m| shared.after(m))
                    .collect::<Result<Vec<_>>>()?
            }
            None => vec![shared.clone(); n_volumes],
        };
        Ok((shared, per_volume))
    }

    pub fn compose_calibration(&self, composer: &TransformComposer) -> Result<CombinedTransform> {
        composer.compose(&self.calibration_elements())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// No corrections: originals registered as the corrected images.
    PassedThrough,
    Resampled {
        volumes: usize,
        calibration_images: usize,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CorrectionOrchestrator {
    resampler: Resampler,
    reference: Option<ReferenceGrid>,
}

impl CorrectionOrchestrator {
    pub fn new(kernel: InterpolationKernel) -> Self {
        Self {
            resampler: Resampler::new(kernel),
            reference: None,
        }
    }

    /// Resample onto `grid` instead of the ASL series' own grid.
    pub fn with_reference(mut self, grid: ReferenceGrid) -> Self {
        self.reference = Some(grid);
        self
    }

    pub fn run(&self, registry: &mut TransformRegistry) -> Result<ApplyOutcome> {
        let asldata = registry.require_volume(keys::ASLDATA_ORIG)?;
        let reference = match &self.reference {
            Some(grid) => ReferenceSpace::new(grid.clone(), ReferenceOrigin::External)?,
            None => ReferenceSpace::new(
                asldata.grid().clone(),
                ReferenceOrigin::SeriesMiddle {
                    index: asldata.middle_index(),
                },
            )?,
        };

        let plan = CorrectionPlan::collect(registry)?;
        let mut calibration: Vec<(&'static str, Arc<Volume>)> = Vec::new();
        for (orig, corrected) in CALIBRATION_FAMILY {
            if let Some(image) = registry.volume(orig)? {
                calibration.push((corrected, image));
            }
        }

        if plan.is_empty() && self.reference.is_none() {
            tracing::info!("no corrections to apply");
            registry.insert_reference(keys::REFERENCE, reference)?;
            registry.insert_volume(keys::ASLDATA, asldata)?;
            for (key, image) in calibration {
                registry.insert_volume(key, image)?;
            }
            return Ok(ApplyOutcome::PassedThrough);
        }

        let composer = TransformComposer::new(reference.grid().clone())?;
        let (shared, series) = plan.compose_series(&composer, asldata.n_volumes())?;
        let calib_transform = if calibration.is_empty() {
            None
        } else {
            Some(plan.compose_calibration(&composer)?)
        };

        tracing::info!(volumes = asldata.n_volumes(), "applying corrections to ASL data");
        let corrected = self.resampler.resample_series(&asldata, &series, reference.grid())?;

        let mut corrected_calibration = Vec::with_capacity(calibration.len());
        if let Some(transform) = &calib_transform {
            for (key, image) in &calibration {
                tracing::info!(image = image.name(), "applying corrections to calibration data");
                let out = self.resampler.resample(image, transform, reference.grid())?;
                corrected_calibration.push((*key, out));
            }
        }

        registry.insert_reference(keys::REFERENCE, reference)?;
        if let (Some(warp), Some(jacobian)) = (shared.warp(), shared.jacobian()) {
            registry.insert_warp(keys::TOTAL_WARP, Arc::clone(warp))?;
            registry.insert_jacobian(keys::JACOBIAN, Arc::clone(jacobian))?;
        }
        registry.insert_volume(keys::ASLDATA, corrected)?;
        let calibration_images = corrected_calibration.len();
        for (key, image) in corrected_calibration {
            registry.insert_volume(key, image)?;
        }

        Ok(ApplyOutcome::Resampled {
            volumes: asldata.n_volumes(),
            calibration_images,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Metadata;
    use nalgebra::Vector3;
    use ndarray::Array4;

    fn grid() -> ReferenceGrid {
        ReferenceGrid::with_spacing([5, 5, 5], [2.0; 3]).unwrap()
    }

    fn volume(name: &str, nt: usize) -> Volume {
        let data = Array4::from_shape_fn((5, 5, 5, nt), |(x, y, z, t)| (x * y + z + t) as f32);
        Volume::new(data, grid(), Metadata::named(name)).unwrap()
    }

    fn warp() -> WarpField {
        WarpField::from_fn(grid(), |_| Vector3::new(0.5, 0.0, 0.0))
    }

    #[test]
    fn empty_plan_passes_images_through() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::ASLDATA_ORIG, volume("asl", 3)).unwrap();
        registry.insert_volume(keys::CALIB_ORIG, volume("calib", 1)).unwrap();

        let outcome = CorrectionOrchestrator::default().run(&mut registry).unwrap();
        assert_eq!(outcome, ApplyOutcome::PassedThrough);
        let asl = registry.volume(keys::ASLDATA).unwrap().unwrap();
        let orig = registry.volume(keys::ASLDATA_ORIG).unwrap().unwrap();
        assert!(Arc::ptr_eq(&asl, &orig));
        assert!(registry.contains(keys::CALIB));
        assert!(!registry.contains(keys::TOTAL_WARP));
    }

    #[test]
    fn calibration_space_warp_is_bracketed_for_the_series() {
        let shift = RigidTransform::translation([0.0, 2.0, 0.0]);
        let plan = CorrectionPlan {
            asl2calib: Some(shift),
            calib2asl: Some(shift.inverse().unwrap()),
            distortion: Some((
                Arc::new(warp()),
                DistortionSource::PhaseReversed,
                WarpSpace::Calibration,
            )),
            ..Default::default()
        };
        let series = plan.series_tail();
        assert_eq!(series.len(), 3);
        assert!(series[1].is_warp());

        let calib = plan.calibration_elements();
        assert_eq!(calib.len(), 2);
        assert!(calib[0].is_warp());
    }

    #[test]
    fn gdc_is_its_own_element_after_distortion() {
        let plan = CorrectionPlan {
            distortion: Some((Arc::new(warp()), DistortionSource::Fieldmap, WarpSpace::Analysis)),
            gdc: Some(Arc::new(WarpField::zeros(grid()))),
            ..Default::default()
        };
        let tail = plan.series_tail();
        assert_eq!(tail.len(), 2);
        match (&tail[0], &tail[1]) {
            (CorrectionElement::Warp(a), CorrectionElement::Warp(b)) => {
                assert!(!Arc::ptr_eq(a, b));
                assert_eq!(b.displacement_at_voxel(0, 0, 0), Vector3::zeros());
            }
            _ => panic!("expected two warps"),
        }
    }

    #[test]
    fn corrections_are_registered_after_resampling() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::ASLDATA_ORIG, volume("asl", 2)).unwrap();
        registry.insert_volume(keys::CALIB_ORIG, volume("calib", 1)).unwrap();
        registry.insert_volume(keys::CREF_ORIG, volume("cref", 1)).unwrap();
        registry.insert_warp(keys::GDC_WARP, warp()).unwrap();

        let outcome = CorrectionOrchestrator::new(InterpolationKernel::Trilinear)
            .run(&mut registry)
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Resampled {
                volumes: 2,
                calibration_images: 2
            }
        );
        for key in [
            keys::ASLDATA,
            keys::CALIB,
            keys::CREF,
            keys::TOTAL_WARP,
            keys::JACOBIAN,
            keys::REFERENCE,
        ] {
            assert!(registry.contains(key), "{key}");
        }
        assert!(!registry.contains(keys::CBLIP));
        assert_eq!(registry.volume(keys::ASLDATA).unwrap().unwrap().name(), "asl");
    }

    #[test]
    fn custom_reference_always_resamples() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::ASLDATA_ORIG, volume("asl", 2)).unwrap();
        // every second voxel of the ASL grid
        let coarse = ReferenceGrid::with_spacing([3, 3, 3], [4.0; 3]).unwrap();

        let outcome = CorrectionOrchestrator::new(InterpolationKernel::Trilinear)
            .with_reference(coarse.clone())
            .run(&mut registry)
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Resampled {
                volumes: 2,
                calibration_images: 0
            }
        );

        let reference = registry.reference(keys::REFERENCE).unwrap().unwrap();
        assert_eq!(reference.origin(), &ReferenceOrigin::External);
        let asl = registry.volume(keys::ASLDATA).unwrap().unwrap();
        let orig = registry.volume(keys::ASLDATA_ORIG).unwrap().unwrap();
        assert_eq!(asl.grid(), &coarse);
        assert_eq!(asl.n_volumes(), 2);
        for ((x, y, z, t), &v) in asl.data().indexed_iter() {
            assert_eq!(v, orig.data()[[2 * x, 2 * y, 2 * z, t]]);
        }
    }

    #[test]
    fn motion_count_mismatch_leaves_nothing_written() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::ASLDATA_ORIG, volume("asl", 3)).unwrap();
        registry
            .insert_rigid_series(keys::ASLDATA_MC_MATS, vec![RigidTransform::identity(); 2])
            .unwrap();

        let err = CorrectionOrchestrator::default().run(&mut registry).unwrap_err();
        assert!(matches!(err, CorrectionError::TransformCountMismatch { expected: 3, found: 2 }));
        assert!(!registry.contains(keys::ASLDATA));
        assert!(!registry.contains(keys::REFERENCE));
    }
}
