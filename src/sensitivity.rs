//! Coil sensitivity map for calibration.
//!
//! Sources in order of preference: a user-supplied sensitivity image, the
//! ratio of the corrected calibration image to the corrected calibration
//! reference image, and finally the reciprocal of a structural bias field.
//! When none is available sensitivity correction is dropped with a warning.

use ndarray::{Array3, ArrayView3, Zip};

use crate::error::{Result, Warning};
use crate::registry::{TransformRegistry, keys};
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitivitySource {
    UserSupplied,
    CalibrationRatio,
    BiasField,
}

pub struct SensitivityMap;

impl SensitivityMap {
    /// Derive the map from registry contents and register it under
    /// [`keys::SENSITIVITY`]. Returns `None` (and records a warning) when no
    /// source is available.
    pub fn run(registry: &mut TransformRegistry) -> Result<Option<SensitivitySource>> {
        let derived = Self::derive(registry)?;
        match derived {
            Some((source, map)) => {
                tracing::info!(?source, "sensitivity map created");
                registry.insert_volume(keys::SENSITIVITY, map)?;
                Ok(Some(source))
            }
            None => {
                registry.warn(Warning::SensitivitySkipped {
                    reason: "no sensitivity image, calibration reference or bias field".into(),
                });
                Ok(None)
            }
        }
    }

    pub fn derive(registry: &TransformRegistry) -> Result<Option<(SensitivitySource, Volume)>> {
        let mask = registry.volume(keys::MASK)?;
        let mask = mask.as_deref();

        if let Some(isen) = registry.volume(keys::ISEN)? {
            let map = masked(&isen, isen.frame(0).to_owned(), mask)?;
            return Ok(Some((SensitivitySource::UserSupplied, map)));
        }

        let calib = registry.volume(keys::CALIB)?;
        let cref = registry.volume(keys::CREF)?;
        if let (Some(calib), Some(cref)) = (calib, cref) {
            calib.grid().ensure_same(cref.grid(), "calibration reference")?;
            let ratio = safe_divide(calib.frame(0), cref.frame(0));
            let map = masked(&calib, ratio, mask)?;
            return Ok(Some((SensitivitySource::CalibrationRatio, map)));
        }

        if let Some(bias) = registry.volume(keys::BIASFIELD)? {
            let ones = Array3::<f32>::ones(bias.frame(0).dim());
            let recip = safe_divide(ones.view(), bias.frame(0));
            let map = Volume::from_frame(recip, bias.grid().clone(), bias.metadata().clone())?;
            return Ok(Some((SensitivitySource::BiasField, map.with_name(keys::SENSITIVITY))));
        }

        Ok(None)
    }
}

/// Voxel-wise `a / b`, zero where `b` is zero.
fn safe_divide(a: ArrayView3<f32>, b: ArrayView3<f32>) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros(a.dim());
    Zip::from(&mut out)
        .and(&a)
        .and(&b)
        .par_for_each(|o, &a, &b| *o = if b == 0.0 { 0.0 } else { a / b });
    out
}

fn masked(template: &Volume, mut data: Array3<f32>, mask: Option<&Volume>) -> Result<Volume> {
    if let Some(mask) = mask {
        template.grid().ensure_same(mask.grid(), "mask")?;
        Zip::from(&mut data)
            .and(&mask.frame(0))
            .par_for_each(|v, &m| {
                if m == 0.0 {
                    *v = 0.0;
                }
            });
    }
    Ok(Volume::from_frame(data, template.grid().clone(), template.metadata().clone())?
        .with_name(keys::SENSITIVITY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ReferenceGrid;
    use crate::volume::Metadata;
    use ndarray::Array4;

    fn constant(name: &str, value: f32) -> Volume {
        let grid = ReferenceGrid::with_spacing([3, 3, 3], [1.0; 3]).unwrap();
        Volume::new(Array4::from_elem((3, 3, 3, 1), value), grid, Metadata::named(name)).unwrap()
    }

    fn half_mask() -> Volume {
        let grid = ReferenceGrid::with_spacing([3, 3, 3], [1.0; 3]).unwrap();
        let data =
            Array4::from_shape_fn((3, 3, 3, 1), |(x, _, _, _)| if x == 0 { 0.0 } else { 1.0 });
        Volume::new(data, grid, Metadata::named("mask")).unwrap()
    }

    #[test]
    fn user_image_wins_and_is_masked() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::ISEN, constant("isen", 0.8)).unwrap();
        registry.insert_volume(keys::CALIB, constant("calib", 10.0)).unwrap();
        registry.insert_volume(keys::CREF, constant("cref", 5.0)).unwrap();
        registry.insert_volume(keys::MASK, half_mask()).unwrap();

        let source = SensitivityMap::run(&mut registry).unwrap();
        assert_eq!(source, Some(SensitivitySource::UserSupplied));
        let map = registry.require_volume(keys::SENSITIVITY).unwrap();
        assert_eq!(map.data()[[0, 1, 1, 0]], 0.0);
        assert_eq!(map.data()[[2, 1, 1, 0]], 0.8);
    }

    #[test]
    fn calibration_ratio_without_mask() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::CALIB, constant("calib", 10.0)).unwrap();
        registry.insert_volume(keys::CREF, constant("cref", 4.0)).unwrap();
        let (source, map) = SensitivityMap::derive(&registry).unwrap().unwrap();
        assert_eq!(source, SensitivitySource::CalibrationRatio);
        assert!(map.data().iter().all(|&v| v == 2.5));
    }

    #[test]
    fn bias_field_is_inverted() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::BIASFIELD, constant("bias", 0.5)).unwrap();
        let (source, map) = SensitivityMap::derive(&registry).unwrap().unwrap();
        assert_eq!(source, SensitivitySource::BiasField);
        assert!(map.data().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn nothing_available_warns() {
        let mut registry = TransformRegistry::new();
        registry.insert_volume(keys::CALIB, constant("calib", 10.0)).unwrap();
        assert_eq!(SensitivityMap::run(&mut registry).unwrap(), None);
        assert!(matches!(registry.warnings(), [Warning::SensitivitySkipped { .. }]));
        assert!(!registry.contains(keys::SENSITIVITY));
    }
}
