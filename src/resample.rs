//! Applying a [`CombinedTransform`] to image data in one interpolation pass.

use nalgebra::{Matrix4, Vector3};
use ndarray::parallel::prelude::*;
use ndarray::{Array4, ArrayView3, ArrayViewMut3, Axis, Zip};

use crate::compose::CombinedTransform;
use crate::enums::InterpolationKernel;
use crate::error::{CorrectionError, Result};
use crate::geometry::grid::apply;
use crate::geometry::ReferenceGrid;
use crate::interpolator::Interpolator;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, Default)]
pub struct Resampler {
    kernel: InterpolationKernel,
}

impl Resampler {
    pub fn new(kernel: InterpolationKernel) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> InterpolationKernel {
        self.kernel
    }

    /// Resample every timepoint of `image` with the same transform.
    pub fn resample(
        &self,
        image: &Volume,
        transform: &CombinedTransform,
        reference: &ReferenceGrid,
    ) -> Result<Volume> {
        let transforms = vec![transform.clone(); image.n_volumes()];
        self.resample_series(image, &transforms, reference)
    }

    /// Resample timepoint `t` of `image` with `transforms[t]`. Volumes are
    /// processed in parallel, each writing its own slot of the output.
    pub fn resample_series(
        &self,
        image: &Volume,
        transforms: &[CombinedTransform],
        reference: &ReferenceGrid,
    ) -> Result<Volume> {
        if reference.is_empty() {
            return Err(CorrectionError::EmptyReferenceGrid);
        }
        if transforms.len() != image.n_volumes() {
            return Err(CorrectionError::TransformCountMismatch {
                expected: image.n_volumes(),
                found: transforms.len(),
            });
        }
        for transform in transforms {
            Self::validate(transform, reference)?;
        }

        let [nx, ny, nz] = reference.shape();
        let mut output = Array4::<f32>::zeros((nx, ny, nz, image.n_volumes()));
        output
            .axis_iter_mut(Axis(3))
            .into_par_iter()
            .zip(transforms.par_iter())
            .enumerate()
            .for_each(|(t, (out, transform))| {
                self.resample_frame(image.frame(t), image.grid(), transform, reference, out);
            });

        image.derived_on_grid(reference.clone(), output)
    }

    fn validate(transform: &CombinedTransform, reference: &ReferenceGrid) -> Result<()> {
        if let Some(warp) = transform.warp() {
            reference.ensure_same(warp.grid(), "combined warp")?;
        }
        if let Some(jacobian) = transform.jacobian() {
            reference.ensure_same(jacobian.grid(), "jacobian")?;
        }
        Ok(())
    }

    fn resample_frame(
        &self,
        source: ArrayView3<f32>,
        source_grid: &ReferenceGrid,
        transform: &CombinedTransform,
        reference: &ReferenceGrid,
        mut out: ArrayViewMut3<f32>,
    ) {
        if transform.is_identity() && source_grid.same_geometry(reference) {
            out.assign(&source);
            return;
        }

        // world(reference) -> premat⁻¹ -> world(source) -> voxel(source)
        let to_source_voxel: Matrix4<f64> =
            source_grid.inverse_affine() * transform.premat_inverse();
        let kernel = self.kernel;

        match transform.warp() {
            None => {
                let voxel_map = to_source_voxel * reference.affine();
                Zip::indexed(&mut out).par_for_each(|(i, j, k), value| {
                    let s = apply(&voxel_map, &Vector3::new(i as f64, j as f64, k as f64));
                    *value = Interpolator::sample(&source, [s.x, s.y, s.z], kernel);
                });
            }
            Some(warp) => {
                Zip::indexed(&mut out).par_for_each(|(i, j, k), value| {
                    let x = reference.voxel_to_world(&Vector3::new(i as f64, j as f64, k as f64));
                    let y = x + warp.displacement_at_voxel(i, j, k);
                    let s = apply(&to_source_voxel, &y);
                    *value = Interpolator::sample(&source, [s.x, s.y, s.z], kernel);
                });
            }
        }

        if let Some(jacobian) = transform.jacobian() {
            Zip::from(&mut out)
                .and(jacobian.values())
                .par_for_each(|value, &j| *value *= j);
        }
    }
}
