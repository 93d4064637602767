//! Folding an ordered list of rigid transforms and warp fields into a single
//! combined transform.
//!
//! Elements are listed closest-to-source first. The leading run of rigid
//! transforms is folded into one premultiplication matrix (`premat`). All
//! remaining elements, from the first warp onward, are resolved into one
//! dense displacement field on the reference grid by pulling every
//! reference voxel back through them in reverse order. Displacements are
//! interpolated during this step; image data is not, so applying the result
//! costs exactly one interpolation of the source image.

use std::sync::Arc;

use nalgebra::{Matrix4, Vector3};
use ndarray::{Array4, Axis, Zip};

use crate::error::{CorrectionError, Result};
use crate::geometry::grid::apply;
use crate::geometry::{Jacobian, ReferenceGrid, RigidTransform, WarpField};

#[derive(Debug, Clone)]
pub enum CorrectionElement {
    /// Linear map from the previous space into the next (forward).
    Rigid(RigidTransform),
    /// Pull-back warp from the next space into the previous one.
    Warp(Arc<WarpField>),
}

impl CorrectionElement {
    pub fn is_warp(&self) -> bool {
        matches!(self, CorrectionElement::Warp(_))
    }
}

/// One warp (optional), one premat and the warp's Jacobian.
///
/// For a reference-space world point `x` the source point is
/// `premat⁻¹(x + d(x))`, with `d = 0` when there is no warp.
#[derive(Debug, Clone)]
pub struct CombinedTransform {
    warp: Option<Arc<WarpField>>,
    premat: RigidTransform,
    premat_inverse: Matrix4<f64>,
    jacobian: Option<Arc<Jacobian>>,
}

impl CombinedTransform {
    pub fn identity() -> Self {
        Self {
            warp: None,
            premat: RigidTransform::identity(),
            premat_inverse: Matrix4::identity(),
            jacobian: None,
        }
    }

    pub fn new(
        warp: Option<Arc<WarpField>>,
        premat: RigidTransform,
        jacobian: Option<Arc<Jacobian>>,
    ) -> Result<Self> {
        let premat_inverse = *premat.inverse()?.matrix();
        Ok(Self {
            warp,
            premat,
            premat_inverse,
            jacobian,
        })
    }

    /// Pure matrix transform.
    pub fn linear(premat: RigidTransform) -> Result<Self> {
        Self::new(None, premat, None)
    }

    pub fn warp(&self) -> Option<&Arc<WarpField>> {
        self.warp.as_ref()
    }

    pub fn premat(&self) -> &RigidTransform {
        &self.premat
    }

    pub(crate) fn premat_inverse(&self) -> &Matrix4<f64> {
        &self.premat_inverse
    }

    pub fn jacobian(&self) -> Option<&Arc<Jacobian>> {
        self.jacobian.as_ref()
    }

    /// No warp and an exactly-identity premat: nothing to apply.
    pub fn is_identity(&self) -> bool {
        self.warp.is_none() && self.premat.is_identity()
    }

    /// Same warp and Jacobian with `leading` applied on the source side
    /// first. This is how one shared warp is reused with per-volume motion.
    pub fn after(&self, leading: &RigidTransform) -> Result<Self> {
        if leading.is_identity() {
            return Ok(self.clone());
        }
        Self::new(
            self.warp.clone(),
            leading.then(&self.premat),
            self.jacobian.clone(),
        )
    }
}

/// Composes correction elements into [`CombinedTransform`]s on one
/// reference grid.
#[derive(Debug, Clone)]
pub struct TransformComposer {
    reference: ReferenceGrid,
}

impl TransformComposer {
    pub fn new(reference: ReferenceGrid) -> Result<Self> {
        if reference.is_empty() {
            return Err(CorrectionError::EmptyReferenceGrid);
        }
        Ok(Self { reference })
    }

    pub fn reference(&self) -> &ReferenceGrid {
        &self.reference
    }

    pub fn compose(&self, elements: &[CorrectionElement]) -> Result<CombinedTransform> {
        if elements
            .iter()
            .any(|e| matches!(e, CorrectionElement::Warp(w) if w.grid().is_empty()))
        {
            return Err(CorrectionError::EmptyReferenceGrid);
        }
        let split = elements
            .iter()
            .position(CorrectionElement::is_warp)
            .unwrap_or(elements.len());
        let (leading, tail) = elements.split_at(split);

        let premat = leading
            .iter()
            .filter_map(|e| match e {
                CorrectionElement::Rigid(t) => Some(t),
                CorrectionElement::Warp(_) => None,
            })
            .fold(RigidTransform::identity(), |acc, t| acc.then(t));

        if tail.is_empty() {
            if elements.is_empty() {
                return Ok(CombinedTransform::identity());
            }
            tracing::debug!(rigid = leading.len(), "composed pure matrix transform");
            return CombinedTransform::linear(premat);
        }

        let warp = self.resolve_tail(tail)?;
        let jacobian = warp.jacobian();
        let (lo, hi) = jacobian.min_max();
        tracing::debug!(
            rigid = leading.len(),
            tail = tail.len(),
            jacobian_min = lo,
            jacobian_max = hi,
            "composed combined warp"
        );
        CombinedTransform::new(Some(Arc::new(warp)), premat, Some(Arc::new(jacobian)))
    }

    /// Net displacement field for `tail` (which starts with a warp) on the
    /// reference grid.
    fn resolve_tail(&self, tail: &[CorrectionElement]) -> Result<WarpField> {
        enum Step<'a> {
            Inverse(Matrix4<f64>),
            Pull(&'a WarpField),
        }

        let steps = tail
            .iter()
            .rev()
            .map(|e| match e {
                CorrectionElement::Rigid(t) => t.inverse().map(|inv| Step::Inverse(*inv.matrix())),
                CorrectionElement::Warp(w) => Ok(Step::Pull(w.as_ref())),
            })
            .collect::<Result<Vec<_>>>()?;

        let [nx, ny, nz] = self.reference.shape();
        let grid = &self.reference;
        let mut displacement = Array4::<f32>::zeros((nx, ny, nz, 3));
        Zip::indexed(displacement.lanes_mut(Axis(3))).par_for_each(|(i, j, k), mut lane| {
            let x = grid.voxel_to_world(&Vector3::new(i as f64, j as f64, k as f64));
            let p = steps.iter().fold(x, |p, step| match step {
                Step::Inverse(m) => apply(m, &p),
                Step::Pull(w) => w.pull_back(&p),
            });
            let d = p - x;
            lane[0] = d.x as f32;
            lane[1] = d.y as f32;
            lane[2] = d.z as f32;
        });

        WarpField::new(self.reference.clone(), displacement)
    }
}
