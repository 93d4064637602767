//! Named, write-once store for the images, transforms and warps produced
//! during one correction run.
//!
//! Every stage receives the registry by reference. Once a key is written its
//! value is never replaced, so values handed out as `Arc`s can be read from
//! parallel resampling tasks without locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CorrectionError, Result, Warning};
use crate::geometry::{Jacobian, ReferenceSpace, RigidTransform, WarpField};
use crate::volume::Volume;

/// Well-known registry keys.
pub mod keys {
    pub const ASLDATA_ORIG: &str = "asldata_orig";
    pub const CALIB_ORIG: &str = "calib_orig";
    pub const CREF_ORIG: &str = "cref_orig";
    pub const CBLIP_ORIG: &str = "cblip_orig";

    pub const STRUCTURAL: &str = "struc";
    pub const MASK: &str = "mask";
    pub const FMAP: &str = "fmap";
    pub const FMAPMAG: &str = "fmapmag";
    pub const FMAPMAGBRAIN: &str = "fmapmagbrain";
    pub const ASL2STRUCT: &str = "asl2struct";
    pub const BIASFIELD: &str = "biasfield";
    pub const ISEN: &str = "isen";

    pub const ASLDATA_MC_MATS: &str = "asldata_mc_mats";
    pub const ASL2CALIB: &str = "asl2calib";
    pub const CALIB2ASL: &str = "calib2asl";
    pub const FMAP2STRUCT: &str = "fmap2struct";
    pub const FMAP_WARP: &str = "fmap_warp";
    pub const CBLIP_WARP: &str = "cblip_warp";
    pub const GDC_WARP: &str = "gdc_warp";

    pub const REFERENCE: &str = "reference";
    pub const TOTAL_WARP: &str = "total_warp";
    pub const JACOBIAN: &str = "jacobian";
    pub const ASLDATA: &str = "asldata";
    pub const CALIB: &str = "calib";
    pub const CREF: &str = "cref";
    pub const CBLIP: &str = "cblip";
    pub const SENSITIVITY: &str = "sensitivity";
}

#[derive(Debug, Clone)]
pub enum Entry {
    Volume(Arc<Volume>),
    Rigid(RigidTransform),
    RigidSeries(Arc<[RigidTransform]>),
    Warp(Arc<WarpField>),
    Jacobian(Arc<Jacobian>),
    Reference(ReferenceSpace),
}

impl Entry {
    fn kind(&self) -> &'static str {
        match self {
            Entry::Volume(_) => "volume",
            Entry::Rigid(_) => "rigid transform",
            Entry::RigidSeries(_) => "rigid transform series",
            Entry::Warp(_) => "warp field",
            Entry::Jacobian(_) => "jacobian",
            Entry::Reference(_) => "reference space",
        }
    }
}

#[derive(Debug, Default)]
pub struct TransformRegistry {
    entries: BTreeMap<String, Entry>,
    warnings: Vec<Warning>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entry` under `key`. Fails if the key already holds a value.
    pub fn insert(&mut self, key: impl Into<String>, entry: Entry) -> Result<()> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(CorrectionError::AlreadyRegistered(key));
        }
        tracing::debug!(key = %key, kind = entry.kind(), "registered");
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn insert_volume(
        &mut self,
        key: impl Into<String>,
        volume: impl Into<Arc<Volume>>,
    ) -> Result<()> {
        self.insert(key, Entry::Volume(volume.into()))
    }

    pub fn insert_rigid(
        &mut self,
        key: impl Into<String>,
        transform: RigidTransform,
    ) -> Result<()> {
        self.insert(key, Entry::Rigid(transform))
    }

    pub fn insert_rigid_series(
        &mut self,
        key: impl Into<String>,
        transforms: impl Into<Arc<[RigidTransform]>>,
    ) -> Result<()> {
        self.insert(key, Entry::RigidSeries(transforms.into()))
    }

    pub fn insert_warp(
        &mut self,
        key: impl Into<String>,
        warp: impl Into<Arc<WarpField>>,
    ) -> Result<()> {
        self.insert(key, Entry::Warp(warp.into()))
    }

    pub fn insert_jacobian(
        &mut self,
        key: impl Into<String>,
        jacobian: impl Into<Arc<Jacobian>>,
    ) -> Result<()> {
        self.insert(key, Entry::Jacobian(jacobian.into()))
    }

    pub fn insert_reference(
        &mut self,
        key: impl Into<String>,
        reference: ReferenceSpace,
    ) -> Result<()> {
        self.insert(key, Entry::Reference(reference))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn typed<T>(
        &self,
        key: &str,
        expected: &'static str,
        pick: impl FnOnce(&Entry) -> Option<T>,
    ) -> Result<Option<T>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => pick(entry).map(Some).ok_or_else(|| CorrectionError::WrongKind {
                key: key.to_string(),
                expected,
            }),
        }
    }

    pub fn volume(&self, key: &str) -> Result<Option<Arc<Volume>>> {
        self.typed(key, "volume", |e| match e {
            Entry::Volume(v) => Some(Arc::clone(v)),
            _ => None,
        })
    }

    pub fn rigid(&self, key: &str) -> Result<Option<RigidTransform>> {
        self.typed(key, "rigid transform", |e| match e {
            Entry::Rigid(t) => Some(*t),
            _ => None,
        })
    }

    pub fn rigid_series(&self, key: &str) -> Result<Option<Arc<[RigidTransform]>>> {
        self.typed(key, "rigid transform series", |e| match e {
            Entry::RigidSeries(s) => Some(Arc::clone(s)),
            _ => None,
        })
    }

    pub fn warp(&self, key: &str) -> Result<Option<Arc<WarpField>>> {
        self.typed(key, "warp field", |e| match e {
            Entry::Warp(w) => Some(Arc::clone(w)),
            _ => None,
        })
    }

    pub fn jacobian(&self, key: &str) -> Result<Option<Arc<Jacobian>>> {
        self.typed(key, "jacobian", |e| match e {
            Entry::Jacobian(j) => Some(Arc::clone(j)),
            _ => None,
        })
    }

    pub fn reference(&self, key: &str) -> Result<Option<ReferenceSpace>> {
        self.typed(key, "reference space", |e| match e {
            Entry::Reference(r) => Some(r.clone()),
            _ => None,
        })
    }

    pub fn require_volume(&self, key: &str) -> Result<Arc<Volume>> {
        self.volume(key)?
            .ok_or_else(|| CorrectionError::MissingInput(key.to_string()))
    }

    pub fn require_rigid(&self, key: &str) -> Result<RigidTransform> {
        self.rigid(key)?
            .ok_or_else(|| CorrectionError::MissingInput(key.to_string()))
    }

    /// Record a degraded condition. Warnings are append-only.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}
