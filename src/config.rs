//! Run configuration for the correction driver.
//!
//! Loaded from JSON. [`CorrectionConfig::validate`] is the pre-flight check:
//! it runs before any image is read or any estimator is invoked.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::distortion::DistortionOptions;
use crate::enums::InterpolationKernel;
use crate::error::{CorrectionError, Result};

/// Bolus duration used when none is given, in seconds.
pub const DEFAULT_BOLUS: f64 = 1.8;

/// Input images.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub asldata: PathBuf,
    pub calib: Option<PathBuf>,
    pub cref: Option<PathBuf>,
    /// Phase-encode-reversed calibration image.
    pub cblip: Option<PathBuf>,
    pub structural: Option<PathBuf>,
    pub mask: Option<PathBuf>,
    pub fmap: Option<PathBuf>,
    pub fmapmag: Option<PathBuf>,
    pub fmapmagbrain: Option<PathBuf>,
    pub biasfield: Option<PathBuf>,
    /// User-supplied sensitivity image.
    pub isen: Option<PathBuf>,
    /// Image whose grid the outputs are resampled onto instead of the ASL
    /// series' own grid.
    pub reference: Option<PathBuf>,
}

/// Transforms estimated outside this tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Stacked `(4n, 4)` motion matrices, volume→calibration when a
    /// calibration image is given, else volume→middle volume.
    pub motion_matrices: Option<PathBuf>,
    pub asl2struct: Option<PathBuf>,
    /// Fieldmap distortion warp on the structural grid.
    pub fmap_warp: Option<PathBuf>,
    /// Phase-reversed distortion warp on the calibration grid.
    pub cblip_warp: Option<PathBuf>,
    /// Gradient distortion warp.
    pub gdc_warp: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionConfig {
    pub inputs: InputConfig,
    #[serde(default)]
    pub transforms: TransformConfig,
    #[serde(default)]
    pub distortion: DistortionOptions,
    #[serde(default)]
    pub interpolation: InterpolationKernel,
    /// Inversion times in seconds.
    #[serde(default)]
    pub tis: Vec<f64>,
    /// Bolus duration(s) in seconds.
    #[serde(default)]
    pub bolus: Vec<f64>,
    /// Derive a sensitivity map after correction.
    #[serde(default)]
    pub senscorr: bool,
    pub output_dir: PathBuf,
}

impl CorrectionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CorrectionConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check inputs exist and options are consistent.
    pub fn validate(&self) -> Result<()> {
        require_file("inputs.asldata", &self.inputs.asldata)?;
        for (name, path) in self.optional_paths() {
            if let Some(path) = path {
                require_file(name, path)?;
            }
        }

        let inputs = &self.inputs;
        let triplet = [&inputs.fmap, &inputs.fmapmag, &inputs.fmapmagbrain];
        let given = triplet.iter().filter(|p| p.is_some()).count();
        if given > 0 && given < 3 {
            let missing = ["inputs.fmap", "inputs.fmapmag", "inputs.fmapmagbrain"]
                .into_iter()
                .zip(triplet)
                .find_map(|(name, p)| p.is_none().then_some(name))
                .unwrap_or("inputs.fmap");
            return Err(CorrectionError::MissingInput(missing.into()));
        }
        if inputs.fmap.is_some() {
            if inputs.cblip.is_some() {
                return Err(CorrectionError::MutuallyExclusive("fmap", "cblip"));
            }
            if inputs.structural.is_none() {
                return Err(CorrectionError::MissingInput("inputs.structural".into()));
            }
            if self.transforms.asl2struct.is_none() {
                return Err(CorrectionError::MissingInput("transforms.asl2struct".into()));
            }
            if self.transforms.fmap_warp.is_none() {
                return Err(CorrectionError::MissingInput("transforms.fmap_warp".into()));
            }
        }
        if inputs.cref.is_some() && inputs.calib.is_none() {
            return Err(CorrectionError::MissingInput("inputs.calib".into()));
        }

        self.bolus_durations()?;
        Ok(())
    }

    /// Effective bolus durations: the default when none are given, a single
    /// value shared by all TIs, or one per TI.
    pub fn bolus_durations(&self) -> Result<Vec<f64>> {
        match self.bolus.len() {
            0 => Ok(vec![DEFAULT_BOLUS]),
            1 => Ok(self.bolus.clone()),
            n if n == self.tis.len() => Ok(self.bolus.clone()),
            n => Err(CorrectionError::BolusCountMismatch {
                bolus: n,
                tis: self.tis.len(),
            }),
        }
    }

    fn optional_paths(&self) -> [(&'static str, &Option<PathBuf>); 16] {
        let i = &self.inputs;
        let t = &self.transforms;
        [
            ("inputs.calib", &i.calib),
            ("inputs.cref", &i.cref),
            ("inputs.cblip", &i.cblip),
            ("inputs.structural", &i.structural),
            ("inputs.mask", &i.mask),
            ("inputs.fmap", &i.fmap),
            ("inputs.fmapmag", &i.fmapmag),
            ("inputs.fmapmagbrain", &i.fmapmagbrain),
            ("inputs.biasfield", &i.biasfield),
            ("inputs.isen", &i.isen),
            ("inputs.reference", &i.reference),
            ("transforms.motion_matrices", &t.motion_matrices),
            ("transforms.asl2struct", &t.asl2struct),
            ("transforms.fmap_warp", &t.fmap_warp),
            ("transforms.cblip_warp", &t.cblip_warp),
            ("transforms.gdc_warp", &t.gdc_warp),
        ]
    }
}

fn require_file(name: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CorrectionError::MissingInput(format!("{name} ({})", path.display())))
    }
}
