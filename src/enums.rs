use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CorrectionError;

/// Interpolation kernel for the single resampling pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationKernel {
    Nearest,
    Trilinear,
    #[default]
    Sinc,
}

/// Phase-encode direction, one of the six signed voxel axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PhaseEncodeDirection {
    X,
    NegX,
    Y,
    NegY,
    Z,
    NegZ,
}

impl PhaseEncodeDirection {
    /// Unit vector of the direction in voxel axes.
    pub fn unit_vector(self) -> [i8; 3] {
        match self {
            PhaseEncodeDirection::X => [1, 0, 0],
            PhaseEncodeDirection::NegX => [-1, 0, 0],
            PhaseEncodeDirection::Y => [0, 1, 0],
            PhaseEncodeDirection::NegY => [0, -1, 0],
            PhaseEncodeDirection::Z => [0, 0, 1],
            PhaseEncodeDirection::NegZ => [0, 0, -1],
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            PhaseEncodeDirection::X => "x",
            PhaseEncodeDirection::NegX => "-x",
            PhaseEncodeDirection::Y => "y",
            PhaseEncodeDirection::NegY => "-y",
            PhaseEncodeDirection::Z => "z",
            PhaseEncodeDirection::NegZ => "-z",
        }
    }
}

impl fmt::Display for PhaseEncodeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for PhaseEncodeDirection {
    type Err = CorrectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "x" => Ok(PhaseEncodeDirection::X),
            "-x" => Ok(PhaseEncodeDirection::NegX),
            "y" => Ok(PhaseEncodeDirection::Y),
            "-y" => Ok(PhaseEncodeDirection::NegY),
            "z" => Ok(PhaseEncodeDirection::Z),
            "-z" => Ok(PhaseEncodeDirection::NegZ),
            other => Err(CorrectionError::InvalidInput(format!(
                "phase encode direction must be one of x, -x, y, -y, z, -z (got {other:?})"
            ))),
        }
    }
}

impl TryFrom<String> for PhaseEncodeDirection {
    type Error = CorrectionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PhaseEncodeDirection> for String {
    fn from(value: PhaseEncodeDirection) -> Self {
        value.code().to_string()
    }
}

/// Which distortion estimate produced the analysis-space warp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortionSource {
    Fieldmap,
    PhaseReversed,
}

/// Grid space a distortion warp was estimated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpSpace {
    /// ASL central-volume (analysis) space.
    Analysis,
    /// Calibration image space; needs bracketing by the calibration↔ASL
    /// transforms when motion correction used the calibration reference.
    Calibration,
}
