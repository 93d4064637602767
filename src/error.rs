use std::fmt;

use thiserror::Error;

/// Failure reported by an external estimator (motion, nonlinear registration
/// or phase-reversed distortion estimation).
#[derive(Debug, Clone, Error)]
pub enum EstimatorError {
    #[error("failed to converge on volume {volume}")]
    NoConvergence { volume: usize },

    #[error("expected {expected} transforms, estimator returned {found}")]
    TransformCount { expected: usize, found: usize },

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("motion estimation failed{}: {reason}", volume_suffix(.volume))]
    MotionEstimation {
        volume: Option<usize>,
        reason: String,
    },

    #[error("{stage} failed: {source}")]
    Estimator {
        stage: &'static str,
        #[source]
        source: EstimatorError,
    },

    #[error("grid has no voxels")]
    EmptyReferenceGrid,

    #[error("incompatible grid for {what}: expected {expected:?}, found {found:?}")]
    IncompatibleGrid {
        what: &'static str,
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("expected {expected} transforms (one per volume), got {found}")]
    TransformCountMismatch { expected: usize, found: usize },

    #[error("number of bolus durations ({bolus}) does not match the number of TIs ({tis})")]
    BolusCountMismatch { bolus: usize, tis: usize },

    #[error("required input missing: {0}")]
    MissingInput(String),

    #[error("options {0} and {1} cannot be used together")]
    MutuallyExclusive(&'static str, &'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transform {0} is singular and cannot be inverted")]
    SingularTransform(String),

    #[error("registry key {0} is already set")]
    AlreadyRegistered(String),

    #[error("registry key {key} does not hold a {expected}")]
    WrongKind { key: String, expected: &'static str },

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("configuration parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn volume_suffix(volume: &Option<usize>) -> String {
    volume
        .map(|v| format!(" on volume {v}"))
        .unwrap_or_default()
}

impl CorrectionError {
    /// Wrap an estimator failure from the motion stage, keeping the volume
    /// index when the estimator reported one.
    pub fn motion(err: EstimatorError) -> Self {
        let volume = match &err {
            EstimatorError::NoConvergence { volume } => Some(*volume),
            _ => None,
        };
        CorrectionError::MotionEstimation {
            volume,
            reason: err.to_string(),
        }
    }
}

/// Degraded conditions: the affected optional correction is dropped and the
/// run continues.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    PhaseReversedSkipped { reason: String },
    SensitivitySkipped { reason: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::PhaseReversedSkipped { reason } => {
                write!(f, "phase-encode-reversed distortion correction skipped: {reason}")
            }
            Warning::SensitivitySkipped { reason } => {
                write!(f, "sensitivity correction skipped: {reason}")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CorrectionError>;
