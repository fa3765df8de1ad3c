//! Error taxonomy for the narration pipeline.
//!
//! Three layers, from the inside out:
//!
//! | Type                | Scope           | Surfaces to the caller?                     |
//! |---------------------|-----------------|---------------------------------------------|
//! | [`BackendError`]    | one attempt     | only inside a [`UnitFailure`]               |
//! | [`SegmentationError`] | one request   | yes, as the job's cause                     |
//! | [`NarrationError`]  | one job         | yes, wrapped in a [`JobFailure`]            |

use serde::Serialize;

use crate::job::JobState;

/// Failure of a single backend call.
///
/// Every variant is recoverable at the unit level: the dispatcher retries the
/// primary backend and then tries the fallback before giving up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("backend rejected the request: {0}")]
    Rejected(String),

    #[error("backend returned empty or silent audio")]
    EmptyAudio,

    #[error("backend returned malformed audio: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Timeout { .. } => ErrorKind::BackendTimeout,
            _ => ErrorKind::BackendRejected,
        }
    }
}

/// The input text could not be turned into narration units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentationError {
    #[error("story text is empty")]
    EmptyInput,

    #[error("story text contains nothing speakable after normalisation")]
    NoSpeakableText,
}

/// One unit that exhausted both backends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub unit_index: usize,
    pub attempts: u32,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Job-level error. Any of these moves the job to `Failed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NarrationError {
    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("{failed} of {total} units failed, above the tolerated fraction {max_fraction}")]
    FailureThresholdExceeded {
        failed: usize,
        total: usize,
        max_fraction: f64,
    },

    #[error("assembly needs units 0..{expected}, missing {missing:?}")]
    AssemblyIncomplete { expected: usize, missing: Vec<usize> },

    #[error("encoding failed: {0}")]
    Encode(String),

    #[error("artifact storage failed: {0}")]
    Storage(String),

    #[error("invalid job options: {0}")]
    InvalidOptions(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("illegal job transition {from:?} -> {to:?}")]
    IllegalTransition { from: JobState, to: JobState },
}

impl NarrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NarrationError::Segmentation(_) => ErrorKind::SegmentationError,
            NarrationError::FailureThresholdExceeded { .. } => ErrorKind::UnitSynthesisFailed,
            NarrationError::AssemblyIncomplete { .. } => ErrorKind::AssemblyIncomplete,
            NarrationError::Encode(_) => ErrorKind::EncodeFailed,
            NarrationError::Storage(_) => ErrorKind::StorageFailed,
            NarrationError::InvalidOptions(_) => ErrorKind::InvalidOptions,
            NarrationError::Cancelled => ErrorKind::Cancelled,
            NarrationError::IllegalTransition { .. } => ErrorKind::JobFailed,
        }
    }
}

impl From<hound::Error> for NarrationError {
    fn from(e: hound::Error) -> Self {
        NarrationError::Encode(e.to_string())
    }
}

/// Wire name of an error, as reported in `error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SegmentationError,
    BackendTimeout,
    BackendRejected,
    UnitSynthesisFailed,
    AssemblyIncomplete,
    EncodeFailed,
    StorageFailed,
    InvalidOptions,
    Cancelled,
    JobFailed,
}

/// Terminal, user-visible failure record of a job (`JobFailed`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub job_id: String,
    pub error_kind: ErrorKind,
    pub furthest_state: JobState,
    pub message: String,
    /// Outermost cause first.
    pub causes: Vec<String>,
    /// Units that exhausted both backends, in index order.
    pub unit_failures: Vec<UnitFailure>,
}

impl JobFailure {
    pub fn new(
        job_id: impl Into<String>,
        furthest_state: JobState,
        error: &NarrationError,
        unit_failures: Vec<UnitFailure>,
    ) -> Self {
        let mut causes = vec![error.to_string()];
        causes.extend(unit_failures.iter().map(|f| {
            format!("unit {} ({:?}): {}", f.unit_index, f.error_kind, f.message)
        }));
        Self {
            job_id: job_id.into(),
            error_kind: error.kind(),
            furthest_state,
            message: error.to_string(),
            causes,
            unit_failures,
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job {} failed in {:?}: {}",
            self.job_id, self.furthest_state, self.message
        )
    }
}

impl std::error::Error for JobFailure {}
