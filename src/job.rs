//! Narration job: request, state machine, and terminal outcome.
//!
//! ```text
//! Pending → Segmenting → Classifying → Synthesizing → Assembling → Complete
//!    └──────────┴─────────────┴─────────────┴─────────────┴──────→ Failed
//! ```
//!
//! Only the orchestration in [`crate::narrator`] moves a job between states.
//! `Complete` and `Failed` are terminal; `Failed` remembers the furthest
//! state reached.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    backend::BackendRole,
    config::{JobOptions, OutputFormat},
    dispatch::SynthesisResult,
    error::{JobFailure, NarrationError, UnitFailure},
    segment::NarrationUnit,
    style::StyleTag,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Segmenting,
    Classifying,
    Synthesizing,
    Assembling,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }

    /// The stage after this one on the success path.
    pub fn next(self) -> Option<JobState> {
        match self {
            JobState::Pending => Some(JobState::Segmenting),
            JobState::Segmenting => Some(JobState::Classifying),
            JobState::Classifying => Some(JobState::Synthesizing),
            JobState::Synthesizing => Some(JobState::Assembling),
            JobState::Assembling => Some(JobState::Complete),
            JobState::Complete | JobState::Failed => None,
        }
    }

    pub fn can_transition_to(self, to: JobState) -> bool {
        match to {
            JobState::Failed => !self.is_terminal(),
            _ => self.next() == Some(to),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Segmenting => "segmenting",
            JobState::Classifying => "classifying",
            JobState::Synthesizing => "synthesizing",
            JobState::Assembling => "assembling",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// What the story collaborator hands over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NarrationRequest {
    pub story_text: String,
    /// Character offsets where a new page starts.
    #[serde(default)]
    pub page_boundaries: Vec<usize>,
    /// Enables the spoken intro/outro when set.
    #[serde(default)]
    pub title: Option<String>,
    /// Falls back to the narrator's defaults when absent.
    #[serde(default, alias = "options")]
    pub job_options: Option<JobOptions>,
}

impl NarrationRequest {
    pub fn new(story_text: impl Into<String>) -> Self {
        Self { story_text: story_text.into(), ..Default::default() }
    }

    pub fn with_page_boundaries(mut self, boundaries: Vec<usize>) -> Self {
        self.page_boundaries = boundaries;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.job_options = Some(options);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outputs
// ─────────────────────────────────────────────────────────────────────────────

/// The finished audio: either persisted and addressable, or handed back inline.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Stored { name: String, uri: String, path: PathBuf },
    InMemory { name: String, bytes: Vec<u8> },
}

impl Artifact {
    pub fn name(&self) -> &str {
        match self {
            Artifact::Stored { name, .. } | Artifact::InMemory { name, .. } => name,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match self {
            Artifact::Stored { uri, .. } => Some(uri),
            Artifact::InMemory { .. } => None,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Artifact::InMemory { bytes, .. } => Some(bytes),
            Artifact::Stored { .. } => None,
        }
    }
}

/// One row of the narration timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub unit_index: usize,
    pub source_page: Option<usize>,
    pub style: StyleTag,
    /// `None` for a silent placeholder.
    pub backend_used: Option<BackendRole>,
    pub placeholder: bool,
    pub attempts: u32,
    pub start_secs: f64,
    pub end_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrationSuccess {
    pub job_id: String,
    #[serde(skip)]
    pub artifact: Artifact,
    pub artifact_name: String,
    pub artifact_uri: Option<String>,
    pub output_format: OutputFormat,
    pub duration_seconds: f64,
    pub unit_count: usize,
    /// Units rendered as silence; non-zero means degraded but complete.
    pub failed_unit_count: usize,
    pub unit_failures: Vec<UnitFailure>,
    pub timeline: Vec<TimelineEntry>,
}

pub type JobOutcome = Result<NarrationSuccess, JobFailure>;

// ─────────────────────────────────────────────────────────────────────────────
// Job record
// ─────────────────────────────────────────────────────────────────────────────

/// Mutable record of one request, owned by its orchestration task.
#[derive(Debug, Clone)]
pub struct NarrationJob {
    pub job_id: String,
    state: JobState,
    furthest_state: JobState,
    pub story_text: String,
    pub units: Vec<NarrationUnit>,
    pub styles: Vec<StyleTag>,
    pub results: BTreeMap<usize, SynthesisResult>,
    pub unit_failures: Vec<UnitFailure>,
    pub artifact_uri: Option<String>,
    pub error: Option<JobFailure>,
}

impl NarrationJob {
    pub fn new(job_id: impl Into<String>, story_text: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Pending,
            furthest_state: JobState::Pending,
            story_text: story_text.into(),
            units: Vec::new(),
            styles: Vec::new(),
            results: BTreeMap::new(),
            unit_failures: Vec::new(),
            artifact_uri: None,
            error: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Last non-failed state the job reached.
    pub fn furthest_state(&self) -> JobState {
        self.furthest_state
    }

    pub fn transition(&mut self, to: JobState) -> Result<(), NarrationError> {
        if !self.state.can_transition_to(to) {
            return Err(NarrationError::IllegalTransition { from: self.state, to });
        }
        self.state = to;
        if to != JobState::Failed {
            self.furthest_state = to;
        }
        Ok(())
    }

    /// Move to `Failed` and record the structured error.
    pub fn fail(&mut self, error: &NarrationError) -> JobFailure {
        let failure = JobFailure::new(
            self.job_id.clone(),
            self.furthest_state,
            error,
            self.unit_failures.clone(),
        );
        self.state = JobState::Failed;
        self.artifact_uri = None;
        self.error = Some(failure.clone());
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut job = NarrationJob::new("j", "text");
        let mut state = JobState::Pending;
        while let Some(next) = state.next() {
            job.transition(next).unwrap();
            state = next;
        }
        assert_eq!(job.state(), JobState::Complete);
        assert!(job.state().is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        let mut job = NarrationJob::new("j", "text");
        assert!(matches!(
            job.transition(JobState::Synthesizing),
            Err(NarrationError::IllegalTransition { from: JobState::Pending, to: JobState::Synthesizing })
        ));
        job.transition(JobState::Segmenting).unwrap();
        assert!(job.transition(JobState::Pending).is_err());
        assert!(!JobState::Complete.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_failure_keeps_furthest_state() {
        let mut job = NarrationJob::new("j", "Once upon a time.");
        job.transition(JobState::Segmenting).unwrap();
        job.transition(JobState::Classifying).unwrap();
        let failure = job.fail(&NarrationError::Cancelled);
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(failure.furthest_state, JobState::Classifying);
        assert_eq!(job.story_text, "Once upon a time.");
        assert!(job.artifact_uri.is_none());
        assert!(job.transition(JobState::Synthesizing).is_err());
    }

    #[test]
    fn test_request_json() {
        let req: NarrationRequest = serde_json::from_str(
            r#"{"story_text": "Hi.", "page_boundaries": [10], "options": {"max_parallel_synthesis": 2}}"#,
        )
        .unwrap();
        assert_eq!(req.page_boundaries, vec![10]);
        assert_eq!(req.job_options.unwrap().max_parallel_synthesis, 2);
        assert_eq!(serde_json::to_value(JobState::Synthesizing).unwrap(), "synthesizing");
    }
}
