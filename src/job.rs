//! Job identity, lifecycle states, and the single-writer job record.
//!
//! ```text
//! Queued ─▶ Validating ─▶ Preparing ─▶ Running ─▶ Extracting ─▶ Complete
//!    │           │            │           │            │
//!    └───────────┴────────────┴───────────┴────────────┴──────▶ Failed
//! ```
//!
//! Only the controller's per-job task holds a `&mut Job`; everyone else sees
//! the lifecycle through the events it publishes.

use crate::error::GatewayError;
use crate::pipeline::input::DocumentKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique job identifier. Issued once per accepted request, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Validating,
    /// Workspace allocation and optional format pre-conversion.
    Preparing,
    /// The engine subprocess is running.
    Running,
    /// Reading the result artifact out of the workspace.
    Extracting,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Validating)
            | (Validating, Preparing)
            | (Preparing, Running)
            | (Running, Extracting)
            | (Extracting, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Validating => "validating",
            JobState::Preparing => "preparing",
            JobState::Running => "running",
            JobState::Extracting => "extracting",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client sent, as far as the orchestrator cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDescriptor {
    /// Client-supplied file name (unsanitised; the workspace sanitises on use).
    pub filename: String,
    /// Upload size in bytes.
    pub size: u64,
    /// Media type from the multipart part header, if any.
    pub declared_media_type: Option<String>,
    /// Detected document kind, filled in by validation.
    pub kind: Option<DocumentKind>,
}

/// The job record.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    state: JobState,
    input: InputDescriptor,
    workspace: Option<PathBuf>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result_size: Option<usize>,
    error: Option<GatewayError>,
}

impl Job {
    pub fn new(input: InputDescriptor) -> Self {
        Self {
            id: JobId::new(),
            state: JobState::Queued,
            input,
            workspace: None,
            created_at: Utc::now(),
            completed_at: None,
            result_size: None,
            error: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn input(&self) -> &InputDescriptor {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut InputDescriptor {
        &mut self.input
    }

    pub fn set_workspace(&mut self, path: PathBuf) {
        self.workspace = Some(path);
    }

    /// Move to `next`, rejecting anything the state machine does not allow.
    pub fn advance(&mut self, next: JobState) -> Result<(), GatewayError> {
        if !self.state.can_transition_to(next) {
            return Err(GatewayError::Internal(format!(
                "illegal job transition {} → {} for job {}",
                self.state, next, self.id
            )));
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a successful result and move to `Complete`.
    pub fn complete(&mut self, result_size: usize) -> Result<(), GatewayError> {
        self.advance(JobState::Complete)?;
        self.result_size = Some(result_size);
        Ok(())
    }

    /// Record the terminal error and move to `Failed`.
    pub fn fail(&mut self, error: GatewayError) -> Result<(), GatewayError> {
        self.advance(JobState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Compact, serialisable view for structured logs.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            state: self.state,
            filename: self.input.filename.clone(),
            size: self.input.size,
            kind: self.input.kind,
            workspace: self.workspace.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            duration_ms: self
                .completed_at
                .map(|done| (done - self.created_at).num_milliseconds().max(0) as u64),
            result_size: self.result_size,
            error: self.error.as_ref().map(|e| e.kind().as_str()),
        }
    }
}

/// Snapshot of a job for logging and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub state: JobState,
    pub filename: String,
    pub size: u64,
    pub kind: Option<DocumentKind>,
    pub workspace: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result_size: Option<usize>,
    pub error: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn descriptor() -> InputDescriptor {
        InputDescriptor {
            filename: "score.png".into(),
            size: 42,
            declared_media_type: Some("image/png".into()),
            kind: None,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = Job::new(descriptor());
        assert_eq!(job.state(), JobState::Queued);
        for next in [
            JobState::Validating,
            JobState::Preparing,
            JobState::Running,
            JobState::Extracting,
        ] {
            job.advance(next).unwrap();
        }
        job.set_workspace(PathBuf::from("/tmp/omr-job-x"));
        job.complete(10).unwrap();
        assert_eq!(job.state(), JobState::Complete);
        assert_eq!(
            job.summary().workspace.as_deref(),
            Some(std::path::Path::new("/tmp/omr-job-x"))
        );
        assert!(job.summary().completed_at.is_some());
        assert_eq!(job.summary().result_size, Some(10));
    }

    #[test]
    fn every_non_terminal_state_can_fail() {
        for state in [
            JobState::Queued,
            JobState::Validating,
            JobState::Preparing,
            JobState::Running,
            JobState::Extracting,
        ] {
            assert!(state.can_transition_to(JobState::Failed), "{state}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = Job::new(descriptor());
        job.fail(GatewayError::Timeout {
            limit: Duration::from_secs(1),
        })
        .unwrap();
        assert!(job.advance(JobState::Running).is_err());
        assert!(job.advance(JobState::Failed).is_err());
        assert_eq!(job.summary().error, Some("TIMEOUT"));
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let mut job = Job::new(descriptor());
        let err = job.advance(JobState::Running).unwrap_err();
        assert!(err.to_string().contains("queued → running"), "got: {err}");
    }

    #[test]
    fn job_ids_are_unique_and_parse_back() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        let parsed: JobId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
