//! Progress events and their wire representation.
//!
//! A [`ProgressEvent`] is the unit the [`crate::events::EventBus`] stores and
//! fans out. Events are built by the controller with [`ProgressEvent::new`]
//! and the builder methods below; the bus stamps `job_id` and `seq` when it
//! appends, so sequence numbers can only come from one place.
//!
//! # Why a separate wire type?
//!
//! Clients of `POST /convert/stream` expect the small, stable shape
//! `{"status", "message", "data"?}`. The internal event carries much more
//! (stage, sequence, timestamps, an `Arc` to the artifact). [`WireEvent`]
//! is the projection, so the internal record can grow without breaking
//! the stream contract.

use crate::error::ErrorKind;
use crate::job::{JobId, JobState};
use crate::pipeline::extract::Artifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One immutable entry in a job's event log.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Owning job. Stamped by the bus.
    pub job_id: JobId,
    /// Strictly increasing per job, starting at 1. Stamped by the bus.
    pub seq: u64,
    /// Lifecycle state the job was in when this event was emitted.
    pub stage: JobState,
    /// Human-readable description.
    pub message: String,
    /// The result artifact; present only on the terminal `Complete` event.
    pub payload: Option<Arc<Artifact>>,
    /// Error classification; present only on the terminal `Failed` event.
    pub error: Option<ErrorKind>,
    /// Low-priority diagnostic line (raw engine output).
    pub detail: bool,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: JobState, message: impl Into<String>) -> Self {
        Self {
            job_id: JobId::default(),
            seq: 0,
            stage,
            message: message.into(),
            payload: None,
            error: None,
            detail: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, artifact: Arc<Artifact>) -> Self {
        self.payload = Some(artifact);
        self
    }

    pub fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error = Some(kind);
        self
    }

    pub fn as_detail(mut self) -> Self {
        self.detail = true;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Status field of a wire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    Processing,
    Complete,
    Error,
}

/// One line of the live stream: `{"status": ..., "message": ..., "data"?: ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub status: WireStatus,
    pub message: String,
    /// Base64 artifact on `complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl From<&ProgressEvent> for WireEvent {
    fn from(event: &ProgressEvent) -> Self {
        let status = match event.stage {
            JobState::Complete => WireStatus::Complete,
            JobState::Failed => WireStatus::Error,
            _ => WireStatus::Processing,
        };
        WireEvent {
            status,
            message: event.message.clone(),
            data: event.payload.as_ref().map(|a| a.to_base64()),
        }
    }
}
