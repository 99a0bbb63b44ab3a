//! Error types for the edgequake-omr orchestrator.
//!
//! Three layers reflect three distinct failure modes:
//!
//! * [`ValidationError`]: the upload itself is unacceptable (too large,
//!   empty, wrong type). Detected before any workspace or permit exists, so
//!   nothing has to be cleaned up.
//!
//! * [`EngineFailure`]: the external engine (or the pre-conversion tool)
//!   ran but did not produce a result. Always carries a [`DiagnosticTail`]
//!   so operators can see what the engine printed before it gave up.
//!
//! * [`GatewayError`]: the top-level taxonomy every public operation
//!   returns. Each variant maps to exactly one HTTP status in
//!   [`crate::server`] and to exactly one terminal `error` event on the bus.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// All errors returned by the orchestration core.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    // ── Admission errors (no side effects) ────────────────────────────────
    /// The upload was rejected before any resource was allocated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No concurrency slot became free within the permitted wait.
    #[error("Service busy: no engine slot became free within {}s ({capacity} jobs already running)", waited.as_secs())]
    ServiceBusy { waited: Duration, capacity: usize },

    // ── Errors after allocation (cleanup required) ───────────────────────
    /// The per-job workspace could not be created.
    #[error("Could not allocate a workspace: {0}")]
    ResourceExhausted(String),

    /// The engine or pre-conversion tool did not produce a result.
    #[error("{0}")]
    Engine(EngineFailure),

    /// The job exceeded its wall-clock budget and the engine was killed.
    #[error("Conversion timed out after {}s; the engine was terminated", limit.as_secs())]
    Timeout { limit: Duration },

    /// The observer disconnected and the job was configured to cancel.
    #[error("Conversion cancelled: the client disconnected")]
    Cancelled,

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected orchestration failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reasons an upload is refused at the door.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Upload exceeds the configured byte limit.
    #[error("File size ({:.1}MB) exceeds maximum allowed size ({:.1}MB)", mib(*size), mib(*limit))]
    TooLarge { size: u64, limit: u64 },

    /// Zero-byte upload.
    #[error("Uploaded file '{filename}' is empty")]
    Empty { filename: String },

    /// Extension / declared media type is not one the engine accepts.
    #[error("Unsupported file type '{filename}' ({media_type}); expected a PDF or an image")]
    UnsupportedType { filename: String, media_type: String },

    /// The bytes do not look like the declared document type.
    #[error("File '{filename}' does not look like a {expected}; first bytes: {magic:02x?}")]
    ContentMismatch {
        filename: String,
        expected: &'static str,
        magic: Vec<u8>,
    },

    /// The multipart request carried no `file` field.
    #[error("Request has no 'file' field")]
    MissingFile,
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// Why an external process failed to produce its artifact.
#[derive(Debug, Clone, Error)]
pub enum EngineFailure {
    /// The process could not be started at all (missing binary, EACCES).
    #[error("Failed to launch '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// Ordinary non-zero exit.
    #[error("Engine exited with code {code}{tail}")]
    NonZeroExit { code: i32, tail: DiagnosticTail },

    /// Exit code zero but the expected output file is absent.
    #[error("Output file not found after engine processing (expected '{expected}'){tail}")]
    MissingArtifact { expected: String, tail: DiagnosticTail },

    /// The host killed the process, typically for exceeding a resource limit.
    #[error("Engine was killed by the host ({reason}); it likely exceeded its resource limit{tail}")]
    KilledByLimit { reason: String, tail: DiagnosticTail },

    /// The format pre-conversion step failed.
    #[error("Pre-conversion failed: {detail}{tail}")]
    Preprocess { detail: String, tail: DiagnosticTail },
}

impl EngineFailure {
    /// Short machine-readable sub-reason.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineFailure::Spawn { .. } => "spawn_failed",
            EngineFailure::NonZeroExit { .. } => "non_zero_exit",
            EngineFailure::MissingArtifact { .. } => "missing_artifact",
            EngineFailure::KilledByLimit { .. } => "killed_by_limit",
            EngineFailure::Preprocess { .. } => "preprocess_failed",
        }
    }
}

/// The last few lines a process printed, kept for error reports.
///
/// Renders as an indented block after the main message, or as nothing when
/// the process was silent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticTail(pub Vec<String>);

impl DiagnosticTail {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for DiagnosticTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "\nLast engine output:")?;
        for line in &self.0 {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}

/// Stable classification of a [`GatewayError`], used for wire codes and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ResourceExhausted,
    ServiceBusy,
    Engine,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::ServiceBusy => "SERVICE_BUSY",
            ErrorKind::Engine => "ENGINE_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::ServiceBusy { .. } => ErrorKind::ServiceBusy,
            GatewayError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            GatewayError::Engine(_) => ErrorKind::Engine,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Cancelled => ErrorKind::Cancelled,
            GatewayError::InvalidConfig(_) | GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for errors raised before any workspace or permit was taken.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation(_) | GatewayError::ServiceBusy { .. }
        )
    }
}

impl From<EngineFailure> for GatewayError {
    fn from(f: EngineFailure) -> Self {
        GatewayError::Engine(f)
    }
}
