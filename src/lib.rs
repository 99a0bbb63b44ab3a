//! # edgequake-omr
//!
//! Run an external optical music recognition (OMR) engine behind an HTTP job
//! orchestrator: score images and PDFs in, MusicXML out.
//!
//! ## Why this crate?
//!
//! OMR engines such as Audiveris are batch programs: slow (tens of seconds
//! to minutes per page), memory hungry, chatty on stdout, and prone to dying
//! without a useful message. Putting one behind a web endpoint naively gives
//! you orphaned JVMs, temp directories that pile up, and clients staring at
//! a spinner. This crate wraps the engine in a job lifecycle that bounds
//! concurrency, isolates and always cleans up each job's files, enforces a
//! deadline and a memory ceiling, and turns engine output into a replayable
//! stream of progress events.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Validate   size, extension / media type, magic bytes
//!  ├─ 2. Gate       FIFO semaphore, bounded wait
//!  ├─ 3. Workspace  private tempdir, removed on every exit path
//!  ├─ 4. Normalise  optional PDF → TIFF via ImageMagick
//!  ├─ 5. Engine     subprocess with deadline, rlimit, line-by-line output
//!  └─ 6. Extract    <stem>.mxl read into memory, workspace released
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_omr::{GatewayConfig, JobController, Upload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = JobController::new(GatewayConfig::default());
//!     let bytes = std::fs::read("score.png")?;
//!     let artifact = controller.convert(Upload::new("score.png", None, bytes)).await?;
//!     std::fs::write(&artifact.filename, &artifact.bytes)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `omr-server` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding only the library:
//! ```toml
//! edgequake-omr = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod gate;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod server;
pub mod stream;
pub mod translate;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    EngineConfig, GatewayConfig, GatewayConfigBuilder, PreprocessConfig, DEFAULT_MAX_UPLOAD_BYTES,
};
pub use controller::{HealthSnapshot, JobController, JobHandle};
pub use error::{DiagnosticTail, EngineFailure, ErrorKind, GatewayError, ValidationError};
pub use events::{EventBus, EventStream};
pub use gate::{ConcurrencyGate, GateSnapshot, Permit};
pub use job::{Job, JobId, JobState};
pub use pipeline::extract::Artifact;
pub use pipeline::input::{DocumentKind, Upload};
pub use progress::{ProgressEvent, WireEvent, WireStatus};
pub use stream::{convert_stream, WireStream};
pub use translate::{EngineStage, LineTranslator, MarkerTranslator};
