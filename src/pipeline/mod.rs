//! Pipeline stages for one conversion job.
//!
//! Each submodule implements exactly one step. Keeping stages separate makes
//! each independently testable and lets us swap the engine or the
//! pre-conversion tool without touching the rest.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ workspace ──▶ preprocess ──▶ runner ──▶ extract
//! (sniff)   (tempdir)     (PDF→TIFF)    (engine)   (artifact)
//! ```
//!
//! 1. [`input`]      validate size, type and magic bytes of the upload
//! 2. [`workspace`]  private per-job directory, removed on every exit path
//! 3. [`preprocess`] optional rasterisation of PDFs, via the runner
//! 4. [`runner`]     subprocess with deadline, memory ceiling and output lines
//! 5. [`extract`]    locate and load the engine's artifact

pub mod extract;
pub mod input;
pub mod preprocess;
pub mod runner;
pub mod workspace;
