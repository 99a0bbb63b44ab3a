//! Artifact extraction: locate the engine's output and load it.
//!
//! Engines disagree on where exactly they put their export. The default one
//! writes `<out>/<stem>.mxl` when given an output directory, and
//! `<out>/<stem>/<stem>.mxl` when it creates a book folder. Both spots are
//! checked, flat layout first.
//!
//! On the streaming endpoint the artifact travels inside a JSON line, so it
//! is base64-wrapped there ([`Artifact::to_base64`]).

use crate::error::{DiagnosticTail, EngineFailure, GatewayError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The engine's result, read into memory before the workspace is released.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Standard (padded) base64 of the artifact bytes.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("filename", &self.filename)
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Places the engine may have written `<stem>.<ext>`, in lookup order.
pub fn artifact_candidates(output_dir: &Path, stem: &str, extension: &str) -> Vec<PathBuf> {
    let name = format!("{stem}.{extension}");
    vec![output_dir.join(&name), output_dir.join(stem).join(&name)]
}

/// Load the artifact at `path`.
///
/// A zero-byte file counts as missing; the engine wrote nothing useful.
pub async fn read_artifact(path: &Path, media_type: &str) -> Result<Artifact, GatewayError> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());

    let bytes = tokio::fs::read(path).await.map_err(|e| {
        GatewayError::Internal(format!("reading artifact '{}': {e}", path.display()))
    })?;

    if bytes.is_empty() {
        return Err(EngineFailure::MissingArtifact {
            expected: filename,
            tail: DiagnosticTail::default(),
        }
        .into());
    }

    debug!(path = %path.display(), bytes = bytes.len(), "Artifact loaded");
    Ok(Artifact {
        filename,
        media_type: media_type.to_string(),
        bytes,
    })
}
