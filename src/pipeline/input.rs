//! Input validation: decide whether an upload may enter the pipeline.
//!
//! ## Why sniff magic bytes?
//!
//! The extension and the multipart `Content-Type` are both client claims.
//! Engines tend to crash late and cryptically on garbage (a JVM stack trace
//! minutes into the job), so we compare the first bytes against the claimed
//! document kind up front and refuse mismatches before any workspace,
//! permit, or subprocess exists.

use crate::error::ValidationError;
use crate::job::InputDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// A document as received from the client.
#[derive(Clone)]
pub struct Upload {
    /// Client-supplied file name.
    pub filename: String,
    /// Media type from the part header, if any.
    pub content_type: Option<String>,
    /// Total bytes the client sent. May exceed `bytes.len()` when the
    /// reader stopped buffering an oversized upload.
    pub size: u64,
    /// File content (complete whenever `size` is within the limit).
    pub bytes: Vec<u8>,
}

impl Upload {
    /// Build an upload from a fully-buffered file.
    pub fn new(filename: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            size: bytes.len() as u64,
            bytes,
        }
    }

    pub fn descriptor(&self) -> InputDescriptor {
        InputDescriptor {
            filename: self.filename.clone(),
            size: self.size,
            declared_media_type: self.content_type.clone(),
            kind: None,
        }
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish()
    }
}

/// Document formats the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Png,
    Jpeg,
    Tiff,
    Bmp,
    Gif,
}

impl DocumentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "png" => Some(DocumentKind::Png),
            "jpg" | "jpeg" => Some(DocumentKind::Jpeg),
            "tif" | "tiff" => Some(DocumentKind::Tiff),
            "bmp" => Some(DocumentKind::Bmp),
            "gif" => Some(DocumentKind::Gif),
            _ => None,
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let essence = media_type.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/pdf" => Some(DocumentKind::Pdf),
            "image/png" => Some(DocumentKind::Png),
            "image/jpeg" | "image/jpg" => Some(DocumentKind::Jpeg),
            "image/tiff" => Some(DocumentKind::Tiff),
            "image/bmp" | "image/x-ms-bmp" => Some(DocumentKind::Bmp),
            "image/gif" => Some(DocumentKind::Gif),
            _ => None,
        }
    }

    /// Identify a document from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            Some(DocumentKind::Pdf)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(DocumentKind::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(DocumentKind::Jpeg)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(DocumentKind::Tiff)
        } else if bytes.starts_with(b"BM") {
            Some(DocumentKind::Bmp)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(DocumentKind::Gif)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DocumentKind::Pdf => "PDF",
            DocumentKind::Png => "PNG image",
            DocumentKind::Jpeg => "JPEG image",
            DocumentKind::Tiff => "TIFF image",
            DocumentKind::Bmp => "BMP image",
            DocumentKind::Gif => "GIF image",
        }
    }
}

fn extension(filename: &str) -> Option<&str> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = base.rsplit_once('.')?;
    (!stem.is_empty()).then_some(ext)
}

/// Check size, type, and content of an upload.
///
/// Size is checked first and needs nothing but the byte count, so an
/// oversized upload is refused without looking at its content.
pub fn validate(upload: &Upload, max_bytes: u64) -> Result<DocumentKind, ValidationError> {
    if upload.size > max_bytes {
        return Err(ValidationError::TooLarge {
            size: upload.size,
            limit: max_bytes,
        });
    }
    if upload.size == 0 {
        return Err(ValidationError::Empty {
            filename: upload.filename.clone(),
        });
    }

    let declared = extension(&upload.filename)
        .and_then(DocumentKind::from_extension)
        .or_else(|| {
            upload
                .content_type
                .as_deref()
                .and_then(DocumentKind::from_media_type)
        })
        .ok_or_else(|| ValidationError::UnsupportedType {
            filename: upload.filename.clone(),
            media_type: upload
                .content_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        })?;

    match DocumentKind::sniff(&upload.bytes) {
        Some(actual) if actual == declared => {
            debug!(filename = %upload.filename, kind = ?declared, "Upload validated");
            Ok(declared)
        }
        _ => Err(ValidationError::ContentMismatch {
            filename: upload.filename.clone(),
            expected: declared.label(),
            magic: upload.bytes.iter().take(4).copied().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn upload(name: &str, ct: Option<&str>, bytes: &[u8]) -> Upload {
        Upload::new(name, ct.map(String::from), bytes.to_vec())
    }

    #[test]
    fn accepts_matching_png() {
        let kind = validate(&upload("score.PNG", None, PNG), 1024).unwrap();
        assert_eq!(kind, DocumentKind::Png);
    }

    #[test]
    fn oversized_is_rejected_by_declared_size() {
        let mut u = upload("score.pdf", None, b"%PDF-1.7");
        u.size = 11 * 1024 * 1024;
        let err = validate(&u, 10 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, ValidationError::TooLarge { .. }));
    }

    #[test]
    fn empty_upload_is_rejected() {
        let err = validate(&upload("empty.pdf", None, b""), 1024).unwrap_err();
        assert!(matches!(err, ValidationError::Empty { .. }));
    }

    #[test]
    fn unknown_extension_falls_back_to_media_type() {
        let kind = validate(&upload("scan", Some("image/png"), PNG), 1024).unwrap();
        assert_eq!(kind, DocumentKind::Png);
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let err = validate(&upload("notes.txt", Some("text/plain"), b"hello"), 1024).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedType { .. }));
    }

    #[test]
    fn invalid_pdf_content_is_rejected() {
        let err = validate(&upload("test.pdf", None, b"invalid content"), 1024).unwrap_err();
        match err {
            ValidationError::ContentMismatch { expected, magic, .. } => {
                assert_eq!(expected, "PDF");
                assert_eq!(magic, b"inva");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sniff_recognises_each_kind() {
        assert_eq!(DocumentKind::sniff(b"%PDF-1.4"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::sniff(PNG), Some(DocumentKind::Png));
        assert_eq!(DocumentKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(DocumentKind::Jpeg));
        assert_eq!(DocumentKind::sniff(b"II*\0rest"), Some(DocumentKind::Tiff));
        assert_eq!(DocumentKind::sniff(b"MM\0*rest"), Some(DocumentKind::Tiff));
        assert_eq!(DocumentKind::sniff(b"BM...."), Some(DocumentKind::Bmp));
        assert_eq!(DocumentKind::sniff(b"GIF89a"), Some(DocumentKind::Gif));
        assert_eq!(DocumentKind::sniff(b"\0\0\0\0"), None);
    }

    #[test]
    fn extension_ignores_dotfiles_and_directories() {
        assert_eq!(extension("dir.d/score.tif"), Some("tif"));
        assert_eq!(extension(".pdf"), None);
        assert_eq!(extension("noext"), None);
    }

    #[test]
    fn media_type_parameters_are_ignored() {
        assert_eq!(
            DocumentKind::from_media_type("application/pdf; charset=binary"),
            Some(DocumentKind::Pdf)
        );
    }
}
