//! Shared helpers for integration tests: stub engines and sample uploads.
//!
//! Stub engines are shell scripts run as `sh <script> {input} {output_dir}
//! {stem}`, so inside a script `$1` is the input file, `$2` the output
//! directory and `$3` the stem the artifact must be named after.

#![allow(dead_code)]

use edgequake_omr::{GatewayConfig, GatewayConfigBuilder, JobController, PreprocessConfig, Upload};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Magic bytes of a PNG file.
pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Bytes every successful stub writes as its artifact.
pub const STUB_ARTIFACT: &[u8] = b"PK\x03\x04stub-musicxml";

/// Shell snippet writing [`STUB_ARTIFACT`] to the expected location.
pub const WRITE_ARTIFACT: &str = r#"printf 'PK\003\004stub-musicxml' > "$2/$3.mxl""#;

/// A scratch area holding the workspace root and the stub scripts.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self {
            dir: tempfile::tempdir().expect("sandbox tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.dir.path().join("workspaces")
    }

    /// Write `body` as a shell script and return its path.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub script");
        path
    }

    /// Config builder running `script` as the engine, without PDF pre-conversion.
    pub fn config(&self, script: &Path) -> GatewayConfigBuilder {
        GatewayConfig::builder()
            .workspace_root(self.workspace_root())
            .engine_program("sh")
            .engine_args([
                script.to_string_lossy().into_owned(),
                "{input}".to_string(),
                "{output_dir}".to_string(),
                "{stem}".to_string(),
            ])
            .preprocess(None)
            .job_timeout(Duration::from_secs(20))
            .permit_wait_timeout(None)
            .event_retention(Duration::from_secs(30))
    }

    /// Pre-conversion config running `script` as `sh <script> {input} {output}`.
    pub fn preprocess(&self, script: &Path) -> PreprocessConfig {
        PreprocessConfig {
            program: "sh".into(),
            args: vec![
                script.to_string_lossy().into_owned(),
                "{input}".into(),
                "{output}".into(),
            ],
            output_extension: "tiff".into(),
            native_pdf_check: None,
        }
    }

    pub fn controller(&self, builder: GatewayConfigBuilder) -> JobController {
        JobController::new(builder.build().expect("valid test config"))
    }

    /// Number of entries left under the workspace root.
    pub fn leftover_workspaces(&self) -> usize {
        match std::fs::read_dir(self.workspace_root()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

/// A PNG-looking upload of exactly `size` bytes.
pub fn png_upload(name: &str, size: usize) -> Upload {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.resize(size.max(PNG_MAGIC.len()), 0);
    Upload::new(name, Some("image/png".into()), bytes)
}

pub fn pdf_upload(name: &str) -> Upload {
    Upload::new(
        name,
        Some("application/pdf".into()),
        b"%PDF-1.4\n%stub\n".to_vec(),
    )
}

/// Poll `cond` every 10 ms for up to 5 s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
