//! Per-job workspaces: private directories that clean themselves up.
//!
//! ## Why `TempDir` behind a guard?
//!
//! A workspace must disappear on *every* exit path: success, engine failure,
//! timeout kill, a panic in the orchestration code, or the job task being
//! dropped. Wrapping a [`tempfile::TempDir`] in [`Workspace`] and releasing
//! it from `Drop` makes that a property of ownership instead of a call that
//! every branch has to remember. `release` is also callable explicitly and is
//! idempotent, so the happy path can reclaim space eagerly.
//!
//! Layout of one workspace:
//!
//! ```text
//! <root>/omr-job-<job id>-<random>/
//!   ├── input/    uploaded file (and pre-converted copy)
//!   └── output/   engine artifacts
//! ```

use crate::error::GatewayError;
use crate::job::JobId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Name prefix of every workspace directory.
pub const WORKSPACE_PREFIX: &str = "omr-job-";

/// Creates workspaces under one root directory and keeps count of them.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    allocations: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allocations: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, uniquely-named workspace for `job_id`.
    pub fn allocate(&self, job_id: JobId) -> Result<Workspace, GatewayError> {
        let exhausted = |what: &str, e: std::io::Error| {
            GatewayError::ResourceExhausted(format!(
                "{what} under '{}': {e}",
                self.root.display()
            ))
        };

        std::fs::create_dir_all(&self.root).map_err(|e| exhausted("cannot create root", e))?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{WORKSPACE_PREFIX}{job_id}-"))
            .tempdir_in(&self.root)
            .map_err(|e| exhausted("cannot create workspace", e))?;

        std::fs::create_dir(dir.path().join("input"))
            .and_then(|_| std::fs::create_dir(dir.path().join("output")))
            .map_err(|e| exhausted("cannot lay out workspace", e))?;

        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        let path = dir.path().to_path_buf();
        debug!(job_id = %job_id, path = %path.display(), "Workspace allocated");

        Ok(Workspace {
            job_id,
            path,
            dir: Some(dir),
            live: Arc::clone(&self.live),
        })
    }

    /// Total number of successful `allocate` calls.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Workspaces allocated and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Remove workspace directories left behind by a crashed previous run.
    ///
    /// Another instance may share the root, so a directory is only removed
    /// once it has not been modified for `older_than`. Pass something longer
    /// than any job can live.
    pub fn sweep_stale(&self, older_than: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let is_workspace = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(WORKSPACE_PREFIX));
            let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
            if !(is_workspace && is_dir) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok());
            // Unknown age (or a clock gone backwards) counts as recent.
            if !age.is_some_and(|age| age >= older_than) {
                debug!(path = %entry.path().display(), ?age, "Keeping recent workspace");
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Could not remove stale workspace"),
            }
        }
        if removed > 0 {
            info!(removed, root = %self.root.display(), "Removed stale workspaces");
        }
        removed
    }
}

/// An exclusively-owned job directory, destroyed on release or drop.
#[derive(Debug)]
pub struct Workspace {
    job_id: JobId,
    path: PathBuf,
    dir: Option<TempDir>,
    live: Arc<AtomicUsize>,
}

impl Workspace {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_dir(&self) -> PathBuf {
        self.path.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path.join("output")
    }

    /// Where an uploaded file called `filename` is stored.
    ///
    /// The name is reduced to a safe basename, so it cannot point outside
    /// the workspace.
    pub fn input_path(&self, filename: &str) -> PathBuf {
        self.input_dir().join(sanitize_filename(filename))
    }

    /// Delete the directory tree. Later calls do nothing.
    pub fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => debug!(job_id = %self.job_id, "Workspace released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(job_id = %self.job_id, "Workspace already gone")
            }
            Err(e) => warn!(
                job_id = %self.job_id,
                path = %self.path.display(),
                error = %e,
                "Failed to remove workspace"
            ),
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

/// Reduce a client-supplied name to a safe single path component.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(120)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// File name without its final extension.
pub fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}
