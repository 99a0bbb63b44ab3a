//! Job controller: drives one upload from admission to a terminal outcome.
//!
//! ## Lifecycle
//!
//! ```text
//! submit ─▶ Queued ─▶ Validating ─┬─▶ (gate) ─▶ Preparing ─▶ Running ─▶ Extracting ─▶ Complete
//!                                 └──────────────────────────────────────────────────▶ Failed
//! ```
//!
//! Validation runs synchronously inside [`JobController::submit`], so a bad
//! upload is refused before any permit, workspace, or subprocess exists.
//! Everything after that happens in a detached tokio task (the *driver*),
//! which owns the [`Job`] record and is its only writer.
//!
//! ## Cleanup ordering
//!
//! The workspace and the permit are RAII guards local to the driver's
//! execution step. They are dropped (released) when that step returns,
//! whether it succeeded, failed, or panicked, and only then is the terminal
//! event published and the event log closed. An observer that sees
//! `complete` or `error` can rely on the resources being gone.
//!
//! ## Disconnects
//!
//! By default a job keeps running when the client goes away; its events stay
//! replayable through [`JobController::subscribe`]. With
//! `cancel_on_disconnect`, the [`JobHandle`] carries a cancellation guard:
//! dropping the handle (or its event stream, or the future awaiting its
//! result) kills the engine and fails the job with `Cancelled`.

use crate::config::{GatewayConfig, PreprocessConfig};
use crate::error::GatewayError;
use crate::events::{EventBus, EventStream};
use crate::gate::ConcurrencyGate;
use crate::job::{Job, JobId, JobState};
use crate::pipeline::extract::{artifact_candidates, read_artifact, Artifact};
use crate::pipeline::input::{self, Upload};
use crate::pipeline::preprocess::{self, needs_preprocess};
use crate::pipeline::runner::{expand_args, Deadline, Invocation, ProcessRunner};
use crate::pipeline::workspace::{file_stem, WorkspaceManager};
use crate::progress::ProgressEvent;
use crate::translate::{LineTranslator, MarkerTranslator, StageTracker};
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Shared entry point for running conversions. Cheap to clone.
#[derive(Clone)]
pub struct JobController {
    config: Arc<GatewayConfig>,
    gate: Arc<ConcurrencyGate>,
    workspaces: Arc<WorkspaceManager>,
    runner: Arc<ProcessRunner>,
    bus: Arc<EventBus>,
    translator: Arc<dyn LineTranslator>,
    /// Result of the native PDF support check, run on the first PDF.
    native_pdf: Arc<OnceCell<bool>>,
}

/// Resource usage at a point in time, for `/health`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
    pub in_flight: usize,
    pub waiting: usize,
    pub capacity: usize,
    pub active_jobs: usize,
    pub live_workspaces: usize,
}

impl JobController {
    /// Build a controller with its own concurrency gate.
    pub fn new(config: GatewayConfig) -> Self {
        let gate = Arc::new(ConcurrencyGate::new(config.max_concurrent_jobs));
        Self::with_gate(config, gate)
    }

    /// Build a controller around an existing gate.
    pub fn with_gate(config: GatewayConfig, gate: Arc<ConcurrencyGate>) -> Self {
        let translator = config
            .translator
            .clone()
            .unwrap_or_else(|| Arc::new(MarkerTranslator));
        Self {
            workspaces: Arc::new(WorkspaceManager::new(config.workspace_root.clone())),
            runner: Arc::new(ProcessRunner::new(config.diagnostic_tail_lines)),
            bus: Arc::new(EventBus::new(config.event_retention)),
            config: Arc::new(config),
            gate,
            translator,
            native_pdf: Arc::new(OnceCell::new()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Admit an upload and start its job.
    ///
    /// Returns once the upload has been validated and the driver task is
    /// running. Validation failures are returned here and never reach a
    /// workspace or the engine. Must be called inside a tokio runtime.
    pub fn submit(&self, upload: Upload) -> Result<JobHandle, GatewayError> {
        let mut job = Job::new(upload.descriptor());
        let id = job.id();

        self.bus.open(id)?;
        let events = self
            .bus
            .subscribe(id)
            .ok_or_else(|| GatewayError::Internal(format!("event log for job {id} vanished")))?;
        self.emit(id, ProgressEvent::new(JobState::Queued, "Starting conversion..."));
        info!(
            job_id = %id,
            filename = %upload.filename,
            size = upload.size,
            "Job submitted"
        );

        // ── Validation (no side effects on failure) ──────────────────────
        self.transition(&mut job, JobState::Validating, "Validating upload")?;
        let kind = match input::validate(&upload, self.config.max_upload_bytes) {
            Ok(kind) => kind,
            Err(e) => {
                let err = GatewayError::from(e);
                info!(job_id = %id, error = %err, "Upload rejected");
                self.finalize(&mut job, Err(err.clone()));
                return Err(err);
            }
        };
        job.input_mut().kind = Some(kind);
        if kind == input::DocumentKind::Pdf {
            self.note(&job, "Detected PDF file");
        }

        // ── Hand off to the driver task ──────────────────────────────────
        let cancel = CancellationToken::new();
        let guard = self
            .config
            .cancel_on_disconnect
            .then(|| cancel.clone().drop_guard());

        let this = self.clone();
        let task = tokio::spawn(async move { this.drive(job, upload, cancel).await });

        Ok(JobHandle {
            id,
            events,
            task,
            guard,
        })
    }

    /// Run a job to completion and return its artifact.
    pub async fn convert(&self, upload: Upload) -> Result<Arc<Artifact>, GatewayError> {
        self.submit(upload)?.result().await
    }

    /// Attach to a job's events: replay, then live delivery.
    pub fn subscribe(&self, job_id: JobId) -> Option<EventStream> {
        self.bus.subscribe(job_id)
    }

    pub fn health(&self) -> HealthSnapshot {
        let gate = self.gate.snapshot();
        HealthSnapshot {
            in_flight: gate.in_flight,
            waiting: gate.waiting,
            capacity: gate.capacity,
            active_jobs: self.bus.active_jobs(),
            live_workspaces: self.workspaces.live(),
        }
    }

    async fn drive(
        self,
        mut job: Job,
        upload: Upload,
        cancel: CancellationToken,
    ) -> Result<Arc<Artifact>, GatewayError> {
        let id = job.id();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.execute(&mut job, upload, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let msg = panic_message(panic.as_ref());
                error!(job_id = %id, panic = %msg, "Job driver panicked");
                Err(GatewayError::Internal(format!("job driver panicked: {msg}")))
            });

        match &outcome {
            Ok(artifact) => info!(
                job_id = %id,
                bytes = artifact.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job complete"
            ),
            Err(e) => warn!(
                job_id = %id,
                kind = e.kind().as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "Job failed"
            ),
        }
        self.finalize(&mut job, outcome.clone());
        outcome
    }

    /// Everything between validation and the terminal event.
    ///
    /// The permit and the workspace live in this frame, so they are released
    /// on every return path before the caller publishes the outcome.
    async fn execute(
        &self,
        job: &mut Job,
        upload: Upload,
        cancel: &CancellationToken,
    ) -> Result<Arc<Artifact>, GatewayError> {
        let id = job.id();
        let kind = job
            .input()
            .kind
            .ok_or_else(|| GatewayError::Internal(format!("job {id} has no document kind")))?;
        let engine = &self.config.engine;

        // ── Step 1: Concurrency slot ─────────────────────────────────────
        let permit = match self.gate.try_acquire() {
            Some(permit) => permit,
            None => {
                self.note(
                    job,
                    format!(
                        "Waiting for a free engine slot ({} in use)",
                        self.gate.capacity()
                    ),
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    permit = self.gate.acquire(self.config.permit_wait_timeout) => permit?,
                }
            }
        };

        // ── Step 2: Workspace ────────────────────────────────────────────
        self.transition(job, JobState::Preparing, "Preparing workspace")?;
        let mut workspace = self.workspaces.allocate(id)?;
        job.set_workspace(workspace.path().to_path_buf());

        let staged = workspace.input_path(&upload.filename);
        tokio::fs::write(&staged, &upload.bytes).await.map_err(|e| {
            GatewayError::ResourceExhausted(format!("writing upload into workspace: {e}"))
        })?;
        drop(upload);
        let deadline = Deadline::after(self.config.job_timeout);

        // ── Step 3: Pre-conversion ───────────────────────────────────────
        let mut preconvert = self
            .config
            .preprocess
            .as_ref()
            .filter(|pre| needs_preprocess(kind, Some(pre)));
        if let Some(pre) = preconvert {
            if self.engine_reads_pdf(pre).await {
                debug!(job_id = %id, "Engine reads PDF natively; skipping pre-conversion");
                preconvert = None;
            }
        }
        let engine_input = match preconvert {
            Some(pre) => {
                self.note(job, "Converting PDF to TIFF...");
                let converted = preprocess::normalise(
                    &self.runner,
                    id,
                    &workspace,
                    &staged,
                    pre,
                    deadline,
                    cancel.clone(),
                )
                .await?;
                self.note(job, "PDF conversion complete");
                converted
            }
            None => staged,
        };

        // ── Step 4: Engine ───────────────────────────────────────────────
        let input_name = engine_input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = file_stem(&input_name).to_string();
        let output_dir = workspace.output_dir();

        let input_str = engine_input.to_string_lossy();
        let output_str = output_dir.to_string_lossy();
        let workspace_str = workspace.path().to_string_lossy();
        let args = expand_args(
            &engine.args,
            &[
                ("input", &*input_str),
                ("output_dir", &*output_str),
                ("stem", stem.as_str()),
                ("workspace", &*workspace_str),
            ],
        );
        let invocation = Invocation::new(engine.program.clone(), args)
            .with_env(engine.env.clone())
            .with_memory_limit(engine.memory_limit_bytes);

        self.transition(
            job,
            JobState::Running,
            format!("Processing with {}: {input_name}", engine.program),
        )?;
        let mut process = self
            .runner
            .run(id, &workspace, &invocation, deadline, cancel.clone())?;

        let mut tracker = StageTracker::new();
        while let Some(line) = process.next_line().await {
            match self.translator.translate(&line.text) {
                Some(stage) => {
                    if let Some(stage) = tracker.observe(stage) {
                        debug!(job_id = %id, ?stage, "Engine stage");
                        self.emit(id, ProgressEvent::new(JobState::Running, stage.message()));
                    }
                }
                None if self.config.forward_engine_output && !line.text.trim().is_empty() => {
                    self.emit(
                        id,
                        ProgressEvent::new(JobState::Running, line.text.trim()).as_detail(),
                    );
                }
                None => {}
            }
        }

        let candidates = artifact_candidates(&output_dir, &stem, &engine.artifact_extension);
        let artifact_path = process.finish(&candidates).await?;

        // ── Step 5: Extraction ───────────────────────────────────────────
        self.transition(job, JobState::Extracting, "Reading engine output")?;
        let artifact = read_artifact(&artifact_path, &engine.artifact_media_type).await?;

        // ── Step 6: Release ──────────────────────────────────────────────
        workspace.release();
        permit.release();
        Ok(Arc::new(artifact))
    }

    /// Record the outcome, publish the terminal event, close the log.
    fn finalize(&self, job: &mut Job, outcome: Result<Arc<Artifact>, GatewayError>) {
        let id = job.id();
        let (recorded, event) = match outcome {
            Ok(artifact) => (
                job.complete(artifact.len()),
                ProgressEvent::new(JobState::Complete, "Processing complete").with_payload(artifact),
            ),
            Err(e) => {
                let event = ProgressEvent::new(JobState::Failed, e.to_string()).with_error(e.kind());
                (job.fail(e), event)
            }
        };
        if let Err(e) = recorded {
            error!(job_id = %id, error = %e, "Job record rejected its outcome");
        }
        debug!(job_id = %id, summary = ?job.summary(), "Job finalized");
        self.emit(id, event);
        self.bus.close(id);
    }

    fn transition(
        &self,
        job: &mut Job,
        next: JobState,
        message: impl Into<String>,
    ) -> Result<(), GatewayError> {
        job.advance(next)?;
        self.emit(job.id(), ProgressEvent::new(next, message));
        Ok(())
    }

    /// Informational event in the job's current state.
    /// Whether PDFs can skip pre-conversion. Checked once per controller.
    async fn engine_reads_pdf(&self, pre: &PreprocessConfig) -> bool {
        let Some(command) = &pre.native_pdf_check else {
            return false;
        };
        *self
            .native_pdf
            .get_or_init(|| preprocess::engine_reads_pdf(command))
            .await
    }

    fn note(&self, job: &Job, message: impl Into<String>) {
        self.emit(job.id(), ProgressEvent::new(job.state(), message));
    }

    fn emit(&self, job_id: JobId, event: ProgressEvent) {
        if let Err(e) = self.bus.publish(job_id, event) {
            error!(job_id = %job_id, error = %e, "Dropping progress event");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A submitted job: its id, its event stream, and its eventual outcome.
pub struct JobHandle {
    id: JobId,
    events: EventStream,
    task: JoinHandle<Result<Arc<Artifact>, GatewayError>>,
    guard: Option<DropGuard>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the terminal outcome.
    pub async fn result(self) -> Result<Arc<Artifact>, GatewayError> {
        let JobHandle { task, guard, .. } = self;
        let outcome = task
            .await
            .unwrap_or_else(|e| Err(GatewayError::Internal(format!("job task failed: {e}"))));
        if let Some(guard) = guard {
            guard.disarm();
        }
        outcome
    }

    /// The job's events, replayed from the first one.
    ///
    /// The job keeps running when this stream is dropped, unless the
    /// controller was configured to cancel on disconnect.
    pub fn into_events(self) -> EventStream {
        let JobHandle { events, guard, .. } = self;
        match guard {
            None => events,
            Some(guard) => Box::pin(events.map(move |event| {
                let _held = &guard;
                event
            })),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("cancel_on_drop", &self.guard.is_some())
            .finish()
    }
}
