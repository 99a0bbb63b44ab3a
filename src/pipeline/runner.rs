//! Process runner: launch an external tool inside a workspace and watch it.
//!
//! ## Contract
//!
//! The runner knows nothing about music or documents. It starts a program
//! with an argument list, in a workspace, under a wall-clock deadline and an
//! optional address-space ceiling, and hands back an [`EngineProcess`]:
//!
//! 1. [`EngineProcess::next_line`] yields merged stdout/stderr lines until
//!    the process exits (or closes both pipes), the deadline passes, or the
//!    job is cancelled.
//! 2. [`EngineProcess::finish`] waits for the exit status and classifies
//!    the outcome. Zero exit *and* an artifact on disk is the only success.
//!
//! ## Why a process group?
//!
//! Engines are often launcher scripts (a shell wrapper around a JVM). Killing
//! only the direct child would leave the JVM running and holding the pipes.
//! Every child is started in its own process group, and the whole group is
//! killed as soon as the direct child exits or the job is interrupted. No
//! helper the engine left behind outlives its job.
//!
//! Once the direct child has exited, output still in the pipes is drained
//! for at most [`EXIT_DRAIN_GRACE`]. A descendant that escaped the group and
//! kept a pipe open cannot hold the job past that.
//!
//! ## One subprocess per job
//!
//! The runner tracks which jobs currently own a live child. A second `run`
//! for the same job is rejected until the first [`EngineProcess`] is dropped.

use crate::error::{DiagnosticTail, EngineFailure, GatewayError};
use crate::job::JobId;
use crate::pipeline::workspace::Workspace;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Longest line kept from the engine's output; the rest of the line is dropped.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// How long buffered output is still read after the direct child exited.
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of subprocess output, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// A wall-clock budget: the instant it runs out and its original length.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// A fully-expanded command line.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Address-space ceiling applied to the child before `exec`.
    pub memory_limit_bytes: Option<u64>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_memory_limit(mut self, limit: Option<u64>) -> Self {
        self.memory_limit_bytes = limit;
        self
    }
}

/// Substitute `{name}` placeholders in every argument.
///
/// Unknown placeholders are left as they are.
pub fn expand_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// Launches subprocesses and enforces one live child per job.
#[derive(Debug)]
pub struct ProcessRunner {
    active: Arc<Mutex<HashSet<JobId>>>,
    launches: AtomicU64,
    tail_lines: usize,
}

impl ProcessRunner {
    /// `tail_lines` is how many trailing output lines error reports keep.
    pub fn new(tail_lines: usize) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            launches: AtomicU64::new(0),
            tail_lines,
        }
    }

    /// Number of subprocesses successfully started.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        lock(&self.active).contains(&job_id)
    }

    /// Start `invocation` with the workspace as its working directory.
    pub fn run(
        &self,
        job_id: JobId,
        workspace: &Workspace,
        invocation: &Invocation,
        deadline: Deadline,
        cancel: CancellationToken,
    ) -> Result<EngineProcess, GatewayError> {
        let registration = Registration::claim(&self.active, job_id)?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(workspace.path())
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(limit) = invocation.memory_limit_bytes {
                apply_memory_limit(&mut cmd, limit);
            }
        }

        info!(
            job_id = %job_id,
            program = %invocation.program,
            args = ?invocation.args,
            timeout_secs = deadline.remaining().as_secs(),
            "Spawning subprocess"
        );

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::Engine(EngineFailure::Spawn {
                program: invocation.program.clone(),
                reason: e.to_string(),
            })
        })?;
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, tx.clone(), job_id);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, tx, job_id);
        }

        Ok(EngineProcess {
            job_id,
            pid: child.id(),
            child,
            lines: rx,
            tail: VecDeque::with_capacity(self.tail_lines),
            tail_lines: self.tail_lines,
            deadline,
            cancel,
            interrupted: None,
            exit: None,
            drain_until: None,
            reaped: false,
            _registration: registration,
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a job as owning a live subprocess until dropped.
#[derive(Debug)]
struct Registration {
    active: Arc<Mutex<HashSet<JobId>>>,
    job_id: JobId,
}

impl Registration {
    fn claim(active: &Arc<Mutex<HashSet<JobId>>>, job_id: JobId) -> Result<Self, GatewayError> {
        if !lock(active).insert(job_id) {
            return Err(GatewayError::Internal(format!(
                "job {job_id} already has a running subprocess"
            )));
        }
        Ok(Self {
            active: Arc::clone(active),
            job_id,
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.job_id);
    }
}

#[cfg(unix)]
fn apply_memory_limit(cmd: &mut Command, limit: u64) {
    // SAFETY: the hook runs in the forked child before exec and only calls
    // setrlimit(2), which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            let rlim = libc::rlimit {
                rlim_cur: limit as libc::rlim_t,
                rlim_max: limit as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &rlim) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn spawn_reader<R>(pipe: R, stream: OutputStream, tx: mpsc::Sender<RawOutputLine>, job_id: JobId)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::with_capacity(256);
        // Set while the rest of an overlong line is being skipped.
        let mut skipping = false;
        loop {
            buf.clear();
            let read = (&mut reader)
                .take(MAX_LINE_BYTES as u64)
                .read_until(b'\n', &mut buf)
                .await;
            match read {
                Ok(0) => break,
                Ok(n) => {
                    let ends_line = buf.last() == Some(&b'\n');
                    let was_skipping = skipping;
                    skipping = !ends_line && n >= MAX_LINE_BYTES;
                    if was_skipping {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    trace!(job_id = %job_id, ?stream, "{}", text);
                    if tx.send(RawOutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(job_id = %job_id, ?stream, error = %e, "Output reader stopped");
                    break;
                }
            }
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancelled,
}

/// A running subprocess owned by one job.
#[derive(Debug)]
pub struct EngineProcess {
    job_id: JobId,
    pid: Option<u32>,
    child: Child,
    lines: mpsc::Receiver<RawOutputLine>,
    tail: VecDeque<String>,
    tail_lines: usize,
    deadline: Deadline,
    cancel: CancellationToken,
    interrupted: Option<Interrupt>,
    /// Exit status seen while reading output.
    exit: Option<Result<ExitStatus, String>>,
    /// After the child exited: stop reading output at this instant.
    drain_until: Option<Instant>,
    reaped: bool,
    _registration: Registration,
}

impl EngineProcess {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Next output line, or `None` once output ends or the job is interrupted.
    ///
    /// Non-restartable: after `None`, every later call returns `None`.
    pub async fn next_line(&mut self) -> Option<RawOutputLine> {
        loop {
            if self.interrupted.is_some() {
                return None;
            }
            if let Some(until) = self.drain_until {
                let line = tokio::select! {
                    biased;
                    line = self.lines.recv() => line,
                    _ = tokio::time::sleep_until(until) => None,
                };
                match &line {
                    Some(line) => self.record(&line.text),
                    None => self.lines.close(),
                }
                return line;
            }

            let status = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.interrupted = Some(Interrupt::Cancelled);
                    return None;
                }
                _ = tokio::time::sleep_until(self.deadline.at()) => {
                    self.interrupted = Some(Interrupt::Deadline);
                    return None;
                }
                line = self.lines.recv() => {
                    if let Some(line) = &line {
                        self.record(&line.text);
                    }
                    return line;
                }
                status = self.child.wait() => status,
            };
            self.on_exit(status.map_err(|e| e.to_string()));
        }
    }

    /// The direct child has exited: reap its group, then drain what is left.
    fn on_exit(&mut self, status: Result<ExitStatus, String>) {
        debug!(job_id = %self.job_id, ?status, "Subprocess exited; draining output");
        self.reaped = true;
        self.kill_group();
        self.exit = Some(status);
        self.drain_until = Some(Instant::now() + EXIT_DRAIN_GRACE);
    }

    /// The last lines printed so far.
    pub fn tail(&self) -> DiagnosticTail {
        DiagnosticTail(self.tail.iter().cloned().collect())
    }

    /// Wait for exit and classify the outcome.
    ///
    /// `candidates` are the artifact locations to check, in order; the
    /// first one that exists is returned.
    pub async fn finish(mut self, candidates: &[PathBuf]) -> Result<PathBuf, GatewayError> {
        if let Some(interrupt) = self.interrupted {
            return Err(self.abort(interrupt).await);
        }

        let status = match self.exit.take() {
            Some(status) => status,
            None => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.abort(Interrupt::Cancelled).await),
                _ = tokio::time::sleep_until(self.deadline.at()) => {
                    return Err(self.abort(Interrupt::Deadline).await)
                }
                status = self.child.wait() => status.map_err(|e| e.to_string()),
            },
        };
        self.reaped = true;
        // Helpers the engine started must not outlive the job.
        self.kill_group();

        while let Ok(line) = self.lines.try_recv() {
            self.record(&line.text);
        }
        let status = status.map_err(|e| {
            GatewayError::Internal(format!("waiting for subprocess failed: {e}"))
        })?;

        debug!(job_id = %self.job_id, ?status, "Subprocess exited");
        self.classify(status, candidates)
    }

    fn classify(&self, status: ExitStatus, candidates: &[PathBuf]) -> Result<PathBuf, GatewayError> {
        if let Some(reason) = killed_reason(&status) {
            warn!(job_id = %self.job_id, %reason, "Subprocess killed");
            return Err(EngineFailure::KilledByLimit {
                reason,
                tail: self.tail(),
            }
            .into());
        }

        match status.code() {
            Some(0) => match candidates.iter().find(|p| p.is_file()) {
                Some(found) => Ok(found.clone()),
                None => Err(EngineFailure::MissingArtifact {
                    expected: candidates
                        .first()
                        .map(|p| display_name(p))
                        .unwrap_or_default(),
                    tail: self.tail(),
                }
                .into()),
            },
            Some(code) => Err(EngineFailure::NonZeroExit {
                code,
                tail: self.tail(),
            }
            .into()),
            None => Err(EngineFailure::KilledByLimit {
                reason: "terminated without an exit code".into(),
                tail: self.tail(),
            }
            .into()),
        }
    }

    async fn abort(&mut self, interrupt: Interrupt) -> GatewayError {
        warn!(
            job_id = %self.job_id,
            ?interrupt,
            "Killing subprocess group"
        );
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            debug!(job_id = %self.job_id, error = %e, "Child already gone");
        }
        self.reaped = true;
        match interrupt {
            Interrupt::Deadline => GatewayError::Timeout {
                limit: self.deadline.limit(),
            },
            Interrupt::Cancelled => GatewayError::Cancelled,
        }
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: the child was started as leader of its own process
                // group, so -pid addresses only processes it spawned.
                let ret = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    // ESRCH: the group is already empty.
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        debug!(job_id = %self.job_id, pid, error = %err, "Process group kill failed");
                    }
                }
            }
        }
    }

    fn record(&mut self, text: &str) {
        if self.tail_lines == 0 || text.trim().is_empty() {
            return;
        }
        if self.tail.len() == self.tail_lines {
            self.tail.pop_front();
        }
        self.tail.push_back(text.to_string());
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
        }
    }
}

#[cfg(unix)]
fn killed_reason(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        let name = match signal {
            libc::SIGKILL => "SIGKILL",
            libc::SIGXCPU => "SIGXCPU",
            libc::SIGSEGV => "SIGSEGV",
            libc::SIGABRT => "SIGABRT",
            libc::SIGTERM => "SIGTERM",
            _ => "signal",
        };
        return Some(format!("{name} ({signal})"));
    }
    (status.code() == Some(137)).then(|| "exit code 137".to_string())
}

#[cfg(not(unix))]
fn killed_reason(status: &ExitStatus) -> Option<String> {
    (status.code() == Some(137)).then(|| "exit code 137".to_string())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
