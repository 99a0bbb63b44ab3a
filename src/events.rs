//! Per-job, replay-capable event log with multi-subscriber fan-out.
//!
//! Each job gets one append-only log. Subscribers do not own a buffer: they
//! hold a cursor into the shared log plus a `tokio::sync::watch` receiver
//! that wakes them when the log grows. Consequences:
//!
//! * `publish` is an append under a short mutex and never waits on anyone.
//! * A slow subscriber only falls behind; it can never make the log drop
//!   events, and it never slows down other subscribers.
//! * A late subscriber starts its cursor at 0 and replays everything.
//!
//! A closed log stays reachable for `retention` so an observer that attaches
//! right after the job finished still gets the full replay, then it is
//! dropped lazily on the next registry access.

use crate::error::GatewayError;
use crate::job::JobId;
use crate::progress::ProgressEvent;
use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, trace};

/// A lazily-evaluated, finite stream of a job's events.
pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// In-process event bus, shared via `Arc<EventBus>`.
pub struct EventBus {
    logs: Mutex<HashMap<JobId, Arc<JobLog>>>,
    retention: Duration,
}

struct JobLog {
    inner: Mutex<LogInner>,
    /// Carries the current event count; bumped on every append and on close.
    notify: watch::Sender<usize>,
}

struct LogInner {
    events: Vec<ProgressEvent>,
    next_seq: u64,
    terminal_seen: bool,
    closed_at: Option<Instant>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventBus {
    /// Create a bus that keeps closed logs replayable for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Register a new job's log. Must precede the first `publish`.
    pub fn open(&self, job_id: JobId) -> Result<(), GatewayError> {
        let mut logs = lock(&self.logs);
        self.purge_expired(&mut logs);
        if logs.contains_key(&job_id) {
            return Err(GatewayError::Internal(format!(
                "event log for job {job_id} already exists"
            )));
        }
        let (notify, _) = watch::channel(0);
        logs.insert(
            job_id,
            Arc::new(JobLog {
                inner: Mutex::new(LogInner {
                    events: Vec::new(),
                    next_seq: 1,
                    terminal_seen: false,
                    closed_at: None,
                }),
                notify,
            }),
        );
        debug!(job_id = %job_id, "Event log opened");
        Ok(())
    }

    /// Append `event` to the job's log and wake its subscribers.
    ///
    /// Returns the sequence number assigned to the event. Publishing to an
    /// unknown or closed log, or after the terminal event, is rejected.
    pub fn publish(&self, job_id: JobId, mut event: ProgressEvent) -> Result<u64, GatewayError> {
        let log = self.log(job_id).ok_or_else(|| {
            GatewayError::Internal(format!("no event log for job {job_id}"))
        })?;

        let (seq, len) = {
            let mut inner = lock(&log.inner);
            if inner.closed_at.is_some() || inner.terminal_seen {
                return Err(GatewayError::Internal(format!(
                    "event log for job {job_id} is already finished"
                )));
            }
            event.job_id = job_id;
            event.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.terminal_seen = event.is_terminal();
            let seq = event.seq;
            trace!(job_id = %job_id, seq, stage = %event.stage, "{}", event.message);
            inner.events.push(event);
            (seq, inner.events.len())
        };

        log.notify.send_replace(len);
        Ok(seq)
    }

    /// Subscribe to a job's events: full replay, then live delivery.
    ///
    /// The stream ends after the terminal event, or when the log is closed
    /// and drained. Returns `None` for unknown (or expired) jobs.
    pub fn subscribe(&self, job_id: JobId) -> Option<EventStream> {
        let log = self.log(job_id)?;
        let rx = log.notify.subscribe();
        debug!(job_id = %job_id, "Subscriber attached");

        let state = Cursor {
            log,
            rx,
            next: 0,
            done: false,
        };
        Some(Box::pin(stream::unfold(state, |mut cursor| async move {
            let event = cursor.next_event().await?;
            Some((event, cursor))
        })))
    }

    /// Copy of every event published so far for the job.
    pub fn snapshot(&self, job_id: JobId) -> Option<Vec<ProgressEvent>> {
        let log = self.log(job_id)?;
        let events = lock(&log.inner).events.clone();
        Some(events)
    }

    /// Close the job's log: subscribers drain what is there and then end.
    ///
    /// Idempotent. The log stays replayable for the retention window.
    pub fn close(&self, job_id: JobId) {
        let mut logs = lock(&self.logs);
        let Some(log) = logs.get(&job_id).cloned() else {
            return;
        };
        let len = {
            let mut inner = lock(&log.inner);
            if inner.closed_at.is_none() {
                inner.closed_at = Some(Instant::now());
            }
            inner.events.len()
        };
        log.notify.send_replace(len);
        if self.retention.is_zero() {
            logs.remove(&job_id);
        }
        debug!(job_id = %job_id, events = len, "Event log closed");
    }

    /// True while a closed log is still inside its retention window.
    pub fn retained(&self, job_id: JobId) -> bool {
        self.log(job_id)
            .is_some_and(|log| lock(&log.inner).closed_at.is_some())
    }

    /// Number of jobs whose logs are still open.
    pub fn active_jobs(&self) -> usize {
        let mut logs = lock(&self.logs);
        self.purge_expired(&mut logs);
        logs.values()
            .filter(|log| lock(&log.inner).closed_at.is_none())
            .count()
    }

    fn log(&self, job_id: JobId) -> Option<Arc<JobLog>> {
        let mut logs = lock(&self.logs);
        self.purge_expired(&mut logs);
        logs.get(&job_id).cloned()
    }

    fn purge_expired(&self, logs: &mut HashMap<JobId, Arc<JobLog>>) {
        let retention = self.retention;
        logs.retain(|_, log| match lock(&log.inner).closed_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// One subscriber's position in a job log.
struct Cursor {
    log: Arc<JobLog>,
    rx: watch::Receiver<usize>,
    next: usize,
    done: bool,
}

impl Cursor {
    async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            if self.done {
                return None;
            }
            {
                let inner = lock(&self.log.inner);
                if let Some(event) = inner.events.get(self.next) {
                    self.next += 1;
                    self.done = event.is_terminal();
                    return Some(event.clone());
                }
                if inner.closed_at.is_some() {
                    return None;
                }
            }
            // `changed` also fires for bumps that happened after the check
            // above, so an append between the check and this await is not lost.
            if self.rx.changed().await.is_err() {
                let inner = lock(&self.log.inner);
                let event = inner.events.get(self.next).cloned();
                self.next += 1;
                return event;
            }
        }
    }
}
