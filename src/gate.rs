//! Semaphore-based concurrency gate for engine subprocesses.
//!
//! The [`ConcurrencyGate`] bounds how many jobs run their engine at once.
//! It is built once at startup and injected into the controller as an
//! `Arc<ConcurrencyGate>`, so tests can construct gates with a capacity of
//! one and watch the counters directly.
//!
//! Tokio's semaphore queues waiters in FIFO order, which gives
//! first-come-first-served admission without extra bookkeeping.

use crate::error::GatewayError;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Bounded, fair admission control for jobs.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    peak: AtomicUsize,
}

/// The right to run one job's subprocess.
///
/// Returned to the gate when released or dropped. `release` consumes the
/// permit, so releasing twice is not expressible.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters")
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

/// Point-in-time gate utilisation, for `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    pub in_flight: usize,
    pub waiting: usize,
    pub capacity: usize,
    /// Highest `in_flight` ever observed.
    pub peak: usize,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `capacity` jobs at once (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        info!(capacity, "Concurrency gate created");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a free slot, giving up after `timeout` if one is given.
    ///
    /// A timed-out wait is reported as [`GatewayError::ServiceBusy`].
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Permit, GatewayError> {
        let _waiting = WaitingGuard::enter(&self.counters);
        let acquire = Arc::clone(&self.semaphore).acquire_owned();

        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(
                        waited_ms = limit.as_millis() as u64,
                        capacity = self.capacity,
                        "Gate wait timed out"
                    );
                    return Err(GatewayError::ServiceBusy {
                        waited: limit,
                        capacity: self.capacity,
                    });
                }
            },
            None => acquire.await,
        }
        .map_err(|_| GatewayError::Internal("concurrency gate closed".into()))?;

        Ok(self.admit(permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.admit(permit))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            capacity: self.capacity,
            peak: self.counters.peak.load(Ordering::SeqCst),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> Permit {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        debug!(in_flight = now, capacity = self.capacity, "Permit granted");
        Permit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }
}

impl Permit {
    /// Return the slot to the gate.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let left = self.counters.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(in_flight = left, "Permit released");
    }
}

/// Keeps `waiting` accurate even when the acquiring future is dropped.
struct WaitingGuard<'a>(&'a Counters);

impl<'a> WaitingGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.waiting.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}
