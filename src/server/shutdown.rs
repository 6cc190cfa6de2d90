//! Graceful shutdown coordination.
//!
//! Admission goes through `track`: a `None` means the server is
//! draining and the request must be rejected. `initiate` flips the
//! draining flag and waits, up to the drain budget, for every in-flight
//! guard to release.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownResult {
    /// Every in-flight request finished inside the budget.
    Complete,
    /// The budget elapsed with requests still in flight.
    Timeout { remaining: usize },
}

struct Inner {
    draining: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                draining: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Track one request for its lifetime; `None` once draining.
    pub fn track(&self) -> Option<FlightGuard> {
        if self.inner.draining.load(Ordering::Acquire) {
            return None;
        }
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        // Re-check: initiate may have flipped between load and add.
        if self.inner.draining.load(Ordering::Acquire) {
            self.inner.release();
            return None;
        }
        Some(FlightGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Stop admissions and wait out the drain budget.
    pub async fn initiate(&self, budget: Duration) -> ShutdownResult {
        self.inner.draining.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let remaining = self.inner.in_flight.load(Ordering::Acquire);
            if remaining == 0 {
                return ShutdownResult::Complete;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return ShutdownResult::Timeout { remaining };
            }
            let _ = tokio::time::timeout(deadline - now, self.inner.idle.notified()).await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FlightGuard {
    inner: Arc<Inner>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.release();
    }
}
