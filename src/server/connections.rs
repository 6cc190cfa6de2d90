//! Connection admission cap with RAII guards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::telemetry;

pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    max: usize,
}

impl ConnectionTracker {
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Admit one connection, or `None` at the cap. The guard releases
    /// the slot on drop.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    telemetry::record_active_connections(current + 1);
                    return Some(ConnectionGuard {
                        active: Arc::clone(&self.active),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        telemetry::record_active_connections(remaining);
    }
}
