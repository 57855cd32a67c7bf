//! Pending-frame accounting between stream writers and the writer task.
//!
//! A writer takes a slot before queueing a frame. The writer task gives
//! slots back once a batch has reached the transport. When every slot is
//! taken, [`BackpressureController::reserve`] parks until a slot is freed
//! or the timeout expires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{DuplexError, Result};

#[derive(Debug, Default)]
struct Slots {
    taken: AtomicUsize,
    freed: Notify,
}

/// Shared count of frames queued but not yet written.
///
/// Clones share the same count.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    slots: Arc<Slots>,
    limit: usize,
    timeout: Duration,
}

impl BackpressureController {
    pub fn new(limit: usize, timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Slots::default()),
            limit: limit.max(1),
            timeout,
        }
    }

    /// All slots taken.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending_count() >= self.limit
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.slots.taken.load(Ordering::Acquire)
    }

    /// Take a slot if one is free.
    pub fn try_reserve(&self) -> Result<()> {
        self.slots
            .taken
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| DuplexError::BackpressureTimeout)
    }

    /// Take a slot, parking until one is freed or the timeout expires.
    pub async fn reserve(&self) -> Result<()> {
        let wait = async {
            loop {
                // Registered before the check so a release in between wakes us.
                let freed = self.slots.freed.notified();
                if self.try_reserve().is_ok() {
                    return;
                }
                freed.await;
            }
        };

        tokio::time::timeout(self.timeout, wait).await.map_err(|_| {
            tracing::warn!(
                "Gave up waiting for a writer slot after {:?} ({} frames queued)",
                self.timeout,
                self.pending_count()
            );
            DuplexError::BackpressureTimeout
        })
    }

    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Give back `count` slots and wake parked writers.
    pub fn release_many(&self, count: usize) {
        let _ = self
            .slots
            .taken
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            });
        self.slots.freed.notify_waiters();
    }
}
