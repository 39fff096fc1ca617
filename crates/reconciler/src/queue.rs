//! Deduplicating, delay-aware work queue.
//!
//! Holds at most one entry per key. Adding a key that is already pending
//! merges the reasons and keeps the earlier ready time. A key handed to a
//! worker is "processing" until [`WorkQueue::done`]; new work for it waits
//! in the pending set, so no key is ever processed twice at once and no
//! event that arrives mid-cycle is lost.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::retry::Backoff;
use crate::types::{Reason, ResourceKey, WorkItem};

/// Cap for delays too large to represent as an instant.
const MAX_DELAY: Duration = Duration::from_secs(86_400);

#[derive(Debug)]
struct PendingItem {
    reasons: BTreeSet<Reason>,
    ready_at: Instant,
    /// Insertion order among items ready at the same instant.
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: HashMap<ResourceKey, PendingItem>,
    processing: HashSet<ResourceKey>,
    failures: HashMap<ResourceKey, u32>,
    next_seq: u64,
    shutting_down: bool,
}

impl QueueState {
    fn eligible(&self) -> impl Iterator<Item = (&ResourceKey, &PendingItem)> {
        self.pending
            .iter()
            .filter(|(key, _)| !self.processing.contains(*key))
    }

    fn pop_ready(&mut self, now: Instant) -> Option<WorkItem> {
        let key = self
            .eligible()
            .filter(|(_, item)| item.ready_at <= now)
            .min_by_key(|(_, item)| (item.ready_at, item.seq))
            .map(|(key, _)| key.clone())?;

        let item = self.pending.remove(&key)?;
        self.processing.insert(key.clone());
        Some(WorkItem {
            key,
            reasons: item.reasons,
        })
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.eligible().map(|(_, item)| item.ready_at).min()
    }
}

/// Work queue shared by the loop's workers.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: Backoff,
}

impl WorkQueue {
    /// Create a queue whose per-key failure backoff follows `limiter`.
    #[must_use]
    pub fn new(limiter: Backoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter,
        }
    }

    // Critical sections never panic, so a poisoned lock still holds
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `key` for immediate processing.
    ///
    /// Returns `false` once the queue is shutting down.
    pub fn add(&self, key: ResourceKey, reason: Reason) -> bool {
        self.add_after(key, reason, Duration::ZERO)
    }

    /// Enqueue `key` to become ready after `delay`.
    ///
    /// If the key is already pending, reasons merge and the earlier of the
    /// two ready times wins. Returns `false` once the queue is shutting down.
    pub fn add_after(&self, key: ResourceKey, reason: Reason, delay: Duration) -> bool {
        let now = Instant::now();
        let ready_at = now
            .checked_add(delay)
            .or_else(|| now.checked_add(MAX_DELAY))
            .unwrap_or(now);
        {
            let mut state = self.lock();
            if state.shutting_down {
                return false;
            }

            if let Some(item) = state.pending.get_mut(&key) {
                item.reasons.insert(reason);
                item.ready_at = item.ready_at.min(ready_at);
                trace!(key = %key, reason = %reason, "Merged into pending item");
            } else {
                let seq = state.next_seq;
                state.next_seq = state.next_seq.wrapping_add(1);
                trace!(key = %key, reason = %reason, delay_ms = delay.as_millis(), "Enqueued");
                state.pending.insert(
                    key,
                    PendingItem {
                        reasons: BTreeSet::from([reason]),
                        ready_at,
                        seq,
                    },
                );
            }
        }
        self.notify.notify_waiters();
        true
    }

    /// Take a ready item without waiting.
    pub fn try_next(&self) -> Option<WorkItem> {
        let mut state = self.lock();
        if state.shutting_down {
            return None;
        }
        state.pop_ready(Instant::now())
    }

    /// Wait for the next ready item.
    ///
    /// Returns `None` once the queue is shut down. Items still pending at
    /// that point are abandoned.
    pub async fn next(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add is seen.
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.pop_ready(Instant::now()) {
                    return Some(item);
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `key` as no longer processing.
    ///
    /// Work that arrived for it in the meantime becomes eligible.
    pub fn done(&self, key: &ResourceKey) {
        let woke = self.lock().processing.remove(key);
        if woke {
            self.notify.notify_waiters();
        }
    }

    /// Record a failed cycle for `key` and return its backoff delay.
    pub fn rate_limited_delay(&self, key: &ResourceKey) -> Duration {
        let failures = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures = failures.saturating_add(1);
            *failures
        };
        self.limiter.delay_for(failures)
    }

    /// Drop `key`'s pending entry if every reason on it is automatic.
    ///
    /// Used after a fatal cycle: a resync that merged in while the cycle ran
    /// must not retry the key. Returns whether an entry was dropped.
    pub fn discard_automatic(&self, key: &ResourceKey) -> bool {
        let mut state = self.lock();
        let automatic = state
            .pending
            .get(key)
            .is_some_and(|item| item.reasons.iter().all(|r| r.is_automatic()));
        if automatic {
            state.pending.remove(key);
            trace!(key = %key, "Discarded automatic retry");
        }
        automatic
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &ResourceKey) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failed cycles recorded for `key`.
    #[must_use]
    pub fn failures(&self, key: &ResourceKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Stop accepting work and wake every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of pending (not yet dequeued) items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Number of keys currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    #[must_use]
    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.lock().pending.contains_key(key)
    }

    #[must_use]
    pub fn is_processing(&self, key: &ResourceKey) -> bool {
        self.lock().processing.contains(key)
    }
}
