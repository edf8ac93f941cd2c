//! Diagnostic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the engine's components.
#[derive(Default, Debug)]
pub(crate) struct Counters {
    pub(crate) fetches_issued:     AtomicU64,
    pub(crate) reentrant_triggers: AtomicU64,
    pub(crate) watchdog_warnings:  AtomicU64,
    pub(crate) tasks_completed:    AtomicU64,
    pub(crate) handler_failures:   AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStats {
        EngineStats {
            fetches_issued:     self.fetches_issued.load(Ordering::Relaxed),
            reentrant_triggers: self.reentrant_triggers.load(Ordering::Relaxed),
            watchdog_warnings:  self.watchdog_warnings.load(Ordering::Relaxed),
            tasks_completed:    self.tasks_completed.load(Ordering::Relaxed),
            handler_failures:   self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine's diagnostic counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Network fetches actually issued (after deduplication).
    pub fetches_issued:     u64,
    /// Triggers that joined an already in-flight fetch.
    pub reentrant_triggers: u64,
    /// "Handle too long" warnings fired.
    pub watchdog_warnings:  u64,
    /// Queued tasks that ran to completion (successfully or not).
    pub tasks_completed:    u64,
    /// Update handler failures routed to the client's error handler.
    pub handler_failures:   u64,
}
