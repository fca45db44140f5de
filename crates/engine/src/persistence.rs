//! Debounced save scheduling.
//!
//! [`SaveScheduler`] decides *when* the learning store should be flushed;
//! the guardian performs the flush. Three triggers exist:
//!
//! - **debounce**: every ordinary change re-arms a deadline `D` seconds out,
//!   so a burst of events produces a single save once it quiets down;
//! - **priority**: a transition into late/stale arms a deadline `P` seconds
//!   out, never later than one already pending, and ordinary changes cannot
//!   push it back;
//! - **backstop**: every `M` seconds, flush if anything changed since the
//!   last successful flush, however often the debounce was re-armed.

use std::collections::HashSet;
use std::time::Duration;

use lastseen_core::types::EntityId;
use serde::Serialize;
use tokio::time::Instant;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(30);
pub const DEFAULT_PRIORITY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKSTOP: Duration = Duration::from_secs(300);

/// Timing parameters for [`SaveScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub debounce: Duration,
    pub priority_delay: Duration,
    pub backstop: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            priority_delay: DEFAULT_PRIORITY_DELAY,
            backstop: DEFAULT_BACKSTOP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSave {
    deadline: Instant,
    priority: bool,
}

/// Snapshot of the scheduler for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceStatus {
    pub pending: bool,
    pub pending_priority: bool,
    /// Seconds until the pending deadline.
    pub due_in_secs: Option<f64>,
    pub changed_entities: usize,
    pub flush_count: u64,
    pub failed_flushes: u64,
    /// Seconds since the last successful flush.
    pub last_flush_secs_ago: Option<f64>,
}

/// Deadline bookkeeping for debounced persistence.
#[derive(Debug)]
pub struct SaveScheduler {
    config: PersistenceConfig,
    pending: Option<PendingSave>,
    changed: HashSet<EntityId>,
    last_flush: Option<Instant>,
    flush_count: u64,
    failed_flushes: u64,
}

impl SaveScheduler {
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            pending: None,
            changed: HashSet::new(),
            last_flush: None,
            flush_count: 0,
            failed_flushes: 0,
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Record that an entity's learning state changed.
    pub fn mark_changed(&mut self, entity_id: &str) {
        if !self.changed.contains(entity_id) {
            self.changed.insert(entity_id.to_string());
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn changed_count(&self) -> usize {
        self.changed.len()
    }

    /// Arm or re-arm the save deadline.
    pub fn schedule(&mut self, priority: bool, now: Instant) {
        if priority {
            let deadline = now + self.config.priority_delay;
            match self.pending {
                Some(p) if p.deadline <= deadline => {
                    self.pending = Some(PendingSave {
                        deadline: p.deadline,
                        priority: true,
                    });
                }
                _ => {
                    self.pending = Some(PendingSave {
                        deadline,
                        priority: true,
                    });
                }
            }
            return;
        }

        match self.pending {
            Some(p) if p.priority => {}
            _ => {
                self.pending = Some(PendingSave {
                    deadline: now + self.config.debounce,
                    priority: false,
                });
            }
        }
    }

    /// The pending deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    pub fn is_priority_pending(&self) -> bool {
        self.pending.is_some_and(|p| p.priority)
    }

    /// Disarm the pending deadline before a flush starts.
    ///
    /// Requests arriving while the flush runs arm a fresh deadline.
    pub fn take_pending(&mut self) {
        self.pending = None;
    }

    /// Whether the backstop tick should flush.
    pub fn backstop_due(&self) -> bool {
        self.has_changes()
    }

    /// Record a successful flush of `flushed` (the changed set taken when
    /// the flush began).
    pub fn on_flush_success(&mut self, flushed: &HashSet<EntityId>, now: Instant) {
        self.changed.retain(|id| !flushed.contains(id));
        self.last_flush = Some(now);
        self.flush_count += 1;
    }

    /// Record a failed flush; the changed set is kept for the next attempt.
    pub fn on_flush_failure(&mut self) {
        self.failed_flushes += 1;
    }

    /// Snapshot of the entities changed since the last successful flush.
    pub fn changed_snapshot(&self) -> HashSet<EntityId> {
        self.changed.clone()
    }

    pub fn status(&self, now: Instant) -> PersistenceStatus {
        PersistenceStatus {
            pending: self.pending.is_some(),
            pending_priority: self.is_priority_pending(),
            due_in_secs: self
                .pending
                .map(|p| p.deadline.saturating_duration_since(now).as_secs_f64()),
            changed_entities: self.changed.len(),
            flush_count: self.flush_count,
            failed_flushes: self.failed_flushes,
            last_flush_secs_ago: self
                .last_flush
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
        }
    }
}

impl Default for SaveScheduler {
    fn default() -> Self {
        Self::new(PersistenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn ordinary_changes_rearm_debounce() {
        let mut scheduler = SaveScheduler::default();
        let t0 = Instant::now();

        scheduler.schedule(false, t0);
        assert_eq!(scheduler.deadline(), Some(t0 + secs(30)));

        scheduler.schedule(false, t0 + secs(10));
        assert_eq!(scheduler.deadline(), Some(t0 + secs(40)));
        assert!(!scheduler.is_priority_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn priority_shortens_but_never_lengthens() {
        let mut scheduler = SaveScheduler::default();
        let t0 = Instant::now();

        scheduler.schedule(false, t0);
        scheduler.schedule(true, t0 + secs(1));
        assert_eq!(scheduler.deadline(), Some(t0 + secs(6)));

        // A second priority request later does not push the deadline out.
        scheduler.schedule(true, t0 + secs(3));
        assert_eq!(scheduler.deadline(), Some(t0 + secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn ordinary_change_does_not_postpone_priority() {
        let mut scheduler = SaveScheduler::default();
        let t0 = Instant::now();

        scheduler.schedule(true, t0);
        scheduler.schedule(false, t0 + secs(2));
        assert_eq!(scheduler.deadline(), Some(t0 + secs(5)));
        assert!(scheduler.is_priority_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn priority_keeps_earlier_debounce_deadline() {
        let config = PersistenceConfig {
            debounce: secs(3),
            ..PersistenceConfig::default()
        };
        let mut scheduler = SaveScheduler::new(config);
        let t0 = Instant::now();

        scheduler.schedule(false, t0);
        scheduler.schedule(true, t0);
        assert_eq!(scheduler.deadline(), Some(t0 + secs(3)));
        assert!(scheduler.is_priority_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_outcomes_update_changed_set() {
        let mut scheduler = SaveScheduler::default();
        let t0 = Instant::now();
        scheduler.mark_changed("sensor.a");
        scheduler.mark_changed("sensor.b");

        let flushed = scheduler.changed_snapshot();
        scheduler.on_flush_failure();
        assert_eq!(scheduler.changed_count(), 2);

        // A change arriving during the flush survives it.
        scheduler.mark_changed("sensor.c");
        scheduler.on_flush_success(&flushed, t0);
        assert_eq!(scheduler.changed_count(), 1);
        assert!(scheduler.backstop_due());

        let status = scheduler.status(t0 + secs(7));
        assert_eq!(status.flush_count, 1);
        assert_eq!(status.failed_flushes, 1);
        assert_eq!(status.last_flush_secs_ago, Some(7.0));
    }
}
