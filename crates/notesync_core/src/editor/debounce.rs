//! Debounce timer for draft persistence.
//!
//! Provides:
//! - `Debouncer` - per-document quiet-period deadlines
//!
//! Each keystroke calls `schedule`, pushing the document's deadline out by the
//! configured delay. Only documents whose deadline has passed are returned by
//! `drain_due`, so a burst of edits collapses into one persisted write.

use crate::model::document::DocumentId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Debouncer {
    /// Pending documents -> fire time.
    pending: HashMap<DocumentId, Instant>,
    delay: Duration,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// (Re)starts the quiet period for `id`.
    pub fn schedule(&mut self, id: DocumentId) {
        self.schedule_at(id, Instant::now());
    }

    pub fn schedule_at(&mut self, id: DocumentId, now: Instant) {
        let fire_at = now + self.delay;
        let entry = self.pending.entry(id).or_insert(fire_at);
        // Restarting never moves a deadline earlier.
        *entry = (*entry).max(fire_at);
    }

    /// Cancels a pending deadline. Returns whether one existed.
    pub fn cancel(&mut self, id: DocumentId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, id: DocumentId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Removes and returns documents due at `now`, earliest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<DocumentId> {
        let mut due: Vec<(Instant, DocumentId)> = self
            .pending
            .iter()
            .filter(|(_, fire_at)| **fire_at <= now)
            .map(|(id, fire_at)| (*fire_at, *id))
            .collect();
        due.sort();
        for (_, id) in &due {
            self.pending.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }
}
