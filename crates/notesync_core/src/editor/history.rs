//! Per-document undo/redo history.
//!
//! # Responsibility
//! - Keep a bounded, ordered log of text snapshots with cursor positions.
//! - Move a cursor through the log for undo/redo.
//!
//! # Invariants
//! - The stack is never empty and `current_index < len()`.
//! - Recording after an undo discards the redo branch.
//! - Two consecutive entries never carry the same text.
//! - `len() <= limit`; the oldest entry is evicted first.
//! - Boundary operations are no-ops that return `None`.

use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Immutable text snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub text: String,
    /// Cursor offset in the text at snapshot time.
    pub cursor: usize,
}

#[derive(Debug, Clone)]
pub struct HistoryStack {
    entries: VecDeque<HistoryEntry>,
    current_index: usize,
    limit: usize,
}

impl HistoryStack {
    /// Starts a history holding `text` with the default limit.
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_limit(text, DEFAULT_HISTORY_LIMIT)
    }

    /// Starts a history holding `text`. A zero limit is raised to one.
    pub fn with_limit(text: impl Into<String>, limit: usize) -> Self {
        let mut entries = VecDeque::with_capacity(limit.clamp(1, 64));
        entries.push_back(HistoryEntry {
            text: text.into(),
            cursor: 0,
        });
        Self {
            entries,
            current_index: 0,
            limit: limit.max(1),
        }
    }

    /// Records a snapshot.
    ///
    /// Returns `false` when the text equals the current entry.
    pub fn record(&mut self, text: impl Into<String>, cursor: usize) -> bool {
        let text = text.into();
        self.entries.truncate(self.current_index + 1);

        if self.entries[self.current_index].text == text {
            return false;
        }

        self.entries.push_back(HistoryEntry { text, cursor });
        if self.entries.len() > self.limit {
            // Shifting the log keeps `current_index` on the new tail.
            self.entries.pop_front();
        } else {
            self.current_index += 1;
        }
        true
    }

    pub fn undo(&mut self) -> Option<&HistoryEntry> {
        if self.current_index == 0 {
            return None;
        }
        self.current_index -= 1;
        self.entries.get(self.current_index)
    }

    pub fn redo(&mut self) -> Option<&HistoryEntry> {
        if self.current_index + 1 >= self.entries.len() {
            return None;
        }
        self.current_index += 1;
        self.entries.get(self.current_index)
    }

    /// Resets to a single entry.
    pub fn clear(&mut self, text: impl Into<String>) {
        self.entries.clear();
        self.entries.push_back(HistoryEntry {
            text: text.into(),
            cursor: 0,
        });
        self.current_index = 0;
    }

    pub fn can_undo(&self) -> bool {
        self.current_index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.current_index + 1 < self.entries.len()
    }

    pub fn current(&self) -> &HistoryEntry {
        &self.entries[self.current_index]
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
