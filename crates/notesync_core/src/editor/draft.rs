//! In-memory draft text per open document.
//!
//! # Invariants
//! - Drafts are never persisted or synchronized.
//! - `set` overwrites; there is no merge.
//! - Clearing a draft never touches the local store.

use crate::model::document::DocumentId;
use std::collections::HashMap;

/// Uncommitted text staging, decoupling keystrokes from persistence.
#[derive(Debug, Default)]
pub struct DraftBuffer {
    drafts: HashMap<DocumentId, String>,
}

impl DraftBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current draft, or an empty string when none is staged.
    pub fn get(&self, id: DocumentId) -> &str {
        self.drafts.get(&id).map_or("", String::as_str)
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.drafts.contains_key(&id)
    }

    pub fn set(&mut self, id: DocumentId, text: impl Into<String>) {
        self.drafts.insert(id, text.into());
    }

    pub fn clear(&mut self, id: DocumentId) {
        self.drafts.remove(&id);
    }

    pub fn clear_all(&mut self) {
        self.drafts.clear();
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}
