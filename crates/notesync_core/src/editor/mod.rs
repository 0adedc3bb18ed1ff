//! Editing pipeline: keystrokes to drafts, drafts to storage.
//!
//! # Responsibility
//! - Decouple input rate from persistence (`draft`, `debounce`).
//! - Track per-document undo/redo (`history`).
//! - Coordinate both against the local store (`session`).

pub mod debounce;
pub mod draft;
pub mod history;
pub mod session;
