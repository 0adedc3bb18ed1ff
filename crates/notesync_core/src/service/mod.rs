//! Core use-case services.
//!
//! # Responsibility
//! - Own canonical document state behind an explicitly constructed store.
//! - Keep editor and sync layers decoupled from storage details.

pub mod local_store;
pub mod subscription;
