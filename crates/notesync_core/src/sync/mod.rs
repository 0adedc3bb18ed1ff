//! Synchronization with other replicas.
//!
//! # Responsibility
//! - Replicate whole documents through revision trees (`replication`).
//! - Converge structured-table columns through version vectors
//!   (`column_merge`).
//! - Describe the remote endpoint contract (`remote`) with an in-process
//!   implementation (`memory_remote`).
//!
//! # Invariants
//! - Both paths funnel writes into the local store; neither overwrites
//!   state without going through its merge rule.

pub mod backoff;
pub mod broadcast;
pub mod column_merge;
pub mod memory_remote;
pub mod remote;
pub mod replication;
