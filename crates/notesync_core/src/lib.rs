//! Core synchronization and edit-history logic for NoteSync.
//! This crate is the single source of truth for merge and history invariants.

pub mod config;
pub mod db;
pub mod editor;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod sync;

pub use config::{AppConfig, ConfigError, SyncRules};
pub use editor::draft::DraftBuffer;
pub use editor::history::{HistoryEntry, HistoryStack};
pub use editor::session::EditorSession;
pub use logging::{default_log_level, init_from_config, init_logging, logging_status, LoggingError};
pub use model::change_record::{ChangeRecord, ColumnValue};
pub use model::document::{ChangeOrigin, Document, DocumentId, RevisionPayload};
pub use model::revision::{Revision, RevisionId};
pub use model::revision_tree::RevisionTree;
pub use model::site::SiteId;
pub use model::table_schema::{ColumnType, SchemaRegistry, TableSchema};
pub use service::local_store::{LocalStore, StoreError, StoreResult};
pub use sync::column_merge::{ApplyOutcome, ColumnVersionMerger};
pub use sync::memory_remote::MemoryRemote;
pub use sync::remote::{RemoteEndpoint, RemoteError, RemoteErrorKind};
pub use sync::replication::{
    ReplicationEngine, ReplicationEvent, ReplicationHandle, ReplicationOptions, ReplicationState,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
