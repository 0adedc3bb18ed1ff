//! Document store database: connection setup and schema versions.
//!
//! # Responsibility
//! - Hand out SQLite connections that already carry the revision, checkpoint
//!   and column-change tables.
//!
//! # Invariants
//! - The schema version lives in `PRAGMA user_version`; a store written by
//!   a newer binary is refused rather than downgraded.
//! - Each migration commits on its own, so a failure leaves the store at the
//!   last fully applied version.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// The store was created by a newer build.
    SchemaTooNew { found: u32, supported: u32 },
    /// Migration `version` failed and was rolled back.
    Migration {
        version: u32,
        name: &'static str,
        source: rusqlite::Error,
    },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "document store: {err}"),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "document store schema v{found} was written by a newer build (this build reads up to v{supported})"
            ),
            Self::Migration {
                version,
                name,
                source,
            } => write!(f, "document store migration v{version} ({name}) failed: {source}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::Migration { source: err, .. } => Some(err),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
