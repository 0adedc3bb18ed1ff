//! Column-level change record for structured tables.
//!
//! # Responsibility
//! - Carry one column write together with its version vector coordinates.
//! - Define the total order used to pick a converged column value.
//!
//! # Invariants
//! - A greater `causal_length` always wins, whatever the other fields are.
//! - Otherwise the greater `(db_version, site_id)` pair wins.
//! - `column_version` and `sequence` only separate records that share
//!   `(db_version, site_id)`; `value` is the last resort so the order is total.

use crate::model::site::SiteId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Column name used for row lifecycle (delete/resurrect) records.
pub const ROW_SENTINEL_COLUMN: &str = "-1";

/// Typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl ColumnValue {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Integer(_) => 2,
            Self::Real(_) => 3,
            Self::Text(_) => 4,
            Self::Blob(_) => 5,
        }
    }

    /// Deterministic total order across value kinds.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Real(a), Self::Real(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Blob(a), Self::Blob(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Address of one converged column cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnKey {
    pub table: String,
    pub primary_key: String,
    pub column: String,
}

/// Structured-table CRDT unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub primary_key: String,
    pub column: String,
    pub value: ColumnValue,
    /// Writes to this column at the originating site.
    pub column_version: u64,
    /// Originating site's transaction counter.
    pub db_version: u64,
    pub site_id: SiteId,
    /// Delete/undelete cycles of the row; odd means live.
    pub causal_length: u64,
    /// Order within one transaction.
    pub sequence: u32,
}

impl ChangeRecord {
    pub fn key(&self) -> ColumnKey {
        ColumnKey {
            table: self.table.clone(),
            primary_key: self.primary_key.clone(),
            column: self.column.clone(),
        }
    }

    pub fn is_row_sentinel(&self) -> bool {
        self.column == ROW_SENTINEL_COLUMN
    }

    /// Merge precedence between two records for the same column.
    pub fn precedence_cmp(&self, other: &Self) -> Ordering {
        self.causal_length
            .cmp(&other.causal_length)
            .then_with(|| self.db_version.cmp(&other.db_version))
            .then_with(|| self.site_id.cmp(&other.site_id))
            .then_with(|| self.column_version.cmp(&other.column_version))
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.value.total_cmp(&other.value))
    }
}
