//! Column-level CRDT merge for structured tables.
//!
//! # Responsibility
//! - Keep the winning change record per `(table, pk, column)`.
//! - Stamp local writes and row deletions with version coordinates.
//! - Emit winners for delivery to other sites and persist them locally.
//!
//! # Invariants
//! - The winner of a column is the maximum of every record seen for it under
//!   `ChangeRecord::precedence_cmp`, so delivery order and repetition never
//!   change the result.
//! - A row's causal length is the greatest causal length among its winners;
//!   the row is live iff that value is odd.
//! - A column value is visible only while the row is live and the column
//!   was written in the row's current life.
//! - Local `db_version` is one above every version observed so far.
//! - Records for unknown, local-only or sync-excluded tables are ignored.

use crate::model::change_record::{ChangeRecord, ColumnKey, ColumnValue, ROW_SENTINEL_COLUMN};
use crate::model::site::SiteId;
use crate::model::table_schema::SchemaRegistry;
use crate::service::local_store::{LocalStore, StoreResult};
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result of applying one change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyOutcome {
    /// The record became the column winner.
    Applied,
    /// A record with greater precedence is already the winner.
    Superseded,
    /// The identical record is already the winner.
    Duplicate,
    /// The table or column does not take part in merging.
    Ignored,
}

/// Outcome counts of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    pub superseded: usize,
    pub duplicate: usize,
    pub ignored: usize,
}

impl ApplySummary {
    fn count(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Superseded => self.superseded += 1,
            ApplyOutcome::Duplicate => self.duplicate += 1,
            ApplyOutcome::Ignored => self.ignored += 1,
        }
    }
}

/// Rejected local write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalWriteError {
    UnknownTable(String),
    UnknownColumn { table: String, column: String },
    TypeMismatch { table: String, column: String },
}

impl Display for LocalWriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTable(table) => write!(f, "unknown table: {table}"),
            Self::UnknownColumn { table, column } => {
                write!(f, "unknown column `{column}` in table `{table}`")
            }
            Self::TypeMismatch { table, column } => {
                write!(f, "value does not match type of `{table}.{column}`")
            }
        }
    }
}

impl Error for LocalWriteError {}

/// Converged column state of one replica.
pub struct ColumnVersionMerger {
    site: SiteId,
    registry: SchemaRegistry,
    winners: BTreeMap<ColumnKey, ChangeRecord>,
    max_db_version: u64,
    /// Winners changed since the last `persist`.
    dirty: BTreeSet<ColumnKey>,
}

impl ColumnVersionMerger {
    pub fn new(site: SiteId, registry: SchemaRegistry) -> Self {
        Self {
            site,
            registry,
            winners: BTreeMap::new(),
            max_db_version: 0,
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuilds merger state from previously persisted winners.
    pub fn restore(
        site: SiteId,
        registry: SchemaRegistry,
        records: impl IntoIterator<Item = ChangeRecord>,
    ) -> Self {
        let mut merger = Self::new(site, registry);
        for record in records {
            merger.apply(record);
        }
        merger.dirty.clear();
        merger
    }

    /// Opens the merger with the winners stored in `store`.
    pub fn load(store: &LocalStore, registry: SchemaRegistry) -> StoreResult<Self> {
        let records = store.load_column_winners()?;
        let merger = Self::restore(store.site_id().clone(), registry, records);
        debug!(
            "event=column_restore module=merge status=ok columns={} db_version={}",
            merger.winners.len(),
            merger.max_db_version
        );
        Ok(merger)
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Highest `db_version` observed from any site.
    pub fn db_version(&self) -> u64 {
        self.max_db_version
    }

    /// Merges one record from any site.
    pub fn apply(&mut self, record: ChangeRecord) -> ApplyOutcome {
        if !self.accepts(&record) {
            return ApplyOutcome::Ignored;
        }
        self.max_db_version = self.max_db_version.max(record.db_version);

        let key = record.key();
        let outcome = match self.winners.get(&key) {
            None => ApplyOutcome::Applied,
            Some(current) => match record.precedence_cmp(current) {
                Ordering::Greater => ApplyOutcome::Applied,
                Ordering::Equal => ApplyOutcome::Duplicate,
                Ordering::Less => ApplyOutcome::Superseded,
            },
        };
        if outcome == ApplyOutcome::Applied {
            self.winners.insert(key.clone(), record);
            self.dirty.insert(key);
        }
        outcome
    }

    /// Merges many records in delivery order.
    pub fn apply_batch(&mut self, records: impl IntoIterator<Item = ChangeRecord>) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for record in records {
            summary.count(self.apply(record));
        }
        debug!(
            "event=column_merge module=merge status=ok applied={} superseded={} duplicate={} ignored={}",
            summary.applied, summary.superseded, summary.duplicate, summary.ignored
        );
        summary
    }

    fn accepts(&self, record: &ChangeRecord) -> bool {
        if !self.registry.is_replicated(&record.table) {
            return false;
        }
        if record.is_row_sentinel() {
            return true;
        }
        self.registry
            .table(&record.table)
            .and_then(|schema| schema.column_type(&record.column))
            .is_some_and(|kind| kind.accepts(&record.value))
    }

    /// Writes columns of one row in a single local transaction.
    ///
    /// Returns the produced records, empty for local-only or sync-excluded
    /// tables. Writing to a deleted row resurrects it.
    pub fn write_local(
        &mut self,
        table: &str,
        primary_key: &str,
        values: Vec<(String, ColumnValue)>,
    ) -> Result<Vec<ChangeRecord>, LocalWriteError> {
        let schema = self
            .registry
            .table(table)
            .ok_or_else(|| LocalWriteError::UnknownTable(table.to_string()))?;
        for (column, value) in &values {
            let kind = schema
                .column_type(column)
                .ok_or_else(|| LocalWriteError::UnknownColumn {
                    table: table.to_string(),
                    column: column.clone(),
                })?;
            if !kind.accepts(value) {
                return Err(LocalWriteError::TypeMismatch {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }
        if !self.registry.is_replicated(table) {
            return Ok(Vec::new());
        }

        let db_version = self.next_db_version();
        let row_length = self.row_causal_length(table, primary_key);
        let causal_length = if row_length % 2 == 0 {
            row_length + 1
        } else {
            row_length
        };

        let mut pending = Vec::with_capacity(values.len() + 1);
        if causal_length != row_length {
            pending.push((ROW_SENTINEL_COLUMN.to_string(), ColumnValue::Null));
        }
        pending.extend(values);

        let mut records = Vec::with_capacity(pending.len());
        for (sequence, (column, value)) in pending.into_iter().enumerate() {
            let record = self.local_record(
                table,
                primary_key,
                column,
                value,
                db_version,
                causal_length,
                u32::try_from(sequence).unwrap_or(u32::MAX),
            );
            self.apply(record.clone());
            records.push(record);
        }

        info!(
            "event=column_write module=merge status=ok table={table} columns={} db_version={db_version}",
            records.len()
        );
        Ok(records)
    }

    /// Deletes a row by bumping its causal length to the next even value.
    ///
    /// Returns `None` when the row is not live or the table is not merged.
    pub fn delete_row(&mut self, table: &str, primary_key: &str) -> Option<ChangeRecord> {
        if !self.registry.is_replicated(table) {
            return None;
        }
        let row_length = self.row_causal_length(table, primary_key);
        if row_length % 2 == 0 {
            return None;
        }

        let db_version = self.next_db_version();
        let record = self.local_record(
            table,
            primary_key,
            ROW_SENTINEL_COLUMN.to_string(),
            ColumnValue::Null,
            db_version,
            row_length + 1,
            0,
        );
        self.apply(record.clone());
        info!("event=row_delete module=merge status=ok table={table} db_version={db_version}");
        Some(record)
    }

    fn next_db_version(&mut self) -> u64 {
        self.max_db_version += 1;
        self.max_db_version
    }

    #[allow(clippy::too_many_arguments)]
    fn local_record(
        &self,
        table: &str,
        primary_key: &str,
        column: String,
        value: ColumnValue,
        db_version: u64,
        causal_length: u64,
        sequence: u32,
    ) -> ChangeRecord {
        let key = ColumnKey {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            column,
        };
        let column_version = self
            .winners
            .get(&key)
            .map_or(1, |current| current.column_version + 1);
        ChangeRecord {
            table: key.table,
            primary_key: key.primary_key,
            column: key.column,
            value,
            column_version,
            db_version,
            site_id: self.site.clone(),
            causal_length,
            sequence,
        }
    }

    fn row_winners<'a>(
        &'a self,
        table: &'a str,
        primary_key: &'a str,
    ) -> impl Iterator<Item = &'a ChangeRecord> + 'a {
        let start = ColumnKey {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            column: String::new(),
        };
        self.winners
            .range(start..)
            .take_while(move |(key, _)| key.table == table && key.primary_key == primary_key)
            .map(|(_, record)| record)
    }

    /// Greatest causal length seen for the row, 0 when never written.
    pub fn row_causal_length(&self, table: &str, primary_key: &str) -> u64 {
        self.row_winners(table, primary_key)
            .map(|record| record.causal_length)
            .max()
            .unwrap_or(0)
    }

    pub fn is_row_live(&self, table: &str, primary_key: &str) -> bool {
        self.row_causal_length(table, primary_key) % 2 == 1
    }

    /// Converged value of one column, `None` when the row is not live or the
    /// column was not written in the row's current life.
    pub fn value(&self, table: &str, primary_key: &str, column: &str) -> Option<&ColumnValue> {
        let row_length = self.row_causal_length(table, primary_key);
        if row_length % 2 == 0 {
            return None;
        }
        let key = ColumnKey {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            column: column.to_string(),
        };
        self.winners
            .get(&key)
            .filter(|record| record.causal_length == row_length && !record.is_row_sentinel())
            .map(|record| &record.value)
    }

    /// Visible columns of one live row.
    pub fn row(&self, table: &str, primary_key: &str) -> Option<BTreeMap<String, ColumnValue>> {
        let row_length = self.row_causal_length(table, primary_key);
        if row_length % 2 == 0 {
            return None;
        }
        Some(
            self.row_winners(table, primary_key)
                .filter(|record| record.causal_length == row_length && !record.is_row_sentinel())
                .map(|record| (record.column.clone(), record.value.clone()))
                .collect(),
        )
    }

    /// Current winner record of one column, including stale lives.
    pub fn winner(&self, key: &ColumnKey) -> Option<&ChangeRecord> {
        self.winners.get(key)
    }

    /// Winners with `db_version` greater than `since`, in version order.
    pub fn changes_since(&self, since: u64) -> Vec<ChangeRecord> {
        let mut records: Vec<ChangeRecord> = self
            .winners
            .values()
            .filter(|record| record.db_version > since)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.db_version
                .cmp(&b.db_version)
                .then_with(|| a.site_id.cmp(&b.site_id))
                .then_with(|| a.sequence.cmp(&b.sequence))
                .then_with(|| a.key().cmp(&b.key()))
        });
        records
    }

    /// Saves winners changed since the last call.
    pub fn persist(&mut self, store: &LocalStore) -> StoreResult<usize> {
        let records: Vec<ChangeRecord> = self
            .dirty
            .iter()
            .filter_map(|key| self.winners.get(key).cloned())
            .collect();
        store.save_column_winners(&records)?;
        self.dirty.clear();
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{ApplyOutcome, ColumnVersionMerger};
    use crate::config::SyncRules;
    use crate::model::change_record::ColumnValue;
    use crate::model::site::SiteId;
    use crate::model::table_schema::{ColumnType, SchemaRegistry, TableSchema};

    fn merger(site: &str) -> ColumnVersionMerger {
        let mut registry = SchemaRegistry::new(SyncRules::default());
        registry
            .register(
                TableSchema::new("tasks")
                    .column("title", ColumnType::Text)
                    .column("done", ColumnType::Boolean),
            )
            .expect("tasks should register");
        ColumnVersionMerger::new(SiteId::new(site).expect("valid site"), registry)
    }

    fn text(value: &str) -> ColumnValue {
        ColumnValue::Text(value.to_string())
    }

    #[test]
    fn local_write_stamps_one_transaction() {
        let mut merger = merger("s1");
        let records = merger
            .write_local(
                "tasks",
                "1",
                vec![
                    ("title".to_string(), text("a")),
                    ("done".to_string(), ColumnValue::Boolean(false)),
                ],
            )
            .expect("write should succeed");

        assert_eq!(records.len(), 3);
        assert!(records[0].is_row_sentinel());
        assert!(records.iter().all(|record| record.db_version == 1));
        assert!(records.iter().all(|record| record.causal_length == 1));
        let sequences: Vec<u32> = records.iter().map(|record| record.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(merger.value("tasks", "1", "title"), Some(&text("a")));

        let second = merger
            .write_local("tasks", "1", vec![("title".to_string(), text("b"))])
            .expect("write should succeed");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].db_version, 2);
        assert_eq!(second[0].column_version, 2);
    }

    #[test]
    fn delete_then_write_resurrects_row_without_stale_columns() {
        let mut merger = merger("s1");
        merger
            .write_local(
                "tasks",
                "1",
                vec![
                    ("title".to_string(), text("a")),
                    ("done".to_string(), ColumnValue::Boolean(true)),
                ],
            )
            .expect("write should succeed");

        let tombstone = merger.delete_row("tasks", "1").expect("row is live");
        assert_eq!(tombstone.causal_length, 2);
        assert!(!merger.is_row_live("tasks", "1"));
        assert!(merger.value("tasks", "1", "title").is_none());
        assert!(merger.delete_row("tasks", "1").is_none());

        merger
            .write_local("tasks", "1", vec![("title".to_string(), text("again"))])
            .expect("write should succeed");
        assert!(merger.is_row_live("tasks", "1"));
        assert_eq!(merger.row_causal_length("tasks", "1"), 3);
        assert_eq!(merger.value("tasks", "1", "title"), Some(&text("again")));
        assert!(merger.value("tasks", "1", "done").is_none());
    }

    #[test]
    fn rejects_invalid_local_writes_and_ignores_unknown_records() {
        let mut merger = merger("s1");
        assert!(merger
            .write_local("missing", "1", vec![("title".to_string(), text("a"))])
            .is_err());
        assert!(merger
            .write_local("tasks", "1", vec![("title".to_string(), ColumnValue::Integer(1))])
            .is_err());

        let mut other = self::merger("s2");
        let mut record = other
            .write_local("tasks", "1", vec![("title".to_string(), text("a"))])
            .expect("write should succeed")
            .remove(1);
        record.table = "unknown".to_string();
        assert_eq!(merger.apply(record), ApplyOutcome::Ignored);
        assert_eq!(merger.db_version(), 0);
    }
}
