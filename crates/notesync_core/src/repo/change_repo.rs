//! Column change repository.
//!
//! # Responsibility
//! - Persist the winning change record per `(table, pk, column)`.
//! - Reload winners so a merger survives restarts.
//!
//! # Invariants
//! - At most one row per column key; saving replaces the previous winner.
//! - Callers decide precedence; this layer never compares versions.

use crate::model::change_record::{ChangeRecord, ColumnValue};
use crate::model::site::SiteId;
use crate::repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, Row};

pub struct SqliteChangeRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteChangeRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Stores `record` as the current winner of its column.
    pub fn save_winner(&self, record: &ChangeRecord) -> RepoResult<()> {
        let value_json = serde_json::to_string(&record.value)
            .map_err(|err| RepoError::InvalidData(format!("unencodable column value: {err}")))?;
        self.conn.execute(
            "INSERT INTO column_changes (
                tbl, pk, col, value_json, col_version, db_version, site_id, causal_length, seq
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (tbl, pk, col) DO UPDATE SET
                value_json = excluded.value_json,
                col_version = excluded.col_version,
                db_version = excluded.db_version,
                site_id = excluded.site_id,
                causal_length = excluded.causal_length,
                seq = excluded.seq;",
            params![
                record.table,
                record.primary_key,
                record.column,
                value_json,
                to_sql_u64(record.column_version),
                to_sql_u64(record.db_version),
                record.site_id.as_str(),
                to_sql_u64(record.causal_length),
                record.sequence,
            ],
        )?;
        Ok(())
    }

    /// Loads every persisted winner ordered by `db_version`.
    pub fn load_all(&self) -> RepoResult<Vec<ChangeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT tbl, pk, col, value_json, col_version, db_version, site_id, causal_length, seq
             FROM column_changes
             ORDER BY db_version ASC, tbl ASC, pk ASC, col ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_change_row(row)?);
        }
        Ok(records)
    }
}

fn parse_change_row(row: &Row<'_>) -> RepoResult<ChangeRecord> {
    let value_json: String = row.get("value_json")?;
    let value: ColumnValue = serde_json::from_str(&value_json).map_err(|err| {
        RepoError::InvalidData(format!("invalid column_changes.value_json: {err}"))
    })?;

    let site_text: String = row.get("site_id")?;
    let site_id = SiteId::new(site_text.clone()).map_err(|_| {
        RepoError::InvalidData(format!("invalid site id `{site_text}` in column_changes.site_id"))
    })?;

    Ok(ChangeRecord {
        table: row.get("tbl")?,
        primary_key: row.get("pk")?,
        column: row.get("col")?,
        value,
        column_version: from_sql_u64(row.get("col_version")?, "column_changes.col_version")?,
        db_version: from_sql_u64(row.get("db_version")?, "column_changes.db_version")?,
        site_id,
        causal_length: from_sql_u64(row.get("causal_length")?, "column_changes.causal_length")?,
        sequence: row.get("seq")?,
    })
}

fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_u64(value: i64, column: &str) -> RepoResult<u64> {
    u64::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("negative value `{value}` in {column}")))
}
