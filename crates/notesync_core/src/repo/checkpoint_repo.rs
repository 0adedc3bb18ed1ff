//! Named sync checkpoints.
//!
//! # Invariants
//! - A missing checkpoint reads as `0` (nothing transferred yet).
//! - Values are non-negative; the table enforces it.

use crate::repo::RepoResult;
use rusqlite::{params, Connection, OptionalExtension};

pub struct SqliteCheckpointRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteCheckpointRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, name: &str) -> RepoResult<u64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM sync_checkpoints WHERE name = ?1;",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map_or(0, |value| u64::try_from(value).unwrap_or(0)))
    }

    pub fn set(&self, name: &str, value: u64) -> RepoResult<()> {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        self.conn.execute(
            "INSERT INTO sync_checkpoints (name, value) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET
                value = excluded.value,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![name, value],
        )?;
        Ok(())
    }
}
