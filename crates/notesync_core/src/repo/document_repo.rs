//! Document/revision repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist revision tree nodes and their content.
//! - Persist the resolved winner per document.
//! - Expose the local change feed ordered by `local_seq`.
//!
//! # Invariants
//! - Revisions are append-only; rows are never updated or removed.
//! - `(doc_id, rev_id)` is unique; duplicate inserts are rejected by SQLite.
//! - Read paths reject malformed persisted ids instead of masking them.

use crate::model::document::{ChangeOrigin, DocumentId};
use crate::model::revision::{Revision, RevisionId};
use crate::model::site::SiteId;
use crate::repo::{bool_to_int, int_to_bool, RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const REVISION_SELECT_SQL: &str = "SELECT
    local_seq,
    doc_id,
    rev_id,
    parent_rev,
    depth,
    is_deleted,
    site_id,
    origin
FROM revisions";

/// Persisted winner pointer of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHead {
    pub doc_id: DocumentId,
    pub winning_rev: RevisionId,
    pub is_deleted: bool,
}

/// One row of the revision table, without content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRevision {
    pub local_seq: i64,
    pub doc_id: DocumentId,
    pub revision: Revision,
    pub site_id: SiteId,
    pub origin: ChangeOrigin,
}

/// Repository interface for revision tree persistence.
pub trait DocumentRepository {
    fn get_head(&self, doc_id: DocumentId) -> RepoResult<Option<DocumentHead>>;
    fn upsert_head(&self, head: &DocumentHead) -> RepoResult<()>;
    fn list_revisions(&self, doc_id: DocumentId) -> RepoResult<Vec<Revision>>;
    fn has_revision(&self, doc_id: DocumentId, rev_id: &RevisionId) -> RepoResult<bool>;
    fn get_revision(
        &self,
        doc_id: DocumentId,
        rev_id: &RevisionId,
    ) -> RepoResult<Option<StoredRevision>>;
    fn get_content(&self, doc_id: DocumentId, rev_id: &RevisionId) -> RepoResult<Option<String>>;
    fn insert_revision(
        &self,
        doc_id: DocumentId,
        revision: &Revision,
        site_id: &SiteId,
        content: &str,
        origin: ChangeOrigin,
    ) -> RepoResult<i64>;
    fn revisions_since(&self, local_seq: i64, limit: u32) -> RepoResult<Vec<StoredRevision>>;
    fn list_live_documents(&self) -> RepoResult<Vec<DocumentId>>;
}

/// SQLite-backed revision repository.
///
/// Works on a plain connection or inside a transaction (via deref).
pub struct SqliteDocumentRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteDocumentRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl DocumentRepository for SqliteDocumentRepository<'_> {
    fn get_head(&self, doc_id: DocumentId) -> RepoResult<Option<DocumentHead>> {
        let row = self
            .conn
            .query_row(
                "SELECT winning_rev, is_deleted FROM documents WHERE doc_id = ?1;",
                [doc_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let Some((winning_rev, is_deleted)) = row else {
            return Ok(None);
        };
        Ok(Some(DocumentHead {
            doc_id,
            winning_rev: parse_rev_id(winning_rev, "documents.winning_rev")?,
            is_deleted: int_to_bool(is_deleted, "documents.is_deleted")?,
        }))
    }

    fn upsert_head(&self, head: &DocumentHead) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO documents (doc_id, winning_rev, is_deleted)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (doc_id) DO UPDATE SET
                winning_rev = excluded.winning_rev,
                is_deleted = excluded.is_deleted,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![
                head.doc_id.to_string(),
                head.winning_rev.as_str(),
                bool_to_int(head.is_deleted),
            ],
        )?;
        Ok(())
    }

    fn list_revisions(&self, doc_id: DocumentId) -> RepoResult<Vec<Revision>> {
        let mut stmt = self.conn.prepare(&format!(
            "{REVISION_SELECT_SQL} WHERE doc_id = ?1 ORDER BY local_seq ASC;"
        ))?;
        let mut rows = stmt.query([doc_id.to_string()])?;
        let mut revisions = Vec::new();
        while let Some(row) = rows.next()? {
            revisions.push(parse_revision_row(row)?.revision);
        }
        Ok(revisions)
    }

    fn has_revision(&self, doc_id: DocumentId, rev_id: &RevisionId) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM revisions WHERE doc_id = ?1 AND rev_id = ?2);",
            params![doc_id.to_string(), rev_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn get_revision(
        &self,
        doc_id: DocumentId,
        rev_id: &RevisionId,
    ) -> RepoResult<Option<StoredRevision>> {
        let mut stmt = self.conn.prepare(&format!(
            "{REVISION_SELECT_SQL} WHERE doc_id = ?1 AND rev_id = ?2;"
        ))?;
        let mut rows = stmt.query(params![doc_id.to_string(), rev_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_revision_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_content(&self, doc_id: DocumentId, rev_id: &RevisionId) -> RepoResult<Option<String>> {
        let content = self
            .conn
            .query_row(
                "SELECT content FROM revisions WHERE doc_id = ?1 AND rev_id = ?2;",
                params![doc_id.to_string(), rev_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    fn insert_revision(
        &self,
        doc_id: DocumentId,
        revision: &Revision,
        site_id: &SiteId,
        content: &str,
        origin: ChangeOrigin,
    ) -> RepoResult<i64> {
        self.conn.execute(
            "INSERT INTO revisions (
                doc_id,
                rev_id,
                parent_rev,
                depth,
                is_deleted,
                site_id,
                content,
                origin
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                doc_id.to_string(),
                revision.id.as_str(),
                revision.parent.as_ref().map(RevisionId::as_str),
                revision.depth,
                bool_to_int(revision.deleted),
                site_id.as_str(),
                content,
                origin.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn revisions_since(&self, local_seq: i64, limit: u32) -> RepoResult<Vec<StoredRevision>> {
        let mut stmt = self.conn.prepare(&format!(
            "{REVISION_SELECT_SQL} WHERE local_seq > ?1 ORDER BY local_seq ASC LIMIT ?2;"
        ))?;
        let mut rows = stmt.query(params![local_seq, i64::from(limit)])?;
        let mut revisions = Vec::new();
        while let Some(row) = rows.next()? {
            revisions.push(parse_revision_row(row)?);
        }
        Ok(revisions)
    }

    fn list_live_documents(&self) -> RepoResult<Vec<DocumentId>> {
        let mut stmt = self.conn.prepare(
            "SELECT doc_id FROM documents
             WHERE is_deleted = 0
             ORDER BY updated_at DESC, doc_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(parse_doc_id(row.get(0)?)?);
        }
        Ok(ids)
    }
}

fn parse_revision_row(row: &Row<'_>) -> RepoResult<StoredRevision> {
    let doc_id = parse_doc_id(row.get("doc_id")?)?;
    let id = parse_rev_id(row.get("rev_id")?, "revisions.rev_id")?;
    let parent = match row.get::<_, Option<String>>("parent_rev")? {
        Some(value) => Some(parse_rev_id(value, "revisions.parent_rev")?),
        None => None,
    };

    let site_text: String = row.get("site_id")?;
    let site_id = SiteId::new(site_text.clone()).map_err(|_| {
        RepoError::InvalidData(format!("invalid site id `{site_text}` in revisions.site_id"))
    })?;

    let origin_text: String = row.get("origin")?;
    let origin = ChangeOrigin::parse(&origin_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid origin `{origin_text}` in revisions.origin"))
    })?;

    let revision = Revision {
        id,
        parent,
        depth: row.get("depth")?,
        deleted: int_to_bool(row.get("is_deleted")?, "revisions.is_deleted")?,
    };
    revision
        .validate()
        .map_err(|err| RepoError::InvalidData(err.to_string()))?;

    Ok(StoredRevision {
        local_seq: row.get("local_seq")?,
        doc_id,
        revision,
        site_id,
        origin,
    })
}

fn parse_doc_id(value: String) -> RepoResult<DocumentId> {
    Uuid::parse_str(&value)
        .map_err(|_| RepoError::InvalidData(format!("invalid document id `{value}`")))
}

fn parse_rev_id(value: String, column: &str) -> RepoResult<RevisionId> {
    RevisionId::parse(value)
        .map_err(|err| RepoError::InvalidData(format!("{err} in {column}")))
}
