//! Durable on-device document store.
//!
//! # Responsibility
//! - Own canonical document state: revision trees, contents and winners.
//! - Serialize every mutation (local saves and merged remote revisions).
//! - Notify subscribers after each committed change.
//!
//! # Invariants
//! - Every mutation runs in one SQLite transaction under the store lock, so
//!   a save racing with a remote merge is applied strictly before or after it.
//! - A failed write rolls back completely; the prior winner stays intact.
//! - Writes never overwrite content: every change is a new tree node.
//! - The `documents` head always names the winner. Saves and merges update
//!   it from the head alone; only reads of the tree load every revision.
//! - Loading a document that was never written (or whose winner is a
//!   tombstone) returns `None`, which callers treat as empty state.

use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::change_record::ChangeRecord;
use crate::model::document::{ChangeOrigin, Document, DocumentId, RevisionPayload};
use crate::model::revision::{Revision, RevisionError, RevisionId};
use crate::model::revision_tree::RevisionTree;
use crate::model::site::SiteId;
use crate::repo::change_repo::SqliteChangeRepository;
use crate::repo::checkpoint_repo::SqliteCheckpointRepository;
use crate::repo::document_repo::{DocumentHead, DocumentRepository, SqliteDocumentRepository};
use crate::repo::RepoError;
use crate::service::subscription::{ChangeCallback, ChangeNotice, SubscriberRegistry, Subscription};
use log::{debug, error, info};
use rusqlite::{Connection, Transaction};
use std::error::Error;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub type StoreResult<T> = Result<T, StoreError>;

/// Local store error.
#[derive(Debug)]
pub enum StoreError {
    Repo(RepoError),
    Revision(RevisionError),
    LockPoisoned,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::Revision(err) => write!(f, "{err}"),
            Self::LockPoisoned => write!(f, "local store lock poisoned"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Revision(err) => Some(err),
            Self::LockPoisoned => None,
        }
    }
}

impl From<RepoError> for StoreError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Repo(RepoError::Db(value))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}

impl From<RevisionError> for StoreError {
    fn from(value: RevisionError) -> Self {
        Self::Revision(value)
    }
}

/// Result of merging one remote revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// `false` when the revision was already in the tree.
    pub inserted: bool,
    pub winner_changed: bool,
    pub winning_rev: RevisionId,
}

/// One entry of the local change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub local_seq: u64,
    pub origin: ChangeOrigin,
    pub payload: RevisionPayload,
}

struct StoreInner {
    conn: Mutex<Connection>,
    site: SiteId,
    subscribers: Arc<SubscriberRegistry>,
}

/// Explicitly owned store context shared by editor and sync components.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Opens (or creates) a file-backed store for replica `site`.
    pub fn open(path: impl AsRef<Path>, site: SiteId) -> StoreResult<Self> {
        Ok(Self::from_connection(open_db(path)?, site))
    }

    /// Opens a throwaway in-memory store.
    pub fn open_in_memory(site: SiteId) -> StoreResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?, site))
    }

    /// Wraps a migrated connection.
    pub fn from_connection(conn: Connection, site: SiteId) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                site,
                subscribers: Arc::new(SubscriberRegistry::default()),
            }),
        }
    }

    /// Replica id stamped on locally authored revisions.
    pub fn site_id(&self) -> &SiteId {
        &self.inner.site
    }

    /// Loads the winning state of a document.
    ///
    /// `None` is the expected answer for a fresh install or a deleted document.
    pub fn load(&self, id: DocumentId) -> StoreResult<Option<Document>> {
        let conn = self.lock()?;
        let repo = SqliteDocumentRepository::new(&conn);
        if repo.get_head(id)?.is_none() {
            return Ok(None);
        }

        let tree = RevisionTree::from_revisions(repo.list_revisions(id)?);
        let Some(winning) = tree.winner().cloned() else {
            return Ok(None);
        };
        if winning.deleted {
            return Ok(None);
        }
        let content = repo.get_content(id, &winning.id)?.ok_or_else(|| {
            RepoError::InvalidData(format!("content missing for revision {}", winning.id))
        })?;

        Ok(Some(Document {
            id,
            content,
            tree,
            winning,
        }))
    }

    /// Writes new content as a child of the current winner.
    ///
    /// Creates the document when absent. Returns the new revision.
    pub fn save(&self, id: DocumentId, content: &str) -> StoreResult<Revision> {
        let revision = self.append_local(id, content, false, "doc_save")?;
        revision.ok_or_else(|| {
            StoreError::Repo(RepoError::InvalidData(format!(
                "save of {id} produced no revision"
            )))
        })
    }

    /// Appends a tombstone below the current winner.
    ///
    /// Returns `None` when the document does not exist or is already deleted.
    pub fn delete(&self, id: DocumentId) -> StoreResult<Option<Revision>> {
        self.append_local(id, "", true, "doc_delete")
    }

    fn append_local(
        &self,
        id: DocumentId,
        content: &str,
        deleted: bool,
        event: &'static str,
    ) -> StoreResult<Option<Revision>> {
        let started_at = Instant::now();
        let site = self.inner.site.clone();

        let result = self.with_transaction(|tx| {
            let repo = SqliteDocumentRepository::new(tx);
            let head = repo.get_head(id)?;
            if deleted && head.as_ref().map_or(true, |head| head.is_deleted) {
                return Ok(None);
            }
            let parent = head.map(|head| head.winning_rev);
            let revision = Revision::next(parent.as_ref(), &site, deleted, content);

            // A child of the winner is deeper than every other node.
            let winning_rev = revision.id.clone();
            repo.upsert_head(&DocumentHead {
                doc_id: id,
                winning_rev: winning_rev.clone(),
                is_deleted: deleted,
            })?;
            repo.insert_revision(id, &revision, &site, content, ChangeOrigin::Local)?;

            Ok(Some((
                revision.clone(),
                ChangeNotice {
                    document_id: id,
                    revision_id: revision.id,
                    winning_rev,
                    origin: ChangeOrigin::Local,
                },
            )))
        });

        match result {
            Ok(None) => {
                debug!("event={event} module=store status=skipped doc_id={id} reason=not_live");
                Ok(None)
            }
            Ok(Some((revision, notice))) => {
                info!(
                    "event={event} module=store status=ok doc_id={id} rev={} duration_ms={}",
                    revision.id,
                    started_at.elapsed().as_millis()
                );
                self.inner.subscribers.notify(&notice);
                Ok(Some(revision))
            }
            Err(err) => {
                error!(
                    "event={event} module=store status=error doc_id={id} duration_ms={} error={err}",
                    started_at.elapsed().as_millis()
                );
                Err(err)
            }
        }
    }

    /// Inserts a revision received from the remote into the tree.
    ///
    /// Re-delivering a known revision is a no-op. The parent does not need
    /// to be present yet.
    pub fn merge_remote(&self, payload: &RevisionPayload) -> StoreResult<MergeOutcome> {
        payload.revision.validate()?;
        let id = payload.doc_id;

        let (outcome, notice) = self.with_transaction(|tx| {
            let repo = SqliteDocumentRepository::new(tx);
            let current = current_winner(&repo, id)?;
            let previous = current.as_ref().map(|winner| winner.id.clone());

            if repo.has_revision(id, &payload.revision.id)? {
                let winning_rev = previous.unwrap_or_else(|| payload.revision.id.clone());
                return Ok((
                    MergeOutcome {
                        inserted: false,
                        winner_changed: false,
                        winning_rev,
                    },
                    None,
                ));
            }

            let winner = match current {
                Some(current) if current.winner_cmp(&payload.revision) == Ordering::Greater => {
                    current
                }
                _ => payload.revision.clone(),
            };
            let winning_rev = winner.id.clone();
            repo.upsert_head(&DocumentHead {
                doc_id: id,
                winning_rev: winning_rev.clone(),
                is_deleted: winner.deleted,
            })?;
            repo.insert_revision(
                id,
                &payload.revision,
                &payload.site_id,
                &payload.content,
                ChangeOrigin::Remote,
            )?;

            let notice = ChangeNotice {
                document_id: id,
                revision_id: payload.revision.id.clone(),
                winning_rev: winning_rev.clone(),
                origin: ChangeOrigin::Remote,
            };
            Ok((
                MergeOutcome {
                    inserted: true,
                    winner_changed: previous.as_ref() != Some(&winning_rev),
                    winning_rev,
                },
                Some(notice),
            ))
        })?;

        debug!(
            "event=doc_merge module=store status=ok doc_id={id} rev={} inserted={} winner_changed={}",
            payload.revision.id, outcome.inserted, outcome.winner_changed
        );
        if let Some(notice) = notice {
            self.inner.subscribers.notify(&notice);
        }
        Ok(outcome)
    }

    /// Full revision tree, empty when the document is unknown.
    pub fn revision_tree(&self, id: DocumentId) -> StoreResult<RevisionTree> {
        let conn = self.lock()?;
        let repo = SqliteDocumentRepository::new(&conn);
        Ok(RevisionTree::from_revisions(repo.list_revisions(id)?))
    }

    /// Losing, non-deleted leaves of a document.
    pub fn conflicts(&self, id: DocumentId) -> StoreResult<Vec<RevisionId>> {
        Ok(self
            .revision_tree(id)?
            .conflicts()
            .into_iter()
            .map(|revision| revision.id.clone())
            .collect())
    }

    pub fn has_revision(&self, id: DocumentId, rev_id: &RevisionId) -> StoreResult<bool> {
        let conn = self.lock()?;
        Ok(SqliteDocumentRepository::new(&conn).has_revision(id, rev_id)?)
    }

    /// Loads any revision (winner, loser or ancestor) with its content.
    pub fn load_revision(
        &self,
        id: DocumentId,
        rev_id: &RevisionId,
    ) -> StoreResult<Option<RevisionPayload>> {
        let conn = self.lock()?;
        let repo = SqliteDocumentRepository::new(&conn);
        let Some(stored) = repo.get_revision(id, rev_id)? else {
            return Ok(None);
        };
        let content = repo.get_content(id, rev_id)?.unwrap_or_default();
        Ok(Some(RevisionPayload {
            doc_id: id,
            revision: stored.revision,
            site_id: stored.site_id,
            content,
        }))
    }

    /// Local change feed: revisions inserted after `local_seq`.
    pub fn changes_since(&self, local_seq: u64, limit: u32) -> StoreResult<Vec<LocalChange>> {
        let conn = self.lock()?;
        let repo = SqliteDocumentRepository::new(&conn);
        let since = i64::try_from(local_seq).unwrap_or(i64::MAX);
        let mut changes = Vec::new();
        for stored in repo.revisions_since(since, limit)? {
            let content = repo
                .get_content(stored.doc_id, &stored.revision.id)?
                .unwrap_or_default();
            changes.push(LocalChange {
                local_seq: u64::try_from(stored.local_seq).unwrap_or(0),
                origin: stored.origin,
                payload: RevisionPayload {
                    doc_id: stored.doc_id,
                    revision: stored.revision,
                    site_id: stored.site_id,
                    content,
                },
            });
        }
        Ok(changes)
    }

    /// Ids of documents whose winner is not a tombstone.
    pub fn list_documents(&self) -> StoreResult<Vec<DocumentId>> {
        let conn = self.lock()?;
        Ok(SqliteDocumentRepository::new(&conn).list_live_documents()?)
    }

    pub fn checkpoint(&self, name: &str) -> StoreResult<u64> {
        let conn = self.lock()?;
        Ok(SqliteCheckpointRepository::new(&conn).get(name)?)
    }

    pub fn set_checkpoint(&self, name: &str, value: u64) -> StoreResult<()> {
        let conn = self.lock()?;
        Ok(SqliteCheckpointRepository::new(&conn).set(name, value)?)
    }

    /// Persists column merge winners atomically.
    pub fn save_column_winners(&self, records: &[ChangeRecord]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.with_transaction(|tx| {
            let repo = SqliteChangeRepository::new(tx);
            for record in records {
                repo.save_winner(record)?;
            }
            Ok(())
        })
    }

    pub fn load_column_winners(&self) -> StoreResult<Vec<ChangeRecord>> {
        let conn = self.lock()?;
        Ok(SqliteChangeRepository::new(&conn).load_all()?)
    }

    /// Listens for changes of one document.
    pub fn subscribe(
        &self,
        id: DocumentId,
        callback: impl Fn(&ChangeNotice) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: ChangeCallback = Arc::new(callback);
        self.inner.subscribers.add(Some(id), callback)
    }

    /// Listens for changes of every document.
    pub fn subscribe_all(
        &self,
        callback: impl Fn(&ChangeNotice) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: ChangeCallback = Arc::new(callback);
        self.inner.subscribers.add(None, callback)
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.inner.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn with_transaction<T>(
        &self,
        body: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = body(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Winner recorded in the document head.
///
/// Every node with a child is shallower than that child, so the deepest
/// node overall is a leaf. Comparing a new node against this one is enough
/// to keep the head current.
fn current_winner(
    repo: &SqliteDocumentRepository<'_>,
    id: DocumentId,
) -> StoreResult<Option<Revision>> {
    let Some(head) = repo.get_head(id)? else {
        return Ok(None);
    };
    let stored = repo.get_revision(id, &head.winning_rev)?.ok_or_else(|| {
        RepoError::InvalidData(format!(
            "head of {id} points at unknown revision {}",
            head.winning_rev
        ))
    })?;
    Ok(Some(stored.revision))
}
