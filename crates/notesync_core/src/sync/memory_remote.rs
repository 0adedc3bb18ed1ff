//! In-process remote endpoint.
//!
//! # Responsibility
//! - Hold per-document revision trees the way a remote replication server
//!   would, with a monotonically increasing change feed.
//! - Block `changes` callers until new entries arrive (long-poll).
//! - Inject failures for retry and denial scenarios.
//!
//! # Invariants
//! - Each newly stored revision appends exactly one feed entry.
//! - Re-pushing a known revision appends nothing.
//! - While denied, every call fails with `Unauthorized`.

use crate::model::document::{DocumentId, RevisionPayload};
use crate::model::revision::RevisionId;
use crate::model::revision_tree::RevisionTree;
use crate::model::site::SiteId;
use crate::sync::remote::{
    ChangeFeedEntry, ChangesBatch, RemoteEndpoint, RemoteError, RemoteErrorKind, RemoteResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct RemoteDocument {
    tree: RevisionTree,
    bodies: HashMap<RevisionId, (SiteId, String)>,
}

#[derive(Default)]
struct RemoteState {
    documents: HashMap<DocumentId, RemoteDocument>,
    feed: Vec<ChangeFeedEntry>,
    last_seq: u64,
    faults: VecDeque<RemoteErrorKind>,
    denied: bool,
    push_count: usize,
}

/// Remote endpoint kept entirely in memory.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    changed: Condvar,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail with `kind`.
    pub fn fail_next(&self, kind: RemoteErrorKind, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.extend(std::iter::repeat(kind).take(count));
        }
    }

    /// Rejects every call as unauthorized until cleared.
    pub fn set_denied(&self, denied: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.denied = denied;
        }
        self.changed.notify_all();
    }

    /// Current winner of a document on the remote.
    pub fn winner(&self, doc_id: DocumentId) -> Option<RevisionId> {
        let state = self.state.lock().ok()?;
        let document = state.documents.get(&doc_id)?;
        document.tree.winner().map(|revision| revision.id.clone())
    }

    /// Copy of a document's remote revision tree.
    pub fn tree(&self, doc_id: DocumentId) -> RevisionTree {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .documents
                    .get(&doc_id)
                    .map(|document| document.tree.clone())
            })
            .unwrap_or_default()
    }

    pub fn last_seq(&self) -> u64 {
        self.state.lock().map_or(0, |state| state.last_seq)
    }

    /// Successful pushes that stored a new revision.
    pub fn push_count(&self) -> usize {
        self.state.lock().map_or(0, |state| state.push_count)
    }

    fn enter(&self) -> RemoteResult<MutexGuard<'_, RemoteState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RemoteError::unexpected("memory remote lock poisoned"))?;
        if state.denied {
            return Err(RemoteError::unauthorized("credentials rejected"));
        }
        if let Some(kind) = state.faults.pop_front() {
            return Err(RemoteError::new(kind, "injected failure"));
        }
        Ok(state)
    }
}

impl RemoteEndpoint for MemoryRemote {
    fn push(&self, payload: &RevisionPayload) -> RemoteResult<()> {
        payload
            .revision
            .validate()
            .map_err(|err| RemoteError::unexpected(err.to_string()))?;

        let mut state = self.enter()?;
        let document = state.documents.entry(payload.doc_id).or_default();
        if !document.tree.insert(payload.revision.clone()) {
            return Ok(());
        }
        document.bodies.insert(
            payload.revision.id.clone(),
            (payload.site_id.clone(), payload.content.clone()),
        );

        state.last_seq += 1;
        state.push_count += 1;
        let entry = ChangeFeedEntry {
            seq: state.last_seq,
            doc_id: payload.doc_id,
            rev_id: payload.revision.id.clone(),
            deleted: payload.revision.deleted,
        };
        state.feed.push(entry);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn revs_diff(
        &self,
        doc_id: DocumentId,
        rev_ids: &[RevisionId],
    ) -> RemoteResult<Vec<RevisionId>> {
        let state = self.enter()?;
        let document = state.documents.get(&doc_id);
        Ok(rev_ids
            .iter()
            .filter(|rev_id| document.map_or(true, |document| !document.tree.contains(rev_id)))
            .cloned()
            .collect())
    }

    fn changes(&self, since: u64, limit: u32, wait: Duration) -> RemoteResult<ChangesBatch> {
        let state = self.enter()?;
        let state = if state.last_seq <= since && !wait.is_zero() {
            let (state, _) = self
                .changed
                .wait_timeout_while(state, wait, |state| {
                    state.last_seq <= since && !state.denied
                })
                .map_err(|_| RemoteError::unexpected("memory remote lock poisoned"))?;
            if state.denied {
                return Err(RemoteError::unauthorized("credentials rejected"));
            }
            state
        } else {
            state
        };

        let entries: Vec<ChangeFeedEntry> = state
            .feed
            .iter()
            .filter(|entry| entry.seq > since)
            .take(limit as usize)
            .cloned()
            .collect();
        let last_seq = entries.last().map_or(since, |entry| entry.seq);
        Ok(ChangesBatch { entries, last_seq })
    }

    fn fetch(&self, doc_id: DocumentId, rev_id: &RevisionId) -> RemoteResult<RevisionPayload> {
        let state = self.enter()?;
        let missing = || RemoteError::not_found(format!("revision {rev_id} of {doc_id}"));
        let document = state.documents.get(&doc_id).ok_or_else(missing)?;
        let revision = document.tree.get(rev_id).ok_or_else(missing)?;
        let (site_id, content) = document.bodies.get(rev_id).ok_or_else(missing)?;
        Ok(RevisionPayload {
            doc_id,
            revision: revision.clone(),
            site_id: site_id.clone(),
            content: content.clone(),
        })
    }
}
