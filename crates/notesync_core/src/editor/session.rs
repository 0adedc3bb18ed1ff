//! Editing session: drafts, history and debounced persistence.
//!
//! # Responsibility
//! - Stage keystrokes in the draft buffer without touching storage.
//! - Persist settled drafts after the debounce quiet period.
//! - Keep one undo/redo history per open document.
//! - Reload documents when merged remote revisions change their winner.
//!
//! # Invariants
//! - The session is the single writer of its drafts and histories; it is
//!   not shared across threads.
//! - Persisting a draft that equals the current history entry does not touch
//!   history, so persisting after an undo keeps the redo branch.
//! - A failed save keeps the draft and re-arms its timer.
//! - Closing a document saves any draft that differs from the stored text
//!   before dropping state.
//! - A draft typed but not yet persisted is recorded before undo/redo move
//!   through history.

use crate::editor::debounce::Debouncer;
use crate::editor::draft::DraftBuffer;
use crate::editor::history::{HistoryEntry, HistoryStack, DEFAULT_HISTORY_LIMIT};
use crate::model::document::{ChangeOrigin, DocumentId};
use crate::service::local_store::{LocalStore, StoreResult};
use crate::service::subscription::Subscription;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

struct OpenDocument {
    history: HistoryStack,
    cursor: usize,
    /// Last content known to be stored for this document.
    persisted: String,
    _subscription: Subscription,
}

pub struct EditorSession {
    store: LocalStore,
    drafts: DraftBuffer,
    debouncer: Debouncer,
    documents: HashMap<DocumentId, OpenDocument>,
    history_limit: usize,
    remote_tx: Sender<DocumentId>,
    remote_rx: Receiver<DocumentId>,
}

impl EditorSession {
    pub fn new(store: LocalStore) -> Self {
        Self::with_settings(store, crate::editor::debounce::DEFAULT_DEBOUNCE, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_settings(store: LocalStore, debounce: Duration, history_limit: usize) -> Self {
        let (remote_tx, remote_rx) = unbounded();
        Self {
            store,
            drafts: DraftBuffer::new(),
            debouncer: Debouncer::new(debounce),
            documents: HashMap::new(),
            history_limit,
            remote_tx,
            remote_rx,
        }
    }

    /// Opens a document and returns its text.
    ///
    /// An unknown document opens as empty text.
    pub fn open(&mut self, id: DocumentId) -> StoreResult<&str> {
        if !self.documents.contains_key(&id) {
            let content = self
                .store
                .load(id)?
                .map(|document| document.content)
                .unwrap_or_default();

            let remote_tx = self.remote_tx.clone();
            let subscription = self.store.subscribe(id, move |notice| {
                if notice.origin == ChangeOrigin::Remote {
                    let _ = remote_tx.send(notice.document_id);
                }
            });

            self.drafts.set(id, content.clone());
            self.documents.insert(
                id,
                OpenDocument {
                    history: HistoryStack::with_limit(content.clone(), self.history_limit),
                    cursor: 0,
                    persisted: content,
                    _subscription: subscription,
                },
            );
            debug!("event=doc_open module=editor status=ok doc_id={id}");
        }
        Ok(self.drafts.get(id))
    }

    pub fn is_open(&self, id: DocumentId) -> bool {
        self.documents.contains_key(&id)
    }

    /// Current draft text.
    pub fn draft(&self, id: DocumentId) -> &str {
        self.drafts.get(id)
    }

    /// Stages a keystroke and restarts the persistence timer.
    pub fn input(&mut self, id: DocumentId, text: impl Into<String>, cursor: usize) -> StoreResult<()> {
        self.input_at(id, text, cursor, Instant::now())
    }

    pub fn input_at(
        &mut self,
        id: DocumentId,
        text: impl Into<String>,
        cursor: usize,
        now: Instant,
    ) -> StoreResult<()> {
        self.open(id)?;
        self.drafts.set(id, text);
        if let Some(document) = self.documents.get_mut(&id) {
            document.cursor = cursor;
        }
        self.debouncer.schedule_at(id, now);
        Ok(())
    }

    /// Earliest instant at which `flush_due` has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.next_deadline()
    }

    pub fn has_pending(&self, id: DocumentId) -> bool {
        self.debouncer.is_pending(id)
    }

    /// Persists every draft whose quiet period elapsed by `now`.
    ///
    /// Every due draft is attempted even when an earlier save fails; failed
    /// drafts are re-scheduled and the first error is returned.
    pub fn flush_due(&mut self, now: Instant) -> StoreResult<Vec<DocumentId>> {
        let due = self.debouncer.drain_due(now);
        let mut first_error = None;
        for id in &due {
            if let Err(err) = self.persist(*id) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(due),
        }
    }

    /// Persists one draft immediately, cancelling its timer.
    pub fn flush(&mut self, id: DocumentId) -> StoreResult<()> {
        self.debouncer.cancel(id);
        self.persist(id)
    }

    fn persist(&mut self, id: DocumentId) -> StoreResult<()> {
        let Some(document) = self.documents.get_mut(&id) else {
            return Ok(());
        };
        let text = self.drafts.get(id).to_string();

        if document.history.current().text != text {
            document.history.record(text.clone(), document.cursor);
        }
        if document.persisted == text {
            return Ok(());
        }

        match self.store.save(id, &text) {
            Ok(_) => {
                document.persisted = text;
                Ok(())
            }
            Err(err) => {
                warn!("event=draft_persist module=editor status=error doc_id={id} error={err}");
                self.debouncer.schedule(id);
                Err(err)
            }
        }
    }

    /// Steps back in history, staging the restored text.
    ///
    /// A draft still waiting for its timer is recorded first so that
    /// `redo` can return to it.
    pub fn undo(&mut self, id: DocumentId) -> Option<HistoryEntry> {
        self.record_pending(id);
        let entry = self.documents.get_mut(&id)?.history.undo()?.clone();
        self.restore(id, &entry);
        Some(entry)
    }

    /// Steps forward in history, staging the restored text.
    pub fn redo(&mut self, id: DocumentId) -> Option<HistoryEntry> {
        self.record_pending(id);
        let entry = self.documents.get_mut(&id)?.history.redo()?.clone();
        self.restore(id, &entry);
        Some(entry)
    }

    fn record_pending(&mut self, id: DocumentId) {
        if !self.debouncer.is_pending(id) {
            return;
        }
        let Some(document) = self.documents.get_mut(&id) else {
            return;
        };
        let text = self.drafts.get(id);
        if document.history.current().text != text {
            document.history.record(text.to_string(), document.cursor);
        }
    }

    fn restore(&mut self, id: DocumentId, entry: &HistoryEntry) {
        self.drafts.set(id, entry.text.clone());
        if let Some(document) = self.documents.get_mut(&id) {
            document.cursor = entry.cursor;
        }
        self.debouncer.schedule(id);
    }

    pub fn can_undo(&self, id: DocumentId) -> bool {
        self.documents
            .get(&id)
            .is_some_and(|document| document.history.can_undo())
    }

    pub fn can_redo(&self, id: DocumentId) -> bool {
        self.documents
            .get(&id)
            .is_some_and(|document| document.history.can_redo())
    }

    pub fn history(&self, id: DocumentId) -> Option<&HistoryStack> {
        self.documents.get(&id).map(|document| &document.history)
    }

    /// Reloads open documents changed by merged remote revisions.
    ///
    /// Documents with unsaved local edits are skipped; their pending save
    /// lands on top of the merged winner.
    pub fn poll_remote_changes(&mut self) -> StoreResult<Vec<DocumentId>> {
        let changed: BTreeSet<DocumentId> = self.remote_rx.try_iter().collect();
        let mut reloaded = Vec::new();

        for id in changed {
            if !self.documents.contains_key(&id) || self.debouncer.is_pending(id) {
                continue;
            }
            let content = self
                .store
                .load(id)?
                .map(|document| document.content)
                .unwrap_or_default();
            let Some(document) = self.documents.get_mut(&id) else {
                continue;
            };
            document.persisted = content.clone();
            if self.drafts.get(id) == content {
                continue;
            }

            let cursor = document.cursor.min(content.len());
            document.cursor = cursor;
            document.history.record(content.clone(), cursor);
            self.drafts.set(id, content);
            info!("event=doc_reload module=editor status=ok doc_id={id} origin=remote");
            reloaded.push(id);
        }
        Ok(reloaded)
    }

    /// Flushes unsaved edits and releases the document.
    ///
    /// On a failed save the document stays open with its draft intact.
    pub fn close(&mut self, id: DocumentId) -> StoreResult<()> {
        self.debouncer.cancel(id);
        self.persist(id)?;
        self.documents.remove(&id);
        self.drafts.clear(id);
        debug!("event=doc_close module=editor status=ok doc_id={id}");
        Ok(())
    }

    /// Closes every open document.
    pub fn close_all(&mut self) -> StoreResult<()> {
        let ids: Vec<DocumentId> = self.documents.keys().copied().collect();
        for id in ids {
            self.close(id)?;
        }
        self.drafts.clear_all();
        Ok(())
    }
}
