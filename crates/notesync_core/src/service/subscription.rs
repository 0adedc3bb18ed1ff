//! Change notification fan-out for the local store.
//!
//! # Invariants
//! - Callbacks run outside the registry lock, after the write committed.
//! - Dropping a `Subscription` removes its callback.

use crate::model::document::{ChangeOrigin, DocumentId};
use crate::model::revision::RevisionId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Notification sent after a document's revision tree changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub document_id: DocumentId,
    /// Revision that was just inserted.
    pub revision_id: RevisionId,
    /// Winner after the insertion.
    pub winning_rev: RevisionId,
    pub origin: ChangeOrigin,
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

struct Entry {
    /// `None` listens to every document.
    document_id: Option<DocumentId>,
    callback: ChangeCallback,
}

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    entries: Mutex<BTreeMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub(crate) fn add(
        self: &Arc<Self>,
        document_id: Option<DocumentId>,
        callback: ChangeCallback,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                id,
                Entry {
                    document_id,
                    callback,
                },
            );
        }
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub(crate) fn notify(&self, notice: &ChangeNotice) {
        let callbacks: Vec<ChangeCallback> = match self.entries.lock() {
            Ok(entries) => entries
                .values()
                .filter(|entry| {
                    entry
                        .document_id
                        .map_or(true, |id| id == notice.document_id)
                })
                .map(|entry| Arc::clone(&entry.callback))
                .collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(notice);
        }
    }
}

/// Handle keeping one change listener registered.
pub struct Subscription {
    id: u64,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    /// Removes the listener now; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeNotice, SubscriberRegistry};
    use crate::model::document::ChangeOrigin;
    use crate::model::revision::RevisionId;
    use crate::model::site::SiteId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn notice(document_id: Uuid) -> ChangeNotice {
        let rev = RevisionId::derive(None, &SiteId::new("s1").expect("valid"), false, "x");
        ChangeNotice {
            document_id,
            revision_id: rev.clone(),
            winning_rev: rev,
            origin: ChangeOrigin::Local,
        }
    }

    #[test]
    fn routes_by_document_and_unsubscribes_on_drop() {
        let registry = Arc::new(SubscriberRegistry::default());
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_all = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits_a);
        let sub_a = registry.add(
            Some(doc_a),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&hits_all);
        let _sub_all = registry.add(
            None,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.notify(&notice(doc_a));
        registry.notify(&notice(doc_b));
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_all.load(Ordering::SeqCst), 2);

        sub_a.unsubscribe();
        assert_eq!(registry.len(), 1);
        registry.notify(&notice(doc_a));
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    }
}
