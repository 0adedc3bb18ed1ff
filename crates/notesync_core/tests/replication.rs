use crossbeam::channel::Receiver;
use notesync_core::sync::remote::{ChangesBatch, RemoteResult};
use notesync_core::sync::replication::{ReplicationHandle, PULL_CHECKPOINT};
use notesync_core::{
    DocumentId, LocalStore, MemoryRemote, RemoteEndpoint, RemoteError, RemoteErrorKind,
    ReplicationEngine, ReplicationEvent, ReplicationOptions, ReplicationState, RevisionId,
    RevisionPayload, SiteId,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEADLINE: Duration = Duration::from_secs(10);

fn store(site: &str) -> LocalStore {
    LocalStore::open_in_memory(SiteId::new(site).unwrap()).unwrap()
}

fn fast_options() -> ReplicationOptions {
    ReplicationOptions {
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        batch_size: 10,
        poll_interval: Duration::from_millis(20),
    }
}

fn engine(store: &LocalStore, remote: &Arc<MemoryRemote>) -> ReplicationEngine {
    let remote: Arc<dyn RemoteEndpoint> = remote.clone();
    ReplicationEngine::new(store.clone(), remote, fast_options())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < DEADLINE {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn wait_for_event(
    events: &Receiver<ReplicationEvent>,
    mut matches: impl FnMut(&ReplicationEvent) -> bool,
) -> Option<ReplicationEvent> {
    let started = Instant::now();
    while started.elapsed() < DEADLINE {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(50)) {
            if matches(&event) {
                return Some(event);
            }
        }
    }
    None
}

#[test]
fn push_then_pull_moves_a_document_between_replicas() {
    let remote = Arc::new(MemoryRemote::new());
    let (a, b) = (store("a"), store("b"));
    let (engine_a, engine_b) = (engine(&a, &remote), engine(&b, &remote));
    let doc = Uuid::new_v4();

    a.save(doc, "draft").unwrap();
    a.save(doc, "final").unwrap();
    assert_eq!(engine_a.push_once().unwrap(), 2);
    assert_eq!(engine_a.push_once().unwrap(), 0);

    let events = engine_b.events();
    assert_eq!(engine_b.pull_once().unwrap(), 2);
    assert_eq!(engine_b.pull_once().unwrap(), 0);
    assert_eq!(b.load(doc).unwrap().unwrap().content, "final");
    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![ReplicationEvent::Change(doc), ReplicationEvent::Change(doc)]
    );

    // Pulled revisions are not echoed back.
    assert_eq!(engine_b.push_once().unwrap(), 0);
    assert_eq!(remote.push_count(), 2);
}

#[test]
fn concurrent_edits_converge_to_the_same_winner() {
    let remote = Arc::new(MemoryRemote::new());
    let (a, b) = (store("a"), store("b"));
    let (engine_a, engine_b) = (engine(&a, &remote), engine(&b, &remote));
    let doc = Uuid::new_v4();

    a.save(doc, "base").unwrap();
    engine_a.push_once().unwrap();
    engine_b.pull_once().unwrap();

    a.save(doc, "edit from a").unwrap();
    b.save(doc, "edit from b").unwrap();
    for _ in 0..2 {
        engine_a.push_once().unwrap();
        engine_b.push_once().unwrap();
        engine_a.pull_once().unwrap();
        engine_b.pull_once().unwrap();
    }

    let doc_a = a.load(doc).unwrap().unwrap();
    let doc_b = b.load(doc).unwrap().unwrap();
    assert_eq!(doc_a.winning.id, doc_b.winning.id);
    assert_eq!(doc_a.content, doc_b.content);
    assert_eq!(Some(doc_a.winning.id.clone()), remote.winner(doc));
    assert_eq!(a.conflicts(doc).unwrap().len(), 1);
    assert_eq!(a.conflicts(doc).unwrap(), b.conflicts(doc).unwrap());
}

#[test]
fn pull_fetches_missing_ancestors() {
    let remote = Arc::new(MemoryRemote::new());
    let (a, b) = (store("a"), store("b"));
    let engine_a = engine(&a, &remote);
    let engine_b = engine(&b, &remote);
    let doc = Uuid::new_v4();

    for text in ["one", "two", "three"] {
        a.save(doc, text).unwrap();
    }
    engine_a.push_once().unwrap();

    // Only the newest feed entry is left to read.
    b.set_checkpoint(PULL_CHECKPOINT, remote.last_seq() - 1).unwrap();
    assert_eq!(engine_b.pull_once().unwrap(), 3);
    assert_eq!(b.revision_tree(doc).unwrap().len(), 3);
    assert_eq!(b.load(doc).unwrap().unwrap().content, "three");
}

#[test]
fn continuous_replication_delivers_saves() {
    let remote = Arc::new(MemoryRemote::new());
    let (a, b) = (store("a"), store("b"));
    let handle_a = engine(&a, &remote).start();
    let engine_b = engine(&b, &remote);
    let events_b = engine_b.events();
    let handle_b = engine_b.start();
    let doc = Uuid::new_v4();

    a.save(doc, "live").unwrap();
    assert!(wait_until(|| b
        .load(doc)
        .unwrap()
        .is_some_and(|document| document.content == "live")));
    assert!(wait_for_event(&events_b, |event| *event == ReplicationEvent::Change(doc)).is_some());

    b.save(doc, "reply").unwrap();
    assert!(wait_until(|| a
        .load(doc)
        .unwrap()
        .is_some_and(|document| document.content == "reply")));

    handle_a.stop();
    handle_b.stop();
}

#[test]
fn transient_network_errors_are_retried() {
    let remote = Arc::new(MemoryRemote::new());
    let (a, b) = (store("a"), store("b"));
    let doc = Uuid::new_v4();
    a.save(doc, "eventually").unwrap();

    remote.fail_next(RemoteErrorKind::Network, 3);
    let engine_a = engine(&a, &remote);
    let events_a = engine_a.events();
    let handle_a = engine_a.start();
    let handle_b = engine(&b, &remote).start();

    assert!(wait_until(|| b.load(doc).unwrap().is_some()));
    let paused = wait_for_event(&events_a, |event| {
        matches!(event, ReplicationEvent::Paused(Some(err)) if err.kind == RemoteErrorKind::Network)
    });
    // The injected failures may all be consumed by replica b's workers.
    if paused.is_none() {
        assert!(!matches!(handle_a.state(), ReplicationState::Denied(_)));
    }

    handle_a.stop();
    handle_b.stop();
}

#[test]
fn authorization_failure_enters_denied_and_stops() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_denied(true);
    let local = store("a");
    let engine = engine(&local, &remote);
    let events = engine.events();
    let handle = engine.start();

    let denied = wait_for_event(&events, |event| matches!(event, ReplicationEvent::Denied(_)));
    assert!(matches!(denied, Some(ReplicationEvent::Denied(err)) if !err.is_retriable()));
    assert!(matches!(handle.state(), ReplicationState::Denied(_)));

    remote.set_denied(false);
    local.save(Uuid::new_v4(), "not sent").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(remote.push_count(), 0);
    assert!(matches!(handle.state(), ReplicationState::Denied(_)));

    handle.stop();
}

/// Memory remote whose change feed can be switched to failing and which can
/// refuse to serve chosen revisions.
#[derive(Default)]
struct FlakyFeedRemote {
    inner: MemoryRemote,
    feed_failure: Mutex<Option<RemoteError>>,
    unservable: Mutex<HashSet<RevisionId>>,
}

impl FlakyFeedRemote {
    fn fail_feed(&self, err: Option<RemoteError>) {
        *self.feed_failure.lock().unwrap() = err;
    }

    fn refuse(&self, rev_id: &RevisionId) {
        self.unservable.lock().unwrap().insert(rev_id.clone());
    }
}

impl RemoteEndpoint for FlakyFeedRemote {
    fn push(&self, payload: &RevisionPayload) -> RemoteResult<()> {
        self.inner.push(payload)
    }

    fn revs_diff(
        &self,
        doc_id: DocumentId,
        rev_ids: &[RevisionId],
    ) -> RemoteResult<Vec<RevisionId>> {
        self.inner.revs_diff(doc_id, rev_ids)
    }

    fn changes(&self, since: u64, limit: u32, wait: Duration) -> RemoteResult<ChangesBatch> {
        if let Some(err) = self.feed_failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.inner.changes(since, limit, wait)
    }

    fn fetch(&self, doc_id: DocumentId, rev_id: &RevisionId) -> RemoteResult<RevisionPayload> {
        if self.unservable.lock().unwrap().contains(rev_id) {
            return Err(RemoteError::not_found(format!("revision {rev_id}")));
        }
        self.inner.fetch(doc_id, rev_id)
    }
}

fn flaky_engine(store: &LocalStore, remote: &Arc<FlakyFeedRemote>) -> ReplicationEngine {
    let remote: Arc<dyn RemoteEndpoint> = remote.clone();
    ReplicationEngine::new(store.clone(), remote, fast_options())
}

fn state_holds(handle: &ReplicationHandle, holds: impl Fn(&ReplicationState) -> bool) -> bool {
    (0..20).all(|_| {
        std::thread::sleep(Duration::from_millis(10));
        holds(&handle.state())
    })
}

#[test]
fn failing_feed_reports_error_until_it_recovers() {
    let remote = Arc::new(FlakyFeedRemote::default());
    remote.fail_feed(Some(RemoteError::unexpected("feed unavailable")));
    let engine = flaky_engine(&store("a"), &remote);
    let events = engine.events();
    let handle = engine.start();

    assert!(wait_for_event(&events, |event| matches!(event, ReplicationEvent::Error(_))).is_some());
    // The idle push worker does not hide the failing pull.
    assert!(state_holds(&handle, |state| matches!(
        state,
        ReplicationState::Error(err) if err.kind == RemoteErrorKind::Unexpected
    )));
    assert!(!events
        .try_iter()
        .any(|event| event == ReplicationEvent::Paused(None)));

    remote.fail_feed(None);
    assert!(wait_for_event(&events, |event| *event == ReplicationEvent::Paused(None)).is_some());
    assert!(wait_until(|| handle.state() == ReplicationState::Paused(None)));

    handle.stop();
}

#[test]
fn failing_feed_with_network_error_stays_paused_with_error() {
    let remote = Arc::new(FlakyFeedRemote::default());
    remote.fail_feed(Some(RemoteError::network("connection reset")));
    let local = store("a");
    let engine = flaky_engine(&local, &remote);
    let events = engine.events();
    let handle = engine.start();

    assert!(wait_for_event(&events, |event| matches!(event, ReplicationEvent::Paused(Some(_))))
        .is_some());
    // Pushing still works while the feed is down.
    local.save(Uuid::new_v4(), "outbound").unwrap();
    assert!(wait_until(|| remote.inner.push_count() == 1));
    assert!(state_holds(&handle, |state| matches!(
        state,
        ReplicationState::Paused(Some(err)) if err.kind == RemoteErrorKind::Network
    )));

    handle.stop();
}

#[test]
fn unservable_feed_entry_is_skipped() {
    let remote = Arc::new(FlakyFeedRemote::default());
    let (a, b) = (store("a"), store("b"));
    let (lost, kept) = (Uuid::new_v4(), Uuid::new_v4());
    let lost_rev = a.save(lost, "gone").unwrap();
    a.save(kept, "here").unwrap();
    flaky_engine(&a, &remote).push_once().unwrap();
    remote.refuse(&lost_rev.id);

    let engine_b = flaky_engine(&b, &remote);
    assert_eq!(engine_b.pull_once().unwrap(), 1);
    assert_eq!(b.checkpoint(PULL_CHECKPOINT).unwrap(), remote.inner.last_seq());
    assert!(b.load(lost).unwrap().is_none());
    assert_eq!(b.load(kept).unwrap().unwrap().content, "here");
}
