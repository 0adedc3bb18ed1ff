//! Continuous bidirectional document replication.
//!
//! # Responsibility
//! - Push locally stored revisions the remote does not have yet.
//! - Pull the remote change feed and merge unseen revisions (with their
//!   missing ancestors) into the local store.
//! - Run both directions as independent workers with exponential backoff,
//!   reporting `active`/`paused`/`denied`/`error` transitions and per
//!   document `change` events.
//!
//! # Invariants
//! - Every write goes through `LocalStore::merge_remote`; nothing is
//!   overwritten blindly.
//! - Checkpoints only advance past revisions that were fully handled, so a
//!   failed transfer never drops buffered local writes.
//! - Push and pull keep separate states; the observable state is the most
//!   severe of the two (`denied` > `error` > `paused` with an error >
//!   `active` > idle `paused`).
//! - A state event is emitted only when the observable state changes.
//! - `Denied` stops both workers; no automatic retry follows it.
//! - Every `events()` subscriber receives the full event stream.

use crate::config::ReplicationConfig;
use crate::model::document::{DocumentId, RevisionPayload};
use crate::model::revision::RevisionId;
use crate::service::local_store::{LocalStore, StoreError};
use crate::service::subscription::Subscription;
use crate::sync::backoff::Backoff;
use crate::sync::broadcast::EventBroadcaster;
use crate::sync::remote::{RemoteEndpoint, RemoteError, RemoteErrorKind};
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Highest local `local_seq` already offered to the remote.
pub const PUSH_CHECKPOINT: &str = "push_local_seq";
/// Highest remote feed sequence already merged locally.
pub const PULL_CHECKPOINT: &str = "pull_remote_seq";

pub type SyncResult<T> = Result<T, SyncError>;

/// Failure of one push or pull step.
#[derive(Debug)]
pub enum SyncError {
    Remote(RemoteError),
    Store(StoreError),
}

impl SyncError {
    /// Error as reported through replication events.
    fn to_remote_error(&self) -> RemoteError {
        match self {
            Self::Remote(err) => err.clone(),
            Self::Store(err) => RemoteError::unexpected(format!("local store: {err}")),
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Remote(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(value: RemoteError) -> Self {
        Self::Remote(value)
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Observable engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationState {
    /// Transferring revisions.
    Active,
    /// Idle or backing off, with the last transient error if any.
    Paused(Option<RemoteError>),
    /// Authorization rejected; workers stopped.
    Denied(RemoteError),
    /// Unexpected failure; still retried.
    Error(RemoteError),
}

/// Event stream item consumed by collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    Active,
    Paused(Option<RemoteError>),
    Denied(RemoteError),
    Error(RemoteError),
    /// A pulled revision changed this document's tree.
    Change(DocumentId),
}

impl From<ReplicationState> for ReplicationEvent {
    fn from(value: ReplicationState) -> Self {
        match value {
            ReplicationState::Active => Self::Active,
            ReplicationState::Paused(err) => Self::Paused(err),
            ReplicationState::Denied(err) => Self::Denied(err),
            ReplicationState::Error(err) => Self::Error(err),
        }
    }
}

/// Tuning knobs for the replication workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationOptions {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Revisions per push step and feed entries per pull step.
    pub batch_size: u32,
    /// Idle wait between polls, also the long-poll timeout.
    pub poll_interval: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&ReplicationConfig> for ReplicationOptions {
    fn from(value: &ReplicationConfig) -> Self {
        Self {
            backoff_base: value.backoff_base,
            backoff_max: value.backoff_max,
            batch_size: value.batch_size,
            poll_interval: value.poll_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl ReplicationState {
    fn severity(&self) -> u8 {
        match self {
            Self::Paused(None) => 0,
            Self::Active => 1,
            Self::Paused(Some(_)) => 2,
            Self::Error(_) => 3,
            Self::Denied(_) => 4,
        }
    }
}

/// Per-direction states and the combined state last reported.
struct StateBoard {
    push: ReplicationState,
    pull: ReplicationState,
    reported: ReplicationState,
}

impl StateBoard {
    fn new() -> Self {
        Self {
            push: ReplicationState::Paused(None),
            pull: ReplicationState::Paused(None),
            reported: ReplicationState::Paused(None),
        }
    }

    /// Records `next` for one direction and returns the new combined state
    /// when it differs from the reported one.
    fn update(&mut self, direction: Direction, next: ReplicationState) -> Option<ReplicationState> {
        if matches!(self.reported, ReplicationState::Denied(_)) {
            return None;
        }
        match direction {
            Direction::Push => self.push = next,
            Direction::Pull => self.pull = next,
        }
        let combined = if self.pull.severity() > self.push.severity() {
            self.pull.clone()
        } else {
            self.push.clone()
        };
        if combined == self.reported {
            return None;
        }
        self.reported = combined.clone();
        Some(combined)
    }
}

struct EngineInner {
    store: LocalStore,
    remote: Arc<dyn RemoteEndpoint>,
    options: ReplicationOptions,
    state: Mutex<StateBoard>,
    events: EventBroadcaster<ReplicationEvent>,
}

/// Replicates the local store with one remote endpoint.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct ReplicationEngine {
    inner: Arc<EngineInner>,
}

impl ReplicationEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteEndpoint>,
        options: ReplicationOptions,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                remote,
                options,
                state: Mutex::new(StateBoard::new()),
                events: EventBroadcaster::new(),
            }),
        }
    }

    pub fn options(&self) -> ReplicationOptions {
        self.inner.options
    }

    pub fn state(&self) -> ReplicationState {
        self.inner
            .state
            .lock()
            .map(|board| board.reported.clone())
            .unwrap_or(ReplicationState::Paused(None))
    }

    /// Subscribes to state transitions and change events.
    ///
    /// Each receiver gets every event published after the call. A receiver
    /// that is dropped or falls too far behind is unsubscribed.
    pub fn events(&self) -> Receiver<ReplicationEvent> {
        self.inner.events.subscribe()
    }

    /// Pushes at most one batch of local revisions.
    ///
    /// Returns how many revisions were sent to the remote.
    pub fn push_once(&self) -> SyncResult<usize> {
        let store = &self.inner.store;
        let remote = &self.inner.remote;
        let since = store.checkpoint(PUSH_CHECKPOINT)?;
        let changes = store.changes_since(since, self.inner.options.batch_size)?;
        let Some(batch_end) = changes.last().map(|change| change.local_seq) else {
            return Ok(0);
        };

        let mut offered: BTreeMap<DocumentId, Vec<RevisionId>> = BTreeMap::new();
        for change in &changes {
            offered
                .entry(change.payload.doc_id)
                .or_default()
                .push(change.payload.revision.id.clone());
        }
        let mut missing: BTreeSet<(DocumentId, RevisionId)> = BTreeSet::new();
        for (doc_id, rev_ids) in &offered {
            for rev_id in remote.revs_diff(*doc_id, rev_ids)? {
                missing.insert((*doc_id, rev_id));
            }
        }

        let mut pushed = 0;
        let mut handled = since;
        for change in &changes {
            let key = (change.payload.doc_id, change.payload.revision.id.clone());
            if missing.contains(&key) {
                if let Err(err) = remote.push(&change.payload) {
                    if handled > since {
                        store.set_checkpoint(PUSH_CHECKPOINT, handled)?;
                    }
                    return Err(err.into());
                }
                pushed += 1;
            }
            handled = change.local_seq;
        }
        store.set_checkpoint(PUSH_CHECKPOINT, batch_end)?;

        if pushed > 0 {
            info!(
                "event=sync_push module=sync status=ok revisions={pushed} checkpoint={batch_end}"
            );
        }
        Ok(pushed)
    }

    /// Pulls at most one page of the remote feed without waiting.
    ///
    /// Returns how many revisions were newly merged.
    pub fn pull_once(&self) -> SyncResult<usize> {
        self.pull_with_wait(Duration::ZERO)
    }

    fn pull_with_wait(&self, wait: Duration) -> SyncResult<usize> {
        let store = &self.inner.store;
        let since = store.checkpoint(PULL_CHECKPOINT)?;
        let batch = self
            .inner
            .remote
            .changes(since, self.inner.options.batch_size, wait)?;

        let mut merged = 0;
        for entry in &batch.entries {
            if !store.has_revision(entry.doc_id, &entry.rev_id)? {
                merged += self.pull_revision(entry.doc_id, &entry.rev_id)?;
            }
            store.set_checkpoint(PULL_CHECKPOINT, entry.seq)?;
        }
        if batch.last_seq > since {
            store.set_checkpoint(PULL_CHECKPOINT, batch.last_seq)?;
        }

        if merged > 0 {
            info!(
                "event=sync_pull module=sync status=ok revisions={merged} checkpoint={}",
                batch.last_seq
            );
        }
        Ok(merged)
    }

    /// Fetches `rev_id` and its unknown ancestors, then merges root first.
    fn pull_revision(&self, doc_id: DocumentId, rev_id: &RevisionId) -> SyncResult<usize> {
        let store = &self.inner.store;
        let remote = &self.inner.remote;

        let head = match remote.fetch(doc_id, rev_id) {
            Ok(payload) => payload,
            Err(err) if err.kind == RemoteErrorKind::NotFound => {
                warn!(
                    "event=sync_pull module=sync status=skipped doc_id={doc_id} missing_rev={rev_id}"
                );
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };
        let mut chain: Vec<RevisionPayload> = vec![head];
        while let Some(parent) = chain
            .last()
            .and_then(|payload| payload.revision.parent.clone())
        {
            if store.has_revision(doc_id, &parent)? {
                break;
            }
            match remote.fetch(doc_id, &parent) {
                Ok(payload) => chain.push(payload),
                Err(err) if err.kind == RemoteErrorKind::NotFound => {
                    debug!(
                        "event=sync_pull module=sync status=partial doc_id={doc_id} missing_rev={parent}"
                    );
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut inserted = 0;
        for payload in chain.iter().rev() {
            if store.merge_remote(payload)?.inserted {
                inserted += 1;
                self.emit(ReplicationEvent::Change(doc_id));
            }
        }
        Ok(inserted)
    }

    /// Spawns independent push and pull workers.
    pub fn start(&self) -> ReplicationHandle {
        self.reset_state();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let halted = Arc::new(AtomicBool::new(false));

        let (local_tx, local_rx) = unbounded::<()>();
        let subscription = self.inner.store.subscribe_all(move |_| {
            let _ = local_tx.send(());
        });

        let push_worker = Worker {
            direction: Direction::Push,
            engine: self.clone(),
            stop_rx: stop_rx.clone(),
            halted: Arc::clone(&halted),
        };
        let pull_worker = Worker {
            direction: Direction::Pull,
            engine: self.clone(),
            stop_rx,
            halted,
        };

        info!(
            "event=sync_start module=sync status=ok batch_size={} poll_interval_ms={}",
            self.inner.options.batch_size,
            self.inner.options.poll_interval.as_millis()
        );
        let joins = vec![
            thread::spawn(move || push_worker.run_push(local_rx)),
            thread::spawn(move || pull_worker.run_pull()),
        ];

        ReplicationHandle {
            engine: self.clone(),
            stop_tx: Some(stop_tx),
            joins,
            _subscription: subscription,
        }
    }

    fn emit(&self, event: ReplicationEvent) {
        self.inner.events.publish(&event);
    }

    fn reset_state(&self) {
        if let Ok(mut board) = self.inner.state.lock() {
            *board = StateBoard::new();
        }
    }

    /// Moves one direction to `next`, emitting an event only when the
    /// combined state changes. `Denied` is final.
    fn transition(&self, direction: Direction, next: ReplicationState) {
        let Ok(mut board) = self.inner.state.lock() else {
            return;
        };
        let Some(combined) = board.update(direction, next) else {
            return;
        };
        // Holding the lock keeps transitions from both workers ordered.
        self.emit(combined.into());
    }
}

struct Worker {
    direction: Direction,
    engine: ReplicationEngine,
    stop_rx: Receiver<()>,
    halted: Arc<AtomicBool>,
}

impl Worker {
    fn run_push(self, local_rx: Receiver<()>) {
        let options = self.engine.options();
        let mut backoff = Backoff::new(options.backoff_base, options.backoff_max);

        while !self.halted.load(Ordering::Relaxed) {
            match self.engine.push_once() {
                Ok(0) => {
                    backoff.reset();
                    self.engine.transition(self.direction, ReplicationState::Paused(None));
                    crossbeam::select! {
                        recv(self.stop_rx) -> _ => break,
                        recv(local_rx) -> msg => {
                            if msg.is_err() {
                                break;
                            }
                            while local_rx.try_recv().is_ok() {}
                        }
                        default(options.poll_interval) => {}
                    }
                }
                Ok(_) => {
                    backoff.reset();
                    self.engine.transition(self.direction, ReplicationState::Active);
                }
                Err(err) => {
                    let Some(delay) = self.on_failure(&err, &mut backoff) else {
                        break;
                    };
                    if self.sleep(delay) {
                        break;
                    }
                }
            }
        }
        debug!("event=sync_worker_exit module=sync status=ok direction=push");
    }

    fn run_pull(self) {
        let options = self.engine.options();
        let mut backoff = Backoff::new(options.backoff_base, options.backoff_max);

        while !self.halted.load(Ordering::Relaxed) {
            let started_at = Instant::now();
            match self.engine.pull_with_wait(options.poll_interval) {
                Ok(0) => {
                    backoff.reset();
                    self.engine.transition(self.direction, ReplicationState::Paused(None));
                    let elapsed = started_at.elapsed();
                    if elapsed < options.poll_interval && self.sleep(options.poll_interval - elapsed)
                    {
                        break;
                    }
                    if self.stopped() {
                        break;
                    }
                }
                Ok(_) => {
                    backoff.reset();
                    self.engine.transition(self.direction, ReplicationState::Active);
                    if self.stopped() {
                        break;
                    }
                }
                Err(err) => {
                    let Some(delay) = self.on_failure(&err, &mut backoff) else {
                        break;
                    };
                    if self.sleep(delay) {
                        break;
                    }
                }
            }
        }
        debug!("event=sync_worker_exit module=sync status=ok direction=pull");
    }

    /// Records the failure and returns the retry delay, or `None` to stop.
    fn on_failure(&self, err: &SyncError, backoff: &mut Backoff) -> Option<Duration> {
        let direction = self.direction.as_str();
        let remote_err = err.to_remote_error();
        if !remote_err.is_retriable() {
            warn!(
                "event=sync_{direction} module=sync status=denied error_kind={}",
                remote_err.kind.as_str()
            );
            self.halted.store(true, Ordering::Relaxed);
            self.engine
                .transition(self.direction, ReplicationState::Denied(remote_err));
            return None;
        }

        let delay = backoff.next_delay();
        warn!(
            "event=sync_{direction} module=sync status=retry error_kind={} retry_in_ms={} error={err}",
            remote_err.kind.as_str(),
            delay.as_millis()
        );
        let next = match remote_err.kind {
            RemoteErrorKind::Network => ReplicationState::Paused(Some(remote_err)),
            _ => ReplicationState::Error(remote_err),
        };
        self.engine.transition(self.direction, next);
        Some(delay)
    }

    /// Waits for `delay`; returns `true` when stop was requested meanwhile.
    fn sleep(&self, delay: Duration) -> bool {
        match self.stop_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => self.halted.load(Ordering::Relaxed),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    fn stopped(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
            || matches!(
                self.stop_rx.try_recv(),
                Ok(()) | Err(crossbeam::channel::TryRecvError::Disconnected)
            )
    }
}

/// Running replication workers; stopping or dropping joins them.
pub struct ReplicationHandle {
    engine: ReplicationEngine,
    stop_tx: Option<Sender<()>>,
    joins: Vec<JoinHandle<()>>,
    _subscription: Subscription,
}

impl ReplicationHandle {
    pub fn state(&self) -> ReplicationState {
        self.engine.state()
    }

    pub fn events(&self) -> Receiver<ReplicationEvent> {
        self.engine.events()
    }

    pub fn engine(&self) -> &ReplicationEngine {
        &self.engine
    }

    /// Stops both workers and waits for them to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects every worker's stop receiver.
        if self.stop_tx.take().is_none() {
            return;
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        info!("event=sync_stop module=sync status=ok");
    }
}

impl Drop for ReplicationHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Direction, ReplicationEngine, ReplicationEvent, ReplicationOptions, ReplicationState,
        StateBoard,
    };
    use crate::model::site::SiteId;
    use crate::service::local_store::LocalStore;
    use crate::sync::memory_remote::MemoryRemote;
    use crate::sync::remote::{RemoteEndpoint, RemoteError, RemoteErrorKind};
    use std::sync::Arc;
    use uuid::Uuid;

    fn store(site: &str) -> LocalStore {
        LocalStore::open_in_memory(SiteId::new(site).expect("valid site"))
            .expect("in-memory store should open")
    }

    #[test]
    fn push_failure_keeps_checkpoint_for_retry() {
        let local = store("a");
        let remote = Arc::new(MemoryRemote::new());
        let engine = ReplicationEngine::new(
            local.clone(),
            Arc::clone(&remote) as Arc<dyn RemoteEndpoint>,
            ReplicationOptions::default(),
        );
        local.save(Uuid::new_v4(), "x").expect("save should succeed");

        remote.fail_next(RemoteErrorKind::Network, 1);
        assert!(engine.push_once().is_err());
        assert_eq!(remote.push_count(), 0);

        assert_eq!(engine.push_once().expect("retry should succeed"), 1);
        assert_eq!(engine.push_once().expect("nothing left"), 0);
    }

    #[test]
    fn failing_direction_is_not_masked_by_idle_one() {
        let mut board = StateBoard::new();
        let err = RemoteError::unexpected("feed unavailable");

        assert_eq!(
            board.update(Direction::Pull, ReplicationState::Error(err.clone())),
            Some(ReplicationState::Error(err.clone()))
        );
        assert_eq!(board.update(Direction::Push, ReplicationState::Paused(None)), None);
        assert_eq!(board.update(Direction::Push, ReplicationState::Active), None);
        assert_eq!(board.reported, ReplicationState::Error(err));

        assert_eq!(
            board.update(Direction::Pull, ReplicationState::Paused(None)),
            Some(ReplicationState::Active)
        );
        assert_eq!(
            board.update(Direction::Push, ReplicationState::Paused(None)),
            Some(ReplicationState::Paused(None))
        );
    }

    #[test]
    fn transition_emits_only_on_change_and_denied_is_final() {
        let engine = ReplicationEngine::new(
            store("a"),
            Arc::new(MemoryRemote::new()),
            ReplicationOptions::default(),
        );
        let events = engine.events();

        engine.transition(Direction::Push, ReplicationState::Active);
        engine.transition(Direction::Pull, ReplicationState::Active);
        let denied = RemoteError::unauthorized("no");
        engine.transition(Direction::Pull, ReplicationState::Denied(denied.clone()));
        engine.transition(Direction::Push, ReplicationState::Active);

        let received: Vec<ReplicationEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![ReplicationEvent::Active, ReplicationEvent::Denied(denied.clone())]
        );
        assert_eq!(engine.state(), ReplicationState::Denied(denied));
    }

    #[test]
    fn every_subscriber_receives_every_event() {
        let engine = ReplicationEngine::new(
            store("a"),
            Arc::new(MemoryRemote::new()),
            ReplicationOptions::default(),
        );
        let ui = engine.events();
        let logger = engine.events();

        engine.transition(Direction::Push, ReplicationState::Active);
        engine.transition(Direction::Push, ReplicationState::Paused(None));

        let expected = vec![ReplicationEvent::Active, ReplicationEvent::Paused(None)];
        assert_eq!(ui.try_iter().collect::<Vec<_>>(), expected);
        assert_eq!(logger.try_iter().collect::<Vec<_>>(), expected);
    }
}
