//! Remote replication endpoint port.
//!
//! # Responsibility
//! - Define the contract the replication engine consumes from a remote
//!   store holding the same document/revision model.
//! - Classify remote failures so the engine can decide between retrying
//!   and stopping.
//!
//! # Invariants
//! - Pushing a revision the remote already holds is accepted as a no-op.
//! - Change feed sequence numbers are strictly increasing.
//! - Authentication is opaque here; an authorization rejection surfaces as
//!   `RemoteErrorKind::Unauthorized`.

use crate::model::document::{DocumentId, RevisionPayload};
use crate::model::revision::RevisionId;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failure classification for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// Transient connectivity failure.
    Network,
    /// Credentials rejected; retrying cannot help.
    Unauthorized,
    /// Requested document or revision is unknown to the remote.
    NotFound,
    Unexpected,
}

impl RemoteErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Unexpected => "unexpected",
        }
    }
}

/// Remote call error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unexpected, message)
    }

    /// Everything except an authorization rejection is retried.
    pub fn is_retriable(&self) -> bool {
        self.kind != RemoteErrorKind::Unauthorized
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote {} error: {}", self.kind.as_str(), self.message)
    }
}

impl Error for RemoteError {}

/// One entry of the remote change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedEntry {
    pub seq: u64,
    pub doc_id: DocumentId,
    pub rev_id: RevisionId,
    pub deleted: bool,
}

/// Page of the remote change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesBatch {
    pub entries: Vec<ChangeFeedEntry>,
    /// Resume point for the next `changes` call.
    pub last_seq: u64,
}

/// Contract of a remote store replicating the document model.
pub trait RemoteEndpoint: Send + Sync {
    /// Stores one revision as a node of the remote tree.
    fn push(&self, payload: &RevisionPayload) -> RemoteResult<()>;

    /// Returns the subset of `rev_ids` the remote does not have.
    fn revs_diff(&self, doc_id: DocumentId, rev_ids: &[RevisionId])
        -> RemoteResult<Vec<RevisionId>>;

    /// Reads feed entries after `since`, waiting up to `wait` when none are
    /// available yet.
    fn changes(&self, since: u64, limit: u32, wait: Duration) -> RemoteResult<ChangesBatch>;

    /// Reads one revision with its content.
    fn fetch(&self, doc_id: DocumentId, rev_id: &RevisionId) -> RemoteResult<RevisionPayload>;
}
