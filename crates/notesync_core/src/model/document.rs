//! Document read model.
//!
//! # Responsibility
//! - Describe one document as seen through its winning revision.
//!
//! # Invariants
//! - `winning` is always `tree.winner()`.
//! - `content` is the content stored for `winning`.

use crate::model::revision::{Revision, RevisionId};
use crate::model::revision_tree::RevisionTree;
use crate::model::site::SiteId;
use uuid::Uuid;

/// Stable identifier of one document.
pub type DocumentId = Uuid;

/// Canonical state of one document owned by the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    /// Opaque payload of the winning revision.
    pub content: String,
    pub tree: RevisionTree,
    pub winning: Revision,
}

impl Document {
    /// Whether the winning revision is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.winning.deleted
    }

    /// Losing, non-deleted leaves kept as retrievable conflicts.
    pub fn conflicts(&self) -> Vec<RevisionId> {
        self.tree
            .conflicts()
            .into_iter()
            .map(|revision| revision.id.clone())
            .collect()
    }
}

/// Where a revision was first written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// Saved on this replica.
    Local,
    /// Merged in from the remote change feed.
    Remote,
}

impl ChangeOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// A revision together with the data needed to recreate it elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionPayload {
    pub doc_id: DocumentId,
    pub revision: Revision,
    /// Replica that authored the revision.
    pub site_id: SiteId,
    pub content: String,
}
