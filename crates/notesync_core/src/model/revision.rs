//! Revision identity and metadata.
//!
//! # Responsibility
//! - Derive revision ids deterministically from content, parent and origin.
//! - Validate revision metadata received from local storage or a remote.
//!
//! # Invariants
//! - Revision ids have the shape `{depth}-{hash}` with 32 lowercase hex chars.
//! - Root revisions have depth 1; a child is exactly one deeper than its parent.
//! - The depth embedded in the id always equals `Revision::depth`.

use crate::model::site::SiteId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

const REVISION_HASH_HEX_LEN: usize = 32;

/// Globally unique revision identifier, `{depth}-{hash}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId(String);

impl RevisionId {
    /// Derives the id of a revision from its defining inputs.
    ///
    /// Same inputs always yield the same id on every replica.
    pub fn derive(
        parent: Option<&RevisionId>,
        site: &SiteId,
        deleted: bool,
        content: &str,
    ) -> Self {
        let depth = parent.map_or(1, |parent| parent.depth() + 1);

        let mut hasher = Sha256::new();
        hasher.update(parent.map_or("", RevisionId::as_str).as_bytes());
        hasher.update([0u8]);
        hasher.update(site.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update([u8::from(deleted)]);
        hasher.update(content.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Self(format!("{depth}-{}", &digest[..REVISION_HASH_HEX_LEN]))
    }

    /// Parses and validates an id received from storage or a remote.
    pub fn parse(value: impl Into<String>) -> Result<Self, RevisionError> {
        let value = value.into();
        let Some((depth, hash)) = value.split_once('-') else {
            return Err(RevisionError::MalformedId(value));
        };
        let depth_ok = matches!(depth.parse::<u32>(), Ok(depth) if depth >= 1)
            && !depth.starts_with('0');
        let hash_ok = hash.len() == REVISION_HASH_HEX_LEN
            && hash
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !depth_ok || !hash_ok {
            return Err(RevisionError::MalformedId(value));
        }
        Ok(Self(value))
    }

    /// Tree depth encoded in the id prefix.
    pub fn depth(&self) -> u32 {
        self.0
            .split_once('-')
            .and_then(|(depth, _)| depth.parse().ok())
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RevisionId {
    type Error = RevisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RevisionId> for String {
    fn from(value: RevisionId) -> Self {
        value.0
    }
}

impl Display for RevisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Revision metadata validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionError {
    MalformedId(String),
    DepthMismatch {
        id: RevisionId,
        declared: u32,
    },
    ParentDepthMismatch {
        id: RevisionId,
        parent: Option<RevisionId>,
    },
}

impl Display for RevisionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedId(value) => write!(f, "malformed revision id `{value}`"),
            Self::DepthMismatch { id, declared } => {
                write!(f, "revision `{id}` declares depth {declared}")
            }
            Self::ParentDepthMismatch { id, parent: Some(parent) } => {
                write!(f, "revision `{id}` is not one level below parent `{parent}`")
            }
            Self::ParentDepthMismatch { id, parent: None } => {
                write!(f, "root revision `{id}` must have depth 1")
            }
        }
    }
}

impl Error for RevisionError {}

/// One node of a document revision tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    /// `None` for the root revision.
    pub parent: Option<RevisionId>,
    pub depth: u32,
    /// Deletion tombstone.
    pub deleted: bool,
}

impl Revision {
    /// Builds the next revision below `parent` for content written at `site`.
    pub fn next(parent: Option<&RevisionId>, site: &SiteId, deleted: bool, content: &str) -> Self {
        let id = RevisionId::derive(parent, site, deleted, content);
        Self {
            depth: id.depth(),
            id,
            parent: parent.cloned(),
            deleted,
        }
    }

    /// Checks that depth information is self-consistent.
    pub fn validate(&self) -> Result<(), RevisionError> {
        if self.id.depth() != self.depth {
            return Err(RevisionError::DepthMismatch {
                id: self.id.clone(),
                declared: self.depth,
            });
        }
        let parent_ok = match &self.parent {
            Some(parent) => parent.depth() + 1 == self.depth,
            None => self.depth == 1,
        };
        if !parent_ok {
            return Err(RevisionError::ParentDepthMismatch {
                id: self.id.clone(),
                parent: self.parent.clone(),
            });
        }
        Ok(())
    }

    /// Winner ordering: deeper revisions first, then greater id.
    pub fn winner_cmp(&self, other: &Self) -> Ordering {
        self.depth
            .cmp(&other.depth)
            .then_with(|| self.id.cmp(&other.id))
    }
}
