//! Replica identity.
//!
//! # Responsibility
//! - Name one device/replica participating in synchronization.
//!
//! # Invariants
//! - A site id is non-empty and contains no whitespace.
//! - Ordering is plain byte-wise string ordering; it is the tie-break used by
//!   column merges, so it must be identical on every replica.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Unique identifier of a replica (device) taking part in sync.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SiteId(String);

/// Rejected site id input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSiteId(pub String);

impl Display for InvalidSiteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid site id `{}`", self.0)
    }
}

impl Error for InvalidSiteId {}

impl SiteId {
    /// Parses a caller-provided site id.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidSiteId> {
        let value = value.into();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(InvalidSiteId(value));
        }
        Ok(Self(value))
    }

    /// Generates a fresh random site id for a new install.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SiteId {
    type Error = InvalidSiteId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SiteId> for String {
    fn from(value: SiteId) -> Self {
        value.0
    }
}

impl Display for SiteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
