//! Stable book identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identifier for a book, derived deterministically from a feed
/// entry's canonical identifier.
///
/// The value is the lower-case hex SHA-256 of the canonical URN, so the
/// same catalog entry always maps to the same registry and database key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookID(String);

impl BookID {
    /// Derives a book ID from a canonical feed entry identifier.
    #[must_use]
    pub fn from_canonical_id(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.trim().as_bytes());
        let mut value = String::with_capacity(digest.len() * 2);
        for byte in digest {
            value.push_str(&format!("{byte:02x}"));
        }
        Self(value)
    }

    /// Wraps an already-derived identifier, as read back from the
    /// database.
    #[must_use]
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
