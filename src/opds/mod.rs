//! Feed and document model for the remote catalog.
//!
//! This module holds the structured objects produced by the feed parsers:
//! loan feeds, feed entries, acquisition links, and the content kinds they
//! reference. Parsing itself is a set of pure functions returning
//! [`ParseResult`]; acquisition path resolution turns an entry's links
//! into ordered [`AcquisitionPath`]s.

mod parse;
mod path;

pub use parse::{ParseError, ParseResult, ParseWarning, parse_feed_entry, parse_loans_feed};
pub use path::{AcquisitionPath, AcquisitionPathElement, acquisition_paths};

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// A MIME content kind attached to acquisition links and format handles.
///
/// Comparison ignores MIME parameters: `application/epub+zip;foo=1` is
/// compatible with `application/epub+zip`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKind(String);

impl ContentKind {
    /// Creates a content kind from a full MIME type string.
    #[must_use]
    pub fn new(full_type: impl Into<String>) -> Self {
        Self(full_type.into())
    }

    /// Generic EPUB files.
    #[must_use]
    pub fn epub() -> Self {
        Self::new("application/epub+zip")
    }

    /// Generic PDF files.
    #[must_use]
    pub fn pdf() -> Self {
        Self::new("application/pdf")
    }

    /// The bearer-token envelope served in place of content when a
    /// short-lived token exchange is required.
    #[must_use]
    pub fn bearer_token() -> Self {
        Self::new("application/vnd.librarysimplified.bearer-token+json")
    }

    /// Returns the full MIME type string.
    #[must_use]
    pub fn full_type(&self) -> &str {
        &self.0
    }

    /// Returns the type/subtype portion, dropping any parameters.
    #[must_use]
    pub fn base_type(&self) -> &str {
        self.0.split(';').next().unwrap_or(&self.0).trim()
    }

    /// Returns true if the two kinds share a type/subtype, ignoring
    /// MIME parameters and case.
    #[must_use]
    pub fn is_compatible_with(&self, other: &ContentKind) -> bool {
        self.base_type().eq_ignore_ascii_case(other.base_type())
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Loan availability of a feed entry as declared by the remote catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// The title can be borrowed.
    Loanable,
    /// The title is on loan to the current account.
    Loaned,
    /// The title is on hold for the current account.
    Held,
    /// The loan has been revoked by the provider.
    Revoked,
}

/// One step of indirection inside an acquisition link: the advertised
/// content type of a follow-up document, possibly nested further.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectAcquisition {
    /// Content type of the indirect target.
    #[serde(rename = "type")]
    pub content_type: ContentKind,
    /// Further indirection, if any.
    #[serde(default)]
    pub indirect: Vec<IndirectAcquisition>,
}

/// An acquisition link on a feed entry: a target URI, the content type it
/// serves, and zero or more indirection steps below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionLink {
    /// Content type served at the target.
    #[serde(rename = "type")]
    pub content_type: ContentKind,
    /// Target URI. Absent for links that only declare a format.
    #[serde(default)]
    pub target: Option<Url>,
    /// Indirection steps below this link.
    #[serde(default)]
    pub indirect: Vec<IndirectAcquisition>,
}

/// One parsed catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Canonical identifier (URN) of the title. BookIDs derive from this.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Loan availability.
    pub availability: Availability,
    /// Acquisition links, in catalog order.
    #[serde(default)]
    pub acquisitions: Vec<AcquisitionLink>,
    /// Cover image reference.
    #[serde(default)]
    pub cover: Option<Url>,
    /// Thumbnail image reference.
    #[serde(default)]
    pub thumbnail: Option<Url>,
}

/// A parsed loans feed: the account's remote source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoansFeed {
    /// Entries in feed order.
    #[serde(default)]
    pub entries: Vec<FeedEntry>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind_compatibility_ignores_parameters() {
        let a = ContentKind::new("application/epub+zip; charset=utf-8");
        let b = ContentKind::epub();
        assert!(a.is_compatible_with(&b));
        assert!(b.is_compatible_with(&a));
    }

    #[test]
    fn test_content_kind_compatibility_ignores_case() {
        let a = ContentKind::new("Application/PDF");
        assert!(a.is_compatible_with(&ContentKind::pdf()));
    }

    #[test]
    fn test_content_kind_incompatible_types() {
        assert!(!ContentKind::epub().is_compatible_with(&ContentKind::pdf()));
    }

    #[test]
    fn test_bearer_token_content_kind_is_stable() {
        assert_eq!(
            ContentKind::bearer_token().full_type(),
            "application/vnd.librarysimplified.bearer-token+json"
        );
    }
}
