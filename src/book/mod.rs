//! Book identity, value, and status model.
//!
//! A [`Book`] is an immutable snapshot: holders replace the whole value
//! rather than mutating it in place. [`BookStatus`] is derivable from a
//! snapshot at any instant via [`BookStatus::from_book`], with transient
//! overrides (`Requesting`, `Downloading`) published by in-flight
//! operations.

mod id;
mod status;

pub use id::BookID;
pub use status::{BookStatus, LoanedStatus};

use serde::{Deserialize, Serialize};

use crate::accounts::AccountId;
use crate::opds::{ContentKind, FeedEntry};

/// A locally known content format of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookFormat {
    /// The format's content type.
    pub content_type: ContentKind,
    /// Whether content bytes for this format are present locally.
    pub has_content: bool,
}

/// A book known to the client: identity, owning account, the latest
/// parsed feed entry, and the locally available formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    /// Stable identity derived from the entry's canonical identifier.
    pub id: BookID,
    /// The account that owns this book record.
    pub account: AccountId,
    /// The latest parsed feed entry.
    pub entry: FeedEntry,
    /// Locally known formats, in database order.
    pub formats: Vec<BookFormat>,
}

impl Book {
    /// Returns true if any format has content bytes present locally.
    #[must_use]
    pub fn is_downloaded(&self) -> bool {
        self.formats.iter().any(|format| format.has_content)
    }

    /// Returns a copy of this book with a replaced feed entry.
    #[must_use]
    pub fn with_entry(&self, entry: FeedEntry) -> Self {
        Self {
            entry,
            ..self.clone()
        }
    }
}
