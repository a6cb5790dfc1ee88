//! Book status state machine.

use std::fmt;

use super::Book;
use crate::borrow::BorrowErrorCode;
use crate::opds::Availability;

/// Status of a loaned book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanedStatus {
    /// On loan, no content downloaded yet.
    NotDownloaded,
    /// On loan with content downloaded and usable.
    Downloaded,
}

/// Current status of a book as held by the registry.
///
/// The at-rest variants are derivable from a [`Book`] snapshot via
/// [`BookStatus::from_book`]; `Requesting` and `Downloading` are
/// transient overrides published while an operation is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookStatus {
    /// The title can be borrowed.
    Loanable,
    /// The title is on hold.
    Held,
    /// A borrow request is being negotiated with the provider.
    Requesting,
    /// The title is on loan.
    Loaned(LoanedStatus),
    /// Content is downloading. `progress` is a 0-100 percentage, or
    /// `None` when the total size is unknown.
    Downloading {
        /// Download progress percentage, when determinable.
        progress: Option<u8>,
    },
    /// The most recent borrow attempt failed.
    FailedDownload {
        /// The error code of the most recent failed step.
        error_code: BorrowErrorCode,
    },
    /// The most recent revoke attempt failed.
    FailedRevoke,
    /// The loan was revoked by the provider.
    Revoked,
}

impl BookStatus {
    /// Derives the at-rest status from a book snapshot.
    #[must_use]
    pub fn from_book(book: &Book) -> Self {
        match book.entry.availability {
            Availability::Loanable => Self::Loanable,
            Availability::Held => Self::Held,
            Availability::Revoked => Self::Revoked,
            Availability::Loaned => {
                if book.is_downloaded() {
                    Self::Loaned(LoanedStatus::Downloaded)
                } else {
                    Self::Loaned(LoanedStatus::NotDownloaded)
                }
            }
        }
    }

    /// Returns true for the failure variants a dismiss operation clears.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedDownload { .. } | Self::FailedRevoke)
    }

    /// Machine-friendly discriminator for event consumers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Loanable => "loanable",
            Self::Held => "held",
            Self::Requesting => "requesting",
            Self::Loaned(LoanedStatus::NotDownloaded) => "loaned_not_downloaded",
            Self::Loaned(LoanedStatus::Downloaded) => "loaned_downloaded",
            Self::Downloading { .. } => "downloading",
            Self::FailedDownload { .. } => "failed_download",
            Self::FailedRevoke => "failed_revoke",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downloading {
                progress: Some(percent),
            } => write!(f, "downloading ({percent}%)"),
            Self::FailedDownload { error_code } => {
                write!(f, "failed_download [{error_code}]")
            }
            other => write!(f, "{}", other.kind()),
        }
    }
}
