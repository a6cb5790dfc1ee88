//! Stable error codes for borrow failures.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed enumeration of borrow failure codes.
///
/// Codes are stable identifiers intended for UI messaging and tests;
/// they never carry raw exception text. The string forms are part of the
/// external contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BorrowErrorCode {
    /// The current acquisition path element carries no target URI.
    RequiredUriMissing,
    /// The HTTP connection could not be established or timed out.
    HttpConnectionFailed,
    /// The server returned a non-2xx response.
    HttpRequestFailed,
    /// A 2xx response carried a content type incompatible with the
    /// expected format.
    HttpContentTypeIncompatible,
    /// No registered subtask can handle the acquisition path element.
    UnsupportedAcquisition,
    /// The book database entry has no format handle for the downloaded
    /// content type.
    NoFormatHandle,
    /// A book database operation failed.
    BookDatabaseFailed,
    /// An internal error that does not fit any other classification.
    UnexpectedException,
}

impl BorrowErrorCode {
    /// Returns the stable string identifier for this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequiredUriMissing => "requiredURIMissing",
            Self::HttpConnectionFailed => "httpConnectionFailed",
            Self::HttpRequestFailed => "httpRequestFailed",
            Self::HttpContentTypeIncompatible => "httpContentTypeIncompatible",
            Self::UnsupportedAcquisition => "unsupportedAcquisition",
            Self::NoFormatHandle => "noFormatHandle",
            Self::BookDatabaseFailed => "bookDatabaseFailed",
            Self::UnexpectedException => "unexpectedException",
        }
    }
}

impl fmt::Display for BorrowErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
