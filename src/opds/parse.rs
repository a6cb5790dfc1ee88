//! Pure parse functions for feed documents.
//!
//! Parsers never perform I/O and never throw across the component
//! boundary: every outcome is a [`ParseResult`], and failures carry the
//! source URI, a position when one is known, and the underlying cause.

use std::fmt;
use std::sync::Arc;

use url::Url;

use super::{FeedEntry, LoansFeed};

/// A non-fatal observation made while parsing.
#[derive(Debug, Clone)]
pub struct ParseWarning {
    /// The URI of the document being parsed.
    pub source: Url,
    /// Description of the observation.
    pub message: String,
}

/// A fatal parse error.
#[derive(Debug, Clone)]
pub struct ParseError {
    /// The URI of the document being parsed.
    pub source: Url,
    /// Line/column within the document, when known.
    pub position: Option<(usize, usize)>,
    /// Description of the error.
    pub message: String,
    /// The underlying error, when one exists.
    pub cause: Option<Arc<anyhow::Error>>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some((line, column)) => {
                write!(
                    f,
                    "{}:{line}:{column}: {}",
                    self.source, self.message
                )
            }
            None => write!(f, "{}: {}", self.source, self.message),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| -> &(dyn std::error::Error + 'static) { cause.as_ref() })
    }
}

/// Result of parsing a document.
#[derive(Debug, Clone)]
pub enum ParseResult<T> {
    /// The document parsed.
    Success {
        /// Non-fatal observations.
        warnings: Vec<ParseWarning>,
        /// The parsed document.
        document: T,
    },
    /// The document did not parse.
    Failure {
        /// Non-fatal observations made before the failure.
        warnings: Vec<ParseWarning>,
        /// Fatal errors, in the order encountered.
        errors: Vec<ParseError>,
    },
}

impl<T> ParseResult<T> {
    /// Returns true if the document parsed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

fn json_failure<T>(source: &Url, error: serde_json::Error) -> ParseResult<T> {
    let position = if error.line() == 0 {
        None
    } else {
        Some((error.line(), error.column()))
    };
    ParseResult::Failure {
        warnings: Vec::new(),
        errors: vec![ParseError {
            source: source.clone(),
            position,
            message: error.to_string(),
            cause: Some(Arc::new(anyhow::Error::new(error))),
        }],
    }
}

/// Parses a loans feed document.
///
/// Entries missing an identifier or a title are rejected by the document
/// shape; an empty `entries` array parses successfully as an empty feed.
#[must_use]
pub fn parse_loans_feed(source: &Url, bytes: &[u8]) -> ParseResult<LoansFeed> {
    match serde_json::from_slice::<LoansFeed>(bytes) {
        Ok(document) => {
            let warnings = document
                .entries
                .iter()
                .filter(|entry| entry.acquisitions.is_empty())
                .map(|entry| ParseWarning {
                    source: source.clone(),
                    message: format!("entry {} has no acquisition links", entry.id),
                })
                .collect();
            ParseResult::Success { warnings, document }
        }
        Err(error) => json_failure(source, error),
    }
}

/// Parses a single feed entry document.
#[must_use]
pub fn parse_feed_entry(source: &Url, bytes: &[u8]) -> ParseResult<FeedEntry> {
    match serde_json::from_slice::<FeedEntry>(bytes) {
        Ok(document) => ParseResult::Success {
            warnings: Vec::new(),
            document,
        },
        Err(error) => json_failure(source, error),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::opds::Availability;

    fn source() -> Url {
        Url::parse("https://example.com/loans").unwrap()
    }

    #[test]
    fn test_parse_loans_feed_success() {
        let bytes = br#"{
            "entries": [
                {
                    "id": "urn:uuid:aaaa",
                    "title": "A Book",
                    "availability": "loaned",
                    "acquisitions": [
                        { "type": "application/epub+zip",
                          "target": "https://example.com/book.epub" }
                    ]
                }
            ]
        }"#;

        let result = parse_loans_feed(&source(), bytes);
        let ParseResult::Success { document, warnings } = result else {
            panic!("expected success");
        };
        assert!(warnings.is_empty());
        assert_eq!(document.entries.len(), 1);
        assert_eq!(document.entries[0].id, "urn:uuid:aaaa");
        assert_eq!(document.entries[0].availability, Availability::Loaned);
    }

    #[test]
    fn test_parse_loans_feed_empty() {
        let result = parse_loans_feed(&source(), br#"{ "entries": [] }"#);
        let ParseResult::Success { document, .. } = result else {
            panic!("expected success");
        };
        assert!(document.entries.is_empty());
    }

    #[test]
    fn test_parse_loans_feed_malformed_reports_position_and_cause() {
        let result = parse_loans_feed(&source(), b"Garbage");
        let ParseResult::Failure { errors, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].position.is_some());
        let cause = errors[0].cause.as_ref().unwrap();
        assert!(cause.downcast_ref::<serde_json::Error>().is_some());
    }

    #[test]
    fn test_parse_loans_feed_warns_on_entry_without_acquisitions() {
        let bytes = br#"{
            "entries": [
                { "id": "urn:uuid:bbbb", "title": "No Links", "availability": "loanable" }
            ]
        }"#;
        let result = parse_loans_feed(&source(), bytes);
        let ParseResult::Success { warnings, .. } = result else {
            panic!("expected success");
        };
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("urn:uuid:bbbb"));
    }

    #[test]
    fn test_parse_feed_entry_rejects_missing_title() {
        let result =
            parse_feed_entry(&source(), br#"{ "id": "urn:x", "availability": "loaned" }"#);
        assert!(!result.is_success());
    }
}
