//! Direct HTTP download of book content.
//!
//! Handles acquisition paths that settle on a storable format. The fetch
//! of the path's first URI runs through the HTTP client's interceptor
//! chain, so bearer-token indirection hops are resolved transparently
//! before the body ever reaches this subtask; the settled response must
//! carry the path's final content type.
//!
//! The database entry is written only after the body has fully streamed
//! to a temporary file: a failed or cancelled download leaves the stored
//! book data untouched.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::context::BorrowContext;
use super::error::BorrowErrorCode;
use super::subtask::{BorrowSubtask, BorrowSubtaskError};
use crate::book::BookStatus;
use crate::http::{HttpError, HttpRequest};
use crate::opds::{AcquisitionPath, ContentKind};
use crate::registry::BookWithStatus;

/// Subtask performing a plain authenticated GET of book content.
pub struct DirectDownloadSubtask {
    supported_formats: Vec<ContentKind>,
}

impl Default for DirectDownloadSubtask {
    fn default() -> Self {
        Self::new(vec![ContentKind::epub(), ContentKind::pdf()])
    }
}

impl DirectDownloadSubtask {
    /// Creates a subtask handling the given storable formats.
    #[must_use]
    pub fn new(supported_formats: Vec<ContentKind>) -> Self {
        Self { supported_formats }
    }

    fn fail(
        context: &mut BorrowContext,
        code: BorrowErrorCode,
        message: impl Into<String>,
        cause: Option<anyhow::Error>,
    ) -> BorrowSubtaskError {
        let message = message.into();
        context.book_download_failed(code);
        let error = match cause {
            Some(cause) => BorrowSubtaskError::failed_with_cause(code, cause),
            None => BorrowSubtaskError::failed(code),
        };
        let exception = match &error {
            BorrowSubtaskError::Failed { cause, .. } => cause.clone(),
            BorrowSubtaskError::Cancelled => None,
        };
        context
            .recorder_mut()
            .current_step_failed(message, code.as_str(), exception);
        error
    }

    fn percent(received: u64, expected: u64) -> u8 {
        if expected == 0 {
            return 100;
        }
        let value = received.saturating_mul(100) / expected;
        u8::try_from(value.min(100)).unwrap_or(100)
    }
}

#[async_trait]
impl BorrowSubtask for DirectDownloadSubtask {
    fn name(&self) -> &'static str {
        "direct-download"
    }

    fn is_applicable_to(&self, path: &AcquisitionPath) -> bool {
        let settled = &path.final_element().content_type;
        self.supported_formats
            .iter()
            .any(|format| settled.is_compatible_with(format))
    }

    #[instrument(skip(self, context), fields(book = %context.book_id()))]
    async fn execute(&self, context: &mut BorrowContext) -> Result<(), BorrowSubtaskError> {
        context.check_cancelled()?;
        context.book_download_is_running(None);

        context.begin_step("Checking for a required URI.");
        let Some(uri) = context.current_uri() else {
            return Err(Self::fail(
                context,
                BorrowErrorCode::RequiredUriMissing,
                "The acquisition path carries no target URI.",
                None,
            ));
        };
        context
            .recorder_mut()
            .current_step_succeeded(format!("URI is {uri}"));

        context.begin_step(format!("Downloading {uri} directly."));
        let mut request = HttpRequest::get(uri.clone());
        if let Some(credentials) = context.account().credentials() {
            request = request.with_basic_auth(credentials.user_name, credentials.password);
        }

        let fetch = match context.http().fetch(request).await {
            Ok(fetch) => fetch,
            Err(HttpError::Cancelled) => return Err(BorrowSubtaskError::Cancelled),
            Err(error @ HttpError::Connection { .. }) => {
                return Err(Self::fail(
                    context,
                    BorrowErrorCode::HttpConnectionFailed,
                    format!("Connection to {uri} failed."),
                    Some(anyhow::Error::new(error)),
                ));
            }
            Err(error) => {
                return Err(Self::fail(
                    context,
                    BorrowErrorCode::UnexpectedException,
                    format!("Fetching {uri} failed unexpectedly."),
                    Some(anyhow::Error::new(error)),
                ));
            }
        };

        if !fetch.is_success() {
            return Err(Self::fail(
                context,
                BorrowErrorCode::HttpRequestFailed,
                format!("The server rejected the request: HTTP {}", fetch.status),
                None,
            ));
        }

        let expected_type = context.expected_type().clone();
        let received_type = fetch.content_type.clone();
        let compatible = received_type
            .as_ref()
            .is_some_and(|received| received.is_compatible_with(&expected_type));
        if !compatible {
            let received = received_type
                .as_ref()
                .map_or_else(|| "(none)".to_string(), ToString::to_string);
            return Err(Self::fail(
                context,
                BorrowErrorCode::HttpContentTypeIncompatible,
                format!("Expected {expected_type} but the server sent {received}."),
                None,
            ));
        }
        context
            .recorder_mut()
            .current_step_succeeded(format!("Received {}", fetch.status));

        context.begin_step("Streaming the download to local storage.");
        context.book_download_is_running(Some(0));

        let temp = context.temporary_file();
        let cancelled = context.cancellation_flag();
        let registry = std::sync::Arc::clone(context.registry());
        let book = context.book().clone();
        let mut last_progress: Option<Option<u8>> = None;
        let stream_result = fetch
            .stream_to_file(&temp, &cancelled, |received, expected| {
                let progress = expected.map(|total| Self::percent(received, total));
                if last_progress != Some(progress) {
                    registry.update(BookWithStatus::new(
                        book.clone(),
                        BookStatus::Downloading { progress },
                    ));
                    last_progress = Some(progress);
                }
            })
            .await;

        let received_bytes = match stream_result {
            Ok(bytes) => bytes,
            Err(HttpError::Cancelled) => {
                remove_file_best_effort(&temp).await;
                return Err(BorrowSubtaskError::Cancelled);
            }
            Err(error @ (HttpError::Connection { .. } | HttpError::Transfer { .. })) => {
                remove_file_best_effort(&temp).await;
                return Err(Self::fail(
                    context,
                    BorrowErrorCode::HttpConnectionFailed,
                    format!("The transfer from {uri} failed."),
                    Some(anyhow::Error::new(error)),
                ));
            }
            Err(error) => {
                remove_file_best_effort(&temp).await;
                return Err(Self::fail(
                    context,
                    BorrowErrorCode::UnexpectedException,
                    "Writing the download to local storage failed.",
                    Some(anyhow::Error::new(error)),
                ));
            }
        };
        debug!(bytes = received_bytes, "download body stored");
        context
            .recorder_mut()
            .current_step_succeeded(format!("Downloaded {received_bytes} bytes"));

        context.begin_step("Saving the downloaded content.");
        let handle = match context.database_entry().find_format_handle(&expected_type).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                remove_file_best_effort(&temp).await;
                return Err(Self::fail(
                    context,
                    BorrowErrorCode::NoFormatHandle,
                    format!("The book has no format handle for {expected_type}."),
                    None,
                ));
            }
            Err(error) => {
                remove_file_best_effort(&temp).await;
                return Err(Self::fail(
                    context,
                    BorrowErrorCode::BookDatabaseFailed,
                    "Looking up the book's format handle failed.",
                    Some(anyhow::Error::new(error)),
                ));
            }
        };

        if let Err(error) = handle.copy_in_bytes(&temp).await {
            return Err(Self::fail(
                context,
                BorrowErrorCode::BookDatabaseFailed,
                "Saving the downloaded content failed.",
                Some(anyhow::Error::new(error)),
            ));
        }

        context.book_download_is_running(Some(100));
        if let Err(error) = context.book_download_succeeded().await {
            return Err(Self::fail(
                context,
                BorrowErrorCode::BookDatabaseFailed,
                "Reloading the book after saving its content failed.",
                Some(anyhow::Error::new(error)),
            ));
        }
        context
            .recorder_mut()
            .current_step_succeeded("Content saved.");
        Ok(())
    }
}

async fn remove_file_best_effort(path: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), %error, "failed to remove temporary file");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::opds::AcquisitionPathElement;

    fn path_of(kinds: &[ContentKind]) -> AcquisitionPath {
        AcquisitionPath::new(
            kinds
                .iter()
                .map(|kind| AcquisitionPathElement::new(kind.clone(), None))
                .collect(),
        )
    }

    #[test]
    fn test_percent_clamps_and_handles_zero_total() {
        assert_eq!(DirectDownloadSubtask::percent(0, 0), 100);
        assert_eq!(DirectDownloadSubtask::percent(0, 200), 0);
        assert_eq!(DirectDownloadSubtask::percent(100, 200), 50);
        assert_eq!(DirectDownloadSubtask::percent(400, 200), 100);
    }

    #[test]
    fn test_applicable_to_parameterized_content_type() {
        let subtask = DirectDownloadSubtask::default();
        let path = path_of(&[ContentKind::new("application/epub+zip; charset=utf-8")]);
        assert!(subtask.is_applicable_to(&path));
    }

    #[test]
    fn test_applicable_to_bearer_token_path_settling_on_epub() {
        let subtask = DirectDownloadSubtask::default();
        let path = path_of(&[ContentKind::bearer_token(), ContentKind::epub()]);
        assert!(subtask.is_applicable_to(&path));
    }

    #[test]
    fn test_not_applicable_to_path_settling_on_bearer_token() {
        let subtask = DirectDownloadSubtask::default();
        let path = path_of(&[ContentKind::bearer_token()]);
        assert!(!subtask.is_applicable_to(&path));
    }
}
