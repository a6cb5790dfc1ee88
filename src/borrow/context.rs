//! Per-attempt execution environment for borrow subtasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use url::Url;

use super::error::BorrowErrorCode;
use super::subtask::BorrowSubtaskError;
use crate::accounts::Account;
use crate::book::{Book, BookID, BookStatus};
use crate::database::{BookDatabaseEntry, DatabaseError};
use crate::http::HttpClient;
use crate::opds::{AcquisitionPath, ContentKind};
use crate::registry::{BookRegistry, BookWithStatus};
use crate::taskrec::TaskRecorder;

/// Clock used to timestamp recorder steps. Injectable for tests.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// The execution environment threaded through every borrow subtask.
///
/// A context lives for exactly one borrow attempt and is discarded after
/// the pipeline terminates. It owns the attempt's task recorder and the
/// acquisition path being consumed (plus an optional URI override); the
/// registry and database entry it references are the only state shared
/// with the rest of the system.
pub struct BorrowContext {
    account: Arc<Account>,
    registry: Arc<BookRegistry>,
    http: HttpClient,
    recorder: TaskRecorder,
    clock: Clock,
    temp_dir: PathBuf,
    cancelled: Arc<AtomicBool>,
    database_entry: BookDatabaseEntry,
    book: Book,
    path: AcquisitionPath,
    current_uri: Option<Url>,
}

impl BorrowContext {
    /// Creates the context for one borrow attempt.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: Arc<Account>,
        registry: Arc<BookRegistry>,
        http: HttpClient,
        clock: Clock,
        temp_dir: PathBuf,
        cancelled: Arc<AtomicBool>,
        database_entry: BookDatabaseEntry,
        book_initial: Book,
        path: AcquisitionPath,
    ) -> Self {
        Self {
            account,
            registry,
            http,
            recorder: TaskRecorder::new(),
            clock,
            temp_dir,
            cancelled,
            database_entry,
            book: book_initial,
            path,
            current_uri: None,
        }
    }

    /// The account performing the borrow.
    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The book's identity.
    #[must_use]
    pub fn book_id(&self) -> &BookID {
        &self.book.id
    }

    /// The current book snapshot.
    #[must_use]
    pub fn book(&self) -> &Book {
        &self.book
    }

    /// The registry shared with the rest of the system.
    #[must_use]
    pub fn registry(&self) -> &Arc<BookRegistry> {
        &self.registry
    }

    /// The HTTP client for this attempt.
    #[must_use]
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// The database entry being written by this attempt.
    #[must_use]
    pub fn database_entry(&self) -> &BookDatabaseEntry {
        &self.database_entry
    }

    /// The attempt's cancellation flag, for sharing with I/O loops.
    #[must_use]
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Returns true once the attempt has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Checks the cancellation flag, surfacing cancellation as the
    /// distinguished subtask error (no error code is recorded).
    ///
    /// # Errors
    ///
    /// Returns [`BorrowSubtaskError::Cancelled`] when the flag is set.
    pub fn check_cancelled(&self) -> Result<(), BorrowSubtaskError> {
        if self.is_cancelled() {
            Err(BorrowSubtaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The acquisition path this attempt is consuming.
    #[must_use]
    pub fn path(&self) -> &AcquisitionPath {
        &self.path
    }

    /// The content type the path settles on: its final element's type.
    /// Indirection hops between the first fetch and this type are
    /// resolved by the HTTP interceptor chain.
    #[must_use]
    pub fn expected_type(&self) -> &ContentKind {
        &self.path.final_element().content_type
    }

    /// Overrides the URI to fetch (used when an earlier exchange supplies
    /// the next location, and by tests).
    pub fn set_current_uri(&mut self, uri: Url) {
        self.current_uri = Some(uri);
    }

    /// The URI the attempt should fetch: the override when one was set,
    /// otherwise the path's first element target.
    #[must_use]
    pub fn current_uri(&self) -> Option<Url> {
        self.current_uri
            .clone()
            .or_else(|| self.path.elements().first().and_then(|e| e.target.clone()))
    }

    /// The temporary download location for this attempt. Downloads land
    /// here and are handed to a format handle only once complete.
    #[must_use]
    pub fn temporary_file(&self) -> PathBuf {
        self.temp_dir.join(format!("{}.download", self.book.id))
    }

    /// Begins a recorder step timestamped with the context clock.
    pub fn begin_step(&mut self, description: impl Into<String>) {
        let now = (self.clock)();
        self.recorder.begin_new_step_at(description, now);
    }

    /// The recorder accumulating this attempt's steps.
    pub fn recorder_mut(&mut self) -> &mut TaskRecorder {
        &mut self.recorder
    }

    /// Consumes the context, yielding the recorder to produce the
    /// terminal result.
    #[must_use]
    pub fn into_recorder(self) -> TaskRecorder {
        self.recorder
    }

    /// Publishes a `Downloading` status for the book.
    pub fn book_download_is_running(&self, progress: Option<u8>) {
        self.registry.update(BookWithStatus::new(
            self.book.clone(),
            BookStatus::Downloading { progress },
        ));
    }

    /// Publishes a `FailedDownload` status carrying the error code.
    pub fn book_download_failed(&self, error_code: BorrowErrorCode) {
        self.registry.update(BookWithStatus::new(
            self.book.clone(),
            BookStatus::FailedDownload { error_code },
        ));
    }

    /// Reloads the book from the database entry and publishes the status
    /// derived from its new data.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError`] if the snapshot cannot be reloaded; the
    /// caller classifies it as `bookDatabaseFailed`.
    pub async fn book_download_succeeded(&mut self) -> Result<(), DatabaseError> {
        self.book = self.database_entry.book().await?;
        self.registry
            .update(BookWithStatus::derived(self.book.clone()));
        Ok(())
    }
}
