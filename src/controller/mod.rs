//! The books controller: sync, borrow, cancel, dismiss.
//!
//! The controller is the public surface of the engine. It owns the
//! account table, the download and feed-fetch concurrency limits, and
//! the book registry/database pair; every externally visible operation
//! goes through it.
//!
//! Sync reconciles the remote loans feed against local state and
//! reports its work as a [`TaskResult`]. Borrow runs one pipeline
//! attempt per call under the download semaphore and returns its
//! outcome. Cancellation is cooperative, via a per-attempt flag shared
//! with the pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::accounts::{Account, AccountId, AuthenticationSupport, Credentials};
use crate::book::{Book, BookID, BookStatus};
use crate::borrow::{
    BorrowContext, BorrowErrorCode, BorrowOutcome, BorrowSubtaskDirectory, BorrowTask, Clock,
};
use crate::database::{BookDatabase, DatabaseError};
use crate::http::{HttpClient, HttpRequest};
use crate::opds::{ContentKind, LoansFeed, ParseResult, acquisition_paths, parse_loans_feed};
use crate::registry::{BookRegistry, BookWithStatus, RegistryError};
use crate::taskrec::{TaskRecorder, TaskResult};

/// Error code recorded when a loans feed fails to parse.
const CODE_FEED_PARSE_FAILED: &str = "feedParseFailed";

/// Error code recorded when a sync is requested for an unknown account.
const CODE_UNKNOWN_ACCOUNT: &str = "unknownAccount";

/// Tuning knobs for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfiguration {
    /// Maximum borrow downloads running at once.
    pub max_concurrent_downloads: usize,
    /// Maximum loans-feed fetches running at once.
    pub max_concurrent_feed_fetches: usize,
    /// Directory for in-flight download files.
    pub temp_dir: PathBuf,
}

impl ControllerConfiguration {
    /// Creates a configuration with default limits.
    #[must_use]
    pub fn new(temp_dir: PathBuf) -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_concurrent_feed_fetches: 2,
            temp_dir,
        }
    }
}

/// Errors surfaced by controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The account is not registered with the controller.
    #[error("no such account: {0}")]
    NoSuchAccount(AccountId),

    /// A book database operation failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// A registry lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A borrow attempt is already running for the book.
    #[error("borrow already in progress for {0}")]
    BorrowInProgress(BookID),

    /// Dismissal was requested for a book whose status is not a failure.
    #[error("book status is not a failure: {0}")]
    NotFailed(BookID),

    /// The controller's worker pools have shut down.
    #[error("controller is shutting down")]
    Shutdown,
}

/// The public surface of the acquisition engine.
pub struct BooksController {
    accounts: DashMap<AccountId, Arc<Account>>,
    database: BookDatabase,
    registry: Arc<BookRegistry>,
    http: HttpClient,
    subtasks: Arc<BorrowSubtaskDirectory>,
    clock: Clock,
    temp_dir: PathBuf,
    supported_formats: Vec<ContentKind>,
    downloads: Arc<Semaphore>,
    feed_fetches: Arc<Semaphore>,
    active_borrows: DashMap<BookID, Arc<AtomicBool>>,
}

impl std::fmt::Debug for BooksController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BooksController")
            .field("accounts", &self.accounts.len())
            .field("active_borrows", &self.active_borrows.len())
            .finish_non_exhaustive()
    }
}

impl BooksController {
    /// Creates a controller over the given collaborators.
    #[must_use]
    pub fn new(
        configuration: &ControllerConfiguration,
        database: BookDatabase,
        registry: Arc<BookRegistry>,
        http: HttpClient,
        subtasks: Arc<BorrowSubtaskDirectory>,
    ) -> Self {
        Self {
            accounts: DashMap::new(),
            database,
            registry,
            http,
            subtasks,
            clock: Arc::new(SystemTime::now),
            temp_dir: configuration.temp_dir.clone(),
            supported_formats: vec![ContentKind::epub(), ContentKind::pdf()],
            downloads: Arc::new(Semaphore::new(configuration.max_concurrent_downloads)),
            feed_fetches: Arc::new(Semaphore::new(configuration.max_concurrent_feed_fetches)),
            active_borrows: DashMap::new(),
        }
    }

    /// Replaces the clock used to timestamp recorder steps.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The registry this controller publishes to.
    #[must_use]
    pub fn registry(&self) -> &Arc<BookRegistry> {
        &self.registry
    }

    /// Registers an account with the controller.
    pub fn register_account(&self, account: Arc<Account>) {
        debug!(account = %account.id, "registering account");
        self.accounts.insert(account.id.clone(), account);
    }

    fn account(&self, id: &AccountId) -> Result<Arc<Account>, ControllerError> {
        self.accounts
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ControllerError::NoSuchAccount(id.clone()))
    }

    fn now(&self) -> SystemTime {
        (self.clock)()
    }

    /// Replays an account's stored books into the registry. Called at
    /// startup so the registry reflects durable state before any sync.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Database`] if the replay fails.
    #[instrument(skip(self))]
    pub async fn load_books(&self, account_id: &AccountId) -> Result<(), ControllerError> {
        let books = self.database.books(account_id).await?;
        info!(account = %account_id, count = books.len(), "loading stored books");
        for book in books {
            self.registry.update(BookWithStatus::derived(book));
        }
        Ok(())
    }

    /// Synchronizes an account's loans feed against local state,
    /// reporting every step through a [`TaskResult`].
    ///
    /// Accounts whose provider declares no authentication, and accounts
    /// holding no credentials, synchronize as a successful no-op. The
    /// patron profile is fetched first: a 401 clears the account's
    /// credentials and ends the sync successfully as a no-op, while any
    /// other non-2xx status fails it with an I/O-classified exception.
    /// Connection failures and unparseable feeds fail the sync with the
    /// underlying cause preserved; local state is untouched on every
    /// failure path.
    ///
    /// On a parsed feed, entries are upserted into the database and the
    /// registry in feed order, and stored books absent from the feed are
    /// deleted along with their downloaded content.
    #[instrument(skip(self))]
    pub async fn books_sync(&self, account_id: &AccountId) -> TaskResult<()> {
        let mut recorder = TaskRecorder::new();

        recorder.begin_new_step_at("Locating the account.", self.now());
        let account = match self.account(account_id) {
            Ok(account) => account,
            Err(error) => {
                recorder.current_step_failed(
                    format!("Account {account_id} is not registered."),
                    CODE_UNKNOWN_ACCOUNT,
                    Some(Arc::new(anyhow::Error::new(error))),
                );
                return recorder.finish_failure();
            }
        };
        recorder.current_step_succeeded("Account located.");

        recorder.begin_new_step_at("Checking authentication requirements.", self.now());
        match account.provider.authentication {
            AuthenticationSupport::Anonymous => {
                debug!(account = %account_id, "provider requires no authentication; skipping sync");
                recorder.current_step_succeeded("Provider requires no authentication.");
                return recorder.finish_success(());
            }
            AuthenticationSupport::Basic => {}
        }
        let Some(credentials) = account.credentials() else {
            debug!(account = %account_id, "account holds no credentials; skipping sync");
            recorder.current_step_succeeded("Account is not logged in; nothing to sync.");
            return recorder.finish_success(());
        };
        recorder.current_step_succeeded("Credentials are present.");

        let Ok(_permit) = self.feed_fetches.acquire().await else {
            recorder.begin_new_step_at("Waiting for a fetch slot.", self.now());
            recorder.current_step_failed(
                "The controller's fetch pool has shut down.",
                BorrowErrorCode::UnexpectedException.as_str(),
                None,
            );
            return recorder.finish_failure();
        };

        match self
            .fetch_patron_profile(&mut recorder, &account, &credentials)
            .await
        {
            ProfileCheck::Proceed => {}
            ProfileCheck::Stop(result) => return result,
        }

        let feed = match self.fetch_loans_feed(&mut recorder, &account, &credentials).await {
            Ok(feed) => feed,
            Err(result) => return result,
        };
        info!(account = %account_id, entries = feed.entries.len(), "loans feed parsed");

        recorder.begin_new_step_at("Reconciling local books with the feed.", self.now());
        match self.reconcile(account_id, &feed).await {
            Ok((updated, removed)) => {
                recorder.current_step_succeeded(format!(
                    "{updated} books updated, {removed} removed"
                ));
                recorder.finish_success(())
            }
            Err(error) => {
                recorder.current_step_failed(
                    "Updating the book database failed.",
                    BorrowErrorCode::BookDatabaseFailed.as_str(),
                    Some(Arc::new(anyhow::Error::new(error))),
                );
                recorder.finish_failure()
            }
        }
    }

    async fn fetch_patron_profile(
        &self,
        recorder: &mut TaskRecorder,
        account: &Account,
        credentials: &Credentials,
    ) -> ProfileCheck {
        let profile_uri = account.provider.patron_profile_uri.clone();
        recorder.begin_new_step_at(format!("Fetching patron profile {profile_uri}."), self.now());

        let request = HttpRequest::get(profile_uri).with_basic_auth(
            credentials.user_name.clone(),
            credentials.password.clone(),
        );
        let fetch = match self.http.fetch(request).await {
            Ok(fetch) => fetch,
            Err(error) => {
                recorder.current_step_failed(
                    "Connecting to the patron profile failed.",
                    BorrowErrorCode::HttpConnectionFailed.as_str(),
                    Some(Arc::new(anyhow::Error::new(error))),
                );
                return ProfileCheck::Stop(std::mem::take(recorder).finish_failure());
            }
        };

        if fetch.status == 401 {
            warn!(account = %account.id, "patron profile fetch returned 401");
            account.clear_credentials();
            recorder.current_step_succeeded("Credentials were rejected and have been cleared.");
            return ProfileCheck::Stop(std::mem::take(recorder).finish_success(()));
        }
        if !fetch.is_success() {
            recorder.current_step_failed(
                format!("The server rejected the request: HTTP {}", fetch.status),
                BorrowErrorCode::HttpRequestFailed.as_str(),
                Some(Arc::new(anyhow::Error::new(std::io::Error::other(format!(
                    "HTTP {} fetching patron profile",
                    fetch.status
                ))))),
            );
            return ProfileCheck::Stop(std::mem::take(recorder).finish_failure());
        }

        recorder.current_step_succeeded(format!("Received {}", fetch.status));
        ProfileCheck::Proceed
    }

    async fn fetch_loans_feed(
        &self,
        recorder: &mut TaskRecorder,
        account: &Account,
        credentials: &Credentials,
    ) -> Result<LoansFeed, TaskResult<()>> {
        let loans_uri = account.provider.loans_uri.clone();
        recorder.begin_new_step_at(format!("Fetching loans feed {loans_uri}."), self.now());

        let request = HttpRequest::get(loans_uri.clone()).with_basic_auth(
            credentials.user_name.clone(),
            credentials.password.clone(),
        );
        let fetch = match self.http.fetch(request).await {
            Ok(fetch) => fetch,
            Err(error) => {
                recorder.current_step_failed(
                    "Connecting to the loans feed failed.",
                    BorrowErrorCode::HttpConnectionFailed.as_str(),
                    Some(Arc::new(anyhow::Error::new(error))),
                );
                return Err(std::mem::take(recorder).finish_failure());
            }
        };
        if !fetch.is_success() {
            recorder.current_step_failed(
                format!("The server rejected the request: HTTP {}", fetch.status),
                BorrowErrorCode::HttpRequestFailed.as_str(),
                Some(Arc::new(anyhow::Error::new(std::io::Error::other(format!(
                    "HTTP {} fetching loans feed",
                    fetch.status
                ))))),
            );
            return Err(std::mem::take(recorder).finish_failure());
        }
        let bytes = match fetch.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => {
                recorder.current_step_failed(
                    "Reading the loans feed failed.",
                    BorrowErrorCode::HttpConnectionFailed.as_str(),
                    Some(Arc::new(anyhow::Error::new(error))),
                );
                return Err(std::mem::take(recorder).finish_failure());
            }
        };
        recorder.current_step_succeeded(format!("Received {} bytes", bytes.len()));

        recorder.begin_new_step_at("Parsing the loans feed.", self.now());
        match parse_loans_feed(&loans_uri, &bytes) {
            ParseResult::Success { document, warnings } => {
                for warning in &warnings {
                    warn!(source = %warning.source, message = %warning.message, "feed warning");
                }
                recorder.current_step_succeeded(format!(
                    "Parsed {} entries ({} warnings)",
                    document.entries.len(),
                    warnings.len()
                ));
                Ok(document)
            }
            ParseResult::Failure { errors, .. } => {
                let message = errors
                    .first()
                    .map_or_else(|| "feed failed to parse".to_string(), |e| e.message.clone());
                let cause = errors
                    .into_iter()
                    .next()
                    .map(|error| Arc::new(anyhow::Error::new(error)));
                recorder.current_step_failed(message, CODE_FEED_PARSE_FAILED, cause);
                Err(std::mem::take(recorder).finish_failure())
            }
        }
    }

    async fn reconcile(
        &self,
        account_id: &AccountId,
        feed: &LoansFeed,
    ) -> Result<(usize, usize), DatabaseError> {
        let mut seen = std::collections::BTreeSet::new();
        for entry in &feed.entries {
            let db_entry = self
                .database
                .create_or_update_entry(account_id, entry, &self.supported_formats)
                .await?;
            let book = db_entry.book().await?;
            seen.insert(book.id.clone());
            self.registry.update(BookWithStatus::derived(book));
        }

        let mut removed = 0;
        for book_id in self.database.book_ids(account_id).await? {
            if !seen.contains(&book_id) {
                self.database.delete_entry(account_id, &book_id).await?;
                self.registry.remove(&book_id);
                removed += 1;
            }
        }
        Ok((seen.len(), removed))
    }

    /// Borrows a book: publishes `Requesting`, resolves the first usable
    /// acquisition path, and runs the pipeline under the download limit.
    ///
    /// The returned outcome is terminal for this attempt; a cancelled
    /// attempt reports [`BorrowOutcome::Cancelled`] and records no error
    /// code.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::BorrowInProgress`] if an attempt for
    /// the book is already running, [`ControllerError::Registry`] if the
    /// book is unknown, or [`ControllerError::Database`] if its entry
    /// cannot be prepared.
    #[instrument(skip(self))]
    pub async fn borrow(
        &self,
        account_id: &AccountId,
        book_id: &BookID,
    ) -> Result<BorrowOutcome, ControllerError> {
        let account = self.account(account_id)?;
        let with_status = self.registry.book_or_err(book_id)?;
        let book = with_status.book;

        let cancelled = Arc::new(AtomicBool::new(false));
        {
            use dashmap::mapref::entry::Entry;
            match self.active_borrows.entry(book_id.clone()) {
                Entry::Occupied(_) => {
                    return Err(ControllerError::BorrowInProgress(book_id.clone()));
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::clone(&cancelled));
                }
            }
        }

        let outcome = self.borrow_inner(account, book, Arc::clone(&cancelled)).await;
        self.active_borrows.remove(book_id);
        outcome
    }

    async fn borrow_inner(
        &self,
        account: Arc<Account>,
        book: Book,
        cancelled: Arc<AtomicBool>,
    ) -> Result<BorrowOutcome, ControllerError> {
        self.registry
            .update(BookWithStatus::new(book.clone(), BookStatus::Requesting));

        let paths = acquisition_paths(&book.entry, &self.supported_formats);
        let Some(path) = paths.into_iter().next() else {
            info!(book = %book.id, "no usable acquisition path");
            let mut recorder = TaskRecorder::new();
            recorder.begin_new_step_at("Resolving an acquisition path.", self.now());
            recorder.current_step_failed(
                "The entry offers no acquisition path ending in a supported format.",
                BorrowErrorCode::UnsupportedAcquisition.as_str(),
                None,
            );
            self.registry.update(BookWithStatus::new(
                book,
                BookStatus::FailedDownload {
                    error_code: BorrowErrorCode::UnsupportedAcquisition,
                },
            ));
            return Ok(BorrowOutcome::Completed(recorder.finish_failure()));
        };

        let db_entry = self
            .database
            .create_or_update_entry(&account.id, &book.entry, &self.supported_formats)
            .await?;

        let _permit = self
            .downloads
            .acquire()
            .await
            .map_err(|_| ControllerError::Shutdown)?;

        if cancelled.load(Ordering::SeqCst) {
            return Ok(BorrowOutcome::Cancelled);
        }

        let context = BorrowContext::new(
            account,
            Arc::clone(&self.registry),
            self.http.clone(),
            Arc::clone(&self.clock),
            self.temp_dir.clone(),
            cancelled,
            db_entry,
            book,
            path,
        );

        Ok(BorrowTask::run(context, &self.subtasks).await)
    }

    /// Requests cancellation of a running borrow attempt. Has no effect
    /// when no attempt is running for the book.
    pub fn cancel_borrow(&self, book_id: &BookID) {
        if let Some(flag) = self.active_borrows.get(book_id) {
            info!(book = %book_id, "cancelling borrow attempt");
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Dismisses a failure status, returning the book to the status
    /// derived from its own data.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Registry`] if the book is unknown, or
    /// [`ControllerError::NotFailed`] if its status is not a failure.
    pub fn dismiss_borrow_failure(&self, book_id: &BookID) -> Result<(), ControllerError> {
        let with_status = self.registry.book_or_err(book_id)?;
        if !with_status.status.is_failure() {
            return Err(ControllerError::NotFailed(book_id.clone()));
        }
        debug!(book = %book_id, "dismissing borrow failure");
        self.registry
            .update(BookWithStatus::derived(with_status.book));
        Ok(())
    }
}

/// Control flow after the patron profile check.
enum ProfileCheck {
    Proceed,
    Stop(TaskResult<()>),
}
