//! Shared fixtures for integration tests: accounts, feed entries, and a
//! fully wired controller over an in-memory book database.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use circulation_core::accounts::{
    Account, AccountId, AccountProvider, AuthenticationSupport, Credentials, LoginState,
};
use circulation_core::book::{Book, BookID, BookStatus};
use circulation_core::borrow::BorrowSubtaskDirectory;
use circulation_core::controller::{BooksController, ControllerConfiguration};
use circulation_core::database::BookDatabase;
use circulation_core::http::HttpClient;
use circulation_core::opds::{AcquisitionLink, Availability, ContentKind, FeedEntry, IndirectAcquisition};
use circulation_core::registry::{BookRegistry, BookStatusEvent, BookWithStatus};
use tempfile::TempDir;
use tokio::sync::broadcast;
use url::Url;

pub const TEST_USER: &str = "abcd";
pub const TEST_PASSWORD: &str = "1234";

static TRACING: Once = Once::new();

/// Installs a tracing subscriber honoring `RUST_LOG`, once per process.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A controller wired over an in-memory database, with handles to the
/// collaborators tests assert against.
pub struct Harness {
    pub controller: Arc<BooksController>,
    pub registry: Arc<BookRegistry>,
    pub database: BookDatabase,
    pub temp_dir: TempDir,
}

/// Creates a controller over a fresh in-memory database.
///
/// # Panics
///
/// Panics if the in-memory database cannot be created.
pub async fn harness() -> Harness {
    init_tracing();
    let temp_dir = TempDir::new().expect("create temp dir");
    let database = BookDatabase::new_in_memory().await.expect("create database");
    let registry = Arc::new(BookRegistry::new());
    let configuration = ControllerConfiguration::new(temp_dir.path().to_path_buf());
    let controller = Arc::new(BooksController::new(
        &configuration,
        database.clone(),
        Arc::clone(&registry),
        HttpClient::new(),
        Arc::new(BorrowSubtaskDirectory::default()),
    ));
    Harness {
        controller,
        registry,
        database,
        temp_dir,
    }
}

/// An account with basic authentication and stored credentials.
pub fn account_logged_in(loans_uri: &str) -> Arc<Account> {
    Arc::new(Account::new(
        AccountId::new("test-account"),
        provider(loans_uri, AuthenticationSupport::Basic),
        LoginState::LoggedIn(Credentials {
            user_name: TEST_USER.to_string(),
            password: TEST_PASSWORD.to_string(),
        }),
    ))
}

/// An account with basic authentication but no stored credentials.
pub fn account_logged_out(loans_uri: &str) -> Arc<Account> {
    Arc::new(Account::new(
        AccountId::new("test-account"),
        provider(loans_uri, AuthenticationSupport::Basic),
        LoginState::NotLoggedIn,
    ))
}

/// An account whose provider declares no authentication.
pub fn account_anonymous(loans_uri: &str) -> Arc<Account> {
    Arc::new(Account::new(
        AccountId::new("test-account"),
        provider(loans_uri, AuthenticationSupport::Anonymous),
        LoginState::NotLoggedIn,
    ))
}

fn provider(loans_uri: &str, authentication: AuthenticationSupport) -> AccountProvider {
    let loans_uri = Url::parse(loans_uri).expect("parse loans URI");
    // The patron profile lives on the same host as the loans feed.
    let mut patron_profile_uri = loans_uri.clone();
    patron_profile_uri.set_path("/patron");
    AccountProvider {
        loans_uri,
        patron_profile_uri,
        authentication,
    }
}

/// A loaned feed entry with the given acquisition links.
pub fn loaned_entry(id: &str, acquisitions: Vec<AcquisitionLink>) -> FeedEntry {
    FeedEntry {
        id: id.to_string(),
        title: format!("Title for {id}"),
        availability: Availability::Loaned,
        acquisitions,
        cover: None,
        thumbnail: None,
    }
}

/// A direct acquisition link for the given content type.
pub fn acquisition(content_type: ContentKind, target: Option<&str>) -> AcquisitionLink {
    AcquisitionLink {
        content_type,
        target: target.map(|t| Url::parse(t).expect("parse acquisition target")),
        indirect: Vec::new(),
    }
}

/// An acquisition link carrying one level of indirection.
pub fn indirect_acquisition(
    content_type: ContentKind,
    target: &str,
    indirect_type: ContentKind,
) -> AcquisitionLink {
    AcquisitionLink {
        content_type,
        target: Some(Url::parse(target).expect("parse acquisition target")),
        indirect: vec![IndirectAcquisition {
            content_type: indirect_type,
            indirect: Vec::new(),
        }],
    }
}

/// Seeds a book into the registry so the controller can borrow it.
pub fn seed_book(registry: &BookRegistry, account: &Account, entry: &FeedEntry) -> BookID {
    let book = Book {
        id: BookID::from_canonical_id(&entry.id),
        account: account.id.clone(),
        entry: entry.clone(),
        formats: Vec::new(),
    };
    let id = book.id.clone();
    registry.update(BookWithStatus::derived(book));
    id
}

/// Drains buffered registry events for one book, returning the status
/// carried by each.
pub fn drain_statuses(
    events: &mut broadcast::Receiver<BookStatusEvent>,
    book_id: &BookID,
) -> Vec<BookStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.book_id == *book_id
            && let Some(status) = event.status_now
        {
            statuses.push(status);
        }
    }
    statuses
}

/// Drains all buffered registry events.
pub fn drain_events(events: &mut broadcast::Receiver<BookStatusEvent>) -> Vec<BookStatusEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}
