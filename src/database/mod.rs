//! SQLite-backed book database.
//!
//! The database is the durable backing store behind the in-memory book
//! registry: entries keyed by `(account, book)`, with one format row per
//! storable content type holding the downloaded bytes. Registry state is
//! always derivable by replaying [`BookDatabase::books`] at process
//! start.
//!
//! The acquisition pipeline requires at most one successful format write
//! per borrow attempt and zero writes on failure; downloads land in a
//! temporary file first and are handed to [`FormatHandle::copy_in_bytes`]
//! only once complete.
//!
//! # Example
//!
//! ```no_run
//! use circulation_core::database::BookDatabase;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = BookDatabase::open(Path::new("books.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::accounts::AccountId;
use crate::book::{Book, BookFormat, BookID};
use crate::opds::{ContentKind, FeedEntry, acquisition_paths};

/// Maximum connections in the pool. Kept low for SQLite since it uses
/// file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Book database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A query or connection failed.
    #[error("book database query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// The requested entry does not exist.
    #[error("no such book database entry: {book_id}")]
    NoSuchEntry {
        /// The missing entry's book identifier.
        book_id: BookID,
    },

    /// A stored entry document failed to deserialize.
    #[error("corrupt entry document for {book_id}: {source}")]
    CorruptEntry {
        /// The affected book identifier.
        book_id: BookID,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// Reading a source file for a format write failed.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// The path that failed to read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Connection pool wrapper over the book database schema.
#[derive(Debug, Clone)]
pub struct BookDatabase {
    pool: SqlitePool,
}

impl BookDatabase {
    /// Opens (creating if necessary) a book database at the given path,
    /// enabling WAL mode for concurrent reads.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] if the connection or schema
    /// creation fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] if the connection or schema
    /// creation fails.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), DatabaseError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS book_entries (
                 account_id TEXT NOT NULL,
                 book_id    TEXT NOT NULL,
                 entry_json TEXT NOT NULL,
                 PRIMARY KEY (account_id, book_id)
             )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS book_formats (
                 account_id   TEXT NOT NULL,
                 book_id      TEXT NOT NULL,
                 content_type TEXT NOT NULL,
                 data         BLOB,
                 PRIMARY KEY (account_id, book_id, content_type)
             )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Creates a database entry for a feed entry, or replaces the stored
    /// entry document if one exists. Format rows are created for every
    /// supported final content type the entry's acquisition paths can
    /// produce; existing rows (and their content) are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure, or
    /// [`DatabaseError::CorruptEntry`] if the entry cannot be serialized.
    pub async fn create_or_update_entry(
        &self,
        account: &AccountId,
        entry: &FeedEntry,
        supported_formats: &[ContentKind],
    ) -> Result<BookDatabaseEntry, DatabaseError> {
        let book_id = BookID::from_canonical_id(&entry.id);
        let entry_json =
            serde_json::to_string(entry).map_err(|source| DatabaseError::CorruptEntry {
                book_id: book_id.clone(),
                source,
            })?;

        debug!(account = %account, book = %book_id, "create or update entry");

        sqlx::query(
            "INSERT INTO book_entries (account_id, book_id, entry_json)
             VALUES (?, ?, ?)
             ON CONFLICT (account_id, book_id) DO UPDATE SET entry_json = excluded.entry_json",
        )
        .bind(account.as_str())
        .bind(book_id.as_str())
        .bind(&entry_json)
        .execute(&self.pool)
        .await?;

        for path in acquisition_paths(entry, supported_formats) {
            let kind = &path.final_element().content_type;
            sqlx::query(
                "INSERT OR IGNORE INTO book_formats (account_id, book_id, content_type, data)
                 VALUES (?, ?, ?, NULL)",
            )
            .bind(account.as_str())
            .bind(book_id.as_str())
            .bind(kind.full_type())
            .execute(&self.pool)
            .await?;
        }

        Ok(BookDatabaseEntry {
            pool: self.pool.clone(),
            account: account.clone(),
            book_id,
        })
    }

    /// Opens an existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::NoSuchEntry`] if no entry exists for the
    /// book, or [`DatabaseError::Query`] on storage failure.
    pub async fn open_existing_entry(
        &self,
        account: &AccountId,
        book_id: &BookID,
    ) -> Result<BookDatabaseEntry, DatabaseError> {
        let row = sqlx::query(
            "SELECT book_id FROM book_entries WHERE account_id = ? AND book_id = ?",
        )
        .bind(account.as_str())
        .bind(book_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            return Err(DatabaseError::NoSuchEntry {
                book_id: book_id.clone(),
            });
        }

        Ok(BookDatabaseEntry {
            pool: self.pool.clone(),
            account: account.clone(),
            book_id: book_id.clone(),
        })
    }

    /// Returns the book identifiers stored for an account.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure.
    pub async fn book_ids(&self, account: &AccountId) -> Result<Vec<BookID>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT book_id FROM book_entries WHERE account_id = ? ORDER BY book_id",
        )
        .bind(account.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| BookID::from_raw(row.get::<String, _>("book_id")))
            .collect())
    }

    /// Replays all stored books for an account, for registry rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure or
    /// [`DatabaseError::CorruptEntry`] if a stored document fails to
    /// deserialize.
    pub async fn books(&self, account: &AccountId) -> Result<Vec<Book>, DatabaseError> {
        let mut books = Vec::new();
        for book_id in self.book_ids(account).await? {
            let entry = BookDatabaseEntry {
                pool: self.pool.clone(),
                account: account.clone(),
                book_id,
            };
            books.push(entry.book().await?);
        }
        Ok(books)
    }

    /// Deletes an entry and all of its downloaded content.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure.
    pub async fn delete_entry(
        &self,
        account: &AccountId,
        book_id: &BookID,
    ) -> Result<(), DatabaseError> {
        debug!(account = %account, book = %book_id, "deleting entry");
        sqlx::query("DELETE FROM book_formats WHERE account_id = ? AND book_id = ?")
            .bind(account.as_str())
            .bind(book_id.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM book_entries WHERE account_id = ? AND book_id = ?")
            .bind(account.as_str())
            .bind(book_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// One book's entry within the database: the stored feed entry document
/// plus its format rows.
#[derive(Debug, Clone)]
pub struct BookDatabaseEntry {
    pool: SqlitePool,
    account: AccountId,
    book_id: BookID,
}

impl BookDatabaseEntry {
    /// The entry's book identifier.
    #[must_use]
    pub fn book_id(&self) -> &BookID {
        &self.book_id
    }

    /// Loads the current book snapshot: stored entry plus formats.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::NoSuchEntry`] if the entry vanished, or
    /// [`DatabaseError::CorruptEntry`] if the stored document fails to
    /// deserialize.
    pub async fn book(&self) -> Result<Book, DatabaseError> {
        let row = sqlx::query(
            "SELECT entry_json FROM book_entries WHERE account_id = ? AND book_id = ?",
        )
        .bind(self.account.as_str())
        .bind(self.book_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DatabaseError::NoSuchEntry {
            book_id: self.book_id.clone(),
        })?;

        let entry_json: String = row.get("entry_json");
        let entry: FeedEntry =
            serde_json::from_str(&entry_json).map_err(|source| DatabaseError::CorruptEntry {
                book_id: self.book_id.clone(),
                source,
            })?;

        let format_rows = sqlx::query(
            "SELECT content_type, data IS NOT NULL AS has_content
             FROM book_formats
             WHERE account_id = ? AND book_id = ?
             ORDER BY content_type",
        )
        .bind(self.account.as_str())
        .bind(self.book_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let formats = format_rows
            .iter()
            .map(|row| BookFormat {
                content_type: ContentKind::new(row.get::<String, _>("content_type")),
                has_content: row.get::<bool, _>("has_content"),
            })
            .collect();

        Ok(Book {
            id: self.book_id.clone(),
            account: self.account.clone(),
            entry,
            formats,
        })
    }

    /// Replaces the stored entry document.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure or
    /// [`DatabaseError::CorruptEntry`] if the entry cannot be
    /// serialized.
    pub async fn write_entry(&self, entry: &FeedEntry) -> Result<(), DatabaseError> {
        let entry_json =
            serde_json::to_string(entry).map_err(|source| DatabaseError::CorruptEntry {
                book_id: self.book_id.clone(),
                source,
            })?;
        sqlx::query(
            "UPDATE book_entries SET entry_json = ? WHERE account_id = ? AND book_id = ?",
        )
        .bind(&entry_json)
        .bind(self.account.as_str())
        .bind(self.book_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Finds the format handle compatible with a content kind, if the
    /// entry has one.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure.
    pub async fn find_format_handle(
        &self,
        kind: &ContentKind,
    ) -> Result<Option<FormatHandle>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT content_type FROM book_formats
             WHERE account_id = ? AND book_id = ?
             ORDER BY content_type",
        )
        .bind(self.account.as_str())
        .bind(self.book_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let stored = ContentKind::new(row.get::<String, _>("content_type"));
            if stored.is_compatible_with(kind) {
                return Ok(Some(FormatHandle {
                    pool: self.pool.clone(),
                    account: self.account.clone(),
                    book_id: self.book_id.clone(),
                    content_type: stored,
                }));
            }
        }
        Ok(None)
    }
}

/// A handle bound to one content format of one book, used to persist
/// downloaded bytes.
#[derive(Debug, Clone)]
pub struct FormatHandle {
    pool: SqlitePool,
    account: AccountId,
    book_id: BookID,
    content_type: ContentKind,
}

impl FormatHandle {
    /// The content type this handle is bound to.
    #[must_use]
    pub fn content_type(&self) -> &ContentKind {
        &self.content_type
    }

    /// Copies a completed download into the format, consuming the file at
    /// `source`. Returns the number of bytes stored.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Io`] if the source cannot be read, or
    /// [`DatabaseError::Query`] on storage failure. The source file is
    /// removed only after the bytes are stored.
    #[instrument(skip(self), fields(book = %self.book_id, kind = %self.content_type))]
    pub async fn copy_in_bytes(&self, source: &Path) -> Result<u64, DatabaseError> {
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|error| DatabaseError::Io {
                path: source.to_path_buf(),
                source: error,
            })?;
        let size = bytes.len() as u64;
        self.write(&bytes).await?;

        // Best effort: the temporary file is no longer needed.
        if let Err(error) = tokio::fs::remove_file(source).await {
            tracing::warn!(path = %source.display(), %error, "failed to remove temporary file");
        }

        debug!(bytes = size, "format content stored");
        Ok(size)
    }

    /// Writes content bytes directly into the format.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE book_formats SET data = ?
             WHERE account_id = ? AND book_id = ? AND content_type = ?",
        )
        .bind(bytes)
        .bind(self.account.as_str())
        .bind(self.book_id.as_str())
        .bind(self.content_type.full_type())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads the stored content bytes, `None` if nothing was written.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure.
    pub async fn content(&self) -> Result<Option<Vec<u8>>, DatabaseError> {
        let row = sqlx::query(
            "SELECT data FROM book_formats
             WHERE account_id = ? AND book_id = ? AND content_type = ?",
        )
        .bind(self.account.as_str())
        .bind(self.book_id.as_str())
        .bind(self.content_type.full_type())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| row.get::<Option<Vec<u8>>, _>("data")))
    }

    /// Deletes the stored content bytes, keeping the format row.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Query`] on storage failure.
    pub async fn delete_content(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE book_formats SET data = NULL
             WHERE account_id = ? AND book_id = ? AND content_type = ?",
        )
        .bind(self.account.as_str())
        .bind(self.book_id.as_str())
        .bind(self.content_type.full_type())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::opds::{AcquisitionLink, Availability};
    use url::Url;

    fn account() -> AccountId {
        AccountId::new("account-a")
    }

    fn entry(id: &str, kind: ContentKind) -> FeedEntry {
        FeedEntry {
            id: id.to_string(),
            title: "A Book".to_string(),
            availability: Availability::Loaned,
            acquisitions: vec![AcquisitionLink {
                content_type: kind,
                target: Some(Url::parse("https://example.com/book").unwrap()),
                indirect: vec![],
            }],
            cover: None,
            thumbnail: None,
        }
    }

    fn supported() -> Vec<ContentKind> {
        vec![ContentKind::epub(), ContentKind::pdf()]
    }

    #[tokio::test]
    async fn test_create_and_reload_entry() {
        let db = BookDatabase::new_in_memory().await.unwrap();
        let e = entry("urn:uuid:aaaa", ContentKind::epub());
        let handle = db
            .create_or_update_entry(&account(), &e, &supported())
            .await
            .unwrap();

        let book = handle.book().await.unwrap();
        assert_eq!(book.entry, e);
        assert_eq!(book.formats.len(), 1);
        assert!(!book.formats[0].has_content);
    }

    #[tokio::test]
    async fn test_open_existing_entry_not_found() {
        let db = BookDatabase::new_in_memory().await.unwrap();
        let missing = BookID::from_canonical_id("urn:uuid:missing");
        let result = db.open_existing_entry(&account(), &missing).await;
        assert!(matches!(result, Err(DatabaseError::NoSuchEntry { .. })));
    }

    #[tokio::test]
    async fn test_format_write_and_content_roundtrip() {
        let db = BookDatabase::new_in_memory().await.unwrap();
        let e = entry("urn:uuid:aaaa", ContentKind::pdf());
        let handle = db
            .create_or_update_entry(&account(), &e, &supported())
            .await
            .unwrap();

        let format = handle
            .find_format_handle(&ContentKind::pdf())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(format.content().await.unwrap(), None);

        format.write(b"PDF!").await.unwrap();
        assert_eq!(format.content().await.unwrap(), Some(b"PDF!".to_vec()));

        let book = handle.book().await.unwrap();
        assert!(book.is_downloaded());
    }

    #[tokio::test]
    async fn test_copy_in_bytes_consumes_temporary_file() {
        let db = BookDatabase::new_in_memory().await.unwrap();
        let e = entry("urn:uuid:aaaa", ContentKind::epub());
        let handle = db
            .create_or_update_entry(&account(), &e, &supported())
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join("book.epub.tmp");
        tokio::fs::write(&temp_path, b"EPUB!").await.unwrap();

        let format = handle
            .find_format_handle(&ContentKind::epub())
            .await
            .unwrap()
            .unwrap();
        let size = format.copy_in_bytes(&temp_path).await.unwrap();
        assert_eq!(size, 5);
        assert!(!temp_path.exists());
        assert_eq!(format.content().await.unwrap(), Some(b"EPUB!".to_vec()));
    }

    #[tokio::test]
    async fn test_find_format_handle_matches_compatible_kind() {
        let db = BookDatabase::new_in_memory().await.unwrap();
        let e = entry("urn:uuid:aaaa", ContentKind::epub());
        let handle = db
            .create_or_update_entry(&account(), &e, &supported())
            .await
            .unwrap();

        let found = handle
            .find_format_handle(&ContentKind::new("application/epub+zip; x=1"))
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = handle.find_format_handle(&ContentKind::pdf()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_delete_entry_removes_content() {
        let db = BookDatabase::new_in_memory().await.unwrap();
        let e = entry("urn:uuid:aaaa", ContentKind::epub());
        let handle = db
            .create_or_update_entry(&account(), &e, &supported())
            .await
            .unwrap();
        let book_id = handle.book_id().clone();

        db.delete_entry(&account(), &book_id).await.unwrap();
        assert!(db.book_ids(&account()).await.unwrap().is_empty());
        assert!(matches!(
            db.open_existing_entry(&account(), &book_id).await,
            Err(DatabaseError::NoSuchEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_preserves_downloaded_content() {
        let db = BookDatabase::new_in_memory().await.unwrap();
        let e = entry("urn:uuid:aaaa", ContentKind::epub());
        let handle = db
            .create_or_update_entry(&account(), &e, &supported())
            .await
            .unwrap();
        let format = handle
            .find_format_handle(&ContentKind::epub())
            .await
            .unwrap()
            .unwrap();
        format.write(b"EPUB!").await.unwrap();

        // A later sync pass rewrites the entry document.
        db.create_or_update_entry(&account(), &e, &supported())
            .await
            .unwrap();
        assert_eq!(format.content().await.unwrap(), Some(b"EPUB!".to_vec()));
    }
}
