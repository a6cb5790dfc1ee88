//! Concurrent book registry with status-change broadcasting.
//!
//! The registry is the authoritative in-memory projection of book state.
//! It owns the `BookID -> (Book, BookStatus)` map; the sync controller
//! and borrow pipeline submit updates through [`BookRegistry::update`]
//! and never mutate status directly. Every update publishes exactly one
//! event, even when the stored status is unchanged: notification is
//! idempotent, not deduplicated, and consumers must tolerate
//! duplicate-looking events.
//!
//! Internally the map is a [`dashmap::DashMap`]: updates for different
//! books land on independent shard locks and do not block each other,
//! while updates for a single book are serialized, which keeps event
//! order consistent with update order for that book. Events go out over
//! a replay-free `tokio::sync::broadcast` channel.

use std::collections::BTreeMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::book::{Book, BookID, BookStatus};

/// Buffer size for the status event channel. Slow subscribers that fall
/// further behind than this observe a `Lagged` error rather than
/// blocking publishers.
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// A book paired with its current status.
#[derive(Debug, Clone)]
pub struct BookWithStatus {
    /// The book snapshot.
    pub book: Book,
    /// The current status.
    pub status: BookStatus,
}

impl BookWithStatus {
    /// Pairs a book with an explicit status.
    #[must_use]
    pub fn new(book: Book, status: BookStatus) -> Self {
        Self { book, status }
    }

    /// Pairs a book with the status derived from its own data.
    #[must_use]
    pub fn derived(book: Book) -> Self {
        let status = BookStatus::from_book(&book);
        Self { book, status }
    }
}

/// Kind of a status-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookStatusEventKind {
    /// The book was not previously present in the registry.
    Added,
    /// The book's stored value was replaced.
    Changed,
    /// The book was removed from the registry.
    Removed,
}

/// A status-change event published by the registry.
#[derive(Debug, Clone)]
pub struct BookStatusEvent {
    /// The book the event concerns.
    pub book_id: BookID,
    /// What happened.
    pub kind: BookStatusEventKind,
    /// The status after the event; `None` for removals.
    pub status_now: Option<BookStatus>,
}

/// Errors raised by registry lookups.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested book is not present.
    #[error("no such book in registry: {id}")]
    NoSuchBook {
        /// The missing book's identifier.
        id: BookID,
    },
}

/// Concurrent map of book identity to current status, broadcasting
/// status-change events to subscribers.
///
/// The registry holds no reference to the durable book database; it is a
/// volatile projection rebuilt at process start by replaying the
/// database's persisted entries through [`update`](Self::update).
#[derive(Debug)]
pub struct BookRegistry {
    books: DashMap<BookID, BookWithStatus>,
    events: broadcast::Sender<BookStatusEvent>,
}

impl Default for BookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            books: DashMap::new(),
            events,
        }
    }

    /// Replaces the stored book/status pair and publishes exactly one
    /// event: `Added` when the book was previously unknown, `Changed`
    /// otherwise. Publishing happens while the book's shard entry is
    /// held, so event order for a single book matches update order.
    pub fn update(&self, update: BookWithStatus) {
        let id = update.book.id.clone();
        let status_now = update.status.clone();
        debug!(book = %id, status = %status_now, "registry update");
        match self.books.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(update);
                self.publish(id, BookStatusEventKind::Changed, Some(status_now));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(update);
                self.publish(id, BookStatusEventKind::Added, Some(status_now));
            }
        }
    }

    /// Removes a book, publishing a `Removed` event if it was present.
    pub fn remove(&self, id: &BookID) {
        if self.books.remove(id).is_some() {
            debug!(book = %id, "registry remove");
            self.publish(id.clone(), BookStatusEventKind::Removed, None);
        }
    }

    /// Returns the current status of a book, if present.
    #[must_use]
    pub fn book_status(&self, id: &BookID) -> Option<BookStatus> {
        self.books.get(id).map(|entry| entry.status.clone())
    }

    /// Returns the book/status pair, failing if the book is absent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoSuchBook`] if the book is not present.
    pub fn book_or_err(&self, id: &BookID) -> Result<BookWithStatus, RegistryError> {
        self.books
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| RegistryError::NoSuchBook { id: id.clone() })
    }

    /// Returns an ordered snapshot of all books.
    #[must_use]
    pub fn books(&self) -> BTreeMap<BookID, BookWithStatus> {
        self.books
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Returns the number of books currently held.
    #[must_use]
    pub fn count(&self) -> usize {
        self.books.len()
    }

    /// Subscribes to status-change events. The stream is multicast and
    /// replay-free: only events published after subscription are seen.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BookStatusEvent> {
        self.events.subscribe()
    }

    fn publish(&self, book_id: BookID, kind: BookStatusEventKind, status_now: Option<BookStatus>) {
        // Send fails only when no subscriber exists, which is fine.
        let _ = self.events.send(BookStatusEvent {
            book_id,
            kind,
            status_now,
        });
    }
}
