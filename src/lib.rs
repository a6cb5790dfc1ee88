//! Circulation Core Library
//!
//! This library implements the book acquisition engine for a library
//! lending client: synchronizing an account's loans feed, borrowing
//! books over HTTP (including bearer-token indirections), and tracking
//! book status through a concurrent registry backed by a SQLite book
//! database.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`accounts`] - Account identity, provider description, login state
//! - [`book`] - Book model, identity hashing, derived status
//! - [`borrow`] - The borrow pipeline: subtasks, dispatch, direct download
//! - [`controller`] - The public surface: sync, borrow, cancel, dismiss
//! - [`database`] - SQLite-backed durable book storage
//! - [`http`] - HTTP client with response-interceptor chain
//! - [`opds`] - Feed model, parsing, acquisition path resolution
//! - [`registry`] - Concurrent status registry with event broadcasting
//! - [`taskrec`] - Step-by-step task recording for borrow attempts

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod accounts;
pub mod book;
pub mod borrow;
pub mod controller;
pub mod database;
pub mod http;
pub mod opds;
pub mod registry;
pub mod taskrec;

// Re-export commonly used types
pub use accounts::{Account, AccountId, AccountProvider, AuthenticationSupport, Credentials};
pub use book::{Book, BookFormat, BookID, BookStatus, LoanedStatus};
pub use borrow::{
    BorrowErrorCode, BorrowOutcome, BorrowSubtask, BorrowSubtaskDirectory, BorrowSubtaskError,
};
pub use controller::{BooksController, ControllerConfiguration, ControllerError};
pub use database::{BookDatabase, BookDatabaseEntry, DatabaseError, FormatHandle};
pub use http::{HttpClient, HttpError, HttpFetch, HttpInterceptor, HttpRequest};
pub use opds::{
    AcquisitionPath, Availability, ContentKind, FeedEntry, LoansFeed, ParseResult,
    parse_loans_feed,
};
pub use registry::{BookRegistry, BookStatusEvent, BookStatusEventKind, BookWithStatus};
pub use taskrec::{TaskRecorder, TaskResult, TaskStep, TaskStepResolution};
