//! Subtask abstraction and capability-based dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::context::BorrowContext;
use super::direct_download::DirectDownloadSubtask;
use super::error::BorrowErrorCode;
use crate::opds::AcquisitionPath;

/// Terminal outcome of a subtask that did not complete normally.
#[derive(Debug, Clone, Error)]
pub enum BorrowSubtaskError {
    /// The subtask failed. The error code has already been recorded in
    /// the task recorder and published to the registry by the time this
    /// value is returned.
    #[error("borrow subtask failed: {code}")]
    Failed {
        /// The stable failure classification.
        code: BorrowErrorCode,
        /// The underlying cause, preserved for downcasting.
        cause: Option<Arc<anyhow::Error>>,
    },

    /// The attempt was cancelled. Cancellation is not a failure: no
    /// error code is recorded and the registry is left as-is.
    #[error("borrow subtask cancelled")]
    Cancelled,
}

impl BorrowSubtaskError {
    /// A failure with no underlying cause.
    #[must_use]
    pub fn failed(code: BorrowErrorCode) -> Self {
        Self::Failed { code, cause: None }
    }

    /// A failure preserving its underlying cause.
    #[must_use]
    pub fn failed_with_cause(code: BorrowErrorCode, cause: anyhow::Error) -> Self {
        Self::Failed {
            code,
            cause: Some(Arc::new(cause)),
        }
    }
}

/// One strategy of the borrow pipeline: consumes an entire acquisition
/// path end to end.
///
/// Indirection hops inside the path (such as bearer-token envelopes) are
/// resolved by the HTTP interceptor chain during the fetch, so a subtask
/// matches on where the path *settles* rather than on its first hop.
/// Implementations record their progress into the context's task
/// recorder and publish status transitions through the context's
/// registry helpers.
#[async_trait]
pub trait BorrowSubtask: Send + Sync {
    /// The subtask's name for logging and step descriptions.
    fn name(&self) -> &'static str;

    /// Returns true if this subtask can consume the given path.
    fn is_applicable_to(&self, path: &AcquisitionPath) -> bool;

    /// Consumes the context's acquisition path.
    ///
    /// # Errors
    ///
    /// Returns [`BorrowSubtaskError::Failed`] when the path cannot be
    /// handled, or [`BorrowSubtaskError::Cancelled`] when the attempt's
    /// cancellation flag is observed.
    async fn execute(&self, context: &mut BorrowContext) -> Result<(), BorrowSubtaskError>;
}

/// Registry of available subtasks, consulted per acquisition path.
///
/// Dispatch is first-match in registration order, so more specific
/// subtasks must be registered before general ones.
pub struct BorrowSubtaskDirectory {
    subtasks: Vec<Arc<dyn BorrowSubtask>>,
}

impl std::fmt::Debug for BorrowSubtaskDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.subtasks.iter().map(|s| s.name()).collect();
        f.debug_struct("BorrowSubtaskDirectory")
            .field("subtasks", &names)
            .finish()
    }
}

impl Default for BorrowSubtaskDirectory {
    fn default() -> Self {
        let mut directory = Self::empty();
        directory.register(Arc::new(DirectDownloadSubtask::default()));
        directory
    }
}

impl BorrowSubtaskDirectory {
    /// Creates a directory with no subtasks registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            subtasks: Vec::new(),
        }
    }

    /// Registers a subtask at the end of the dispatch order.
    pub fn register(&mut self, subtask: Arc<dyn BorrowSubtask>) {
        debug!(subtask = subtask.name(), "registering borrow subtask");
        self.subtasks.push(subtask);
    }

    /// Finds the first subtask applicable to the given path.
    #[must_use]
    pub fn subtask_for(&self, path: &AcquisitionPath) -> Option<Arc<dyn BorrowSubtask>> {
        self.subtasks
            .iter()
            .find(|subtask| subtask.is_applicable_to(path))
            .map(Arc::clone)
    }
}
