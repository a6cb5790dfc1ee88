//! The borrow pipeline.
//!
//! A borrow attempt hands its acquisition path to the first applicable
//! subtask from the directory; indirection hops inside the path are
//! resolved by the HTTP interceptor chain during the subtask's fetch.
//! Subtasks record their progress into a task recorder and publish
//! status transitions to the book registry; the pipeline itself only
//! dispatches and classifies paths nothing can handle.

mod context;
mod direct_download;
mod error;
mod subtask;

pub use context::{BorrowContext, Clock};
pub use direct_download::DirectDownloadSubtask;
pub use error::BorrowErrorCode;
pub use subtask::{BorrowSubtask, BorrowSubtaskDirectory, BorrowSubtaskError};

use tracing::{info, instrument};

use crate::taskrec::TaskResult;

/// Outcome of one borrow attempt.
#[derive(Debug)]
pub enum BorrowOutcome {
    /// The pipeline ran to a terminal result, success or failure.
    Completed(TaskResult<()>),
    /// The attempt was cancelled before reaching a terminal result.
    /// No error code is recorded for cancellation.
    Cancelled,
}

impl BorrowOutcome {
    /// Returns true if the attempt completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(result) if result.is_success())
    }
}

/// Drives a single borrow attempt over an acquisition path.
#[derive(Debug)]
pub struct BorrowTask;

impl BorrowTask {
    /// Runs the pipeline to completion.
    ///
    /// The context's acquisition path is dispatched to the first
    /// applicable subtask; a path no subtask can consume terminates the
    /// attempt with `unsupportedAcquisition`, and a subtask failure
    /// terminates it with whatever code the subtask recorded. The
    /// cancellation flag is checked at the start and inside subtasks.
    #[instrument(skip_all, fields(book = %context.book_id()))]
    pub async fn run(
        mut context: BorrowContext,
        directory: &BorrowSubtaskDirectory,
    ) -> BorrowOutcome {
        if context.is_cancelled() {
            info!("borrow attempt cancelled");
            return BorrowOutcome::Cancelled;
        }

        let settled = context.expected_type().clone();
        context.begin_step(format!("Handling acquisition path settling on {settled}"));

        let Some(subtask) = directory.subtask_for(context.path()) else {
            context.recorder_mut().current_step_failed(
                format!("No subtask can handle a path settling on {settled}"),
                BorrowErrorCode::UnsupportedAcquisition.as_str(),
                None,
            );
            context.book_download_failed(BorrowErrorCode::UnsupportedAcquisition);
            return BorrowOutcome::Completed(context.into_recorder().finish_failure());
        };
        context
            .recorder_mut()
            .current_step_succeeded(format!("Selected subtask {}", subtask.name()));

        match subtask.execute(&mut context).await {
            Ok(()) => {
                info!("borrow attempt succeeded");
                BorrowOutcome::Completed(context.into_recorder().finish_success(()))
            }
            Err(BorrowSubtaskError::Failed { code, .. }) => {
                info!(error_code = %code, "borrow attempt failed");
                BorrowOutcome::Completed(context.into_recorder().finish_failure())
            }
            Err(BorrowSubtaskError::Cancelled) => {
                info!("borrow attempt cancelled");
                BorrowOutcome::Cancelled
            }
        }
    }
}
