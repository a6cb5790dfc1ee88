//! Task recorder for structured operation reporting.
//!
//! Every borrow or sync attempt owns exactly one [`TaskRecorder`]. The
//! recorder accumulates ordered, append-only [`TaskStep`]s while the
//! operation runs and renders a terminal [`TaskResult`] when it finishes.
//! Steps carry stable error codes rather than raw error text so that UI
//! and telemetry callers can match on them.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Resolution of a single recorded step.
#[derive(Debug, Clone)]
pub enum TaskStepResolution {
    /// The step has been started and has not yet resolved.
    InProgress,
    /// The step completed successfully.
    Succeeded {
        /// Completion message for diagnostic display.
        message: String,
    },
    /// The step failed.
    Failed {
        /// Failure message for diagnostic display.
        message: String,
        /// Stable error code identifying the failure.
        error_code: String,
        /// The underlying error, when one exists. Arc-wrapped so results
        /// stay cloneable; callers may downcast to recover the concrete
        /// error type.
        exception: Option<Arc<anyhow::Error>>,
    },
}

impl TaskStepResolution {
    /// Returns true if this resolution is a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// One recorded unit of work within an operation.
#[derive(Debug, Clone)]
pub struct TaskStep {
    /// Human-readable description of the step.
    pub description: String,
    /// Current resolution of the step.
    pub resolution: TaskStepResolution,
    /// Wall-clock time at which the step began.
    pub started_at: SystemTime,
}

/// Terminal view over a recorder's steps.
#[derive(Debug, Clone)]
pub enum TaskResult<T> {
    /// The operation succeeded.
    Success {
        /// The value produced by the operation.
        value: T,
        /// All recorded steps, in chronological order.
        steps: Vec<TaskStep>,
    },
    /// The operation failed. At least one step is a failed step.
    Failure {
        /// All recorded steps, in chronological order.
        steps: Vec<TaskStep>,
        /// The error code of the most recent failed step.
        last_error_code: String,
        /// The exception attached to the most recent failed step, if any.
        exception: Option<Arc<anyhow::Error>>,
    },
}

impl<T> TaskResult<T> {
    /// Returns true if the result is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns the recorded steps.
    #[must_use]
    pub fn steps(&self) -> &[TaskStep] {
        match self {
            Self::Success { steps, .. } | Self::Failure { steps, .. } => steps,
        }
    }

    /// Returns the last error code for failures, `None` for successes.
    #[must_use]
    pub fn last_error_code(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure {
                last_error_code, ..
            } => Some(last_error_code),
        }
    }

    /// Returns the preserved exception for failures, if one was recorded.
    #[must_use]
    pub fn exception(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { exception, .. } => exception.as_ref(),
        }
    }
}

impl<T> fmt::Display for TaskResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { steps, .. } => {
                write!(f, "success ({} steps)", steps.len())
            }
            Self::Failure {
                steps,
                last_error_code,
                ..
            } => {
                write!(f, "failure [{last_error_code}] ({} steps)", steps.len())
            }
        }
    }
}

/// Accumulates the ordered steps of one in-flight operation.
///
/// A recorder is owned by exactly one attempt and is never shared across
/// tasks; it is deliberately not `Clone`.
///
/// # Example
///
/// ```
/// use circulation_core::taskrec::TaskRecorder;
///
/// let mut recorder = TaskRecorder::new();
/// recorder.begin_new_step("Downloading book");
/// recorder.current_step_succeeded("Downloaded 123 bytes");
/// let result = recorder.finish_success(());
/// assert!(result.is_success());
/// ```
#[derive(Debug, Default)]
pub struct TaskRecorder {
    steps: Vec<TaskStep>,
}

impl TaskRecorder {
    /// Creates a new recorder with no steps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new step with the given description.
    ///
    /// The step starts in the `InProgress` resolution and is resolved by a
    /// later call to [`current_step_succeeded`](Self::current_step_succeeded)
    /// or [`current_step_failed`](Self::current_step_failed).
    pub fn begin_new_step(&mut self, description: impl Into<String>) {
        let description = description.into();
        tracing::debug!(step = %description, "beginning task step");
        self.steps.push(TaskStep {
            description,
            resolution: TaskStepResolution::InProgress,
            started_at: SystemTime::now(),
        });
    }

    /// Begins a new step, timestamping it with the supplied clock value.
    pub fn begin_new_step_at(&mut self, description: impl Into<String>, now: SystemTime) {
        let description = description.into();
        tracing::debug!(step = %description, "beginning task step");
        self.steps.push(TaskStep {
            description,
            resolution: TaskStepResolution::InProgress,
            started_at: now,
        });
    }

    /// Marks the current step as succeeded.
    ///
    /// A no-op if no step has been started or the current step already
    /// resolved as failed (a failed resolution is never downgraded).
    pub fn current_step_succeeded(&mut self, message: impl Into<String>) {
        if let Some(step) = self.steps.last_mut()
            && !step.resolution.is_failed()
        {
            step.resolution = TaskStepResolution::Succeeded {
                message: message.into(),
            };
        }
    }

    /// Marks the current step as failed with a stable error code.
    ///
    /// A no-op if no step has been started.
    pub fn current_step_failed(
        &mut self,
        message: impl Into<String>,
        error_code: impl Into<String>,
        exception: Option<Arc<anyhow::Error>>,
    ) {
        let message = message.into();
        let error_code = error_code.into();
        tracing::debug!(%message, %error_code, "task step failed");
        if let Some(step) = self.steps.last_mut() {
            step.resolution = TaskStepResolution::Failed {
                message,
                error_code,
                exception,
            };
        }
    }

    /// Merges all steps of another recorder into this one, preserving
    /// chronological order. Used when a subtask delegates to a
    /// sub-pipeline with its own recorder.
    pub fn append_steps(&mut self, other: TaskRecorder) {
        self.steps.extend(other.steps);
    }

    /// Returns the steps recorded so far.
    #[must_use]
    pub fn steps(&self) -> &[TaskStep] {
        &self.steps
    }

    /// Finishes the operation successfully, consuming the recorder.
    #[must_use]
    pub fn finish_success<T>(self, value: T) -> TaskResult<T> {
        TaskResult::Success {
            value,
            steps: self.steps,
        }
    }

    /// Finishes the operation as a failure, consuming the recorder.
    ///
    /// # Panics
    ///
    /// Panics if no step has failed. Callers are required to fail a step
    /// before finishing as failure; violating this is a programming error,
    /// not a recoverable condition.
    #[must_use]
    pub fn finish_failure<T>(self) -> TaskResult<T> {
        let last_failed = self
            .steps
            .iter()
            .rev()
            .find_map(|step| match &step.resolution {
                TaskStepResolution::Failed {
                    error_code,
                    exception,
                    ..
                } => Some((error_code.clone(), exception.clone())),
                _ => None,
            });

        let Some((last_error_code, exception)) = last_failed else {
            panic!("finish_failure called with no failed step recorded");
        };

        TaskResult::Failure {
            steps: self.steps,
            last_error_code,
            exception,
        }
    }
}
