//! Scheduler error types
//!
//! One enum covers both misuse of the scheduler (`InvalidState`,
//! `ReentrantRun`, `Stalled`) and the failing outcomes a task can end with
//! (`Cancelled`, `TaskFailure`). Task outcomes are stored and handed to
//! callbacks by reference, so the type is `Clone` and carries no sources.

use super::task::{TaskId, TaskState};
use thiserror::Error;

/// Scheduler result type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the scheduler and by task execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation attempted on a task in an incompatible state.
    ///
    /// `state` is `None` when the task is unknown to the registry, either
    /// because the id was never issued or because it already finished and
    /// was released.
    #[error("cannot {op} {task}: {}", describe_state(.state))]
    InvalidState {
        task: TaskId,
        op: &'static str,
        state: Option<TaskState>,
    },

    /// `run`, `drive` or `tick` was called while the loop is already driving.
    #[error("event loop is already running")]
    ReentrantRun,

    /// Terminal outcome of a cancelled task.
    #[error("{0} was cancelled")]
    Cancelled(TaskId),

    /// The task body returned an error or panicked.
    #[error("{task} failed: {reason}")]
    TaskFailure { task: TaskId, reason: String },

    /// Live tasks remain but nothing is runnable and no timer is pending.
    #[error("event loop stalled with {pending} task(s) that can never be woken")]
    Stalled { pending: usize },
}

impl Error {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::InvalidState { .. } => "invalid_state",
            Error::ReentrantRun => "reentrant_run",
            Error::Cancelled(_) => "cancelled",
            Error::TaskFailure { .. } => "task_failure",
            Error::Stalled { .. } => "stalled",
        }
    }

    /// True for the outcome of a cancelled task.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub(crate) fn invalid_state(task: TaskId, op: &'static str, state: Option<TaskState>) -> Self {
        Error::InvalidState { task, op, state }
    }
}

fn describe_state(state: &Option<TaskState>) -> String {
    match state {
        Some(state) => format!("task is {}", state),
        None => "task is not registered".to_string(),
    }
}

/// Error returned when a [`Timeout`](super::executor::Timeout) expires
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation timed out")]
pub struct TimeoutError;
