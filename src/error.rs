//! Error taxonomy for the workflow core (spec §7).
//!
//! Each subsystem owns a narrow error enum; [`CoreError`] aggregates them at
//! the boundaries the Coordinator operates across. Classification helpers
//! (`is_fatal_to_task`, `is_recoverable`) let callers decide propagation
//! without matching on variants directly.

use thiserror::Error;
use uuid::Uuid;

use crate::model::{StepId, StepState, TaskId, TaskState};

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// A state machine transition that the fixed table does not permit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid transition for {entity_kind} {entity_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub entity_kind: &'static str,
    pub entity_id: Uuid,
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub fn task(task_id: TaskId, from: TaskState, to: TaskState) -> Self {
        Self {
            entity_kind: "task",
            entity_id: task_id.0,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn step(step_id: StepId, from: StepState, to: StepState) -> Self {
        Self {
            entity_kind: "step",
            entity_id: step_id.0,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// The step dependency graph is not a DAG, or references a step that does
/// not exist within the task (spec §4.2 edge cases).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphCorrupted {
    #[error("cycle detected in step graph for task {task_id}, involving step {step_id}")]
    Cycle { task_id: TaskId, step_id: StepId },

    #[error("step {step_id} in task {task_id} references unknown parent {parent_id}")]
    DanglingParent {
        task_id: TaskId,
        step_id: StepId,
        parent_id: StepId,
    },

    #[error("handler name '{name}' is not registered for step {step_id}")]
    UnknownHandler { step_id: StepId, name: String },
}

/// A backoff computation could not be honored as given; the policy clamps
/// or falls back rather than propagating this to the caller (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidBackoff {
    #[error("server-directed backoff of {seconds}s is negative")]
    NegativeDelta { seconds: i64 },

    #[error("server-directed backoff header '{raw}' could not be parsed")]
    UnparseableHint { raw: String },
}

/// Failure from the abstract Store port (spec §6.1, §7).
#[derive(Debug, Error)]
#[error("store operation '{operation}' failed: {reason}")]
pub struct StoreFailure {
    pub operation: &'static str,
    pub reason: String,
}

impl StoreFailure {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

/// Categorical errors a [`crate::ports::StepHandler`] may raise (spec §4.4.3).
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    /// The step should be retried if attempts remain and `retryable` holds.
    #[error("retryable error: {message}")]
    Retryable {
        message: String,
        /// Server-directed retry hint (seconds, or an HTTP-date already
        /// resolved to seconds by the caller).
        retry_after_seconds: Option<i64>,
    },

    /// The step must never be retried.
    #[error("permanent error [{error_code}]: {message}")]
    Permanent { error_code: String, message: String },
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn retryable_with_hint(message: impl Into<String>, retry_after_seconds: i64) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    pub fn permanent(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    /// Timeout/cancellation is treated as a retryable error whose message is
    /// `timeout` (spec §4.4.2 step 7).
    pub fn timeout() -> Self {
        Self::retryable("timeout")
    }

    /// Classify an HTTP status code per spec §4.4.3's table.
    pub fn from_http_status(status: u16, message: impl Into<String>, retry_after: Option<i64>) -> Self {
        let message = message.into();
        match status {
            429 | 503 => match retry_after {
                Some(secs) => Self::retryable_with_hint(message, secs),
                None => Self::retryable(message),
            },
            400 | 401 | 403 | 404 | 422 => Self::permanent(status.to_string(), message),
            500..=599 => Self::retryable(message),
            _ => Self::retryable(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Top-level error returned by the WorkflowCoordinator and the components it
/// drives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    GraphCorrupted(#[from] GraphCorrupted),

    #[error(transparent)]
    Store(#[from] StoreFailure),

    #[error(transparent)]
    Backoff(#[from] InvalidBackoff),

    #[error("task {task_id} is in an unclear finalization state: {detail}")]
    UnclearTaskState { task_id: TaskId, detail: String },
}

impl CoreError {
    /// Mirrors spec §7's propagation policy: is this error fatal to the
    /// whole task (vs. recoverable on the next Coordinator invocation)?
    pub fn is_fatal_to_task(&self) -> bool {
        matches!(self, Self::GraphCorrupted(_))
    }
}
