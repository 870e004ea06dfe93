use std::str::FromStr;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{StepId, TaskId};

/// Step lifecycle states (spec §3 invariant #1, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[display("pending")]
    Pending,
    #[display("in_progress")]
    InProgress,
    #[display("error")]
    Error,
    #[display("complete")]
    Complete,
    #[display("resolved_manually")]
    ResolvedManually,
    #[display("cancelled")]
    Cancelled,
}

impl StepState {
    /// Terminal-success per spec §3 invariant #6.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Complete | Self::ResolvedManually | Self::Cancelled)
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "error" => Ok(Self::Error),
            "complete" => Ok(Self::Complete),
            "resolved_manually" => Ok(Self::ResolvedManually),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown step state '{other}'")),
        }
    }
}

/// A node in a Task's dependency graph (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: StepId,
    pub task_id: TaskId,
    /// Unique within the owning task.
    pub name: String,
    /// Handler registry key, looked up by the executor (spec §9, dynamic
    /// dispatch of handlers).
    pub handler_name: String,
    pub current_state: StepState,
    pub attempts: u32,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
    /// Handler output on success, or `{error, class, backtrace}` on failure.
    pub results: Option<Value>,
    pub in_process: bool,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retryable: bool,
    pub retry_limit: u32,
    /// If true, a cancelled parent does not block this step (spec §9 open
    /// question, resolved in DESIGN.md).
    pub skippable: bool,
    /// Non-owning references to parent steps, by id (spec §3 Ownership).
    pub parent_ids: Vec<StepId>,
}

impl Step {
    pub fn new(task_id: TaskId, name: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            step_id: StepId::new(),
            task_id,
            name: name.into(),
            handler_name: handler_name.into(),
            current_state: StepState::Pending,
            attempts: 0,
            last_attempted_at: None,
            backoff_until: None,
            results: None,
            in_process: false,
            processed: false,
            processed_at: None,
            retryable: true,
            retry_limit: 3,
            skippable: false,
            parent_ids: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: impl IntoIterator<Item = StepId>) -> Self {
        self.parent_ids = parents.into_iter().collect();
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    /// Invariant #7: is this step viable *assuming* all parents' states are
    /// already known to be terminal-success? The caller (resolver) is
    /// responsible for evaluating parent states; this only checks the
    /// step's own fields plus backoff.
    pub fn self_viable(&self, now: DateTime<Utc>) -> bool {
        self.current_state == StepState::Pending
            && !self.in_process
            && !self.processed
            && self.backoff_until.is_none_or(|at| at <= now)
    }

    /// Invariant #4.
    pub fn invariant_in_process_implies_in_progress(&self) -> bool {
        !self.in_process || self.current_state == StepState::InProgress
    }

    /// Invariant #5.
    pub fn invariant_processed_implies_terminal(&self) -> bool {
        !self.processed
            || matches!(self.current_state, StepState::Complete | StepState::ResolvedManually)
    }

    /// Invariant #4: attempts <= retry_limit whenever not in error.
    pub fn invariant_attempts_bounded(&self) -> bool {
        self.current_state == StepState::Error || self.attempts <= self.retry_limit
    }

    pub fn retry_budget_exhausted(&self) -> bool {
        self.attempts >= self.retry_limit
    }
}
