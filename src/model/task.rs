use std::str::FromStr;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TaskId;

/// Task lifecycle states (spec §3 invariant #2, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[display("pending")]
    Pending,
    #[display("in_progress")]
    InProgress,
    #[display("complete")]
    Complete,
    #[display("error")]
    Error,
    #[display("cancelled")]
    Cancelled,
    #[display("resolved_manually")]
    ResolvedManually,
}

impl TaskState {
    /// A task in one of these states will never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::ResolvedManually)
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            "resolved_manually" => Ok(Self::ResolvedManually),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}

/// A durable workflow instance (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    /// Handler/template identifier, e.g. `"order_processing"`.
    pub name: String,
    pub namespace: String,
    pub version: String,
    /// Opaque user-supplied mapping, read-only to handlers.
    pub context: Value,
    /// Random or a deterministic digest of `context`, used for dedup.
    pub identity_hash: String,
    pub current_state: TaskState,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Construct a new task with a random identity hash. Callers wanting
    /// content-addressed dedup should compute a deterministic digest of
    /// `context` and overwrite `identity_hash` themselves (spec §3).
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        version: impl Into<String>,
        context: Value,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            name: name.into(),
            namespace: namespace.into(),
            version: version.into(),
            context,
            identity_hash: uuid::Uuid::new_v4().to_string(),
            current_state: TaskState::Pending,
            created_at: Utc::now(),
        }
    }
}
