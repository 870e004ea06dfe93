use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::model::TaskId;

/// The re-invocation port (spec §6.2). The core never sleeps inline for a
/// backoff; it hands the future instant to this port and returns.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    /// Schedule a future Coordinator invocation for `task_id` no earlier
    /// than `at`.
    async fn enqueue(&self, task_id: TaskId, at: DateTime<Utc>) -> CoreResult<()>;
}
