use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::model::TaskId;
use crate::ports::Enqueuer;

/// Records every `enqueue` call instead of scheduling anything.
#[derive(Default)]
pub struct InMemoryEnqueuer {
    calls: Mutex<Vec<(TaskId, DateTime<Utc>)>>,
}

impl InMemoryEnqueuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(TaskId, DateTime<Utc>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_call(&self) -> Option<(TaskId, DateTime<Utc>)> {
        self.calls.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl Enqueuer for InMemoryEnqueuer {
    async fn enqueue(&self, task_id: TaskId, at: DateTime<Utc>) -> CoreResult<()> {
        self.calls.lock().unwrap().push((task_id, at));
        Ok(())
    }
}
