use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::{Step, StepGraph, StepId, Task, TaskId};

/// Load-aware scheduling signal (spec §6.1, §4.4.1). Optional: a Store that
/// cannot cheaply compute this returns `None` and the executor falls back
/// to its minimum concurrency.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCounts {
    pub tasks_in_progress: u64,
    pub tasks_pending: u64,
    pub steps_in_progress: u64,
    pub steps_pending: u64,
}

/// A single atomic unit of work against the Store: either every mutation it
/// records commits, or none do. Mirrors spec §6.1's `transaction(&block)` —
/// `save_step` persists mutable columns, `append_transition` is idempotent
/// against a repeated (from, to) pair on the same entity.
pub trait StoreTransaction: Send {
    fn append_transition(
        &mut self,
        entity_id: Uuid,
        from_state: Option<String>,
        to_state: String,
        metadata: Option<Value>,
    );

    /// Persists `attempts`, `results`, `in_process`, `processed`,
    /// `processed_at`, `backoff_until`, `last_attempted_at` (spec §6.1).
    fn save_step(&mut self, step: &Step);
}

/// The persistence port (spec §6.1). The core never touches a query
/// language directly — every durable fact flows through this trait.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_task(&self, task_id: TaskId) -> CoreResult<Task>;

    async fn load_step_graph(&self, task_id: TaskId) -> CoreResult<StepGraph>;

    async fn reload_step(&self, step_id: StepId) -> CoreResult<Step>;

    /// Compare-and-swap `pending -> in_progress` on a step. Returns `true`
    /// if this call won the race, `false` if another process already holds
    /// it (spec §5: "relies on Store conditional update").
    async fn claim_step(&self, step_id: StepId) -> CoreResult<bool>;

    /// Run `f` as a single atomic transaction. If `f` returns `Err`, no
    /// mutation it queued is committed.
    async fn transaction(
        &self,
        f: Box<dyn FnOnce(&mut dyn StoreTransaction) -> CoreResult<()> + Send>,
    ) -> CoreResult<()>;

    async fn connection_pool_size(&self) -> CoreResult<u32>;

    async fn connection_active(&self) -> bool;

    /// Optional load signal for dynamic concurrency (spec §4.4.1). `None`
    /// if the Store cannot cheaply provide it.
    async fn system_health_counts(&self) -> Option<HealthCounts> {
        None
    }
}
