use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreResult, StoreFailure};
use crate::model::{Step, StepGraph, StepId, StepState, Task, TaskId, TransitionRecord};
use crate::ports::{HealthCounts, Store, StoreTransaction};

enum Op {
    AppendTransition {
        entity_id: Uuid,
        from_state: Option<String>,
        to_state: String,
        metadata: Option<Value>,
    },
    SaveStep(Step),
}

/// Buffers mutations queued by a transaction closure; applied to the store
/// only if the closure returns `Ok` (spec §6.1 atomicity).
#[derive(Default)]
struct BufferedTransaction {
    ops: Vec<Op>,
}

impl StoreTransaction for BufferedTransaction {
    fn append_transition(
        &mut self,
        entity_id: Uuid,
        from_state: Option<String>,
        to_state: String,
        metadata: Option<Value>,
    ) {
        self.ops.push(Op::AppendTransition {
            entity_id,
            from_state,
            to_state,
            metadata,
        });
    }

    fn save_step(&mut self, step: &Step) {
        self.ops.push(Op::SaveStep(step.clone()));
    }
}

/// A process-local `Store` backed by `Mutex`-guarded maps. No durability, no
/// isolation beyond the single lock below: good enough to exercise every
/// core code path in a unit test without a real database.
pub struct InMemoryStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
    steps: Mutex<HashMap<StepId, Step>>,
    transitions: Mutex<Vec<TransitionRecord>>,
    pool_size: u32,
    health: Mutex<Option<HealthCounts>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            transitions: Mutex::new(Vec::new()),
            pool_size: 10,
            health: Mutex::new(None),
        }
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_health_counts(&self, counts: HealthCounts) {
        *self.health.lock().unwrap() = Some(counts);
    }

    pub async fn insert_task(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.task_id, task);
    }

    pub async fn insert_step(&self, step: Step) {
        self.steps.lock().unwrap().insert(step.step_id, step);
    }

    pub async fn reload_task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.lock().unwrap().get(&task_id).cloned()
    }

    pub async fn steps_for_task(&self, task_id: TaskId) -> Vec<Step> {
        self.steps
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions.lock().unwrap().clone()
    }

    /// Test helper: force a step straight to a terminal state without going
    /// through the state machine, for setting up resolver/finalizer fixtures.
    pub async fn mark_terminal_success(&self, step_id: StepId, state: StepState) {
        let mut steps = self.steps.lock().unwrap();
        if let Some(step) = steps.get_mut(&step_id) {
            step.current_state = state;
            step.processed = true;
            step.processed_at = Some(chrono::Utc::now());
            step.in_process = false;
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// The `to_state` of the most recent transition appended for `entity_id`,
    /// if any. `current_state` is a derived cache (spec §3: "Transitions ...
    /// are the source of truth for the `current_state` cache on the entity,
    /// which is derived"), so every load path re-derives it from the log
    /// rather than trusting whatever was last passed to `insert_task` /
    /// `insert_step` / `save_step`.
    fn latest_transition_state(&self, entity_id: Uuid) -> Option<String> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.entity_id == entity_id)
            .map(|t| t.to_state.clone())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn load_task(&self, task_id: TaskId) -> CoreResult<Task> {
        let mut task = self
            .tasks
            .lock()
            .unwrap()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreFailure::new("load_task", format!("no task {task_id}")))?;
        if let Some(state) = self.latest_transition_state(task_id.0) {
            task.current_state = state
                .parse()
                .map_err(|e| StoreFailure::new("load_task", format!("corrupt state '{state}': {e}")))?;
        }
        Ok(task)
    }

    async fn load_step_graph(&self, task_id: TaskId) -> CoreResult<StepGraph> {
        let steps = self.steps.lock().unwrap();
        let mut parents = HashMap::new();
        for step in steps.values().filter(|s| s.task_id == task_id) {
            parents.insert(step.step_id, step.parent_ids.clone());
        }
        drop(steps);
        StepGraph::build(task_id, parents)
            .map_err(|e| StoreFailure::new("load_step_graph", e.to_string()).into())
    }

    async fn reload_step(&self, step_id: StepId) -> CoreResult<Step> {
        let mut step = self
            .steps
            .lock()
            .unwrap()
            .get(&step_id)
            .cloned()
            .ok_or_else(|| StoreFailure::new("reload_step", format!("no step {step_id}")))?;
        if let Some(state) = self.latest_transition_state(step_id.0) {
            step.current_state = state
                .parse()
                .map_err(|e| StoreFailure::new("reload_step", format!("corrupt state '{state}': {e}")))?;
        }
        Ok(step)
    }

    async fn claim_step(&self, step_id: StepId) -> CoreResult<bool> {
        let derived = self.latest_transition_state(step_id.0);
        let mut steps = self.steps.lock().unwrap();
        let step = steps
            .get_mut(&step_id)
            .ok_or_else(|| StoreFailure::new("claim_step", format!("no step {step_id}")))?;
        let current_state = match derived {
            Some(state) => state
                .parse()
                .map_err(|e| StoreFailure::new("claim_step", format!("corrupt state '{state}': {e}")))?,
            None => step.current_state,
        };
        if current_state == StepState::Pending && !step.in_process {
            step.current_state = StepState::InProgress;
            step.in_process = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn transaction(
        &self,
        f: Box<dyn FnOnce(&mut dyn StoreTransaction) -> CoreResult<()> + Send>,
    ) -> CoreResult<()> {
        let mut txn = BufferedTransaction::default();
        f(&mut txn)?;

        let mut transitions = self.transitions.lock().unwrap();
        let mut steps = self.steps.lock().unwrap();
        for op in txn.ops {
            match op {
                Op::AppendTransition {
                    entity_id,
                    from_state,
                    to_state,
                    metadata,
                } => transitions.push(TransitionRecord::new(entity_id, from_state, to_state, metadata)),
                Op::SaveStep(step) => {
                    steps.insert(step.step_id, step);
                }
            }
        }
        Ok(())
    }

    async fn connection_pool_size(&self) -> CoreResult<u32> {
        Ok(self.pool_size)
    }

    async fn connection_active(&self) -> bool {
        true
    }

    async fn system_health_counts(&self) -> Option<HealthCounts> {
        *self.health.lock().unwrap()
    }
}
