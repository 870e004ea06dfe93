//! WorkflowCoordinator (spec §4.6): the outer durable loop. Reload, discover
//! viable steps, execute, check blocked, repeat; finalize on exit.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::executor::{BatchExecutionResult, StepExecutor};
use crate::finalizer::{FinalizationOutcome, TaskFinalizer};
use crate::model::{StepState, Task, TaskId, TaskState};
use crate::ports::{Event, EventSink, Store, WorkflowEventName};
use crate::resilience::CircuitBreakerBehavior;
use crate::resolver::DependencyResolver;
use crate::state_machine::{TaskEvent, TaskStateMachine};

/// Pre-classification of a task at loop entry (SPEC_FULL C.1), mirroring the
/// teacher's exhaustive match over task state before acting. Makes
/// re-entrancy (spec §8 Laws) a structural property: every state maps to
/// exactly one action, including states a well-behaved Coordinator should
/// never see twice.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorAction {
    /// `pending`/`error` (manual retry already applied elsewhere): drive the
    /// task through `start`, then discover/execute/finalize.
    TransitionAndFinalize,
    /// `in_progress`: a previous invocation was interrupted mid-batch.
    /// Resume at discover/execute without re-transitioning.
    CheckFinalization,
    /// Already terminal; re-invocation is a no-op (spec §8 Re-entrancy law).
    IdempotentNoOp(&'static str),
    /// A state the Coordinator has no defined behavior for.
    UnexpectedState,
}

fn classify(state: TaskState) -> CoordinatorAction {
    match state {
        TaskState::Pending => CoordinatorAction::TransitionAndFinalize,
        TaskState::InProgress => CoordinatorAction::CheckFinalization,
        TaskState::Complete => CoordinatorAction::IdempotentNoOp("task already complete"),
        TaskState::Cancelled => CoordinatorAction::IdempotentNoOp("task already cancelled"),
        TaskState::ResolvedManually => {
            CoordinatorAction::IdempotentNoOp("task already resolved manually")
        }
        TaskState::Error => CoordinatorAction::IdempotentNoOp("task failed, awaiting manual retry"),
    }
}

pub struct WorkflowCoordinator {
    store: Arc<dyn Store>,
    event_sink: Arc<dyn EventSink>,
    resolver: Arc<DependencyResolver>,
    executor: Arc<StepExecutor>,
    finalizer: Arc<TaskFinalizer>,
    store_circuit_breaker: Option<Arc<dyn CircuitBreakerBehavior>>,
}

impl WorkflowCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        event_sink: Arc<dyn EventSink>,
        resolver: Arc<DependencyResolver>,
        executor: Arc<StepExecutor>,
        finalizer: Arc<TaskFinalizer>,
    ) -> Self {
        Self {
            store,
            event_sink,
            resolver,
            executor,
            finalizer,
            store_circuit_breaker: None,
        }
    }

    pub fn with_store_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreakerBehavior>) -> Self {
        self.store_circuit_breaker = Some(breaker);
        self
    }

    /// Drive one Task to its next stopping point: a full cycle of
    /// reload -> discover -> execute -> (loop | finalize) (spec §4.6).
    /// Returns the finalizer's outcome, or `Wait`-equivalent behavior is
    /// represented by returning `Ok` with no further Store mutation when
    /// the batch is still `in_progress`.
    pub async fn run(
        &self,
        task_id: TaskId,
        correlation_id: Uuid,
        cancellation: CancellationToken,
    ) -> CoreResult<FinalizationOutcome> {
        if let Some(breaker) = &self.store_circuit_breaker {
            if !breaker.should_allow() {
                warn!(task_id = %task_id, "store circuit breaker open, skipping this invocation");
                return Ok(FinalizationOutcome::Wait);
            }
        }

        let task = match self.store.load_task(task_id).await {
            Ok(task) => {
                if let Some(breaker) = &self.store_circuit_breaker {
                    breaker.record_success();
                }
                task
            }
            Err(err) => {
                if let Some(breaker) = &self.store_circuit_breaker {
                    breaker.record_failure();
                }
                return Err(err);
            }
        };

        self.event_sink.emit(Event::Workflow {
            name: WorkflowEventName::TaskStarted,
            task_id,
            correlation_id,
            payload: serde_json::Value::Null,
        });

        let action = classify(task.current_state);
        let task = match action {
            CoordinatorAction::IdempotentNoOp(reason) => {
                info!(task_id = %task_id, reason, "coordinator no-op");
                return Ok(FinalizationOutcome::Unclear { detail: reason.to_string() });
            }
            CoordinatorAction::UnexpectedState => {
                error!(task_id = %task_id, state = %task.current_state, "unexpected task state");
                return Err(CoreError::UnclearTaskState {
                    task_id,
                    detail: format!("unexpected state {}", task.current_state),
                });
            }
            CoordinatorAction::TransitionAndFinalize => {
                let mut sm = TaskStateMachine::new(task, self.store.clone(), self.event_sink.clone());
                sm.transition(TaskEvent::Start, correlation_id, None, false).await?;
                self.run_discover_execute_loop(sm.task().clone(), correlation_id, &cancellation).await?
            }
            CoordinatorAction::CheckFinalization => {
                self.run_discover_execute_loop(task, correlation_id, &cancellation).await?
            }
        };

        let graph = self.store.load_step_graph(task_id).await?;
        let steps = self.load_all_steps(&graph).await?;
        self.finalizer.finalize(task, &graph, &steps, correlation_id).await
    }

    /// The `loop: viable <- resolve; if empty break; execute; if blocked
    /// break` body of spec §4.6's pseudocode.
    async fn run_discover_execute_loop(
        &self,
        task: Task,
        correlation_id: Uuid,
        cancellation: &CancellationToken,
    ) -> CoreResult<Task> {
        let graph = self.store.load_step_graph(task.task_id).await?;

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let viable = self.resolver.resolve(&graph, correlation_id).await?;
            if viable.is_empty() {
                break;
            }

            self.event_sink.emit(Event::Workflow {
                name: WorkflowEventName::StepsExecutionStarted,
                task_id: task.task_id,
                correlation_id,
                payload: serde_json::json!({"batch_size": viable.len()}),
            });

            let result: BatchExecutionResult = self
                .executor
                .execute(&task, &graph, viable, correlation_id, cancellation.clone())
                .await?;

            self.event_sink.emit(Event::Workflow {
                name: WorkflowEventName::StepsExecutionCompleted,
                task_id: task.task_id,
                correlation_id,
                payload: serde_json::json!({"outcomes": result.outcomes.len(), "cancelled": result.cancelled}),
            });

            if result.cancelled {
                break;
            }

            if self.blocked_by_errors(&graph).await? {
                break;
            }
        }

        Ok(task)
    }

    /// Is the task stuck on an unresolvable error with no other viable
    /// path forward? Mirrors the pseudocode's `blocked_by_errors` check
    /// (spec §4.6) so the loop can exit before a doomed retry.
    async fn blocked_by_errors(&self, graph: &crate::model::StepGraph) -> CoreResult<bool> {
        let steps = self.load_all_steps(graph).await?;
        let any_exhausted = steps
            .iter()
            .any(|s| s.current_state == StepState::Error && (s.retry_budget_exhausted() || !s.retryable));
        if !any_exhausted {
            return Ok(false);
        }
        Ok(self.resolver.any_step_blocked(graph, &steps).await?
            || self.resolver.resolve(graph, Uuid::new_v4()).await?.is_empty())
    }

    async fn load_all_steps(&self, graph: &crate::model::StepGraph) -> CoreResult<Vec<crate::model::Step>> {
        let mut steps = Vec::new();
        for step_id in graph.step_ids() {
            steps.push(self.store.reload_step(step_id).await?);
        }
        Ok(steps)
    }
}
