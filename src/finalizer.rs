//! TaskFinalizer (spec §4.5): after each execution batch, classifies a Task
//! into exactly one outcome and acts on it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::{Step, StepGraph, StepId, StepState, Task};
use crate::ports::{Enqueuer, Event, EventSink, Store, WorkflowEventName};
use crate::resolver::DependencyResolver;
use crate::state_machine::{TaskEvent, TaskStateMachine};

/// One of five mutually exclusive classifications (spec §4.5 table),
/// returned so the Coordinator and callers can log/act without re-deriving
/// it (SPEC_FULL C.2).
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizationOutcome {
    Complete,
    Failed { blocking_steps: Vec<StepId> },
    ReEnqueue { at: DateTime<Utc> },
    Wait,
    Unclear { detail: String },
}

pub struct TaskFinalizer {
    store: Arc<dyn Store>,
    enqueuer: Arc<dyn Enqueuer>,
    event_sink: Arc<dyn EventSink>,
    resolver: Arc<DependencyResolver>,
    default_reenqueue_delay_seconds: i64,
}

impl TaskFinalizer {
    pub fn new(
        store: Arc<dyn Store>,
        enqueuer: Arc<dyn Enqueuer>,
        event_sink: Arc<dyn EventSink>,
        resolver: Arc<DependencyResolver>,
    ) -> Self {
        Self {
            store,
            enqueuer,
            event_sink,
            resolver,
            default_reenqueue_delay_seconds: 30,
        }
    }

    pub fn with_default_reenqueue_delay(mut self, seconds: i64) -> Self {
        self.default_reenqueue_delay_seconds = seconds;
        self
    }

    /// Classify and act (spec §4.5). `steps` must be the full, freshly
    /// reloaded Step set for `task`.
    pub async fn finalize(
        &self,
        task: Task,
        graph: &StepGraph,
        steps: &[Step],
        correlation_id: Uuid,
    ) -> CoreResult<FinalizationOutcome> {
        self.event_sink.emit(Event::Workflow {
            name: WorkflowEventName::TaskFinalizationStarted,
            task_id: task.task_id,
            correlation_id,
            payload: serde_json::Value::Null,
        });

        let outcome = self.classify_and_act(task, graph, steps, correlation_id).await?;

        self.event_sink.emit(Event::Workflow {
            name: WorkflowEventName::TaskFinalizationCompleted,
            task_id: graph.task_id(),
            correlation_id,
            payload: json!({"outcome": outcome_label(&outcome)}),
        });

        Ok(outcome)
    }

    async fn classify_and_act(
        &self,
        task: Task,
        graph: &StepGraph,
        steps: &[Step],
        correlation_id: Uuid,
    ) -> CoreResult<FinalizationOutcome> {
        if steps.iter().all(|s| s.current_state.is_terminal_success()) {
            let mut sm = TaskStateMachine::new(task, self.store.clone(), self.event_sink.clone());
            sm.transition(TaskEvent::Complete, correlation_id, None, true).await?;
            return Ok(FinalizationOutcome::Complete);
        }

        let blocking: Vec<StepId> = steps
            .iter()
            .filter(|s| {
                s.current_state == StepState::Error
                    && (s.retry_budget_exhausted() || !s.retryable)
            })
            .map(|s| s.step_id)
            .collect();

        if !blocking.is_empty() {
            let viable = self.resolver.resolve(graph, correlation_id).await?;
            if viable.is_empty() {
                let mut sm = TaskStateMachine::new(task, self.store.clone(), self.event_sink.clone());
                sm.transition(
                    TaskEvent::Fail,
                    correlation_id,
                    Some(json!({"blocking_steps": blocking})),
                    false,
                )
                .await?;
                return Ok(FinalizationOutcome::Failed { blocking_steps: blocking });
            }
        }

        let pending_with_backoff: Vec<&Step> = steps
            .iter()
            .filter(|s| s.current_state == StepState::Pending && !s.in_process && !s.processed)
            .collect();

        if !pending_with_backoff.is_empty() {
            let viable = self.resolver.resolve(graph, correlation_id).await?;
            if viable.is_empty() {
                let earliest = pending_with_backoff
                    .iter()
                    .filter_map(|s| s.backoff_until)
                    .min()
                    .unwrap_or_else(|| Utc::now() + Duration::seconds(self.default_reenqueue_delay_seconds));

                let mut sm = TaskStateMachine::new(task, self.store.clone(), self.event_sink.clone());
                sm.transition(TaskEvent::Reenqueue, correlation_id, None, false).await?;

                self.event_sink.emit(Event::Workflow {
                    name: WorkflowEventName::TaskReenqueueRequested,
                    task_id: graph.task_id(),
                    correlation_id,
                    payload: json!({"at": earliest}),
                });
                self.enqueuer.enqueue(graph.task_id(), earliest).await?;

                return Ok(FinalizationOutcome::ReEnqueue { at: earliest });
            }
        }

        if steps.iter().any(|s| s.current_state == StepState::InProgress) {
            return Ok(FinalizationOutcome::Wait);
        }

        let detail = format!(
            "no classification applies: {} steps, states={:?}",
            steps.len(),
            steps.iter().map(|s| (s.name.clone(), s.current_state)).collect::<Vec<_>>()
        );
        self.event_sink.emit(Event::Workflow {
            name: WorkflowEventName::TaskStateUnclear,
            task_id: graph.task_id(),
            correlation_id,
            payload: json!({"detail": detail.clone()}),
        });
        Ok(FinalizationOutcome::Unclear { detail })
    }
}

fn outcome_label(outcome: &FinalizationOutcome) -> &'static str {
    match outcome {
        FinalizationOutcome::Complete => "complete",
        FinalizationOutcome::Failed { .. } => "failed",
        FinalizationOutcome::ReEnqueue { .. } => "re_enqueue",
        FinalizationOutcome::Wait => "wait",
        FinalizationOutcome::Unclear { .. } => "unclear",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::NullEventSink;
    use crate::testing::{task_with_linear_steps, InMemoryEnqueuer, InMemoryStore};

    fn finalizer(store: Arc<InMemoryStore>) -> TaskFinalizer {
        let resolver = Arc::new(DependencyResolver::new(store.clone(), Arc::new(NullEventSink)));
        TaskFinalizer::new(store, Arc::new(InMemoryEnqueuer::new()), Arc::new(NullEventSink), resolver)
    }

    #[tokio::test]
    async fn all_terminal_success_completes_the_task() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 2).await;
        store.mark_terminal_success(ids[0], StepState::Complete).await;
        store.mark_terminal_success(ids[1], StepState::Complete).await;

        let mut task = store.reload_task(task_id).await.unwrap();
        task.current_state = crate::model::TaskState::InProgress;
        let graph = store.load_step_graph(task_id).await.unwrap();
        let steps = store.steps_for_task(task_id).await;

        let outcome = finalizer(store).finalize(task, &graph, &steps, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, FinalizationOutcome::Complete);
    }

    #[tokio::test]
    async fn exhausted_error_step_with_no_viable_alternative_fails_task() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 1).await;
        {
            let mut step = store.reload_step(ids[0]).await.unwrap();
            step.current_state = StepState::Error;
            step.attempts = step.retry_limit;
            store.insert_step(step).await;
        }

        let mut task = store.reload_task(task_id).await.unwrap();
        task.current_state = crate::model::TaskState::InProgress;
        let graph = store.load_step_graph(task_id).await.unwrap();
        let steps = store.steps_for_task(task_id).await;

        let outcome = finalizer(store).finalize(task, &graph, &steps, Uuid::new_v4()).await.unwrap();
        assert!(matches!(outcome, FinalizationOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn in_progress_step_means_wait() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 1).await;
        {
            let mut step = store.reload_step(ids[0]).await.unwrap();
            step.current_state = StepState::InProgress;
            step.in_process = true;
            store.insert_step(step).await;
        }

        let mut task = store.reload_task(task_id).await.unwrap();
        task.current_state = crate::model::TaskState::InProgress;
        let graph = store.load_step_graph(task_id).await.unwrap();
        let steps = store.steps_for_task(task_id).await;

        let outcome = finalizer(store).finalize(task, &graph, &steps, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, FinalizationOutcome::Wait);
    }

    #[tokio::test]
    async fn pending_step_with_future_backoff_reenqueues() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 1).await;
        {
            let mut step = store.reload_step(ids[0]).await.unwrap();
            step.backoff_until = Some(Utc::now() + Duration::seconds(120));
            store.insert_step(step).await;
        }

        let mut task = store.reload_task(task_id).await.unwrap();
        task.current_state = crate::model::TaskState::InProgress;
        let graph = store.load_step_graph(task_id).await.unwrap();
        let steps = store.steps_for_task(task_id).await;

        let outcome = finalizer(store).finalize(task, &graph, &steps, Uuid::new_v4()).await.unwrap();
        assert!(matches!(outcome, FinalizationOutcome::ReEnqueue { .. }));
    }
}
