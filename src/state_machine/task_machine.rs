use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreResult, InvalidTransition};
use crate::model::{Task, TaskState};
use crate::ports::{Event, EventSink, Store, TaskEventName};

/// Events that drive the task state machine (spec §4.1). Each carries an
/// implicit target state; [`TaskEvent::target`] and the legality table in
/// [`is_legal`] are the transition table's two halves.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// `pending -> in_progress`
    Start,
    /// `in_progress -> complete`
    Complete,
    /// `in_progress -> error` (at least one step unrecoverable)
    Fail,
    /// `in_progress -> pending` (re-enqueue for later continuation)
    Reenqueue,
    /// any non-terminal -> `cancelled`
    Cancel,
    /// `error -> in_progress` (manual retry)
    ManualRetry,
    /// any non-terminal -> `resolved_manually`
    ResolveManually,
}

impl TaskEvent {
    fn target(&self) -> TaskState {
        match self {
            Self::Start => TaskState::InProgress,
            Self::Complete => TaskState::Complete,
            Self::Fail => TaskState::Error,
            Self::Reenqueue => TaskState::Pending,
            Self::Cancel => TaskState::Cancelled,
            Self::ManualRetry => TaskState::InProgress,
            Self::ResolveManually => TaskState::ResolvedManually,
        }
    }

    fn name(&self) -> TaskEventName {
        match self {
            Self::Start => TaskEventName::StartRequested,
            Self::Complete => TaskEventName::Completed,
            Self::Fail => TaskEventName::Failed,
            Self::Reenqueue => TaskEventName::RetryRequested,
            Self::Cancel => TaskEventName::Cancelled,
            Self::ManualRetry => TaskEventName::StartRequested,
            Self::ResolveManually => TaskEventName::ResolvedManually,
        }
    }
}

/// Is `from -> to` one of the listed transitions in spec §4.1?
fn is_legal(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    match (from, to) {
        (Pending, InProgress) => true,
        (InProgress, Complete) => true,
        (InProgress, Error) => true,
        (InProgress, Pending) => true,
        (Error, InProgress) => true,
        (_, Cancelled) => !from.is_terminal(),
        (_, ResolvedManually) => !from.is_terminal(),
        _ => false,
    }
}

/// Drives legal transitions for a single [`Task`], appending a transition
/// record and emitting events through the configured ports.
pub struct TaskStateMachine {
    task: Task,
    store: Arc<dyn Store>,
    event_sink: Arc<dyn EventSink>,
}

impl TaskStateMachine {
    pub fn new(task: Task, store: Arc<dyn Store>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            task,
            store,
            event_sink,
        }
    }

    pub fn current_state(&self) -> TaskState {
        self.task.current_state
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Apply `event`, requiring that every step be terminal-success when the
    /// target is `Complete` (spec §4.1 Guards). Idempotent against a
    /// spurious repeat of the same target from the same current state
    /// (spec §4.1 Contract).
    pub async fn transition(
        &mut self,
        event: TaskEvent,
        correlation_id: Uuid,
        metadata: Option<Value>,
        all_steps_terminal_success: bool,
    ) -> CoreResult<bool> {
        let from = self.task.current_state;
        let to = event.target();

        if from == to {
            debug!(task_id = %self.task.task_id, state = %from, "task transition is a no-op repeat");
            return Ok(false);
        }

        if !is_legal(from, to) {
            return Err(InvalidTransition::task(self.task.task_id, from, to).into());
        }

        if matches!(to, TaskState::Complete) && !all_steps_terminal_success {
            return Err(InvalidTransition::task(self.task.task_id, from, to).into());
        }

        self.event_sink.emit(Event::Task {
            name: TaskEventName::BeforeTransition,
            task_id: self.task.task_id,
            correlation_id,
            payload: serde_json::json!({"from": from.to_string(), "to": to.to_string()}),
        });

        self.store
            .transaction(Box::new({
                let entity_id = self.task.task_id.0;
                let from_s = from.to_string();
                let to_s = to.to_string();
                let metadata = metadata.clone();
                move |txn| {
                    txn.append_transition(entity_id, Some(from_s), to_s, metadata);
                    Ok(())
                }
            }))
            .await?;

        self.task.current_state = to;

        self.event_sink.emit(Event::Task {
            name: event.name(),
            task_id: self.task.task_id,
            correlation_id,
            payload: metadata.unwrap_or(Value::Null),
        });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::NullEventSink;
    use crate::testing::InMemoryStore;

    fn machine(state: TaskState) -> TaskStateMachine {
        let mut task = Task::new("t", "ns", "1.0.0", Value::Null);
        task.current_state = state;
        TaskStateMachine::new(task, Arc::new(InMemoryStore::new()), Arc::new(NullEventSink))
    }

    #[tokio::test]
    async fn start_transitions_pending_to_in_progress() {
        let mut sm = machine(TaskState::Pending);
        let did = sm
            .transition(TaskEvent::Start, Uuid::new_v4(), None, false)
            .await
            .unwrap();
        assert!(did);
        assert_eq!(sm.current_state(), TaskState::InProgress);
    }

    #[tokio::test]
    async fn complete_requires_all_steps_terminal_success() {
        let mut sm = machine(TaskState::InProgress);
        let err = sm
            .transition(TaskEvent::Complete, Uuid::new_v4(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidTransition(_)));
        assert_eq!(sm.current_state(), TaskState::InProgress);
    }

    #[tokio::test]
    async fn complete_succeeds_when_all_steps_done() {
        let mut sm = machine(TaskState::InProgress);
        let did = sm
            .transition(TaskEvent::Complete, Uuid::new_v4(), None, true)
            .await
            .unwrap();
        assert!(did);
        assert_eq!(sm.current_state(), TaskState::Complete);
    }

    #[tokio::test]
    async fn repeat_of_current_state_is_idempotent_noop() {
        let mut sm = machine(TaskState::Pending);
        sm.transition(TaskEvent::Start, Uuid::new_v4(), None, false)
            .await
            .unwrap();
        // Re-issuing an event whose target equals the current state is a no-op.
        let did = sm
            .transition(TaskEvent::ManualRetry, Uuid::new_v4(), None, false)
            .await
            .unwrap();
        assert!(!did);
        assert_eq!(sm.current_state(), TaskState::InProgress);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let mut sm = machine(TaskState::Pending);
        let err = sm
            .transition(TaskEvent::Complete, Uuid::new_v4(), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn cancel_allowed_from_any_non_terminal_state() {
        let mut sm = machine(TaskState::Error);
        let did = sm
            .transition(TaskEvent::Cancel, Uuid::new_v4(), None, false)
            .await
            .unwrap();
        assert!(did);
        assert_eq!(sm.current_state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_rejected_from_terminal_state() {
        let mut sm = machine(TaskState::Complete);
        let err = sm
            .transition(TaskEvent::Cancel, Uuid::new_v4(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidTransition(_)));
    }
}
