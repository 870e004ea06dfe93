use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreResult, InvalidTransition};
use crate::model::{Step, StepState};
use crate::ports::{Event, EventSink, Store, StepEventName};

/// Events that drive the step state machine (spec §4.1).
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// `pending -> in_progress`
    Start,
    /// `in_progress -> complete`
    Complete,
    /// `in_progress -> error`
    Fail,
    /// `error -> pending` (retry armed)
    ArmRetry,
    /// any non-terminal -> `cancelled`
    Cancel,
    /// any non-terminal -> `resolved_manually`
    ResolveManually,
}

impl StepEvent {
    fn target(&self) -> StepState {
        match self {
            Self::Start => StepState::InProgress,
            Self::Complete => StepState::Complete,
            Self::Fail => StepState::Error,
            Self::ArmRetry => StepState::Pending,
            Self::Cancel => StepState::Cancelled,
            Self::ResolveManually => StepState::ResolvedManually,
        }
    }

    fn name(&self) -> StepEventName {
        match self {
            Self::Start => StepEventName::ExecutionRequested,
            Self::Complete => StepEventName::Completed,
            Self::Fail => StepEventName::Failed,
            Self::ArmRetry => StepEventName::RetryRequested,
            Self::Cancel => StepEventName::Cancelled,
            Self::ResolveManually => StepEventName::ResolvedManually,
        }
    }
}

fn is_legal(from: StepState, to: StepState) -> bool {
    use StepState::*;
    match (from, to) {
        (Pending, InProgress) => true,
        (InProgress, Complete) => true,
        (InProgress, Error) => true,
        (Error, Pending) => true,
        (_, Cancelled) => !from.is_terminal_success(),
        (_, ResolvedManually) => !from.is_terminal_success(),
        _ => false,
    }
}

/// Drives legal transitions for a single [`Step`].
pub struct StepStateMachine {
    step: Step,
    store: Arc<dyn Store>,
    event_sink: Arc<dyn EventSink>,
}

impl StepStateMachine {
    pub fn new(step: Step, store: Arc<dyn Store>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            step,
            store,
            event_sink,
        }
    }

    pub fn current_state(&self) -> StepState {
        self.step.current_state
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn step_mut(&mut self) -> &mut Step {
        &mut self.step
    }

    /// Apply `event`. `viable` gates `pending -> in_progress` per spec's
    /// Step -> in_progress guard (parents satisfied, backoff elapsed,
    /// retry budget remaining); it is ignored for every other target.
    pub async fn transition(
        &mut self,
        event: StepEvent,
        correlation_id: Uuid,
        task_id: crate::model::TaskId,
        metadata: Option<Value>,
        viable: bool,
    ) -> CoreResult<bool> {
        let from = self.step.current_state;
        let to = event.target();

        if from == to {
            debug!(step_id = %self.step.step_id, state = %from, "step transition is a no-op repeat");
            return Ok(false);
        }

        if !is_legal(from, to) {
            return Err(InvalidTransition::step(self.step.step_id, from, to).into());
        }

        if matches!(to, StepState::InProgress) && !viable {
            return Err(InvalidTransition::step(self.step.step_id, from, to).into());
        }

        self.event_sink.emit(Event::Step {
            name: StepEventName::BeforeTransition,
            step_id: self.step.step_id,
            task_id,
            correlation_id,
            payload: serde_json::json!({"from": from.to_string(), "to": to.to_string()}),
        });

        self.store
            .transaction(Box::new({
                let entity_id = self.step.step_id.0;
                let from_s = from.to_string();
                let to_s = to.to_string();
                let metadata = metadata.clone();
                move |txn| {
                    txn.append_transition(entity_id, Some(from_s), to_s, metadata);
                    Ok(())
                }
            }))
            .await?;

        self.step.current_state = to;

        self.event_sink.emit(Event::Step {
            name: event.name(),
            step_id: self.step.step_id,
            task_id,
            correlation_id,
            payload: metadata.unwrap_or(Value::Null),
        });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskId;
    use crate::ports::NullEventSink;
    use crate::testing::InMemoryStore;

    fn machine(state: StepState) -> StepStateMachine {
        let mut step = Step::new(TaskId::new(), "a", "noop");
        step.current_state = state;
        StepStateMachine::new(step, Arc::new(InMemoryStore::new()), Arc::new(NullEventSink))
    }

    #[tokio::test]
    async fn start_requires_viability() {
        let mut sm = machine(StepState::Pending);
        let task_id = sm.step().task_id;
        let err = sm
            .transition(StepEvent::Start, Uuid::new_v4(), task_id, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn start_succeeds_when_viable() {
        let mut sm = machine(StepState::Pending);
        let task_id = sm.step().task_id;
        let did = sm
            .transition(StepEvent::Start, Uuid::new_v4(), task_id, None, true)
            .await
            .unwrap();
        assert!(did);
        assert_eq!(sm.current_state(), StepState::InProgress);
    }

    #[tokio::test]
    async fn arm_retry_from_error_to_pending() {
        let mut sm = machine(StepState::Error);
        let task_id = sm.step().task_id;
        let did = sm
            .transition(StepEvent::ArmRetry, Uuid::new_v4(), task_id, None, false)
            .await
            .unwrap();
        assert!(did);
        assert_eq!(sm.current_state(), StepState::Pending);
    }

    #[tokio::test]
    async fn complete_requires_in_progress() {
        let mut sm = machine(StepState::Pending);
        let task_id = sm.step().task_id;
        let err = sm
            .transition(StepEvent::Complete, Uuid::new_v4(), task_id, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::InvalidTransition(_)));
    }
}
