use serde_json::Value;

use crate::model::{StepId, TaskId};

/// The closed event namespace (spec §6.4). Every entry into and exit from a
/// core component emits one of these, carrying the correlation id that
/// propagates from the Task invocation through every Step execution
/// (spec §5, Determinism & traceability).
#[derive(Debug, Clone)]
pub enum Event {
    Task {
        name: TaskEventName,
        task_id: TaskId,
        correlation_id: uuid::Uuid,
        payload: Value,
    },
    Step {
        name: StepEventName,
        step_id: StepId,
        task_id: TaskId,
        correlation_id: uuid::Uuid,
        payload: Value,
    },
    Workflow {
        name: WorkflowEventName,
        task_id: TaskId,
        correlation_id: uuid::Uuid,
        payload: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventName {
    InitializeRequested,
    StartRequested,
    Completed,
    Failed,
    RetryRequested,
    ResolvedManually,
    Cancelled,
    BeforeTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEventName {
    Completed,
    Failed,
    RetryRequested,
    ResolvedManually,
    Cancelled,
    BeforeTransition,
    ExecutionRequested,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEventName {
    TaskStarted,
    ViableStepsDiscovered,
    NoViableSteps,
    StepsExecutionStarted,
    StepsExecutionCompleted,
    TaskFinalizationStarted,
    TaskFinalizationCompleted,
    TaskReenqueueRequested,
    TaskStateUnclear,
}

/// The observability port (spec §6.4). `emit` is best-effort: it must never
/// be allowed to throw into the core (spec §7: "Errors from EventSink are
/// always swallowed") — implementations that can fail should catch and log
/// internally rather than propagate.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// An `EventSink` that discards everything. Useful as a default for
/// embedders that don't need observability wired up yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}
