//! Durable workflow engine core.
//!
//! This crate implements the part of a durable workflow engine that decides
//! *what to run next*, runs it, and records *what happened* — independent of
//! any particular database, queue, or handler language. A [`model::Task`] is
//! a durable workflow instance composed of a DAG of [`model::Step`]s; the
//! [`coordinator::WorkflowCoordinator`] drives one Task through
//! reload → discover-viable-steps → execute → finalize, appending an
//! immutable [`model::TransitionRecord`] on every state change.
//!
//! Four ports (`ports`) decouple the core from its environment: [`ports::Store`]
//! for persistence, [`ports::Enqueuer`] for scheduling future invocations,
//! [`ports::StepHandler`] for user business logic, and [`ports::EventSink`]
//! for observability. Embedders provide implementations of these traits;
//! nothing here talks to a database, a queue, or a logging backend directly.
//!
//! ```text
//! WorkflowCoordinator
//!   ├─ StateMachine        (task/step transitions, append-only log)
//!   ├─ DependencyResolver  (viable-step discovery over the step graph)
//!   ├─ StepExecutor        (bounded-concurrency execution, retry classification)
//!   ├─ BackoffPolicy       (exponential + server-directed retry timing)
//!   └─ TaskFinalizer       (complete / failed / re-enqueue / wait / unclear)
//! ```

pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod finalizer;
pub mod model;
pub mod ports;
pub mod resilience;
pub mod resolver;
pub mod state_machine;

#[cfg(feature = "test-utils")]
pub mod testing;

pub use error::{CoreError, CoreResult};
