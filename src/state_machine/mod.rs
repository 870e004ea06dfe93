//! Task and Step state machines (spec §4.1).
//!
//! Both machines share the same shape: a fixed transition table, an
//! idempotency guard against repeating the current state, and
//! before/after event emission. They differ only in their alphabet and
//! domain-specific guards (Task -> complete requires every step
//! terminal-success; Step -> in_progress requires viability).

mod step_machine;
mod task_machine;

pub use step_machine::{StepEvent, StepStateMachine};
pub use task_machine::{TaskEvent, TaskStateMachine};
