//! In-memory port implementations for tests, gated behind the `test-utils`
//! feature. Mirrors the shape of each trait exactly; none of it is meant
//! for production use.

mod enqueuer;
mod event_sink;
mod factories;
mod store;

pub use enqueuer::InMemoryEnqueuer;
pub use event_sink::RecordingEventSink;
pub use factories::{task_with_linear_steps, TaskFactory};
pub use store::InMemoryStore;
