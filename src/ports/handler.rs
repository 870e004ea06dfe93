use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::model::Step;

/// A handler's outcome: an opaque mapping on success, or a classified error
/// (spec §6.3). The executor never sees any other shape — an unclassified
/// panic/exception from a foreign implementation is the embedder's
/// responsibility to convert into `HandlerError::Retryable` at the FFI
/// boundary (spec §4.4.3: "any other exception is treated as
/// RetryableError without a hint").
pub type HandlerResult = Result<Value, HandlerError>;

/// User-supplied business logic bound to a step (spec §6.3). Implementors
/// MUST be idempotent: the core is at-least-once, not exactly-once
/// (spec §1 Non-goals, §4.4.5).
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step. `task_context` is the owning task's opaque
    /// context; `parent_results` are the (already-terminal) results of this
    /// step's parents, keyed by parent step name.
    async fn handle(
        &self,
        task_context: &Value,
        parent_results: &std::collections::HashMap<String, Value>,
        step: &Step,
    ) -> HandlerResult;

    /// Declarative dependency list for graph construction at task-creation
    /// time (spec §6.3). Default: no declared dependencies — the task
    /// builder is free to wire the graph some other way.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Looks up a registered handler by name. An unknown name is an immediate
/// `GraphCorrupted::UnknownHandler` (spec §9, Dynamic dispatch of
/// handlers), never a panic.
pub trait HandlerRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<std::sync::Arc<dyn StepHandler>>;
}
