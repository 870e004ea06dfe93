//! StepExecutor (spec §4.4): executes a batch of viable Steps under a
//! dynamic concurrency cap, with atomic persistence, HTTP-shaped error
//! classification, and cooperative cancellation.

mod batch;
mod classify;
mod concurrency;

pub use batch::{calculate_batch_timeout, chunk_steps, TimeoutConfig};
pub use classify::classify_http_status;
pub use concurrency::{compute_max_concurrent, ConcurrencyConfig};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::{CoreResult, HandlerError};
use crate::model::{Step, StepGraph, StepId, StepState, Task};
use crate::ports::{Event, EventSink, HandlerRegistry, Store, StepEventName};
use crate::resolver::{DependencyResolver, StepDisposition};

/// The terminal disposition of a single step within a batch (spec §4.4.2).
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed { step_id: StepId },
    Retrying { step_id: StepId, next_attempt_at: DateTime<Utc> },
    PermanentlyFailed { step_id: StepId },
    /// `claim_step` lost the race: another process is already executing it.
    ClaimLost { step_id: StepId },
    /// Viability evaporated between resolution and execution (a concurrent
    /// invocation raced us to a parent transition).
    NotViable { step_id: StepId },
    /// The batch was cancelled before this step's handler returned.
    Cancelled { step_id: StepId },
}

impl StepOutcome {
    pub fn step_id(&self) -> StepId {
        match self {
            Self::Completed { step_id }
            | Self::Retrying { step_id, .. }
            | Self::PermanentlyFailed { step_id }
            | Self::ClaimLost { step_id }
            | Self::NotViable { step_id }
            | Self::Cancelled { step_id } => *step_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchExecutionResult {
    pub outcomes: Vec<StepOutcome>,
    pub cancelled: bool,
}

pub struct StepExecutor {
    store: Arc<dyn Store>,
    handlers: Arc<dyn HandlerRegistry>,
    event_sink: Arc<dyn EventSink>,
    resolver: Arc<DependencyResolver>,
    backoff: BackoffPolicy,
    concurrency_config: ConcurrencyConfig,
    timeout_config: TimeoutConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        handlers: Arc<dyn HandlerRegistry>,
        event_sink: Arc<dyn EventSink>,
        resolver: Arc<DependencyResolver>,
        backoff: BackoffPolicy,
        concurrency_config: ConcurrencyConfig,
        timeout_config: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            event_sink,
            resolver,
            backoff,
            concurrency_config,
            timeout_config,
        }
    }

    /// Execute every step in `batch`, chunked under the dynamic concurrency
    /// budget. `cancellation`, when cancelled, causes any steps not yet
    /// started to be skipped and in-flight ones given up to
    /// `future_cleanup_wait_seconds` to finish (spec §4.4.4).
    pub async fn execute(
        &self,
        task: &Task,
        graph: &StepGraph,
        batch: Vec<Step>,
        correlation_id: Uuid,
        cancellation: CancellationToken,
    ) -> CoreResult<BatchExecutionResult> {
        let max_concurrent = self.current_concurrency_budget().await;
        let chunks = chunk_steps(batch, max_concurrent);

        let mut outcomes = Vec::new();
        let mut cancelled = false;

        for chunk in chunks {
            if cancellation.is_cancelled() {
                outcomes.extend(chunk.into_iter().map(|s| StepOutcome::Cancelled { step_id: s.step_id }));
                cancelled = true;
                continue;
            }

            let chunk_size = chunk.len();
            let timeout = calculate_batch_timeout(chunk_size, &self.timeout_config);

            let futures = chunk.into_iter().map(|step| {
                let cancellation = cancellation.clone();
                async move { self.execute_one(task, graph, step, correlation_id, timeout, &cancellation).await }
            });

            let results = futures::future::join_all(futures).await;
            for result in results {
                match result {
                    Ok(outcome) => {
                        if matches!(outcome, StepOutcome::Cancelled { .. }) {
                            cancelled = true;
                        }
                        outcomes.push(outcome);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(BatchExecutionResult { outcomes, cancelled })
    }

    async fn current_concurrency_budget(&self) -> usize {
        let load = self.store.system_health_counts().await;
        let pool = self.store.connection_pool_size().await.ok();
        compute_max_concurrent(load, pool, &self.concurrency_config)
    }

    async fn execute_one(
        &self,
        task: &Task,
        graph: &StepGraph,
        step: Step,
        correlation_id: Uuid,
        timeout: std::time::Duration,
        cancellation: &CancellationToken,
    ) -> CoreResult<StepOutcome> {
        let step_id = step.step_id;

        if !self.store.connection_active().await {
            warn!(step_id = %step_id, "store unreachable, skipping step this pass");
            return Ok(StepOutcome::NotViable { step_id });
        }

        let fresh = self.store.reload_step(step_id).await?;
        let disposition = self.resolver.disposition(&fresh, graph, Utc::now()).await?;
        if disposition != StepDisposition::Viable {
            debug!(step_id = %step_id, "step no longer viable at execution time");
            return Ok(StepOutcome::NotViable { step_id });
        }

        if !self.store.claim_step(step_id).await? {
            debug!(step_id = %step_id, "claim lost, another process owns this step");
            return Ok(StepOutcome::ClaimLost { step_id });
        }

        let mut step = fresh;
        step.current_state = StepState::InProgress;
        step.in_process = true;

        self.event_sink.emit(Event::Step {
            name: StepEventName::ExecutionRequested,
            step_id,
            task_id: task.task_id,
            correlation_id,
            payload: Value::Null,
        });

        let parent_results = self.load_parent_results(graph, &step).await?;

        let handler = self
            .handlers
            .get(&step.handler_name)
            .ok_or_else(|| crate::error::GraphCorrupted::UnknownHandler {
                step_id,
                name: step.handler_name.clone(),
            })?;

        let invocation = handler.handle(&task.context, &parent_results, &step);

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return Ok(StepOutcome::Cancelled { step_id });
            }
            result = tokio::time::timeout(timeout, invocation) => result,
        };

        match outcome {
            Ok(Ok(result)) => {
                self.persist_success(task, &mut step, result, correlation_id).await?;
                Ok(StepOutcome::Completed { step_id })
            }
            Ok(Err(handler_err)) => {
                let outcome = self.persist_failure(task, &mut step, handler_err, correlation_id).await?;
                Ok(outcome)
            }
            Err(_elapsed) => {
                let outcome = self
                    .persist_failure(task, &mut step, HandlerError::timeout(), correlation_id)
                    .await?;
                Ok(outcome)
            }
        }
    }

    async fn load_parent_results(&self, graph: &StepGraph, step: &Step) -> CoreResult<HashMap<String, Value>> {
        let mut out = HashMap::new();
        for parent_id in graph.parents(step.step_id) {
            let parent = self.store.reload_step(*parent_id).await?;
            out.insert(parent.name.clone(), parent.results.clone().unwrap_or(Value::Null));
        }
        Ok(out)
    }

    async fn persist_success(
        &self,
        task: &Task,
        step: &mut Step,
        result: Value,
        correlation_id: Uuid,
    ) -> CoreResult<()> {
        step.processed = true;
        step.in_process = false;
        step.processed_at = Some(Utc::now());
        step.results = Some(result);
        step.current_state = StepState::Complete;

        self.store
            .transaction(Box::new({
                let step = step.clone();
                move |txn| {
                    txn.save_step(&step);
                    txn.append_transition(
                        step.step_id.0,
                        Some(StepState::InProgress.to_string()),
                        StepState::Complete.to_string(),
                        None,
                    );
                    Ok(())
                }
            }))
            .await?;

        self.event_sink.emit(Event::Step {
            name: StepEventName::Completed,
            step_id: step.step_id,
            task_id: task.task_id,
            correlation_id,
            payload: step.results.clone().unwrap_or(Value::Null),
        });

        Ok(())
    }

    /// Returns the outcome the caller should report: `Retrying` or
    /// `PermanentlyFailed` depending on `err` and the step's remaining
    /// retry budget (spec §4.4.3).
    async fn persist_failure(
        &self,
        task: &Task,
        step: &mut Step,
        err: HandlerError,
        correlation_id: Uuid,
    ) -> CoreResult<StepOutcome> {
        step.attempts += 1;
        step.last_attempted_at = Some(Utc::now());
        step.in_process = false;
        step.processed = false;
        step.current_state = StepState::Error;

        let (error_payload, retry_after, permanent) = match &err {
            HandlerError::Retryable { message, retry_after_seconds } => {
                (json!({"error": message, "class": "retryable"}), *retry_after_seconds, false)
            }
            HandlerError::Permanent { error_code, message } => {
                step.retryable = false;
                step.attempts = step.attempts.max(step.retry_limit);
                (json!({"error": message, "class": "permanent", "error_code": error_code}), None, true)
            }
        };
        step.results = Some(error_payload);

        let budget_exhausted = step.retry_budget_exhausted() || !step.retryable;
        let decision = if permanent || budget_exhausted {
            None
        } else {
            Some(self.backoff.next_attempt_at(step.attempts, retry_after, Utc::now())?)
        };
        if let Some(decision) = &decision {
            step.backoff_until = Some(decision.at);
        }
        let outcome = match &decision {
            None => StepOutcome::PermanentlyFailed { step_id: step.step_id },
            Some(decision) => StepOutcome::Retrying { step_id: step.step_id, next_attempt_at: decision.at },
        };

        self.store
            .transaction(Box::new({
                let step = step.clone();
                move |txn| {
                    txn.save_step(&step);
                    txn.append_transition(
                        step.step_id.0,
                        Some(StepState::InProgress.to_string()),
                        StepState::Error.to_string(),
                        None,
                    );
                    Ok(())
                }
            }))
            .await?;

        self.event_sink.emit(Event::Step {
            name: StepEventName::Failed,
            step_id: step.step_id,
            task_id: task.task_id,
            correlation_id,
            payload: step.results.clone().unwrap_or(Value::Null),
        });

        // Spec §4.1: `error -> pending` ("retry armed"). A step that will be
        // retried does not linger in `error` — it is immediately armed so
        // invariant #7 (viable iff `pending`, backoff elapsed) can hold the
        // next time it is eligible, without waiting for a separate sweep.
        if let Some(decision) = decision {
            self.store
                .transaction(Box::new({
                    let step_id = step.step_id.0;
                    move |txn| {
                        txn.append_transition(
                            step_id,
                            Some(StepState::Error.to_string()),
                            StepState::Pending.to_string(),
                            None,
                        );
                        Ok(())
                    }
                }))
                .await?;
            step.current_state = StepState::Pending;

            self.event_sink.emit(Event::Step {
                name: StepEventName::Backoff,
                step_id: step.step_id,
                task_id: task.task_id,
                correlation_id,
                payload: json!({
                    "type": decision.kind,
                    "seconds": decision.seconds,
                    "attempt": step.attempts,
                }),
            });
            self.event_sink.emit(Event::Step {
                name: StepEventName::RetryRequested,
                step_id: step.step_id,
                task_id: task.task_id,
                correlation_id,
                payload: json!({"backoff_until": decision.at}),
            });
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{HandlerResult, NullEventSink};
    use crate::testing::{task_with_linear_steps, InMemoryStore, RecordingEventSink};
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl crate::ports::StepHandler for EchoHandler {
        async fn handle(
            &self,
            _task_context: &Value,
            _parent_results: &HashMap<String, Value>,
            step: &Step,
        ) -> HandlerResult {
            Ok(json!({"handled": step.name}))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl crate::ports::StepHandler for FailingHandler {
        async fn handle(
            &self,
            _task_context: &Value,
            _parent_results: &HashMap<String, Value>,
            _step: &Step,
        ) -> HandlerResult {
            Err(HandlerError::permanent("boom", "always fails"))
        }
    }

    struct RetryableHandler;

    #[async_trait]
    impl crate::ports::StepHandler for RetryableHandler {
        async fn handle(
            &self,
            _task_context: &Value,
            _parent_results: &HashMap<String, Value>,
            _step: &Step,
        ) -> HandlerResult {
            Err(HandlerError::retryable_with_hint("try again", 5))
        }
    }

    struct Registry(Arc<dyn crate::ports::StepHandler>);

    impl HandlerRegistry for Registry {
        fn get(&self, _name: &str) -> Option<Arc<dyn crate::ports::StepHandler>> {
            Some(self.0.clone())
        }
    }

    #[tokio::test]
    async fn successful_step_is_marked_complete() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 1).await;
        let task = store.reload_task(task_id).await.unwrap();
        let graph = store.load_step_graph(task_id).await.unwrap();
        let step = store.reload_step(ids[0]).await.unwrap();

        let resolver = Arc::new(DependencyResolver::new(store.clone(), Arc::new(NullEventSink)));
        let executor = StepExecutor::new(
            store.clone(),
            Arc::new(Registry(Arc::new(EchoHandler))),
            Arc::new(NullEventSink),
            resolver,
            BackoffPolicy::default(),
            ConcurrencyConfig::default(),
            TimeoutConfig::default(),
        );

        let result = executor
            .execute(&task, &graph, vec![step], Uuid::new_v4(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.outcomes.len(), 1);
        assert!(matches!(result.outcomes[0], StepOutcome::Completed { .. }));
        let persisted = store.reload_step(ids[0]).await.unwrap();
        assert_eq!(persisted.current_state, StepState::Complete);
        assert!(persisted.processed);
    }

    #[tokio::test]
    async fn permanent_failure_exhausts_retry_budget() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 1).await;
        let task = store.reload_task(task_id).await.unwrap();
        let graph = store.load_step_graph(task_id).await.unwrap();
        let step = store.reload_step(ids[0]).await.unwrap();

        let resolver = Arc::new(DependencyResolver::new(store.clone(), Arc::new(NullEventSink)));
        let executor = StepExecutor::new(
            store.clone(),
            Arc::new(Registry(Arc::new(FailingHandler))),
            Arc::new(NullEventSink),
            resolver,
            BackoffPolicy::default(),
            ConcurrencyConfig::default(),
            TimeoutConfig::default(),
        );

        let result = executor
            .execute(&task, &graph, vec![step], Uuid::new_v4(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(result.outcomes[0], StepOutcome::PermanentlyFailed { .. }));
        let persisted = store.reload_step(ids[0]).await.unwrap();
        assert_eq!(persisted.current_state, StepState::Error);
        assert!(persisted.retry_budget_exhausted());
        assert!(!persisted.retryable);
    }

    #[tokio::test]
    async fn cancelled_token_skips_unstarted_steps() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 2).await;
        let task = store.reload_task(task_id).await.unwrap();
        let graph = store.load_step_graph(task_id).await.unwrap();
        let step = store.reload_step(ids[0]).await.unwrap();

        let resolver = Arc::new(DependencyResolver::new(store.clone(), Arc::new(NullEventSink)));
        let executor = StepExecutor::new(
            store.clone(),
            Arc::new(Registry(Arc::new(EchoHandler))),
            Arc::new(NullEventSink),
            resolver,
            BackoffPolicy::default(),
            ConcurrencyConfig {
                min_concurrent_steps: 1,
                max_concurrent_steps: 1,
                ..Default::default()
            },
            TimeoutConfig::default(),
        );

        let token = CancellationToken::new();
        token.cancel();

        let result = executor
            .execute(&task, &graph, vec![step], Uuid::new_v4(), token)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(matches!(result.outcomes[0], StepOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn retryable_failure_arms_step_back_to_pending_with_backoff() {
        let store = Arc::new(InMemoryStore::new());
        let (task_id, ids) = task_with_linear_steps(&store, 1).await;
        let task = store.reload_task(task_id).await.unwrap();
        let graph = store.load_step_graph(task_id).await.unwrap();
        let step = store.reload_step(ids[0]).await.unwrap();

        let event_sink = Arc::new(RecordingEventSink::new());
        let resolver = Arc::new(DependencyResolver::new(store.clone(), event_sink.clone()));
        let executor = StepExecutor::new(
            store.clone(),
            Arc::new(Registry(Arc::new(RetryableHandler))),
            event_sink.clone(),
            resolver,
            BackoffPolicy::default(),
            ConcurrencyConfig::default(),
            TimeoutConfig::default(),
        );

        let result = executor
            .execute(&task, &graph, vec![step], Uuid::new_v4(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(result.outcomes[0], StepOutcome::Retrying { .. }));

        let persisted = store.reload_step(ids[0]).await.unwrap();
        assert_eq!(persisted.current_state, StepState::Pending);
        assert!(persisted.backoff_until.is_some());
        assert!(!persisted.retry_budget_exhausted());

        let events = event_sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Step { name: StepEventName::Backoff, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Step { name: StepEventName::RetryRequested, .. }
        )));

        let backoff_event = events
            .iter()
            .find(|e| matches!(e, Event::Step { name: StepEventName::Backoff, .. }))
            .unwrap();
        if let Event::Step { payload, .. } = backoff_event {
            assert_eq!(payload["type"], "server_requested");
            assert_eq!(payload["seconds"], 5);
            assert_eq!(payload["attempt"], 1);
        }
    }
}
