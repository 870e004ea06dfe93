//! DependencyResolver (spec §4.2): viable-step discovery over the cached
//! graph and current persistent state.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::model::{Step, StepGraph, StepId};
use crate::ports::{Event, EventSink, Store, WorkflowEventName};

/// Outcome of resolving a single step against invariant #7 and the blocked
/// parent rule (spec §4.2 edge cases, §9 open question on cancelled
/// parents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDisposition {
    Viable,
    /// Not ready: still `in_progress`/`processed`, future `backoff_until`,
    /// or a parent not yet terminal-success.
    NotReady,
    /// A parent is `cancelled` and this step is not `skippable`.
    Blocked,
}

pub struct DependencyResolver {
    store: Arc<dyn Store>,
    event_sink: Arc<dyn EventSink>,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn Store>, event_sink: Arc<dyn EventSink>) -> Self {
        Self { store, event_sink }
    }

    /// One linear scan over `graph`'s steps (spec §4.2 Algorithm):
    /// 1. discard already-processed/in-process steps,
    /// 2. re-read each remaining step's state from the Store,
    /// 3. include iff invariant #7 holds.
    ///
    /// Returned in dependency-level order, tie-broken by name within a
    /// level for determinism (spec §4.2).
    pub async fn resolve(
        &self,
        graph: &StepGraph,
        correlation_id: Uuid,
    ) -> CoreResult<Vec<Step>> {
        let mut viable = Vec::new();
        let mut blocked = Vec::new();
        let mut checked = 0usize;
        let now = Utc::now();

        for level in graph.levels() {
            // Steps within a level are candidates together; ties broken by
            // name below, but the scan itself can be a single pass per
            // level since a level's steps share no intra-level dependency.
            let mut level_steps: Vec<Step> = Vec::new();
            for step_id in level {
                let step = self.store.reload_step(*step_id).await?;
                level_steps.push(step);
            }
            level_steps.sort_by(|a, b| a.name.cmp(&b.name));

            for step in level_steps {
                checked += 1;
                if step.processed || step.in_process {
                    continue;
                }

                match self.disposition(&step, graph, now).await? {
                    StepDisposition::Viable => viable.push(step),
                    StepDisposition::Blocked => blocked.push(step.step_id),
                    StepDisposition::NotReady => {}
                }
            }
        }

        if viable.is_empty() {
            self.event_sink.emit(Event::Workflow {
                name: WorkflowEventName::NoViableSteps,
                task_id: graph.task_id(),
                correlation_id,
                payload: serde_json::json!({"checked": checked, "blocked": blocked.len()}),
            });
        } else {
            self.event_sink.emit(Event::Workflow {
                name: WorkflowEventName::ViableStepsDiscovered,
                task_id: graph.task_id(),
                correlation_id,
                payload: serde_json::json!({
                    "count": viable.len(),
                    "step_ids": viable.iter().map(|s| s.step_id.to_string()).collect::<Vec<_>>(),
                }),
            });
        }

        debug!(
            task_id = %graph.task_id(),
            checked,
            viable = viable.len(),
            blocked = blocked.len(),
            "dependency resolution pass complete"
        );

        Ok(viable)
    }

    /// Classify a single step already known not to be processed/in-process.
    pub async fn disposition(
        &self,
        step: &Step,
        graph: &StepGraph,
        now: chrono::DateTime<Utc>,
    ) -> CoreResult<StepDisposition> {
        if !step.self_viable(now) {
            return Ok(StepDisposition::NotReady);
        }

        let mut any_cancelled_parent = false;
        for parent_id in graph.parents(step.step_id) {
            let parent = self.store.reload_step(*parent_id).await?;
            if parent.current_state == crate::model::StepState::Cancelled {
                any_cancelled_parent = true;
                continue;
            }
            if !parent.current_state.is_terminal_success() {
                return Ok(StepDisposition::NotReady);
            }
        }

        if any_cancelled_parent && !step.skippable {
            return Ok(StepDisposition::Blocked);
        }

        Ok(StepDisposition::Viable)
    }

    /// Are all steps with an unresolved parent blocked, rather than merely
    /// waiting? Used by the finalizer to distinguish "stuck forever" from
    /// "still progressing" (spec §4.5).
    pub async fn any_step_blocked(&self, graph: &StepGraph, steps: &[Step]) -> CoreResult<bool> {
        let now = Utc::now();
        for step in steps {
            if step.processed || step.in_process {
                continue;
            }
            if step.current_state != crate::model::StepState::Pending {
                continue;
            }
            if self.disposition(step, graph, now).await? == StepDisposition::Blocked {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[allow(dead_code)]
    pub(crate) fn step_ids_of(graph: &StepGraph) -> Vec<StepId> {
        graph.step_ids().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StepState, TaskId};
    use crate::ports::NullEventSink;
    use crate::testing::InMemoryStore;
    use std::collections::HashMap;

    async fn setup() -> (Arc<InMemoryStore>, DependencyResolver, TaskId, StepGraph, Vec<StepId>) {
        let store = Arc::new(InMemoryStore::new());
        let task_id = TaskId::new();
        let a = Step::new(task_id, "a", "h");
        let b = Step::new(task_id, "b", "h").with_parents([a.step_id]);
        let c = Step::new(task_id, "c", "h").with_parents([a.step_id]);
        let d = Step::new(task_id, "d", "h").with_parents([b.step_id, c.step_id]);

        let mut parents = HashMap::new();
        parents.insert(a.step_id, vec![]);
        parents.insert(b.step_id, vec![a.step_id]);
        parents.insert(c.step_id, vec![a.step_id]);
        parents.insert(d.step_id, vec![b.step_id, c.step_id]);

        let ids = vec![a.step_id, b.step_id, c.step_id, d.step_id];
        for s in [a, b, c, d] {
            store.insert_step(s).await;
        }

        let graph = StepGraph::build(task_id, parents).unwrap();
        let resolver = DependencyResolver::new(store.clone(), Arc::new(NullEventSink));
        (store, resolver, task_id, graph, ids)
    }

    #[tokio::test]
    async fn only_root_step_is_viable_initially() {
        let (_store, resolver, _task_id, graph, ids) = setup().await;
        let viable = resolver.resolve(&graph, Uuid::new_v4()).await.unwrap();
        assert_eq!(viable.len(), 1);
        assert_eq!(viable[0].step_id, ids[0]);
    }

    #[tokio::test]
    async fn diamond_joins_become_viable_after_both_parents_done() {
        let (store, resolver, _task_id, graph, ids) = setup().await;
        store.mark_terminal_success(ids[0], StepState::Complete).await;

        let viable = resolver.resolve(&graph, Uuid::new_v4()).await.unwrap();
        let mut names: Vec<_> = viable.iter().map(|s| s.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["b", "c"]);

        store.mark_terminal_success(ids[1], StepState::Complete).await;
        store.mark_terminal_success(ids[2], StepState::Complete).await;
        let viable = resolver.resolve(&graph, Uuid::new_v4()).await.unwrap();
        assert_eq!(viable.len(), 1);
        assert_eq!(viable[0].step_id, ids[3]);
    }

    #[tokio::test]
    async fn cancelled_parent_blocks_non_skippable_child() {
        let (store, resolver, _task_id, graph, ids) = setup().await;
        store.mark_terminal_success(ids[0], StepState::Cancelled).await;

        let b = store.reload_step(ids[1]).await.unwrap();
        let disposition = resolver.disposition(&b, &graph, Utc::now()).await.unwrap();
        assert_eq!(disposition, StepDisposition::Blocked);
    }

    #[tokio::test]
    async fn cancelled_parent_does_not_block_skippable_child() {
        let (store, resolver, task_id, _graph, ids) = setup().await;
        store.mark_terminal_success(ids[0], StepState::Cancelled).await;

        let mut skippable = Step::new(task_id, "skippable", "h").with_parents([ids[0]]);
        skippable.skippable = true;
        let skip_id = skippable.step_id;
        store.insert_step(skippable).await;

        let mut parents = HashMap::new();
        parents.insert(ids[0], vec![]);
        parents.insert(skip_id, vec![ids[0]]);
        let graph = StepGraph::build(task_id, parents).unwrap();

        let s = store.reload_step(skip_id).await.unwrap();
        let disposition = resolver.disposition(&s, &graph, Utc::now()).await.unwrap();
        assert_eq!(disposition, StepDisposition::Viable);
    }

    #[tokio::test]
    async fn future_backoff_makes_step_not_ready() {
        let (store, resolver, task_id, _graph, _ids) = setup().await;
        let mut step = Step::new(task_id, "delayed", "h");
        step.backoff_until = Some(Utc::now() + chrono::Duration::seconds(60));
        let id = step.step_id;
        store.insert_step(step).await;

        let mut parents = HashMap::new();
        parents.insert(id, vec![]);
        let graph = StepGraph::build(task_id, parents).unwrap();

        let s = store.reload_step(id).await.unwrap();
        let disposition = resolver.disposition(&s, &graph, Utc::now()).await.unwrap();
        assert_eq!(disposition, StepDisposition::NotReady);
    }
}
