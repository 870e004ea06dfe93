use std::collections::{HashMap, HashSet};

use crate::error::GraphCorrupted;
use crate::model::{StepId, TaskId};

/// Per-task dependency graph view (spec §3).
///
/// Holds the one-way parents-of adjacency list plus a derived children-of
/// view and a memoized level ordering, computed once at construction
/// (spec §4.2: "dependency levels are a cached view computed once from the
/// graph", §9 Design Notes on the parents-of/children-of split).
#[derive(Debug, Clone)]
pub struct StepGraph {
    task_id: TaskId,
    parents: HashMap<StepId, Vec<StepId>>,
    children: HashMap<StepId, Vec<StepId>>,
    /// steps_by_level[0] has no parents; steps_by_level[n] depends (directly
    /// or transitively) only on steps in levels < n.
    levels: Vec<Vec<StepId>>,
}

impl StepGraph {
    /// Build a graph from a task's steps and their declared parent ids.
    /// Enforces acyclicity and referential integrity (spec §3: "must be a
    /// DAG; acyclicity enforced at task creation").
    pub fn build(
        task_id: TaskId,
        parents: HashMap<StepId, Vec<StepId>>,
    ) -> Result<Self, GraphCorrupted> {
        let known: HashSet<StepId> = parents.keys().copied().collect();
        for (step_id, parent_ids) in &parents {
            for parent_id in parent_ids {
                if !known.contains(parent_id) {
                    return Err(GraphCorrupted::DanglingParent {
                        task_id,
                        step_id: *step_id,
                        parent_id: *parent_id,
                    });
                }
            }
        }

        let mut children: HashMap<StepId, Vec<StepId>> = HashMap::new();
        for step_id in &known {
            children.entry(*step_id).or_default();
        }
        for (step_id, parent_ids) in &parents {
            for parent_id in parent_ids {
                children.entry(*parent_id).or_default().push(*step_id);
            }
        }

        let levels = topological_levels(task_id, &known, &parents)?;

        Ok(Self {
            task_id,
            parents,
            children,
            levels,
        })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn parents(&self, step_id: StepId) -> &[StepId] {
        self.parents.get(&step_id).map_or(&[], Vec::as_slice)
    }

    pub fn children(&self, step_id: StepId) -> &[StepId] {
        self.children.get(&step_id).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, step_id: StepId) -> bool {
        self.parents.contains_key(&step_id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.parents.keys().copied()
    }

    /// Steps grouped by dependency level, level 0 first (spec §4.2).
    pub fn levels(&self) -> &[Vec<StepId>] {
        &self.levels
    }
}

/// Kahn's algorithm, grouping nodes into levels by successive removal of
/// zero-in-degree nodes. Detects cycles as leftover nodes.
fn topological_levels(
    task_id: TaskId,
    known: &HashSet<StepId>,
    parents: &HashMap<StepId, Vec<StepId>>,
) -> Result<Vec<Vec<StepId>>, GraphCorrupted> {
    let mut remaining_parent_count: HashMap<StepId, usize> = known
        .iter()
        .map(|id| (*id, parents.get(id).map_or(0, Vec::len)))
        .collect();

    let mut children: HashMap<StepId, Vec<StepId>> = HashMap::new();
    for (step_id, parent_ids) in parents {
        for parent_id in parent_ids {
            children.entry(*parent_id).or_default().push(*step_id);
        }
    }

    let mut levels = Vec::new();
    let mut resolved = 0usize;

    let mut frontier: Vec<StepId> = remaining_parent_count
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    frontier.sort_by_key(|id| id.0);

    while !frontier.is_empty() {
        resolved += frontier.len();
        let mut next_frontier = Vec::new();
        for step_id in &frontier {
            for child in children.get(step_id).into_iter().flatten() {
                let count = remaining_parent_count.get_mut(child).expect("child is known");
                *count -= 1;
                if *count == 0 {
                    next_frontier.push(*child);
                }
            }
        }
        levels.push(frontier);
        next_frontier.sort_by_key(|id| id.0);
        frontier = next_frontier;
    }

    if resolved != known.len() {
        let stuck = known
            .iter()
            .find(|id| remaining_parent_count.get(id).copied().unwrap_or(0) > 0)
            .copied()
            .expect("at least one unresolved node when counts mismatch");
        return Err(GraphCorrupted::Cycle {
            task_id,
            step_id: stuck,
        });
    }

    Ok(levels)
}
