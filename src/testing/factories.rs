use serde_json::Value;

use crate::model::{Step, StepId, Task, TaskId};

/// Builds a Task and a chain of N linearly-dependent steps, inserting both
/// into `store` and returning the task id plus each step id in order.
pub struct TaskFactory {
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub context: Value,
}

impl Default for TaskFactory {
    fn default() -> Self {
        Self {
            name: "test_task".into(),
            namespace: "test".into(),
            version: "1.0.0".into(),
            context: Value::Null,
        }
    }
}

impl TaskFactory {
    pub fn build(&self) -> Task {
        Task::new(
            self.name.clone(),
            self.namespace.clone(),
            self.version.clone(),
            self.context.clone(),
        )
    }
}

/// Convenience: a task plus `n` steps named `step_0 .. step_{n-1}`, each
/// depending on the previous one.
pub async fn task_with_linear_steps(
    store: &super::InMemoryStore,
    n: usize,
) -> (TaskId, Vec<StepId>) {
    let task = TaskFactory::default().build();
    let task_id = task.task_id;
    store.insert_task(task).await;

    let mut ids = Vec::with_capacity(n);
    let mut prev: Option<StepId> = None;
    for i in 0..n {
        let mut step = Step::new(task_id, format!("step_{i}"), "noop");
        if let Some(p) = prev {
            step = step.with_parents([p]);
        }
        let id = step.step_id;
        store.insert_step(step).await;
        ids.push(id);
        prev = Some(id);
    }

    (task_id, ids)
}
