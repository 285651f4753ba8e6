use crate::types::{Task, TaskStatus};
use chrono::Utc;
use ensemble_core::{EnsembleError, EnsembleResult};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// A priority queue of tasks with dependency gating.
///
/// Waiting tasks are kept in descending priority order; equal priorities keep
/// insertion order. A task leaves the queue only through [`next_ready`]
/// (which moves it to `assigned`) or cancellation, so no task ever re-enters
/// `pending` once dequeued.
///
/// [`next_ready`]: TaskQueue::next_ready
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: HashMap<String, Task>,
    /// Insertion order of every known task.
    order: Vec<String>,
    /// Ids still waiting to be dequeued, highest priority first.
    waiting: Vec<String>,
    completed: HashSet<String>,
}

impl TaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending task. Duplicate ids are rejected.
    pub fn add(&mut self, task: Task) -> EnsembleResult<String> {
        if self.tasks.contains_key(&task.task_id) {
            return Err(EnsembleError::Crew(format!(
                "Task '{}' already exists",
                task.task_id
            )));
        }
        if task.status != TaskStatus::Pending {
            return Err(EnsembleError::Crew(format!(
                "Task '{}' must be pending to be queued (is {})",
                task.task_id, task.status
            )));
        }

        let id = task.task_id.clone();
        let priority = task.priority;
        let position = self
            .waiting
            .iter()
            .position(|queued| self.tasks.get(queued).is_some_and(|t| t.priority < priority))
            .unwrap_or(self.waiting.len());
        self.waiting.insert(position, id.clone());
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), task);

        debug!(task_id = %id, priority, "Added task to queue");
        Ok(id)
    }

    /// Dequeue the highest-priority task whose dependencies are all completed.
    ///
    /// The returned copy is already marked `assigned`. Waiting tasks whose
    /// dependencies can never complete are cancelled first, so a queue that
    /// returns `None` while non-empty is only waiting on running work.
    pub fn next_ready(&mut self) -> Option<Task> {
        self.cancel_blocked();

        let position = self.waiting.iter().position(|id| {
            self.tasks
                .get(id)
                .is_some_and(|t| t.is_ready(&self.completed))
        })?;
        let id = self.waiting.remove(position);
        let task = self.tasks.get_mut(&id)?;
        task.status = TaskStatus::Assigned;
        Some(task.clone())
    }

    /// Cancel waiting tasks that depend on a failed, cancelled or unknown task.
    ///
    /// Runs to a fixpoint so whole dependency chains are cancelled at once.
    /// Returns the ids that were cancelled.
    pub fn cancel_blocked(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        loop {
            let blocked: Vec<(String, String)> = self
                .waiting
                .iter()
                .filter_map(|id| {
                    let task = self.tasks.get(id)?;
                    task.dependencies.iter().find_map(|dep| {
                        match self.tasks.get(dep).map(|d| d.status) {
                            None => Some((id.clone(), format!("unknown dependency '{dep}'"))),
                            Some(TaskStatus::Failed) => {
                                Some((id.clone(), format!("dependency '{dep}' failed")))
                            }
                            Some(TaskStatus::Cancelled) => {
                                Some((id.clone(), format!("dependency '{dep}' was cancelled")))
                            }
                            Some(_) => None,
                        }
                    })
                })
                .collect();

            if blocked.is_empty() {
                return cancelled;
            }

            for (id, reason) in blocked {
                warn!(task_id = %id, reason = %reason, "Cancelling blocked task");
                if self.cancel(&id, &reason).is_ok() {
                    cancelled.push(id);
                }
            }
        }
    }

    /// Mark an assigned task as started by `member`.
    pub fn mark_in_progress(&mut self, id: &str, member: &str) -> EnsembleResult<()> {
        let task = self.transition(id, TaskStatus::InProgress)?;
        task.assigned_to = Some(member.to_string());
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a running task as completed with its result.
    pub fn mark_completed(&mut self, id: &str, result: String) -> EnsembleResult<()> {
        let task = self.transition(id, TaskStatus::Completed)?;
        task.result = Some(result);
        task.completed_at = Some(Utc::now());
        self.completed.insert(id.to_string());
        Ok(())
    }

    /// Mark an assigned or running task as failed.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> EnsembleResult<()> {
        let task = self.transition(id, TaskStatus::Failed)?;
        task.error = Some(error.into());
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Cancel a non-terminal task, removing it from the waiting list.
    pub fn cancel(&mut self, id: &str, reason: &str) -> EnsembleResult<()> {
        let task = self.transition(id, TaskStatus::Cancelled)?;
        task.error = Some(reason.to_string());
        task.completed_at = Some(Utc::now());
        self.waiting.retain(|queued| queued != id);
        Ok(())
    }

    /// Cancel every task still waiting in the queue. Returns the cancelled ids.
    pub fn cancel_waiting(&mut self, reason: &str) -> Vec<String> {
        let ids = std::mem::take(&mut self.waiting);
        for id in &ids {
            if let Some(task) = self.tasks.get_mut(id) {
                task.status = TaskStatus::Cancelled;
                task.error = Some(reason.to_string());
                task.completed_at = Some(Utc::now());
            }
        }
        ids
    }

    fn transition(&mut self, id: &str, next: TaskStatus) -> EnsembleResult<&mut Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| EnsembleError::TaskNotFound(id.to_string()))?;
        if !task.status.can_transition_to(next) {
            return Err(EnsembleError::Crew(format!(
                "Illegal transition for task '{id}': {} -> {next}",
                task.status
            )));
        }
        task.status = next;
        Ok(task)
    }

    /// Look up a task.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Update free-form metadata on a task.
    pub fn set_metadata(
        &mut self,
        id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> EnsembleResult<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| EnsembleError::TaskNotFound(id.to_string()))?;
        task.metadata.insert(key.into(), value);
        Ok(())
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    /// Whether no task is waiting to be dequeued.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Number of tasks waiting to be dequeued.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Tasks still pending, queued or not.
    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Tasks that completed successfully.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Every task ever added.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Check if all tasks are in a terminal state.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Check for cycles in the dependency graph.
    /// Unknown dependency ids are ignored here; they are cancelled at dequeue time.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        for id in &self.order {
            if self.dfs_cycle(id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}
