use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Coordination pattern an orchestrator implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationStrategy {
    /// Lightweight point-to-point handoffs.
    Swarm,
    /// Role-based teams sharing a task queue.
    Crew,
    /// DAG workflows.
    Graph,
    /// Anything else the host plugs in.
    Custom,
}

impl std::fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationStrategy::Swarm => write!(f, "swarm"),
            CoordinationStrategy::Crew => write!(f, "crew"),
            CoordinationStrategy::Graph => write!(f, "graph"),
            CoordinationStrategy::Custom => write!(f, "custom"),
        }
    }
}

/// Role of an agent within a crew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrewRole {
    /// Assigns work in hierarchical mode; never executes tasks itself.
    Manager,
    /// Executes tasks.
    Worker,
    /// Reviews work; not picked for task execution.
    Reviewer,
    /// Domain expert that executes tasks like a worker.
    Specialist,
}

impl CrewRole {
    /// Whether members with this role are picked to execute tasks.
    pub fn executes_tasks(self) -> bool {
        matches!(self, CrewRole::Worker | CrewRole::Specialist)
    }
}

impl std::fmt::Display for CrewRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrewRole::Manager => write!(f, "manager"),
            CrewRole::Worker => write!(f, "worker"),
            CrewRole::Reviewer => write!(f, "reviewer"),
            CrewRole::Specialist => write!(f, "specialist"),
        }
    }
}

/// How a crew drains its task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One task at a time, in priority order among eligible tasks.
    Sequential,
    /// Up to one running task per crew member.
    Parallel,
    /// The manager hands each eligible task to an available worker.
    Hierarchical,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

/// Status of a task in a crew's queue.
///
/// Transitions only move forward: `pending → assigned → in_progress →
/// completed | failed`, with `cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or a free member.
    Pending,
    /// Handed to a member.
    Assigned,
    /// Running.
    InProgress,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Abandoned, e.g. because a dependency failed.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Assigned) => true,
            (TaskStatus::Assigned, TaskStatus::InProgress | TaskStatus::Failed) => true,
            (TaskStatus::InProgress, TaskStatus::Completed | TaskStatus::Failed) => true,
            (current, TaskStatus::Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of crew work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id; a UUID unless set with [`Task::with_id`].
    pub task_id: String,
    /// What to do; passed to the agent as input.
    pub description: String,
    /// Member that executed (or is executing) the task.
    pub assigned_to: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Agent output once completed.
    pub result: Option<String>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Tasks that must be `completed` before this one is eligible.
    pub dependencies: Vec<String>,
    /// Free-form metadata; crews record `assigned_by` here.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Higher runs first among eligible tasks.
    #[serde(default)]
    pub priority: i32,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When it started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A pending task with a random id.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            description: description.into(),
            assigned_to: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Use an explicit id.
    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Set the tasks this one waits for.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Pending and every dependency is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}
