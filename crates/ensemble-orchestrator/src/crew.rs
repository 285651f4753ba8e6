use crate::config::CrewConfig;
use crate::coordinator::Coordinator;
use crate::task_queue::TaskQueue;
use crate::types::{CrewRole, ExecutionMode, Task, TaskStatus};
use chrono::{DateTime, Utc};
use ensemble_core::{
    invoke_agent, Agent, AgentContext, CancellationToken, EnsembleError, EnsembleResult,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A crew member wrapping an agent with a role and a concurrency cap.
pub struct CrewMember {
    /// Member id, unique within the crew.
    pub agent_id: String,
    /// Agent that runs this member's tasks.
    pub agent: Arc<dyn Agent>,
    /// Role in the crew.
    pub role: CrewRole,
    /// Capability tags.
    pub capabilities: Vec<String>,
    /// Upper bound on tasks running at once; at least 1.
    pub max_concurrent_tasks: usize,
    active_tasks: AtomicUsize,
}

impl CrewMember {
    /// Number of tasks this member is currently running.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Whether another task may start on this member.
    pub fn has_capacity(&self) -> bool {
        self.active_tasks() < self.max_concurrent_tasks
    }
}

impl std::fmt::Debug for CrewMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrewMember")
            .field("agent_id", &self.agent_id)
            .field("role", &self.role)
            .field("capabilities", &self.capabilities)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("active_tasks", &self.active_tasks())
            .finish_non_exhaustive()
    }
}

/// A claimed execution slot on a member; released on drop.
struct Reservation(Arc<CrewMember>);

impl Reservation {
    fn try_claim(member: &Arc<CrewMember>) -> Option<Self> {
        member
            .active_tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < member.max_concurrent_tasks).then_some(active + 1)
            })
            .ok()
            .map(|_| Self(member.clone()))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.0.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Overall outcome of one crew execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrewStatus {
    /// Every task completed.
    Success,
    /// Some tasks completed, others failed or were cancelled.
    PartialFailure,
    /// No task completed.
    Failed,
}

/// Per-task line of a [`CrewReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task id.
    pub task_id: String,
    /// Task description.
    pub description: String,
    /// Final status.
    pub status: TaskStatus,
    /// Agent output for completed tasks.
    pub result: Option<String>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Member that ran the task.
    pub assigned_to: Option<String>,
}

impl From<&Task> for TaskOutcome {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            description: task.description.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            assigned_to: task.assigned_to.clone(),
        }
    }
}

/// Summary of one [`Crew::execute`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewReport {
    /// Crew name.
    pub crew: String,
    /// Mode the crew ran in.
    pub mode: ExecutionMode,
    /// One line per task, in insertion order.
    pub tasks: Vec<TaskOutcome>,
    /// Overall outcome.
    pub status: CrewStatus,
    /// When execution started.
    pub start_time: DateTime<Utc>,
    /// When execution finished.
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl CrewReport {
    /// Outcome for one task.
    pub fn task(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Everything a spawned task execution needs, detached from the crew borrow.
#[derive(Clone)]
struct TaskRunner {
    crew: String,
    queue: Arc<Mutex<TaskQueue>>,
    shared_memory: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    cancel: CancellationToken,
}

impl TaskRunner {
    async fn run(self, task: Task, slot: Reservation) {
        let member = slot.0.clone();
        if let Err(e) = self
            .queue
            .lock()
            .await
            .mark_in_progress(&task.task_id, &member.agent_id)
        {
            error!(task_id = %task.task_id, error = %e, "Could not start task");
            return;
        }

        info!(crew = %self.crew, task_id = %task.task_id, member = %member.agent_id, "Executing task");

        let memory = self.shared_memory.read().await.clone();
        let context = AgentContext::new(task.task_id.clone())
            .with_metadata("crew", serde_json::json!(self.crew))
            .with_metadata("task", serde_json::json!(task.task_id))
            .with_metadata("shared_memory", serde_json::Value::Object(memory.into_iter().collect()))
            .with_cancellation(self.cancel.clone());

        let outcome = invoke_agent(member.agent.as_ref(), &task.description, &context).await;
        drop(slot);

        let recorded = match outcome {
            Ok(output) => {
                let key = format!("task_{}_result", task.task_id);
                self.shared_memory
                    .write()
                    .await
                    .insert(key.clone(), serde_json::Value::String(output.clone()));
                debug!(crew = %self.crew, key = %key, "Updated shared memory");
                info!(crew = %self.crew, task_id = %task.task_id, "Task completed");
                self.queue.lock().await.mark_completed(&task.task_id, output)
            }
            Err(e) => {
                error!(crew = %self.crew, task_id = %task.task_id, error = %e, "Task failed");
                self.queue
                    .lock()
                    .await
                    .mark_failed(&task.task_id, e.to_string())
            }
        };
        if let Err(e) = recorded {
            error!(task_id = %task.task_id, error = %e, "Could not record task outcome");
        }
    }
}

/// A role-based team of agents draining a shared task queue.
pub struct Crew {
    name: String,
    config: CrewConfig,
    members: Vec<Arc<CrewMember>>,
    manager_id: Option<String>,
    queue: Arc<Mutex<TaskQueue>>,
    shared_memory: Arc<RwLock<HashMap<String, serde_json::Value>>>,
    history: RwLock<Vec<CrewReport>>,
    cancel: CancellationToken,
}

impl Crew {
    /// An empty crew with the default [`CrewConfig`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CrewConfig::default())
    }

    /// An empty crew with explicit polling settings.
    pub fn with_config(name: impl Into<String>, config: CrewConfig) -> Self {
        Self {
            name: name.into(),
            config,
            members: Vec::new(),
            manager_id: None,
            queue: Arc::new(Mutex::new(TaskQueue::new())),
            shared_memory: Arc::new(RwLock::new(HashMap::new())),
            history: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Crew name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member. A crew has at most one manager; re-adding an id replaces it.
    pub fn add_member<I, S>(
        &mut self,
        agent_id: impl Into<String>,
        agent: Arc<dyn Agent>,
        role: CrewRole,
        capabilities: I,
        max_concurrent_tasks: usize,
    ) -> EnsembleResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent_id = agent_id.into();
        if max_concurrent_tasks == 0 {
            return Err(EnsembleError::Crew(format!(
                "Member '{agent_id}' must allow at least one concurrent task"
            )));
        }
        if role == CrewRole::Manager
            && self
                .manager_id
                .as_deref()
                .is_some_and(|existing| existing != agent_id)
        {
            return Err(EnsembleError::Crew("Crew already has a manager".to_string()));
        }

        let member = Arc::new(CrewMember {
            agent_id: agent_id.clone(),
            agent,
            role,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_concurrent_tasks,
            active_tasks: AtomicUsize::new(0),
        });

        match self.members.iter_mut().find(|m| m.agent_id == agent_id) {
            Some(existing) => {
                if existing.role == CrewRole::Manager && role != CrewRole::Manager {
                    self.manager_id = None;
                }
                *existing = member;
            }
            None => self.members.push(member),
        }
        if role == CrewRole::Manager {
            self.manager_id = Some(agent_id.clone());
        }

        info!(crew = %self.name, agent_id = %agent_id, role = %role, "Added crew member");
        Ok(())
    }

    /// Add a member whose agent is resolved through the coordinator.
    pub async fn add_member_from<I, S>(
        &mut self,
        coordinator: &Coordinator,
        agent_id: &str,
        role: CrewRole,
        capabilities: I,
        max_concurrent_tasks: usize,
    ) -> EnsembleResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent = coordinator.require(agent_id).await?;
        self.add_member(agent_id, agent, role, capabilities, max_concurrent_tasks)
    }

    /// Queue a task. Returns its id.
    pub async fn add_task(&self, task: Task) -> EnsembleResult<String> {
        let id = self.queue.lock().await.add(task)?;
        info!(crew = %self.name, task_id = %id, "Added task to crew");
        Ok(id)
    }

    /// Members in the order they were added.
    pub fn members(&self) -> &[Arc<CrewMember>] {
        &self.members
    }

    /// Id of the manager, if the crew has one.
    pub fn manager_id(&self) -> Option<&str> {
        self.manager_id.as_deref()
    }

    /// Token that aborts every running task of this crew when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A snapshot of one queued task.
    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.queue.lock().await.get(task_id).cloned()
    }

    /// Read one shared memory entry.
    pub async fn get_shared_memory(&self, key: &str) -> Option<serde_json::Value> {
        self.shared_memory.read().await.get(key).cloned()
    }

    /// Copy of the whole shared memory.
    pub async fn shared_memory_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.shared_memory.read().await.clone()
    }

    /// Write one shared memory entry.
    pub async fn set_shared_memory(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        debug!(crew = %self.name, key = %key, "Updated shared memory");
        self.shared_memory.write().await.insert(key, value);
    }

    /// Reports of every past execution, oldest first.
    pub async fn execution_history(&self) -> Vec<CrewReport> {
        self.history.read().await.clone()
    }

    /// Run every queued task in the given mode and report the outcome.
    ///
    /// Structural problems are returned as errors before any task starts.
    /// Task failures never abort the run; they show up in the report.
    pub async fn execute(&self, mode: ExecutionMode) -> EnsembleResult<CrewReport> {
        self.check_structure(mode).await?;

        info!(crew = %self.name, mode = %mode, "Starting crew execution");
        let start_time = Utc::now();
        let started = Instant::now();

        match mode {
            ExecutionMode::Sequential => self.execute_sequential().await,
            ExecutionMode::Parallel => self.execute_parallel().await,
            ExecutionMode::Hierarchical => self.execute_hierarchical().await,
        }

        let tasks: Vec<TaskOutcome> = self
            .queue
            .lock()
            .await
            .all_tasks()
            .into_iter()
            .map(TaskOutcome::from)
            .collect();

        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let status = if completed == tasks.len() {
            CrewStatus::Success
        } else if completed == 0 {
            CrewStatus::Failed
        } else {
            CrewStatus::PartialFailure
        };

        let report = CrewReport {
            crew: self.name.clone(),
            mode,
            tasks,
            status,
            start_time,
            end_time: Utc::now(),
            duration: started.elapsed(),
        };
        info!(
            crew = %self.name,
            status = ?report.status,
            tasks = report.tasks.len(),
            completed,
            "Crew execution finished"
        );
        self.history.write().await.push(report.clone());
        Ok(report)
    }

    async fn check_structure(&self, mode: ExecutionMode) -> EnsembleResult<()> {
        if self.queue.lock().await.has_cycle() {
            return Err(EnsembleError::Crew(
                "Task dependencies contain a cycle".to_string(),
            ));
        }
        match mode {
            ExecutionMode::Hierarchical => {
                if self.manager_id.is_none() {
                    return Err(EnsembleError::Crew(
                        "Hierarchical execution requires a manager".to_string(),
                    ));
                }
                if !self.has_executors() {
                    return Err(EnsembleError::Crew(
                        "Hierarchical execution requires at least one worker or specialist"
                            .to_string(),
                    ));
                }
            }
            ExecutionMode::Parallel if self.members.is_empty() => {
                return Err(EnsembleError::Crew(
                    "Parallel execution requires at least one member".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    fn has_executors(&self) -> bool {
        self.members.iter().any(|m| m.role.executes_tasks())
    }

    /// First worker or specialist, in member order, with spare capacity.
    fn claim_executor(&self) -> Option<Reservation> {
        self.members
            .iter()
            .filter(|m| m.role.executes_tasks())
            .find_map(Reservation::try_claim)
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner {
            crew: self.name.clone(),
            queue: self.queue.clone(),
            shared_memory: self.shared_memory.clone(),
            cancel: self.cancel.clone(),
        }
    }

    async fn fail_unassignable(&self, task: &Task) {
        warn!(crew = %self.name, task_id = %task.task_id, "No available agent for task");
        if let Err(e) = self
            .queue
            .lock()
            .await
            .mark_failed(&task.task_id, "No available agent")
        {
            error!(task_id = %task.task_id, error = %e, "Could not fail task");
        }
    }

    /// Cancel whatever is still waiting once nothing is running to unblock it.
    async fn cancel_stalled(&self) {
        let cancelled = self
            .queue
            .lock()
            .await
            .cancel_waiting("Dependencies can never be satisfied");
        if !cancelled.is_empty() {
            warn!(crew = %self.name, tasks = ?cancelled, "Cancelled stalled tasks");
        }
    }

    async fn execute_sequential(&self) {
        let mut polled = false;
        loop {
            let next = self.queue.lock().await.next_ready();
            match next {
                Some(task) => {
                    polled = false;
                    match self.claim_executor() {
                        Some(slot) => self.runner().run(task, slot).await,
                        None => self.fail_unassignable(&task).await,
                    }
                }
                None => {
                    if self.queue.lock().await.is_empty() {
                        break;
                    }
                    if polled {
                        self.cancel_stalled().await;
                        break;
                    }
                    polled = true;
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
    }

    async fn execute_parallel(&self) {
        let slots = self.members.len();
        let has_executors = self.has_executors();
        let mut running = JoinSet::new();

        loop {
            while running.len() < slots {
                let slot = if has_executors {
                    match self.claim_executor() {
                        Some(slot) => Some(slot),
                        None => break,
                    }
                } else {
                    None
                };
                let Some(task) = self.queue.lock().await.next_ready() else {
                    break;
                };
                match slot {
                    Some(slot) => {
                        running.spawn(self.runner().run(task, slot));
                    }
                    None => self.fail_unassignable(&task).await,
                }
            }

            if running.is_empty() {
                if !self.queue.lock().await.is_empty() {
                    self.cancel_stalled().await;
                }
                break;
            }

            if let Some(Err(e)) = running.join_next().await {
                error!(crew = %self.name, error = %e, "Task execution panicked");
            }
        }
    }

    async fn execute_hierarchical(&self) {
        let manager = self.manager_id.clone().unwrap_or_default();
        loop {
            let Some(slot) = self.claim_executor() else {
                warn!(crew = %self.name, "No available worker, waiting");
                tokio::time::sleep(self.config.worker_wait()).await;
                continue;
            };

            let task = {
                let mut queue = self.queue.lock().await;
                let Some(task) = queue.next_ready() else {
                    let idle = queue.is_empty();
                    drop(queue);
                    if !idle {
                        self.cancel_stalled().await;
                    }
                    break;
                };
                if let Err(e) =
                    queue.set_metadata(&task.task_id, "assigned_by", serde_json::json!(manager))
                {
                    error!(task_id = %task.task_id, error = %e, "Could not record assignment");
                }
                task
            };

            debug!(
                crew = %self.name,
                manager = %manager,
                worker = %slot.0.agent_id,
                task_id = %task.task_id,
                "Manager assigned task"
            );
            self.runner().run(task, slot).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_core::agent_fn;

    fn echo(tag: &'static str) -> Arc<dyn Agent> {
        agent_fn(move |input, _ctx| async move { Ok(format!("{tag}: {input}")) })
    }

    fn failing() -> Arc<dyn Agent> {
        agent_fn(|_input, _ctx| async move { Err(EnsembleError::Agent("model refused".into())) })
    }

    fn fast_config() -> CrewConfig {
        CrewConfig {
            poll_interval_ms: 5,
            worker_wait_ms: 5,
        }
    }

    #[test]
    fn test_duplicate_manager_rejected() {
        let mut crew = Crew::new("editorial");
        crew.add_member("boss", echo("m"), CrewRole::Manager, ["plan"], 1)
            .unwrap();
        let err = crew
            .add_member("boss2", echo("m"), CrewRole::Manager, ["plan"], 1)
            .unwrap_err();
        assert_eq!(err.to_string(), "Crew error: Crew already has a manager");
        assert_eq!(crew.manager_id(), Some("boss"));
        assert_eq!(crew.members().len(), 1);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut crew = Crew::new("c");
        let err = crew
            .add_member("w", echo("w"), CrewRole::Worker, Vec::<String>::new(), 0)
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Crew(_)));
    }

    #[tokio::test]
    async fn test_add_member_from_coordinator() {
        let coord = Coordinator::new();
        coord
            .register("writer", echo("w"), ["writing"], HashMap::new())
            .await;
        let mut crew = Crew::new("c");
        crew.add_member_from(&coord, "writer", CrewRole::Worker, ["writing"], 1)
            .await
            .unwrap();
        let err = crew
            .add_member_from(&coord, "ghost", CrewRole::Worker, ["x"], 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sequential_shares_results() {
        let mut crew = Crew::with_config("writers", fast_config());
        crew.add_member(
            "writer",
            agent_fn(|input, ctx| async move {
                let memory = ctx.get("shared_memory").cloned().unwrap_or_default();
                let research = memory
                    .get("task_research_result")
                    .and_then(|v| v.as_str())
                    .unwrap_or("nothing")
                    .to_string();
                Ok(format!("{input} using [{research}]"))
            }),
            CrewRole::Worker,
            ["writing"],
            1,
        )
        .unwrap();

        crew.add_task(
            Task::new("write post")
                .with_id("post")
                .with_dependencies(["research"]),
        )
        .await
        .unwrap();
        crew.add_task(Task::new("research").with_id("research"))
            .await
            .unwrap();

        let report = crew.execute(ExecutionMode::Sequential).await.unwrap();
        assert_eq!(report.status, CrewStatus::Success);
        assert_eq!(
            report.task("post").unwrap().result.as_deref(),
            Some("write post using [research using [nothing]]")
        );
        assert_eq!(
            crew.get_shared_memory("task_post_result").await.unwrap(),
            "write post using [research using [nothing]]"
        );
        assert_eq!(crew.execution_history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let mut crew = Crew::with_config("c", fast_config());
        crew.add_member("bad", failing(), CrewRole::Specialist, Vec::<String>::new(), 1)
            .unwrap();
        crew.add_member("good", echo("ok"), CrewRole::Worker, Vec::<String>::new(), 1)
            .unwrap();

        crew.add_task(Task::new("first").with_id("a")).await.unwrap();
        crew.add_task(Task::new("after a").with_id("b").with_dependencies(["a"]))
            .await
            .unwrap();

        let report = crew.execute(ExecutionMode::Sequential).await.unwrap();
        // The specialist comes first in member order, so it takes the task and fails.
        let a = report.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.assigned_to.as_deref(), Some("bad"));
        assert!(a.error.as_deref().unwrap().contains("model refused"));
        assert_eq!(report.task("b").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(report.status, CrewStatus::Failed);
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let mut crew = Crew::with_config("c", fast_config());
        crew.add_member(
            "picky",
            agent_fn(|input, _ctx| async move {
                if input.contains("hard") {
                    Err(EnsembleError::Agent("too hard".into()))
                } else {
                    Ok("done".into())
                }
            }),
            CrewRole::Worker,
            Vec::<String>::new(),
            1,
        )
        .unwrap();
        crew.add_task(Task::new("easy").with_id("e")).await.unwrap();
        crew.add_task(Task::new("hard").with_id("h")).await.unwrap();

        let report = crew.execute(ExecutionMode::Sequential).await.unwrap();
        assert_eq!(report.status, CrewStatus::PartialFailure);
    }

    #[tokio::test]
    async fn test_no_executing_member_fails_tasks() {
        let mut crew = Crew::with_config("c", fast_config());
        crew.add_member("boss", echo("m"), CrewRole::Manager, Vec::<String>::new(), 1)
            .unwrap();
        crew.add_task(Task::new("orphan").with_id("o")).await.unwrap();

        let report = crew.execute(ExecutionMode::Sequential).await.unwrap();
        let task = report.task("o").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("No available agent"));
    }

    #[tokio::test]
    async fn test_parallel_runs_concurrently() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let agent: Arc<dyn Agent> = {
            let running = running.clone();
            let peak = peak.clone();
            agent_fn(move |input, _ctx| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(input)
                }
            })
        };

        let mut crew = Crew::with_config("c", fast_config());
        crew.add_member("w1", agent.clone(), CrewRole::Worker, Vec::<String>::new(), 1)
            .unwrap();
        crew.add_member("w2", agent, CrewRole::Worker, Vec::<String>::new(), 1)
            .unwrap();
        for i in 0..4 {
            crew.add_task(Task::new(format!("t{i}"))).await.unwrap();
        }

        let report = crew.execute(ExecutionMode::Parallel).await.unwrap();
        assert_eq!(report.status, CrewStatus::Success);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(crew.members().iter().all(|m| m.active_tasks() == 0));
    }

    #[tokio::test]
    async fn test_hierarchical_records_assignment() {
        let mut crew = Crew::with_config("c", fast_config());
        crew.add_member("boss", echo("m"), CrewRole::Manager, Vec::<String>::new(), 1)
            .unwrap();
        crew.add_member("dev", echo("dev"), CrewRole::Worker, Vec::<String>::new(), 1)
            .unwrap();
        crew.add_task(Task::new("build").with_id("b")).await.unwrap();

        let report = crew.execute(ExecutionMode::Hierarchical).await.unwrap();
        assert_eq!(report.status, CrewStatus::Success);
        assert_eq!(report.task("b").unwrap().assigned_to.as_deref(), Some("dev"));
        let task = crew.task("b").await.unwrap();
        assert_eq!(task.metadata["assigned_by"], "boss");
    }

    #[tokio::test]
    async fn test_structural_errors() {
        let mut crew = Crew::new("c");
        crew.add_member("dev", echo("dev"), CrewRole::Worker, Vec::<String>::new(), 1)
            .unwrap();
        let err = crew.execute(ExecutionMode::Hierarchical).await.unwrap_err();
        assert!(err.to_string().contains("requires a manager"));

        crew.add_task(Task::new("a").with_id("a").with_dependencies(["b"]))
            .await
            .unwrap();
        crew.add_task(Task::new("b").with_id("b").with_dependencies(["a"]))
            .await
            .unwrap();
        let err = crew.execute(ExecutionMode::Sequential).await.unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(crew.execution_history().await.is_empty());

        let empty = Crew::new("empty");
        assert!(empty.execute(ExecutionMode::Parallel).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_memory_accessors() {
        let crew = Crew::new("c");
        crew.set_shared_memory("goal", serde_json::json!("ship it")).await;
        assert_eq!(crew.get_shared_memory("goal").await.unwrap(), "ship it");
        assert!(crew.get_shared_memory("missing").await.is_none());
        assert_eq!(crew.shared_memory_snapshot().await.len(), 1);
    }
}
