use crate::config::WorkflowConfig;
use crate::coordinator::Coordinator;
use crate::node::{
    render_template, ConditionFn, EdgeCondition, ErrorHandlerFn, NodeKind, WorkflowEdge,
    WorkflowNode,
};
use crate::state::WorkflowState;
use chrono::{DateTime, Utc};
use ensemble_core::{
    invoke_agent, AgentContext, CancellationToken, EnsembleError, EnsembleResult,
};
use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error recorded when a run exhausts its step budget.
pub const MAX_STEPS_EXCEEDED: &str = "Maximum steps exceeded";

/// Outcome of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run reached an end node or ran out of edges.
    Success,
    /// A node failed, the run was cancelled or the step budget ran out.
    Failed,
}

/// Record of one [`WorkflowGraph::execute`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Id of the run, `workflow_<name>_<uuid>`.
    pub workflow_id: String,
    /// Graph name.
    pub workflow_name: String,
    /// Nodes executed.
    pub steps: usize,
    /// Outcome.
    pub status: RunStatus,
    /// Error recorded in the final state.
    pub error: Option<String>,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run finished.
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// A directed workflow of agent, control and checkpoint nodes.
///
/// Traversal starts at the single `start` node. After each node the outgoing
/// edges are tried in registration order and the first whose condition holds
/// is followed. A run stops at an `end` node, when no edge matches, on the
/// first node failure, or when the step budget is spent.
pub struct WorkflowGraph {
    name: String,
    coordinator: Arc<Coordinator>,
    config: WorkflowConfig,
    nodes: HashMap<String, WorkflowNode>,
    node_order: Vec<String>,
    edges: Vec<WorkflowEdge>,
    entry_node: Option<String>,
    history: Mutex<Vec<WorkflowRun>>,
}

impl WorkflowGraph {
    /// An empty graph with the default [`WorkflowConfig`].
    pub fn new(name: impl Into<String>, coordinator: Arc<Coordinator>) -> Self {
        Self::with_config(name, coordinator, WorkflowConfig::default())
    }

    /// An empty graph with an explicit step budget and retry delay.
    pub fn with_config(
        name: impl Into<String>,
        coordinator: Arc<Coordinator>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            name: name.into(),
            coordinator,
            config,
            nodes: HashMap::new(),
            node_order: Vec::new(),
            edges: Vec::new(),
            entry_node: None,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Graph name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Coordinator agent nodes resolve against.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Workflow settings.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Id of the start node, once added.
    pub fn entry_node(&self) -> Option<&str> {
        self.entry_node.as_deref()
    }

    /// Add a node. Duplicate ids, a second start node and a parallel node
    /// listing itself as a branch member are rejected.
    pub fn add_node(&mut self, node: WorkflowNode) -> EnsembleResult<&mut Self> {
        if self.nodes.contains_key(&node.node_id) {
            return Err(EnsembleError::Workflow(format!(
                "Duplicate node id: {}",
                node.node_id
            )));
        }
        if let NodeKind::Parallel { branches } = &node.kind {
            if branches.iter().flatten().any(|member| *member == node.node_id) {
                return Err(EnsembleError::Workflow(format!(
                    "Parallel node '{}' lists itself as a branch member",
                    node.node_id
                )));
            }
        }
        if matches!(node.kind, NodeKind::Start) {
            if let Some(existing) = &self.entry_node {
                return Err(EnsembleError::Workflow(format!(
                    "Workflow already has a start node: {existing}"
                )));
            }
            self.entry_node = Some(node.node_id.clone());
        }

        info!(
            workflow = %self.name,
            node_id = %node.node_id,
            node_type = %node.node_type(),
            "Added workflow node"
        );
        self.node_order.push(node.node_id.clone());
        self.nodes.insert(node.node_id.clone(), node);
        Ok(self)
    }

    /// Add an edge between two existing nodes.
    pub fn add_edge(&mut self, edge: WorkflowEdge) -> EnsembleResult<&mut Self> {
        for endpoint in [&edge.from_node, &edge.to_node] {
            if !self.nodes.contains_key(endpoint) {
                return Err(EnsembleError::NodeNotFound(endpoint.clone()));
            }
        }
        debug!(workflow = %self.name, from = %edge.from_node, to = %edge.to_node, "Added edge");
        self.edges.push(edge);
        Ok(self)
    }

    /// Attach a predicate to a condition node.
    pub fn set_condition(&mut self, node_id: &str, predicate: ConditionFn) -> EnsembleResult<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| EnsembleError::NodeNotFound(node_id.to_string()))?;
        match &mut node.kind {
            NodeKind::Condition(slot) => {
                *slot = Some(predicate);
                Ok(())
            }
            _ => Err(EnsembleError::Workflow(format!(
                "Node '{node_id}' is not a condition node"
            ))),
        }
    }

    /// Attach a handler function to an error handler node.
    pub fn set_error_handler(
        &mut self,
        node_id: &str,
        handler: ErrorHandlerFn,
    ) -> EnsembleResult<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| EnsembleError::NodeNotFound(node_id.to_string()))?;
        match &mut node.kind {
            NodeKind::ErrorHandler(slot) => {
                *slot = Some(handler);
                Ok(())
            }
            _ => Err(EnsembleError::Workflow(format!(
                "Node '{node_id}' is not an error handler node"
            ))),
        }
    }

    /// Attach a predicate to every conditional edge from `from` to `to`.
    /// Returns how many edges were updated.
    pub fn set_edge_predicate(&mut self, from: &str, to: &str, predicate: ConditionFn) -> usize {
        let mut updated = 0;
        for edge in self
            .edges
            .iter_mut()
            .filter(|e| e.from_node == from && e.to_node == to)
            .filter(|e| e.condition == EdgeCondition::Conditional)
        {
            edge.predicate = Some(predicate.clone());
            updated += 1;
        }
        updated
    }

    /// Look up a node.
    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    /// Nodes in the order they were added.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Edges in the order they were added.
    pub fn edges(&self) -> &[WorkflowEdge] {
        &self.edges
    }

    /// Edges leaving `node_id`, in evaluation order.
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> {
        self.edges.iter().filter(move |e| e.from_node == node_id)
    }

    /// Check that the graph can run.
    ///
    /// A start node must exist, every node's retry settings must parse, and
    /// parallel branches may only name existing nodes that are neither start
    /// nor parallel nodes. Branches therefore never nest, so a parallel node
    /// cannot reach itself.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.entry_node.is_none() {
            return Err(EnsembleError::Workflow("No entry node defined".to_string()));
        }
        for node in self.nodes() {
            WorkflowNode::retry_from_config(&node.config).map_err(|e| {
                EnsembleError::Workflow(format!("Node '{}': {e}", node.node_id))
            })?;
            let NodeKind::Parallel { branches } = &node.kind else {
                continue;
            };
            for member in branches.iter().flatten() {
                let Some(target) = self.nodes.get(member) else {
                    return Err(EnsembleError::Workflow(format!(
                        "Parallel node '{}' references unknown node '{member}'",
                        node.node_id
                    )));
                };
                if matches!(target.kind, NodeKind::Parallel { .. } | NodeKind::Start) {
                    return Err(EnsembleError::Workflow(format!(
                        "Parallel node '{}' cannot run {} node '{member}' in a branch",
                        node.node_id,
                        target.node_type()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Runs recorded so far, oldest first.
    pub fn execution_history(&self) -> Vec<WorkflowRun> {
        self.history.lock().clone()
    }

    /// Execute with the configured step budget.
    pub async fn run(&self, input: &str) -> EnsembleResult<WorkflowState> {
        self.execute(input, None, self.config.max_steps).await
    }

    /// Execute the workflow from its start node.
    ///
    /// Returns `Err` only for structural problems. Node failures and budget
    /// exhaustion are reported through `WorkflowState::error`.
    pub async fn execute(
        &self,
        input: &str,
        initial_variables: Option<HashMap<String, serde_json::Value>>,
        max_steps: usize,
    ) -> EnsembleResult<WorkflowState> {
        self.execute_with_cancel(input, initial_variables, max_steps, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), stopping before the next node (and
    /// aborting any in-flight agent call) once `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        input: &str,
        initial_variables: Option<HashMap<String, serde_json::Value>>,
        max_steps: usize,
        cancel: CancellationToken,
    ) -> EnsembleResult<WorkflowState> {
        self.validate()?;

        let workflow_id = format!("workflow_{}_{}", self.name, Uuid::new_v4().simple());
        let mut state = WorkflowState::new(workflow_id.clone(), self.entry_node.clone());
        state.variables = initial_variables.unwrap_or_default();
        state.set_variable("input", json!(input));

        info!(workflow = %self.name, workflow_id = %workflow_id, "Starting workflow execution");
        let start_time = Utc::now();
        let started = Instant::now();
        let mut steps = 0;

        while let Some(current) = state.current_node.clone() {
            let Some(node) = self.nodes.get(&current) else {
                state.error = Some(EnsembleError::NodeNotFound(current).to_string());
                break;
            };

            if matches!(node.kind, NodeKind::End) {
                info!(workflow = %self.name, node_id = %current, "Reached end node");
                break;
            }

            if steps >= max_steps {
                warn!(workflow = %self.name, max_steps, "Workflow reached max steps");
                state.error = Some(MAX_STEPS_EXCEEDED.to_string());
                break;
            }

            if cancel.is_cancelled() {
                state.error = Some(
                    EnsembleError::Cancelled(format!("workflow '{workflow_id}'")).to_string(),
                );
                break;
            }

            steps += 1;
            match self.execute_node(node, &mut state, &cancel).await {
                Ok(result) => {
                    state.add_to_history(current.as_str(), result.clone(), HashMap::new());
                    state.current_node = self.next_node(&current, &state, &result);
                    if let Some(next) = &state.current_node {
                        debug!(workflow = %self.name, from = %current, to = %next, "Traversing edge");
                    }
                }
                Err(e) => {
                    error!(workflow = %self.name, node_id = %current, error = %e, "Workflow node failed");
                    state.error = Some(e.to_string());
                    if !e.is_cancelled() {
                        self.run_error_handler(&current, &mut state, &cancel).await;
                    }
                    break;
                }
            }
        }

        let run = WorkflowRun {
            workflow_id,
            workflow_name: self.name.clone(),
            steps,
            status: if state.error.is_none() {
                RunStatus::Success
            } else {
                RunStatus::Failed
            },
            error: state.error.clone(),
            start_time,
            end_time: Utc::now(),
            duration: started.elapsed(),
        };
        info!(
            workflow = %self.name,
            steps,
            status = ?run.status,
            "Workflow finished"
        );
        self.history.lock().push(run);
        Ok(state)
    }

    fn next_node(
        &self,
        node_id: &str,
        state: &WorkflowState,
        result: &serde_json::Value,
    ) -> Option<String> {
        self.outgoing_edges(node_id)
            .find(|edge| edge.holds(state, result))
            .map(|edge| edge.to_node.clone())
    }

    /// Run the first error handler reached from `failed` through an `on_failure` edge.
    async fn run_error_handler(
        &self,
        failed: &str,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) {
        let handler = self
            .edges
            .iter()
            .filter(|e| e.from_node == failed && e.condition == EdgeCondition::OnFailure)
            .filter_map(|e| self.nodes.get(&e.to_node))
            .find(|n| matches!(n.kind, NodeKind::ErrorHandler(_)));

        let Some(handler) = handler else {
            return;
        };
        info!(workflow = %self.name, failed = %failed, handler = %handler.node_id, "Running error handler");
        match self.execute_node(handler, state, cancel).await {
            Ok(result) => {
                state.add_to_history(
                    handler.node_id.as_str(),
                    result,
                    HashMap::from([("failed_node".to_string(), json!(failed))]),
                );
            }
            Err(e) => {
                error!(workflow = %self.name, handler = %handler.node_id, error = %e, "Error handler failed");
            }
        }
    }

    fn execute_node<'a>(
        &'a self,
        node: &'a WorkflowNode,
        state: &'a mut WorkflowState,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, EnsembleResult<serde_json::Value>> {
        Box::pin(async move {
            debug!(workflow = %self.name, node_id = %node.node_id, node_type = %node.node_type(), "Executing node");
            match &node.kind {
                NodeKind::Start => Ok(json!({"status": "started"})),
                NodeKind::End => Ok(json!({"status": "ended"})),
                NodeKind::Agent { agent_id } => {
                    self.execute_agent_node(node, agent_id, state, cancel).await
                }
                NodeKind::Condition(predicate) => {
                    let result = predicate.as_ref().is_some_and(|p| p(&*state));
                    Ok(json!({"condition_result": result}))
                }
                NodeKind::Checkpoint => {
                    state.create_checkpoint(node.node_id.as_str());
                    Ok(json!({"checkpoint_created": node.node_id}))
                }
                NodeKind::Parallel { branches } => {
                    Ok(self.execute_parallel(branches, state, cancel).await)
                }
                NodeKind::ErrorHandler(handler) => {
                    let message = state.error.clone().unwrap_or_else(|| "Unknown error".to_string());
                    Ok(match handler {
                        Some(handler) => handler(&*state, &message),
                        None => json!({"handled": true}),
                    })
                }
            }
        })
    }

    async fn execute_agent_node(
        &self,
        node: &WorkflowNode,
        agent_id: &str,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> EnsembleResult<serde_json::Value> {
        // Resolved once; a missing agent is never retried.
        let agent = self.coordinator.require(agent_id).await?;
        let input = render_template(node.input_template(), &state.variables)?;
        let max_retries = node.retry.max_retries;
        let retry_delay = node
            .retry
            .retry_delay
            .unwrap_or(Duration::from_millis(self.config.default_retry_delay_ms));

        let mut attempt: u32 = 0;
        loop {
            let context = AgentContext::new(state.workflow_id.clone())
                .with_metadata("workflow", json!(self.name))
                .with_metadata("node", json!(node.node_id))
                .with_metadata("state", json!(state.variables))
                .with_metadata("attempt", json!(attempt))
                .with_cancellation(cancel.clone());

            match invoke_agent(agent.as_ref(), &input, &context).await {
                Ok(output) => {
                    if let Some(key) = node.output_key() {
                        state.set_variable(key, json!(output));
                    }
                    return Ok(json!(output));
                }
                Err(e) if e.is_cancelled() || e.is_not_found() || attempt >= max_retries => {
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        workflow = %self.name,
                        node_id = %node.node_id,
                        attempt,
                        error = %e,
                        "Agent node attempt failed, retrying"
                    );
                    let backoff = retry_delay.saturating_mul(attempt);
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(EnsembleError::Cancelled(format!(
                                "node '{}' was cancelled while waiting to retry",
                                node.node_id
                            )));
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// Run every branch concurrently on its own copy of the state.
    ///
    /// Nodes in a branch run in order; a failing node ends its branch and is
    /// recorded as `{"error": message}`. Branch variables and checkpoints are
    /// merged back in branch order.
    async fn execute_parallel(
        &self,
        branches: &[Vec<String>],
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> serde_json::Value {
        let base = state.clone();
        let runs = branches.iter().map(|branch| {
            let mut fork = base.clone();
            async move {
                let mut results = Vec::with_capacity(branch.len());
                for node_id in branch {
                    let Some(node) = self.nodes.get(node_id) else {
                        results.push(json!({
                            "error": EnsembleError::NodeNotFound(node_id.clone()).to_string()
                        }));
                        break;
                    };
                    match self.execute_node(node, &mut fork, cancel).await {
                        Ok(result) => results.push(result),
                        Err(e) => {
                            warn!(workflow = %self.name, node_id = %node_id, error = %e, "Parallel branch node failed");
                            results.push(json!({"error": e.to_string()}));
                            break;
                        }
                    }
                }
                (results, fork)
            }
        });

        let mut collected = Vec::with_capacity(branches.len());
        for (results, fork) in join_all(runs).await {
            state.merge_branch(&base, fork);
            collected.push(serde_json::Value::Array(results));
        }
        json!({"parallel_results": collected})
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ensemble_core::{agent_fn, Agent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn coordinator_with(agents: Vec<(&str, Arc<dyn Agent>)>) -> Arc<Coordinator> {
        let coord = Arc::new(Coordinator::new());
        for (id, agent) in agents {
            coord
                .register(id, agent, Vec::<String>::new(), HashMap::new())
                .await;
        }
        coord
    }

    fn upper() -> Arc<dyn Agent> {
        agent_fn(|input, _ctx| async move { Ok(input.to_uppercase()) })
    }

    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Arc<dyn Agent> {
        agent_fn(move |input, _ctx| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(EnsembleError::Agent(format!("transient failure {n}")))
                } else {
                    Ok(format!("ok: {input}"))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_linear_workflow() {
        let coord = coordinator_with(vec![("upper", upper())]).await;
        let mut graph = WorkflowGraph::new("linear", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(
                WorkflowNode::agent("shout", "upper")
                    .with_input_template("say {input}")
                    .with_output_key("shouted"),
            )
            .unwrap()
            .add_node(WorkflowNode::end("end"))
            .unwrap();
        graph
            .add_edge(WorkflowEdge::always("start", "shout"))
            .unwrap()
            .add_edge(WorkflowEdge::on_success("shout", "end"))
            .unwrap();

        let state = graph.execute("hello", None, 10).await.unwrap();
        assert!(state.error.is_none());
        assert_eq!(state.variables["shouted"], "SAY HELLO");
        assert_eq!(state.current_node.as_deref(), Some("end"));
        let visited: Vec<&str> = state.history.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(visited, vec!["start", "shout"]);
        assert_eq!(state.history[0].result, json!({"status": "started"}));

        let runs = graph.execution_history();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].steps, 2);
        assert_eq!(runs[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_build_errors() {
        let coord = coordinator_with(vec![]).await;
        let mut graph = WorkflowGraph::new("g", coord);
        graph.add_node(WorkflowNode::start("s")).unwrap();
        assert!(graph.add_node(WorkflowNode::start("s2")).is_err());
        assert!(graph.add_node(WorkflowNode::end("s")).is_err());
        let err = graph.add_edge(WorkflowEdge::always("s", "ghost")).err().unwrap();
        assert!(err.is_not_found());

        graph
            .add_node(WorkflowNode::parallel("p", [vec!["missing"]]))
            .unwrap();
        assert!(graph.validate().is_err());
    }

    #[tokio::test]
    async fn test_parallel_self_reference_rejected() {
        let coord = coordinator_with(vec![]).await;
        let mut graph = WorkflowGraph::new("g", coord);
        graph.add_node(WorkflowNode::start("start")).unwrap();
        let err = graph
            .add_node(WorkflowNode::parallel("p", [vec!["p"]]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("lists itself"));
        assert!(graph.node("p").is_none());
    }

    #[tokio::test]
    async fn test_nested_parallel_rejected_before_running() {
        let coord = coordinator_with(vec![]).await;
        let mut graph = WorkflowGraph::new("g", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::parallel("p1", [vec!["p2"]]))
            .unwrap()
            .add_node(WorkflowNode::parallel("p2", [vec!["p1"]]))
            .unwrap();
        graph.add_edge(WorkflowEdge::always("start", "p1")).unwrap();

        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("cannot run parallel node"));
        // Execution refuses the graph instead of recursing into it.
        assert!(graph.execute("go", None, 10).await.is_err());
        assert!(graph.execution_history().is_empty());

        let mut graph = WorkflowGraph::new("g2", coordinator_with(vec![]).await);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::parallel("p", [vec!["start"]]))
            .unwrap();
        assert!(graph.validate().is_err());
    }

    #[tokio::test]
    async fn test_invalid_retry_config_rejected_by_validate() {
        let coord = coordinator_with(vec![]).await;
        let mut graph = WorkflowGraph::new("g", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::agent("a", "x").with_config("max_retries", json!("lots")))
            .unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[tokio::test]
    async fn test_huge_retry_delay_does_not_overflow() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coord = coordinator_with(vec![("flaky", flaky(1, calls.clone()))]).await;
        let mut graph = WorkflowGraph::new("g", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::agent("call", "flaky").with_retries(3, Duration::MAX))
            .unwrap();
        graph.add_edge(WorkflowEdge::always("start", "call")).unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let state = graph.execute_with_cancel("x", None, 10, token).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(state.error.unwrap().contains("waiting to retry"));
    }

    #[tokio::test]
    async fn test_missing_start_node() {
        let coord = coordinator_with(vec![]).await;
        let mut graph = WorkflowGraph::new("g", coord);
        graph.add_node(WorkflowNode::end("end")).unwrap();
        let err = graph.execute("x", None, 5).await.unwrap_err();
        assert!(err.to_string().contains("No entry node"));
    }

    #[tokio::test]
    async fn test_conditional_routing() {
        let coord = coordinator_with(vec![("upper", upper())]).await;
        let mut graph = WorkflowGraph::new("router", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::condition("is_long", |s: &WorkflowState| {
                s.get_variable("input")
                    .and_then(|v| v.as_str())
                    .is_some_and(|s| s.len() > 5)
            }))
            .unwrap()
            .add_node(WorkflowNode::agent("long", "upper").with_output_key("out"))
            .unwrap()
            .add_node(WorkflowNode::end("short"))
            .unwrap();
        graph
            .add_edge(WorkflowEdge::always("start", "is_long"))
            .unwrap()
            .add_edge(WorkflowEdge::conditional("is_long", "long", |s: &WorkflowState| {
                s.history
                    .last()
                    .is_some_and(|h| h.result["condition_result"] == json!(true))
            }))
            .unwrap()
            .add_edge(WorkflowEdge::always("is_long", "short"))
            .unwrap();

        let state = graph.execute("tiny", None, 10).await.unwrap();
        assert_eq!(state.current_node.as_deref(), Some("short"));
        assert!(!state.variables.contains_key("out"));

        let state = graph.execute("much longer", None, 10).await.unwrap();
        assert_eq!(state.variables["out"], "MUCH LONGER");
        // "long" has no outgoing edges, so traversal simply stops.
        assert!(state.current_node.is_none());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coord = coordinator_with(vec![("flaky", flaky(2, calls.clone()))]).await;
        let mut graph = WorkflowGraph::new("retry", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(
                WorkflowNode::agent("call", "flaky")
                    .with_retries(2, Duration::from_millis(1))
                    .with_output_key("answer"),
            )
            .unwrap();
        graph.add_edge(WorkflowEdge::always("start", "call")).unwrap();

        let state = graph.execute("ping", None, 10).await.unwrap();
        assert!(state.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.variables["answer"], "ok: ping");
    }

    #[tokio::test]
    async fn test_retries_exhausted_runs_error_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coord = coordinator_with(vec![("flaky", flaky(10, calls.clone()))]).await;
        let mut graph = WorkflowGraph::new("fail", coord);
        let handler: ErrorHandlerFn =
            Arc::new(|_state: &WorkflowState, msg: &str| json!({"recovered_from": msg}));
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::agent("call", "flaky").with_retries(1, Duration::from_millis(1)))
            .unwrap()
            .add_node(WorkflowNode::error_handler("oops", Some(handler)))
            .unwrap()
            .add_node(WorkflowNode::error_handler("never", None))
            .unwrap();
        graph
            .add_edge(WorkflowEdge::always("start", "call"))
            .unwrap()
            .add_edge(WorkflowEdge::on_failure("call", "oops"))
            .unwrap()
            .add_edge(WorkflowEdge::on_failure("call", "never"))
            .unwrap();

        let state = graph.execute("ping", None, 10).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let error = state.error.clone().unwrap();
        assert!(error.contains("transient failure 1"));

        let handled: Vec<&str> = state.history.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(handled, vec!["start", "oops"]);
        assert_eq!(state.history[1].result["recovered_from"], json!(error));
        assert_eq!(graph.execution_history()[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_agent_not_retried() {
        let coord = coordinator_with(vec![]).await;
        let mut graph = WorkflowGraph::new("g", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::agent("call", "ghost").with_retries(5, Duration::from_secs(60)))
            .unwrap();
        graph.add_edge(WorkflowEdge::always("start", "call")).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(1), graph.execute("x", None, 10))
            .await
            .expect("not-found must not wait for retries")
            .unwrap();
        assert_eq!(state.error.as_deref(), Some("Agent not found: ghost"));
    }

    #[tokio::test]
    async fn test_max_steps_on_cycle() {
        let coord = coordinator_with(vec![]).await;
        let mut graph = WorkflowGraph::new("loop", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::checkpoint("tick"))
            .unwrap();
        graph
            .add_edge(WorkflowEdge::always("start", "tick"))
            .unwrap()
            .add_edge(WorkflowEdge::always("tick", "tick"))
            .unwrap();

        let state = graph.execute("x", None, 5).await.unwrap();
        assert_eq!(state.error.as_deref(), Some(MAX_STEPS_EXCEEDED));
        assert_eq!(state.history.len(), 5);
        assert_eq!(graph.execution_history()[0].steps, 5);
    }

    #[tokio::test]
    async fn test_parallel_branches_merge() {
        let coord = coordinator_with(vec![("upper", upper())]).await;
        let mut graph = WorkflowGraph::new("fan", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::agent("left", "upper").with_output_key("left"))
            .unwrap()
            .add_node(
                WorkflowNode::agent("right", "upper")
                    .with_input_template("right {input}")
                    .with_output_key("right"),
            )
            .unwrap()
            .add_node(WorkflowNode::agent("broken", "ghost"))
            .unwrap()
            .add_node(WorkflowNode::checkpoint("after_broken"))
            .unwrap()
            .add_node(WorkflowNode::parallel(
                "fan",
                [vec!["left"], vec!["right"], vec!["broken", "after_broken"]],
            ))
            .unwrap();
        graph.add_edge(WorkflowEdge::always("start", "fan")).unwrap();

        let state = graph.execute("go", None, 10).await.unwrap();
        assert!(state.error.is_none());
        assert_eq!(state.variables["left"], "GO");
        assert_eq!(state.variables["right"], "RIGHT GO");
        assert!(!state.checkpoints.contains_key("after_broken"));

        let results = &state.history[1].result["parallel_results"];
        assert_eq!(results[0], json!(["GO"]));
        assert_eq!(results[2].as_array().unwrap().len(), 1);
        assert_eq!(results[2][0]["error"], "Agent not found: ghost");
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore_after_run() {
        let coord = coordinator_with(vec![("upper", upper())]).await;
        let mut graph = WorkflowGraph::new("cp", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::checkpoint("saved"))
            .unwrap()
            .add_node(WorkflowNode::agent("work", "upper").with_output_key("result"))
            .unwrap();
        graph
            .add_edge(WorkflowEdge::always("start", "saved"))
            .unwrap()
            .add_edge(WorkflowEdge::always("saved", "work"))
            .unwrap();

        let mut state = graph.execute("data", None, 10).await.unwrap();
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.history[1].result, json!({"checkpoint_created": "saved"}));

        state.restore_checkpoint("saved").unwrap();
        assert_eq!(state.history.len(), 1);
        assert!(!state.variables.contains_key("result"));
        assert_eq!(state.variables["input"], "data");
    }

    #[tokio::test]
    async fn test_initial_variables_and_metadata() {
        let coord = coordinator_with(vec![(
            "meta",
            agent_fn(|_input, ctx| async move {
                let node = ctx.get("node").and_then(|v| v.as_str()).unwrap_or("?").to_string();
                let topic = ctx.get("state").map(|s| s["topic"].clone()).unwrap_or_default();
                Ok(format!("{node}:{topic}"))
            }),
        )])
        .await;
        let mut graph = WorkflowGraph::new("meta", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::agent("ask", "meta").with_output_key("out"))
            .unwrap();
        graph.add_edge(WorkflowEdge::always("start", "ask")).unwrap();

        let vars = HashMap::from([("topic".to_string(), json!("rust"))]);
        let state = graph.execute("x", Some(vars), 10).await.unwrap();
        assert_eq!(state.variables["out"], r#"ask:"rust""#);
    }

    #[tokio::test]
    async fn test_cancel_stops_workflow() {
        let coord = coordinator_with(vec![(
            "slow",
            agent_fn(|_input, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("late".to_string())
            }),
        )])
        .await;
        let mut graph = WorkflowGraph::new("slow", coord);
        graph
            .add_node(WorkflowNode::start("start"))
            .unwrap()
            .add_node(WorkflowNode::agent("wait", "slow"))
            .unwrap();
        graph.add_edge(WorkflowEdge::always("start", "wait")).unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let state = tokio::time::timeout(
            Duration::from_secs(1),
            graph.execute_with_cancel("x", None, 10, token),
        )
        .await
        .expect("cancellation should stop the run")
        .unwrap();
        assert!(state.error.unwrap().starts_with("Cancelled"));
    }

    #[tokio::test]
    async fn test_run_uses_configured_budget() {
        let coord = coordinator_with(vec![]).await;
        let config = WorkflowConfig {
            max_steps: 3,
            ..WorkflowConfig::default()
        };
        let mut graph = WorkflowGraph::with_config("loop", coord, config);
        graph.add_node(WorkflowNode::start("start")).unwrap();
        graph.add_edge(WorkflowEdge::always("start", "start")).unwrap();

        let state = graph.run("x").await.unwrap();
        assert_eq!(state.error.as_deref(), Some(MAX_STEPS_EXCEEDED));
        assert_eq!(state.history.len(), 3);
    }
}
