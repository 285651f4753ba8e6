use crate::state::WorkflowState;
use ensemble_core::{EnsembleError, EnsembleResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Predicate evaluated against the workflow state.
pub type ConditionFn = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// Custom error handler: receives the state and the error message.
pub type ErrorHandlerFn = Arc<dyn Fn(&WorkflowState, &str) -> serde_json::Value + Send + Sync>;

/// Config key holding an agent node's input template.
pub const INPUT_TEMPLATE_KEY: &str = "input_template";
/// Config key naming the variable an agent node writes its output to.
pub const OUTPUT_KEY: &str = "output_key";
/// Config key for the number of retries after the first agent attempt.
pub const MAX_RETRIES_KEY: &str = "max_retries";
/// Config key for the base retry delay in milliseconds.
pub const RETRY_DELAY_KEY: &str = "retry_delay_ms";
/// Config key holding a parallel node's branches.
pub const BRANCHES_KEY: &str = "branches";

const DEFAULT_INPUT_TEMPLATE: &str = "{input}";

/// Plain node type tag, as written in workflow documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Entry point.
    Start,
    /// Calls a registered agent.
    Agent,
    /// Evaluates a predicate.
    Condition,
    /// Snapshots the state.
    Checkpoint,
    /// Runs branches concurrently.
    Parallel,
    /// Handles a failed node.
    ErrorHandler,
    /// Stops traversal.
    End,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Start => write!(f, "start"),
            NodeType::Agent => write!(f, "agent"),
            NodeType::Condition => write!(f, "condition"),
            NodeType::Checkpoint => write!(f, "checkpoint"),
            NodeType::Parallel => write!(f, "parallel"),
            NodeType::ErrorHandler => write!(f, "error_handler"),
            NodeType::End => write!(f, "end"),
        }
    }
}

/// What a node does, with the data only that kind needs.
#[derive(Clone)]
pub enum NodeKind {
    /// Entry point; reports `{"status": "started"}`.
    Start,
    /// Stops traversal before running.
    End,
    /// Calls `agent_id` with the rendered input template.
    Agent {
        /// Registered agent to call.
        agent_id: String,
    },
    /// Reports `{"condition_result": bool}`; a missing predicate is false.
    Condition(Option<ConditionFn>),
    /// Snapshots variables and history length.
    Checkpoint,
    /// Runs each branch of node ids concurrently on a forked state.
    Parallel {
        /// Node ids per branch, run in order within a branch.
        branches: Vec<Vec<String>>,
    },
    /// Runs after a failure reached through an `on_failure` edge.
    ErrorHandler(Option<ErrorHandlerFn>),
}

impl NodeKind {
    /// The plain type tag.
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start => NodeType::Start,
            NodeKind::End => NodeType::End,
            NodeKind::Agent { .. } => NodeType::Agent,
            NodeKind::Condition(_) => NodeType::Condition,
            NodeKind::Checkpoint => NodeType::Checkpoint,
            NodeKind::Parallel { .. } => NodeType::Parallel,
            NodeKind::ErrorHandler(_) => NodeType::ErrorHandler,
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Agent { agent_id } => f.debug_struct("Agent").field("agent_id", agent_id).finish(),
            NodeKind::Parallel { branches } => {
                f.debug_struct("Parallel").field("branches", branches).finish()
            }
            NodeKind::Condition(func) => f
                .debug_tuple("Condition")
                .field(&func.as_ref().map(|_| "<fn>"))
                .finish(),
            NodeKind::ErrorHandler(func) => f
                .debug_tuple("ErrorHandler")
                .field(&func.as_ref().map(|_| "<fn>"))
                .finish(),
            other => write!(f, "{}", other.node_type()),
        }
    }
}

/// Retry settings for agent nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay; the graph's configured default applies when unset.
    pub retry_delay: Option<Duration>,
}

/// A node in a [`WorkflowGraph`](crate::graph::WorkflowGraph).
///
/// `config` holds the document-level settings (`input_template`,
/// `output_key`, `max_retries`, `retry_delay_ms`, `branches`); the builder
/// methods keep it in sync with `kind` and `retry`.
#[derive(Debug, Clone)]
pub struct WorkflowNode {
    /// Node id, unique within the graph.
    pub node_id: String,
    /// Behaviour and per-kind data.
    pub kind: NodeKind,
    /// Document-level settings.
    pub config: HashMap<String, serde_json::Value>,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Retry policy applied to agent nodes.
    pub retry: RetryPolicy,
}

impl WorkflowNode {
    /// A node with empty config; parallel branches are mirrored into `config`.
    pub fn new(node_id: impl Into<String>, kind: NodeKind) -> Self {
        let mut node = Self {
            node_id: node_id.into(),
            kind,
            config: HashMap::new(),
            metadata: HashMap::new(),
            retry: RetryPolicy::default(),
        };
        if let NodeKind::Parallel { branches } = &node.kind {
            node.config
                .insert(BRANCHES_KEY.to_string(), serde_json::json!(branches));
        }
        node
    }

    /// A start node.
    pub fn start(node_id: impl Into<String>) -> Self {
        Self::new(node_id, NodeKind::Start)
    }

    /// An end node.
    pub fn end(node_id: impl Into<String>) -> Self {
        Self::new(node_id, NodeKind::End)
    }

    /// An agent node calling `agent_id`.
    pub fn agent(node_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::new(
            node_id,
            NodeKind::Agent {
                agent_id: agent_id.into(),
            },
        )
    }

    /// A condition node.
    pub fn condition<F>(node_id: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
    {
        let predicate: ConditionFn = Arc::new(predicate);
        Self::new(node_id, NodeKind::Condition(Some(predicate)))
    }

    /// A checkpoint node.
    pub fn checkpoint(node_id: impl Into<String>) -> Self {
        Self::new(node_id, NodeKind::Checkpoint)
    }

    /// A parallel node over `branches` of node ids.
    pub fn parallel<B, N>(node_id: impl Into<String>, branches: B) -> Self
    where
        B: IntoIterator,
        B::Item: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let branches = branches
            .into_iter()
            .map(|branch| branch.into_iter().map(Into::into).collect())
            .collect();
        Self::new(node_id, NodeKind::Parallel { branches })
    }

    /// An error handler node; without a function it reports `{"handled": true}`.
    pub fn error_handler(node_id: impl Into<String>, handler: Option<ErrorHandlerFn>) -> Self {
        Self::new(node_id, NodeKind::ErrorHandler(handler))
    }

    /// Set the agent input template; `{name}` placeholders read state variables.
    pub fn with_input_template(mut self, template: impl Into<String>) -> Self {
        self.config.insert(
            INPUT_TEMPLATE_KEY.to_string(),
            serde_json::Value::String(template.into()),
        );
        self
    }

    /// Store the agent output under `key`.
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.config
            .insert(OUTPUT_KEY.to_string(), serde_json::Value::String(key.into()));
        self
    }

    /// Retry failed agent calls; attempt `n` waits `retry_delay * n`.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.retry = RetryPolicy {
            max_retries,
            retry_delay: Some(retry_delay),
        };
        self.config
            .insert(MAX_RETRIES_KEY.to_string(), serde_json::json!(max_retries));
        self.config.insert(
            RETRY_DELAY_KEY.to_string(),
            serde_json::json!(u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX)),
        );
        self
    }

    /// Set a raw config entry.
    ///
    /// Setting `max_retries` or `retry_delay_ms` rebuilds the retry policy.
    /// A value that does not parse leaves the policy as it was and is
    /// reported by [`WorkflowGraph::validate`](crate::graph::WorkflowGraph::validate).
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let key = key.into();
        let affects_retry = key == MAX_RETRIES_KEY || key == RETRY_DELAY_KEY;
        self.config.insert(key, value);
        if affects_retry {
            if let Ok(retry) = Self::retry_from_config(&self.config) {
                self.retry = retry;
            }
        }
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The plain type tag.
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    /// Agent id for agent nodes.
    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Agent { agent_id } => Some(agent_id),
            _ => None,
        }
    }

    /// Agent input template; defaults to `"{input}"`.
    pub fn input_template(&self) -> &str {
        self.config
            .get(INPUT_TEMPLATE_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_INPUT_TEMPLATE)
    }

    /// Variable the agent output is stored under.
    pub fn output_key(&self) -> Option<&str> {
        self.config.get(OUTPUT_KEY).and_then(|v| v.as_str())
    }

    /// Read the retry policy back out of `config`.
    pub(crate) fn retry_from_config(
        config: &HashMap<String, serde_json::Value>,
    ) -> EnsembleResult<RetryPolicy> {
        let max_retries = match config.get(MAX_RETRIES_KEY) {
            None => 0,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    EnsembleError::Workflow(format!("{MAX_RETRIES_KEY} must be a non-negative integer"))
                })?,
        };
        let retry_delay = match config.get(RETRY_DELAY_KEY) {
            None => None,
            Some(value) => Some(Duration::from_millis(value.as_u64().ok_or_else(|| {
                EnsembleError::Workflow(format!("{RETRY_DELAY_KEY} must be a non-negative integer"))
            })?)),
        };
        Ok(RetryPolicy {
            max_retries,
            retry_delay,
        })
    }
}

/// When an edge may be traversed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always taken.
    #[default]
    Always,
    /// Taken when the node produced a non-null result without error.
    OnSuccess,
    /// Taken when the state carries an error.
    OnFailure,
    /// Taken when the edge predicate holds.
    Conditional,
}

/// A directed edge between two nodes.
#[derive(Clone)]
pub struct WorkflowEdge {
    /// Source node id.
    pub from_node: String,
    /// Target node id.
    pub to_node: String,
    /// When the edge may be taken.
    pub condition: EdgeCondition,
    /// Only consulted for [`EdgeCondition::Conditional`]; a missing predicate never holds.
    pub predicate: Option<ConditionFn>,
}

impl std::fmt::Debug for WorkflowEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEdge")
            .field("from_node", &self.from_node)
            .field("to_node", &self.to_node)
            .field("condition", &self.condition)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl WorkflowEdge {
    /// An edge without a predicate.
    pub fn new(
        from_node: impl Into<String>,
        to_node: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            from_node: from_node.into(),
            to_node: to_node.into(),
            condition,
            predicate: None,
        }
    }

    /// An unconditional edge.
    pub fn always(from_node: impl Into<String>, to_node: impl Into<String>) -> Self {
        Self::new(from_node, to_node, EdgeCondition::Always)
    }

    /// An edge taken after success.
    pub fn on_success(from_node: impl Into<String>, to_node: impl Into<String>) -> Self {
        Self::new(from_node, to_node, EdgeCondition::OnSuccess)
    }

    /// An edge taken after failure.
    pub fn on_failure(from_node: impl Into<String>, to_node: impl Into<String>) -> Self {
        Self::new(from_node, to_node, EdgeCondition::OnFailure)
    }

    /// An edge guarded by `predicate`.
    pub fn conditional<F>(from_node: impl Into<String>, to_node: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
    {
        let predicate: ConditionFn = Arc::new(predicate);
        Self {
            predicate: Some(predicate),
            ..Self::new(from_node, to_node, EdgeCondition::Conditional)
        }
    }

    /// Whether this edge may be taken after a node produced `result`.
    pub fn holds(&self, state: &WorkflowState, result: &serde_json::Value) -> bool {
        match self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => !result.is_null() && state.error.is_none(),
            EdgeCondition::OnFailure => state.error.is_some(),
            EdgeCondition::Conditional => self.predicate.as_ref().is_some_and(|p| p(state)),
        }
    }
}

fn placeholder_pattern() -> EnsembleResult<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}"))
        .as_ref()
        .map_err(|e| EnsembleError::Workflow(format!("Invalid placeholder pattern: {e}")))
}

/// Replace `{name}` placeholders with state variables.
///
/// Strings are inserted as-is, other values as JSON. Unknown names are left
/// in place.
pub fn render_template(
    template: &str,
    variables: &HashMap<String, serde_json::Value>,
) -> EnsembleResult<String> {
    let pattern = placeholder_pattern()?;
    let rendered = pattern.replace_all(template, |caps: &regex::Captures<'_>| {
        match variables.get(&caps[1]) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    });
    Ok(rendered.into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, serde_json::Value> {
        HashMap::from([
            ("input".to_string(), json!("rust")),
            ("count".to_string(), json!(3)),
            ("tags".to_string(), json!(["a", "b"])),
        ])
    }

    #[test]
    fn test_render_template() {
        let out = render_template("Write {count} posts about {input} {tags}", &vars()).unwrap();
        assert_eq!(out, r#"Write 3 posts about rust ["a","b"]"#);
    }

    #[test]
    fn test_render_template_keeps_unknown() {
        let out = render_template("{input} and {missing} and {not a var}", &vars()).unwrap();
        assert_eq!(out, "rust and {missing} and {not a var}");
    }

    #[test]
    fn test_agent_node_builder_writes_config() {
        let node = WorkflowNode::agent("draft", "writer")
            .with_input_template("Draft: {input}")
            .with_output_key("draft")
            .with_retries(2, Duration::from_millis(50));

        assert_eq!(node.node_type(), NodeType::Agent);
        assert_eq!(node.agent_id(), Some("writer"));
        assert_eq!(node.input_template(), "Draft: {input}");
        assert_eq!(node.output_key(), Some("draft"));
        assert_eq!(node.config[MAX_RETRIES_KEY], 2);
        assert_eq!(node.config[RETRY_DELAY_KEY], 50);
        assert_eq!(WorkflowNode::retry_from_config(&node.config).unwrap(), node.retry);
    }

    #[test]
    fn test_with_config_rebuilds_retry_policy() {
        let node = WorkflowNode::agent("a", "x")
            .with_config(MAX_RETRIES_KEY, json!(4))
            .with_config(RETRY_DELAY_KEY, json!(250));
        assert_eq!(node.retry.max_retries, 4);
        assert_eq!(node.retry.retry_delay, Some(Duration::from_millis(250)));

        let node = node.with_config(MAX_RETRIES_KEY, json!(-1));
        assert_eq!(node.retry.max_retries, 4);
        assert!(WorkflowNode::retry_from_config(&node.config).is_err());

        let node = WorkflowNode::agent("b", "x").with_config(OUTPUT_KEY, json!("out"));
        assert_eq!(node.retry, RetryPolicy::default());
    }

    #[test]
    fn test_default_input_template() {
        let node = WorkflowNode::agent("a", "x");
        assert_eq!(node.input_template(), "{input}");
        assert!(node.output_key().is_none());
        assert_eq!(node.retry.max_retries, 0);
    }

    #[test]
    fn test_invalid_retry_config() {
        let config = HashMap::from([(MAX_RETRIES_KEY.to_string(), json!("three"))]);
        assert!(WorkflowNode::retry_from_config(&config).is_err());
    }

    #[test]
    fn test_parallel_node_records_branches() {
        let node = WorkflowNode::parallel("fan", [vec!["a", "b"], vec!["c"]]);
        assert_eq!(node.config[BRANCHES_KEY], json!([["a", "b"], ["c"]]));
        match &node.kind {
            NodeKind::Parallel { branches } => assert_eq!(branches.len(), 2),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_edge_conditions() {
        let mut state = WorkflowState::new("wf", None);
        let done = json!("done");

        assert!(WorkflowEdge::always("a", "b").holds(&state, &serde_json::Value::Null));
        assert!(WorkflowEdge::on_success("a", "b").holds(&state, &done));
        assert!(!WorkflowEdge::on_success("a", "b").holds(&state, &serde_json::Value::Null));
        assert!(!WorkflowEdge::on_failure("a", "b").holds(&state, &done));
        assert!(!WorkflowEdge::new("a", "b", EdgeCondition::Conditional).holds(&state, &done));

        let edge = WorkflowEdge::conditional("a", "b", |s: &WorkflowState| {
            s.get_variable("approved") == Some(&json!(true))
        });
        assert!(!edge.holds(&state, &done));
        state.set_variable("approved", json!(true));
        assert!(edge.holds(&state, &done));

        state.error = Some("boom".into());
        assert!(WorkflowEdge::on_failure("a", "b").holds(&state, &done));
        assert!(!WorkflowEdge::on_success("a", "b").holds(&state, &done));
    }

    #[test]
    fn test_node_type_serialization() {
        assert_eq!(
            serde_json::to_string(&NodeType::ErrorHandler).unwrap(),
            "\"error_handler\""
        );
        assert_eq!(NodeType::Checkpoint.to_string(), "checkpoint");
    }
}
