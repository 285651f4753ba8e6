//! Serializable workflow documents.
//!
//! A [`WorkflowDefinition`] is the data-only shape of a [`WorkflowGraph`]:
//! nodes with their type, agent and config, edges with their condition, and
//! the entry node. Predicates and handler functions cannot be serialized, so
//! condition nodes and conditional edges loaded from a document start without
//! one; attach them with [`WorkflowGraph::set_condition`] and
//! [`WorkflowGraph::set_edge_predicate`].

use crate::config::WorkflowConfig;
use crate::coordinator::Coordinator;
use crate::graph::WorkflowGraph;
use crate::node::{EdgeCondition, NodeKind, NodeType, WorkflowEdge, WorkflowNode, BRANCHES_KEY};
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn default_workflow_name() -> String {
    "unnamed_workflow".to_string()
}

/// Document form of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name; `unnamed_workflow` when omitted.
    #[serde(default = "default_workflow_name")]
    pub name: String,
    /// Nodes in graph order.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// Edges in evaluation order.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    /// Id of the start node, if stated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_node: Option<String>,
}

/// Document form of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node id.
    pub node_id: String,
    /// Node type tag.
    pub node_type: NodeType,
    /// Agent for `agent` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Node settings (`input_template`, `output_key`, `max_retries`, `retry_delay_ms`, `branches`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Document form of an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// Source node id.
    pub from_node: String,
    /// Target node id.
    pub to_node: String,
    /// When the edge may be taken; `always` when omitted.
    #[serde(default)]
    pub condition: EdgeCondition,
}

impl WorkflowDefinition {
    /// Parse a YAML document.
    pub fn from_yaml_str(raw: &str) -> EnsembleResult<Self> {
        serde_yaml_ng::from_str(raw).map_err(|e| EnsembleError::Yaml(e.to_string()))
    }

    /// Read and parse a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> EnsembleResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> EnsembleResult<String> {
        serde_yaml_ng::to_string(self).map_err(|e| EnsembleError::Yaml(e.to_string()))
    }

    /// Parse a JSON document.
    pub fn from_json_str(raw: &str) -> EnsembleResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> EnsembleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every agent id referenced by an agent node, in node order, without duplicates.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.nodes.iter().filter_map(|n| n.agent_id.as_ref()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

impl NodeDefinition {
    fn into_node(self) -> EnsembleResult<WorkflowNode> {
        let config: HashMap<String, serde_json::Value> = self.config.into_iter().collect();
        let kind = match self.node_type {
            NodeType::Start => NodeKind::Start,
            NodeType::End => NodeKind::End,
            NodeType::Checkpoint => NodeKind::Checkpoint,
            NodeType::Condition => NodeKind::Condition(None),
            NodeType::ErrorHandler => NodeKind::ErrorHandler(None),
            NodeType::Agent => NodeKind::Agent {
                agent_id: self.agent_id.clone().ok_or_else(|| {
                    EnsembleError::Workflow(format!("Agent node '{}' has no agent_id", self.node_id))
                })?,
            },
            NodeType::Parallel => {
                let branches = match config.get(BRANCHES_KEY) {
                    Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                        EnsembleError::Workflow(format!(
                            "Parallel node '{}' has invalid branches: {e}",
                            self.node_id
                        ))
                    })?,
                    None => Vec::new(),
                };
                NodeKind::Parallel { branches }
            }
        };

        let retry = WorkflowNode::retry_from_config(&config).map_err(|e| {
            EnsembleError::Workflow(format!("Node '{}': {e}", self.node_id))
        })?;

        let mut node = WorkflowNode::new(self.node_id, kind);
        node.config.extend(config);
        node.metadata = self.metadata.into_iter().collect();
        node.retry = retry;
        Ok(node)
    }

    fn from_node(node: &WorkflowNode) -> Self {
        Self {
            node_id: node.node_id.clone(),
            node_type: node.node_type(),
            agent_id: node.agent_id().map(str::to_string),
            config: node
                .config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            metadata: node
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl WorkflowGraph {
    /// Build a graph from a document.
    ///
    /// The document's `entry_node`, when present, must name its start node.
    pub fn from_definition(
        definition: WorkflowDefinition,
        coordinator: Arc<Coordinator>,
        config: WorkflowConfig,
    ) -> EnsembleResult<Self> {
        let mut graph = WorkflowGraph::with_config(definition.name, coordinator, config);
        for node in definition.nodes {
            graph.add_node(node.into_node()?)?;
        }
        for edge in definition.edges {
            graph.add_edge(WorkflowEdge::new(edge.from_node, edge.to_node, edge.condition))?;
        }
        if let Some(entry) = &definition.entry_node {
            if graph.entry_node() != Some(entry.as_str()) {
                return Err(EnsembleError::Workflow(format!(
                    "entry_node '{entry}' is not the workflow's start node"
                )));
            }
        }
        info!(workflow = %graph.name(), "Loaded workflow definition");
        Ok(graph)
    }

    /// Load a graph from a YAML workflow file.
    pub fn from_yaml_file(
        path: impl AsRef<Path>,
        coordinator: Arc<Coordinator>,
        config: WorkflowConfig,
    ) -> EnsembleResult<Self> {
        Self::from_definition(WorkflowDefinition::from_yaml_file(path)?, coordinator, config)
    }

    /// Export the graph's structure as a document.
    pub fn to_definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name().to_string(),
            nodes: self.nodes().map(NodeDefinition::from_node).collect(),
            edges: self
                .edges()
                .iter()
                .map(|e| EdgeDefinition {
                    from_node: e.from_node.clone(),
                    to_node: e.to_node.clone(),
                    condition: e.condition,
                })
                .collect(),
            entry_node: self.entry_node().map(str::to_string),
        }
    }
}
