use chrono::{DateTime, Utc};
use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// One executed node, as recorded in [`WorkflowState::history`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Node that ran.
    pub node_id: String,
    /// What it produced.
    pub result: serde_json::Value,
    /// When it finished.
    pub timestamp: DateTime<Utc>,
    /// Extra annotations, e.g. `failed_node` for error handlers.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Snapshot taken by a checkpoint node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Variables at checkpoint time.
    pub variables: HashMap<String, serde_json::Value>,
    /// History length at checkpoint time.
    pub history_len: usize,
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
}

/// Mutable state threaded through one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Id of the run.
    pub workflow_id: String,
    /// Node about to run; `None` once traversal has ended.
    pub current_node: Option<String>,
    /// Workflow variables; `input` holds the run input.
    pub variables: HashMap<String, serde_json::Value>,
    /// Executed nodes, oldest first.
    pub history: Vec<HistoryEntry>,
    /// Checkpoints by node id.
    pub checkpoints: HashMap<String, Checkpoint>,
    /// Terminal error, if the run failed.
    pub error: Option<String>,
    /// When the run started.
    pub created_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state positioned at `entry_node`.
    pub fn new(workflow_id: impl Into<String>, entry_node: Option<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            current_node: entry_node,
            variables: HashMap::new(),
            history: Vec::new(),
            checkpoints: HashMap::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Read a variable.
    pub fn get_variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    /// Write a variable.
    pub fn set_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(key.into(), value);
    }

    /// Record an executed node.
    pub fn add_to_history(
        &mut self,
        node_id: impl Into<String>,
        result: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        self.history.push(HistoryEntry {
            node_id: node_id.into(),
            result,
            timestamp: Utc::now(),
            metadata,
        });
    }

    /// Snapshot the variables and history length under `checkpoint_id`.
    /// An existing checkpoint with the same id is replaced.
    pub fn create_checkpoint(&mut self, checkpoint_id: impl Into<String>) {
        let checkpoint_id = checkpoint_id.into();
        debug!(workflow_id = %self.workflow_id, checkpoint = %checkpoint_id, "Checkpoint created");
        self.checkpoints.insert(
            checkpoint_id,
            Checkpoint {
                variables: self.variables.clone(),
                history_len: self.history.len(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Restore the variables and truncate the history to a checkpoint.
    ///
    /// `current_node` and the checkpoint set itself are left untouched.
    pub fn restore_checkpoint(&mut self, checkpoint_id: &str) -> EnsembleResult<()> {
        let checkpoint = self
            .checkpoints
            .get(checkpoint_id)
            .ok_or_else(|| EnsembleError::CheckpointNotFound(checkpoint_id.to_string()))?;
        self.variables = checkpoint.variables.clone();
        self.history.truncate(checkpoint.history_len);
        debug!(workflow_id = %self.workflow_id, checkpoint = %checkpoint_id, "Checkpoint restored");
        Ok(())
    }

    /// Fold a parallel branch back in, keeping only what the branch changed
    /// relative to `base`.
    pub(crate) fn merge_branch(&mut self, base: &WorkflowState, branch: WorkflowState) {
        for (key, value) in branch.variables {
            if base.variables.get(&key) != Some(&value) {
                self.variables.insert(key, value);
            }
        }
        for (id, checkpoint) in branch.checkpoints {
            if base.checkpoints.get(&id) != Some(&checkpoint) {
                self.checkpoints.insert(id, checkpoint);
            }
        }
    }
}
