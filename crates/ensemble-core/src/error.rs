use thiserror::Error;

/// A convenience `Result` alias using [`EnsembleError`].
pub type EnsembleResult<T> = Result<T, EnsembleError>;

/// Top-level error type for the orchestration engine.
///
/// Variants fall into four groups: lookups that found nothing, failures
/// raised while running an agent, structural problems detected while a crew
/// or graph is being built, and exhausted execution budgets.
#[derive(Error, Debug)]
pub enum EnsembleError {
    /// No agent is registered under the given id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No task with the given id exists in the queue.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No workflow node with the given id exists in the graph.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// No checkpoint with the given id exists in the workflow state.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// An agent invocation failed.
    #[error("Agent error: {0}")]
    Agent(String),

    /// Work was aborted through a cancellation token.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The crew definition is invalid (duplicate manager, dependency cycle, ...).
    #[error("Crew error: {0}")]
    Crew(String),

    /// The workflow graph definition is invalid.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// A workflow ran out of its step budget.
    #[error("Step limit of {0} exceeded")]
    StepLimit(usize),

    /// Configuration could not be parsed or is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// A YAML document could not be parsed or produced.
    #[error("YAML error: {0}")]
    Yaml(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnsembleError {
    /// Whether this error reports a missing agent, task, node or checkpoint.
    ///
    /// Not-found errors are surfaced to the caller and never retried.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EnsembleError::AgentNotFound(_)
                | EnsembleError::TaskNotFound(_)
                | EnsembleError::NodeNotFound(_)
                | EnsembleError::CheckpointNotFound(_)
        )
    }

    /// Whether this error was produced by a cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EnsembleError::Cancelled(_))
    }
}
