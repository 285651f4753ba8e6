use crate::cancellation::CancellationToken;
use crate::error::{EnsembleError, EnsembleResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// The capability every orchestrated agent exposes.
///
/// The engine never looks inside an agent: it hands over an input string and
/// a context, and records whatever string or error comes back.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Process one input and produce an output.
    async fn process(&self, input: &str, context: &AgentContext) -> EnsembleResult<String>;

    /// Release any resources held by the agent. Called on coordinator shutdown.
    async fn stop(&self) -> EnsembleResult<()> {
        Ok(())
    }
}

/// Per-invocation context handed to [`Agent::process`].
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    /// Identifier of the unit of work (handoff id, task id, workflow id).
    pub session_id: String,
    /// Orchestration metadata: crew name, shared memory snapshot, handoff context, ...
    pub metadata: HashMap<String, serde_json::Value>,
    /// Token the orchestrator fires to abort this invocation.
    pub cancel: CancellationToken,
}

impl AgentContext {
    /// A context with no metadata and a fresh token.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            metadata: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Use the given token instead of a fresh one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Look up a metadata entry.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}

/// Run an agent, aborting the in-flight call as soon as the context's token fires.
///
/// The agent future is dropped on cancellation, so work it has not yet
/// awaited never happens.
pub async fn invoke_agent(
    agent: &dyn Agent,
    input: &str,
    context: &AgentContext,
) -> EnsembleResult<String> {
    if context.cancel.is_cancelled() {
        return Err(EnsembleError::Cancelled(format!(
            "'{}' was cancelled before the agent started",
            context.session_id
        )));
    }

    tokio::select! {
        biased;
        () = context.cancel.cancelled() => Err(EnsembleError::Cancelled(format!(
            "'{}' was cancelled while the agent was running",
            context.session_id
        ))),
        result = agent.process(input, context) => result,
    }
}

/// An [`Agent`] backed by an async closure.
///
/// Handy for hosts that wrap an existing function and for tests.
pub struct FnAgent<F> {
    func: F,
}

impl<F> FnAgent<F> {
    /// Wrap `func`.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(String, AgentContext) -> Fut + Send + Sync,
    Fut: Future<Output = EnsembleResult<String>> + Send,
{
    async fn process(&self, input: &str, context: &AgentContext) -> EnsembleResult<String> {
        (self.func)(input.to_string(), context.clone()).await
    }
}

/// Wrap an async closure as a shareable agent handle.
pub fn agent_fn<F, Fut>(func: F) -> Arc<dyn Agent>
where
    F: Fn(String, AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EnsembleResult<String>> + Send + 'static,
{
    Arc::new(FnAgent::new(func))
}
