use crate::types::CoordinationStrategy;
use chrono::{DateTime, Utc};
use ensemble_core::{Agent, EnsembleError, EnsembleResult};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Status every agent starts with.
pub const DEFAULT_AGENT_STATUS: &str = "idle";

/// Callback invoked for every event published under a subscribed event type.
pub type EventHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, EnsembleResult<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(func: F) -> EventHandler
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EnsembleResult<()>> + Send + 'static,
{
    Arc::new(move |data| func(data).boxed())
}

/// Everything the coordinator knows about one registered agent.
#[derive(Clone)]
pub struct AgentRegistration {
    /// Unique agent id.
    pub agent_id: String,
    /// The agent itself.
    pub agent: Arc<dyn Agent>,
    /// Capability tags used for lookup.
    pub capabilities: BTreeSet<String>,
    /// Free-form status, [`DEFAULT_AGENT_STATUS`] on registration.
    pub status: String,
    /// Caller-supplied metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// When the agent was (last) registered.
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for AgentRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistration")
            .field("agent_id", &self.agent_id)
            .field("capabilities", &self.capabilities)
            .field("status", &self.status)
            .field("metadata", &self.metadata)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

impl AgentRegistration {
    /// Whether the agent advertises `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

struct OrchestratorEntry {
    instance: Arc<dyn Any + Send + Sync>,
    strategy: CoordinationStrategy,
}

/// Central registry of agents, orchestrators and event handlers.
///
/// The coordinator is an explicit shared handle (`Arc<Coordinator>`) injected
/// into the handoff manager, crews and workflow graphs.
#[derive(Default)]
pub struct Coordinator {
    agents: RwLock<Vec<AgentRegistration>>,
    orchestrators: RwLock<HashMap<String, OrchestratorEntry>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl Coordinator {
    /// An empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Re-registering an id replaces the previous entry in place.
    pub async fn register<I, S>(
        &self,
        agent_id: impl Into<String>,
        agent: Arc<dyn Agent>,
        capabilities: I,
        metadata: HashMap<String, serde_json::Value>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registration = AgentRegistration {
            agent_id: agent_id.into(),
            agent,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: DEFAULT_AGENT_STATUS.to_string(),
            metadata,
            registered_at: Utc::now(),
        };

        let mut agents = self.agents.write().await;
        if let Some(existing) = agents
            .iter_mut()
            .find(|r| r.agent_id == registration.agent_id)
        {
            warn!(agent_id = %registration.agent_id, "Agent already registered, overwriting");
            *existing = registration;
        } else {
            info!(
                agent_id = %registration.agent_id,
                capabilities = ?registration.capabilities,
                "Registered agent"
            );
            agents.push(registration);
        }
    }

    /// Remove an agent. Returns whether it was registered.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|r| r.agent_id != agent_id);
        let removed = agents.len() != before;
        if removed {
            info!(agent_id = %agent_id, "Unregistered agent");
        }
        removed
    }

    /// The agent registered under `agent_id`.
    pub async fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .read()
            .await
            .iter()
            .find(|r| r.agent_id == agent_id)
            .map(|r| r.agent.clone())
    }

    /// Like [`get`](Self::get), but a missing agent is an [`EnsembleError::AgentNotFound`].
    pub async fn require(&self, agent_id: &str) -> EnsembleResult<Arc<dyn Agent>> {
        self.get(agent_id)
            .await
            .ok_or_else(|| EnsembleError::AgentNotFound(agent_id.to_string()))
    }

    /// A snapshot of the registration for `agent_id`.
    pub async fn registration(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents
            .read()
            .await
            .iter()
            .find(|r| r.agent_id == agent_id)
            .cloned()
    }

    /// Registrations in registration order, optionally restricted to one capability.
    pub async fn list(&self, capability: Option<&str>) -> Vec<AgentRegistration> {
        self.agents
            .read()
            .await
            .iter()
            .filter(|r| capability.map_or(true, |c| r.has_capability(c)))
            .cloned()
            .collect()
    }

    /// Registered agent ids in registration order.
    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents
            .read()
            .await
            .iter()
            .map(|r| r.agent_id.clone())
            .collect()
    }

    /// First registration, in registration order, that advertises `capability`.
    pub async fn find_first(&self, capability: &str) -> Option<AgentRegistration> {
        self.agents
            .read()
            .await
            .iter()
            .find(|r| r.has_capability(capability))
            .cloned()
    }

    /// Update an agent's status.
    pub async fn set_status(&self, agent_id: &str, status: impl Into<String>) -> EnsembleResult<()> {
        let mut agents = self.agents.write().await;
        let registration = agents
            .iter_mut()
            .find(|r| r.agent_id == agent_id)
            .ok_or_else(|| EnsembleError::AgentNotFound(agent_id.to_string()))?;
        registration.status = status.into();
        debug!(agent_id = %agent_id, status = %registration.status, "Agent status changed");
        Ok(())
    }

    /// Current status of an agent.
    pub async fn status(&self, agent_id: &str) -> Option<String> {
        self.agents
            .read()
            .await
            .iter()
            .find(|r| r.agent_id == agent_id)
            .map(|r| r.status.clone())
    }

    /// Number of registered agents.
    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Register a named orchestrator instance (handoff manager, crew, graph, ...).
    pub async fn register_orchestrator(
        &self,
        name: impl Into<String>,
        instance: Arc<dyn Any + Send + Sync>,
        strategy: CoordinationStrategy,
    ) {
        let name = name.into();
        let mut orchestrators = self.orchestrators.write().await;
        if orchestrators.contains_key(&name) {
            warn!(orchestrator = %name, "Orchestrator already registered, overwriting");
        } else {
            info!(orchestrator = %name, strategy = %strategy, "Registered orchestrator");
        }
        orchestrators.insert(name, OrchestratorEntry { instance, strategy });
    }

    /// Look up an orchestrator and downcast it to its concrete type.
    ///
    /// Returns `None` if the name is unknown or the instance is of another type.
    pub async fn get_orchestrator<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let instance = self
            .orchestrators
            .read()
            .await
            .get(name)
            .map(|entry| entry.instance.clone())?;
        instance.downcast::<T>().ok()
    }

    /// Registered orchestrator names with their strategy, sorted by name.
    pub async fn list_orchestrators(&self) -> Vec<(String, CoordinationStrategy)> {
        let mut list: Vec<_> = self
            .orchestrators
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.strategy))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Add a handler for `event_type`.
    pub async fn subscribe(&self, event_type: impl Into<String>, handler: EventHandler) {
        let event_type = event_type.into();
        debug!(event_type = %event_type, "Event handler subscribed");
        self.handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Deliver `data` to every handler of `event_type`. Returns how many handlers ran.
    ///
    /// Handlers run after the lock is released, so a handler may itself
    /// subscribe or publish. Handler errors are logged and do not stop delivery.
    pub async fn publish(&self, event_type: &str, data: serde_json::Value) -> usize {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or_default();

        for handler in &handlers {
            if let Err(e) = handler(data.clone()).await {
                error!(event_type = %event_type, error = %e, "Event handler failed");
            }
        }
        handlers.len()
    }

    /// Stop every agent and clear all registries.
    pub async fn shutdown(&self) {
        let agents: Vec<AgentRegistration> = std::mem::take(&mut *self.agents.write().await);
        for registration in &agents {
            if let Err(e) = registration.agent.stop().await {
                error!(agent_id = %registration.agent_id, error = %e, "Agent failed to stop");
            }
        }
        self.orchestrators.write().await.clear();
        self.handlers.write().await.clear();
        info!(agents = agents.len(), "Coordinator shut down");
    }
}
