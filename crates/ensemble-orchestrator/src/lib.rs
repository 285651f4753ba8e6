//! Multi-agent orchestration patterns for the Ensemble engine.
//!
//! Agents are registered once with a shared [`Coordinator`] and then driven by
//! one of four patterns: explicit or rule-based handoffs between agents, crews
//! executing a dependency-aware task queue, workflow graphs with conditional
//! routing and retries, and a prioritised publish/subscribe message bus.
//!
//! # Main types
//!
//! - [`Coordinator`]: Agent registry, orchestrator registry and event fan-out.
//! - [`HandoffManager`]: Transfers control between agents with a carried context.
//! - [`Crew`]: Role-based team executing a [`TaskQueue`] sequentially, in parallel or hierarchically.
//! - [`WorkflowGraph`]: Directed graph of nodes executed over a mutable [`WorkflowState`].
//! - [`WorkflowDefinition`]: YAML/JSON document form of a workflow graph.
//! - [`MessageBus`]: Topic-based bus with priority dispatch and per-handler stats.
//! - [`OrchestratorConfig`]: Tunables for all of the above, loadable from TOML.

/// Orchestrator configuration.
pub mod config;
/// Agent and orchestrator registry.
pub mod coordinator;
/// Role-based crews.
pub mod crew;
/// Serialisable workflow documents.
pub mod definition;
/// Workflow graph execution.
pub mod graph;
/// Agent-to-agent handoffs.
pub mod handoff;
/// Publish/subscribe message bus.
pub mod message_bus;
/// Workflow nodes and edges.
pub mod node;
/// Workflow execution state and checkpoints.
pub mod state;
/// Dependency-aware task queue.
pub mod task_queue;
/// Shared orchestration types (Task, TaskStatus, CrewRole, etc.).
pub mod types;

pub use config::{BusConfig, CrewConfig, OrchestratorConfig, WorkflowConfig};
pub use coordinator::{event_handler, AgentRegistration, Coordinator, EventHandler};
pub use crew::{Crew, CrewMember, CrewReport, CrewStatus, TaskOutcome};
pub use definition::{EdgeDefinition, NodeDefinition, WorkflowDefinition};
pub use graph::{RunStatus, WorkflowGraph, WorkflowRun, MAX_STEPS_EXCEEDED};
pub use handoff::{
    CallFrame, ConversationEntry, HandoffContext, HandoffManager, HandoffResult, HandoffRule,
    HandoffStatus,
};
pub use message_bus::{
    message_handler, HandlerStats, Message, MessageBus, MessageCallback, MessageFilter,
    MessagePriority, WILDCARD_TOPIC,
};
pub use node::{
    ConditionFn, EdgeCondition, ErrorHandlerFn, NodeKind, NodeType, RetryPolicy, WorkflowEdge,
    WorkflowNode,
};
pub use state::{Checkpoint, HistoryEntry, WorkflowState};
pub use task_queue::TaskQueue;
pub use types::{CoordinationStrategy, CrewRole, ExecutionMode, Task, TaskStatus};
