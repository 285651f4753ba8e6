//! Core types and error definitions for the Ensemble orchestration engine.
//!
//! This crate holds the contract shared by every orchestration pattern: the
//! [`Agent`] capability, the per-call [`AgentContext`], cooperative
//! cancellation, and the unified error type.
//!
//! # Main types
//!
//! - [`EnsembleError`]: Unified error enum for all orchestration components.
//! - [`EnsembleResult`]: Convenience alias for `Result<T, EnsembleError>`.
//! - [`Agent`]: Async `process(input, context) -> output` capability.
//! - [`AgentContext`]: Session id, metadata and cancellation token for one call.
//! - [`CancellationToken`]: Shared flag used to abort in-flight agent calls.
//! - [`Role`]: Author of a conversation entry.

/// The agent capability contract.
pub mod agent;
/// Cooperative cancellation.
pub mod cancellation;
/// Error types.
pub mod error;

pub use agent::{agent_fn, invoke_agent, Agent, AgentContext, FnAgent};
pub use cancellation::CancellationToken;
pub use error::{EnsembleError, EnsembleResult};

use serde::{Deserialize, Serialize};

/// The role of the participant that authored a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user or calling system.
    User,
    /// An agent's answer.
    Assistant,
    /// An orchestration event (e.g. a recorded handoff).
    System,
    /// Output produced by a tool invocation.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}
