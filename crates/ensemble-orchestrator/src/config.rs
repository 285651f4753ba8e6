use ensemble_core::{EnsembleError, EnsembleResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for every orchestration component, loadable from TOML.
///
/// All sections and fields are optional; missing values fall back to the
/// defaults below.
///
/// ```toml
/// [bus]
/// max_history = 1000
/// subscriber_buffer = 64
///
/// [crew]
/// poll_interval_ms = 100
/// worker_wait_ms = 500
///
/// [workflow]
/// max_steps = 100
/// default_retry_delay_ms = 1000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// `[bus]` section.
    #[serde(default)]
    pub bus: BusConfig,
    /// `[crew]` section.
    #[serde(default)]
    pub crew: CrewConfig,
    /// `[workflow]` section.
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl OrchestratorConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> EnsembleResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| EnsembleError::Config(format!("Invalid orchestrator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> EnsembleResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject values that would stall a component.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.bus.max_history == 0 {
            return Err(EnsembleError::Config(
                "bus.max_history must be at least 1".to_string(),
            ));
        }
        if self.bus.subscriber_buffer == 0 {
            return Err(EnsembleError::Config(
                "bus.subscriber_buffer must be at least 1".to_string(),
            ));
        }
        if self.workflow.max_steps == 0 {
            return Err(EnsembleError::Config(
                "workflow.max_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Message bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of published messages retained for introspection.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Messages buffered per subscriber before dispatch waits on it.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Crew execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrewConfig {
    /// Pause between queue polls when no task is eligible yet.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause in hierarchical mode when every worker is at capacity.
    #[serde(default = "default_worker_wait_ms")]
    pub worker_wait_ms: u64,
}

impl CrewConfig {
    /// `poll_interval_ms` as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `worker_wait_ms` as a [`Duration`].
    pub fn worker_wait(&self) -> Duration {
        Duration::from_millis(self.worker_wait_ms)
    }
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            worker_wait_ms: default_worker_wait_ms(),
        }
    }
}

/// Workflow graph settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Step budget used by [`WorkflowGraph::run`](crate::graph::WorkflowGraph::run).
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Retry delay for agent nodes whose definition does not set one.
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            default_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_max_history() -> usize {
    1000
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_worker_wait_ms() -> u64 {
    500
}

fn default_max_steps() -> usize {
    100
}

fn default_retry_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.bus.max_history, 1000);
        assert_eq!(config.crew.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.crew.worker_wait(), Duration::from_millis(500));
        assert_eq!(config.workflow.max_steps, 100);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let raw = r#"
            [bus]
            max_history = 10

            [workflow]
            max_steps = 7
        "#;
        let config = OrchestratorConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.bus.max_history, 10);
        assert_eq!(config.bus.subscriber_buffer, 64);
        assert_eq!(config.workflow.max_steps, 7);
        assert_eq!(config.crew, CrewConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        let err = OrchestratorConfig::from_toml_str("[bus\nmax_history = ").unwrap_err();
        assert!(matches!(err, EnsembleError::Config(_)));
    }

    #[test]
    fn test_zero_history_rejected() {
        let err = OrchestratorConfig::from_toml_str("[bus]\nmax_history = 0").unwrap_err();
        assert!(err.to_string().contains("max_history"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ensemble.toml");
        std::fs::write(&path, "[crew]\npoll_interval_ms = 5\n").unwrap();
        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.crew.poll_interval_ms, 5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = OrchestratorConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, EnsembleError::Io(_)));
    }
}
