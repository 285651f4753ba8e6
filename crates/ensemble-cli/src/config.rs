//! Host configuration file (`ensemble.toml`).
//!
//! The orchestrator sections (`[bus]`, `[crew]`, `[workflow]`) are read
//! straight into [`OrchestratorConfig`]; the host adds a `[logging]` section.

use ensemble_core::{EnsembleError, EnsembleResult};
use ensemble_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Everything `ensemble.toml` can hold.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnsembleConfig {
    /// Bus, crew and workflow tunables.
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    /// `[logging]` section.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Read and parse a TOML config file into an [`EnsembleConfig`].
pub fn parse_config(path: &Path) -> EnsembleResult<EnsembleConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EnsembleError::Config(format!(
            "Failed to read config '{}': {}",
            path.display(),
            e
        ))
    })?;
    let config: EnsembleConfig = toml::from_str(&content).map_err(|e| {
        EnsembleError::Config(format!(
            "Failed to parse config '{}': {}",
            path.display(),
            e
        ))
    })?;
    config.orchestrator.validate()?;
    Ok(config)
}

/// Install the global subscriber. Logs go to stderr so stdout stays machine-readable.
pub fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
