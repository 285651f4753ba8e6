//! `ensemble` command-line host.
//!
//! Loads `ensemble.toml`, installs logging, and validates, shows or runs
//! workflow documents.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ensemble_core::{agent_fn, Agent, AgentContext, EnsembleError};
use ensemble_orchestrator::{
    Coordinator, WorkflowConfig, WorkflowDefinition, WorkflowGraph, MAX_STEPS_EXCEEDED,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{init_logging, parse_config, EnsembleConfig};

#[derive(Parser)]
#[command(name = "ensemble", about = "Ensemble multi-agent orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ensemble.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with workflow documents
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Check that a workflow document builds into a runnable graph
    Validate {
        /// YAML workflow document
        file: PathBuf,
    },
    /// Print a workflow document as JSON
    Show {
        /// YAML workflow document
        file: PathBuf,
    },
    /// Run a workflow with an echo agent standing in for every agent_id
    Run {
        /// YAML workflow document
        file: PathBuf,
        /// Value bound to the `input` variable
        #[arg(short, long, default_value = "")]
        input: String,
        /// Step budget (overrides config)
        #[arg(long)]
        max_steps: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing default config file is fine; an explicitly broken one is not.
    let config_found = cli.config.exists();
    let config = if config_found {
        parse_config(&cli.config)?
    } else {
        EnsembleConfig::default()
    };
    init_logging(&config.logging);
    if config_found {
        info!(path = %cli.config.display(), "Loaded configuration");
    } else {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Workflow { action } => match action {
            WorkflowAction::Validate { file } => {
                let definition = load_definition(&file)?;
                let graph = build_graph(definition, &config.orchestrator.workflow).await?;
                graph.validate()?;
                println!(
                    "{}: ok ({} nodes, {} edges)",
                    graph.name(),
                    graph.nodes().count(),
                    graph.edges().len()
                );
            }
            WorkflowAction::Show { file } => {
                let definition = load_definition(&file)?;
                println!("{}", definition.to_json()?);
            }
            WorkflowAction::Run {
                file,
                input,
                max_steps,
            } => {
                let definition = load_definition(&file)?;
                let graph = build_graph(definition, &config.orchestrator.workflow).await?;
                let max_steps = max_steps.unwrap_or(config.orchestrator.workflow.max_steps);

                let state = graph.execute(&input, None, max_steps).await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
                match state.error.as_deref() {
                    None => {}
                    Some(MAX_STEPS_EXCEEDED) => {
                        return Err(EnsembleError::StepLimit(max_steps).into());
                    }
                    Some(error) => anyhow::bail!("Workflow '{}' failed: {error}", graph.name()),
                }
            }
        },
    }

    Ok(())
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    WorkflowDefinition::from_yaml_file(path)
        .with_context(|| format!("Failed to load workflow '{}'", path.display()))
}

/// Build a graph backed by echo agents for every agent the document references.
async fn build_graph(
    definition: WorkflowDefinition,
    config: &WorkflowConfig,
) -> anyhow::Result<WorkflowGraph> {
    let coordinator = Arc::new(Coordinator::new());
    for agent_id in definition.agent_ids() {
        coordinator
            .register(
                agent_id.as_str(),
                echo_agent(&agent_id),
                ["echo"],
                HashMap::new(),
            )
            .await;
    }
    Ok(WorkflowGraph::from_definition(
        definition,
        coordinator,
        config.clone(),
    )?)
}

/// Replies with its input, tagged with the agent id.
fn echo_agent(agent_id: &str) -> Arc<dyn Agent> {
    let agent_id = agent_id.to_string();
    agent_fn(move |input: String, _context: AgentContext| {
        let agent_id = agent_id.clone();
        async move { Ok(format!("[{agent_id}] {input}")) }
    })
}
