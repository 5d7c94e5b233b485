use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use agentflow::broker::MemoryBroker;
use agentflow::config::Config;
use agentflow::consumer::{AgentToolContext, TaskHandler};
use agentflow::core::{Agent, ImplementationPlan, ImplementationStep, ProjectId, RoutedTask};
use agentflow::directory::InMemoryAgentDirectory;
use agentflow::runtime::AgentRuntime;
use agentflow::scheduler::{
    detect_conflicts, group_steps_by_layer, should_parallelize, ExecutionContext,
};
use agentflow::Result;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// agentflow - event-driven multi-agent orchestration
#[derive(Parser, Debug)]
#[command(name = "agentflow")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    AGENTFLOW_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG            Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.agentflow/agentflow.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the router and the configured agents until Ctrl-C
    Serve,

    /// Show how an implementation plan would be layered and executed
    Layers {
        /// Path to a plan JSON file
        plan: PathBuf,
    },

    /// Show the skill selected for a file
    Skill {
        /// File path of the step
        path: String,

        /// Step description
        description: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

/// Acknowledges tasks in the conversation. Stands in for a model-backed handler.
struct AcknowledgingHandler;

#[async_trait]
impl TaskHandler for AcknowledgingHandler {
    async fn handle(&self, task: &RoutedTask, tools: &AgentToolContext) -> Result<()> {
        info!(task_id = %task.task_id, task_type = %task.task_type, "task acknowledged");
        tools
            .send_message(&format!("received {} ({})", task.task_type, task.routing_reason))
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    agentflow::log::init(cli.debug);

    match cli.command {
        Command::Serve => run_serve().await,
        Command::Layers { plan } => run_layers(&plan),
        Command::Skill { path, description } => run_skill(&path, description.as_deref()),
        Command::Config => run_config(),
    }
}

async fn run_serve() -> Result<()> {
    let config = Config::load()?;
    let broker = MemoryBroker::new(config.broker.partitions);
    let directory = Arc::new(InMemoryAgentDirectory::new());
    let default_project = ProjectId::new();

    for seed in &config.agents {
        let project = seed.project_id.unwrap_or(default_project);
        let agent = Agent::new(project, seed.role).with_capabilities(seed.capabilities.clone());
        let id = directory.register(agent).await;
        println!("  {} {} (project {})", seed.role, id.short(), project.short());
    }

    let mut runtime = AgentRuntime::new(
        config,
        Arc::new(broker),
        directory,
        Arc::new(AcknowledgingHandler),
    );
    runtime.start().await?;
    println!(
        "agentflow serving {} agent(s), press Ctrl-C to stop",
        runtime.consumer_count()
    );

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    runtime.shutdown(SHUTDOWN_TIMEOUT).await
}

fn run_layers(path: &Path) -> Result<()> {
    let config = Config::load()?;
    let ctx = ExecutionContext::new(Arc::new(config.skill_registry()?));
    let plan = ImplementationPlan::from_json(&std::fs::read_to_string(path)?)?;
    let layers = group_steps_by_layer(&plan)?;
    let parallel = should_parallelize(&layers, config.scheduler.min_parallel_steps);

    println!(
        "{} step(s) in {} layer(s), mode: {}",
        plan.len(),
        layers.len(),
        if parallel { "parallel" } else { "sequential" }
    );
    for layer in &layers {
        println!("\nlayer {}:", layer.priority);
        for step in &layer.steps {
            println!(
                "  {:<12} {:<40} {}",
                step.id,
                step.file_path,
                step_skill(&ctx, step)
            );
        }
        for conflict in detect_conflicts(layer) {
            let steps: Vec<String> = conflict.steps.iter().map(|s| s.to_string()).collect();
            println!("  conflict on {}: {}", conflict.path, steps.join(", "));
        }
    }
    Ok(())
}

/// Id of the skill a step runner would activate for `step`.
fn step_skill(ctx: &ExecutionContext, step: &ImplementationStep) -> String {
    ctx.skill_for(step)
        .map(|activation| activation.skill_id.clone())
        .unwrap_or_else(|| "-".to_string())
}

fn run_skill(path: &str, description: Option<&str>) -> Result<()> {
    let registry = Config::load()?.skill_registry()?;
    match registry.detect(path, description.unwrap_or_default()) {
        Some(skill) => {
            println!("{} (role: {}, tier: {:?})", skill.id, skill.role, skill.model_tier);
            for fragment in &skill.prompt_fragments {
                println!("  - {}", fragment);
            }
        }
        None => println!("no skill matches {}", path),
    }
    Ok(())
}

fn run_config() -> Result<()> {
    let config = Config::load()?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
