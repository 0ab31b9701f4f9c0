use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use foundry::config::Config;
use foundry::core::{Plan, TaskStatus};
use foundry::models::{
    builtin_catalog, classify_text, Classification, CommandAvailability, ModelRegistry,
    ModelResolver,
};
use foundry::orchestration::{
    BuildSummary, Collaborators, CommandInvoker, InvokeOptions, ModelAnalyzer, ModelClassifier,
    ModelCoder, ModelGenerator, ModelInvoker, ModelReviewer, Pipeline, PipelineEvent,
    StaticVerifier, SystemCpu, WorkerPool,
};
use foundry::state::SnapshotStore;
use foundry::{flog, flog_warn, Result};

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(15);

/// Foundry - builds a project from a task plan with locally served models
#[derive(Parser, Debug)]
#[command(name = "foundry")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    FOUNDRY_DEBUG=1     Enable debug logging (alternative to --debug)\n    FOUNDRY_LOG=<level> Set an explicit log level"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foundry/foundry.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build every task in a plan file
    Run {
        /// Path to the plan JSON
        plan: PathBuf,

        /// Project root that receives the artifacts (default: current directory)
        #[arg(long, short = 'p')]
        project: Option<PathBuf>,
    },

    /// Continue an interrupted build
    Resume {
        #[arg(long, short = 'p')]
        project: Option<PathBuf>,
    },

    /// Show the saved build state of a project
    Status {
        #[arg(long, short = 'p')]
        project: Option<PathBuf>,
    },

    /// Classify a description and list the models a build would need
    Models {
        /// Project description
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    foundry::log::init(cli.debug);

    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    let success = match cli.command {
        Command::Run { plan, project } => {
            let root = project_root(project)?;
            let plan = Plan::load(&plan)?;
            rt.block_on(build(config, root, Some(plan)))?
        }
        Command::Resume { project } => {
            let root = project_root(project)?;
            rt.block_on(build(config, root, None))?
        }
        Command::Status { project } => {
            let root = project_root(project)?;
            rt.block_on(show_status(&root))?;
            true
        }
        Command::Models { text } => {
            rt.block_on(show_models(&config, &text.join(" ")))?;
            true
        }
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn project_root(project: Option<PathBuf>) -> Result<PathBuf> {
    match project {
        Some(dir) => Ok(dir),
        None => Ok(std::env::current_dir()?),
    }
}

fn registry(config: &Config) -> Result<Arc<ModelRegistry>> {
    let mut specs = builtin_catalog();
    specs.extend(config.models.iter().cloned());
    let source =
        CommandAvailability::new(&config.invoker.availability_command, AVAILABILITY_TIMEOUT)?;
    Ok(Arc::new(ModelRegistry::new(specs, Box::new(source))))
}

/// Run a fresh build when `plan` is given, otherwise resume the saved one.
async fn build(config: Config, root: PathBuf, plan: Option<Plan>) -> Result<bool> {
    flog!("Build requested in {}", root.display());

    let registry = registry(&config)?;
    if let Err(e) = registry.init().await {
        flog_warn!("Could not list available models: {}", e);
        eprintln!("warning: could not list available models: {}", e);
    }
    let resolver = ModelResolver::new(Arc::clone(&registry), &config.default_model);

    let invoker: Arc<dyn ModelInvoker> = Arc::new(CommandInvoker::new(&config.invoker)?);
    let options = InvokeOptions::default();
    let collaborators = Collaborators {
        generator: Arc::new(ModelGenerator::new(Arc::clone(&invoker), options)),
        reviewer: Arc::new(ModelReviewer::new(Arc::clone(&invoker), options)),
        verifier: Arc::new(StaticVerifier::new(&root, config.verifier.clone())),
        analyzer: Arc::new(ModelAnalyzer::new(Arc::clone(&invoker), options)),
        coder: Arc::new(ModelCoder::new(Arc::clone(&invoker), options)),
    };

    let pool = WorkerPool::new(config.pool.clone());
    pool.start_monitor(SystemCpu::new());

    let (tx, rx) = mpsc::channel(256);
    let mut pipeline = Pipeline::new(
        config.pipeline.clone(),
        pool,
        resolver.clone(),
        collaborators,
        &root,
    )
    .strict_dependencies(config.strict_dependencies)
    .with_events(tx);
    if let Some(model) = resolver.resolve(ModelClassifier::ROLE, Classification::LOWEST) {
        pipeline = pipeline.with_classifier(Arc::new(ModelClassifier::new(invoker, &model)));
    }

    let printer = tokio::spawn(print_events(rx));

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; stopping after the current round");
            cancel.cancel();
        }
    });

    let result = match plan {
        Some(plan) => pipeline.run_with_summary(plan).await,
        None => pipeline.resume_with_summary().await,
    };
    pipeline.shutdown().await;
    drop(pipeline);
    let _ = printer.await;

    let summary = result?;
    print_summary(&summary, &root);
    Ok(summary.success())
}

async fn print_events(mut rx: mpsc::Receiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::BuildStarted {
                build_id,
                tasks,
                classification,
            } => println!("Build {} started: {} task(s), {}", build_id, tasks, classification),
            PipelineEvent::RoundStarted { round } => println!("Round {}", round),
            PipelineEvent::PhaseStarted { phase, tasks, .. } => {
                println!("  {:?}: {} task(s)", phase, tasks.len())
            }
            PipelineEvent::TaskStatusChanged { task_id, status } => {
                println!("    task {} -> {}", task_id, status)
            }
            PipelineEvent::TaskEscalated {
                task_id,
                role,
                model,
            } => println!("    task {}: {} escalated to {}", task_id, role, model),
            PipelineEvent::RoundFinished { .. } | PipelineEvent::BuildFinished { .. } => {}
        }
    }
}

fn print_summary(summary: &BuildSummary, root: &Path) {
    println!();
    println!("Build:          {}", summary.build_id);
    println!("Classification: {}", summary.classification);
    println!("Result:         {}", summary);
    if summary.interrupted {
        println!();
        println!("Continue with: foundry resume --project {}", root.display());
    }
}

async fn show_status(root: &Path) -> Result<()> {
    let store = SnapshotStore::new(root);
    if !store.exists() {
        println!("No build in {}", root.display());
        return Ok(());
    }
    let snapshot = store.load().await?;
    println!("Build:          {}", snapshot.build_id);
    println!("Classification: {}", snapshot.classification);
    println!("Rounds:         {}", snapshot.round);
    println!("Saved:          {}", snapshot.saved_at.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "State:          {}",
        if snapshot.is_finished() { "finished" } else { "resumable" }
    );
    println!();
    for (status, count) in snapshot.status_counts() {
        if count > 0 {
            println!("  {:<12} {}", status.as_str(), count);
        }
    }
    for task in snapshot
        .tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
    {
        println!(
            "  {} {}: {}",
            task.label(),
            task.status,
            task.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn show_models(config: &Config, text: &str) -> Result<()> {
    let classification = classify_text(text);
    let registry = registry(config)?;
    if let Err(e) = registry.init().await {
        eprintln!("warning: could not list available models: {}", e);
    }
    let resolver = ModelResolver::new(registry, &config.default_model);

    println!("Classification: {}", classification);
    for (role, model) in resolver.table(classification).iter() {
        println!("  {:<11} {}", role.as_str(), model);
    }
    println!("Required units:");
    for unit in resolver.required_units(classification) {
        println!("  {}", unit);
    }
    Ok(())
}
