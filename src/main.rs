use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use bookwright::advisor::{TelemetryWindow, read_journal_dir};
use bookwright::batch::run_batch;
use bookwright::config::{CliOverrides, Config};
use bookwright::errors::{PipelineError, exit};
use bookwright::orchestrator::summary::{display_advisor_report, display_run_summary, display_status};
use bookwright::orchestrator::Orchestrator;
use bookwright::phase::PhaseLabel;
use bookwright::pipeline_config::{LearningMode, PipelineToml};
use bookwright::repair::{FailureRegistry, RepairContext, run_repair_loop};
use bookwright::runner::PhaseRunner;
use bookwright::state::StateStore;
use bookwright::telemetry::TelemetrySink;

#[derive(Parser)]
#[command(name = "bookwright")]
#[command(version, about = "Audiobook production pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the workdir layout and a starter bookwright.toml
    Init {
        /// Directory to initialize (defaults to the current directory)
        dir: Option<PathBuf>,
    },
    /// Run the pipeline on one book
    Run {
        /// Source file (epub, pdf, txt, html)
        input: PathBuf,
        /// Target state document (default: <input_dir>/<stem>/pipeline.json)
        #[arg(long)]
        pipeline_json: Option<PathBuf>,
        /// Comma-separated subset of phases to execute (default: all)
        #[arg(long)]
        phases: Option<String>,
        /// Force resume behavior
        #[arg(long, conflicts_with = "no_resume")]
        resume: bool,
        /// Forbid skip and resume; re-run everything
        #[arg(long)]
        no_resume: bool,
        /// Voice override for voice-capable phases
        #[arg(long)]
        voice: Option<String>,
        /// Engine override for engine-capable phases
        #[arg(long)]
        engine: Option<String>,
        /// Per-phase retry budget override
        #[arg(long)]
        max_retries: Option<u32>,
        /// observe | recommend | supervised | autonomous
        #[arg(long)]
        learning_mode: Option<String>,
    },
    /// Run the pipeline over several books with bounded parallelism
    Batch {
        inputs: Vec<PathBuf>,
        /// Books processed concurrently (default: [batch] max_parallel)
        #[arg(long)]
        max_parallel: Option<usize>,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        learning_mode: Option<String>,
    },
    /// Show per-phase progress from a state document
    Status {
        /// State document path
        pipeline_json: PathBuf,
    },
    /// Run the post-run repair loop against the failure registry
    Repair {
        pipeline_json: PathBuf,
    },
    /// Request cancellation of the orchestrator holding a state document
    Cancel {
        pipeline_json: PathBuf,
    },
    /// Advisor tooling
    Advisor {
        #[command(subcommand)]
        command: AdvisorCommands,
    },
}

#[derive(Subcommand)]
pub enum AdvisorCommands {
    /// Rolling-window statistics and recent policy journal entries
    Report {
        pipeline_json: PathBuf,
        /// Window size in days
        #[arg(long, default_value = "14")]
        days: usize,
    },
}

fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if verbose { "bookwright=debug" } else { "bookwright=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "run.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

fn parse_phases(spec: &str) -> Result<Vec<PhaseLabel>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PhaseLabel::from_str)
        .collect()
}

fn parse_learning_mode(spec: Option<&str>) -> Result<Option<LearningMode>> {
    spec.map(LearningMode::from_str).transpose()
}

fn resume_option(resume: bool, no_resume: bool) -> Option<bool> {
    match (resume, no_resume) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            // Typed pipeline errors carry their own exit code; everything
            // else is an argument/environment problem.
            match e.downcast_ref::<PipelineError>() {
                Some(pipeline_error) => {
                    eprintln!("error: {}", pipeline_error);
                    pipeline_error.exit_code()
                }
                None => {
                    eprintln!("error: {:#}", e);
                    exit::BAD_ARGS
                }
            }
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init { dir } => {
            init_tracing(cli.verbose, None);
            cmd_init(dir)
        }
        Commands::Run {
            input,
            pipeline_json,
            phases,
            resume,
            no_resume,
            voice,
            engine,
            max_retries,
            learning_mode,
        } => {
            let overrides = CliOverrides {
                voice,
                engine,
                max_retries,
                learning_mode: parse_learning_mode(learning_mode.as_deref())?,
                phases: phases.as_deref().map(parse_phases).transpose()?,
                resume: resume_option(resume, no_resume),
            };
            let config = Config::for_input(input, pipeline_json, overrides, cli.verbose)?;
            let _guard = init_tracing(
                cli.verbose,
                Some(&config.workdir.join(".pipeline").join("logs")),
            );
            cmd_run(config).await
        }
        Commands::Batch {
            inputs,
            max_parallel,
            voice,
            engine,
            learning_mode,
        } => {
            init_tracing(cli.verbose, None);
            if inputs.is_empty() {
                anyhow::bail!("batch requires at least one input");
            }
            let overrides = CliOverrides {
                voice,
                engine,
                learning_mode: parse_learning_mode(learning_mode.as_deref())?,
                ..Default::default()
            };
            let configured = max_parallel.unwrap_or_else(|| {
                inputs
                    .first()
                    .and_then(|i| i.parent())
                    .map(|d| PipelineToml::load_or_default(d).batch.max_parallel)
                    .unwrap_or(0)
            });
            let summary = run_batch(inputs, overrides, configured, cli.verbose).await?;
            println!(
                "batch: {}/{} succeeded",
                summary.succeeded, summary.total
            );
            Ok(summary.exit_code())
        }
        Commands::Status { pipeline_json } => {
            init_tracing(cli.verbose, None);
            cmd_status(pipeline_json)
        }
        Commands::Repair { pipeline_json } => {
            init_tracing(cli.verbose, None);
            cmd_repair(pipeline_json, cli.verbose).await
        }
        Commands::Cancel { pipeline_json } => {
            init_tracing(cli.verbose, None);
            cmd_cancel(pipeline_json)
        }
        Commands::Advisor { command } => {
            init_tracing(cli.verbose, None);
            match command {
                AdvisorCommands::Report { pipeline_json, days } => {
                    cmd_advisor_report(pipeline_json, days)
                }
            }
        }
    }
}

fn cmd_init(dir: Option<PathBuf>) -> Result<i32> {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    // Opening the store creates the .pipeline layout.
    StateStore::open(dir.join("pipeline.json")).map_err(anyhow::Error::new)?;

    let config_path = dir.join("bookwright.toml");
    if config_path.exists() {
        println!("already initialized: {}", dir.display());
    } else {
        std::fs::write(&config_path, PipelineToml::starter_toml())
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("initialized workdir: {}", dir.display());
    }
    Ok(exit::SUCCESS)
}

async fn cmd_run(config: Config) -> Result<i32> {
    let mut orchestrator = Orchestrator::new(config).map_err(anyhow::Error::new)?;

    // Ctrl-C requests graceful cancellation; the runner terminates the
    // child and the orchestrator persists a resumable state.
    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let report = orchestrator.run().await.map_err(anyhow::Error::new)?;
    display_run_summary(&report);
    Ok(report.outcome.exit_code())
}

fn cmd_status(pipeline_json: PathBuf) -> Result<i32> {
    let store = StateStore::open(&pipeline_json).map_err(anyhow::Error::new)?;
    if !store.exists() {
        println!("no state document at {}", pipeline_json.display());
        return Ok(exit::FAILURE);
    }
    let state = store.read().map_err(anyhow::Error::new)?;
    display_status(&state);
    Ok(exit::SUCCESS)
}

async fn cmd_repair(pipeline_json: PathBuf, verbose: bool) -> Result<i32> {
    let config = Config::for_state_path(pipeline_json, CliOverrides::default(), verbose)?;
    let store = StateStore::open(&config.state_path).map_err(anyhow::Error::new)?;
    let state = store.read().map_err(anyhow::Error::new)?;
    let file_id = state.file_id.clone();

    let registry = FailureRegistry::new(store.meta_dir());
    let telemetry = TelemetrySink::new(store.meta_dir().join("telemetry"));
    let runner = PhaseRunner::new(store.meta_dir().join("logs"));
    let ctx = RepairContext {
        config: &config,
        store: &store,
        registry: &registry,
        telemetry: &telemetry,
        runner: &runner,
    };
    let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let manifests = run_repair_loop(&ctx, &file_id, cancel)
        .await
        .map_err(anyhow::Error::new)?;

    if manifests.is_empty() {
        println!("nothing repaired");
    } else {
        for manifest in &manifests {
            println!(
                "chunk {} repaired via {} (confidence {:.2})",
                manifest.chunk_id, manifest.strategy, manifest.confidence
            );
        }
    }
    Ok(exit::SUCCESS)
}

fn cmd_cancel(pipeline_json: PathBuf) -> Result<i32> {
    let store = StateStore::open(&pipeline_json).map_err(anyhow::Error::new)?;
    let marker = store.meta_dir().join("cancel");
    std::fs::write(&marker, b"cancel requested\n")
        .with_context(|| format!("Failed to write cancel marker: {}", marker.display()))?;
    println!("cancellation requested for {}", pipeline_json.display());
    Ok(exit::SUCCESS)
}

fn cmd_advisor_report(pipeline_json: PathBuf, days: usize) -> Result<i32> {
    let store = StateStore::open(&pipeline_json).map_err(anyhow::Error::new)?;
    let telemetry = TelemetrySink::new(store.meta_dir().join("telemetry"));
    let records = telemetry.read_window(days).map_err(anyhow::Error::new)?;
    let window = TelemetryWindow::from_records(&records);
    let journal =
        read_journal_dir(&store.meta_dir().join("policy"), days).map_err(anyhow::Error::new)?;
    display_advisor_report(&window, &journal, days);
    Ok(exit::SUCCESS)
}
