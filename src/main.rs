//! evoloop - compiler-guided code evolution
//!
//! Generates a program from a task description, compiles it, remembers which
//! errors keep coming back, fixes the mechanical ones in place and learns
//! which fixes work.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evoloop::categorize::categorize;
use evoloop::compile::CommandCompiler;
use evoloop::config::Config;
use evoloop::evolution::{EvolutionTracker, SessionOutcome, TrackerSettings};
use evoloop::generate::HttpGenerator;
use evoloop::learner::PatternLearner;
use evoloop::normalize::normalize;
use evoloop::quality::scorer_from_config;
use evoloop::runner::{SessionRunner, ToolchainEvaluator};
use evoloop::store::Store;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "evoloop",
    about = "Compiler-guided code evolution with error memory and learned fixes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an evolution session for a task
    Run(RunArgs),
    /// Print what the template library has learned
    Templates(StateArgs),
    /// Print the fingerprint and tier of a raw diagnostic
    Fingerprint { message: String },
    /// Print the evolution log of a session (latest when no id is given)
    History(HistoryArgs),
}

#[derive(Args, Debug)]
struct StateArgs {
    /// Config file (defaults to the user config location)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding `.evoloop/`
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Task description, or a path to a file containing it
    #[arg(long)]
    task: String,
    #[command(flatten)]
    state: StateArgs,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    quality_target: Option<f64>,
    #[arg(long)]
    max_edits: Option<usize>,
    /// Compiler program (overrides `compiler.program`)
    #[arg(long)]
    compiler: Option<String>,
    /// Generation model (overrides `generation.model`)
    #[arg(long)]
    model: Option<String>,
    /// Write the final source here
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    session: Option<String>,
    #[command(flatten)]
    state: StateArgs,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EVOLOOP_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_session(args).await,
        Commands::Templates(args) => show_templates(args),
        Commands::Fingerprint { message } => {
            show_fingerprint(&message);
            Ok(())
        }
        Commands::History(args) => show_history(args),
    }
}

fn load_config(args: &StateArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(dir) = &args.state_dir {
        config.state_dir = Some(dir.clone());
    }
    Ok(config)
}

fn open_store(config: &Config) -> Store {
    let store = Store::new(&config.state_root());
    match &config.template_library {
        Some(path) => store.with_template_library(path.clone()),
        None => store,
    }
}

/// A task given as a path is read from disk; anything else is the task text.
fn read_task(task: &str) -> Result<String> {
    let path = Path::new(task);
    if path.is_file() {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read task file {}", path.display()));
    }
    Ok(task.to_string())
}

async fn run_session(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.state)?;
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if let Some(target) = args.quality_target {
        config.quality_target = target;
    }
    if let Some(max) = args.max_edits {
        config.max_edits_per_iteration = max;
    }
    if let Some(compiler) = args.compiler {
        config.compiler.program = Some(compiler);
    }
    if let Some(model) = args.model {
        config.generation.model = model;
    }
    config.validate_for_run()?;

    let task = read_task(&args.task)?;
    let store = open_store(&config);
    let learner = PatternLearner::open(store.clone(), config.min_template_confidence);
    if learner.is_degraded() {
        eprintln!(
            "  ! Template library at {} could not be read; learning is off for this session",
            store.templates_path().display()
        );
    }

    let generator = HttpGenerator::from_config(&config.generation)?;
    let compiler = CommandCompiler::from_config(&config.compiler)?;
    let scorer = scorer_from_config(&config.quality, &config.compiler.source_extension);
    let evaluator =
        ToolchainEvaluator::new(Box::new(compiler), scorer, config.collaborator_retries);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Stopping after the current iteration...");
            stop_signal.store(true, Ordering::SeqCst);
        }
    });

    let tracker = EvolutionTracker::new(TrackerSettings::from(&config), learner, Some(store));
    eprintln!("  Session {}", tracker.session_id());

    let outcome = SessionRunner::new(&generator, &evaluator)
        .with_retries(config.collaborator_retries)
        .with_generation_timeout(Duration::from_secs(config.generation.timeout_secs))
        .with_stop_flag(stop)
        .run(&task, tracker)
        .await;

    print_outcome(&outcome);

    if let Some(path) = &args.output {
        let version = outcome
            .final_version
            .as_ref()
            .or(outcome.best_version.as_ref());
        match version {
            Some(version) => {
                fs::write(path, &version.source)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!("  Wrote version #{} to {}", version.sequence, path.display());
            }
            None => eprintln!("  Nothing to write: no version was accepted"),
        }
    }
    Ok(())
}

fn print_outcome(outcome: &SessionOutcome) {
    println!();
    for line in outcome.summary_lines() {
        println!("{line}");
    }
    let learning = &outcome.learning;
    if !learning.most_used.is_empty() {
        println!();
        println!("Most used fix templates:");
        for (fingerprint, action, uses, confidence) in &learning.most_used {
            println!("  {action} for '{fingerprint}' ({uses} uses, confidence {confidence:.2})");
        }
    }
}

fn show_templates(args: StateArgs) -> Result<()> {
    let config = load_config(&args)?;
    let store = open_store(&config);
    let library = store
        .load_templates()
        .with_context(|| format!("failed to read {}", store.templates_path().display()))?;
    let report = library.report(10);

    println!("Template library: {}", store.templates_path().display());
    println!(
        "  {} template(s) for {} fingerprint(s); {} successes, {} failures; mean confidence {:.2}",
        report.total_templates,
        report.fingerprints,
        report.total_successes,
        report.total_failures,
        report.mean_confidence
    );
    for (tier, count) in &report.per_tier {
        println!("  {tier}: {count}");
    }
    for (fingerprint, action, uses, confidence) in &report.most_used {
        println!("  - {action} for '{fingerprint}' ({uses} uses, confidence {confidence:.2})");
    }
    Ok(())
}

fn show_fingerprint(message: &str) {
    let fingerprint = normalize(message);
    let category = categorize(&fingerprint);
    println!("fingerprint: {fingerprint}");
    println!("tier:        {}", category.tier);
    println!("kind:        {}", category.kind);
    println!("strategy:    {}", category.strategy);
    if let Some(remedy) = &category.remedy {
        for action in &remedy.actions {
            println!(
                "remedy:      {} (confidence {:.2})",
                action.describe(),
                remedy.confidence
            );
        }
    }
}

fn show_history(args: HistoryArgs) -> Result<()> {
    let config = load_config(&args.state)?;
    let store = open_store(&config);
    let session = match args.session {
        Some(session) => session,
        None => match store.list_sessions()?.pop() {
            Some(latest) => latest,
            None => {
                println!("No sessions recorded under {}", store.state_dir().display());
                return Ok(());
            }
        },
    };

    let records = store.load_evolution(&session, args.limit)?;
    println!("Session {session}: {} version(s)", records.len());
    for record in &records {
        println!(
            "  #{:<3} it {:<2} {:<9} {:<11} quality {:.2}  diagnostics {:<3} diff {}",
            record.sequence,
            record.iteration,
            record.origin.to_string(),
            record.status.to_string(),
            record.quality,
            record.diagnostic_count,
            record.diff_size
        );
    }
    if let Some(summary) = store.load_session_summary(&session)? {
        println!(
            "  Finished: {} (target met: {}, trend {})",
            summary.stop_reason, summary.target_met, summary.trend
        );
    }
    Ok(())
}
