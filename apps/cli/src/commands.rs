//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Report, Result, eyre};
use docpipe_core::{LaneState, Orchestrator, RunOptions, RunSummary, StageSelection};
use docpipe_discovery::{DiscoveryOptions, discover};
use docpipe_fingerprint::FingerprintStore;
use docpipe_shared::{
    AppConfig, DocPipeError, StageName, init_config, load_config, load_config_from,
};
use tracing::{info, warn};

use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// docpipe: run documents through convert → validate → analyze → embed,
/// skipping work already done.
#[derive(Parser)]
#[command(
    name = "docpipe",
    version,
    about = "Incrementally run source documents through a staged processing pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline over every document under SOURCE.
    Run(RunArgs),

    /// Show recorded progress for every document under SOURCE without running anything.
    Status {
        /// Source directory (or single file).
        source: PathBuf,

        /// Config file to use instead of ~/.docpipe/docpipe.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments for `docpipe run`.
#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Source directory (or single file).
    pub source: PathBuf,

    /// Number of documents processed concurrently.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Re-run stages even when already done for the current content.
    #[arg(long, conflicts_with = "no_force")]
    pub force: bool,

    /// Skip stages already done even if the config enables `force`.
    #[arg(long)]
    pub no_force: bool,

    /// Stop dispatching documents after the first failure.
    #[arg(long, conflicts_with = "keep_going")]
    pub fail_fast: bool,

    /// Keep processing other documents after a failure.
    #[arg(long)]
    pub keep_going: bool,

    /// Only run stages at or after this one.
    #[arg(long, value_name = "STAGE")]
    pub resume_from: Option<StageName>,

    /// Leave this stage out (repeatable).
    #[arg(long, value_name = "STAGE")]
    pub skip: Vec<StageName>,

    /// Only run these stages (comma-separated).
    #[arg(long, value_name = "STAGES", value_delimiter = ',')]
    pub stages: Vec<StageName>,

    /// Config file to use instead of ~/.docpipe/docpipe.toml.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show {
        /// Config file to show instead of ~/.docpipe/docpipe.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docpipe=info",
        1 => "docpipe=debug",
        _ => "docpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Status { source, config } => cmd_status(&source, config.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show { config } => cmd_config_show(config.as_deref()).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Replace config file values with the flags given on the command line.
fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    if args.force || args.no_force {
        config.pipeline.force = args.force;
    }
    if args.fail_fast || args.keep_going {
        config.pipeline.fail_fast = args.fail_fast;
    }
}

fn stage_selection(args: &RunArgs) -> StageSelection {
    StageSelection {
        enabled: (!args.stages.is_empty()).then(|| args.stages.clone()),
        resume_from: args.resume_from,
        skip: args.skip.iter().copied().collect(),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut config = resolve_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let registry = docpipe_core::registry_from_config(&config)?;
    let options = RunOptions {
        selection: stage_selection(&args),
        ..RunOptions::from_config(&config.pipeline)
    };

    info!(
        source = %args.source.display(),
        workers = options.workers,
        force = options.force,
        fail_fast = options.fail_fast,
        "starting docpipe run"
    );

    let progress = Arc::new(CliProgress::new());
    let orchestrator = Orchestrator::new(registry, options)?.with_observer(progress.clone());

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight stages finish");
            cancel.cancel();
        }
    });

    let result = orchestrator.run(&args.source).await;
    progress.finish();
    let summary = match result {
        Ok(summary) => summary,
        Err(e) if e.is_fatal() => {
            return Err(Report::new(e).wrap_err("invalid pipeline setup, nothing was run"));
        }
        Err(e) => return Err(e.into()),
    };

    print_summary(&summary);

    let failed = summary.counts().failed;
    if failed > 0 {
        return Err(eyre!("{failed} document(s) failed"));
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let counts = summary.counts();

    println!();
    for report in &summary.documents {
        let executed = report.executed();
        let detail = match &report.state {
            LaneState::Done if executed == 0 => "up to date".to_string(),
            LaneState::Done => format!("{executed} stage(s) run"),
            other => other.to_string(),
        };
        println!("  {:<9} {}  {detail}", report.state.label(), report.document);
    }

    println!();
    println!("  Processed: {}", counts.processed);
    println!("  Skipped:   {}", counts.skipped);
    println!("  Failed:    {}", counts.failed);
    println!("  Blocked:   {}", counts.blocked);
    if counts.cancelled > 0 || counts.pending > 0 {
        println!("  Cancelled: {}", counts.cancelled);
        println!("  Pending:   {}", counts.pending);
    }
    println!("  Time:      {:.1}s", summary.elapsed.as_secs_f64());
    if let Some(first) = summary.first_failure() {
        println!("  First failure: {} ({})", first.document, first.state);
    }
    println!();
}

async fn cmd_status(source: &Path, config: Option<&Path>) -> Result<()> {
    let config = resolve_config(config)?;
    let docs = discover(source, &DiscoveryOptions::from(&config.pipeline))?;
    let store = FingerprintStore::new();

    println!();
    for doc in &docs {
        let hash = match store.compute_hash(doc) {
            Ok(h) => h,
            Err(e) => {
                println!("  {:<9} {doc}  {e}", "unreadable");
                continue;
            }
        };

        let (freshness, done) = match store.try_load(doc) {
            Ok(Some(record)) if record.hash == hash => ("current", record.completed_stages()),
            Ok(Some(_)) => ("changed", Vec::new()),
            Ok(None) => ("new", Vec::new()),
            Err(DocPipeError::CorruptMetadata { .. }) => ("corrupt", Vec::new()),
            Err(e) => {
                println!("  {:<9} {doc}  {e}", "unreadable");
                continue;
            }
        };

        let steps = if done.is_empty() {
            "-".to_string()
        } else {
            done.iter().map(StageName::as_str).collect::<Vec<_>>().join(",")
        };
        println!("  {freshness:<9} {doc}  {steps}");
    }
    println!();
    println!("  {} document(s)", docs.len());
    println!();

    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
