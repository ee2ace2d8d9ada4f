//! Archiver CLI
//!
//! Local execution entry point.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use archiver::{
    config::{CredentialFile, load_config},
    error::{AppError, Result},
    models::{Config, RunOutcome, RunRequest, RunSummary, SourceRequest, SourceState},
    pipeline,
    storage::{ArchiveStore, SqliteStore},
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// Archiver - personal content archive
#[derive(Parser, Debug)]
#[command(
    name = "archiver",
    version,
    about = "Archive journal, microblog and art-share content locally"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to the credentials file
    #[arg(long, default_value = "credentials.toml")]
    credentials: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize sources into the archive
    Sync {
        /// Sources to sync, by name or kind (default: all configured)
        sources: Vec<String>,

        /// Ignore stored cursors and re-read every selected source
        #[arg(long)]
        full: bool,

        /// Ignore the stored cursor of one source (repeatable)
        #[arg(long = "full-for", value_name = "SOURCE")]
        full_for: Vec<String>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show cursors, item counts and the last run
    Status,

    /// Link dangling parent references
    Reconcile,

    /// Validate configuration and credentials files
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if let Command::Validate = cli.command {
        let credentials = cli.credentials.exists().then_some(cli.credentials.as_path());
        pipeline::run_validate(&cli.config, credentials)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&cli.config)?;
    log::info!("Loaded configuration from {}", cli.config.display());
    if let Some(parent) = Path::new(&config.store.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteStore::open(&config.store.path)?);

    match cli.command {
        Command::Sync {
            sources,
            full,
            full_for,
            json,
        } => {
            let request = build_request(&config, &sources, full, &full_for)?;
            let credentials = CredentialFile::load(&cli.credentials)?;

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());

            let summary = pipeline::run_sync(&config, request, &credentials, store, cancel).await;
            print_summary(&summary, json)?;

            Ok(match summary.outcome {
                RunOutcome::Complete => ExitCode::SUCCESS,
                RunOutcome::Partial => ExitCode::from(2),
                RunOutcome::Failed => ExitCode::FAILURE,
            })
        }

        Command::Status => {
            print_status(store.as_ref()).await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Reconcile => {
            let report = pipeline::run_reconcile(store.as_ref()).await?;
            println!(
                "linked {} reference(s), {} still dangling",
                report.linked, report.dangling
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate => Ok(ExitCode::SUCCESS),
    }
}

fn build_request(
    config: &Config,
    selectors: &[String],
    full: bool,
    full_for: &[String],
) -> Result<RunRequest> {
    if selectors.is_empty() && full_for.is_empty() {
        return Ok(pipeline::request_all(config, full));
    }

    let find = |selector: &String| {
        config
            .find_source(selector)
            .cloned()
            .ok_or_else(|| AppError::config(format!("no configured source matches '{selector}'")))
    };

    let full_names = full_for
        .iter()
        .map(|s| find(s).map(|source| source.name))
        .collect::<Result<Vec<_>>>()?;

    let selected = if selectors.is_empty() {
        config.sources.clone()
    } else {
        selectors.iter().map(find).collect::<Result<Vec<_>>>()?
    };

    Ok(RunRequest::new(
        selected
            .into_iter()
            .map(|source| SourceRequest {
                force_full: full || full_names.contains(&source.name),
                source,
            })
            .collect(),
    ))
}

/// Cancel the run cooperatively on Ctrl-C.
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current page...");
            cancel.cancel();
        }
    });
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "Run {:?} in {}s",
        summary.outcome,
        (summary.finished_at - summary.started_at).num_seconds()
    );
    for report in &summary.sources {
        let state = match &report.state {
            SourceState::Failed { kind, reason } => format!("Failed ({kind}: {reason})"),
            SourceState::Partial { reason } => format!("Partial ({reason})"),
            state => state.label().to_string(),
        };
        println!(
            "  {:<16} {:<40} pages {:>4}  new {:>5}  updated {:>5}  unchanged {:>5}  linked {:>4}  skipped {:>3}  waits {:>3}",
            report.name,
            state,
            report.pages_fetched,
            report.inserted,
            report.updated,
            report.unchanged,
            report.linked,
            report.skipped.len(),
            report.rate_limit_waits
        );
    }
    match (&summary.reconciliation, &summary.reconcile_error) {
        (Some(r), _) => println!("  reconciliation: {} linked, {} dangling", r.linked, r.dangling),
        (None, Some(e)) => println!("  reconciliation failed: {e}"),
        (None, None) => {}
    }
    Ok(())
}

async fn print_status(store: &SqliteStore) -> Result<()> {
    println!("Items archived: {}", store.count_items(None).await?);
    for cursor in store.cursors().await? {
        println!(
            "  {:<10} {:>6} item(s), cursor sequence {}",
            cursor.source_kind.as_str(),
            store.count_items(Some(cursor.source_kind)).await?,
            cursor.sequence
        );
    }
    if let Some(last) = store.latest_run().await? {
        println!(
            "Last run: {:?}, finished {}",
            last.outcome,
            last.finished_at.to_rfc3339()
        );
    }
    Ok(())
}
