use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use ifc_core::SourceKind;
use ifc_storage::{ItemQuery, ItemStore, SqliteItemStore};
use ifc_sync::{parse_time_bound, CollectError, Collector, CollectorConfig, RunSummary, RunWindow};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_SESSION: u8 = 2;
const EXIT_PARTIAL: u8 = 3;

const LOG_CRATES: [&str; 6] = ["ifc_core", "ifc_storage", "ifc_adapters", "ifc_sync", "ifc_web", "ifc_cli"];

#[derive(Debug, Parser)]
#[command(name = "ifc-cli")]
#[command(about = "Collect replies and mentions into the feedback store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection pass (default).
    Collect(CollectArgs),
    /// Create or upgrade the item store schema.
    Migrate,
    /// Print stored items as JSON lines.
    Items(ItemsArgs),
    /// Serve the JSON query surface.
    Serve(ServeArgs),
}

#[derive(Debug, Default, Args)]
struct CollectArgs {
    /// Lower bound: 12h, 7 days, 2w, 1m, 2026-02-25 or "2026-02-25 14:30". Defaults to 24h ago.
    #[arg(long)]
    since: Option<String>,
    /// Upper bound, same formats as --since. Defaults to now.
    #[arg(long)]
    until: Option<String>,
    /// Exit with status 3 when any source failed.
    #[arg(long)]
    fail_on_partial: bool,
}

#[derive(Debug, Args)]
struct ItemsArgs {
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    until: Option<String>,
    /// timeline_reply, thread_reply or keyword_mention
    #[arg(long)]
    source: Option<SourceKind>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Defaults to IFC_WEB_PORT, then 8000.
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for krate in LOG_CRATES {
        filter = filter.add_directive(format!("{krate}=info").parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        eprintln!("error: {err:#}");
        return ExitCode::from(EXIT_FAILURE);
    }

    let outcome = match cli.command.unwrap_or(Commands::Collect(CollectArgs::default())) {
        Commands::Collect(args) => collect(args).await,
        Commands::Migrate => migrate().await.map(|_| EXIT_SUCCESS),
        Commands::Items(args) => items(args).await.map(|_| EXIT_SUCCESS),
        Commands::Serve(args) => serve(args).await.map(|_| EXIT_SUCCESS),
    };
    if let Err(err) = &outcome {
        error!(error = ?err, "command failed");
        eprintln!("error: {err:#}");
    }
    ExitCode::from(exit_status(&outcome))
}

/// Any error that escaped a command is a general failure.
fn exit_status(outcome: &Result<u8>) -> u8 {
    match outcome {
        Ok(code) => *code,
        Err(_) => EXIT_FAILURE,
    }
}

/// 0 for a clean or tolerated partial run, 3 for a partial run under `--fail-on-partial`,
/// 2 when the session is missing or expired.
fn run_status(result: &std::result::Result<RunSummary, CollectError>, fail_on_partial: bool) -> u8 {
    match result {
        Ok(summary) if summary.has_failures() && fail_on_partial => EXIT_PARTIAL,
        Ok(_) => EXIT_SUCCESS,
        Err(CollectError::Session(_) | CollectError::SessionExpired { .. }) => EXIT_SESSION,
    }
}

async fn collect(args: CollectArgs) -> Result<u8> {
    let config = CollectorConfig::from_env()?;
    let window = RunWindow::resolve(args.since.as_deref(), args.until.as_deref(), Utc::now())?;
    let store = SqliteItemStore::open(&config.storage.database_url)
        .await
        .with_context(|| format!("opening {}", config.storage.database_url))?;
    let collector = Collector::from_config(&config, std::sync::Arc::new(store));
    info!(targets = collector.targets().len(), "starting collection");

    let result = collector.collect(window).await;
    match &result {
        Ok(summary) => print_summary(summary),
        Err(err) => {
            if let Some(summary) = err.summary() {
                print_summary(summary);
            }
            eprintln!("error: {err}");
            eprintln!("run the login flow to refresh the session cookies, then retry");
        }
    }
    Ok(run_status(&result, args.fail_on_partial))
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {} window {} to {}",
        summary.run_id,
        summary.window_start.to_rfc3339(),
        summary.window_end.to_rfc3339()
    );
    for (kind, t) in &summary.sources {
        println!(
            "  {kind}: fetched={} noise={} duplicate={} stored={} failed={} truncated={}",
            t.fetched, t.noise, t.duplicate, t.stored, t.failed, t.truncated
        );
        for failure in &t.failures {
            println!("    {} ({:?}): {}", failure.label, failure.kind, failure.message);
        }
    }
}

async fn migrate() -> Result<()> {
    let config = CollectorConfig::from_env()?;
    SqliteItemStore::open(&config.storage.database_url)
        .await
        .with_context(|| format!("migrating {}", config.storage.database_url))?;
    println!("migrations applied to {}", config.storage.database_url);
    Ok(())
}

async fn items(args: ItemsArgs) -> Result<()> {
    let config = CollectorConfig::from_env()?;
    let now = Utc::now();
    let query = ItemQuery {
        start: args.since.as_deref().map(|s| parse_time_bound(s, now)).transpose()?,
        end: args.until.as_deref().map(|s| parse_time_bound(s, now)).transpose()?,
        source_kind: args.source,
        limit: args.limit,
    };
    let store = SqliteItemStore::open(&config.storage.database_url).await?;
    for item in store.query(&query).await? {
        println!("{}", serde_json::to_string(&item).context("serializing item")?);
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = CollectorConfig::from_env()?;
    let port = args
        .port
        .or_else(|| std::env::var("IFC_WEB_PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(8000);
    ifc_web::serve(&config, port).await
}
