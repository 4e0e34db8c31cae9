use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cdash_sync::snapshot::{fetch_snapshot, publish_snapshot, FetchOutcome};
use cdash_sync::{ProjectConfig, Store, SyncConfig, SyncError, SyncPipeline, WarehouseOutcome};
use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when the warehouse step was held back by the byte budget.
const QUOTA_EXIT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "cdash-cli")]
#[command(about = "Community health dashboard: sync, render and report")]
struct Cli {
    /// Database file; overrides CDASH_DB_PATH.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Project YAML; overrides CDASH_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Update the database from every source except the warehouse.
    Update,
    /// Load new download events from the warehouse.
    UpdateWarehouse {
        /// Fetch the snapshot from drive first.
        #[arg(long)]
        fetch: bool,
        /// Upload the snapshot afterwards.
        #[arg(long)]
        publish: bool,
    },
    /// Render the static dashboard and workbook into a directory.
    Webpage {
        target_dir: PathBuf,
        /// Start of the reporting window; defaults to 28 days ago.
        #[arg(long)]
        since: Option<NaiveDate>,
    },
    /// Download and unpack the database snapshot.
    FetchDb,
    /// Compress and upload the database snapshot.
    UploadDb,
    /// Print last week's summary, optionally posting it to chat.
    WeeklySummary {
        #[arg(long)]
        send_chat: bool,
        /// Use the local database instead of fetching the snapshot.
        #[arg(long)]
        no_fetch: bool,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Run the cron jobs until interrupted.
    Schedule,
    /// Serve a rendered dashboard directory.
    Serve {
        dir: PathBuf,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn pipeline(cli: &Cli) -> Result<SyncPipeline> {
    let mut config = SyncConfig::from_env();
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(path) = &cli.config {
        config.project_config_path = path.clone();
    }
    let project = ProjectConfig::load(&config.project_config_path)?;
    SyncPipeline::new(config, project)
}

async fn fetch_db(pipeline: &SyncPipeline) -> Result<()> {
    let config = pipeline.config();
    let drive = pipeline.drive()?;
    let outcome = fetch_snapshot(
        &drive,
        &pipeline.project().drive,
        &config.snapshot_path(),
        &config.db_path,
    )
    .await?;
    match outcome {
        FetchOutcome::UpToDate => info!("snapshot already up to date"),
        FetchOutcome::Downloaded { bytes } => info!(bytes, "snapshot downloaded"),
    }
    Ok(())
}

async fn upload_db(pipeline: &SyncPipeline) -> Result<()> {
    let config = pipeline.config();
    let drive = pipeline.drive()?;
    let size = publish_snapshot(
        &drive,
        &pipeline.project().drive,
        &config.db_path,
        &config.snapshot_path(),
    )
    .await?;
    info!(bytes = size, "snapshot uploaded");
    Ok(())
}

async fn update_warehouse(pipeline: &SyncPipeline, fetch: bool, publish: bool) -> Result<ExitCode> {
    if fetch {
        fetch_db(pipeline).await?;
    }
    let outcome = match pipeline.run_warehouse().await {
        Ok(outcome) => outcome,
        Err(err) => match err.downcast_ref::<SyncError>() {
            Some(SyncError::QuotaExceeded { .. }) => {
                warn!(error = %err, "warehouse step skipped");
                return Ok(ExitCode::from(QUOTA_EXIT));
            }
            _ => return Err(err),
        },
    };
    println!("{outcome:?}");

    match outcome {
        WarehouseOutcome::Inserted { .. } => {
            if publish {
                upload_db(pipeline).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
        WarehouseOutcome::SkippedTooSoon => Ok(ExitCode::SUCCESS),
        WarehouseOutcome::BudgetSpent { .. } => Ok(ExitCode::from(QUOTA_EXIT)),
    }
}

async fn webpage(pipeline: &SyncPipeline, target_dir: PathBuf, since: Option<NaiveDate>) -> Result<()> {
    let now = Utc::now();
    let since = since
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or_else(|| now - Duration::days(28));
    let store = Store::open(&pipeline.config().db_path).await?;
    cdash_web::generate_webpage(store.pool(), pipeline.project(), &target_dir, since, now).await?;
    store.close().await;
    println!("dashboard written to {}", target_dir.display());
    Ok(())
}

async fn weekly_summary(pipeline: &SyncPipeline, send_chat: bool, no_fetch: bool) -> Result<()> {
    if !no_fetch {
        fetch_db(pipeline).await?;
    }
    let store = Store::open(&pipeline.config().db_path).await?;
    let lines = cdash_web::weekly_summary_lines(store.pool(), &pipeline.project().core_devs, Utc::now()).await?;
    store.close().await;
    println!("{}", lines.join("\n"));

    if send_chat {
        let chat = &pipeline.project().chat;
        let client = pipeline
            .chat_client(&chat.summary_stream, &chat.summary_topic)
            .context("ZULIP_API_KEY is required to send the summary")?;
        let parts = client.send_lines(&chat.summary_stream, &chat.summary_topic, &lines).await?;
        info!(parts, "weekly summary sent");
    }
    Ok(())
}

async fn schedule(pipeline: SyncPipeline) -> Result<()> {
    let pipeline = Arc::new(pipeline);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        bail!("scheduler disabled; set CDASH_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let command = cli.command.as_ref().unwrap_or(&Commands::Update);
    if let Commands::Serve { dir, port } = command {
        cdash_web::serve_dir(dir.clone(), *port).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let pipeline = pipeline(&cli)?;
    match cli.command.unwrap_or(Commands::Update) {
        Commands::Update => {
            let summary = pipeline.run_once().await?;
            if summary.skipped {
                println!("update skipped: database updated within the last 12 hours");
            } else {
                println!("update complete: run_id={}", summary.run_id);
                for (entity, counts) in &summary.entities {
                    println!(
                        "  {entity}: inserted={} updated={} skipped={}",
                        counts.inserted, counts.updated, counts.skipped
                    );
                }
            }
        }
        Commands::UpdateWarehouse { fetch, publish } => return update_warehouse(&pipeline, fetch, publish).await,
        Commands::Webpage { target_dir, since } => webpage(&pipeline, target_dir, since).await?,
        Commands::FetchDb => fetch_db(&pipeline).await?,
        Commands::UploadDb => upload_db(&pipeline).await?,
        Commands::WeeklySummary { send_chat, no_fetch } => weekly_summary(&pipeline, send_chat, no_fetch).await?,
        Commands::Migrate => {
            let store = Store::open(&pipeline.config().db_path).await?;
            store.migrate().await?;
            store.close().await;
            println!("migrations applied to {}", pipeline.config().db_path.display());
        }
        Commands::Schedule => schedule(pipeline).await?,
        Commands::Serve { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_db_flag_follows_subcommand() {
        let cli = Cli::parse_from(["cdash-cli", "webpage", "site", "--since", "2024-05-01", "--db", "x.db"]);
        assert_eq!(cli.db, Some(PathBuf::from("x.db")));
        match cli.command {
            Some(Commands::Webpage { target_dir, since }) => {
                assert_eq!(target_dir, PathBuf::from("site"));
                assert_eq!(since, NaiveDate::from_ymd_opt(2024, 5, 1));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn update_is_the_default() {
        let cli = Cli::parse_from(["cdash-cli"]);
        assert!(cli.command.is_none());
    }
}
