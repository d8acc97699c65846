use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tpr_storage::RecordStore;
use tpr_sync::{SyncConfig, SyncService};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tpr-cli")]
#[command(about = "Timus submission mirror and problem recommender")]
struct Cli {
    /// Print results as JSON instead of a summary line.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade the database schema.
    Migrate,
    /// Import the problem catalog with statements.
    LoadProblems,
    /// Bulk-import the global submission feed, newest first.
    LoadSubmits {
        /// Start at this submission id (inclusive) instead of the newest one.
        #[arg(long)]
        from: Option<u64>,
        #[arg(long, default_value_t = 100)]
        batch_size: u32,
        /// Pause between batches.
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Link a chat id to a Timus author id and pull the author's history.
    Register {
        #[arg(long)]
        chat_id: u64,
        #[arg(long)]
        author_id: u32,
    },
    /// Incremental sync of one author, or of the whole feed when no author is given.
    Sync {
        #[arg(long)]
        author_id: Option<u32>,
    },
    Recommend {
        #[arg(long)]
        chat_id: u64,
    },
    Stats,
    /// Mirror every linked user on the configured cron until interrupted.
    Schedule,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn emit<T: Serialize>(json: bool, value: &T, summary: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).context("encoding output")?);
    } else {
        println!("{}", summary(value));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { author_id: None }) {
        Commands::Migrate => {
            RecordStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::LoadProblems => {
            let service = SyncService::connect(&config).await?;
            let loaded = service.load_problems().await?;
            println!("problems loaded: {loaded}");
        }
        Commands::LoadSubmits {
            from,
            batch_size,
            interval_ms,
        } => {
            let service = SyncService::connect(&config).await?;
            let mut import = service
                .bulk_sync(from, batch_size, Duration::from_millis(interval_ms))
                .await?;
            let mut stored = 0u64;
            loop {
                match import.next_batch().await {
                    Ok(Some(progress)) => {
                        stored += progress.stored;
                        emit(cli.json, &progress, |p| {
                            format!(
                                "batch {}: fetched={} stored={} next_cursor={}",
                                p.batch,
                                p.fetched,
                                p.stored,
                                p.next_cursor.map_or_else(|| "-".to_string(), |c| c.to_string())
                            )
                        })?;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        if let Some(cursor) = import.next_cursor() {
                            warn!(cursor, "bulk import interrupted; resume with --from {cursor}");
                        }
                        return Err(err.into());
                    }
                }
            }
            println!("bulk import complete: stored={stored}");
        }
        Commands::Register { chat_id, author_id } => {
            let service = SyncService::connect(&config).await?;
            let user = service.register(chat_id, author_id).await?;
            emit(cli.json, &user, |u| {
                format!(
                    "registered: chat_id={} author_id={} local_id={}",
                    u.external_chat_id, u.remote_author_id, u.local_id
                )
            })?;
        }
        Commands::Sync { author_id } => {
            let service = SyncService::connect(&config).await?;
            let report = match author_id {
                Some(author_id) => service.sync(author_id).await?,
                None => service.sync_global().await?,
            };
            emit(cli.json, &report, |r| {
                format!(
                    "sync complete: run_id={} target={} fetched={} stored={} requests={} termination={:?}",
                    r.run_id, r.target, r.fetched, r.stored, r.requests, r.termination
                )
            })?;
        }
        Commands::Recommend { chat_id } => {
            let service = SyncService::connect(&config).await?;
            match service.recommend(chat_id).await {
                Ok(problems) => emit(cli.json, &problems, |p| {
                    let numbers: Vec<String> = p.iter().map(u32::to_string).collect();
                    format!("recommended: {}", numbers.join(" "))
                })?,
                Err(err) => {
                    eprintln!("{}", err.user_message());
                    return Err(err.into());
                }
            }
        }
        Commands::Stats => {
            let store = RecordStore::connect(&config.database_url).await?;
            let stats = store.stats().await?;
            emit(cli.json, &stats, |s| {
                format!(
                    "users={} problems={} submissions={}",
                    s.users, s.problems, s.submissions
                )
            })?;
        }
        Commands::Schedule => {
            let service = Arc::new(SyncService::connect(&config).await?);
            let Some(mut sched) = service.maybe_build_scheduler(&config).await? else {
                bail!("scheduler disabled; set TPR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
