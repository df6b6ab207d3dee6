use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ofal_ingest::{IngestConfig, IngestPipeline, RunLedger};
use ofal_storage::{MemoryStore, OfferStore, PgOfferStore};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ofal")]
#[command(about = "Academic offering ledger: SCD2 ingestion of program-offering spreadsheets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one spreadsheet (.xlsx/.xls/.xlsb/.ods/.csv).
    Ingest {
        #[arg(long)]
        path: PathBuf,
        /// Run against an in-memory store; nothing is written to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Mark runs stuck in `running` past the stale timeout as failed.
    Reconcile {
        /// Overrides OFAL_STALE_RUN_MINUTES. Must be at least 1.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        older_than_minutes: Option<i64>,
    },
    /// List recent runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show every version of one natural key.
    History {
        #[arg(long)]
        key: String,
    },
}

async fn connect(config: &IngestConfig) -> Result<PgOfferStore> {
    PgOfferStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to DATABASE_URL")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Ingest { path, dry_run } => {
            let store: Arc<dyn OfferStore> = if dry_run {
                info!("dry run: using in-memory store");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let pipeline = IngestPipeline::from_config(store, config)?;
            let outcome = pipeline
                .ingest_file(&path)
                .await
                .with_context(|| format!("ingesting {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Reconcile { older_than_minutes } => {
            let store = connect(&config).await?;
            let timeout = older_than_minutes
                .map(chrono::Duration::minutes)
                .unwrap_or(config.stale_run_after);
            let abandoned = RunLedger::new(&store, config.backoff())
                .reconcile_stale(Utc::now(), timeout)
                .await?;
            println!("reconciled {} stale run(s)", abandoned.len());
            for run in abandoned {
                println!("  {} {} started {}", run.run_id, run.file_name, run.started_at);
            }
        }
        Commands::Runs { limit } => {
            let store = connect(&config).await?;
            for run in store.list_runs(limit).await? {
                println!(
                    "{} {:<8} {} {} new={} updated={} unchanged={} skipped={}{}",
                    run.run_id,
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.file_name,
                    run.counters.new,
                    run.counters.updated,
                    run.counters.unchanged,
                    run.counters.skipped_missing_dims,
                    run.duplicate_of
                        .map(|id| format!(" duplicate_of={id}"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::History { key } => {
            let store = connect(&config).await?;
            let history = store.fact_history(&key).await?;
            if history.is_empty() {
                println!("no versions for {key:?}");
            }
            for fact in history {
                println!(
                    "{} {} {} .. {} status={} hash={}",
                    fact.fact_id,
                    if fact.is_current { "current" } else { "closed " },
                    fact.first_seen_at.format("%Y-%m-%d %H:%M:%S"),
                    fact.last_seen_at.format("%Y-%m-%d %H:%M:%S"),
                    fact.status_norm.as_deref().unwrap_or("-"),
                    &fact.row_hash[..fact.row_hash.len().min(12)],
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconcile_minutes(args: &[&str]) -> Result<Option<i64>, clap::Error> {
        let cli = Cli::try_parse_from(args)?;
        match cli.command {
            Commands::Reconcile { older_than_minutes } => Ok(older_than_minutes),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn reconcile_timeout_must_be_positive() {
        assert_eq!(reconcile_minutes(&["ofal", "reconcile"]).unwrap(), None);
        assert_eq!(
            reconcile_minutes(&["ofal", "reconcile", "--older-than-minutes", "90"]).unwrap(),
            Some(90)
        );
        for bad in ["--older-than-minutes=0", "--older-than-minutes=-5"] {
            let err = reconcile_minutes(&["ofal", "reconcile", bad]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation, "{bad}");
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
