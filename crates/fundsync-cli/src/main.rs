use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fundsync_core::{SyncOutcome, SyncStatus};
use fundsync_source::FixtureSource;
use fundsync_sync::{FundStore, PgFundStore, SyncConfig};
use fundsync_web::{AppState, FixtureSourceFactory, LarkSourceFactory, SourceFactory};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundsync")]
#[command(about = "Fund performance sync from Bitable into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now.
    Sync {
        /// Read tables from a captured fixture bundle instead of the live API.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Limit the run to these table ids (repeatable).
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP API, plus the cron scheduler when enabled.
    Serve {
        /// Answer sync requests from a fixture bundle instead of the live API.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Print the most recent sync outcomes.
    Outcomes {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Recompute metrics of every stored fund from its NAV history.
    RecomputeMetrics,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_outcome(outcome: &SyncOutcome) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(outcome).context("serializing sync outcome")?
    );
    if outcome.status == SyncStatus::FatalError {
        bail!("sync {} failed: {}", outcome.run_id, outcome.errors.join("; "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        fixture: None,
        tables: Vec::new(),
    }) {
        Commands::Sync { fixture, tables } => {
            let pipeline = fundsync_sync::pipeline_from_env().await?;
            let outcome = match fixture {
                Some(path) => {
                    let source = FixtureSource::from_path(&path)
                        .with_context(|| format!("loading fixture {}", path.display()))?;
                    pipeline.run(&source, &tables).await?
                }
                None => {
                    let client = pipeline.lark_client(pipeline.config().credentials())?;
                    pipeline.run(client.as_ref(), &tables).await?
                }
            };
            print_outcome(&outcome)?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgFundStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { fixture } => {
            let pipeline = Arc::new(fundsync_sync::pipeline_from_env().await?);
            let scheduler = Arc::clone(&pipeline).maybe_build_scheduler().await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().sync_cron, "scheduled sync enabled");
            }
            let port = pipeline.config().web_port;
            let sources: Arc<dyn SourceFactory> = match fixture {
                Some(path) => Arc::new(FixtureSourceFactory::new(path)),
                None => Arc::new(LarkSourceFactory),
            };
            fundsync_web::serve(AppState::new(pipeline, sources), port).await?;
        }
        Commands::Outcomes { limit } => {
            let pipeline = fundsync_sync::pipeline_from_env().await?;
            let outcomes = pipeline.store().recent_outcomes(limit).await?;
            for outcome in outcomes {
                println!(
                    "{} {} status={} processed={} inserted={} updated={} warnings={} errors={}",
                    outcome.started_at.to_rfc3339(),
                    outcome.run_id,
                    outcome.status.as_str(),
                    outcome.records_processed,
                    outcome.records_inserted,
                    outcome.records_updated,
                    outcome.warnings.len(),
                    outcome.errors.len()
                );
            }
        }
        Commands::RecomputeMetrics => {
            let pipeline = fundsync_sync::pipeline_from_env().await?;
            let outcome = pipeline.recompute_all_metrics().await;
            print_outcome(&outcome)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_accepts_fixture_and_repeated_tables() {
        let cli = Cli::try_parse_from([
            "fundsync",
            "sync",
            "--fixture",
            "fixtures/bitable/sample/bundle.json",
            "--table",
            "tblA",
            "--table",
            "tblB",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Sync { fixture, tables }) => {
                assert_eq!(fixture, Some(PathBuf::from("fixtures/bitable/sample/bundle.json")));
                assert_eq!(tables, vec!["tblA".to_string(), "tblB".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn outcomes_limit_defaults_to_twenty() {
        let cli = Cli::try_parse_from(["fundsync", "outcomes"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Outcomes { limit: 20 })));
        let cli = Cli::try_parse_from(["fundsync", "recompute-metrics"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::RecomputeMetrics)));
    }
}
