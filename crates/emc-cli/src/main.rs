use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emc_pipeline::{CalculationPipeline, DiagnosticsReporter, PipelineConfig};
use emc_store::{EstimationClient, PgStore};
use emc_web::AppState;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "emc-cli")]
#[command(about = "Emission calculation pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one calculation pass for a company.
    Run {
        company_id: Uuid,
        /// Restrict the run to these entry ids (single page, no pagination).
        #[arg(long = "entry-id")]
        entry_ids: Vec<Uuid>,
    },
    /// Print diagnostics for unmatched and errored entries.
    Diagnose { company_id: Uuid },
    /// Serve the HTTP invocation surface.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Run {
            company_id,
            entry_ids,
        } => {
            let (pipeline, _store) = build_pipeline().await?;
            let ids = if entry_ids.is_empty() {
                None
            } else {
                Some(entry_ids.as_slice())
            };
            let summary = pipeline.run(company_id, ids).await?;
            println!(
                "run complete: run_id={} processed={} calculated={} errors={}",
                summary.run_id,
                summary.processed,
                summary.calculated,
                summary.errors.len()
            );
            for error in &summary.errors {
                eprintln!("error: {error}");
            }
        }
        Commands::Diagnose { company_id } => {
            let (_pipeline, store) = build_pipeline().await?;
            let reporter = DiagnosticsReporter::new(store);
            for diagnostic in reporter.report(company_id).await? {
                println!("{:?}: {}", diagnostic.severity, diagnostic.message);
            }
        }
        Commands::Serve => {
            let (pipeline, store) = build_pipeline().await?;
            emc_web::serve(AppState::new(pipeline, store)).await?;
        }
    }

    Ok(())
}

async fn build_pipeline() -> Result<(Arc<CalculationPipeline>, Arc<PgStore>)> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store = Arc::new(PgStore::connect(&database_url).await?);

    let config = PipelineConfig::from_env();
    let estimator = Arc::new(EstimationClient::new(config.estimation_config())?);

    let pipeline = Arc::new(CalculationPipeline::new(
        store.clone(),
        store.clone(),
        estimator,
        config.page_size,
    ));
    Ok((pipeline, store))
}
