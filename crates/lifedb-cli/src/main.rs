use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lifedb_core::SyncError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "lifedb-cli")]
#[command(about = "Sync Buxfer transactions into the LifeDB landing store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental merge against the landed table.
    Sync {
        /// Override LIFEDB_PAGE_LIMIT for this run.
        #[arg(long)]
        page_limit: Option<u32>,
    },
    /// Export the canonical transactions view as Parquet.
    Transform {
        #[arg(long)]
        output: PathBuf,
    },
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let cli = Cli::parse();

    match run(cli.command.unwrap_or(Commands::Sync { page_limit: None })).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(sync_err) = err.downcast_ref::<SyncError>() {
                tracing::error!(
                    kind = ?sync_err.kind(),
                    retryable = sync_err.is_retryable(),
                    "{err:#}"
                );
            } else {
                tracing::error!("{err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync { page_limit } => {
            let outcome = lifedb_sync::run_sync_once_from_env(page_limit).await?;
            println!(
                "sync complete: run_id={} strategy={:?} existing={} fetched={} evicted={} final={} complete={}",
                outcome.run_id,
                outcome.strategy,
                outcome.existing_rows,
                outcome.fetched_rows,
                outcome.evicted_rows,
                outcome.final_rows,
                outcome.complete
            );
        }
        Commands::Transform { output } => {
            let export = lifedb_sync::export_canonical_from_env(&output).await?;
            println!(
                "export complete: rows={} bytes={} sha256={} path={}",
                export.rows,
                export.bytes,
                export.sha256,
                export.path.display()
            );
        }
    }

    Ok(())
}
