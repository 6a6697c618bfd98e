use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sfl_core::EntitySet;
use sfl_storage::FetchOutcome;
use sfl_sync::{RunOutcome, SyncConfig, SyncPipeline};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sfl-cli")]
#[command(about = "SEC companyfacts loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, diff and load the companyfacts archive once.
    Sync(SyncArgs),
    /// Download every configured archive while holding the pipeline lock.
    Fetch,
    /// Create tables if they do not exist.
    Migrate,
    /// Run the sync on SFL_SYNC_CRON until Ctrl-C.
    Schedule(SyncArgs),
}

#[derive(Debug, Default, clap::Args)]
struct SyncArgs {
    /// Use the archive already on disk.
    #[arg(long)]
    skip_download: bool,
    /// Stop after this many matched members.
    #[arg(long)]
    member_limit: Option<usize>,
    /// CSV with a `cik` column naming the entities to load.
    #[arg(long)]
    entities: Option<PathBuf>,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if self.skip_download {
            config.skip_download = true;
        }
        if self.member_limit.is_some() {
            config.member_limit = self.member_limit;
        }
        if let Some(path) = &self.entities {
            config.entities_csv = path.clone();
        }
    }
}

const EXIT_CONFLICT: u8 = 2;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SFL_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Sync(SyncArgs::default()))).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let mut config = SyncConfig::from_env();

    match command {
        Commands::Sync(args) => {
            args.apply(&mut config);
            let entities = sfl_sync::load_entity_set_csv(&config.entities_csv)?;
            let pipeline = SyncPipeline::connect_lazy(config)?;
            match pipeline.run_once(&entities).await? {
                RunOutcome::Completed(summary) => {
                    println!(
                        "sync complete: run_id={} members={} matched={} changed={} unchanged={} skipped={} rows_loaded={}",
                        summary.run_id,
                        summary.scan.candidates,
                        summary.scan.matched,
                        summary.changed,
                        summary.unchanged,
                        summary.skipped(),
                        summary.rows_inserted
                    );
                    Ok(ExitCode::SUCCESS)
                }
                RunOutcome::Conflict { run_id } => {
                    println!("sync skipped: run_id={run_id} another run holds the pipeline lock");
                    Ok(ExitCode::from(EXIT_CONFLICT))
                }
            }
        }
        Commands::Fetch => {
            let pipeline = SyncPipeline::connect_lazy(config)?;
            let Some(reports) = pipeline.fetch_archives().await? else {
                println!("fetch skipped: another run holds the pipeline lock");
                return Ok(ExitCode::from(EXIT_CONFLICT));
            };
            for report in reports {
                let what = match report.outcome {
                    FetchOutcome::AlreadyFresh => "already fresh".to_string(),
                    FetchOutcome::Downloaded { bytes, resumed_from } if resumed_from > 0 => {
                        format!("downloaded {bytes} bytes (resumed at {resumed_from})")
                    }
                    FetchOutcome::Downloaded { bytes, .. } => format!("downloaded {bytes} bytes"),
                    FetchOutcome::PartialWasComplete { bytes } => {
                        format!("partial file was complete ({bytes} bytes)")
                    }
                };
                println!("{}: {what}", report.path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => {
            SyncPipeline::connect_lazy(config)?.migrate().await?;
            println!("schema ready");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule(args) => {
            args.apply(&mut config);
            let entities: Arc<EntitySet> =
                Arc::new(sfl_sync::load_entity_set_csv(&config.entities_csv)?);
            let pipeline = Arc::new(SyncPipeline::connect_lazy(config)?);
            sfl_sync::run_scheduler_until_ctrl_c(pipeline, entities).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
