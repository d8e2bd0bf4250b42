//! Medallion Ingest - landing and bronze ingestion tool

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use medallion_common::logging::{init_logging, LogConfig, LogLevel};
use medallion_ingest::config::IngestConfig;
use medallion_ingest::orchestrator::{IngestionOrchestrator, RunReport};
use medallion_ingest::registry::SourceRegistry;
use medallion_ingest::store::{DatasetStore, LocalDatasetStore};
use medallion_ingest::transfer::LocalFileTransfer;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "medallion-ingest")]
#[command(author, version, about = "Metadata-driven landing and bronze ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the catalog and list its sources
    Validate {
        /// Source catalog (YAML)
        #[arg(short, long)]
        catalog: Option<PathBuf>,
    },

    /// Copy local source folders into the landing zone
    Land(RunArgs),

    /// Append existing landing data to bronze tables
    Promote(RunArgs),

    /// Land every source, then promote it when a bronze root is set
    Run(RunArgs),

    /// List the committed loads of a bronze table
    Loads {
        #[arg(long, env = "MEDALLION_BRONZE_ROOT")]
        bronze_root: PathBuf,

        /// Table path relative to the bronze root
        #[arg(short, long)]
        table: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Source catalog (YAML)
    #[arg(short, long)]
    catalog: Option<PathBuf>,

    #[arg(long)]
    local_root: Option<PathBuf>,

    #[arg(long)]
    landing_root: Option<PathBuf>,

    #[arg(long)]
    bronze_root: Option<PathBuf>,

    /// Files copied at once within a source
    #[arg(long)]
    file_concurrency: Option<usize>,

    /// Sources processed at once
    #[arg(long)]
    source_concurrency: Option<usize>,

    /// Re-hash landing copies against the local files
    #[arg(long)]
    verify: bool,

    /// Only process these sources (repeatable)
    #[arg(short, long = "source")]
    sources: Vec<String>,

    /// Write the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

impl RunArgs {
    /// Flags win over `MEDALLION_*` environment variables
    fn into_config(self) -> Result<(IngestConfig, Vec<String>, Option<PathBuf>)> {
        let mut config = IngestConfig::from_env()?;
        if let Some(catalog) = self.catalog {
            config.catalog = catalog;
        }
        if let Some(root) = self.local_root {
            config.local_root = root;
        }
        if let Some(root) = self.landing_root {
            config.landing_root = root;
        }
        if let Some(root) = self.bronze_root {
            config.bronze_root = Some(root);
        }
        if let Some(n) = self.file_concurrency {
            config.file_concurrency = n;
        }
        if let Some(n) = self.source_concurrency {
            config.source_concurrency = n;
        }
        config.verify_checksums |= self.verify;
        config.validate()?;
        Ok((config, self.sources, self.report))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Land,
    Promote,
    Run,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("medallion-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Validate { catalog } => {
            let catalog = match catalog {
                Some(path) => path,
                None => IngestConfig::from_env()?.catalog,
            };
            validate(&catalog)?;
            Ok(ExitCode::SUCCESS)
        },
        Command::Land(args) => execute(Mode::Land, args).await,
        Command::Promote(args) => execute(Mode::Promote, args).await,
        Command::Run(args) => execute(Mode::Run, args).await,
        Command::Loads { bronze_root, table } => {
            list_loads(&bronze_root.join(table)).await?;
            Ok(ExitCode::SUCCESS)
        },
    }
}

fn validate(catalog: &Path) -> Result<()> {
    let registry = SourceRegistry::load(catalog)?;
    info!("Loaded {} sources from {}", registry.len(), catalog.display());

    for spec in &registry {
        println!(
            "{:<24} {:<5} {} → {}",
            spec.name,
            spec.format,
            spec.landing_relpath.display(),
            spec.bronze_table.display()
        );
    }
    Ok(())
}

async fn execute(mode: Mode, args: RunArgs) -> Result<ExitCode> {
    let (config, only, report_path) = args.into_config()?;

    let registry = SourceRegistry::load(&config.catalog)?.select(&only)?;
    info!("Loaded {} sources from {}", registry.len(), config.catalog.display());

    let orchestrator =
        IngestionOrchestrator::new(Arc::new(LocalFileTransfer), Arc::new(LocalDatasetStore::new()))
            .with_file_concurrency(config.file_concurrency)
            .with_source_concurrency(config.source_concurrency)
            .with_verification(config.verify_checksums);

    let cancel = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work");
            cancel.cancel();
        }
    });

    let report = match mode {
        Mode::Land => {
            orchestrator
                .run_registry(&registry, &config.local_root, &config.landing_root, None)
                .await
        },
        Mode::Run => {
            orchestrator
                .run_registry(
                    &registry,
                    &config.local_root,
                    &config.landing_root,
                    config.bronze_root.as_deref(),
                )
                .await
        },
        Mode::Promote => {
            let Some(bronze_root) = config.bronze_root.as_deref() else {
                bail!("promote needs a bronze root (--bronze-root or MEDALLION_BRONZE_ROOT)");
            };
            orchestrator
                .promote_registry(&registry, &config.landing_root, bronze_root)
                .await
        },
    };

    summarize(&report);

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))?;
        info!("Run report written to {}", path.display());
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn summarize(report: &RunReport) {
    for outcome in &report.outcomes {
        if let Some(failure) = &outcome.failure {
            error!(
                "{}: failed during {} ({}): {}",
                outcome.source, failure.stage, failure.kind, failure.message
            );
            continue;
        }

        let copied = outcome.transfer.as_ref().map(|t| t.files_copied());
        let rows = outcome.ingest.as_ref().map(|i| i.rows_written);
        match (copied, rows) {
            (Some(files), Some(rows)) => {
                info!("{}: {} files landed, {} rows to bronze", outcome.source, files, rows)
            },
            (Some(files), None) => info!("{}: {} files landed", outcome.source, files),
            (None, Some(rows)) => info!("{}: {} rows to bronze", outcome.source, rows),
            (None, None) => info!("{}: nothing to do", outcome.source),
        }
    }

    info!(
        "Ingestion complete: {} succeeded, {} failed",
        report.succeeded(),
        report.failed()
    );
}

async fn list_loads(table: &Path) -> Result<()> {
    let store = LocalDatasetStore::new();
    let loads = store.loads(table).await?;
    if loads.is_empty() {
        info!("No committed loads in {}", table.display());
        return Ok(());
    }

    for load in &loads {
        println!(
            "{}  {}  {:<16} {:>8} rows  {} files",
            load.load_id,
            load.ingest_ts.to_rfc3339(),
            load.source,
            load.rows,
            load.source_files.len()
        );
    }
    Ok(())
}
