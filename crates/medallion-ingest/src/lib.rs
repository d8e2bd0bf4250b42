//! Medallion Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Metadata-driven ingestion into the landing and bronze layers of a
//! medallion lakehouse. A YAML catalog names each source, where its files
//! land, which bronze table they feed, and how to parse them.
//!
//! # Stages
//!
//! - **Landing**: mirror `local_root/<source>` into the landing zone
//!   ([`transfer::LandingTransfer`])
//! - **Bronze**: read the landing copy, stamp provenance columns and append it
//!   to the source's bronze table ([`bronze::BronzeIngestor`])
//!
//! [`orchestrator::IngestionOrchestrator`] runs both stages for every catalog
//! source, isolating failures per source.
//!
//! # Example
//!
//! ```no_run
//! use medallion_ingest::orchestrator::IngestionOrchestrator;
//! use medallion_ingest::store::LocalDatasetStore;
//! use medallion_ingest::transfer::LocalFileTransfer;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = IngestionOrchestrator::new(
//!         Arc::new(LocalFileTransfer),
//!         Arc::new(LocalDatasetStore::new()),
//!     );
//!     let report = orchestrator
//!         .run(
//!             Path::new("sources.yml"),
//!             Path::new("./data/local"),
//!             Path::new("./data/landing"),
//!             Some(Path::new("./data/bronze")),
//!         )
//!         .await?;
//!     println!("{} sources ok, {} failed", report.succeeded(), report.failed());
//!     Ok(())
//! }
//! ```

pub mod bronze;
pub mod config;
pub mod dataset;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod transfer;

pub use bronze::{BronzeIngestor, IngestReport};
pub use config::IngestConfig;
pub use orchestrator::{IngestionOrchestrator, RunReport, SourceOutcome, SourceState};
pub use registry::{SourceFormat, SourceRegistry, SourceSpec};
pub use store::{DatasetStore, LocalDatasetStore};
pub use transfer::{FileTransfer, LandingTransfer, LocalFileTransfer, TransferReport};
