//! Catalog-driven ingestion orchestrator
//!
//! Loads the source catalog once and runs every source as its own task:
//! landing transfer, then (when a bronze root is given) bronze promotion. A
//! failing source is recorded in the run report and never stops the others.

use crate::bronze::{BronzeIngestor, IngestReport};
use crate::registry::{SourceRegistry, SourceSpec};
use crate::store::DatasetStore;
use crate::transfer::{FileTransfer, LandingTransfer, TransferReport};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use medallion_common::{ErrorKind, MedallionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default number of sources processed at once
pub const DEFAULT_SOURCE_CONCURRENCY: usize = 4;

/// Where a source is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Pending,
    Transferring,
    Transferred,
    Promoting,
    Promoted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Landing,
    Bronze,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Landing => write!(f, "landing"),
            Stage::Bronze => write!(f, "bronze"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one source's task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: String,
    pub state: SourceState,
    pub transfer: Option<TransferReport>,
    pub ingest: Option<IngestReport>,
    pub failure: Option<SourceFailure>,
}

impl SourceOutcome {
    fn pending(source: &str) -> Self {
        Self {
            source: source.to_string(),
            state: SourceState::Pending,
            transfer: None,
            ingest: None,
            failure: None,
        }
    }

    fn fail(mut self, stage: Stage, err: &MedallionError) -> Self {
        error!(source = %self.source, %stage, kind = %err.kind(), "Source failed: {}", err);
        self.state = SourceState::Failed;
        self.failure = Some(SourceFailure {
            stage,
            kind: err.kind(),
            message: err.to_string(),
        });
        self
    }

    pub fn is_failed(&self) -> bool {
        self.state == SourceState::Failed
    }
}

/// Per-source outcomes of one orchestration run, ordered by source name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<SourceOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_failed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn outcome(&self, source: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source == source)
    }
}

pub struct IngestionOrchestrator {
    transfer: LandingTransfer,
    bronze: BronzeIngestor,
    source_concurrency: usize,
    cancel: CancellationToken,
}

impl IngestionOrchestrator {
    pub fn new(files: Arc<dyn FileTransfer>, store: Arc<dyn DatasetStore>) -> Self {
        let cancel = CancellationToken::new();
        Self {
            transfer: LandingTransfer::new(files).with_cancellation(cancel.clone()),
            bronze: BronzeIngestor::new(store),
            source_concurrency: DEFAULT_SOURCE_CONCURRENCY,
            cancel,
        }
    }

    pub fn with_file_concurrency(mut self, concurrency: usize) -> Self {
        self.transfer = self.transfer.with_concurrency(concurrency);
        self
    }

    pub fn with_source_concurrency(mut self, concurrency: usize) -> Self {
        self.source_concurrency = concurrency.max(1);
        self
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.transfer = self.transfer.with_verification(verify);
        self
    }

    /// Abort signal checked between sources and between files
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.transfer = self.transfer.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load `catalog` and run every source through landing, then bronze when
    /// `bronze_root` is given
    ///
    /// Only a catalog problem fails the call; source failures land in the report.
    pub async fn run(
        &self,
        catalog: &Path,
        local_root: &Path,
        landing_root: &Path,
        bronze_root: Option<&Path>,
    ) -> Result<RunReport> {
        let registry = SourceRegistry::load(catalog)?;
        info!("Loaded {} sources from {}", registry.len(), catalog.display());
        Ok(self.run_registry(&registry, local_root, landing_root, bronze_root).await)
    }

    /// Like [`run`](Self::run) with an already loaded registry
    pub async fn run_registry(
        &self,
        registry: &SourceRegistry,
        local_root: &Path,
        landing_root: &Path,
        bronze_root: Option<&Path>,
    ) -> RunReport {
        self.run_sources(registry, |spec| {
            self.land_and_promote(spec, local_root, landing_root, bronze_root)
        })
        .await
    }

    /// Bronze stage only, over whatever is already in landing
    pub async fn promote_registry(
        &self,
        registry: &SourceRegistry,
        landing_root: &Path,
        bronze_root: &Path,
    ) -> RunReport {
        self.run_sources(registry, |spec| async move {
            let outcome = SourceOutcome::pending(&spec.name);
            self.promote(outcome, spec, landing_root, bronze_root).await
        })
        .await
    }

    async fn run_sources<'a, F, Fut>(&'a self, registry: &'a SourceRegistry, task: F) -> RunReport
    where
        F: Fn(&'a SourceSpec) -> Fut,
        Fut: std::future::Future<Output = SourceOutcome> + 'a,
    {
        let started_at = Utc::now();

        let mut outcomes: Vec<SourceOutcome> = stream::iter(registry.iter())
            .map(|spec| {
                let fut = task(spec);
                async move {
                    if self.cancel.is_cancelled() {
                        return SourceOutcome::pending(&spec.name)
                            .fail(Stage::Landing, &MedallionError::Cancelled);
                    }
                    fut.await
                }
            })
            .buffer_unordered(self.source_concurrency)
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.source.cmp(&b.source));

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        if report.is_success() {
            info!(sources = report.outcomes.len(), "Run complete");
        } else {
            warn!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "Run complete with failures"
            );
        }
        report
    }

    async fn land_and_promote(
        &self,
        spec: &SourceSpec,
        local_root: &Path,
        landing_root: &Path,
        bronze_root: Option<&Path>,
    ) -> SourceOutcome {
        let mut outcome = SourceOutcome::pending(&spec.name);
        info!(source = %spec.name, "Ingesting {}...", spec.name);

        let source_local: PathBuf = local_root.join(&spec.name);
        let source_landing: PathBuf = landing_root.join(&spec.landing_relpath);

        outcome.state = SourceState::Transferring;
        match self.transfer.transfer(&source_local, &source_landing).await {
            Ok(report) => {
                outcome.state = SourceState::Transferred;
                outcome.transfer = Some(report);
            },
            Err(e) => return outcome.fail(Stage::Landing, &e),
        }

        match bronze_root {
            Some(bronze_root) => self.promote(outcome, spec, landing_root, bronze_root).await,
            None => outcome,
        }
    }

    async fn promote(
        &self,
        mut outcome: SourceOutcome,
        spec: &SourceSpec,
        landing_root: &Path,
        bronze_root: &Path,
    ) -> SourceOutcome {
        // The append is the point of no return, so check before starting it.
        if self.cancel.is_cancelled() {
            return outcome.fail(Stage::Bronze, &MedallionError::Cancelled);
        }

        outcome.state = SourceState::Promoting;
        match self.bronze.ingest(landing_root, bronze_root, spec).await {
            Ok(report) => {
                outcome.state = SourceState::Promoted;
                outcome.ingest = Some(report);
                outcome
            },
            Err(e) => outcome.fail(Stage::Bronze, &e),
        }
    }
}
