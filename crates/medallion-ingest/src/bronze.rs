//! Bronze promotion
//!
//! Reads a source's landing dataset, stamps every row with `_ingest_ts`,
//! `_file_path` and `_load_id`, and appends it to the source's bronze table.
//!
//! Promotion is not idempotent: promoting the same landing files
//! twice yields two loads with distinct `_load_id`s. Deduplication belongs to
//! a later layer, which can group on `_load_id`.

use crate::dataset::{LoadId, LoadStamp};
use crate::registry::SourceSpec;
use crate::store::DatasetStore;
use chrono::{DateTime, Utc};
use medallion_common::{MedallionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub source: String,
    pub load_id: LoadId,
    pub ingest_ts: DateTime<Utc>,
    pub landing_path: PathBuf,
    pub bronze_target: PathBuf,
    pub files_read: usize,
    pub rows_written: usize,
}

/// Appends landing datasets to bronze tables
#[derive(Clone)]
pub struct BronzeIngestor {
    store: Arc<dyn DatasetStore>,
}

impl BronzeIngestor {
    pub fn new(store: Arc<dyn DatasetStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DatasetStore> {
        &self.store
    }

    /// Promote `landing_root/<landing_relpath>` into `bronze_root/<bronze_table>`
    #[instrument(skip_all, fields(source = %spec.name))]
    pub async fn ingest(
        &self,
        landing_root: &Path,
        bronze_root: &Path,
        spec: &SourceSpec,
    ) -> Result<IngestReport> {
        let landing_path = landing_root.join(&spec.landing_relpath);
        let bronze_target = bronze_root.join(&spec.bronze_table);

        let dataset = self.store.read(&landing_path, spec.format, &spec.options).await?;

        // One stamp for the whole call: a single load id and write timestamp.
        let stamp = LoadStamp::now(&spec.name);
        let load_id = stamp.load_id;
        let ingest_ts = stamp.ingest_ts;
        let files_read = dataset.files().len();

        let dataset = dataset
            .with_provenance(stamp)
            .map_err(|reason| MedallionError::read(&landing_path, reason))?;

        let outcome = self.store.append(&dataset, &bronze_target).await?;

        info!(
            load_id = %load_id,
            rows = outcome.rows_written,
            files = files_read,
            "Bronze load complete: {} → {}",
            spec.name,
            bronze_target.display()
        );

        Ok(IngestReport {
            source: spec.name.clone(),
            load_id,
            ingest_ts,
            landing_path,
            bronze_target,
            files_read,
            rows_written: outcome.rows_written,
        })
    }
}
