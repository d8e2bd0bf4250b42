//! Dataset read/append capability
//!
//! [`DatasetStore`] is the seam between ingestion and the table storage
//! engine. [`LocalDatasetStore`] implements it on a plain filesystem with an
//! append-only table layout:
//!
//! ```text
//! <table>/
//!   _schema.json              ordered, typed column union
//!   part-<load_id>.jsonl      rows of one load
//!   _loads.jsonl              commit log, one line per load
//! ```
//!
//! A load becomes visible only once its line lands in `_loads.jsonl`. Part
//! files are staged under a temporary name and renamed into place, so a failed
//! append leaves the table exactly as readable as before.

use crate::dataset::{Column, Dataset, LoadId};
use crate::registry::{ReadOptions, SourceFormat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medallion_common::{MedallionError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

pub const SCHEMA_FILE: &str = "_schema.json";
pub const LOADS_FILE: &str = "_loads.jsonl";

/// Result of one append
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub rows_written: usize,
    /// Data file holding the load, `None` when nothing was written
    pub part_file: Option<PathBuf>,
}

/// Audit entry for one committed load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEntry {
    pub load_id: LoadId,
    pub source: String,
    pub ingest_ts: DateTime<Utc>,
    pub rows: usize,
    pub part_file: String,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    /// Union `incoming` into the schema; a column whose type cannot be unified
    /// rejects the whole append
    fn union(&self, incoming: &[Column]) -> std::result::Result<TableSchema, String> {
        let mut merged = self.clone();
        for column in incoming {
            match merged.columns.iter_mut().find(|c| c.name == column.name) {
                Some(existing) => {
                    existing.data_type =
                        existing.data_type.unify(column.data_type).ok_or_else(|| {
                            format!(
                                "schema union rejected: column '{}' is {} in the table but {} in the load",
                                column.name, existing.data_type, column.data_type
                            )
                        })?;
                },
                None => merged.columns.push(column.clone()),
            }
        }
        Ok(merged)
    }
}

/// Read/append capability over tabular datasets
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Read the dataset at `path`
    async fn read(&self, path: &Path, format: SourceFormat, options: &ReadOptions)
        -> Result<Dataset>;

    /// Append a stamped dataset to the table at `target`
    async fn append(&self, dataset: &Dataset, target: &Path) -> Result<AppendOutcome>;

    /// Every committed row of the table at `target`, across all loads
    async fn scan(&self, target: &Path) -> Result<Vec<Map<String, Value>>>;

    /// Commit log of the table at `target`, oldest first
    async fn loads(&self, target: &Path) -> Result<Vec<LoadEntry>>;
}

/// Filesystem-backed [`DatasetStore`]
#[derive(Debug, Default)]
pub struct LocalDatasetStore {
    tables: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LocalDatasetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive write access to one table, released when the guard drops
    async fn lock_table(&self, target: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut tables = self.tables.lock().await;
            tables
                .entry(target.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget the table's lock once no writer holds or waits on it
    async fn release_table(&self, target: &Path) {
        let mut tables = self.tables.lock().await;
        if tables.get(target).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            tables.remove(target);
        }
    }
}

#[async_trait]
impl DatasetStore for LocalDatasetStore {
    async fn read(
        &self,
        path: &Path,
        format: SourceFormat,
        options: &ReadOptions,
    ) -> Result<Dataset> {
        let owned_path = path.to_path_buf();
        let options = options.clone();
        tokio::task::spawn_blocking(move || {
            crate::dataset::read_dataset(&owned_path, format, &options)
                .map_err(|reason| MedallionError::read(&owned_path, reason))
        })
        .await
        .map_err(|e| MedallionError::read(path, format!("reader task failed: {}", e)))?
    }

    async fn append(&self, dataset: &Dataset, target: &Path) -> Result<AppendOutcome> {
        let result = {
            let _guard = self.lock_table(target).await;

            let dataset = dataset.clone();
            let owned_target = target.to_path_buf();
            tokio::task::spawn_blocking(move || append_blocking(&dataset, &owned_target))
                .await
                .map_err(|e| MedallionError::write(target, format!("writer task failed: {}", e)))
                .and_then(|outcome| outcome)
        };
        self.release_table(target).await;
        result
    }

    async fn scan(&self, target: &Path) -> Result<Vec<Map<String, Value>>> {
        let owned_target = target.to_path_buf();
        tokio::task::spawn_blocking(move || scan_blocking(&owned_target))
            .await
            .map_err(|e| MedallionError::read(target, format!("scan task failed: {}", e)))?
    }

    async fn loads(&self, target: &Path) -> Result<Vec<LoadEntry>> {
        let owned_target = target.to_path_buf();
        tokio::task::spawn_blocking(move || read_loads(&owned_target))
            .await
            .map_err(|e| MedallionError::read(target, format!("load log task failed: {}", e)))?
    }
}

fn read_schema(table: &Path) -> Result<TableSchema> {
    let path = table.join(SCHEMA_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| MedallionError::read(&path, format!("corrupt schema: {}", e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TableSchema::default()),
        Err(e) => Err(MedallionError::read(&path, e.to_string())),
    }
}

fn read_loads(table: &Path) -> Result<Vec<LoadEntry>> {
    let path = table.join(LOADS_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MedallionError::read(&path, e.to_string())),
    };

    let mut entries = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LoadEntry>(line) {
            Ok(entry) => entries.push(entry),
            // A torn line is an append that never committed.
            Err(e) => {
                warn!(table = %table.display(), line = i + 1, error = %e, "Ignoring incomplete load log entry");
            },
        }
    }
    Ok(entries)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn append_blocking(dataset: &Dataset, target: &Path) -> Result<AppendOutcome> {
    append_with_commit(dataset, target, append_log_line)
}

fn append_log_line(log_path: &Path, line: &[u8]) -> std::io::Result<()> {
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    log.write_all(line)?;
    log.sync_all()
}

/// Stage the part, widen the schema, then commit through `commit`.
/// Any failure removes the part and puts the previous schema back.
fn append_with_commit(
    dataset: &Dataset,
    target: &Path,
    commit: impl FnOnce(&Path, &[u8]) -> std::io::Result<()>,
) -> Result<AppendOutcome> {
    let write_err = |reason: String| MedallionError::write(target, reason);

    let stamp = dataset
        .stamp()
        .ok_or_else(|| write_err("dataset carries no load stamp".to_string()))?;

    if dataset.is_empty() {
        debug!(table = %target.display(), load_id = %stamp.load_id, "Empty load, nothing to append");
        return Ok(AppendOutcome {
            rows_written: 0,
            part_file: None,
        });
    }

    std::fs::create_dir_all(target).map_err(|e| write_err(e.to_string()))?;

    let schema_path = target.join(SCHEMA_FILE);
    let previous_schema = match std::fs::read(&schema_path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(write_err(format!("cannot read schema: {}", e))),
    };
    let schema: TableSchema = match &previous_schema {
        Some(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| write_err(format!("corrupt schema: {}", e)))?,
        None => TableSchema::default(),
    };
    let merged = schema.union(dataset.columns()).map_err(write_err)?;

    let part_name = format!("part-{}.jsonl", stamp.load_id);
    let part_path = target.join(&part_name);
    if part_path.exists() {
        return Err(write_err(format!("load {} is already committed", stamp.load_id)));
    }

    let mut payload = Vec::new();
    for record in dataset.records() {
        serde_json::to_writer(&mut payload, &record)
            .map_err(|e| write_err(format!("cannot encode row: {}", e)))?;
        payload.push(b'\n');
    }

    let entry = LoadEntry {
        load_id: stamp.load_id,
        source: stamp.source.clone(),
        ingest_ts: stamp.ingest_ts,
        rows: dataset.len(),
        part_file: part_name,
        source_files: dataset.files().iter().map(|f| f.display().to_string()).collect(),
    };
    let log_path = target.join(LOADS_FILE);
    let mut line = Vec::new();
    // Terminate a torn previous entry so it stays isolated on its own line.
    if std::fs::read(&log_path).is_ok_and(|log| log.last().is_some_and(|&b| b != b'\n')) {
        line.push(b'\n');
    }
    serde_json::to_writer(&mut line, &entry)
        .map_err(|e| write_err(format!("cannot encode load entry: {}", e)))?;
    line.push(b'\n');

    // Uncommitted parts are invisible to readers.
    write_atomic(&part_path, &payload)
        .map_err(|e| write_err(format!("part write failed: {}", e)))?;

    let rollback = |reason: String| {
        let _ = std::fs::remove_file(&part_path);
        let restored = match &previous_schema {
            Some(bytes) => write_atomic(&schema_path, bytes),
            None => std::fs::remove_file(&schema_path).or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            }),
        };
        if let Err(e) = restored {
            warn!(table = %target.display(), error = %e, "Could not restore previous schema");
        }
        write_err(reason)
    };

    if merged != schema {
        let bytes = serde_json::to_vec_pretty(&merged)
            .map_err(|e| rollback(format!("cannot encode schema: {}", e)))?;
        write_atomic(&schema_path, &bytes)
            .map_err(|e| rollback(format!("schema update failed: {}", e)))?;
    }

    commit(&log_path, &line).map_err(|e| rollback(format!("commit failed: {}", e)))?;

    Ok(AppendOutcome {
        rows_written: dataset.len(),
        part_file: Some(part_path),
    })
}

fn scan_blocking(table: &Path) -> Result<Vec<Map<String, Value>>> {
    let schema = read_schema(table)?;
    let mut rows = Vec::new();

    for entry in read_loads(table)? {
        let part = table.join(&entry.part_file);
        let content =
            std::fs::read_to_string(&part).map_err(|e| MedallionError::read(&part, e.to_string()))?;

        for (i, line) in content.lines().enumerate() {
            let stored: Map<String, Value> = serde_json::from_str(line)
                .map_err(|e| MedallionError::read(&part, format!("line {}: {}", i + 1, e)))?;

            // Older loads lack columns added later; surface them as null.
            let row = schema
                .columns
                .iter()
                .map(|c| (c.name.clone(), stored.get(&c.name).cloned().unwrap_or(Value::Null)))
                .collect();
            rows.push(row);
        }
    }

    Ok(rows)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dataset::{ColumnType, DatasetBuilder, LoadStamp, LOAD_ID_COLUMN};
    use medallion_common::ErrorKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn stamped(rows: Vec<Vec<(&str, Value)>>) -> Dataset {
        let mut builder = DatasetBuilder::new();
        builder.add_file(Path::new("landing/a.json"));
        for row in rows {
            builder
                .push(
                    Path::new("landing/a.json"),
                    row.into_iter().map(|(k, v)| (k.to_string(), v)),
                )
                .unwrap();
        }
        builder.finish().with_provenance(LoadStamp::now("orders")).unwrap()
    }

    #[tokio::test]
    async fn test_append_is_additive() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("orders_bronze");
        let store = LocalDatasetStore::new();

        let first = stamped(vec![vec![("id", json!(1))], vec![("id", json!(2))]]);
        let outcome = store.append(&first, &table).await.unwrap();
        assert_eq!(outcome.rows_written, 2);

        let before = store.scan(&table).await.unwrap();

        let second = stamped(vec![vec![("id", json!(3)), ("region", json!("eu"))]]);
        store.append(&second, &table).await.unwrap();

        let after = store.scan(&table).await.unwrap();
        assert_eq!(after.len(), 3);

        // Earlier rows are unchanged apart from the new column reading as null
        for (old, new) in before.iter().zip(&after) {
            for (k, v) in old {
                assert_eq!(&new[k], v);
            }
            assert_eq!(new["region"], Value::Null);
        }

        let loads = store.loads(&table).await.unwrap();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].rows, 2);
        assert_ne!(loads[0].load_id, loads[1].load_id);
        assert_eq!(after[2][LOAD_ID_COLUMN], json!(loads[1].load_id.to_string()));
    }

    #[tokio::test]
    async fn test_type_conflict_rejects_append_and_keeps_table() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("t");
        let store = LocalDatasetStore::new();

        store.append(&stamped(vec![vec![("id", json!(1))]]), &table).await.unwrap();

        let conflicting = stamped(vec![vec![("id", json!(true))]]);
        let err = store.append(&conflicting, &table).await.unwrap_err();
        assert!(matches!(err, MedallionError::Write { .. }));

        assert_eq!(store.scan(&table).await.unwrap().len(), 1);
        assert_eq!(store.loads(&table).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unstamped_dataset_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalDatasetStore::new();
        let err = store.append(&Dataset::default(), dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("load stamp"));
    }

    #[tokio::test]
    async fn test_empty_load_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("t");
        let store = LocalDatasetStore::new();

        let outcome = store.append(&stamped(Vec::new()), &table).await.unwrap();
        assert_eq!(outcome.rows_written, 0);
        assert!(outcome.part_file.is_none());
        assert!(!table.exists());
        assert!(store.scan(&table).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uncommitted_part_is_invisible() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("t");
        let store = LocalDatasetStore::new();
        store.append(&stamped(vec![vec![("id", json!(1))]]), &table).await.unwrap();

        std::fs::write(table.join("part-orphan.jsonl"), "{\"id\": 99}\n").unwrap();
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(table.join(LOADS_FILE))
            .unwrap();
        log.write_all(b"{\"load_id\": \"torn").unwrap();

        assert_eq!(store.scan(&table).await.unwrap().len(), 1);

        // The next commit still lands on a line of its own
        store.append(&stamped(vec![vec![("id", json!(2))]]), &table).await.unwrap();
        assert_eq!(store.scan(&table).await.unwrap().len(), 2);
        assert_eq!(store.loads(&table).await.unwrap().len(), 2);
    }

    fn failing_commit(_: &Path, _: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::other("File too large"))
    }

    fn part_files(table: &Path) -> Vec<String> {
        let mut parts: Vec<String> = std::fs::read_dir(table)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("part-"))
            .collect();
        parts.sort();
        parts
    }

    #[test]
    fn test_failed_commit_leaves_table_unchanged() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("t");

        append_blocking(&stamped(vec![vec![("id", json!(1))]]), &table).unwrap();
        let rows_before = scan_blocking(&table).unwrap();
        let schema_before = std::fs::read(table.join(SCHEMA_FILE)).unwrap();
        let parts_before = part_files(&table);

        let widening = stamped(vec![vec![("id", json!(2)), ("region", json!("eu"))]]);
        let err = append_with_commit(&widening, &table, failing_commit).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);
        assert!(err.to_string().contains("commit failed"));

        assert_eq!(scan_blocking(&table).unwrap(), rows_before);
        assert!(!rows_before[0].contains_key("region"));
        assert_eq!(std::fs::read(table.join(SCHEMA_FILE)).unwrap(), schema_before);
        assert_eq!(part_files(&table), parts_before);
        assert_eq!(read_loads(&table).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_first_commit_leaves_no_schema() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("t");

        let err = append_with_commit(&stamped(vec![vec![("id", json!(1))]]), &table, failing_commit)
            .unwrap_err();
        assert!(matches!(err, MedallionError::Write { .. }));

        assert!(!table.join(SCHEMA_FILE).exists());
        assert!(part_files(&table).is_empty());
        assert!(scan_blocking(&table).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_table_locks_are_released() {
        let dir = TempDir::new().unwrap();
        let store = LocalDatasetStore::new();

        for name in ["a", "b", "c"] {
            let table = dir.path().join(name);
            store.append(&stamped(vec![vec![("id", json!(1))]]), &table).await.unwrap();
        }
        // A rejected append releases its lock too
        let _ = store.append(&Dataset::default(), &dir.path().join("d")).await;

        assert!(store.tables.lock().await.is_empty());
    }

    #[test]
    fn test_schema_union() {
        let schema = TableSchema {
            columns: vec![Column::new("id", ColumnType::Null)],
        };
        let merged = schema
            .union(&[
                Column::new("id", ColumnType::Integer),
                Column::new("name", ColumnType::String),
            ])
            .unwrap();
        assert_eq!(merged.columns[0].data_type, ColumnType::Integer);
        assert_eq!(merged.columns.len(), 2);

        assert!(merged.union(&[Column::new("name", ColumnType::Boolean)]).is_err());
    }
}
