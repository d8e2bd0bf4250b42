//! In-memory tabular dataset and the landing format readers
//!
//! A [`Dataset`] is what a [`DatasetStore`](crate::store::DatasetStore) reads
//! from landing and appends to bronze. Every row remembers the landing file it
//! came from so the bronze `_file_path` column can be filled per row.

use crate::registry::{ReadOptions, SourceFormat};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

/// Bronze column holding the write timestamp of the load
pub const INGEST_TS_COLUMN: &str = "_ingest_ts";

/// Bronze column holding the landing file a row came from
pub const FILE_PATH_COLUMN: &str = "_file_path";

/// Bronze column holding the load identifier
pub const LOAD_ID_COLUMN: &str = "_load_id";

/// Provenance columns every bronze row carries
pub const PROVENANCE_COLUMNS: [&str; 3] = [INGEST_TS_COLUMN, FILE_PATH_COLUMN, LOAD_ID_COLUMN];

/// Logical type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Only nulls seen so far
    Null,
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    /// Nested arrays or objects
    Json,
}

impl ColumnType {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_f64() => ColumnType::Float,
            Value::Number(_) => ColumnType::Integer,
            Value::String(_) => ColumnType::String,
            Value::Array(_) | Value::Object(_) => ColumnType::Json,
        }
    }

    /// Widest type compatible with both, if any
    pub fn unify(self, other: ColumnType) -> Option<ColumnType> {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Null, t) | (t, Null) => Some(t),
            (Integer, Float) | (Float, Integer) => Some(Float),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnType::Null => "null",
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Landing file the row was read from
    pub source_file: PathBuf,
    /// One value per dataset column
    pub values: Vec<Value>,
}

/// Unique identifier shared by every row of one bronze load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(Uuid);

impl LoadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LoadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LoadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Provenance attached to a dataset right before it is appended to bronze
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStamp {
    pub load_id: LoadId,
    pub ingest_ts: DateTime<Utc>,
    pub source: String,
}

impl LoadStamp {
    /// Fresh load id and the current wall-clock time
    pub fn now(source: impl Into<String>) -> Self {
        Self {
            load_id: LoadId::new(),
            ingest_ts: Utc::now(),
            source: source.into(),
        }
    }

    pub fn ingest_ts_value(&self) -> String {
        self.ingest_ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    rows: Vec<Row>,
    files: Vec<PathBuf>,
    stamp: Option<LoadStamp>,
}

impl Dataset {
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Landing files the dataset was read from, in read order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn stamp(&self) -> Option<&LoadStamp> {
        self.stamp.as_ref()
    }

    /// Append the provenance columns to every row
    ///
    /// Fails when the payload already uses a provenance column name or the
    /// dataset was stamped before.
    pub fn with_provenance(mut self, stamp: LoadStamp) -> Result<Self, String> {
        if self.stamp.is_some() {
            return Err("dataset already carries a load stamp".to_string());
        }
        if let Some(clash) = PROVENANCE_COLUMNS.iter().find(|c| self.column(c).is_some()) {
            return Err(format!("column '{}' is reserved for ingestion provenance", clash));
        }

        self.columns.push(Column::new(INGEST_TS_COLUMN, ColumnType::Timestamp));
        self.columns.push(Column::new(FILE_PATH_COLUMN, ColumnType::String));
        self.columns.push(Column::new(LOAD_ID_COLUMN, ColumnType::String));

        let ts = Value::String(stamp.ingest_ts_value());
        let load_id = Value::String(stamp.load_id.to_string());
        for row in &mut self.rows {
            row.values.push(ts.clone());
            row.values.push(Value::String(row.source_file.display().to_string()));
            row.values.push(load_id.clone());
        }

        self.stamp = Some(stamp);
        Ok(self)
    }

    /// Rows as JSON objects keyed by column name, in column order
    pub fn records(&self) -> impl Iterator<Item = Map<String, Value>> + '_ {
        self.rows.iter().map(|row| {
            self.columns
                .iter()
                .zip(&row.values)
                .map(|(c, v)| (c.name.clone(), v.clone()))
                .collect()
        })
    }
}

/// Accumulates rows from one or more files, unioning their columns by name
#[derive(Debug, Default)]
pub struct DatasetBuilder {
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    rows: Vec<Row>,
    files: Vec<PathBuf>,
}

impl DatasetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: &Path) {
        self.files.push(file.to_path_buf());
    }

    /// Add one row; a value whose type conflicts with its column is rejected
    pub fn push(
        &mut self,
        file: &Path,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<(), String> {
        let mut values = vec![Value::Null; self.columns.len()];

        for (name, value) in fields {
            let idx = match self.index.get(&name) {
                Some(&idx) => idx,
                None => {
                    let idx = self.columns.len();
                    self.columns.push(Column::new(name.clone(), ColumnType::Null));
                    self.index.insert(name.clone(), idx);
                    values.push(Value::Null);
                    idx
                },
            };

            let column = &mut self.columns[idx];
            let seen = ColumnType::of(&value);
            column.data_type = column.data_type.unify(seen).ok_or_else(|| {
                format!(
                    "column '{}' mixes {} and {} values",
                    column.name, column.data_type, seen
                )
            })?;
            values[idx] = value;
        }

        self.rows.push(Row {
            source_file: file.to_path_buf(),
            values,
        });
        Ok(())
    }

    pub fn finish(self) -> Dataset {
        let width = self.columns.len();
        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                row.values.resize(width, Value::Null);
                row
            })
            .collect();

        Dataset {
            columns: self.columns,
            rows,
            files: self.files,
            stamp: None,
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.') || name.starts_with('_'))
        .unwrap_or(false)
}

/// Data files at `path`: the file itself, or every visible file below a directory
pub fn data_files(path: &Path) -> Result<Vec<PathBuf>, String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("cannot access landing path: {}", e))?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
    for entry in walker {
        let entry = entry.map_err(|e| format!("cannot list landing path: {}", e))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Read the dataset at `path` in `format`
///
/// Errors are plain messages; the caller attaches the path and error kind.
pub fn read_dataset(
    path: &Path,
    format: SourceFormat,
    options: &ReadOptions,
) -> Result<Dataset, String> {
    let mut builder = DatasetBuilder::new();

    for file in data_files(path)? {
        builder.add_file(&file);
        let result = match format {
            SourceFormat::Csv => read_csv(&file, options, &mut builder),
            SourceFormat::Json => read_json(&file, options, &mut builder),
        };
        result.map_err(|e| format!("{}: {}", file.display(), e))?;
    }

    Ok(builder.finish())
}

fn read_csv(file: &Path, options: &ReadOptions, builder: &mut DatasetBuilder) -> Result<(), String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(options.header)
        .delimiter(options.delimiter as u8)
        .quote(options.quote as u8)
        .flexible(false)
        .from_path(file)
        .map_err(|e| e.to_string())?;

    let mut header: Vec<String> = if options.header {
        reader
            .headers()
            .map_err(|e| e.to_string())?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = header.iter().find(|h| !seen.insert(h.as_str())) {
        return Err(format!("duplicate header '{}'", dup));
    }

    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        if header.is_empty() {
            header = (0..record.len()).map(|i| format!("_c{}", i)).collect();
        }

        let fields = header.iter().zip(record.iter()).map(|(name, cell)| {
            let value = match &options.null_value {
                Some(null) if cell == null => Value::Null,
                _ => Value::String(cell.to_string()),
            };
            (name.clone(), value)
        });
        builder.push(file, fields)?;
    }

    Ok(())
}

fn read_json(
    file: &Path,
    options: &ReadOptions,
    builder: &mut DatasetBuilder,
) -> Result<(), String> {
    let content = std::fs::read_to_string(file).map_err(|e| e.to_string())?;

    if options.multiline {
        let document: Value = serde_json::from_str(&content).map_err(|e| e.to_string())?;
        let objects = match document {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            other => return Err(format!("expected an object or array, found {}", kind_of(&other))),
        };
        for (i, item) in objects.into_iter().enumerate() {
            push_object(file, item, builder).map_err(|e| format!("element {}: {}", i, e))?;
        }
        return Ok(());
    }

    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("line {}: {}", i + 1, e))?;
        push_object(file, value, builder).map_err(|e| format!("line {}: {}", i + 1, e))?;
    }

    Ok(())
}

fn push_object(file: &Path, value: Value, builder: &mut DatasetBuilder) -> Result<(), String> {
    match value {
        Value::Object(map) => builder.push(file, map),
        other => Err(format!("expected an object, found {}", kind_of(&other))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_csv_directory() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "2024/a.csv", "id,amount\n1,10\n2,20\n");
        write(dir.path(), "2024/b.csv", "id,amount,region\n3,30,eu\n");
        write(dir.path(), "_SUCCESS", "");
        write(dir.path(), ".a.csv.crc", "garbage");

        let ds = read_dataset(dir.path(), SourceFormat::Csv, &ReadOptions::default()).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.files().len(), 2);

        let names: Vec<&str> = ds.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "amount", "region"]);

        // Rows from the first file have no region
        assert_eq!(ds.rows()[0].values[2], Value::Null);
        assert_eq!(ds.rows()[2].values[2], json!("eu"));
        assert!(ds.rows()[2].source_file.ends_with("2024/b.csv"));
    }

    #[test]
    fn test_read_csv_without_header_and_custom_delimiter() {
        let dir = TempDir::new().unwrap();
        let file = write(dir.path(), "x.tsv", "1\tNA\n2\tb\n");
        let options = ReadOptions {
            header: false,
            delimiter: '\t',
            null_value: Some("NA".to_string()),
            ..ReadOptions::default()
        };

        let ds = read_dataset(&file, SourceFormat::Csv, &options).unwrap();
        assert_eq!(ds.column("_c0").unwrap().data_type, ColumnType::String);
        assert_eq!(ds.rows()[0].values, vec![json!("1"), Value::Null]);
    }

    #[test]
    fn test_ragged_csv_fails_whole_read() {
        let dir = TempDir::new().unwrap();
        let file = write(dir.path(), "a.csv", "id,amount\n1,10\n2\n");
        let err = read_dataset(&file, SourceFormat::Csv, &ReadOptions::default()).unwrap_err();
        assert!(err.contains("a.csv"));
    }

    #[test]
    fn test_read_json_lines_and_type_conflicts() {
        let dir = TempDir::new().unwrap();
        let file = write(
            dir.path(),
            "events.json",
            "{\"id\": 1, \"score\": 1.5, \"tags\": [\"a\"]}\n\n{\"id\": 2, \"score\": 3}\n",
        );
        let ds = read_dataset(&file, SourceFormat::Json, &ReadOptions::default()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.column("id").unwrap().data_type, ColumnType::Integer);
        assert_eq!(ds.column("score").unwrap().data_type, ColumnType::Float);
        assert_eq!(ds.column("tags").unwrap().data_type, ColumnType::Json);

        let bad = write(dir.path(), "bad.json", "{\"id\": 1}\n{\"id\": \"two\"}\n");
        let err = read_dataset(&bad, SourceFormat::Json, &ReadOptions::default()).unwrap_err();
        assert!(err.contains("mixes integer and string"));
    }

    #[test]
    fn test_read_multiline_json_array() {
        let dir = TempDir::new().unwrap();
        let file = write(dir.path(), "c.json", "[{\"id\": 1}, {\"id\": 2}]");
        let options = ReadOptions {
            multiline: true,
            ..ReadOptions::default()
        };
        let ds = read_dataset(&file, SourceFormat::Json, &options).unwrap();
        assert_eq!(ds.len(), 2);

        let scalar = write(dir.path(), "s.json", "42");
        assert!(read_dataset(&scalar, SourceFormat::Json, &options).is_err());
    }

    #[test]
    fn test_missing_path_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(read_dataset(&missing, SourceFormat::Csv, &ReadOptions::default()).is_err());
    }

    #[test]
    fn test_with_provenance() {
        let dir = TempDir::new().unwrap();
        let file = write(dir.path(), "a.csv", "id\n1\n2\n");
        let ds = read_dataset(&file, SourceFormat::Csv, &ReadOptions::default()).unwrap();

        let stamp = LoadStamp::now("orders");
        let load_id = stamp.load_id.to_string();
        let ds = ds.with_provenance(stamp).unwrap();

        assert_eq!(ds.columns().len(), 4);
        for record in ds.records() {
            assert_eq!(record[LOAD_ID_COLUMN], json!(load_id));
            assert_eq!(record[FILE_PATH_COLUMN], json!(file.display().to_string()));
        }

        // Stamping twice would mint a second load id for the same rows
        assert!(ds.with_provenance(LoadStamp::now("orders")).is_err());
    }

    #[test]
    fn test_reserved_column_is_rejected() {
        let mut builder = DatasetBuilder::new();
        builder
            .push(Path::new("a.json"), vec![("_load_id".to_string(), json!("x"))])
            .unwrap();
        let err = builder.finish().with_provenance(LoadStamp::now("s")).unwrap_err();
        assert!(err.contains("reserved"));
    }

    #[test]
    fn test_unify() {
        assert_eq!(ColumnType::Null.unify(ColumnType::String), Some(ColumnType::String));
        assert_eq!(ColumnType::Integer.unify(ColumnType::Float), Some(ColumnType::Float));
        assert_eq!(ColumnType::Boolean.unify(ColumnType::String), None);
    }
}
