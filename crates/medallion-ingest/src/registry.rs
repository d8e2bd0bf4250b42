//! Source catalog (sources.yml)
//!
//! The catalog is the only place a source is described. Adding a source means
//! adding an entry here, never writing code:
//!
//! ```yaml
//! sources:
//!   - name: orders
//!     landing_relpath: orders/
//!     bronze_table: orders_bronze
//!     format: csv
//!     options:
//!       delimiter: ";"
//! ```

use medallion_common::{MedallionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Raw file format of a source's landing files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Delimited text, comma separated unless `options.delimiter` says otherwise
    Csv,
    /// Newline-delimited JSON objects, or one JSON document with `options.multiline`
    Json,
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFormat::Csv => write!(f, "csv"),
            SourceFormat::Json => write!(f, "json"),
        }
    }
}

/// Format-specific read options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadOptions {
    /// Treat the first CSV row as the header
    pub header: bool,

    /// CSV field delimiter
    pub delimiter: char,

    /// CSV quote character
    pub quote: char,

    /// CSV cell value that should be read as null
    pub null_value: Option<String>,

    /// Read each JSON file as a single document (object or array of objects)
    pub multiline: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            header: true,
            delimiter: ',',
            quote: '"',
            null_value: None,
            multiline: false,
        }
    }
}

/// Declarative description of one ingestible source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    /// Unique source name, also the source's subfolder under the local root
    pub name: String,

    /// Where the source's files live under the landing root
    pub landing_relpath: PathBuf,

    /// Target table under the bronze root
    pub bronze_table: PathBuf,

    /// Raw file format
    pub format: SourceFormat,

    #[serde(default)]
    pub options: ReadOptions,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Catalog {
    sources: Vec<SourceSpec>,
}

/// Validated mapping of source name to [`SourceSpec`]
///
/// Iteration is ordered by name.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, SourceSpec>,
}

impl SourceRegistry {
    /// Load and validate the catalog at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MedallionError::config(format!("Cannot read catalog '{}': {}", path.display(), e))
        })?;

        let registry = Self::from_yaml_str(&content).map_err(|e| match e {
            MedallionError::Config(msg) => {
                MedallionError::config(format!("{}: {}", path.display(), msg))
            },
            other => other,
        })?;

        debug!(catalog = %path.display(), sources = registry.len(), "Catalog loaded");
        Ok(registry)
    }

    /// Parse and validate a catalog document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(content)
            .map_err(|e| MedallionError::config(format!("Malformed catalog: {}", e)))?;
        Self::from_specs(catalog.sources)
    }

    /// Validate already-built specs into a registry
    pub fn from_specs(specs: impl IntoIterator<Item = SourceSpec>) -> Result<Self> {
        let mut sources = BTreeMap::new();
        let mut tables = HashSet::new();

        for spec in specs {
            let spec = normalize(spec)?;

            let slot = match sources.entry(spec.name.clone()) {
                btree_map::Entry::Occupied(_) => {
                    return Err(MedallionError::config(format!(
                        "Duplicate source name '{}'",
                        spec.name
                    )));
                },
                btree_map::Entry::Vacant(slot) => slot,
            };

            if !tables.insert(spec.bronze_table.clone()) {
                return Err(MedallionError::config(format!(
                    "Bronze table '{}' is targeted by more than one source",
                    spec.bronze_table.display()
                )));
            }
            slot.insert(spec);
        }

        let registry = Self { sources };
        registry.check_landing_overlap()?;
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceSpec> {
        self.sources.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Keep only the named sources; unknown names are a config error
    pub fn select(self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }

        let mut sources = BTreeMap::new();
        for name in names {
            let spec = self
                .sources
                .get(name)
                .ok_or_else(|| MedallionError::config(format!("Unknown source '{}'", name)))?;
            sources.insert(name.clone(), spec.clone());
        }
        Ok(Self { sources })
    }

    // Sources run concurrently, so no landing path may contain another.
    fn check_landing_overlap(&self) -> Result<()> {
        let specs: Vec<&SourceSpec> = self.sources.values().collect();
        for (i, a) in specs.iter().enumerate() {
            for b in &specs[i + 1..] {
                if a.landing_relpath.starts_with(&b.landing_relpath)
                    || b.landing_relpath.starts_with(&a.landing_relpath)
                {
                    return Err(MedallionError::config(format!(
                        "Sources '{}' and '{}' have overlapping landing paths '{}' and '{}'",
                        a.name,
                        b.name,
                        a.landing_relpath.display(),
                        b.landing_relpath.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a SourceRegistry {
    type Item = &'a SourceSpec;
    type IntoIter = btree_map::Values<'a, String, SourceSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.values()
    }
}

fn normalize(mut spec: SourceSpec) -> Result<SourceSpec> {
    spec.name = spec.name.trim().to_string();
    if spec.name.is_empty() {
        return Err(MedallionError::config("Source name must not be empty"));
    }

    // The name doubles as the local subfolder, so it must be a single segment.
    let name_path = Path::new(&spec.name);
    if !matches!(
        name_path.components().collect::<Vec<_>>().as_slice(),
        [Component::Normal(_)]
    ) {
        return Err(MedallionError::config(format!(
            "Source name '{}' must be a single path segment",
            spec.name
        )));
    }

    spec.landing_relpath = contained_path(&spec.name, "landing_relpath", &spec.landing_relpath)?;
    spec.bronze_table = contained_path(&spec.name, "bronze_table", &spec.bronze_table)?;

    if spec.format == SourceFormat::Csv {
        for (field, c) in [("delimiter", spec.options.delimiter), ("quote", spec.options.quote)] {
            if !c.is_ascii() {
                return Err(MedallionError::config(format!(
                    "Source '{}': {} must be a single ASCII character, got '{}'",
                    spec.name, field, c
                )));
            }
        }
    }

    Ok(spec)
}

/// Normalize a relative path and reject anything that could leave its root
pub(crate) fn contained_path(source: &str, field: &str, path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {},
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(MedallionError::config(format!(
                    "Source '{}': {} '{}' must stay under its root",
                    source,
                    field,
                    path.display()
                )));
            },
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(MedallionError::config(format!(
            "Source '{}': {} must not be empty",
            source, field
        )));
    }

    Ok(normalized)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CATALOG: &str = r#"
sources:
  - name: orders
    landing_relpath: orders/
    bronze_table: orders_bronze
    format: csv
  - name: customers
    landing_relpath: crm/customers
    bronze_table: crm/customers_bronze
    format: json
    options:
      multiline: true
"#;

    #[test]
    fn test_load_catalog() {
        let registry = SourceRegistry::from_yaml_str(CATALOG).unwrap();
        assert_eq!(registry.len(), 2);

        let orders = registry.get("orders").unwrap();
        assert_eq!(orders.landing_relpath, PathBuf::from("orders"));
        assert_eq!(orders.format, SourceFormat::Csv);
        assert!(orders.options.header);
        assert_eq!(orders.options.delimiter, ',');

        let customers = registry.get("customers").unwrap();
        assert!(customers.options.multiline);

        // Ordered by name
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["customers", "orders"]);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let yaml = r#"
sources:
  - { name: orders, landing_relpath: a, bronze_table: a_bronze, format: csv }
  - { name: orders, landing_relpath: b, bronze_table: b_bronze, format: csv }
"#;
        let err = SourceRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, MedallionError::Config(ref m) if m.contains("Duplicate source name")));
    }

    #[test]
    fn test_duplicate_name_reported_before_shared_table() {
        let yaml = r#"
sources:
  - { name: orders, landing_relpath: a, bronze_table: orders_bronze, format: csv }
  - { name: orders, landing_relpath: b, bronze_table: orders_bronze, format: csv }
"#;
        let err = SourceRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate source name 'orders'"));
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let yaml = r#"
sources:
  - { name: orders, landing_relpath: orders, format: csv }
"#;
        let err = SourceRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, MedallionError::Config(ref m) if m.contains("bronze_table")));
    }

    #[test]
    fn test_unknown_format_and_option_are_rejected() {
        let bad_format = r#"
sources:
  - { name: orders, landing_relpath: orders, bronze_table: ob, format: xlsx }
"#;
        assert!(SourceRegistry::from_yaml_str(bad_format).is_err());

        let bad_option = r#"
sources:
  - name: orders
    landing_relpath: orders
    bronze_table: ob
    format: csv
    options: { headers: true }
"#;
        assert!(SourceRegistry::from_yaml_str(bad_option).is_err());
    }

    #[test]
    fn test_shared_bronze_table_is_rejected() {
        let yaml = r#"
sources:
  - { name: a, landing_relpath: a, bronze_table: shared, format: csv }
  - { name: b, landing_relpath: b, bronze_table: ./shared/, format: csv }
"#;
        let err = SourceRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("more than one source"));
    }

    #[test]
    fn test_overlapping_landing_paths_are_rejected() {
        let yaml = r#"
sources:
  - { name: a, landing_relpath: sales, bronze_table: a, format: csv }
  - { name: b, landing_relpath: sales/eu, bronze_table: b, format: csv }
"#;
        let err = SourceRegistry::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("overlapping"));

        // A shared string prefix is not an overlap
        let yaml = r#"
sources:
  - { name: a, landing_relpath: sales, bronze_table: a, format: csv }
  - { name: b, landing_relpath: sales_eu, bronze_table: b, format: csv }
"#;
        assert!(SourceRegistry::from_yaml_str(yaml).is_ok());
    }

    #[test]
    fn test_name_must_be_single_segment() {
        let yaml = r#"
sources:
  - { name: "../etc", landing_relpath: a, bronze_table: a, format: csv }
"#;
        assert!(SourceRegistry::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_select_unknown_source() {
        let registry = SourceRegistry::from_yaml_str(CATALOG).unwrap();
        let only = registry.clone().select(&["orders".to_string()]).unwrap();
        assert_eq!(only.len(), 1);
        assert!(registry.select(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = SourceRegistry::load("/definitely/not/here/sources.yml").unwrap_err();
        assert!(matches!(err, MedallionError::Config(_)));
    }

    proptest! {
        #[test]
        fn prop_parent_segments_never_escape(
            prefix in "[a-z]{1,8}",
            suffix in "[a-z]{1,8}",
        ) {
            let escaping = PathBuf::from(format!("{}/../../{}", prefix, suffix));
            prop_assert!(contained_path("s", "landing_relpath", &escaping).is_err());

            let absolute = PathBuf::from(format!("/{}/{}", prefix, suffix));
            prop_assert!(contained_path("s", "bronze_table", &absolute).is_err());

            let fine = PathBuf::from(format!("./{}/{}/", prefix, suffix));
            let normalized = contained_path("s", "bronze_table", &fine).unwrap();
            prop_assert_eq!(normalized, PathBuf::from(prefix).join(suffix));
        }
    }
}
