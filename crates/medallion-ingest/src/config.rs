//! Ingestion configuration
//!
//! Roots and concurrency limits for a run, loaded from `MEDALLION_*`
//! environment variables. The binary layers CLI flags on top.

use crate::orchestrator::DEFAULT_SOURCE_CONCURRENCY;
use crate::transfer::DEFAULT_FILE_CONCURRENCY;
use medallion_common::{MedallionError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_CATALOG: &str = "sources.yml";
pub const DEFAULT_LOCAL_ROOT: &str = "./data/local";
pub const DEFAULT_LANDING_ROOT: &str = "./data/landing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Source catalog (YAML)
    #[serde(default = "default_catalog")]
    pub catalog: PathBuf,
    /// Root holding one subfolder per source name
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    #[serde(default = "default_landing_root")]
    pub landing_root: PathBuf,
    /// Bronze tables root; bronze promotion is skipped when unset
    #[serde(default)]
    pub bronze_root: Option<PathBuf>,
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,
    #[serde(default = "default_source_concurrency")]
    pub source_concurrency: usize,
    /// Re-hash landing copies against their local originals
    #[serde(default)]
    pub verify_checksums: bool,
}

fn default_catalog() -> PathBuf {
    PathBuf::from(DEFAULT_CATALOG)
}

fn default_local_root() -> PathBuf {
    PathBuf::from(DEFAULT_LOCAL_ROOT)
}

fn default_landing_root() -> PathBuf {
    PathBuf::from(DEFAULT_LANDING_ROOT)
}

fn default_file_concurrency() -> usize {
    DEFAULT_FILE_CONCURRENCY
}

fn default_source_concurrency() -> usize {
    DEFAULT_SOURCE_CONCURRENCY
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            catalog: default_catalog(),
            local_root: default_local_root(),
            landing_root: default_landing_root(),
            bronze_root: None,
            file_concurrency: default_file_concurrency(),
            source_concurrency: default_source_concurrency(),
            verify_checksums: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(catalog) = lookup("MEDALLION_CATALOG") {
            config.catalog = PathBuf::from(catalog);
        }
        if let Some(root) = lookup("MEDALLION_LOCAL_ROOT") {
            config.local_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("MEDALLION_LANDING_ROOT") {
            config.landing_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("MEDALLION_BRONZE_ROOT") {
            config.bronze_root = Some(PathBuf::from(root));
        }
        if let Some(value) = lookup("MEDALLION_FILE_CONCURRENCY") {
            config.file_concurrency = parse_count("MEDALLION_FILE_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("MEDALLION_SOURCE_CONCURRENCY") {
            config.source_concurrency = parse_count("MEDALLION_SOURCE_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("MEDALLION_VERIFY_CHECKSUMS") {
            config.verify_checksums = value.parse().map_err(|_| {
                MedallionError::config(format!(
                    "MEDALLION_VERIFY_CHECKSUMS: expected true or false, got '{}'",
                    value
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_concurrency == 0 {
            return Err(MedallionError::config("file_concurrency must be at least 1"));
        }
        if self.source_concurrency == 0 {
            return Err(MedallionError::config("source_concurrency must be at least 1"));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        MedallionError::config(format!(
            "{}: expected a positive integer, got '{}'",
            key, value
        ))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = IngestConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.file_concurrency, 8);
        assert_eq!(config.source_concurrency, 4);
        assert!(config.bronze_root.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = IngestConfig::from_lookup(lookup(&[
            ("MEDALLION_CATALOG", "/etc/medallion/sources.yml"),
            ("MEDALLION_LANDING_ROOT", "/mnt/landing"),
            ("MEDALLION_BRONZE_ROOT", "/mnt/bronze"),
            ("MEDALLION_FILE_CONCURRENCY", "16"),
            ("MEDALLION_VERIFY_CHECKSUMS", "true"),
        ]))
        .unwrap();

        assert_eq!(config.catalog, PathBuf::from("/etc/medallion/sources.yml"));
        assert_eq!(config.local_root, PathBuf::from(DEFAULT_LOCAL_ROOT));
        assert_eq!(config.landing_root, PathBuf::from("/mnt/landing"));
        assert_eq!(config.bronze_root, Some(PathBuf::from("/mnt/bronze")));
        assert_eq!(config.file_concurrency, 16);
        assert!(config.verify_checksums);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = IngestConfig::from_lookup(lookup(&[("MEDALLION_SOURCE_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(matches!(err, MedallionError::Config(_)));
    }

    #[test]
    fn test_unparseable_concurrency_rejected() {
        let err = IngestConfig::from_lookup(lookup(&[("MEDALLION_FILE_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("MEDALLION_FILE_CONCURRENCY"));
    }

    #[test]
    fn test_unparseable_verify_flag_rejected() {
        let err = IngestConfig::from_lookup(lookup(&[("MEDALLION_VERIFY_CHECKSUMS", "maybe")]))
            .unwrap_err();
        assert!(
            matches!(err, MedallionError::Config(ref m) if m.contains("expected true or false"))
        );
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: IngestConfig = serde_json::from_str(r#"{"bronze_root": "/b"}"#).unwrap();
        assert_eq!(config.bronze_root, Some(PathBuf::from("/b")));
        assert_eq!(config.catalog, PathBuf::from(DEFAULT_CATALOG));
        assert_eq!(config.source_concurrency, DEFAULT_SOURCE_CONCURRENCY);
    }
}
