//! Error types for Medallion
//!
//! The first four variants form the ingestion taxonomy: a broken catalog
//! (`Config`), a landing copy that failed (`Transfer`), a landing dataset that
//! could not be read (`Read`) and a bronze append that was rejected (`Write`).

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Medallion operations
pub type Result<T> = std::result::Result<T, MedallionError>;

/// Main error type for Medallion
#[derive(Error, Debug)]
pub enum MedallionError {
    /// Source catalog is malformed, incomplete or ambiguous
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single landing file copy failed
    #[error("Transfer failed for '{}': {source}", path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Landing dataset is missing, unreadable or not parseable in its format
    #[error("Read failed for '{}': {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    /// Bronze append was rejected
    #[error("Write failed for '{}': {reason}", target.display())]
    Write { target: PathBuf, reason: String },

    /// Run stopped by the abort signal
    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch for '{}': expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

/// Coarse classification of a [`MedallionError`], used in reports and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Transfer,
    Read,
    Write,
    Cancelled,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Read => "read",
            ErrorKind::Write => "write",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

impl MedallionError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transfer error for the file at `path`
    pub fn transfer(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Transfer {
            path: path.into(),
            source,
        }
    }

    /// Create a read error for the dataset at `path`
    pub fn read(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Read {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a write error for the bronze `target`
    pub fn write(target: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Write {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Taxonomy tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MedallionError::Config(_) => ErrorKind::Config,
            MedallionError::Transfer { .. } | MedallionError::ChecksumMismatch { .. } => {
                ErrorKind::Transfer
            },
            MedallionError::Read { .. } => ErrorKind::Read,
            MedallionError::Write { .. } => ErrorKind::Write,
            MedallionError::Cancelled => ErrorKind::Cancelled,
            MedallionError::Io(_) | MedallionError::Serialization(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_names_file() {
        let err = MedallionError::transfer(
            "/data/local/orders/a.csv",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(err.to_string().contains("/data/local/orders/a.csv"));
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(MedallionError::config("dup").kind(), ErrorKind::Config);
        assert_eq!(MedallionError::read("x", "missing").kind(), ErrorKind::Read);
        assert_eq!(MedallionError::write("t", "locked").kind(), ErrorKind::Write);
        assert_eq!(MedallionError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(ErrorKind::Write.to_string(), "write");
    }
}
