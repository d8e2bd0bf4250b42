//! Medallion Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and checksum utilities for the Medallion
//! ingestion workspace.
//!
//! - **Error Handling**: the ingestion error taxonomy and result alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: content hashing for landing file verification
//!
//! # Example
//!
//! ```no_run
//! use medallion_common::checksum::{compute_file_checksum, ChecksumAlgorithm};
//! use medallion_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Sha256)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{ErrorKind, MedallionError, Result};
