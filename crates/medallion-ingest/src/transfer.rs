//! Landing transfer
//!
//! Mirrors a source's local folder into its landing destination, file for
//! file. Copies always overwrite, so re-running a transfer converges on the
//! same landing state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use medallion_common::checksum::{compute_file_checksum, verify_file_checksum, ChecksumAlgorithm};
use medallion_common::{MedallionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

/// Default number of files copied at once
pub const DEFAULT_FILE_CONCURRENCY: usize = 8;

/// File copy capability
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy `source` to `dest`, creating parent directories. Returns bytes copied.
    async fn copy(&self, source: &Path, dest: &Path, overwrite: bool) -> std::io::Result<u64>;

    /// Make sure `dir` exists
    async fn ensure_dir(&self, dir: &Path) -> std::io::Result<()>;
}

/// [`FileTransfer`] between local paths
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileTransfer;

#[async_trait]
impl FileTransfer for LocalFileTransfer {
    async fn copy(&self, source: &Path, dest: &Path, overwrite: bool) -> std::io::Result<u64> {
        if !overwrite && tokio::fs::try_exists(dest).await? {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", dest.display()),
            ));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, dest).await
    }

    async fn ensure_dir(&self, dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await
    }
}

/// One transferred artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandingFile {
    /// Path relative to the local root, preserved under the landing root
    pub relative_path: PathBuf,
    pub local_path: PathBuf,
    pub landing_path: PathBuf,
    pub bytes: u64,
    /// SHA-256 of the local file
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub local_root: PathBuf,
    pub landing_root: PathBuf,
    /// Copied files ordered by relative path
    pub files: Vec<LandingFile>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TransferReport {
    pub fn files_copied(&self) -> usize {
        self.files.len()
    }

    pub fn bytes_copied(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

/// Copies a local tree into the landing zone
#[derive(Clone)]
pub struct LandingTransfer {
    files: Arc<dyn FileTransfer>,
    concurrency: usize,
    verify: bool,
    cancel: CancellationToken,
}

impl LandingTransfer {
    pub fn new(files: Arc<dyn FileTransfer>) -> Self {
        Self {
            files,
            concurrency: DEFAULT_FILE_CONCURRENCY,
            verify: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Maximum number of copies in flight; 1 copies strictly one after another
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Re-hash each landing copy and compare against the local file.
    /// Only meaningful when landing paths are readable locally.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Abort signal checked before every copy
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Mirror every file under `local_root` into `landing_root`
    ///
    /// Stops at the first failed copy. Files already copied stay in place and
    /// files not yet started are skipped.
    #[instrument(skip_all, fields(local_root = %local_root.display(), landing_root = %landing_root.display()))]
    pub async fn transfer(&self, local_root: &Path, landing_root: &Path) -> Result<TransferReport> {
        let started_at = Utc::now();

        let files = list_files(local_root).await?;
        debug!(files = files.len(), "Enumerated local files");

        self.files
            .ensure_dir(landing_root)
            .await
            .map_err(|e| MedallionError::transfer(landing_root, e))?;

        let mut landed: Vec<LandingFile> = stream::iter(files)
            .map(|(local_path, relative_path)| self.copy_one(local_path, relative_path, landing_root))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        landed.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let report = TransferReport {
            local_root: local_root.to_path_buf(),
            landing_root: landing_root.to_path_buf(),
            files: landed,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            files = report.files_copied(),
            bytes = report.bytes_copied(),
            "Landing transfer complete"
        );
        Ok(report)
    }

    async fn copy_one(
        &self,
        local_path: PathBuf,
        relative_path: PathBuf,
        landing_root: &Path,
    ) -> Result<LandingFile> {
        if self.cancel.is_cancelled() {
            return Err(MedallionError::Cancelled);
        }

        let landing_path = landing_root.join(&relative_path);
        info!("Uploading {} → {}", local_path.display(), landing_path.display());

        let bytes = self
            .files
            .copy(&local_path, &landing_path, true)
            .await
            .map_err(|e| MedallionError::transfer(&local_path, e))?;

        let sha256 = hash_file(local_path.clone()).await?;
        if self.verify {
            let (landing, expected) = (landing_path.clone(), sha256.clone());
            tokio::task::spawn_blocking(move || {
                verify_file_checksum(&landing, &expected, ChecksumAlgorithm::Sha256)
            })
            .await
            .map_err(|e| MedallionError::transfer(&landing_path, std::io::Error::other(e)))??;
        }

        Ok(LandingFile {
            relative_path,
            local_path,
            landing_path,
            bytes,
            sha256,
        })
    }
}

async fn hash_file(path: PathBuf) -> Result<String> {
    let task_path = path.clone();
    tokio::task::spawn_blocking(move || compute_file_checksum(&task_path, ChecksumAlgorithm::Sha256))
        .await
        .map_err(|e| MedallionError::transfer(&path, std::io::Error::other(e)))?
        .map_err(|e| match e {
            MedallionError::Io(io) => MedallionError::transfer(&path, io),
            other => other,
        })
}

/// Every file under `root` paired with its path relative to `root`
async fn list_files(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let meta = tokio::fs::metadata(root)
        .await
        .map_err(|e| MedallionError::transfer(root, e))?;
    if !meta.is_dir() {
        return Err(MedallionError::transfer(
            root,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "local root is not a directory"),
        ));
    }

    let owned_root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        // Symlinked files land as copies of their targets.
        for entry in WalkDir::new(&owned_root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(owned_root.as_path()).to_path_buf();
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                MedallionError::transfer(path, io)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&owned_root)
                .map_err(|e| MedallionError::transfer(entry.path(), std::io::Error::other(e)))?
                .to_path_buf();
            files.push((entry.into_path(), relative));
        }
        Ok::<_, MedallionError>(files)
    })
    .await
    .map_err(|e| MedallionError::transfer(root, std::io::Error::other(e)))?
}
