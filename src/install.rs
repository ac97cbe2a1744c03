// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Content installation.
//!
//! Copies mapped content out of a temporary clone into the project. Each
//! mapping is fingerprinted before copying, and a mapping whose fingerprint
//! matches the one recorded at its last install is left alone, as long as
//! its destination still holds content.

use crate::{
    cache::CacheStore,
    executor::{BatchOutcome, ConcurrencyExecutor, RunOptions},
    layout::PathTransform,
    mapping::{ContentMapping, MappingKind},
    retry::RetryPolicy,
    tree,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, info, instrument, warn};

/// Outcome of installing one mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationResult {
    pub key: String,
    pub destination: PathBuf,
    pub success: bool,

    /// Content was unchanged, so nothing was copied.
    pub cached: bool,
}

/// Limits applied to folder installs.
#[derive(Debug, Clone)]
pub struct FileFilter {
    /// Extensions to keep, without leading dot. Empty keeps everything.
    pub allowed_extensions: Vec<String>,

    /// Largest file to keep.
    pub max_file_size_bytes: u64,
}

impl FileFilter {
    fn admits(&self, path: &Path, size: u64) -> bool {
        if size > self.max_file_size_bytes {
            warn!(
                "skip {}: {size} bytes exceeds limit of {}",
                path.display(),
                self.max_file_size_bytes
            );
            return false;
        }

        if self.allowed_extensions.is_empty() {
            return true;
        }

        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let allowed = self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&extension));

        if !allowed {
            warn!("skip {}: extension not allowed", path.display());
        }

        allowed
    }
}

/// Copy mapped content from a clone into the project.
pub struct ContentInstaller<'a> {
    cache: &'a CacheStore,
    project_root: PathBuf,
    transform: &'static dyn PathTransform,
    filter: FileFilter,
    executor: ConcurrencyExecutor,
    concurrency: usize,
    retry: RetryPolicy,
    files_written: AtomicU64,
}

impl<'a> ContentInstaller<'a> {
    /// Construct new installer writing into project root.
    pub fn new(
        cache: &'a CacheStore,
        project_root: impl Into<PathBuf>,
        transform: &'static dyn PathTransform,
    ) -> Self {
        Self {
            cache,
            project_root: project_root.into(),
            transform,
            filter: FileFilter {
                allowed_extensions: Vec::new(),
                max_file_size_bytes: u64::MAX,
            },
            executor: ConcurrencyExecutor::new(),
            concurrency: 5,
            retry: RetryPolicy::once(),
            files_written: AtomicU64::new(0),
        }
    }

    /// Apply filter to folder installs.
    pub fn with_filter(mut self, filter: FileFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Install mappings through target executor.
    pub fn with_executor(mut self, executor: ConcurrencyExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Install at most target number of mappings at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Retry each failed mapping with target policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of files written so far.
    pub fn files_written(&self) -> u64 {
        self.files_written.load(Ordering::Relaxed)
    }

    /// Absolute destination of mapping inside project.
    pub fn destination(&self, mapping: &ContentMapping) -> PathBuf {
        self.project_root
            .join(self.transform.transform(&mapping.destination))
    }

    /// Install one mapping out of clone root.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::SourceMissing`] if the clone lacks the
    ///   mapping's source.
    /// - Return [`InstallError::Io`] if content cannot be read or written.
    #[instrument(skip(self, mapping, clone_root), fields(key = %mapping.key), level = "debug")]
    pub async fn install_one(
        &self,
        mapping: &ContentMapping,
        clone_root: &Path,
    ) -> Result<InstallationResult> {
        let source = clone_root.join(&mapping.source);
        let destination = self.destination(mapping);
        let io_error = |source| InstallError::Io {
            key: mapping.key.clone(),
            source,
        };

        let fresh = digest(&source)
            .await
            .map_err(io_error)?
            .ok_or_else(|| InstallError::SourceMissing {
                key: mapping.key.clone(),
                path: source.clone(),
            })?;

        let unchanged = self
            .cache
            .cached_file_digest(&mapping.key)
            .await
            .is_some_and(|cached| cached.hash == fresh);
        if unchanged && tree::has_content(&destination).await {
            debug!("{} unchanged, skip install", mapping.key);
            return Ok(InstallationResult {
                key: mapping.key.clone(),
                destination,
                success: true,
                cached: true,
            });
        }

        let written = match mapping.kind {
            MappingKind::Folder => self.install_folder(&source, &destination).await,
            MappingKind::Selective => {
                self.install_selective(&source, &destination, &mapping.files)
                    .await
            }
            MappingKind::File => tree::copy_file(&source, &destination).await.map(|_| 1),
        }
        .map_err(io_error)?;

        self.files_written.fetch_add(written, Ordering::Relaxed);
        self.cache.cache_file_digest(&mapping.key, &fresh).await;
        info!(
            "installed {} ({written} file(s)) into {}",
            mapping.key,
            destination.display()
        );

        Ok(InstallationResult {
            key: mapping.key.clone(),
            destination,
            success: true,
            cached: false,
        })
    }

    /// Install every mapping with bounded parallelism.
    ///
    /// Failed mappings are collected into the outcome, never raised.
    pub async fn install_all(
        &self,
        mappings: &[ContentMapping],
        clone_root: &Path,
    ) -> BatchOutcome<InstallationResult> {
        let opts = RunOptions {
            concurrency: self.concurrency,
            retry: self.retry,
            ..Default::default()
        };

        // INVARIANT: Borrow mapping through the outer slice so the worker's
        //   future does not depend on the lifetime of its item argument.
        self.executor
            .run(
                mappings,
                |_, index| self.install_one(&mappings[index], clone_root),
                &opts,
            )
            .await
    }

    async fn install_folder(&self, source: &Path, destination: &Path) -> std::io::Result<u64> {
        let mut written = 0;
        for relative in tree::list_files_async(source.to_path_buf()).await? {
            let from = tree::join(source, &relative);
            let size = tokio::fs::metadata(&from).await?.len();
            if !self.filter.admits(&from, size) {
                continue;
            }

            tree::copy_file(&from, &tree::join(destination, &relative)).await?;
            written += 1;
        }

        Ok(written)
    }

    async fn install_selective(
        &self,
        source: &Path,
        destination: &Path,
        files: &[String],
    ) -> std::io::Result<u64> {
        let mut written = 0;
        for file in files {
            let from = source.join(file);
            if !tokio::fs::try_exists(&from).await? {
                warn!("skip {}: not found in remote content", from.display());
                continue;
            }

            tree::copy_file(&from, &destination.join(file)).await?;
            written += 1;
        }

        Ok(written)
    }
}

/// Fingerprint of everything under source.
///
/// Hashes every contained file in sorted relative path order, covering both
/// path and content. Returns `None` if source does not exist.
///
/// # Errors
///
/// - Return [`std::io::Error`] if any part of source cannot be read.
pub async fn digest(source: &Path) -> std::io::Result<Option<String>> {
    let source = source.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<Option<String>> {
        if !source.exists() {
            return Ok(None);
        }

        let mut hasher = Sha256::new();
        for relative in tree::list_files(&source)? {
            let content = std::fs::read(tree::join(&source, &relative))?;
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }

        Ok(Some(format!("{:x}", hasher.finalize())))
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Installation error types.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Clone does not carry mapping source.
    #[error("source of mapping {key:?} not found at {:?}", path.display())]
    SourceMissing { key: String, path: PathBuf },

    /// Content cannot be read or written.
    #[error("failed to install mapping {key:?}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = InstallError> = std::result::Result<T, E>;
