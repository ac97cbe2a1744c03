// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sync orchestration.
//!
//! A run moves through a small state machine:
//!
//! ```text
//! Idle -> CheckingStaleness -> { Skip | SafeUpdate | FullFetch } -> Done | Failed
//! ```
//!
//! - __Skip__: content is fresh and complete. Only the ignore file is
//!   reconciled.
//! - __SafeUpdate__: clone, then copy over existing content. Nothing is
//!   backed up and nothing is deleted.
//! - __FullFetch__: back up every destination, delete it, clone, then
//!   reinstall. The backup is discarded once the run succeeds.
//!
//! Any failure while cloning or installing removes the temporary clone and
//! puts back whatever backup this run took, before the error reaches the
//! caller. A backup is removed once it has been fully restored, and kept on
//! disk otherwise.
//!
//! Once content is installed, the new revision is recorded before the
//! project's `.gitignore` is reconciled. A failing reconcile is reported,
//! but the installed content stays and a later run skips it.

use crate::{
    backup::{Backup, BackupError, BackupManager},
    cache::{now_millis, CacheStore},
    config::{Config, ConfigError, PartialFailurePolicy},
    executor::{BatchOutcome, ConcurrencyExecutor, Progress},
    hooks::{EventBus, LifecycleEvent},
    ignore_file::{IgnoreFile, IgnoreFileError},
    install::{ContentInstaller, FileFilter, InstallationResult},
    layout::PathTransform,
    mapping::ContentMapping,
    repository::{GitClient, RepositoryClient, RepositoryError},
    state::{Assessment, ContentStateClassifier, Strategy},
    tree,
};

use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{info, instrument, warn};

/// Options of a single fetch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Bypass the staleness check.
    pub force: bool,
}

/// Counters kept for the lifetime of an orchestrator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metrics {
    /// Construction time in milliseconds since the Unix epoch.
    pub started_at: u64,
    pub last_fetch_duration: Option<Duration>,

    /// Skipped runs plus mappings left alone because they were unchanged.
    pub cache_hits: u64,

    /// Mappings that had to be copied.
    pub cache_misses: u64,
    pub files_processed: u64,
    pub operations: u64,
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub strategy: Strategy,

    /// Revision now installed, if known.
    pub revision: Option<String>,

    /// Installation outcome. Skipped runs install nothing.
    pub outcome: Option<BatchOutcome<InstallationResult>>,
    pub metrics: Metrics,
}

/// Assessment of project with the strategy a fetch would pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub assessment: Assessment,
    pub strategy: Strategy,
}

/// Drive runs against one project.
#[derive(Debug)]
pub struct SyncOrchestrator<R = GitClient> {
    config: Config,
    mappings: Vec<ContentMapping>,
    project_root: PathBuf,
    transform: &'static dyn PathTransform,
    client: R,
    cache: CacheStore,
    executor: ConcurrencyExecutor,
    events: EventBus,
    metrics: Metrics,
}

impl<R: RepositoryClient> SyncOrchestrator<R> {
    /// Construct new orchestrator for project.
    ///
    /// Configuration is checked before anything touches the disk or the
    /// network. Expired cache entries are swept afterwards.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Config`] if configuration is invalid.
    pub async fn new(
        config: Config,
        project_root: impl Into<PathBuf>,
        client: R,
        cache: CacheStore,
    ) -> Result<Self> {
        let project_root = project_root.into();
        let mappings = config.validate_within(&project_root)?;
        let transform = config.layout.transform();

        let swept = cache.sweep_expired().await;
        if swept > 0 {
            info!("swept {swept} expired cache entries");
        }

        Ok(Self {
            config,
            mappings,
            project_root,
            transform,
            client,
            cache,
            executor: ConcurrencyExecutor::new(),
            events: EventBus::new(),
            metrics: Metrics {
                started_at: now_millis(),
                ..Default::default()
            },
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mappings(&self) -> &[ContentMapping] {
        &self.mappings
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Register listener for lifecycle events.
    pub fn subscribe(&mut self, listener: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
        self.events.subscribe(listener);
    }

    /// Start reporting installation progress, returning the receiving end.
    pub fn progress(&mut self) -> mpsc::UnboundedReceiver<Progress> {
        self.executor.progress()
    }

    /// Assess project and pick a strategy without changing anything.
    #[instrument(skip(self), level = "debug")]
    pub async fn status(&self) -> StatusReport {
        let assessment = self.classifier().assess(self.url(), self.branch(), &self.mappings).await;
        let strategy = Strategy::choose(&assessment, false);

        StatusReport {
            assessment,
            strategy,
        }
    }

    /// Bring project content in line with the remote.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Repository`] if remote content cannot be cloned.
    /// - Return [`SyncError::Backup`] if backup directory cannot be created.
    /// - Return [`SyncError::Io`] if old destinations cannot be removed.
    /// - Return [`SyncError::PartialFailure`] if some mappings failed and
    ///   partial failures are configured to fail the run.
    /// - Return [`SyncError::InstallFailed`] if every mapping failed.
    /// - Return [`SyncError::IgnoreFile`] if the ignore file cannot be
    ///   reconciled.
    #[instrument(skip(self), level = "debug")]
    pub async fn fetch(&mut self, opts: FetchOptions) -> Result<FetchReport> {
        let started = Instant::now();
        self.metrics.operations += 1;

        let assessment = if opts.force {
            self.forced_assessment().await
        } else {
            self.classifier().assess(self.url(), self.branch(), &self.mappings).await
        };
        let strategy = Strategy::choose(&assessment, opts.force);
        info!(
            "content is {}, strategy is {strategy}",
            assessment.existence
        );
        self.events.emit(LifecycleEvent::BeforeFetch { strategy });

        let result = match strategy {
            Strategy::Skip => self
                .skip(&assessment)
                .await
                .map(|_| (assessment.live_revision.clone(), None)),
            Strategy::SafeUpdate => self
                .safe_update()
                .await
                .map(|(revision, outcome)| (Some(revision), Some(outcome))),
            Strategy::FullFetch => self
                .full_fetch()
                .await
                .map(|(revision, outcome)| (Some(revision), Some(outcome))),
        };

        self.metrics.last_fetch_duration = Some(started.elapsed());

        match result {
            Ok((revision, outcome)) => {
                info!("{strategy} done in {:?}", started.elapsed());
                Ok(FetchReport {
                    strategy,
                    revision,
                    outcome,
                    metrics: self.metrics.clone(),
                })
            }
            Err(err) => {
                self.events.emit(LifecycleEvent::OnError {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn skip(&mut self, assessment: &Assessment) -> Result<()> {
        info!("content is up to date, nothing to fetch");
        self.reconcile_ignore_file().await?;
        self.metrics.cache_hits += 1;
        self.events.emit(LifecycleEvent::Skipped {
            revision: assessment.live_revision.clone(),
        });

        Ok(())
    }

    async fn safe_update(&mut self) -> Result<(String, BatchOutcome<InstallationResult>)> {
        // INVARIANT: A failed update must not leave the old revision marked
        //   as installed.
        self.cache
            .forget_repository_info(&self.config.repo_url, &self.config.branch)
            .await;

        let clone_dir = self.clone_dir();
        let result = self.clone_and_install(&clone_dir).await;
        self.cleanup(&clone_dir).await;
        let (revision, outcome) = result?;

        self.cache
            .cache_repository_info(&self.config.repo_url, &self.config.branch, &revision)
            .await;
        self.reconcile_ignore_file().await?;

        Ok((revision, outcome))
    }

    async fn full_fetch(&mut self) -> Result<(String, BatchOutcome<InstallationResult>)> {
        let backups = BackupManager::new(&self.project_root);
        let destinations = self.relative_destinations();
        let backup = backups
            .backup(&destinations, &self.project_root.join(&self.config.backup_dir))
            .await?;

        let clone_dir = self.clone_dir();
        let result = match self.remove_destinations(&destinations).await {
            Ok(()) => self.clone_and_install(&clone_dir).await,
            Err(err) => Err(err),
        };
        self.cleanup(&clone_dir).await;

        let (revision, outcome) = match result {
            Ok(done) => done,
            Err(err) => {
                recover(&backups, backup).await;
                return Err(err);
            }
        };

        self.cache
            .cache_repository_info(&self.config.repo_url, &self.config.branch, &revision)
            .await;
        backups.discard(backup).await;
        self.reconcile_ignore_file().await?;

        Ok((revision, outcome))
    }

    async fn clone_and_install(
        &mut self,
        clone_dir: &Path,
    ) -> Result<(String, BatchOutcome<InstallationResult>)> {
        let patterns: Vec<String> = self
            .mappings
            .iter()
            .flat_map(ContentMapping::sparse_patterns)
            .collect();

        self.client
            .clone_sparse(&self.config.repo_url, &self.config.branch, clone_dir, &patterns)
            .await?;
        let revision = self.client.checkout_revision(clone_dir).await?;
        self.events.emit(LifecycleEvent::AfterClone {
            revision: revision.clone(),
        });

        let installer = ContentInstaller::new(&self.cache, &self.project_root, self.transform)
            .with_filter(FileFilter {
                allowed_extensions: self.config.allowed_extensions.clone(),
                max_file_size_bytes: self.config.max_file_size_bytes,
            })
            .with_executor(self.executor.clone())
            .with_concurrency(self.config.concurrent_operations)
            .with_retry(self.config.retry_policy());
        let outcome = installer.install_all(&self.mappings, clone_dir).await;
        let written = installer.files_written();

        let cached = outcome.cached_count() as u64;
        let copied = outcome.results.len() as u64 - cached;
        self.metrics.files_processed += written;
        self.metrics.cache_hits += cached;
        self.metrics.cache_misses += copied;

        let installed = outcome.results.len();
        let failed = outcome.errors.len();
        self.events
            .emit(LifecycleEvent::AfterInstall { installed, failed });

        if failed > 0 {
            if installed == 0 {
                return Err(SyncError::InstallFailed {
                    failed,
                    first: outcome.errors[0].message.clone(),
                });
            }

            match self.config.on_partial_failure {
                PartialFailurePolicy::Warn => {
                    warn!("{failed} of {} mapping(s) failed to install", installed + failed);
                    for failure in &outcome.errors {
                        warn!("mapping {:?}: {}", self.mappings[failure.index].key, failure.message);
                    }
                }
                PartialFailurePolicy::Fail => {
                    return Err(SyncError::PartialFailure {
                        failed,
                        total: installed + failed,
                    });
                }
            }
        }

        Ok((revision, outcome))
    }

    async fn forced_assessment(&self) -> Assessment {
        let existence = self.classifier().classify_existence(&self.mappings).await;
        let cached_revision = self
            .cache
            .cached_repository_info(self.url(), self.branch())
            .await
            .map(|info| info.commit_hash);

        Assessment {
            existence,
            cached_revision,
            live_revision: None,
            stale: true,
            check_failed: false,
        }
    }

    async fn remove_destinations(&self, destinations: &[PathBuf]) -> Result<()> {
        for destination in destinations {
            let path = self.project_root.join(destination);
            tree::remove_path(&path)
                .await
                .map_err(|err| SyncError::Io { source: err, path })?;
        }

        Ok(())
    }

    async fn cleanup(&self, clone_dir: &Path) {
        if let Err(err) = tree::remove_path(clone_dir).await {
            warn!("cannot remove temporary clone at {}: {err}", clone_dir.display());
        }
    }

    async fn reconcile_ignore_file(&self) -> Result<()> {
        if !self.config.manage_gitignore {
            return Ok(());
        }

        IgnoreFile::new(&self.project_root)
            .reconcile(self.relative_destinations())
            .await?;
        Ok(())
    }

    fn classifier(&self) -> ContentStateClassifier<'_, R> {
        ContentStateClassifier::new(&self.client, &self.cache, &self.project_root, self.transform)
    }

    fn relative_destinations(&self) -> Vec<PathBuf> {
        self.mappings
            .iter()
            .map(|mapping| self.transform.transform(&mapping.destination))
            .collect()
    }

    fn clone_dir(&self) -> PathBuf {
        self.project_root
            .join(&self.config.temp_dir)
            .join(format!("clone-{}", now_millis()))
    }

    fn url(&self) -> &str {
        &self.config.repo_url
    }

    fn branch(&self) -> &str {
        &self.config.branch
    }
}

/// Put backup back after a failed run, removing it once fully restored.
async fn recover(backups: &BackupManager, backup: Backup) {
    if backup.is_empty() {
        return;
    }

    warn!("fetch failed, restoring backup from {}", backup.dir.display());
    let restored = backups.restore(&backup.dir).await;
    if restored.is_complete() {
        backups.discard(backup).await;
    } else {
        warn!(
            "{} file(s) could not be restored, backup kept at {}",
            restored.failed,
            backup.dir.display()
        );
    }
}

/// Sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Remote access failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Backup could not be taken.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Ignore file could not be reconciled.
    #[error(transparent)]
    IgnoreFile(#[from] IgnoreFileError),

    /// Project content could not be changed.
    #[error("failed to update {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Some mappings failed while partial failures fail the run.
    #[error("{failed} of {total} mapping(s) failed to install")]
    PartialFailure { failed: usize, total: usize },

    /// Every mapping failed.
    #[error("every mapping failed to install ({failed} total), first error: {first}")]
    InstallFailed { failed: usize, first: String },
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
