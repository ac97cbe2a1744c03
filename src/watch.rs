// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Periodic upstream polling.
//!
//! Following a project fetches once as usual, so missing content is always
//! installed, then keeps watching. The watcher checks the remote on a fixed
//! interval, starting right away.
//! Updates are awaited in place, so a tick that comes due while an update is
//! still running is dropped rather than queued. Shutdown is only noticed
//! between ticks, which lets an in-flight update finish first.

use crate::{
    repository::RepositoryClient,
    state::Strategy,
    sync::{FetchOptions, FetchReport, SyncError, SyncOrchestrator},
};

use inquire::Confirm;
use std::{
    future::Future,
    io::{stdin, stdout, IsTerminal},
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What the watcher does when it finds an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Apply every update without asking.
    Auto,

    /// Ask on the terminal before applying.
    Prompt,

    /// Log that an update exists, but never apply it.
    NotifyOnly,
}

impl ApplyMode {
    /// Pick mode from the auto flag and terminal capability.
    ///
    /// Without the auto flag, interactive sessions are prompted and
    /// everything else is only notified.
    pub fn detect(auto: bool) -> Self {
        if auto {
            Self::Auto
        } else if stdin().is_terminal() && stdout().is_terminal() {
            Self::Prompt
        } else {
            Self::NotifyOnly
        }
    }
}

/// Counters of a finished watch session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchSummary {
    pub ticks: u64,
    pub applied: u64,
    pub declined: u64,
    pub failed: u64,
}

/// Initial fetch of a followed project and what watching did afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSession {
    pub initial: FetchReport,
    pub summary: WatchSummary,
}

/// Poll the remote and apply updates as they appear.
#[derive(Debug, Clone)]
pub struct Watcher {
    period: Duration,
    mode: ApplyMode,
}

impl Watcher {
    /// Construct new watcher.
    pub fn new(period: Duration, mode: ApplyMode) -> Self {
        Self { period, mode }
    }

    /// Fetch once, then watch until Ctrl-C.
    ///
    /// # Errors
    ///
    /// - Return any error of [`SyncOrchestrator::fetch`] for the initial
    ///   fetch. Failed updates while watching are logged instead.
    pub async fn follow<R: RepositoryClient>(
        &self,
        orchestrator: &mut SyncOrchestrator<R>,
        opts: FetchOptions,
    ) -> Result<WatchSession, SyncError> {
        self.follow_until(orchestrator, opts, ctrl_c()).await
    }

    /// Fetch once, then watch until shutdown resolves.
    ///
    /// # Errors
    ///
    /// - Return any error of [`SyncOrchestrator::fetch`] for the initial
    ///   fetch.
    pub async fn follow_until<R: RepositoryClient>(
        &self,
        orchestrator: &mut SyncOrchestrator<R>,
        opts: FetchOptions,
        shutdown: impl Future<Output = ()>,
    ) -> Result<WatchSession, SyncError> {
        let initial = orchestrator.fetch(opts).await?;
        info!(
            "{} finished at revision {}",
            initial.strategy,
            initial.revision.as_deref().unwrap_or("unknown")
        );

        let summary = self.run_until(orchestrator, shutdown).await;
        Ok(WatchSession { initial, summary })
    }

    /// Watch until shutdown resolves.
    pub async fn run_until<R: RepositoryClient>(
        &self,
        orchestrator: &mut SyncOrchestrator<R>,
        shutdown: impl Future<Output = ()>,
    ) -> WatchSummary {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("watching for updates every {:?}", self.period);
        let mut summary = WatchSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("stop watching");
                    break;
                }
                _ = ticker.tick() => {
                    summary.ticks += 1;
                    self.tick(orchestrator, &mut summary).await;
                }
            }
        }

        summary
    }

    async fn tick<R: RepositoryClient>(
        &self,
        orchestrator: &mut SyncOrchestrator<R>,
        summary: &mut WatchSummary,
    ) {
        let status = orchestrator.status().await;
        if status.assessment.check_failed {
            warn!("cannot reach remote, try again next tick");
            return;
        }

        if status.strategy == Strategy::Skip {
            debug!("content is up to date");
            return;
        }

        let revision = status.assessment.live_revision.unwrap_or_default();
        let apply = match self.mode {
            ApplyMode::Auto => true,
            ApplyMode::Prompt => confirm(&revision).await,
            ApplyMode::NotifyOnly => {
                info!("update to {revision} is available, run fetch to apply it");
                false
            }
        };

        if !apply {
            summary.declined += 1;
            return;
        }

        match orchestrator.fetch(FetchOptions::default()).await {
            Ok(report) => {
                summary.applied += 1;
                info!("applied update with {}", report.strategy);
            }
            Err(err) => {
                summary.failed += 1;
                error!("update failed: {err}");
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}

async fn confirm(revision: &str) -> bool {
    let message = format!("Update content to {revision}?");
    let answer = tokio::task::spawn_blocking(move || {
        Confirm::new(&message).with_default(true).prompt().ok()
    })
    .await;

    matches!(answer, Ok(Some(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::CacheStore,
        config::Config,
        repository::Result as RepoResult,
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct StaticRemote;

    impl RepositoryClient for StaticRemote {
        async fn remote_revision(&self, _: &str, _: &str) -> RepoResult<String> {
            Ok("c0ffee".into())
        }

        async fn clone_sparse(&self, _: &str, _: &str, dest: &Path, _: &[String]) -> RepoResult<()> {
            tokio::fs::create_dir_all(dest.join("docs")).await?;
            tokio::fs::write(dest.join("docs/index.md"), "# docs").await?;
            Ok(())
        }

        async fn checkout_revision(&self, _: &Path) -> RepoResult<String> {
            Ok("c0ffee".into())
        }
    }

    async fn orchestrator(project: &TempDir) -> anyhow::Result<SyncOrchestrator<StaticRemote>> {
        let config: Config = indoc! {r#"
            repo_url = "https://github.com/org/content.git"

            [mapping]
            docs = "docs"
        "#}
        .parse()?;
        let cache = CacheStore::open(project.path().join(".content-mirror/cache"))?;

        Ok(SyncOrchestrator::new(config, project.path(), StaticRemote, cache).await?)
    }

    #[tokio::test]
    async fn auto_mode_applies_once_then_idles() -> anyhow::Result<()> {
        let project = tempdir()?;
        let mut sync = orchestrator(&project).await?;
        let watcher = Watcher::new(Duration::from_millis(20), ApplyMode::Auto);

        let summary = watcher
            .run_until(&mut sync, tokio::time::sleep(Duration::from_millis(200)))
            .await;

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 0);
        assert!(summary.ticks >= 2);
        assert!(project.path().join("docs/index.md").exists());

        Ok(())
    }

    #[tokio::test]
    async fn notify_only_never_touches_project() -> anyhow::Result<()> {
        let project = tempdir()?;
        let mut sync = orchestrator(&project).await?;
        let watcher = Watcher::new(Duration::from_millis(20), ApplyMode::NotifyOnly);

        let summary = watcher
            .run_until(&mut sync, tokio::time::sleep(Duration::from_millis(70)))
            .await;

        assert_eq!(summary.applied, 0);
        assert_eq!(summary.declined, summary.ticks);
        assert!(!project.path().join("docs").exists());

        Ok(())
    }

    #[tokio::test]
    async fn follow_installs_missing_content_before_watching() -> anyhow::Result<()> {
        let project = tempdir()?;
        let mut sync = orchestrator(&project).await?;
        let watcher = Watcher::new(Duration::from_millis(20), ApplyMode::NotifyOnly);

        let session = watcher
            .follow_until(
                &mut sync,
                FetchOptions::default(),
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await?;

        assert_eq!(session.initial.strategy, Strategy::FullFetch);
        assert!(project.path().join("docs/index.md").exists());
        assert_eq!(session.summary.declined, 0);
        assert_eq!(session.summary.applied, 0);

        Ok(())
    }

    #[test]
    fn auto_flag_wins_detection() {
        assert_eq!(ApplyMode::detect(true), ApplyMode::Auto);
    }
}
