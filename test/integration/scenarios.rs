// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::FakeRemote;

use anyhow::Result;
use content_mirror::{
    config::ConfigError,
    executor::{ConcurrencyExecutor, RunOptions},
    mapping::MappingError,
    retry::RetryPolicy,
    CacheStore, Config, FetchOptions, Strategy, SyncError, SyncOrchestrator,
};
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{path::Path, time::Duration};
use tempfile::{tempdir, TempDir};

const CONFIG: &str = indoc! {r#"
    repo_url = "https://github.com/org/content.git"
    max_retries = 1
    retry_delay_ms = 1

    [mapping]
    content = { source = "content", destination = "src/content" }
"#};

fn remote() -> FakeRemote {
    FakeRemote::new("rev1")
        .with_file("content/one.md", "one")
        .with_file("content/two.md", "two")
        .with_file("content/nested/three.md", "three")
}

async fn orchestrator(
    project: &TempDir,
    config: &str,
    remote: &FakeRemote,
) -> Result<SyncOrchestrator<FakeRemote>> {
    let config: Config = config.parse()?;
    let cache = CacheStore::open(project.path().join(".content-mirror/cache"))?;

    Ok(SyncOrchestrator::new(config, project.path(), remote.clone(), cache).await?)
}

fn read(project: &TempDir, path: impl AsRef<Path>) -> Result<String> {
    Ok(std::fs::read_to_string(project.path().join(path))?)
}

fn leftover_backups(project: &TempDir) -> Result<usize> {
    let dir = project.path().join(".content-mirror/backup");
    if !dir.exists() {
        return Ok(0);
    }

    Ok(std::fs::read_dir(dir)?.count())
}

#[tokio::test]
async fn absent_content_is_fully_fetched() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;

    let report = sync.fetch(FetchOptions::default()).await?;

    assert_eq!(report.strategy, Strategy::FullFetch);
    assert_eq!(report.revision.as_deref(), Some("rev1"));
    assert_eq!(report.metrics.files_processed, 3);
    assert_eq!(read(&project, "src/content/one.md")?, "one");
    assert_eq!(read(&project, "src/content/two.md")?, "two");
    assert_eq!(read(&project, "src/content/nested/three.md")?, "three");
    assert!(read(&project, ".gitignore")?.contains("/src/content\n"));

    // Temporary clone is gone, and nothing needed backing up.
    let tmp = project.path().join(".content-mirror/tmp");
    assert!(!tmp.exists() || std::fs::read_dir(&tmp)?.next().is_none());
    assert!(!project.path().join(".content-mirror/backup").exists());

    Ok(())
}

#[tokio::test]
async fn unchanged_upstream_is_skipped() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;

    let first = sync.fetch(FetchOptions::default()).await?;
    let second = sync.fetch(FetchOptions::default()).await?;

    assert_eq!(second.strategy, Strategy::Skip);
    assert_eq!(second.outcome, None);
    assert_eq!(second.metrics.cache_hits, first.metrics.cache_hits + 1);
    assert_eq!(second.metrics.files_processed, first.metrics.files_processed);
    assert_eq!(remote.clones(), 1);

    Ok(())
}

#[tokio::test]
async fn skip_survives_a_new_orchestrator() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    orchestrator(&project, CONFIG, &remote)
        .await?
        .fetch(FetchOptions::default())
        .await?;

    let mut again = orchestrator(&project, CONFIG, &remote).await?;
    let report = again.fetch(FetchOptions::default()).await?;

    assert_eq!(report.strategy, Strategy::Skip);
    assert_eq!(report.metrics.files_processed, 0);

    Ok(())
}

#[tokio::test]
async fn upstream_change_is_safely_updated() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;
    sync.fetch(FetchOptions::default()).await?;

    std::fs::write(project.path().join("src/content/mine.md"), "local note")?;
    std::fs::write(project.path().join("src/other.md"), "untouched")?;
    remote.set_revision("rev2");
    remote.set_file("content/two.md", "two, revised");

    let report = sync.fetch(FetchOptions::default()).await?;

    assert_eq!(report.strategy, Strategy::SafeUpdate);
    assert_eq!(report.revision.as_deref(), Some("rev2"));
    assert_eq!(read(&project, "src/content/two.md")?, "two, revised");
    assert_eq!(read(&project, "src/content/mine.md")?, "local note");
    assert_eq!(read(&project, "src/other.md")?, "untouched");
    assert!(!project.path().join(".content-mirror/backup").exists());

    let status = sync.status().await;
    assert_eq!(status.strategy, Strategy::Skip);
    assert_eq!(status.assessment.cached_revision.as_deref(), Some("rev2"));

    Ok(())
}

#[tokio::test]
async fn empty_destination_is_partial_even_when_forced() -> Result<()> {
    let project = tempdir()?;
    std::fs::create_dir_all(project.path().join("src/content"))?;
    let remote = remote();
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;

    let report = sync.fetch(FetchOptions { force: true }).await?;

    assert_eq!(report.strategy, Strategy::SafeUpdate);
    assert_eq!(read(&project, "src/content/one.md")?, "one");

    Ok(())
}

#[tokio::test]
async fn forced_fetch_replaces_complete_content() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;
    sync.fetch(FetchOptions::default()).await?;
    std::fs::write(project.path().join("src/content/stray.md"), "stray")?;

    let report = sync.fetch(FetchOptions { force: true }).await?;

    assert_eq!(report.strategy, Strategy::FullFetch);
    assert!(!project.path().join("src/content/stray.md").exists());
    assert_eq!(read(&project, "src/content/one.md")?, "one");

    Ok(())
}

#[tokio::test]
async fn invalid_url_fails_before_temp_dir_exists() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let config = CONFIG.replace("https://github.com/org/content.git", "not-a-url");

    let result = orchestrator(&project, &config, &remote).await;

    let error = result.err().map(|err| err.downcast::<SyncError>());
    assert!(matches!(
        error,
        Some(Ok(SyncError::Config(ConfigError::InvalidRepositoryUrl(_))))
    ));
    assert!(!project.path().join(".content-mirror/tmp").exists());
    assert_eq!(remote.clones(), 0);

    Ok(())
}

#[tokio::test]
async fn unreachable_remote_restores_backup() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;
    sync.fetch(FetchOptions::default()).await?;
    remote.set_reachable(false);

    let result = sync.fetch(FetchOptions { force: true }).await;

    assert!(matches!(result, Err(SyncError::Repository(_))));
    assert_eq!(read(&project, "src/content/one.md")?, "one");
    assert_eq!(read(&project, "src/content/nested/three.md")?, "three");
    assert_eq!(leftover_backups(&project)?, 0);

    Ok(())
}

#[tokio::test]
async fn project_root_destination_never_reaches_disk() -> Result<()> {
    let project = tempdir()?;
    std::fs::create_dir_all(project.path().join("src"))?;
    std::fs::write(project.path().join("src/app.js"), "app")?;
    std::fs::write(project.path().join("package.json"), "{}")?;
    let remote = remote().with_file("shared/x.md", "x");
    let config = indoc! {r#"
        repo_url = "https://github.com/org/content.git"

        [mapping]
        shared = { source = "shared", destination = "." }
    "#};

    let result = orchestrator(&project, config, &remote).await;

    let error = result.err().map(|err| err.downcast::<SyncError>());
    assert!(matches!(
        error,
        Some(Ok(SyncError::Config(ConfigError::Mapping(MappingError::Invalid { .. }))))
    ));
    assert_eq!(read(&project, "src/app.js")?, "app");
    assert_eq!(read(&project, "package.json")?, "{}");

    Ok(())
}

#[tokio::test]
async fn destination_holding_working_dirs_is_rejected() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let config = CONFIG.replace(r#"destination = "src/content""#, r#"destination = ".content-mirror""#);

    let result = orchestrator(&project, &config, &remote).await;

    let error = result.err().map(|err| err.downcast::<SyncError>());
    assert!(matches!(
        error,
        Some(Ok(SyncError::Config(ConfigError::ReservedDestination { .. })))
    ));

    Ok(())
}

#[tokio::test]
async fn ignore_file_failure_keeps_installed_update() -> Result<()> {
    let project = tempdir()?;
    let remote = remote();
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;
    sync.fetch(FetchOptions::default()).await?;
    std::fs::remove_file(project.path().join(".gitignore"))?;
    std::fs::create_dir(project.path().join(".gitignore"))?;
    remote.set_revision("rev2");
    remote.set_file("content/one.md", "one, revised");

    let result = sync.fetch(FetchOptions { force: true }).await;

    assert!(matches!(result, Err(SyncError::IgnoreFile(_))));
    assert_eq!(read(&project, "src/content/one.md")?, "one, revised");
    assert_eq!(leftover_backups(&project)?, 0);
    let status = sync.status().await;
    assert_eq!(status.assessment.cached_revision.as_deref(), Some("rev2"));

    Ok(())
}

#[tokio::test]
async fn partial_failure_follows_policy() -> Result<()> {
    let two_mappings = indoc! {r#"
        repo_url = "https://github.com/org/content.git"
        max_retries = 1
        retry_delay_ms = 1
        on_partial_failure = "POLICY"

        [mapping]
        content = { source = "content", destination = "src/content" }
        ghost = { source = "ghost", destination = "src/ghost" }
    "#};
    let remote = remote();

    let project = tempdir()?;
    let config = two_mappings.replace("POLICY", "warn");
    let mut sync = orchestrator(&project, &config, &remote).await?;
    let report = sync.fetch(FetchOptions::default()).await?;
    let outcome = report.outcome.as_ref().map(|outcome| outcome.errors.len());
    assert_eq!(outcome, Some(1));
    assert_eq!(read(&project, "src/content/one.md")?, "one");

    let project = tempdir()?;
    let config = two_mappings.replace("POLICY", "fail");
    let mut sync = orchestrator(&project, &config, &remote).await?;
    let result = sync.fetch(FetchOptions::default()).await;
    assert!(matches!(
        result,
        Err(SyncError::PartialFailure { failed: 1, total: 2 })
    ));

    Ok(())
}

#[tokio::test]
async fn every_mapping_failing_fails_the_run() -> Result<()> {
    let project = tempdir()?;
    let remote = FakeRemote::new("rev1");
    let mut sync = orchestrator(&project, CONFIG, &remote).await?;

    let result = sync.fetch(FetchOptions::default()).await;

    assert!(matches!(result, Err(SyncError::InstallFailed { failed: 1, .. })));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn executor_overlaps_waiting_work() {
    let items: Vec<u32> = (1..=20).collect();
    let opts = RunOptions {
        concurrency: 4,
        batch_size: 20,
        retry: RetryPolicy::once(),
        ..Default::default()
    };

    let outcome = ConcurrencyExecutor::new()
        .run(
            &items,
            |item, _| {
                let item = *item;
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, std::io::Error>(item)
                }
            },
            &opts,
        )
        .await;

    assert_eq!(outcome.results.len(), 20);
    assert_eq!(outcome.duration, Duration::from_millis(50));
}
