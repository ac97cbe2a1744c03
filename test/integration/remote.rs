// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use anyhow::Result;
use content_mirror::{
    repository::RepositoryError, retry::RetryPolicy, GitClient, RepositoryClient,
};
use pretty_assertions::assert_eq;
use std::{net::TcpListener, path::Path, time::Duration};
use tempfile::tempdir;

fn client() -> GitClient {
    GitClient::new(RetryPolicy::new(2, Duration::from_millis(1)))
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[tokio::test]
async fn remote_revision_tracks_branch_tip() -> Result<()> {
    let dir = tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.stage_and_commit("content/a.md", "alpha")?;
    let tip = fixture.stage_and_commit("content/b.md", "beta")?;
    let url = dir.path().to_string_lossy().into_owned();

    let revision = client().remote_revision(&url, "main").await?;
    assert_eq!(revision, tip);

    Ok(())
}

#[tokio::test]
async fn unknown_branch_is_not_retried() -> Result<()> {
    let dir = tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.stage_and_commit("README.md", "readme")?;
    let url = dir.path().to_string_lossy().into_owned();

    let result = client().remote_revision(&url, "does-not-exist").await;
    assert!(matches!(result, Err(RepositoryError::UnknownBranch { .. })));

    Ok(())
}

#[tokio::test]
async fn missing_remote_fails_after_retries() -> Result<()> {
    let dir = tempdir()?;
    let url = dir.path().join("nowhere").to_string_lossy().into_owned();

    let result = client().remote_revision(&url, "main").await;
    assert!(matches!(
        result,
        Err(RepositoryError::OperationFailed { attempts: 2, .. })
    ));

    Ok(())
}

#[tokio::test]
async fn sparse_clone_checks_out_only_patterns() -> Result<()> {
    let remote = tempdir()?;
    let fixture = RepoFixture::new(remote.path())?;
    fixture.stage_and_commit("content/a.md", "alpha")?;
    let tip = fixture.stage_and_commit("other/b.md", "beta")?;
    let work = tempdir()?;
    let dest = work.path().join("clone");
    let client = client();

    client
        .clone_sparse(&file_url(remote.path()), "main", &dest, &["/content/".into()])
        .await?;

    assert_eq!(std::fs::read_to_string(dest.join("content/a.md"))?, "alpha");
    assert!(!dest.join("other").exists());
    assert_eq!(client.checkout_revision(&dest).await?, tip);

    Ok(())
}

#[tokio::test]
async fn sparse_clone_matching_nothing_fails() -> Result<()> {
    let remote = tempdir()?;
    let fixture = RepoFixture::new(remote.path())?;
    fixture.stage_and_commit("content/a.md", "alpha")?;
    let work = tempdir()?;
    let dest = work.path().join("clone");

    let result = client()
        .clone_sparse(&file_url(remote.path()), "main", &dest, &["/missing/".into()])
        .await;

    // Second attempt must clear the first attempt's clone, or git would
    // refuse the non-empty destination instead.
    match result {
        Err(RepositoryError::OperationFailed {
            attempts: 2,
            source,
            ..
        }) => assert!(matches!(*source, RepositoryError::CloneFailed { .. })),
        other => panic!("unexpected result: {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn sparse_clone_of_unknown_branch_fails() -> Result<()> {
    let remote = tempdir()?;
    let fixture = RepoFixture::new(remote.path())?;
    fixture.stage_and_commit("content/a.md", "alpha")?;
    let work = tempdir()?;

    let result = client()
        .clone_sparse(
            &file_url(remote.path()),
            "does-not-exist",
            &work.path().join("clone"),
            &["/content/".into()],
        )
        .await;

    match result {
        Err(RepositoryError::OperationFailed { source, .. }) => {
            assert!(matches!(*source, RepositoryError::Syscall { .. }))
        }
        other => panic!("unexpected result: {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn unresponsive_remote_times_out() -> Result<()> {
    // Accepted by the kernel, never answered.
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("git://{}/org/repo.git", listener.local_addr()?);
    let client = client().with_timeouts(Duration::from_millis(100), Duration::from_secs(60));
    let started = std::time::Instant::now();

    let result = client.remote_revision(&url, "main").await;
    let elapsed = started.elapsed();

    // Resets the pending connection, which lets the abandoned query return.
    drop(listener);

    match result {
        Err(RepositoryError::OperationFailed {
            attempts: 2,
            source,
            ..
        }) => assert!(matches!(*source, RepositoryError::Timeout { .. })),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(elapsed < Duration::from_secs(5));

    Ok(())
}
