// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote repository access.
//!
//! Content only ever needs a few subtrees of the remote repository, so
//! clones are shallow (depth 1), blob-filtered, and sparse. The working tree
//! of a clone is restricted to the sparsity patterns of the configured
//! mappings, and only the blobs inside those patterns are transferred.
//!
//! Revision queries never clone at all. They list the remote's references
//! through libgit2 and pick out the tracked branch, the same way
//! `git ls-remote` would.
//!
//! Every remote operation is bounded by a timeout and wrapped in a
//! [`RetryPolicy`], so transient network failures are absorbed without the
//! caller noticing. Clones run as child processes that are killed when their
//! timeout expires. A libgit2 revision query cannot be interrupted, so a
//! timed out query keeps its blocking thread until libgit2 gives up. Each
//! client runs at most one such query at a time.
//!
//! # See Also
//!
//! - [Man page sparse checkout](https://git-scm.com/docs/git-sparse-checkout)
//! - [Man page partial clone](https://git-scm.com/docs/partial-clone)

use crate::retry::{RetryError, RetryPolicy};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{Config, Direction, Remote, RemoteCallbacks, Repository};
use indicatif::ProgressBar;
use inquire::{Password, Text};
use regex::Regex;
use std::{
    ffi::{OsStr, OsString},
    future::Future,
    path::Path,
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio::{process::Command, sync::Semaphore};
use tracing::{debug, info, instrument};

static SSH_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[A-Za-z0-9._~-]+(/[A-Za-z0-9._~-]+)+\.git$")
        .expect("valid ssh url pattern")
});

static HTTPS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://[A-Za-z0-9.-]+(:[0-9]+)?(/[A-Za-z0-9._~-]+){2,}\.git$")
        .expect("valid https url pattern")
});

/// Check if URL is an SSH or HTTPS style repository address.
///
/// Accepts `user@host:org/repo.git` and `https://host/org/repo.git`. Anything
/// else is rejected before any network call is made.
pub fn validate_url(url: &str) -> bool {
    SSH_URL.is_match(url) || HTTPS_URL.is_match(url)
}

/// Layer of indirection for remote repository access.
pub trait RepositoryClient {
    /// Query current revision of branch without cloning.
    fn remote_revision(&self, url: &str, branch: &str) -> impl Future<Output = Result<String>>;

    /// Shallow, blob-filtered, sparse clone of branch restricted to patterns.
    fn clone_sparse(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        patterns: &[String],
    ) -> impl Future<Output = Result<()>>;

    /// Revision checked out in an existing clone.
    fn checkout_revision(&self, dest: &Path) -> impl Future<Output = Result<String>>;
}

/// Repository access through libgit2 and the Git binary.
#[derive(Debug, Clone)]
pub struct GitClient {
    retry: RetryPolicy,
    remote_timeout: Duration,
    clone_timeout: Duration,
    bar: ProgressBar,
    query_slot: Arc<Semaphore>,
}

impl GitClient {
    /// Construct new Git client.
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            remote_timeout: Duration::from_secs(60),
            clone_timeout: Duration::from_secs(300),
            bar: ProgressBar::hidden(),
            query_slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Show clone activity on target progress bar.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    /// Bound revision queries and clones by target durations.
    pub fn with_timeouts(mut self, remote: Duration, clone: Duration) -> Self {
        self.remote_timeout = remote;
        self.clone_timeout = clone;
        self
    }

    async fn list_remote_once(&self, url: &str, branch: &str) -> Result<String> {
        let url = url.to_owned();
        let branch = branch.to_owned();
        let prompter = ProgressPrompter::new(self.bar.clone());
        let slot = Arc::clone(&self.query_slot);

        // INVARIANT: The permit moves into the blocking task, so a query
        //   abandoned by its timeout still holds the slot until libgit2
        //   returns. Later attempts wait for it instead of piling up threads.
        let query = async move {
            let permit = slot.acquire_owned().await?;
            tokio::task::spawn_blocking(move || {
                let result = list_remote(&url, &branch, prompter);
                drop(permit);
                result
            })
            .await?
        };

        match tokio::time::timeout(self.remote_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(RepositoryError::Timeout {
                operation: "remote revision query".into(),
                after: self.remote_timeout,
            }),
        }
    }

    async fn clone_once(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        patterns: &[String],
    ) -> Result<()> {
        // INVARIANT: Git refuses to clone into a non-empty directory, so
        //   leftovers of a failed attempt must go first.
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dest).await?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let clone_args: Vec<OsString> = vec![
            "clone".into(),
            "--depth".into(),
            "1".into(),
            "--filter=blob:none".into(),
            "--sparse".into(),
            "--branch".into(),
            branch.into(),
            url.into(),
            dest.as_os_str().to_owned(),
        ];
        self.bounded("clone", syscall_non_interactive("git", clone_args))
            .await?;

        let mut sparse_args: Vec<OsString> = vec![
            "-C".into(),
            dest.as_os_str().to_owned(),
            "sparse-checkout".into(),
            "set".into(),
            "--no-cone".into(),
        ];
        sparse_args.extend(patterns.iter().map(OsString::from));
        self.bounded("sparse-checkout", syscall_non_interactive("git", sparse_args))
            .await?;

        if !is_populated(dest).await {
            return Err(RepositoryError::CloneFailed {
                url: url.to_owned(),
                reason: format!("{} is empty after clone", dest.display()),
            });
        }

        Ok(())
    }

    async fn bounded(
        &self,
        operation: &str,
        call: impl Future<Output = Result<String>>,
    ) -> Result<String> {
        match tokio::time::timeout(self.clone_timeout, call).await {
            Ok(output) => {
                let output = output?;
                if !output.is_empty() {
                    debug!("git {operation}: {output}");
                }
                Ok(output)
            }
            Err(_) => Err(RepositoryError::Timeout {
                operation: operation.into(),
                after: self.clone_timeout,
            }),
        }
    }
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RepositoryClient for GitClient {
    #[instrument(skip(self), level = "debug")]
    async fn remote_revision(&self, url: &str, branch: &str) -> Result<String> {
        let revision = self
            .retry
            .retry_if(
                format!("revision query of {url} ({branch})"),
                |_| self.list_remote_once(url, branch),
                RepositoryError::is_retryable,
            )
            .await?;

        debug!("remote {url} ({branch}) is at {revision}");
        Ok(revision)
    }

    #[instrument(skip(self, patterns), level = "debug")]
    async fn clone_sparse(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        patterns: &[String],
    ) -> Result<()> {
        info!("clone {url} ({branch}) into {}", dest.display());
        self.bar.set_message(format!("cloning {url}"));
        self.bar.enable_steady_tick(Duration::from_millis(100));

        let result = self
            .retry
            .retry_if(
                format!("sparse clone of {url} ({branch})"),
                |_| self.clone_once(url, branch, dest, patterns),
                RepositoryError::is_retryable,
            )
            .await;

        self.bar.finish_and_clear();
        Ok(result?)
    }

    async fn checkout_revision(&self, dest: &Path) -> Result<String> {
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let repository = Repository::open(&dest)?;
            let commit = repository.head()?.peel_to_commit()?;
            Ok(commit.id().to_string())
        })
        .await?
    }
}

fn list_remote(url: &str, branch: &str, prompter: ProgressPrompter) -> Result<String> {
    let authenticator = GitAuthenticator::default().set_prompter(prompter);
    let config = Config::open_default()?;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(authenticator.credentials(&config));

    let mut remote = Remote::create_detached(url)?;
    let connection = remote
        .connect_auth(Direction::Fetch, Some(callbacks), None)
        .map_err(|err| RepositoryError::Unreachable {
            url: url.to_owned(),
            source: err,
        })?;

    let wanted = if branch == "HEAD" {
        "HEAD".to_owned()
    } else {
        format!("refs/heads/{branch}")
    };

    let revision = connection
        .list()?
        .iter()
        .find(|head| head.name() == wanted)
        .map(|head| head.oid().to_string());

    revision.ok_or_else(|| RepositoryError::UnknownBranch {
        url: url.to_owned(),
        branch: branch.to_owned(),
    })
}

async fn is_populated(dest: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dest).await else {
        return false;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name() != ".git" {
            return true;
        }
    }

    false
}

async fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message);

    if !output.status.success() {
        return Err(RepositoryError::Syscall {
            command: cmd.as_ref().to_string_lossy().into_owned(),
            message,
        });
    }

    Ok(message)
}

/// Git2 authentication prompter for progress bar.
///
/// Suspends the progress bar while asking for credentials.
#[derive(Debug, Clone)]
pub struct ProgressPrompter {
    pub(crate) bar: ProgressBar,
}

impl ProgressPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for ProgressPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Remote repository error types.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Remote cannot be reached or refuses access.
    #[error("repository {url:?} is unreachable")]
    Unreachable {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Remote has no such branch.
    #[error("repository {url:?} has no branch {branch:?}")]
    UnknownBranch { url: String, branch: String },

    /// Clone finished without producing content.
    #[error("clone of {url:?} failed: {reason}")]
    CloneFailed { url: String, reason: String },

    /// Remote operation took too long.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Git binary reported failure.
    #[error("command {command:?} failed:\n{message}")]
    Syscall { command: String, message: String },

    /// Every attempt of a remote operation failed.
    #[error("{context} failed after {attempts} attempt(s)")]
    OperationFailed {
        context: String,
        attempts: u32,
        #[source]
        source: Box<RepositoryError>,
    },

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Local I/O fails.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Blocking task could not finish.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    /// Query slot of client was closed.
    #[error(transparent)]
    Acquire(#[from] tokio::sync::AcquireError),
}

impl RepositoryError {
    /// Check if retrying could make the error go away.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownBranch { .. })
    }
}

impl From<RetryError<RepositoryError>> for RepositoryError {
    fn from(error: RetryError<RepositoryError>) -> Self {
        match error {
            RetryError::OperationFailed {
                context,
                attempts,
                source,
            } => Self::OperationFailed {
                context,
                attempts,
                source: Box::new(source),
            },
            RetryError::Aborted { source, .. } => source,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case("git@github.com:org/repo.git"; "ssh")]
    #[test_case("deploy@git.example.org:team/sub/repo.git"; "ssh nested")]
    #[test_case("https://github.com/org/repo.git"; "https")]
    #[test_case("https://git.example.org:8443/team/repo.git"; "https with port")]
    #[test]
    fn accepts_supported_urls(url: &str) {
        assert!(validate_url(url));
    }

    #[test_case("not-a-url"; "plain word")]
    #[test_case("http://github.com/org/repo.git"; "plain http")]
    #[test_case("https://github.com/repo.git"; "missing org")]
    #[test_case("ftp://host/org/repo.git"; "ftp")]
    #[test_case("file:///tmp/org/repo.git"; "file")]
    #[test_case("git@github.com:org/repo"; "ssh without suffix")]
    #[test_case(""; "empty")]
    #[test]
    fn rejects_unsupported_urls(url: &str) {
        assert!(!validate_url(url));
    }

    #[test]
    fn exhausted_retries_keep_last_error() {
        let error: RepositoryError = RetryError::OperationFailed {
            context: "clone".into(),
            attempts: 3,
            source: RepositoryError::CloneFailed {
                url: "u".into(),
                reason: "empty".into(),
            },
        }
        .into();

        match error {
            RepositoryError::OperationFailed {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, RepositoryError::CloneFailed { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_branch_is_not_retried() {
        let error = RepositoryError::UnknownBranch {
            url: "u".into(),
            branch: "b".into(),
        };
        assert!(!error.is_retryable());
    }
}
