// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backups taken before destructive replaces.
//!
//! A full fetch deletes every mapped destination before reinstalling it. The
//! old content is copied aside first, keeping its project-relative layout,
//! so a failed run can put it back. Backup and restore are best-effort:
//! a file that cannot be copied is logged and skipped, and the rest carry on.

use crate::{cache::now_millis, tree};

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Backup taken by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Directory holding backed up content.
    pub dir: PathBuf,

    /// Project-relative paths that were backed up.
    pub entries: Vec<PathBuf>,
}

impl Backup {
    /// Check if anything was backed up.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a restore.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
    /// Files put back into the project.
    pub files: usize,

    /// Files, or whole backups, that could not be put back.
    pub failed: usize,
}

impl Restored {
    /// Check if every backed up file made it back.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Copy destinations aside and back again.
#[derive(Debug, Clone)]
pub struct BackupManager {
    project_root: PathBuf,
}

impl BackupManager {
    /// Construct new backup manager for project root.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Copy every existing destination into a fresh directory under
    /// backup root.
    ///
    /// Destinations are project-relative. Missing ones are skipped, and no
    /// directory is created when nothing exists to back up.
    ///
    /// # Errors
    ///
    /// - Return [`BackupError::CreateDir`] if backup directory cannot be
    ///   created.
    #[instrument(skip(self, destinations), level = "debug")]
    pub async fn backup(&self, destinations: &[PathBuf], backup_root: &Path) -> Result<Backup> {
        let dir = backup_root.join(format!("backup-{}", now_millis()));
        let mut entries = Vec::new();

        for destination in destinations {
            let source = self.project_root.join(destination);
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                debug!("nothing to back up at {}", source.display());
                continue;
            }

            if entries.is_empty() {
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|err| BackupError::CreateDir {
                        source: err,
                        path: dir.clone(),
                    })?;
            }

            copy_best_effort(&source, &dir.join(destination)).await;
            entries.push(destination.clone());
        }

        if !entries.is_empty() {
            info!("backed up {} destination(s) to {}", entries.len(), dir.display());
        }

        Ok(Backup { dir, entries })
    }

    /// Copy everything under backup directory back over project root.
    #[instrument(skip(self), level = "debug")]
    pub async fn restore(&self, backup_dir: &Path) -> Restored {
        let mut restored = Restored::default();
        let files = match tree::list_files_async(backup_dir.to_path_buf()).await {
            Ok(files) => files,
            Err(err) => {
                warn!("cannot read backup at {}: {err}", backup_dir.display());
                restored.failed += 1;
                return restored;
            }
        };

        for relative in files {
            let from = backup_dir.join(&relative);
            let to = self.project_root.join(&relative);
            match tree::copy_file(&from, &to).await {
                Ok(_) => restored.files += 1,
                Err(err) => {
                    warn!("cannot restore {}: {err}", to.display());
                    restored.failed += 1;
                }
            }
        }

        info!("restored {} file(s) from {}", restored.files, backup_dir.display());
        restored
    }

    /// Remove backup after a successful run.
    pub async fn discard(&self, backup: Backup) {
        if backup.is_empty() {
            return;
        }

        if let Err(err) = tree::remove_path(&backup.dir).await {
            warn!("cannot remove backup at {}: {err}", backup.dir.display());
        }
    }
}

async fn copy_best_effort(source: &Path, destination: &Path) {
    let files = match tree::list_files_async(source.to_path_buf()).await {
        Ok(files) => files,
        Err(err) => {
            warn!("cannot back up {}: {err}", source.display());
            return;
        }
    };

    for relative in files {
        let from = tree::join(source, &relative);
        let to = tree::join(destination, &relative);
        if let Err(err) = tree::copy_file(&from, &to).await {
            warn!("cannot back up {}: {err}", from.display());
        }
    }
}

/// Backup error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Backup directory cannot be created.
    #[error("failed to create backup directory at {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = BackupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn backup_then_restore_round_trips_layout() -> anyhow::Result<()> {
        let project = tempdir()?;
        let backups = tempdir()?;
        std::fs::create_dir_all(project.path().join("src/content/blog"))?;
        std::fs::write(project.path().join("src/content/blog/post.md"), "post")?;
        std::fs::write(project.path().join("README.md"), "readme")?;
        let manager = BackupManager::new(project.path());

        let backup = manager
            .backup(
                &[
                    PathBuf::from("src/content/blog"),
                    PathBuf::from("README.md"),
                    PathBuf::from("missing"),
                ],
                backups.path(),
            )
            .await?;
        assert_eq!(
            backup.entries,
            vec![PathBuf::from("src/content/blog"), PathBuf::from("README.md")]
        );
        assert!(backup.dir.join("src/content/blog/post.md").exists());

        std::fs::remove_dir_all(project.path().join("src"))?;
        std::fs::write(project.path().join("README.md"), "clobbered")?;

        assert_eq!(
            manager.restore(&backup.dir).await,
            Restored { files: 2, failed: 0 }
        );
        assert_eq!(
            std::fs::read_to_string(project.path().join("src/content/blog/post.md"))?,
            "post"
        );
        assert_eq!(std::fs::read_to_string(project.path().join("README.md"))?, "readme");

        let dir = backup.dir.clone();
        manager.discard(backup).await;
        assert!(!dir.exists());

        Ok(())
    }

    #[tokio::test]
    async fn nothing_to_back_up_creates_nothing() -> anyhow::Result<()> {
        let project = tempdir()?;
        let backups = tempdir()?;
        let manager = BackupManager::new(project.path());

        let backup = manager
            .backup(&[PathBuf::from("docs")], &backups.path().join("root"))
            .await?;

        assert!(backup.is_empty());
        assert!(!backups.path().join("root").exists());

        Ok(())
    }

    #[tokio::test]
    async fn restoring_missing_backup_restores_nothing() -> anyhow::Result<()> {
        let project = tempdir()?;
        let manager = BackupManager::new(project.path());

        let restored = manager.restore(&project.path().join("nope")).await;
        assert_eq!(restored.files, 0);
        assert!(!restored.is_complete());

        Ok(())
    }
}
