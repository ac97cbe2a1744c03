// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File tree helpers.
//!
//! Walking, copying, and removing file trees. Walks never apply ignore
//! rules of their own and always skip `.git` directories, so a temporary
//! clone looks exactly like the content it carries.

use ignore::WalkBuilder;
use std::{
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

/// List every file under root, relative to root, in sorted order.
///
/// A root that is itself a file yields one empty relative path.
///
/// # Errors
///
/// - Return [`std::io::Error`] if any part of the tree cannot be read.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, IoError> {
    if root.is_file() {
        return Ok(vec![PathBuf::new()]);
    }

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|err| match err.into_io_error() {
            Some(err) => err,
            None => IoError::other(format!("cannot walk {}", root.display())),
        })?;

        if entry.file_type().is_some_and(|kind| kind.is_file()) {
            let relative = entry
                .path()
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .map_err(IoError::other)?;
            files.push(relative);
        }
    }

    files.sort();
    Ok(files)
}

/// Join relative path produced by [`list_files`] onto its root.
///
/// The empty relative path of a file root resolves to the root itself.
pub fn join(root: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Walk tree on the blocking pool.
pub async fn list_files_async(root: PathBuf) -> Result<Vec<PathBuf>, IoError> {
    tokio::task::spawn_blocking(move || list_files(&root))
        .await
        .map_err(IoError::other)?
}

/// Copy one file, creating parent directories as needed.
pub async fn copy_file(source: &Path, destination: &Path) -> Result<u64, IoError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    fs::copy(source, destination).await
}

/// Check if path exists and carries content.
///
/// Directories need at least one entry. Files only need to exist.
pub async fn has_content(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => match fs::read_dir(path).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
            Err(_) => false,
        },
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Remove file or directory tree. Missing paths are not an error.
pub async fn remove_path(path: &Path) -> Result<(), IoError> {
    let result = match fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => {
            debug!("removed {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
