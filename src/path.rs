// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where a project lives, and where its cache goes when it has no
//! project of its own.

use crate::config::{Config, CONFIG_FILE_NAME};

use std::path::{Path, PathBuf};

/// Find closest directory at or above start that holds a configuration file.
///
/// Does not read the configuration file, only checks that it exists.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILE_NAME).is_file())
        .map(Path::to_path_buf)
}

/// Determine default absolute path to user-wide cache directory.
///
/// Uses XDG Base Directory path `$XDG_CACHE_HOME/content-mirror`. Does not
/// check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoCacheDir`] if cache directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn user_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|path| path.join("content-mirror"))
        .ok_or(NoCacheDir)
}

/// Determine cache directory of configuration.
///
/// Projects keep their cache inside themselves. Without a project, the
/// configured cache directory is used as is, falling back to the user-wide
/// cache directory.
///
/// # Errors
///
/// - Return [`NoCacheDir`] if no project root is known, no cache directory
///   is configured, and the user cache directory cannot be determined.
pub fn resolve_cache_dir(config: &Config, project_root: Option<&Path>) -> Result<PathBuf> {
    match (project_root, &config.cache_dir) {
        (Some(root), _) => Ok(config.cache_dir_for(root)),
        (None, Some(dir)) => Ok(dir.clone()),
        (None, None) => user_cache_dir(),
    }
}

/// No way to determine user's cache directory.
///
/// # See Also
///
/// - [`dirs::cache_dir`](https://docs.rs/dirs/latest/dirs/fn.cache_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's cache directory")]
pub struct NoCacheDir;

/// Friendly result alias :3
pub type Result<T, E = NoCacheDir> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn project_root_is_found_from_nested_dir() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "")?;
        std::fs::create_dir_all(dir.path().join("src/pages"))?;

        let found = find_project_root(&dir.path().join("src/pages"));
        assert_eq!(found.as_deref(), Some(dir.path()));

        Ok(())
    }

    #[test]
    fn project_cache_beats_configured_dir() {
        let config = Config {
            cache_dir: Some(PathBuf::from("cache")),
            ..Default::default()
        };

        assert_eq!(
            resolve_cache_dir(&config, Some(Path::new("/proj"))).ok(),
            Some(PathBuf::from("/proj/cache"))
        );
        assert_eq!(
            resolve_cache_dir(&config, None).ok(),
            Some(PathBuf::from("cache"))
        );
    }

    #[sealed_test(env = [("XDG_CACHE_HOME", "/var/cache/me")])]
    fn projectless_cache_falls_back_to_user_dir() {
        if cfg!(target_os = "linux") {
            assert_eq!(
                resolve_cache_dir(&Config::default(), None).ok(),
                Some(PathBuf::from("/var/cache/me/content-mirror"))
            );
        }
    }
}
