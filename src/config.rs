// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the `content-mirror.toml` file to simplify the
//! process of serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! # General Layout
//!
//! ```toml
//! repo_url = "https://github.com/org/content.git"
//! branch = "main"
//! layout = "astro"
//!
//! [mapping]
//! docs = "docs"
//! readme = { kind = "file", source = "README.md", destination = "README.md" }
//! ```
//!
//! Every other setting has a default. Directory settings go through shell
//! expansion, so `$HOME` and `~` work as expected.

use crate::{
    layout::ProjectLayout,
    mapping::{normalize_all, ContentMapping, MappingDecl, MappingError},
    repository::validate_url,
    retry::RetryPolicy,
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Component, Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Default name of configuration file inside a project.
pub const CONFIG_FILE_NAME: &str = "content-mirror.toml";

/// Top-level configuration.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Remote repository to mirror content from.
    pub repo_url: String,

    /// Branch to track.
    pub branch: String,

    /// Directory used for temporary clones.
    pub temp_dir: PathBuf,

    /// Directory holding backups taken before destructive replaces.
    pub backup_dir: PathBuf,

    /// Directory of persistent cache tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Destination conventions of consuming project.
    pub layout: ProjectLayout,

    /// Attempts made for each remote operation.
    pub max_retries: u32,

    /// Base delay between attempts in milliseconds.
    pub retry_delay_ms: u64,

    /// Seconds a single revision query may take.
    pub remote_timeout_secs: u64,

    /// Seconds a single clone step may take.
    pub clone_timeout_secs: u64,

    /// Mappings installed simultaneously.
    pub concurrent_operations: usize,

    /// File extensions installed by folder mappings. Empty allows all.
    pub allowed_extensions: Vec<String>,

    /// Largest file installed by folder mappings.
    pub max_file_size_bytes: u64,

    /// What a run does when only some mappings install.
    pub on_partial_failure: PartialFailurePolicy,

    /// Keep declared destinations listed in the project's `.gitignore`.
    pub manage_gitignore: bool,

    /// Seconds between upstream checks in watch mode.
    pub watch_interval_secs: u64,

    /// Content mappings keyed by label.
    #[serde(rename = "mapping")]
    pub content_mapping: BTreeMap<String, MappingDecl>,
}

impl Config {
    /// Retry policy of remote operations and installation items.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }

    /// Bound of a single revision query.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs.max(1))
    }

    /// Bound of a single clone step.
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs.max(1))
    }

    /// Polling interval of watch mode.
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    /// Directory of persistent cache tier for given project.
    pub fn cache_dir_for(&self, project_root: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => project_root.join(dir),
            None => project_root.join(".content-mirror").join("cache"),
        }
    }

    /// Check configuration, producing normalized mappings.
    ///
    /// Same as [`Config::validate_within`], except that absolute directory
    /// settings are assumed to live outside the project.
    ///
    /// # Errors
    ///
    /// - Return any error of [`Config::validate_within`].
    pub fn validate(&self) -> Result<Vec<ContentMapping>> {
        self.validate_within(Path::new(""))
    }

    /// Check configuration for project root, producing normalized mappings.
    ///
    /// No destination may equal or contain one of the working directories
    /// of content-mirror, because full fetches delete destinations
    /// wholesale.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidRepositoryUrl`] if repository URL is
    ///   neither SSH nor HTTPS style.
    /// - Return [`ConfigError::EmptyBranch`] if branch is blank.
    /// - Return [`ConfigError::Mapping`] if any mapping is unusable.
    /// - Return [`ConfigError::ReservedDestination`] if a destination
    ///   overlaps the temporary, backup, or cache directory.
    pub fn validate_within(&self, project_root: &Path) -> Result<Vec<ContentMapping>> {
        if !validate_url(&self.repo_url) {
            return Err(ConfigError::InvalidRepositoryUrl(self.repo_url.clone()));
        }

        if self.branch.trim().is_empty() {
            return Err(ConfigError::EmptyBranch);
        }

        let transform = self.layout.transform();
        let mappings = normalize_all(&self.content_mapping, transform)?;

        let cache_dir = self.cache_dir_for(Path::new(""));
        let reserved = [
            ("temp_dir", self.temp_dir.as_path()),
            ("backup_dir", self.backup_dir.as_path()),
            ("cache_dir", cache_dir.as_path()),
        ];
        for (setting, dir) in reserved {
            let Some(dir) = project_relative(project_root, dir) else {
                continue;
            };

            for mapping in &mappings {
                let destination = transform.transform(&mapping.destination);
                let inside = !dir.as_os_str().is_empty() && destination.starts_with(&dir);
                if dir.starts_with(&destination) || inside {
                    return Err(ConfigError::ReservedDestination {
                        key: mapping.key.clone(),
                        destination,
                        setting,
                    });
                }
            }
        }

        Ok(mappings)
    }
}

/// Directory setting relative to project root, if it lives inside it.
fn project_relative(project_root: &Path, dir: &Path) -> Option<PathBuf> {
    let dir = if dir.is_absolute() {
        if !project_root.is_absolute() {
            return None;
        }
        dir.strip_prefix(project_root).ok()?
    } else {
        dir
    };

    let mut relative = PathBuf::new();
    for component in dir.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    Some(relative)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            branch: "main".into(),
            temp_dir: PathBuf::from(".content-mirror/tmp"),
            backup_dir: PathBuf::from(".content-mirror/backup"),
            cache_dir: None,
            layout: ProjectLayout::default(),
            max_retries: 3,
            retry_delay_ms: 1000,
            remote_timeout_secs: 60,
            clone_timeout_secs: 300,
            concurrent_operations: 5,
            allowed_extensions: Vec::new(),
            max_file_size_bytes: 10 * 1024 * 1024,
            on_partial_failure: PartialFailurePolicy::default(),
            manage_gitignore: true,
            watch_interval_secs: 300,
            content_mapping: BTreeMap::new(),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every directory setting.
        config.temp_dir = expand(&config.temp_dir)?;
        config.backup_dir = expand(&config.backup_dir)?;
        config.cache_dir = config.cache_dir.as_deref().map(expand).transpose()?;

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Outcome of a run in which some mappings failed to install.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialFailurePolicy {
    /// Report success, logging a warning about failed mappings.
    #[default]
    Warn,

    /// Fail the run, restoring any backup taken.
    Fail,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Repository URL is neither SSH nor HTTPS style.
    #[error("invalid repository url {0:?}, expected user@host:org/repo.git or https://host/org/repo.git")]
    InvalidRepositoryUrl(String),

    /// Branch setting is blank.
    #[error("branch must not be empty")]
    EmptyBranch,

    /// Mapping destination overlaps a working directory.
    #[error("mapping {key:?} destination {:?} overlaps {setting}", destination.display())]
    ReservedDestination {
        key: String,
        destination: PathBuf,
        setting: &'static str,
    },

    /// Mapping declarations are unusable.
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
