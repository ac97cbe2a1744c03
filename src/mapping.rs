// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Content mapping declarations.
//!
//! A __mapping__ associates a path inside the remote repository with a path
//! inside the local project. Mappings are declared in the `[mapping]` table
//! of the configuration file in one of two forms:
//!
//! ```toml
//! [mapping]
//! docs = "docs"
//! blog = { source = "content/blog", destination = "src/content/blog" }
//! assets = { kind = "selective", source = "assets", destination = "public", files = ["logo.svg"] }
//! ```
//!
//! The string shorthand is a folder mapping whose source and destination are
//! the same path. The table form defaults its kind to a folder, and its
//! destination to its source.

use crate::layout::PathTransform;

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Component, Path, PathBuf},
    str::FromStr,
};

/// Mapping as written in the configuration file.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MappingDecl {
    /// Folder mapping with identical source and destination.
    Shorthand(String),

    /// Fully spelled out mapping.
    Detailed(MappingSpec),
}

/// Table form of a mapping declaration.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct MappingSpec {
    /// Kind of installation to perform, defaults to "folder".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Path inside remote repository.
    pub source: String,

    /// Path inside local project, defaults to source path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// Files to pick out of source directory for selective mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

/// Installation strategy of a mapping.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingKind {
    /// Copy whole directory tree.
    #[default]
    Folder,

    /// Copy named files out of a directory.
    Selective,

    /// Copy one file.
    File,
}

impl FromStr for MappingKind {
    type Err = MappingError;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "folder" => Ok(Self::Folder),
            "selective" => Ok(Self::Selective),
            "file" => Ok(Self::File),
            _ => Err(MappingError::UnknownMappingType(kind.to_owned())),
        }
    }
}

impl Display for MappingKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Folder => "folder",
            Self::Selective => "selective",
            Self::File => "file",
        })
    }
}

/// Normalized unit of content to sync.
///
/// # Invariant
///
/// - Source and destination are relative and never climb out of their roots.
/// - Selective mappings always list at least one file.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ContentMapping {
    pub key: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: MappingKind,
    pub files: Vec<String>,
}

impl ContentMapping {
    /// Normalize a mapping declaration.
    ///
    /// # Errors
    ///
    /// - Return [`MappingError::UnknownMappingType`] if the declared kind is
    ///   not recognized.
    /// - Return [`MappingError::Invalid`] if paths are unusable, or a
    ///   selective mapping lists no files.
    pub fn normalize(key: impl Into<String>, decl: &MappingDecl) -> Result<Self> {
        let key = key.into();
        let (kind, source, destination, files) = match decl {
            MappingDecl::Shorthand(path) => (MappingKind::Folder, path.clone(), path.clone(), Vec::new()),
            MappingDecl::Detailed(spec) => {
                let kind = match &spec.kind {
                    Some(kind) => kind.parse()?,
                    None => MappingKind::default(),
                };
                let destination = spec.destination.clone().unwrap_or_else(|| spec.source.clone());
                (kind, spec.source.clone(), destination, spec.files.clone().unwrap_or_default())
            }
        };

        let source = checked_relative(&key, "source", &source)?;
        let destination = checked_relative(&key, "destination", &destination)?;

        if kind == MappingKind::Selective && files.is_empty() {
            return Err(MappingError::Invalid {
                key,
                reason: "selective mapping must list at least one file".into(),
            });
        }

        for file in &files {
            checked_relative(&key, "file", file)?;
        }

        Ok(Self {
            key,
            source,
            destination,
            kind,
            files,
        })
    }

    /// Sparse checkout patterns that cover this mapping's source content.
    pub fn sparse_patterns(&self) -> Vec<String> {
        let source = to_pattern_path(&self.source);
        match self.kind {
            MappingKind::Folder => vec![format!("/{source}/")],
            MappingKind::File => vec![format!("/{source}")],
            MappingKind::Selective => self
                .files
                .iter()
                .map(|file| format!("/{source}/{}", file.trim_start_matches('/')))
                .collect(),
        }
    }
}

/// Normalize every declaration and check the set as a whole.
///
/// Destinations are compared after going through the project's layout
/// transform, since that is where content actually lands. Mappings come back
/// sorted by key.
///
/// # Errors
///
/// - Return [`MappingError::DuplicateDestination`] if two mappings land in
///   the same place.
/// - Return [`MappingError::NestedDestination`] if one mapping lands inside
///   another.
/// - Return any error of [`ContentMapping::normalize`].
pub fn normalize_all(
    decls: &BTreeMap<String, MappingDecl>,
    transform: &dyn PathTransform,
) -> Result<Vec<ContentMapping>> {
    let mut claimed: Vec<(PathBuf, String)> = Vec::with_capacity(decls.len());
    let mut mappings = Vec::with_capacity(decls.len());

    for (key, decl) in decls {
        let mapping = ContentMapping::normalize(key, decl)?;
        let destination = transform.transform(&mapping.destination);

        for (other, first) in &claimed {
            if *other == destination {
                return Err(MappingError::DuplicateDestination {
                    first: first.clone(),
                    second: key.clone(),
                    destination,
                });
            }

            let (outer, inner) = if destination.starts_with(other) {
                (first, key)
            } else if other.starts_with(&destination) {
                (key, first)
            } else {
                continue;
            };

            return Err(MappingError::NestedDestination {
                outer: outer.clone(),
                inner: inner.clone(),
            });
        }

        claimed.push((destination, key.clone()));
        mappings.push(mapping);
    }

    Ok(mappings)
}

fn checked_relative(key: &str, field: &str, raw: &str) -> Result<PathBuf> {
    let trimmed = raw.trim().trim_start_matches("./");
    let path = Path::new(trimmed);
    let invalid = |reason: &str| MappingError::Invalid {
        key: key.to_owned(),
        reason: format!("{field} {raw:?} {reason}"),
    };

    if trimmed.is_empty() {
        return Err(invalid("is empty"));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("climbs out of its root")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("must be relative")),
        }
    }

    // INVARIANT: Never hand out the root itself, since destinations get
    //   deleted wholesale by full fetches.
    if normalized.as_os_str().is_empty() {
        return Err(invalid("points at its root"));
    }

    Ok(normalized)
}

fn to_pattern_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Mapping declaration error types.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// Mapping declares a kind that does not exist.
    #[error("unknown mapping type {0:?}")]
    UnknownMappingType(String),

    /// Mapping declaration cannot be used as written.
    #[error("invalid mapping {key:?}: {reason}")]
    Invalid { key: String, reason: String },

    /// Two mappings write into the same place.
    #[error("mappings {first:?} and {second:?} share destination {:?}", destination.display())]
    DuplicateDestination {
        first: String,
        second: String,
        destination: PathBuf,
    },

    /// One mapping writes inside the destination of another.
    #[error("mapping {inner:?} lands inside destination of mapping {outer:?}")]
    NestedDestination { outer: String, inner: String },
}

/// Friendly result alias :3
pub type Result<T, E = MappingError> = std::result::Result<T, E>;
