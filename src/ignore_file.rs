// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Managed `.gitignore` block.
//!
//! Synced content belongs to the remote repository, not the project, so the
//! declared destinations are kept out of the project's history. They are
//! listed inside a block of the project's `.gitignore` that is fully owned
//! by content-mirror:
//!
//! ```text
//! # >>> content-mirror
//! /src/content/blog
//! /src/README.md
//! # <<< content-mirror
//! ```
//!
//! Lines outside the block belong to the user and are never touched.
//! Destinations that a user rule already ignores are left out of the block.

use ignore::gitignore::GitignoreBuilder;
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};
use tokio::fs;
use tracing::debug;

const BLOCK_START: &str = "# >>> content-mirror";
const BLOCK_END: &str = "# <<< content-mirror";

/// Manage block of ignore rules in a project's `.gitignore`.
#[derive(Clone, Debug)]
pub struct IgnoreFile {
    root: PathBuf,
    path: PathBuf,
}

impl IgnoreFile {
    /// Construct new ignore file manager for project root.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let root = project_root.into();
        let path = root.join(".gitignore");
        Self { root, path }
    }

    /// Path of managed `.gitignore`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Edit managed block.
    ///
    /// Read current file into [`IgnoreEdit`], and let the editor change the
    /// managed entries before writing the result back. The file is left
    /// untouched if nothing changed.
    ///
    /// # Errors
    ///
    /// - Return [`IgnoreFileError::Read`] if existing file cannot be read.
    /// - Return [`IgnoreFileError::Write`] if result cannot be written.
    pub async fn edit<E>(&self, editor: E) -> Result<bool>
    where
        E: FnOnce(&mut IgnoreEdit),
    {
        let mut edit = IgnoreEdit::from(self.read().await?.as_str());
        editor(&mut edit);

        if !edit.changed {
            return Ok(false);
        }

        fs::write(&self.path, edit.to_string().as_bytes())
            .await
            .map_err(|err| IgnoreFileError::Write {
                source: err,
                path: self.path.clone(),
            })?;

        Ok(true)
    }

    /// Make managed block list exactly the target project-relative paths.
    ///
    /// Paths already ignored by user rules are skipped. Returns whether the
    /// file changed.
    ///
    /// # Errors
    ///
    /// - Return [`IgnoreFileError::Pattern`] if a user rule cannot be parsed.
    /// - Return any error of [`IgnoreFile::edit`].
    pub async fn reconcile(
        &self,
        paths: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> Result<bool> {
        let current = IgnoreEdit::from(self.read().await?.as_str());

        let mut builder = GitignoreBuilder::new(&self.root);
        for line in current.user_lines() {
            builder.add_line(None, line)?;
        }
        let user_rules = builder.build()?;

        let mut entries = BTreeSet::new();
        for path in paths {
            let path = path.as_ref();
            let is_dir = fs::metadata(self.root.join(path))
                .await
                .is_ok_and(|metadata| metadata.is_dir());
            if user_rules
                .matched_path_or_any_parents(path, is_dir)
                .is_ignore()
            {
                debug!("{} already ignored by user rules", path.display());
                continue;
            }

            entries.insert(to_rule(path));
        }

        let changed = self.edit(|edit| edit.set_entries(entries)).await?;
        if changed {
            debug!("updated managed block of {}", self.path.display());
        }

        Ok(changed)
    }

    /// Current entries of managed block.
    ///
    /// # Errors
    ///
    /// - Return [`IgnoreFileError::Read`] if existing file cannot be read.
    pub async fn entries(&self) -> Result<Vec<String>> {
        Ok(IgnoreEdit::from(self.read().await?.as_str())
            .entries
            .into_iter()
            .collect())
    }

    async fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(IgnoreFileError::Read {
                source: err,
                path: self.path.clone(),
            }),
        }
    }
}

/// Render project-relative path as anchored ignore rule.
fn to_rule(path: &Path) -> String {
    let parts: Vec<_> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();

    format!("/{}", parts.join("/"))
}

/// Managed block editor.
///
/// # Invariant
///
/// - No duplicate entries.
/// - User lines before and after the block are preserved verbatim.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IgnoreEdit {
    before: Vec<String>,
    entries: BTreeSet<String>,
    after: Vec<String>,
    changed: bool,
}

impl IgnoreEdit {
    /// Replace every entry.
    pub fn set_entries(&mut self, entries: BTreeSet<String>) {
        if self.entries != entries {
            self.entries = entries;
            self.changed = true;
        }
    }

    /// Lines outside managed block.
    pub fn user_lines(&self) -> impl Iterator<Item = &str> {
        self.before
            .iter()
            .chain(self.after.iter())
            .map(String::as_str)
    }
}

impl Display for IgnoreEdit {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for line in &self.before {
            writeln!(fmt, "{line}")?;
        }

        if !self.entries.is_empty() {
            writeln!(fmt, "{BLOCK_START}")?;
            for entry in &self.entries {
                writeln!(fmt, "{entry}")?;
            }
            writeln!(fmt, "{BLOCK_END}")?;
        }

        for line in &self.after {
            writeln!(fmt, "{line}")?;
        }

        Ok(())
    }
}

impl From<&str> for IgnoreEdit {
    fn from(content: &str) -> Self {
        #[derive(Clone, Copy)]
        enum Section {
            Before,
            Block,
            After,
        }

        let mut edit = Self::default();
        let mut section = Section::Before;
        for line in content.lines() {
            match (section, line.trim()) {
                (Section::Before, BLOCK_START) => section = Section::Block,
                (Section::Block, BLOCK_END) => section = Section::After,
                (Section::Block, entry) if !entry.is_empty() => {
                    edit.entries.insert(entry.to_owned());
                }
                (Section::Block, _) => {}
                (Section::Before, _) => edit.before.push(line.to_owned()),
                (Section::After, _) => edit.after.push(line.to_owned()),
            }
        }

        edit
    }
}

/// Ignore file error types.
#[derive(Debug, thiserror::Error)]
pub enum IgnoreFileError {
    /// Ignore file cannot be read from.
    #[error("failed to read ignore file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Ignore file cannot be written to.
    #[error("failed to write ignore file at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// User rule cannot be parsed.
    #[error(transparent)]
    Pattern(#[from] ignore::Error),
}

/// Friendly result alias :3
pub type Result<T, E = IgnoreFileError> = std::result::Result<T, E>;
