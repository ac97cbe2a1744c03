// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Destination path conventions of consuming projects.
//!
//! Different project scaffolds expect synced content in different places. A
//! static site generator may want everything under its content directory,
//! while a single-page app serves raw files out of its public directory. Each
//! supported layout implements [`PathTransform`], and the configured layout
//! is resolved once into a static transform.

use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

/// Map a declared destination to where the project actually wants it.
pub trait PathTransform: Debug + Send + Sync + 'static {
    /// Transform destination relative to the project root.
    fn transform(&self, destination: &Path) -> PathBuf;
}

/// Supported project layouts.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectLayout {
    /// Destinations are used as written.
    #[default]
    Plain,

    /// Astro projects keep collections under `src/content`.
    Astro,

    /// Hugo projects keep pages under `content`.
    Hugo,

    /// Vite single-page apps serve raw files out of `public`.
    Vite,
}

impl ProjectLayout {
    /// Resolve path transform of layout.
    pub fn transform(self) -> &'static dyn PathTransform {
        match self {
            Self::Plain => &Identity,
            Self::Astro => &Prefixed {
                prefix: "src/content",
                passthrough: &["src", "public"],
            },
            Self::Hugo => &Prefixed {
                prefix: "content",
                passthrough: &["content", "static", "assets"],
            },
            Self::Vite => &Prefixed {
                prefix: "public",
                passthrough: &["public", "src"],
            },
        }
    }
}

#[derive(Debug)]
struct Identity;

impl PathTransform for Identity {
    fn transform(&self, destination: &Path) -> PathBuf {
        destination.to_path_buf()
    }
}

/// Nest destinations under a prefix unless they already sit in one of the
/// layout's top-level directories.
#[derive(Debug)]
struct Prefixed {
    prefix: &'static str,
    passthrough: &'static [&'static str],
}

impl PathTransform for Prefixed {
    fn transform(&self, destination: &Path) -> PathBuf {
        let first = destination
            .components()
            .next()
            .map(|component| component.as_os_str().to_string_lossy().into_owned());

        match first {
            Some(first) if self.passthrough.contains(&first.as_str()) => destination.to_path_buf(),
            _ => Path::new(self.prefix).join(destination),
        }
    }
}
