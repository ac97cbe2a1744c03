// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local content classification.
//!
//! Before touching anything, a run needs two facts: whether the declared
//! destinations already hold content, and whether the revision they were
//! installed from is still the remote's current one. This module gathers
//! both into an [`Assessment`], and [`Strategy::choose`] turns that into the
//! strategy of the run.

use crate::{
    cache::CacheStore,
    layout::PathTransform,
    mapping::ContentMapping,
    repository::RepositoryClient,
    tree,
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// How much of the declared content exists locally.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Existence {
    /// Every destination exists and holds content.
    Complete,

    /// Some destinations are missing or empty.
    Partial,

    /// No destination exists at all.
    Absent,
}

impl Display for Existence {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Complete => fmt.write_str("complete"),
            Self::Partial => fmt.write_str("partial"),
            Self::Absent => fmt.write_str("absent"),
        }
    }
}

/// Everything a run branches on.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Assessment {
    pub existence: Existence,

    /// Revision recorded after the last successful run.
    pub cached_revision: Option<String>,

    /// Revision the remote currently points at, if the query succeeded.
    pub live_revision: Option<String>,

    /// Local content is out of sync with the remote.
    pub stale: bool,

    /// Remote revision query failed, so staleness is unknown.
    pub check_failed: bool,
}

/// Strategy of a run.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Strategy {
    /// Content is fresh and complete. Nothing is copied.
    Skip,

    /// Copy over existing content without deleting anything.
    SafeUpdate,

    /// Back up, remove, and reinstall every destination.
    FullFetch,
}

impl Strategy {
    /// Pick strategy from assessment.
    ///
    /// Forced runs only look at existence: partial content still takes the
    /// safe path, everything else is fetched in full. An ambiguous check
    /// without force also takes the safe path.
    pub fn choose(assessment: &Assessment, force: bool) -> Self {
        if assessment.existence == Existence::Partial {
            return Self::SafeUpdate;
        }

        if force {
            return Self::FullFetch;
        }

        if assessment.check_failed {
            return Self::SafeUpdate;
        }

        match assessment.existence {
            Existence::Complete if !assessment.stale => Self::Skip,
            Existence::Complete => Self::SafeUpdate,
            Existence::Absent if assessment.cached_revision.is_some() => Self::SafeUpdate,
            Existence::Absent | Existence::Partial => Self::FullFetch,
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Skip => fmt.write_str("skip"),
            Self::SafeUpdate => fmt.write_str("safe update"),
            Self::FullFetch => fmt.write_str("full fetch"),
        }
    }
}

/// Classify local content against the remote.
pub struct ContentStateClassifier<'a, R> {
    client: &'a R,
    cache: &'a CacheStore,
    project_root: &'a Path,
    transform: &'static dyn PathTransform,
}

impl<'a, R: RepositoryClient> ContentStateClassifier<'a, R> {
    /// Construct new classifier for project.
    pub fn new(
        client: &'a R,
        cache: &'a CacheStore,
        project_root: &'a Path,
        transform: &'static dyn PathTransform,
    ) -> Self {
        Self {
            client,
            cache,
            project_root,
            transform,
        }
    }

    /// Absolute destination of mapping inside project.
    pub fn destination(&self, mapping: &ContentMapping) -> PathBuf {
        self.project_root
            .join(self.transform.transform(&mapping.destination))
    }

    /// Check how much declared content exists locally.
    ///
    /// Directories need at least one entry and files only need to exist. A
    /// destination that exists but is empty makes the result partial. No
    /// mappings at all is complete.
    pub async fn classify_existence(&self, mappings: &[ContentMapping]) -> Existence {
        let mut present = 0;
        let mut filled = 0;

        for mapping in mappings {
            let destination = self.destination(mapping);
            if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
                present += 1;
                if tree::has_content(&destination).await {
                    filled += 1;
                }
            } else {
                debug!("destination {} is missing", destination.display());
            }
        }

        match (present, filled) {
            (_, filled) if filled == mappings.len() => Existence::Complete,
            (0, _) => Existence::Absent,
            _ => Existence::Partial,
        }
    }

    /// Check if local content is out of sync with remote branch.
    ///
    /// A failing revision query counts as stale.
    pub async fn is_stale(&self, url: &str, branch: &str, mappings: &[ContentMapping]) -> bool {
        self.assess(url, branch, mappings).await.stale
    }

    /// Gather existence and revision facts of project.
    #[instrument(skip(self, mappings), level = "debug")]
    pub async fn assess(&self, url: &str, branch: &str, mappings: &[ContentMapping]) -> Assessment {
        let existence = self.classify_existence(mappings).await;
        let cached_revision = self
            .cache
            .cached_repository_info(url, branch)
            .await
            .map(|info| info.commit_hash);

        let (live_revision, check_failed) = match self.client.remote_revision(url, branch).await {
            Ok(revision) => (Some(revision), false),
            Err(err) => {
                warn!("cannot check remote revision of {url} ({branch}): {err}");
                (None, true)
            }
        };

        let stale = existence != Existence::Complete
            || check_failed
            || cached_revision.is_none()
            || cached_revision != live_revision;

        debug!(
            "existence {existence}, cached {cached_revision:?}, live {live_revision:?}, stale {stale}"
        );

        Assessment {
            existence,
            cached_revision,
            live_revision,
            stale,
            check_failed,
        }
    }
}
