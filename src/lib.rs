// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror content out of a remote Git repository into a local project.
//!
//! A project declares which parts of a remote repository it wants through
//! __mappings__ in its `content-mirror.toml`. Each run shallow-clones only
//! those parts, and copies them into the project where the mappings say.
//! Runs are cheap when nothing changed: the remote's current revision is
//! compared against the one last installed, and a fresh, complete project
//! is left alone.
//!
//! The entry point is [`SyncOrchestrator`].

pub mod backup;
pub mod cache;
pub mod config;
pub mod executor;
pub mod hooks;
pub mod ignore_file;
pub mod install;
pub mod layout;
pub mod mapping;
pub mod path;
pub mod repository;
pub mod retry;
pub mod state;
pub mod sync;
pub mod tree;
pub mod watch;

#[doc(inline)]
pub use cache::CacheStore;

#[doc(inline)]
pub use config::{Config, CONFIG_FILE_NAME};

#[doc(inline)]
pub use repository::{GitClient, RepositoryClient};

#[doc(inline)]
pub use state::{Existence, Strategy};

#[doc(inline)]
pub use sync::{FetchOptions, FetchReport, SyncError, SyncOrchestrator};

#[doc(inline)]
pub use watch::{ApplyMode, Watcher};
