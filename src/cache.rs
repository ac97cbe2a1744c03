// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Two-tier, TTL-bound cache.
//!
//! Cached values live in a small in-memory tier backed by a persistent tier
//! of JSON records on disk. Every value belongs to a __namespace__, and the
//! persistent tier stores each namespace in its own directory:
//!
//! ```text
//! <cache_dir>/<namespace>/<digest>.json
//! ```
//!
//! Each record has the layout `{ "data", "timestamp", "ttl", "size",
//! "metadata" }`, with the timestamp and TTL in milliseconds. A record is
//! valid while `now - timestamp < ttl`. Expired records are treated as absent
//! and physically removed when encountered.
//!
//! # Failure Policy
//!
//! Caching only ever saves work. Any I/O error or timeout on the persistent
//! tier is logged and treated as a miss for that call. Callers never see
//! cache failures.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Namespace holding remote revision records.
pub const REPOSITORY_NAMESPACE: &str = "git-repos";

/// Namespace holding per-mapping content digests.
pub const DIGEST_NAMESPACE: &str = "file-hashes";

/// Lifetime of a cached remote revision.
pub const REPOSITORY_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Lifetime of a cached content digest.
pub const DIGEST_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MEMORY_ENTRIES: usize = 100;
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
const KEY_HEX_LEN: usize = 16;

/// One cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cached value.
    pub data: Value,

    /// Creation time in milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub created_at: u64,

    /// Lifetime in milliseconds.
    pub ttl: u64,

    /// Approximate size of the serialized value in bytes.
    pub size: u64,

    /// Free-form bookkeeping about the entry.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CacheEntry {
    fn new(data: Value, ttl: Duration, metadata: Map<String, Value>) -> Self {
        let size = data.to_string().len() as u64;
        Self {
            data,
            created_at: now_millis(),
            ttl: ttl.as_millis().min(u128::from(u64::MAX)) as u64,
            size,
            metadata,
        }
    }

    /// Check if entry is still valid at `now` (milliseconds since epoch).
    pub fn is_valid_at(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) < self.ttl
    }
}

/// Last known remote revision of a repository branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub commit_hash: String,
    pub branch: String,
    pub timestamp: u64,
}

/// Digest of a mapping's content at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub hash: String,
    pub timestamp: u64,
}

/// Hit and miss counters of a cache store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Namespaced two-tier cache.
#[derive(Debug)]
pub struct CacheStore {
    root: Option<PathBuf>,
    memory: Mutex<HashMap<(String, String), CacheEntry>>,
    max_memory_entries: usize,
    default_ttl: Duration,
    io_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    /// Open cache store rooted at target directory.
    ///
    /// Creates the cache directory if it does not exist yet.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::CreateDir`] if cache directory cannot be
    ///   created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        mkdirp::mkdirp(&root).map_err(|err| CacheError::CreateDir {
            source: err,
            path: root.clone(),
        })?;

        Ok(Self::with_root(Some(root)))
    }

    /// Cache store that stores nothing and always misses.
    pub fn disabled() -> Self {
        Self {
            max_memory_entries: 0,
            ..Self::with_root(None)
        }
    }

    fn with_root(root: Option<PathBuf>) -> Self {
        Self {
            root,
            memory: Mutex::new(HashMap::new()),
            max_memory_entries: DEFAULT_MEMORY_ENTRIES,
            default_ttl: DEFAULT_TTL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cap number of entries held in the memory tier.
    pub fn with_memory_limit(mut self, entries: usize) -> Self {
        self.max_memory_entries = entries;
        self
    }

    /// Bound every persistent tier I/O call by target duration.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Check if store persists anything at all.
    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Directory of persistent tier, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Derive deterministic content-addressed key for any serializable input.
    ///
    /// The key is the namespace followed by a truncated SHA-256 digest of the
    /// JSON form of the input.
    pub fn key<T>(input: &T, namespace: &str) -> String
    where
        T: Serialize + ?Sized,
    {
        let serialized = serde_json::to_vec(input).unwrap_or_default();
        format!("{namespace}:{}", truncated_digest(&serialized))
    }

    /// Look up cached value.
    ///
    /// Checks the memory tier first, then the persistent tier. Persistent hits
    /// are promoted into memory while the memory tier has room.
    #[instrument(skip(self), level = "debug")]
    pub async fn get<T>(&self, key: &str, namespace: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let found = self.lookup(key, namespace).await;
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };

        let entry = found?;
        match serde_json::from_value(entry.data) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("cache entry {namespace}/{key} has unexpected shape: {err}");
                None
            }
        }
    }

    async fn lookup(&self, key: &str, namespace: &str) -> Option<CacheEntry> {
        let id = (namespace.to_owned(), key.to_owned());
        let now = now_millis();

        let memory_hit = self.lock_memory().get(&id).cloned();
        if let Some(entry) = memory_hit {
            if entry.is_valid_at(now) {
                debug!("memory cache hit for {namespace}/{key}");
                return Some(entry);
            }

            self.lock_memory().remove(&id);
            self.remove_record(key, namespace).await;
            return None;
        }

        let path = self.record_path(key, namespace)?;
        let entry = self.read_record(&path).await?;
        if !entry.is_valid_at(now) {
            debug!("cache entry {namespace}/{key} expired");
            self.remove_file(&path).await;
            return None;
        }

        debug!("persistent cache hit for {namespace}/{key}");
        let mut memory = self.lock_memory();
        if memory.len() < self.max_memory_entries {
            memory.insert(id, entry.clone());
        }

        Some(entry)
    }

    /// Store value under key in both tiers.
    ///
    /// Uses the store's default TTL when none is given.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn set<T>(&self, key: &str, value: &T, namespace: &str, ttl: Option<Duration>)
    where
        T: Serialize + ?Sized,
    {
        if !self.is_enabled() {
            return;
        }

        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(err) => {
                warn!("cannot serialize cache value for {namespace}/{key}: {err}");
                return;
            }
        };

        let mut metadata = Map::new();
        metadata.insert("key".into(), Value::String(key.to_owned()));
        let entry = CacheEntry::new(data, ttl.unwrap_or(self.default_ttl), metadata);

        {
            let mut memory = self.lock_memory();
            let id = (namespace.to_owned(), key.to_owned());
            if memory.len() < self.max_memory_entries || memory.contains_key(&id) {
                memory.insert(id, entry.clone());
            }
        }

        if let Some(path) = self.record_path(key, namespace) {
            self.write_record(&path, &entry).await;
        }
    }

    /// Remove key from both tiers.
    pub async fn delete(&self, key: &str, namespace: &str) {
        self.lock_memory()
            .remove(&(namespace.to_owned(), key.to_owned()));
        self.remove_record(key, namespace).await;
    }

    /// Clear one namespace, or everything when no namespace is given.
    #[instrument(skip(self), level = "debug")]
    pub async fn clear(&self, namespace: Option<&str>) {
        match namespace {
            Some(namespace) => self.lock_memory().retain(|(ns, _), _| ns != namespace),
            None => self.lock_memory().clear(),
        }

        let Some(root) = &self.root else {
            return;
        };

        let targets = match namespace {
            Some(namespace) => vec![root.join(namespace)],
            None => self.namespace_dirs(root).await,
        };

        for dir in targets {
            match self.bounded(fs::remove_dir_all(&dir)).await {
                Some(Ok(())) => debug!("cleared cache namespace at {}", dir.display()),
                Some(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
                Some(Err(err)) => warn!("cannot clear cache at {}: {err}", dir.display()),
                None => {}
            }
        }
    }

    /// Remove every expired entry from both tiers.
    ///
    /// Records that cannot be parsed are removed as well. Returns the number
    /// of distinct entries removed.
    #[instrument(skip(self), level = "debug")]
    pub async fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut removed = HashSet::new();

        self.lock_memory().retain(|id, entry| {
            let keep = entry.is_valid_at(now);
            if !keep {
                removed.insert(id.clone());
            }
            keep
        });

        if let Some(root) = self.root.clone() {
            for dir in self.namespace_dirs(&root).await {
                let namespace = dir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();

                for path in self.record_files(&dir).await {
                    let keep = match self.read_record(&path).await {
                        Some(entry) if entry.is_valid_at(now) => true,
                        Some(entry) => {
                            let key = entry
                                .metadata
                                .get("key")
                                .and_then(Value::as_str)
                                .map(str::to_owned)
                                .unwrap_or_else(|| path.display().to_string());
                            removed.insert((namespace.clone(), key));
                            false
                        }
                        None => {
                            removed.insert((namespace.clone(), path.display().to_string()));
                            false
                        }
                    };

                    if !keep {
                        self.remove_file(&path).await;
                    }
                }
            }
        }

        debug!("swept {} expired cache entries", removed.len());
        removed.len()
    }

    /// Record remote revision of repository branch.
    pub async fn cache_repository_info(&self, url: &str, branch: &str, commit_hash: &str) {
        let info = RepositoryInfo {
            commit_hash: commit_hash.to_owned(),
            branch: branch.to_owned(),
            timestamp: now_millis(),
        };
        self.set(
            &repository_key(url, branch),
            &info,
            REPOSITORY_NAMESPACE,
            Some(REPOSITORY_TTL),
        )
        .await;
    }

    /// Last recorded remote revision of repository branch.
    pub async fn cached_repository_info(&self, url: &str, branch: &str) -> Option<RepositoryInfo> {
        self.get(&repository_key(url, branch), REPOSITORY_NAMESPACE)
            .await
    }

    /// Forget recorded remote revision of repository branch.
    pub async fn forget_repository_info(&self, url: &str, branch: &str) {
        self.delete(&repository_key(url, branch), REPOSITORY_NAMESPACE)
            .await;
    }

    /// Record content digest for a mapping.
    pub async fn cache_file_digest(&self, key: &str, hash: &str) {
        let digest = FileDigest {
            hash: hash.to_owned(),
            timestamp: now_millis(),
        };
        self.set(key, &digest, DIGEST_NAMESPACE, Some(DIGEST_TTL))
            .await;
    }

    /// Last recorded content digest for a mapping.
    pub async fn cached_file_digest(&self, key: &str) -> Option<FileDigest> {
        self.get(key, DIGEST_NAMESPACE).await
    }

    /// Current hit and miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), CacheEntry>> {
        // INVARIANT: The guard is never held across an await point, so a
        //   poisoned lock can only come from a panic mid-update of a plain map.
        self.memory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_path(&self, key: &str, namespace: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        Some(
            root.join(namespace)
                .join(format!("{}.json", truncated_digest(key.as_bytes()))),
        )
    }

    async fn bounded<T>(&self, operation: impl Future<Output = T>) -> Option<T> {
        match tokio::time::timeout(self.io_timeout, operation).await {
            Ok(output) => Some(output),
            Err(_) => {
                warn!("cache I/O timed out after {:?}", self.io_timeout);
                None
            }
        }
    }

    async fn read_record(&self, path: &Path) -> Option<CacheEntry> {
        let content = match self.bounded(fs::read(path)).await? {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("cannot read cache record {}: {err}", path.display());
                return None;
            }
        };

        match serde_json::from_slice(&content) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("corrupt cache record {}: {err}", path.display());
                None
            }
        }
    }

    async fn write_record(&self, path: &Path, entry: &CacheEntry) {
        let content = match serde_json::to_vec_pretty(entry) {
            Ok(content) => content,
            Err(err) => {
                warn!("cannot serialize cache record {}: {err}", path.display());
                return;
            }
        };

        let write = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(path, content).await
        };

        if let Some(Err(err)) = self.bounded(write).await {
            warn!("cannot write cache record {}: {err}", path.display());
        }
    }

    async fn remove_record(&self, key: &str, namespace: &str) {
        if let Some(path) = self.record_path(key, namespace) {
            self.remove_file(&path).await;
        }
    }

    async fn remove_file(&self, path: &Path) {
        match self.bounded(fs::remove_file(path)).await {
            Some(Err(err)) if err.kind() != std::io::ErrorKind::NotFound => {
                warn!("cannot remove cache record {}: {err}", path.display());
            }
            _ => {}
        }
    }

    async fn namespace_dirs(&self, root: &Path) -> Vec<PathBuf> {
        self.list_dir(root, |path| path.is_dir()).await
    }

    async fn record_files(&self, dir: &Path) -> Vec<PathBuf> {
        self.list_dir(dir, |path| {
            path.extension().is_some_and(|ext| ext == "json")
        })
        .await
    }

    async fn list_dir(&self, dir: &Path, keep: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
        let listing = async {
            let mut paths = Vec::new();
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if keep(&path) {
                    paths.push(path);
                }
            }
            Ok::<_, std::io::Error>(paths)
        };

        match self.bounded(listing).await {
            Some(Ok(paths)) => paths,
            Some(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Some(Err(err)) => {
                warn!("cannot list cache directory {}: {err}", dir.display());
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

fn repository_key(url: &str, branch: &str) -> String {
    format!("{url}#{branch}")
}

fn truncated_digest(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    digest[..KEY_HEX_LEN].to_owned()
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Cache store error types.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Cache directory cannot be created.
    #[error("failed to create cache directory at {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn key_is_deterministic_and_namespaced() {
        let first = CacheStore::key(&("https://host/org/repo.git", "main"), "git-repos");
        let second = CacheStore::key(&("https://host/org/repo.git", "main"), "git-repos");
        let other = CacheStore::key(&("https://host/org/repo.git", "dev"), "git-repos");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.starts_with("git-repos:"));
        assert_eq!(first.len(), "git-repos:".len() + 16);
        assert!(first["git-repos:".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn value_round_trips_through_persistent_tier() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store.set("answer", &42u32, "numbers", None).await;

        // A fresh store only sees the persistent tier.
        let reopened = CacheStore::open(dir.path())?;
        let value: Option<u32> = reopened.get("answer", "numbers").await;
        assert_eq!(value, Some(42));
        assert_eq!(reopened.stats(), CacheStats { hits: 1, misses: 0 });

        Ok(())
    }

    #[tokio::test]
    async fn persistent_record_uses_documented_layout() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store
            .set("k", &"value", "layout", Some(Duration::from_secs(60)))
            .await;

        let namespace_dir = dir.path().join("layout");
        let mut entries = std::fs::read_dir(&namespace_dir)?;
        let record = entries.next().expect("one record")?.path();
        let json: Value = serde_json::from_slice(&std::fs::read(record)?)?;

        assert_eq!(json["data"], Value::String("value".into()));
        assert_eq!(json["ttl"], Value::from(60_000u64));
        assert!(json["timestamp"].as_u64().is_some());
        assert!(json["size"].as_u64().is_some());
        assert!(json["metadata"].is_object());

        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_are_absent_and_removed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store
            .set("short", &"lived", "ttl", Some(Duration::from_millis(30)))
            .await;
        store
            .set("long", &"lived", "ttl", Some(Duration::from_secs(3600)))
            .await;

        let before: Option<String> = store.get("short", "ttl").await;
        assert_eq!(before.as_deref(), Some("lived"));

        tokio::time::sleep(Duration::from_millis(60)).await;

        let after: Option<String> = store.get("short", "ttl").await;
        assert_eq!(after, None);
        let records = std::fs::read_dir(dir.path().join("ttl"))?.count();
        assert_eq!(records, 1);

        let survivor: Option<String> = store.get("long", "ttl").await;
        assert_eq!(survivor.as_deref(), Some("lived"));

        Ok(())
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store.set("a", &1, "sweep", Some(Duration::ZERO)).await;
        store.set("b", &2, "sweep", Some(Duration::ZERO)).await;
        store.set("c", &3, "sweep", Some(Duration::from_secs(60))).await;

        assert_eq!(store.sweep_expired().await, 2);
        let kept: Option<i32> = store.get("c", "sweep").await;
        assert_eq!(kept, Some(3));
        assert_eq!(std::fs::read_dir(dir.path().join("sweep"))?.count(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn clear_targets_single_namespace() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store.set("x", &1, "one", None).await;
        store.set("x", &2, "two", None).await;

        store.clear(Some("one")).await;
        let one: Option<i32> = store.get("x", "one").await;
        let two: Option<i32> = store.get("x", "two").await;
        assert_eq!(one, None);
        assert_eq!(two, Some(2));

        store.clear(None).await;
        let two: Option<i32> = store.get("x", "two").await;
        assert_eq!(two, None);

        Ok(())
    }

    #[tokio::test]
    async fn promotion_respects_memory_cap() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let writer = CacheStore::open(dir.path())?;
        writer.set("a", &1, "cap", None).await;
        writer.set("b", &2, "cap", None).await;

        let reader = CacheStore::open(dir.path())?.with_memory_limit(1);
        let _: Option<i32> = reader.get("a", "cap").await;
        let _: Option<i32> = reader.get("b", "cap").await;
        assert_eq!(reader.lock_memory().len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn unreadable_record_degrades_to_miss() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store.set("bad", &1, "corrupt", None).await;
        let path = store.record_path("bad", "corrupt").expect("enabled store");
        std::fs::write(&path, b"{ not json")?;

        let reader = CacheStore::open(dir.path())?;
        let value: Option<i32> = reader.get("bad", "corrupt").await;
        assert_eq!(value, None);
        assert_eq!(reader.stats().misses, 1);

        Ok(())
    }

    #[tokio::test]
    async fn disabled_store_always_misses() {
        let store = CacheStore::disabled();
        store.set("k", &1, "ns", None).await;
        let value: Option<i32> = store.get("k", "ns").await;
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn repository_info_helpers_use_their_namespace() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = CacheStore::open(dir.path())?;
        store
            .cache_repository_info("https://host/org/repo.git", "main", "abc123")
            .await;
        store.cache_file_digest("docs", "sha256:feed").await;

        let info = store
            .cached_repository_info("https://host/org/repo.git", "main")
            .await
            .expect("cached info");
        assert_eq!(info.commit_hash, "abc123");
        assert_eq!(info.branch, "main");
        assert!(dir.path().join(REPOSITORY_NAMESPACE).is_dir());

        let digest = store.cached_file_digest("docs").await.expect("cached digest");
        assert_eq!(digest.hash, "sha256:feed");
        assert!(dir.path().join(DIGEST_NAMESPACE).is_dir());

        store
            .forget_repository_info("https://host/org/repo.git", "main")
            .await;
        assert_eq!(
            store
                .cached_repository_info("https://host/org/repo.git", "main")
                .await,
            None
        );

        Ok(())
    }
}
