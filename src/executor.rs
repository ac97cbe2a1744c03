// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded-parallelism batch runner.
//!
//! Items are split into fixed-size batches that run one after another.
//! Items inside a batch run concurrently, but never more than the configured
//! number at once: every worker holds a semaphore permit for as long as it
//! runs. Workers are polled on the calling task, so nothing is spawned and
//! nothing outlives [`ConcurrencyExecutor::run`].
//!
//! A failing item never aborts its siblings. Each item is retried on its own,
//! and items that still fail are collected into [`BatchOutcome::errors`].
//!
//! Progress is pull-based. Callers that want it take a receiver from
//! [`ConcurrencyExecutor::progress`] and read [`Progress`] events at their
//! own pace. Exactly one event is sent after each batch completes.

use crate::{cache::CacheStore, mapping::ContentMapping, retry::RetryPolicy};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::{future::Future, time::Duration};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};
use tracing::{debug, instrument, warn};

/// Work item that can be identified for result caching.
pub trait WorkItem: Serialize {
    /// Stable identity of item, if it has one.
    ///
    /// Items without identity are keyed by a digest of their serialized form.
    fn identity(&self) -> Option<String> {
        None
    }
}

impl WorkItem for String {
    fn identity(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl WorkItem for &str {
    fn identity(&self) -> Option<String> {
        Some((*self).to_owned())
    }
}

impl WorkItem for std::path::PathBuf {
    fn identity(&self) -> Option<String> {
        Some(self.to_string_lossy().into_owned())
    }
}

impl WorkItem for ContentMapping {
    fn identity(&self) -> Option<String> {
        Some(self.key.clone())
    }
}

macro_rules! structural_work_item {
    ($($kind:ty),*) => {
        $(impl WorkItem for $kind {})*
    };
}

structural_work_item!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// Knobs of a single run.
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    /// Most workers in flight at once.
    pub concurrency: usize,

    /// Items per batch.
    pub batch_size: usize,

    /// Retry discipline of each item.
    pub retry: RetryPolicy,

    /// Store for caching worker results.
    pub cache: Option<&'a CacheStore>,

    /// Namespace of cached worker results.
    pub cache_namespace: String,
}

impl Default for RunOptions<'_> {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 10,
            retry: RetryPolicy::default(),
            cache: None,
            cache_namespace: "executor".into(),
        }
    }
}

/// Snapshot of run progress, sent after each batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub percentage: f64,
    pub errors: usize,
}

/// Successful item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome<R> {
    /// Position of item in input.
    pub index: usize,

    /// Worker result.
    pub value: R,

    /// Result came out of the cache instead of the worker.
    pub cached: bool,
}

/// Item that failed every attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("item {index} failed: {message}")]
pub struct ItemFailure {
    /// Position of item in input.
    pub index: usize,

    /// Rendered error of last attempt.
    pub message: String,
}

/// Aggregated result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome<R> {
    /// Successful items, ordered by input position.
    pub results: Vec<ItemOutcome<R>>,

    /// Failed items, ordered by input position.
    pub errors: Vec<ItemFailure>,

    /// Share of items that succeeded, 1.0 for empty input.
    pub success_rate: f64,

    /// Wall time of the run.
    pub duration: Duration,
}

impl<R> BatchOutcome<R> {
    /// Check if every item succeeded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of items that came out of the cache.
    pub fn cached_count(&self) -> usize {
        self.results.iter().filter(|item| item.cached).count()
    }
}

/// Bounded-parallelism batch runner.
#[derive(Debug, Default, Clone)]
pub struct ConcurrencyExecutor {
    progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl ConcurrencyExecutor {
    /// Construct new executor without progress reporting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start reporting progress, returning the receiving end.
    ///
    /// Replaces any earlier progress channel.
    pub fn progress(&mut self) -> mpsc::UnboundedReceiver<Progress> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.progress = Some(sender);
        receiver
    }

    /// Run worker over every item.
    ///
    /// Never fails as a whole. Items that fail every attempt end up in
    /// [`BatchOutcome::errors`].
    #[instrument(skip_all, fields(items = items.len()), level = "debug")]
    pub async fn run<T, R, E, F, Fut>(
        &self,
        items: &[T],
        worker: F,
        opts: &RunOptions<'_>,
    ) -> BatchOutcome<R>
    where
        T: WorkItem,
        R: Serialize + DeserializeOwned,
        E: std::fmt::Display,
        F: Fn(&T, usize) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let started = Instant::now();
        let total = items.len();
        let batch_size = opts.batch_size.max(1);
        let semaphore = Semaphore::new(opts.concurrency.max(1));
        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::new();
        let mut processed = 0;

        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            let offset = batch_index * batch_size;
            let mut in_flight: FuturesUnordered<_> = batch
                .iter()
                .enumerate()
                .map(|(position, item)| {
                    run_item(item, offset + position, &worker, &semaphore, opts)
                })
                .collect();

            while let Some(outcome) = in_flight.next().await {
                match outcome {
                    Ok(outcome) => results.push(outcome),
                    Err(failure) => {
                        warn!("{failure}");
                        errors.push(failure);
                    }
                }
            }

            processed += batch.len();
            self.report(Progress {
                processed,
                total,
                percentage: processed as f64 * 100.0 / total as f64,
                errors: errors.len(),
            });
        }

        results.sort_by_key(|outcome: &ItemOutcome<R>| outcome.index);
        errors.sort_by_key(|failure: &ItemFailure| failure.index);

        let success_rate = if total == 0 {
            1.0
        } else {
            results.len() as f64 / total as f64
        };

        let duration = started.elapsed();
        debug!(
            "ran {total} item(s) in {duration:?}, {} failed",
            errors.len()
        );

        BatchOutcome {
            results,
            errors,
            success_rate,
            duration,
        }
    }

    fn report(&self, progress: Progress) {
        if let Some(sender) = &self.progress {
            // INVARIANT: A dropped receiver just means nobody is listening.
            let _ = sender.send(progress);
        }
    }
}

async fn run_item<T, R, E, F, Fut>(
    item: &T,
    index: usize,
    worker: &F,
    semaphore: &Semaphore,
    opts: &RunOptions<'_>,
) -> Result<ItemOutcome<R>, ItemFailure>
where
    T: WorkItem,
    R: Serialize + DeserializeOwned,
    E: std::fmt::Display,
    F: Fn(&T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    // INVARIANT: Permit is released on drop, whatever the outcome.
    let _permit = semaphore.acquire().await.map_err(|err| ItemFailure {
        index,
        message: err.to_string(),
    })?;

    let cache_key = opts
        .cache
        .map(|_| cache_key(item, &opts.cache_namespace));

    if let (Some(cache), Some(key)) = (opts.cache, &cache_key) {
        if let Some(value) = cache.get::<R>(key, &opts.cache_namespace).await {
            debug!("item {index} served from cache");
            return Ok(ItemOutcome {
                index,
                value,
                cached: true,
            });
        }
    }

    let value = opts
        .retry
        .retry(format!("item {index}"), |_| worker(item, index))
        .await
        .map_err(|err| ItemFailure {
            index,
            message: err.last_error().to_string(),
        })?;

    if let (Some(cache), Some(key)) = (opts.cache, &cache_key) {
        cache.set(key, &value, &opts.cache_namespace, None).await;
    }

    Ok(ItemOutcome {
        index,
        value,
        cached: false,
    })
}

fn cache_key<T: WorkItem>(item: &T, namespace: &str) -> String {
    match item.identity() {
        Some(identity) => format!("{namespace}:{identity}"),
        None => CacheStore::key(item, namespace),
    }
}
