// src/cache.rs

//! Request cache: single-flight memoization keyed by [`Fingerprint`].
//!
//! The first request for a fingerprint runs the factory (which queues a task)
//! and stores the task handle. Every later request for the same fingerprint
//! gets that same handle back, whether the task is still pending or long
//! settled, so one fingerprint never has two renders in flight.
//!
//! Failure policy:
//! - [`FailurePolicy::Retain`] (default): engine refusals are cached and
//!   replayed to identical requests without touching the engine again.
//! - [`FailurePolicy::Evict`]: a failed entry is replaced by a fresh attempt
//!   on the next identical request.
//!
//! Failures that say nothing about the request (load, timeout, cancellation,
//! internal faults) are replaced under both policies. Only settled entries are
//! ever replaced.

use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{ErrorKind, RequestError};
use crate::options::Fingerprint;
use crate::queue::QueuedTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Retain,
    Evict,
}

impl FailurePolicy {
    fn replaces(self, error: &RequestError) -> bool {
        self == FailurePolicy::Evict || error.kind.is_transient()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered with an existing entry.
    pub hits: u64,
    /// Lookups that ran the factory.
    pub misses: u64,
    /// Misses that replaced a failed entry.
    pub replaced: u64,
}

/// Result of [`RequestCache::get_or_create`].
#[derive(Debug, Clone)]
pub struct Lookup {
    pub task: QueuedTask,
    /// `true` if the handle came from an existing entry.
    pub hit: bool,
}

pub struct RequestCache {
    entries: Mutex<HashMap<Fingerprint, QueuedTask>>,
    policy: FailurePolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    replaced: AtomicU64,
}

impl RequestCache {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Returns the entry for `fingerprint`, creating it with `factory` on a miss.
    ///
    /// The map stays locked while `factory` runs; that is what makes two racing
    /// misses impossible. `factory` must therefore not call back into this cache.
    pub fn get_or_create<F>(&self, fingerprint: &Fingerprint, factory: F) -> Lookup
    where
        F: FnOnce() -> QueuedTask,
    {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => {
                error!("RequestCache: map lock poisoned; rejecting {}", fingerprint);
                return Lookup {
                    task: QueuedTask::rejected(RequestError::new(
                        ErrorKind::Cache,
                        "request cache is poisoned",
                        fingerprint,
                    )),
                    hit: false,
                };
            }
        };

        let mut replacing = false;
        if let Some(existing) = entries.get(fingerprint) {
            match existing.promise.peek() {
                Some(Err(e)) if self.policy.replaces(e) => {
                    debug!("RequestCache: replacing failed entry {} ({})", fingerprint, e.kind);
                    replacing = true;
                }
                _ => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!("RequestCache: hit {}", fingerprint);
                    return Lookup {
                        task: existing.clone(),
                        hit: true,
                    };
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if replacing {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }
        let task = factory();
        trace!("RequestCache: miss {} -> task #{}", fingerprint, task.seq);
        entries.insert(fingerprint.clone(), task.clone());
        Lookup { task, hit: false }
    }

    /// State of the entry for `fingerprint`, if there is one.
    pub fn state(&self, fingerprint: &Fingerprint) -> Option<EntryState> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(fingerprint)?;
        Some(match entry.promise.peek() {
            None => EntryState::Pending,
            Some(Ok(_)) => EntryState::Resolved,
            Some(Err(_)) => EntryState::Rejected,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCache")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::options::{RenderOptions, RenderRequest};
    use std::cell::Cell;
    use std::sync::Arc;
    use std::thread;
    use test_log::test;

    fn fingerprint(code: &str) -> Fingerprint {
        RenderRequest::new("qrcode", code, RenderOptions::default()).fingerprint()
    }

    /// Stand-in for the queue: hands out pending tasks and counts calls.
    fn pending_task(fp: &Fingerprint, calls: &Cell<u32>) -> QueuedTask {
        calls.set(calls.get() + 1);
        QueuedTask::detached(fp, u64::from(calls.get()))
    }

    #[test]
    fn second_lookup_reuses_the_pending_entry() {
        let cache = RequestCache::new(FailurePolicy::Retain);
        let fp = fingerprint("HELLO");
        let calls = Cell::new(0);

        let first = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        let second = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        assert!(!first.hit);
        assert!(second.hit);
        assert!(first.task.promise.ptr_eq(&second.task.promise));
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.state(&fp), Some(EntryState::Pending));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, replaced: 0 });
    }

    #[test]
    fn render_errors_are_retained_by_default() {
        let cache = RequestCache::new(FailurePolicy::Retain);
        let fp = fingerprint("BAD");
        let calls = Cell::new(0);

        let first = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        first
            .task
            .promise
            .settle(Err(RequestError::render(RenderError::new("E", "bad"), &fp)));
        assert_eq!(cache.state(&fp), Some(EntryState::Rejected));

        let again = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        assert!(again.hit);
        assert_eq!(calls.get(), 1);
        assert_eq!(again.task.promise.wait(), first.task.promise.wait());
    }

    #[test]
    fn evict_policy_retries_failed_fingerprints() {
        let cache = RequestCache::new(FailurePolicy::Evict);
        let fp = fingerprint("BAD");
        let calls = Cell::new(0);

        let first = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        first
            .task
            .promise
            .settle(Err(RequestError::render(RenderError::new("E", "bad"), &fp)));

        let retry = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        assert!(!retry.hit);
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.state(&fp), Some(EntryState::Pending));
        assert_eq!(cache.stats().replaced, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn transient_failures_are_replaced_under_retain() {
        let cache = RequestCache::new(FailurePolicy::Retain);
        let fp = fingerprint("SLOW");
        let calls = Cell::new(0);

        let first = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        first.task.cancel();
        let retry = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        assert!(!retry.hit);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn resolved_entries_are_never_replaced() {
        let cache = RequestCache::new(FailurePolicy::Evict);
        let fp = fingerprint("OK");
        let calls = Cell::new(0);

        let first = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        let image = crate::adapter::EncodedImage {
            format: crate::adapter::ImageFormat::Png,
            width: 1,
            height: 1,
            bytes: vec![1, 2, 3],
        };
        first.task.promise.settle(Ok(Arc::new(image)));
        let again = cache.get_or_create(&fp, || pending_task(&fp, &calls));
        assert!(again.hit);
        assert_eq!(cache.state(&fp), Some(EntryState::Resolved));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn racing_misses_run_the_factory_once() {
        let cache = Arc::new(RequestCache::new(FailurePolicy::Retain));
        let fp = fingerprint("RACE");
        let factory_calls = Arc::new(AtomicU64::new(0));

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let fp = fp.clone();
                let factory_calls = factory_calls.clone();
                thread::spawn(move || {
                    cache
                        .get_or_create(&fp, || {
                            let seq = factory_calls.fetch_add(1, Ordering::SeqCst) + 1;
                            QueuedTask::detached(&fp, seq)
                        })
                        .task
                })
            })
            .collect();
        let tasks: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert!(tasks.iter().all(|t| t.promise.ptr_eq(&tasks[0].promise)));
    }
}
