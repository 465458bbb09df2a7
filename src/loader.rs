// src/loader.rs

//! Dependency loader: brings the render engine up exactly once.
//!
//! State machine:
//!
//! ```text
//! Unloaded ──ensure_loaded()──► Loading(shared promise) ──ok──► Loaded(handle)
//!     ▲                                   │
//!     └────────────── any error ──────────┘
//! ```
//!
//! Resources are fetched strictly in order, each one completing before the next
//! starts, because later resources build on what earlier ones establish. All
//! callers that arrive while a load is running get the same promise. A failed
//! attempt leaves nothing behind; the next call starts over from scratch.
//!
//! Threading model:
//! - The load itself runs on a dedicated `loader` thread, so `ensure_loaded()`
//!   never blocks its caller.
//! - Once loaded, the handle lives in a `OnceCell` and is returned without
//!   taking any lock.

use anyhow::Context;
use log::*;
use once_cell::sync::OnceCell;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LockResult, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::RenderEngine;
use crate::error::{LoadError, ENGINE_STAGE};
use crate::promise::Promise;

/// Resource id reported when the loader thread itself could not be started.
const LOADER_STAGE: &str = "<loader>";

/// One fetched resource, in load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedResource {
    pub id: String,
    pub bytes: Vec<u8>,
}

/// Fetches engine resources by id.
pub trait ResourceSource: Send + Sync {
    fn fetch(&self, id: &str) -> Result<Vec<u8>, String>;
}

/// Reads resources from files under a root directory.
#[derive(Debug, Clone)]
pub struct FileSystemSource {
    root: PathBuf,
}

impl FileSystemSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceSource for FileSystemSource {
    fn fetch(&self, id: &str) -> Result<Vec<u8>, String> {
        let path = self.root.join(id);
        std::fs::read(&path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(|e| format!("{e:#}"))
    }
}

/// Turns the fully loaded resource set into an engine instance.
///
/// Fails when the resources loaded but do not provide a usable engine entry
/// point.
pub trait EngineFactory: Send + Sync {
    fn instantiate(&self, resources: &[LoadedResource]) -> Result<Box<dyn RenderEngine>, String>;
}

/// The loaded engine entry point. Shared by every caller for the rest of the
/// process lifetime.
pub struct EngineHandle {
    engine: Mutex<Box<dyn RenderEngine>>,
    resources: Vec<String>,
    load_time: Duration,
}

impl EngineHandle {
    /// Exclusive access to the engine. Only the render worker calls this.
    pub fn lock(&self) -> LockResult<MutexGuard<'_, Box<dyn RenderEngine>>> {
        self.engine.lock()
    }

    /// Resource ids the engine was built from, in load order.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("resources", &self.resources)
            .field("load_time", &self.load_time)
            .finish_non_exhaustive()
    }
}

pub type LoadOutcome = Result<Arc<EngineHandle>, LoadError>;

/// Observable loader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

pub struct Loader {
    resources: Vec<String>,
    source: Arc<dyn ResourceSource>,
    factory: Arc<dyn EngineFactory>,
    loaded: OnceCell<Arc<EngineHandle>>,
    /// The running attempt, if any. `None` with `loaded` empty means Unloaded.
    inflight: Mutex<Option<Promise<LoadOutcome>>>,
    attempts: AtomicU64,
}

impl Loader {
    pub fn new(
        resources: Vec<String>,
        source: Arc<dyn ResourceSource>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            resources,
            source,
            factory,
            loaded: OnceCell::new(),
            inflight: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    fn inflight(&self) -> MutexGuard<'_, Option<Promise<LoadOutcome>>> {
        // Only ever holds an Option<Promise>; there is no invariant a panic
        // could break halfway.
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LoadState {
        if self.loaded.get().is_some() {
            return LoadState::Loaded;
        }
        match *self.inflight() {
            Some(_) => LoadState::Loading,
            // `finish` publishes the handle before clearing the slot, so a
            // load that completed since the check above still reads Loaded.
            None if self.loaded.get().is_some() => LoadState::Loaded,
            None => LoadState::Unloaded,
        }
    }

    /// Number of load attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the engine handle, loading it first if needed.
    ///
    /// Concurrent callers during a load share one promise; after a successful
    /// load every call returns an already-settled promise.
    pub fn ensure_loaded(self: &Arc<Self>) -> Promise<LoadOutcome> {
        if let Some(handle) = self.loaded.get() {
            return Promise::resolved(Ok(Arc::clone(handle)));
        }

        let mut inflight = self.inflight();
        // A load may have finished while we waited for the lock.
        if let Some(handle) = self.loaded.get() {
            return Promise::resolved(Ok(Arc::clone(handle)));
        }
        if let Some(pending) = inflight.as_ref() {
            trace!("Loader: joining load already in flight");
            return pending.clone();
        }

        let promise = Promise::new();
        *inflight = Some(promise.clone());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Loader: starting load attempt {} ({} resources)",
            attempt,
            self.resources.len()
        );

        let loader = Arc::clone(self);
        let settle_to = promise.clone();
        let spawned = thread::Builder::new()
            .name("loader".to_string())
            .spawn(move || {
                let outcome = loader.load_all();
                loader.finish(settle_to, outcome);
            });

        if let Err(e) = spawned {
            error!("Loader: failed to spawn loader thread: {}", e);
            *inflight = None;
            drop(inflight);
            promise.settle(Err(LoadError::new(LOADER_STAGE, e.to_string())));
        }
        promise
    }

    fn load_all(&self) -> LoadOutcome {
        let start = Instant::now();
        let mut loaded = Vec::with_capacity(self.resources.len());
        for id in &self.resources {
            trace!("Loader: fetching '{}'", id);
            let bytes = self
                .source
                .fetch(id)
                .map_err(|reason| LoadError::new(id.clone(), reason))?;
            debug!("Loader: '{}' loaded ({} bytes)", id, bytes.len());
            loaded.push(LoadedResource {
                id: id.clone(),
                bytes,
            });
        }

        let engine = self
            .factory
            .instantiate(&loaded)
            .map_err(|reason| LoadError::new(ENGINE_STAGE, reason))?;

        Ok(Arc::new(EngineHandle {
            engine: Mutex::new(engine),
            resources: self.resources.clone(),
            load_time: start.elapsed(),
        }))
    }

    fn finish(&self, promise: Promise<LoadOutcome>, outcome: LoadOutcome) {
        {
            let mut inflight = self.inflight();
            if let Ok(handle) = &outcome {
                // Publish before clearing the in-flight slot so no caller can
                // observe "not loading" and "not loaded" at once.
                let _ = self.loaded.set(Arc::clone(handle));
            }
            *inflight = None;
        }
        match &outcome {
            Ok(handle) => info!("Loader: engine loaded in {:?}", handle.load_time()),
            Err(e) => warn!("Loader: {}; loader reset for retry", e),
        }
        promise.settle(outcome);
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("resources", &self.resources)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}
