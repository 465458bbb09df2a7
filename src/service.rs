// src/service.rs

//! The coordinator service: one instance per process, passed to callers.
//!
//! Wires the pieces together:
//!
//! ```text
//! caller ─► RequestCache ──miss──► RenderQueue ─► render thread
//!              │                                   │ Loader::ensure_loaded()
//!              └──hit: same promise                │ RendererAdapter::render()
//!                                                  ▼
//!                                       promise settles for every caller
//! ```

use anyhow::{Context, Result};
use log::*;
use std::future::IntoFuture;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::RendererAdapter;
use crate::cache::{CacheStats, EntryState, RequestCache};
use crate::config::{Config, RenderDefaults};
use crate::loader::{
    EngineFactory, FileSystemSource, LoadOutcome, LoadState, Loader, ResourceSource,
};
use crate::options::{Fingerprint, RenderOptions, RenderRequest};
use crate::promise::Promise;
use crate::queue::{QueueEvent, QueuedTask, RenderOutcome, RenderQueue};

/// A caller's claim on a render outcome.
///
/// Every ticket for the same fingerprint shares one promise.
#[derive(Debug, Clone)]
pub struct Ticket {
    task: QueuedTask,
    cached: bool,
}

impl Ticket {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.task.fingerprint
    }

    /// `true` if this ticket joined an existing cache entry instead of
    /// queueing a new task.
    pub fn was_cached(&self) -> bool {
        self.cached
    }

    /// Queue sequence number of the task backing this ticket.
    pub fn seq(&self) -> u64 {
        self.task.seq
    }

    pub fn promise(&self) -> &Promise<RenderOutcome> {
        &self.task.promise
    }

    pub fn wait(&self) -> RenderOutcome {
        self.task.promise.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<RenderOutcome> {
        self.task.promise.wait_timeout(timeout)
    }

    pub fn try_get(&self) -> Option<RenderOutcome> {
        self.task.promise.try_get()
    }

    /// Cancels the shared render. Every ticket for this fingerprint observes
    /// the cancellation; the next identical request starts a fresh task.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }
}

impl IntoFuture for Ticket {
    type Output = RenderOutcome;
    type IntoFuture = Promise<RenderOutcome>;

    fn into_future(self) -> Self::IntoFuture {
        self.task.promise
    }
}

pub struct BarcodeService {
    defaults: RenderDefaults,
    loader: Arc<Loader>,
    cache: RequestCache,
    queue: RenderQueue,
}

impl BarcodeService {
    /// Builds the service and starts its render thread.
    pub fn new(
        config: &Config,
        source: Arc<dyn ResourceSource>,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        let loader = Arc::new(Loader::new(config.loader.resources.clone(), source, factory));
        let queue = RenderQueue::spawn(
            Arc::clone(&loader),
            RendererAdapter::new(),
            config.queue.task_timeout(),
        )
        .context("Failed to start render queue")?;

        let service = Self {
            defaults: config.defaults.clone(),
            loader,
            cache: RequestCache::new(config.cache.failure_policy),
            queue,
        };

        if config.loader.preload {
            info!("BarcodeService: preloading engine resources");
            let _ = service.loader.ensure_loaded();
        }
        info!(
            "BarcodeService: ready (default symbol '{}', failure policy {:?})",
            service.defaults.symbol,
            service.cache.policy()
        );
        Ok(service)
    }

    /// Builds the service with resources read from `config.loader.root`.
    pub fn from_config(config: &Config, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let source = Arc::new(FileSystemSource::new(&config.loader.root));
        Self::new(config, source, factory)
    }

    /// Requests a render. Identical requests share one engine call.
    pub fn request(&self, request: RenderRequest) -> Ticket {
        let fingerprint = request.fingerprint();
        let lookup = self
            .cache
            .get_or_create(&fingerprint, || self.queue.enqueue(fingerprint.clone(), request));
        Ticket {
            task: lookup.task,
            cached: lookup.hit,
        }
    }

    pub fn render(&self, symbol: &str, code: &str, options: RenderOptions) -> Ticket {
        self.request(RenderRequest::new(symbol, code, options))
    }

    /// Renders `code` with the configured default symbol and options.
    pub fn render_default(&self, code: &str) -> Ticket {
        self.request(RenderRequest::new(
            self.defaults.symbol.as_str(),
            code,
            self.defaults.options.clone(),
        ))
    }

    pub fn defaults(&self) -> &RenderDefaults {
        &self.defaults
    }

    pub fn ensure_loaded(&self) -> Promise<LoadOutcome> {
        self.loader.ensure_loaded()
    }

    pub fn load_state(&self) -> LoadState {
        self.loader.state()
    }

    pub fn subscribe(&self) -> Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_state(&self, fingerprint: &Fingerprint) -> Option<EntryState> {
        self.cache.state(fingerprint)
    }

    /// Lets the render thread finish every accepted task, then stops it.
    /// Requests made afterwards fail with an internal error.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        info!("BarcodeService: stopped");
    }
}

impl std::fmt::Debug for BarcodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarcodeService")
            .field("defaults", &self.defaults)
            .field("loader", &self.loader)
            .field("cache", &self.cache)
            .field("queue", &self.queue)
            .finish()
    }
}
