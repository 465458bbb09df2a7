//! Scripted engine and resource fakes shared by the integration tests.
//!
//! The engine records every call it receives and reacts to a few magic
//! payloads:
//!
//! - `FAIL...` makes the engine refuse with `[SCRIPT.REJECT] ...`
//! - `PANIC` makes the engine panic
//! - `SLEEP:<ms>` makes the call take that long
//!
//! A gate can be installed to hold the next engine call until the test opens
//! it, which lets a test pile up work behind a busy render thread.

#![allow(dead_code)]

use barcode_render::config::Config;
use barcode_render::engine::{EngineParams, Raster, RenderEngine};
use barcode_render::error::RenderError;
use barcode_render::loader::{EngineFactory, LoadedResource, ResourceSource};
use barcode_render::queue::QueueEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

pub const RESOURCES: [&str; 3] = ["freetype.js", "bwipp.js", "bwipjs.js"];

/// One engine invocation as seen by the recorder.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub symbol: String,
    pub code: String,
    pub params: EngineParams,
}

/// Shared observation point for the fake engine.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    gate: Mutex<Option<Receiver<()>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Holds the next engine call until the returned sender fires.
    pub fn install_gate(&self) -> Sender<()> {
        let (open, gate) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(gate);
        open
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn codes(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.code).collect()
    }

    /// Highest number of engine calls ever observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

pub struct RecordingEngine {
    recorder: Arc<Recorder>,
}

impl RenderEngine for RecordingEngine {
    fn render(
        &mut self,
        symbol: &str,
        code: &str,
        params: &EngineParams,
    ) -> Result<Raster, RenderError> {
        let now = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_active.fetch_max(now, Ordering::SeqCst);

        let gate = self.recorder.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(WAIT);
        }
        self.recorder.calls.lock().unwrap().push(Call {
            symbol: symbol.to_string(),
            code: code.to_string(),
            params: params.clone(),
        });

        let result = if code.starts_with("FAIL") {
            Err(RenderError::from_wire(&format!("[SCRIPT.REJECT] cannot encode {code}")))
        } else if code == "PANIC" {
            self.recorder.active.fetch_sub(1, Ordering::SeqCst);
            panic!("scripted engine blew up");
        } else {
            if let Some(ms) = code.strip_prefix("SLEEP:") {
                thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
            }
            // Size tracks the scale so different options give different bytes.
            let width = (code.len().max(1) as f32 * params.scale_x).ceil() as u32;
            let height = (4.0 * params.scale_y).ceil() as u32;
            Ok(Raster::filled(width, height, params.background))
        };

        self.recorder.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Builds [`RecordingEngine`]s and counts how often it was asked to.
pub struct RecordingFactory {
    pub recorder: Arc<Recorder>,
    pub instantiated: AtomicUsize,
}

impl RecordingFactory {
    pub fn new(recorder: &Arc<Recorder>) -> Arc<Self> {
        Arc::new(Self {
            recorder: Arc::clone(recorder),
            instantiated: AtomicUsize::new(0),
        })
    }
}

impl EngineFactory for RecordingFactory {
    fn instantiate(&self, resources: &[LoadedResource]) -> Result<Box<dyn RenderEngine>, String> {
        self.instantiated.fetch_add(1, Ordering::SeqCst);
        if resources.iter().all(|r| r.id != "bwipjs.js") {
            return Err("bwipjs entry point not defined".to_string());
        }
        Ok(Box::new(RecordingEngine {
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

/// In-memory resource source that counts fetches and can fail a number of
/// times before succeeding.
#[derive(Default)]
pub struct MemorySource {
    fetches: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The first `n` fetches fail with a 404.
    pub fn failing(n: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(n),
            ..Default::default()
        })
    }

    /// Every fetch takes `delay`, which keeps a load in flight long enough
    /// for concurrent callers to pile up.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ResourceSource for MemorySource {
    fn fetch(&self, id: &str) -> Result<Vec<u8>, String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(format!("404 Not Found: {id}"));
        }
        Ok(format!("// {id}").into_bytes())
    }
}

pub fn resources() -> Vec<String> {
    RESOURCES.iter().map(|s| s.to_string()).collect()
}

/// A config that loads [`RESOURCES`] and otherwise uses defaults.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.loader.resources = resources();
    config
}

/// Collects events until (and including) the next `Drained`.
pub fn events_until_drained(events: &Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events
            .recv_timeout(WAIT)
            .expect("queue never reported drained");
        let done = matches!(event, QueueEvent::Drained { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}
