// src/queue.rs

//! Render queue: strict FIFO, one render at a time.
//!
//! Simple work queue pattern: callers push [`Task`]s into an unbounded channel,
//! a single dedicated `render` thread pulls them off one by one, runs the
//! adapter and settles the task's promise.
//!
//! Threading model:
//! - Owns: the worker thread, the task channel, the event subscribers
//! - The worker blocks on the channel between tasks, so callers get control
//!   back immediately after `enqueue` and nothing renders inline
//! - Every accepted task settles exactly once, success or failure; a failure
//!   never stops the worker
//! - `Drained` is published after the last task of a busy period settles
//!
//! Tasks can be cancelled (they settle as `Cancelled` at once and are skipped
//! if still queued) and can be given a timeout for the engine call. A timed-out
//! call settles its task immediately, but the worker still waits for the engine
//! to return before starting the next task: the engine is never re-entered.

use anyhow::{Context, Result};
use log::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::adapter::{AdapterError, EncodedImage, RendererAdapter};
use crate::engine::RenderEngine;
use crate::error::{ErrorKind, RequestError};
use crate::loader::Loader;
use crate::options::{Fingerprint, RenderRequest};
use crate::promise::Promise;

/// What every caller of a fingerprint eventually receives.
pub type RenderOutcome = Result<Arc<EncodedImage>, RequestError>;

/// Shared cancellation flag for one task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A unit of work, owned by the queue from enqueue until it settles.
pub struct Task {
    seq: u64,
    fingerprint: Fingerprint,
    request: RenderRequest,
    promise: Promise<RenderOutcome>,
    cancel: CancelToken,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("seq", &self.seq)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Caller-side view of an enqueued task.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    /// Submission number, starting at 1. Zero for tasks that never reached the
    /// queue.
    pub seq: u64,
    pub fingerprint: Fingerprint,
    pub promise: Promise<RenderOutcome>,
    cancel: CancelToken,
}

impl QueuedTask {
    /// A task that failed before it could be queued.
    pub(crate) fn rejected(error: RequestError) -> Self {
        Self {
            seq: 0,
            fingerprint: error.fingerprint.clone(),
            promise: Promise::resolved(Err(error)),
            cancel: CancelToken::new(),
        }
    }

    /// A pending handle not attached to any queue.
    #[cfg(test)]
    pub(crate) fn detached(fingerprint: &Fingerprint, seq: u64) -> Self {
        Self {
            seq,
            fingerprint: fingerprint.clone(),
            promise: Promise::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Cancels the task for everyone waiting on it.
    ///
    /// The promise settles with `Cancelled` right away unless it already holds
    /// an outcome. Returns `true` if this call settled it.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel();
        let settled = self.promise.settle(Err(RequestError::new(
            ErrorKind::Cancelled,
            "render cancelled by caller",
            &self.fingerprint,
        )));
        if settled {
            debug!("RenderQueue: task #{} ({}) cancelled", self.seq, self.fingerprint);
        }
        settled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Notifications published to [`RenderQueue::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// One task settled.
    Settled {
        seq: u64,
        fingerprint: Fingerprint,
        ok: bool,
    },
    /// The queue went empty. Published once per busy period, after the last
    /// task of the period has settled.
    Drained {
        /// Busy periods completed so far, including this one.
        cycle: u64,
        /// Tasks settled during this period.
        settled: u64,
    },
}

#[derive(Default)]
struct EventHub {
    subscribers: Mutex<Vec<Sender<QueueEvent>>>,
}

impl EventHub {
    fn lock(&self) -> MutexGuard<'_, Vec<Sender<QueueEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> Receiver<QueueEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().push(tx);
        rx
    }

    /// Sends to every live subscriber, forgetting the ones that hung up.
    fn publish(&self, event: QueueEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct QueueShared {
    /// Tasks accepted but not yet settled by the worker, the running one included.
    pending: AtomicUsize,
    next_seq: AtomicU64,
    events: EventHub,
}

pub struct RenderQueue {
    tx: Mutex<Option<Sender<Task>>>,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RenderQueue {
    /// Spawns the render worker.
    ///
    /// The worker resolves the engine through `loader` before every task;
    /// `task_timeout` bounds each engine call.
    pub fn spawn(
        loader: Arc<Loader>,
        adapter: RendererAdapter,
        task_timeout: Option<Duration>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(QueueShared {
            pending: AtomicUsize::new(0),
            next_seq: AtomicU64::new(1),
            events: EventHub::default(),
        });

        let worker = RenderWorker {
            loader,
            adapter,
            task_timeout,
            shared: Arc::clone(&shared),
            cycle: 0,
            settled_in_cycle: 0,
        };
        let handle = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || worker.run(rx))
            .context("Failed to spawn render thread")?;
        info!("RenderQueue: render thread spawned (task timeout: {:?})", task_timeout);

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Appends a task to the tail of the queue and returns its handle.
    ///
    /// Never blocks and never renders inline. If the worker is gone the task
    /// settles at once with an internal error.
    pub fn enqueue(&self, fingerprint: Fingerprint, request: RenderRequest) -> QueuedTask {
        // Sequence numbers are taken under the sender lock so they follow
        // channel order exactly.
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let handle = QueuedTask {
            seq,
            fingerprint: fingerprint.clone(),
            promise: Promise::new(),
            cancel: CancelToken::new(),
        };
        let task = Task {
            seq,
            fingerprint,
            request,
            promise: handle.promise.clone(),
            cancel: handle.cancel.clone(),
        };

        let Some(sender) = tx.as_ref() else {
            // Shut down: the task never counts as pending, so it cannot hold
            // back the drained event of the final busy period.
            drop(tx);
            warn!("RenderQueue: queue is shut down, rejecting #{}", seq);
            reject_unsent(task);
            return handle;
        };

        let was_idle = self.shared.pending.fetch_add(1, Ordering::SeqCst) == 0;
        match sender.send(task) {
            Ok(()) => trace!(
                "RenderQueue: enqueued #{} {} (queue was idle: {})",
                seq,
                handle.fingerprint,
                was_idle
            ),
            Err(mpsc::SendError(task)) => {
                // Only reachable if the render thread died; no drained event
                // is owed by a dead worker.
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                error!("RenderQueue: render thread is gone, rejecting #{}", seq);
                reject_unsent(task);
            }
        }
        handle
    }

    /// Registers a new event receiver. Events published before this call are
    /// not replayed.
    pub fn subscribe(&self) -> Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Tasks accepted and not yet settled by the worker.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Stops accepting tasks, lets the worker finish every accepted one and
    /// joins it. Safe to call more than once.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            info!("RenderQueue: waiting for {} pending task(s)", self.pending());
            if worker.join().is_err() {
                error!("RenderQueue: render thread panicked");
            }
        }
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RenderQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderQueue")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Worker state (runs on the render thread).
struct RenderWorker {
    loader: Arc<Loader>,
    adapter: RendererAdapter,
    task_timeout: Option<Duration>,
    shared: Arc<QueueShared>,
    cycle: u64,
    settled_in_cycle: u64,
}

impl RenderWorker {
    fn run(mut self, rx: Receiver<Task>) {
        info!("RenderWorker: Thread started");
        // recv() keeps yielding buffered tasks after the last sender is gone,
        // so shutdown still settles everything that was accepted.
        while let Ok(task) = rx.recv() {
            trace!("RenderWorker: Received task #{}", task.seq);
            self.process(task);
        }
        info!("RenderWorker: Task channel closed, exiting");
    }

    fn process(&mut self, task: Task) {
        if let Some(outcome) = self.execute(&task) {
            task.promise.settle(outcome);
        }

        let ok = matches!(task.promise.peek(), Some(Ok(_)));
        if let Some(Err(e)) = task.promise.peek() {
            warn!("RenderWorker: task #{} failed: {}", task.seq, e);
        }
        self.shared.events.publish(QueueEvent::Settled {
            seq: task.seq,
            fingerprint: task.fingerprint.clone(),
            ok,
        });

        self.settled_in_cycle += 1;
        if self.shared.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cycle += 1;
            debug!(
                "RenderWorker: queue drained (cycle {}, {} task(s))",
                self.cycle, self.settled_in_cycle
            );
            self.shared.events.publish(QueueEvent::Drained {
                cycle: self.cycle,
                settled: self.settled_in_cycle,
            });
            self.settled_in_cycle = 0;
        }
    }

    /// Runs one task. `None` means the promise was already settled elsewhere
    /// (cancelled, or timed out while the engine kept running).
    fn execute(&self, task: &Task) -> Option<RenderOutcome> {
        if task.cancel.is_cancelled() || task.promise.is_settled() {
            debug!("RenderWorker: skipping cancelled task #{}", task.seq);
            return None;
        }

        let handle = match self.loader.ensure_loaded().wait() {
            Ok(handle) => handle,
            Err(e) => return Some(Err(RequestError::load(&e, &task.fingerprint))),
        };
        let mut engine = match handle.lock() {
            Ok(engine) => engine,
            Err(_) => {
                return Some(Err(RequestError::new(
                    ErrorKind::Internal,
                    "engine lock poisoned",
                    &task.fingerprint,
                )))
            }
        };

        match self.task_timeout {
            None => {
                let result = self.adapter.render(&mut **engine, &task.request);
                Some(classify(result, &task.fingerprint))
            }
            Some(limit) => self.render_with_timeout(&mut **engine, task, limit),
        }
    }

    /// Runs the engine call on a scoped helper thread and gives up waiting
    /// after `limit`. The scope still joins the helper before returning.
    fn render_with_timeout(
        &self,
        engine: &mut dyn RenderEngine,
        task: &Task,
        limit: Duration,
    ) -> Option<RenderOutcome> {
        let adapter = self.adapter;
        let request = &task.request;
        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            let spawned = thread::Builder::new()
                .name("render-call".to_string())
                .spawn_scoped(scope, move || {
                    let _ = tx.send(adapter.render(engine, request));
                });
            if let Err(e) = spawned {
                return Some(Err(RequestError::new(
                    ErrorKind::Internal,
                    format!("failed to spawn render call thread: {e}"),
                    &task.fingerprint,
                )));
            }

            match rx.recv_timeout(limit) {
                Ok(result) => Some(classify(result, &task.fingerprint)),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "RenderWorker: task #{} exceeded {:?}; waiting for the engine to return",
                        task.seq, limit
                    );
                    task.promise.settle(Err(RequestError::new(
                        ErrorKind::TimedOut,
                        format!("engine call exceeded {limit:?}"),
                        &task.fingerprint,
                    )));
                    None
                }
                Err(RecvTimeoutError::Disconnected) => Some(Err(RequestError::new(
                    ErrorKind::Internal,
                    "render call thread exited without a result",
                    &task.fingerprint,
                ))),
            }
        })
    }
}

fn reject_unsent(task: Task) {
    task.promise.settle(Err(RequestError::new(
        ErrorKind::Internal,
        "render worker is not running",
        &task.fingerprint,
    )));
}

fn classify(result: Result<EncodedImage, AdapterError>, fingerprint: &Fingerprint) -> RenderOutcome {
    match result {
        Ok(image) => Ok(Arc::new(image)),
        Err(AdapterError::Render(e)) => Err(RequestError::render(e, fingerprint)),
        Err(AdapterError::Internal(msg)) => {
            Err(RequestError::new(ErrorKind::Internal, msg, fingerprint))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RenderOptions;
    use test_log::test;

    fn fingerprint(code: &str) -> Fingerprint {
        RenderRequest::new("code128", code, RenderOptions::default()).fingerprint()
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn event_hub_forgets_hung_up_subscribers() {
        let hub = EventHub::default();
        let kept = hub.subscribe();
        drop(hub.subscribe());

        hub.publish(QueueEvent::Drained {
            cycle: 1,
            settled: 0,
        });
        assert_eq!(hub.lock().len(), 1);
        assert_eq!(
            kept.try_recv().unwrap(),
            QueueEvent::Drained {
                cycle: 1,
                settled: 0
            }
        );
    }

    #[test]
    fn rejected_task_is_settled_with_seq_zero() {
        let fp = fingerprint("X");
        let task = QueuedTask::rejected(RequestError::new(ErrorKind::Cache, "poisoned", &fp));
        assert_eq!(task.seq, 0);
        assert_eq!(task.promise.try_get().unwrap().unwrap_err().kind, ErrorKind::Cache);
        // Already settled, so cancelling does nothing.
        assert!(!task.cancel());
    }

    #[test]
    fn classify_maps_adapter_errors_to_kinds() {
        let fp = fingerprint("Y");
        let render = classify(
            Err(AdapterError::Render(crate::error::RenderError::new("E.CODE", "no"))),
            &fp,
        )
        .unwrap_err();
        assert_eq!(render.kind, ErrorKind::Render);
        assert_eq!(render.engine_code.as_deref(), Some("E.CODE"));

        let internal = classify(Err(AdapterError::Internal("bad raster".into())), &fp).unwrap_err();
        assert_eq!(internal.kind, ErrorKind::Internal);
        assert_eq!(internal.message, "bad raster");
    }
}
