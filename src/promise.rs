// src/promise.rs

//! Settle-once shared future.
//!
//! A `Promise<T>` is the value every caller of the coordinator ends up holding:
//! the loader hands one out per load attempt, the render queue hands one out per
//! task, and the request cache hands the *same* one to every duplicate request.
//!
//! Threading model:
//! - Any number of clones may wait on it from any thread (`wait`, `wait_timeout`)
//!   or poll it from an async executor (it implements `Future`).
//! - Exactly one `settle` wins; later calls are ignored and report `false`.
//! - Once settled, reads go through a `OnceCell` and never take the lock.

use once_cell::sync::OnceCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct Shared<T> {
    value: OnceCell<T>,
    /// Wakers of async pollers parked while the value was missing.
    wakers: Mutex<Vec<Waker>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    // The guarded data is only a waker list; a panic elsewhere cannot leave it
    // half-updated, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Vec<Waker>> {
        self.wakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to a value that is settled exactly once.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Creates a pending promise.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                value: OnceCell::new(),
                wakers: Mutex::new(Vec::new()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Creates a promise that is already settled with `value`.
    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        let _ = promise.shared.value.set(value);
        promise
    }

    /// Settles the promise. Returns `false` if it had already been settled, in
    /// which case `value` is dropped.
    pub fn settle(&self, value: T) -> bool {
        let wakers = {
            let mut guard = self.shared.lock();
            if self.shared.value.set(value).is_err() {
                return false;
            }
            self.shared.ready.notify_all();
            std::mem::take(&mut *guard)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.shared.value.get().is_some()
    }

    /// Borrow the settled value without blocking.
    pub fn peek(&self) -> Option<&T> {
        self.shared.value.get()
    }

    /// Returns `true` if both handles point at the same underlying promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Blocks until the promise is settled or `deadline` passes.
    fn block_until(&self, deadline: Option<Instant>) -> Option<&T> {
        if let Some(value) = self.shared.value.get() {
            return Some(value);
        }
        let mut guard = self.shared.lock();
        loop {
            if let Some(value) = self.shared.value.get() {
                return Some(value);
            }
            guard = match deadline {
                None => self
                    .shared
                    .ready
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.shared
                        .ready
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

impl<T: Clone> Promise<T> {
    /// Non-blocking read of the settled value.
    pub fn try_get(&self) -> Option<T> {
        self.peek().cloned()
    }

    /// Blocks the calling thread until the promise settles.
    pub fn wait(&self) -> T {
        match self.block_until(None) {
            Some(value) => value.clone(),
            // block_until(None) only returns once a value is present.
            None => unreachable!("unbounded wait returned without a value"),
        }
    }

    /// Blocks for at most `timeout`. `None` means the promise is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.block_until(Some(Instant::now() + timeout)).cloned()
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.shared.value.get() {
            return Poll::Ready(value.clone());
        }
        let mut wakers = self.shared.lock();
        // Re-check under the lock: settle() sets the value while holding it.
        if let Some(value) = self.shared.value.get() {
            return Poll::Ready(value.clone());
        }
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peek() {
            Some(value) => f.debug_tuple("Promise::Settled").field(value).finish(),
            None => f.write_str("Promise::Pending"),
        }
    }
}
