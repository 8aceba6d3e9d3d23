use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool as StdAtomicBool, AtomicUsize as StdAtomicUsize, Ordering},
        Mutex as StdMutex, MutexGuard, TryLockError,
    },
};

use crate::worker_trace;

/// named AtomicUsize wrapper; progress counters are SeqCst so that a worker
/// observing `remaining == 0` at the barrier also observes every peer's
/// side effects
pub struct AtomicUsize {
    name: &'static str,
    inner: StdAtomicUsize,
}
impl AtomicUsize {
    /// new counter with a name used in trace output
    pub fn new(name: &'static str, v: usize) -> Self {
        Self {
            name,
            inner: StdAtomicUsize::new(v),
        }
    }
    /// add one; returns the previous value
    pub fn increment(&self) -> usize {
        let prev = self.inner.fetch_add(1, Ordering::SeqCst);
        worker_trace!("{} increment", self.name);
        prev
    }
    /// subtract one; returns the previous value
    pub fn decrement(&self) -> usize {
        let prev = self.inner.fetch_sub(1, Ordering::SeqCst);
        worker_trace!("{} decrement", self.name);
        prev
    }
    /// add `n`; returns the previous value
    pub fn add(&self, n: usize) -> usize {
        let prev = self.inner.fetch_add(n, Ordering::SeqCst);
        worker_trace!("{} add {}", self.name, n);
        prev
    }
    /// current value
    pub fn load(&self) -> usize {
        self.inner.load(Ordering::SeqCst)
    }
    /// overwrite the value
    pub fn store(&self, v: usize) {
        self.inner.store(v, Ordering::SeqCst)
    }
}
impl Deref for AtomicUsize {
    type Target = StdAtomicUsize;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// AtomicBool wrapper
pub struct AtomicBool(StdAtomicBool);
impl AtomicBool {
    /// new flag
    pub fn new(v: bool) -> Self {
        Self(StdAtomicBool::new(v))
    }
    /// current value
    pub fn load(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    /// overwrite the value
    pub fn store(&self, val: bool) {
        self.0.store(val, Ordering::SeqCst)
    }
}

/// Mutex wrapper
pub struct Mutex<T>(StdMutex<T>);
impl<T> Mutex<T> {
    /// new mutex
    pub fn new(t: T) -> Self {
        Self(StdMutex::new(t))
    }
    /// blocking lock
    pub fn lock(&self) -> MutexGuard<T> {
        self.0.lock().expect("lock error")
    }
    /// non-blocking lock; `None` when the lock is held elsewhere
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        match self.0.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => panic!("lock error"),
        }
    }
}
