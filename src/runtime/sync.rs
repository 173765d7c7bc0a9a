//! Synchronization primitives for the worker pool.
//!
//! Thin wrappers over `std::sync` and `std::thread`:
//! - `Mutex`: panics when a thread locks a mutex it already holds,
//!   instead of deadlocking silently
//! - `Condition`: wait/signal/broadcast, always paired with a `Mutex`
//! - `spawn`: detached, named threads with a bounded stack
//!
//! A mutex cannot be destroyed while locked: the guard borrows it.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, PoisonError};
use std::thread;

/// Default worker stack size. Pools can be large, so the platform
/// default (usually 2-8 MiB) is far more than a session needs.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Owner value meaning "not held by any thread".
const UNOWNED: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Mutual-exclusion lock that detects recursive locking.
///
/// Poisoning is recovered: a panic inside a critical section does not make
/// the protected state unreachable for the remaining workers.
pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
    /// Token of the thread currently holding the lock.
    owner: AtomicU64,
}

impl<T> Mutex<T> {
    /// Create a new unlocked mutex.
    pub fn new(value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
            owner: AtomicU64::new(UNOWNED),
        }
    }

    /// Acquire the lock, blocking until it is available.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds this mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            panic!("fatal: mutex locked twice by the same thread");
        }

        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.owner.store(me, Ordering::Release);

        MutexGuard {
            mutex: self,
            guard: Some(guard),
        }
    }
}

/// Scoped lock on a `Mutex`. The lock is released when the guard drops.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    /// Only `None` while parked inside `Condition::wait`.
    guard: Option<std::sync::MutexGuard<'a, T>>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("mutex guard used while waiting"),
        }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("mutex guard used while waiting"),
        }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // Clear ownership before the inner guard unlocks.
        if self.guard.is_some() {
            self.mutex.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

/// Condition variable paired with a `Mutex`.
#[derive(Default)]
pub struct Condition {
    inner: Condvar,
}

impl Condition {
    /// Create a new condition variable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically release `guard` and block until signalled, then
    /// reacquire the lock before returning.
    ///
    /// Wakeups may be spurious; callers re-check their predicate.
    pub fn wait<'a, T>(&self, mut guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let Some(inner) = guard.guard.take() else {
            unreachable!("mutex guard used while waiting");
        };

        guard.mutex.owner.store(UNOWNED, Ordering::Release);
        let inner = self.inner.wait(inner).unwrap_or_else(PoisonError::into_inner);
        guard
            .mutex
            .owner
            .store(current_thread_token(), Ordering::Release);

        guard.guard = Some(inner);
        guard
    }

    /// Wake one waiting thread.
    pub fn signal(&self) {
        self.inner.notify_one();
    }

    /// Wake all waiting threads.
    pub fn broadcast(&self) {
        self.inner.notify_all();
    }
}

/// Start a detached thread named `name` with a stack of `stack_size` bytes.
///
/// Thread creation failure (usually resource limits) is returned to the
/// caller; the closure is dropped in that case.
pub fn spawn<F>(name: String, stack_size: usize, f: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    // Dropping the JoinHandle detaches the thread.
    thread::Builder::new()
        .name(name)
        .stack_size(stack_size)
        .spawn(f)?;
    Ok(())
}
