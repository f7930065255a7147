//! Spin locks that live inside shared memory, and the bounded spin/yield
//! retry policy used everywhere a caller wants blocking semantics.
//!
//! Blocking is always layered by the caller: the shared data structures
//! report `Full`/`Empty`/pending as ordinary values and a [`SpinWait`]
//! drives the retry. A `SpinWait` moves `NotAcquired -> Acquired` by
//! spinning tightly for a bounded number of iterations, then cooperatively
//! yielding, optionally until a deadline elapses.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A one-word spin lock embeddable in a shared-memory header.
///
/// Both sides of a mapping may contend on it; the critical sections it
/// protects are a handful of loads and stores, so no parking is attempted.
#[repr(transparent)]
pub struct SpinLock(AtomicU32);

impl SpinLock {
    /// Resets the lock word. Called only by the initializing process.
    pub fn init(&self) {
        self.0.store(UNLOCKED, Ordering::Release);
    }

    /// Single acquisition attempt.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spins until the lock is acquired, yielding after the spin bound.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_> {
        let mut wait = SpinWait::new();
        while !self.try_lock() {
            // No deadline: lock holders are short critical sections.
            let _ = wait.spin();
        }
        SpinGuard { lock: self }
    }

    #[inline]
    fn unlock(&self) {
        self.0.store(UNLOCKED, Ordering::Release);
    }
}

/// RAII guard for [`SpinLock`].
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Default number of tight spins before each cooperative yield.
pub const DEFAULT_MAX_SPINS: u32 = 128;

/// Bounded spin-then-yield retry state.
///
/// `spin()` burns one iteration: the first [`DEFAULT_MAX_SPINS`] calls are
/// `spin_loop` hints, every later call is a `yield_now`. With a deadline,
/// `spin()` returns [`Error::Timeout`] once the deadline has passed; without
/// one it never fails.
pub struct SpinWait {
    spins: u32,
    max_spins: u32,
    deadline: Option<Instant>,
}

impl SpinWait {
    pub fn new() -> Self {
        Self {
            spins: 0,
            max_spins: DEFAULT_MAX_SPINS,
            deadline: None,
        }
    }

    /// Retry policy that gives up with `Timeout` after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            spins: 0,
            max_spins: DEFAULT_MAX_SPINS,
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Retry policy with an explicit spin bound, for deterministic tests.
    pub fn with_max_spins(max_spins: u32) -> Self {
        Self {
            spins: 0,
            max_spins,
            deadline: None,
        }
    }

    /// Optional deadline for an already-constructed policy.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Burn one retry iteration.
    #[inline]
    pub fn spin(&mut self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        Ok(())
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `op` until it stops reporting a retryable error, driving `wait`
/// between attempts. Non-retryable errors (and `Timeout` from the policy)
/// propagate immediately.
pub fn spin_until<T>(mut wait: SpinWait, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() => wait.spin()?,
            Err(e) => return Err(e),
        }
    }
}
