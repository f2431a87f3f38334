//! Blocking when the address space is exhausted.
//!
//! A mapping request that finds no free range does not fail; it waits for an
//! unmap or a reclaim to return space and tries again. Waiters sample a
//! generation counter before their attempt and only sleep if nothing has been
//! released since, so a release racing with a failed attempt is never missed.
//! Every wait is also bounded, so a completion that is never signalled is
//! eventually picked up by polling.

use core::sync::atomic::{AtomicU64, Ordering};

/// Parks mapping requests until address space is released.
pub trait ExhaustionWait: Send + Sync {
    /// Samples the release generation. Call before attempting an allocation.
    fn generation(&self) -> u64;

    /// Blocks until the generation moves past `seen`, or until a poll
    /// interval elapses.
    fn wait(&self, seen: u64);

    /// Advances the generation and wakes every waiter.
    fn notify_all(&self);
}

/// A busy-waiting [`ExhaustionWait`] for environments without a scheduler.
#[derive(Debug)]
pub struct SpinWait {
    generation: AtomicU64,
    spins: u32,
}

impl SpinWait {
    /// The default number of spins per wait.
    pub const DEFAULT_SPINS: u32 = 1 << 16;

    /// Creates a waiter which gives up after `spins` iterations.
    pub const fn new(spins: u32) -> SpinWait {
        SpinWait {
            generation: AtomicU64::new(0),
            spins,
        }
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        SpinWait::new(SpinWait::DEFAULT_SPINS)
    }
}

impl ExhaustionWait for SpinWait {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn wait(&self, seen: u64) {
        for _ in 0..self.spins {
            if self.generation.load(Ordering::Acquire) != seen {
                return;
            }
            core::hint::spin_loop();
        }
    }

    fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(feature = "std")]
pub use self::condvar::CondvarWait;

#[cfg(feature = "std")]
mod condvar {
    extern crate std;

    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::Duration;

    use super::ExhaustionWait;

    /// An [`ExhaustionWait`] which sleeps on a condition variable.
    #[derive(Debug)]
    pub struct CondvarWait {
        generation: Mutex<u64>,
        released: Condvar,
        poll_interval: Duration,
    }

    impl CondvarWait {
        /// The default bound on a single wait.
        pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

        /// Creates a waiter whose waits last at most `poll_interval`.
        pub fn new(poll_interval: Duration) -> CondvarWait {
            CondvarWait {
                generation: Mutex::new(0),
                released: Condvar::new(),
                poll_interval,
            }
        }
    }

    impl Default for CondvarWait {
        fn default() -> Self {
            CondvarWait::new(CondvarWait::DEFAULT_POLL_INTERVAL)
        }
    }

    impl ExhaustionWait for CondvarWait {
        fn generation(&self) -> u64 {
            *self
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
        }

        fn wait(&self, seen: u64) {
            let guard = self
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if *guard != seen {
                return;
            }

            // Spurious wakeups and timeouts both send the caller back to
            // retry, which is all a wakeup would do anyway.
            let _ = self
                .released
                .wait_timeout(guard, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner);
        }

        fn notify_all(&self) {
            let mut guard = self
                .generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *guard += 1;
            drop(guard);

            self.released.notify_all();
        }
    }
}

/// The wait object used when none is named.
#[cfg(feature = "std")]
pub type DefaultWait = CondvarWait;

/// The wait object used when none is named.
#[cfg(not(feature = "std"))]
pub type DefaultWait = SpinWait;
