//! Wait primitives for blocking socket calls.
//!
//! Every blocking socket operation follows the same discipline: it decides
//! under the global stack lock that it has to wait, drops the lock, pends on
//! a [`WaitQueue`], and re-acquires the lock before looking at any socket
//! state again.
//!
//! A `WaitQueue` is a binary semaphore with a sticky abort flag:
//!
//! - `post()` sets the signal (saturating at one) and wakes parked tasks
//! - `pend()` consumes the signal, or parks until posted, aborted or timed out
//! - `abort()` fails every current and future `pend()` with
//!   [`WaitOutcome::Aborted`]
//!
//! The actual parking of a task is delegated to the scheduler through the
//! [`WaitHooks`] trait, registered once at start-up. Without hooks, every wait
//! degrades to a poll and reports `TimedOut`.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// ============================================================================
// Outcomes and Timeouts
// ============================================================================

/// Wait operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The queue was posted and the signal consumed
    Woken,
    /// The deadline passed (or the wait was a poll) without a post
    TimedOut,
    /// The queue was aborted, typically because its socket was closed
    Aborted,
}

/// Per-signal timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never block; a wait becomes a poll
    NoWait,
    /// Block for at most this many milliseconds
    Ms(u32),
    /// Block until posted or aborted
    Infinite,
}

impl Timeout {
    /// True when a wait with this timeout can never block.
    #[inline]
    pub fn is_no_wait(&self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ms(0))
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Infinite
    }
}

/// Absolute deadline computed once per blocking call.
///
/// Blocking loops may pend several times (spurious wakeups, signals consumed
/// by a competing task); the deadline keeps the total wait bounded by the
/// caller's timeout.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    poll: bool,
    at_ms: Option<u64>,
}

impl Deadline {
    /// Compute the deadline for `timeout` starting now.
    pub fn after(timeout: Timeout) -> Self {
        match timeout {
            t if t.is_no_wait() => Deadline {
                poll: true,
                at_ms: None,
            },
            Timeout::Ms(ms) => Deadline {
                poll: false,
                at_ms: Some(now_ms().saturating_add(ms as u64)),
            },
            _ => Deadline {
                poll: false,
                at_ms: None,
            },
        }
    }

    /// Milliseconds left, `Some(None)` for an unbounded wait, `None` once expired.
    fn remaining(&self, now: u64) -> Option<Option<u64>> {
        if self.poll {
            return None;
        }
        match self.at_ms {
            None => Some(None),
            Some(at) if now >= at => None,
            Some(at) => Some(Some(at - now)),
        }
    }
}

// ============================================================================
// Scheduler Hooks
// ============================================================================

/// Scheduler integration for blocking waits.
///
/// The socket layer never parks a task itself; it asks the registered hooks
/// to do it. Implementations must not hold any stack lock while parked.
pub trait WaitHooks: Send + Sync {
    /// Park the calling task on `queue` for at most `timeout_ms`
    /// (`None`: until unparked).
    ///
    /// May return early or spuriously; the caller re-checks the queue.
    fn park(&self, queue: &WaitQueue, timeout_ms: Option<u64>);

    /// Wake every task parked on `queue`.
    fn unpark_all(&self, queue: &WaitQueue);

    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;
}

static WAIT_HOOKS: spin::Once<&'static dyn WaitHooks> = spin::Once::new();

/// Register the scheduler hooks used by every blocking socket call.
///
/// Only the first registration takes effect.
pub fn register_wait_hooks(hooks: &'static dyn WaitHooks) {
    WAIT_HOOKS.call_once(|| hooks);
}

#[inline]
fn wait_hooks() -> Option<&'static dyn WaitHooks> {
    WAIT_HOOKS.get().copied()
}

/// Current time from the registered hooks, zero without hooks.
pub fn now_ms() -> u64 {
    wait_hooks().map(|h| h.now_ms()).unwrap_or(0)
}

// ============================================================================
// WaitQueue
// ============================================================================

/// Binary semaphore with forced abort.
pub struct WaitQueue {
    aborted: AtomicBool,
    signal: AtomicU32,
}

impl WaitQueue {
    /// Create an unsignalled, live queue.
    pub const fn new() -> Self {
        WaitQueue {
            aborted: AtomicBool::new(false),
            signal: AtomicU32::new(0),
        }
    }

    /// Pend until posted, aborted, or `deadline` passes.
    pub fn pend(&self, deadline: &Deadline) -> WaitOutcome {
        loop {
            if self.is_aborted() {
                return WaitOutcome::Aborted;
            }
            if self.try_take() {
                return WaitOutcome::Woken;
            }

            let Some(hooks) = wait_hooks() else {
                return WaitOutcome::TimedOut;
            };
            match deadline.remaining(hooks.now_ms()) {
                None => return WaitOutcome::TimedOut,
                Some(left) => hooks.park(self, left),
            }
        }
    }

    /// Consume the signal if set.
    pub fn try_take(&self) -> bool {
        self.signal
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set the signal and wake parked tasks.
    pub fn post(&self) {
        self.signal.store(1, Ordering::Release);
        if let Some(hooks) = wait_hooks() {
            hooks.unpark_all(self);
        }
    }

    /// Abort every current and future waiter.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        if let Some(hooks) = wait_hooks() {
            hooks.unpark_all(self);
        }
    }

    /// True once `abort()` was called.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// True while a post is pending.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signal.load(Ordering::Acquire) != 0
    }

    /// True when a parked task should stop parking.
    #[inline]
    pub fn should_wake(&self) -> bool {
        self.is_aborted() || self.is_signaled()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("signaled", &self.is_signaled())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

// ============================================================================
// Thread-based hooks
// ============================================================================

#[cfg(feature = "std")]
pub use self::std_hooks::{register_std_wait_hooks, StdWaitHooks, STD_WAIT_HOOKS};

#[cfg(feature = "std")]
mod std_hooks {
    use super::{register_wait_hooks, WaitHooks, WaitQueue};
    use std::sync::{Condvar, Mutex, OnceLock};
    use std::time::{Duration, Instant};

    /// Upper bound on a single park; waiters re-check their queue this often.
    const PARK_SLICE_MS: u64 = 10;

    /// Wait hooks for hosted builds: one condition variable shared by all
    /// queues, with parked threads re-checking their own queue on wake.
    pub struct StdWaitHooks {
        lock: Mutex<()>,
        cvar: Condvar,
        epoch: OnceLock<Instant>,
    }

    impl StdWaitHooks {
        pub const fn new() -> Self {
            StdWaitHooks {
                lock: Mutex::new(()),
                cvar: Condvar::new(),
                epoch: OnceLock::new(),
            }
        }
    }

    impl Default for StdWaitHooks {
        fn default() -> Self {
            Self::new()
        }
    }

    impl WaitHooks for StdWaitHooks {
        fn park(&self, queue: &WaitQueue, timeout_ms: Option<u64>) {
            let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            // A post between the caller's check and here takes the lock
            // before notifying, so re-checking under the lock is race free.
            if queue.should_wake() {
                return;
            }
            let slice = timeout_ms.map_or(PARK_SLICE_MS, |ms| ms.clamp(1, PARK_SLICE_MS));
            let _ = self
                .cvar
                .wait_timeout(guard, Duration::from_millis(slice))
                .unwrap_or_else(|e| e.into_inner());
        }

        fn unpark_all(&self, _queue: &WaitQueue) {
            let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.cvar.notify_all();
        }

        fn now_ms(&self) -> u64 {
            self.epoch.get_or_init(Instant::now).elapsed().as_millis() as u64
        }
    }

    /// Process-wide hook instance.
    pub static STD_WAIT_HOOKS: StdWaitHooks = StdWaitHooks::new();

    /// Register [`STD_WAIT_HOOKS`] as the scheduler hooks.
    pub fn register_std_wait_hooks() {
        register_wait_hooks(&STD_WAIT_HOOKS);
    }
}

// ============================================================================
// Tests
// ============================================================================
