//! Time source for the long-poll loop.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time that can also suspend the caller.
///
/// The poll loop only ever blocks through [`Clock::sleep`], so tests can
/// drive it with a [`ManualClock`] instead of waiting.
pub trait Clock: Send + Sync {
    /// Returns the current time in unix seconds.
    fn now(&self) -> i64;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration);
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

type SleepHook = Box<dyn Fn(i64) + Send + Sync>;

/// A clock that only moves when told to.
///
/// `sleep` returns immediately after advancing the time by the requested
/// number of whole seconds and recording the call. An optional hook runs
/// after every sleep with the new time, which lets a test act as a
/// concurrent request while the poll loop is suspended.
pub struct ManualClock {
    now: Mutex<i64>,
    sleeps: Mutex<Vec<Duration>>,
    on_sleep: Option<SleepHook>,
}

impl ManualClock {
    /// Creates a clock starting at `now` (unix seconds).
    pub fn new(now: i64) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
            on_sleep: None,
        }
    }

    /// Installs a hook that runs after every sleep.
    pub fn with_sleep_hook(mut self, hook: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.on_sleep = Some(Box::new(hook));
        self
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration.as_secs() as i64;
    }

    /// Sets the clock.
    pub fn set(&self, now: i64) {
        *self.now.lock() = now;
    }

    /// Returns every sleep requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.now.lock())
            .field("sleeps", &self.sleeps.lock().len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        let now = {
            let mut now = self.now.lock();
            *now += duration.as_secs() as i64;
            *now
        };
        if let Some(hook) = &self.on_sleep {
            hook(now);
        }
    }
}
