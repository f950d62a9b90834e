//! Monotonic time source
//!
//! The driver never reads the system clock directly. It asks a `Clock` for
//! the current instant and hands it the idle periods, so tests can run on
//! virtual time.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Time source consumed by the loop driver
pub trait Clock {
    /// Current monotonic time
    fn now(&self) -> Instant;

    /// Block the driver for `duration`. Only called when nothing is runnable.
    fn idle(&self, duration: Duration);
}

/// Wall clock: `Instant::now` and a real thread sleep
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn idle(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: idling advances time instantly
///
/// Clones share the same timeline, so a test can keep one copy to read or
/// advance the time the loop sees.
#[derive(Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    /// Virtual time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed.get())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

    fn idle(&self, duration: Duration) {
        self.advance(duration);
    }
}
