//! Time sources for phase timing.
//!
//! Durations come only from [`Clock::monotonic`]; [`Clock::wall`] is kept for
//! display, so wall-clock jumps never change a measured duration.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// A pair of time readings: monotonic for measuring, wall-clock for showing.
pub trait Clock: Send + Sync {
    /// Monotonic offset from a fixed, clock-specific origin.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time.
    fn wall(&self) -> DateTime<Local>;
}

/// The real clock: `Instant` for durations, local time for display.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Hand-driven clock for tests. Readings change only through
/// [`advance`](Self::advance) and [`set_wall`](Self::set_wall).
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(Duration, DateTime<Local>)>,
}

impl ManualClock {
    /// Start at monotonic zero and the given wall time.
    pub fn new(wall: DateTime<Local>) -> Self {
        Self {
            state: Mutex::new((Duration::ZERO, wall)),
        }
    }

    /// Move both readings forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 += by;
        state.1 += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// Move only the monotonic reading.
    pub fn advance_monotonic(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 += by;
    }

    /// Jump the wall clock without touching the monotonic reading.
    pub fn set_wall(&self, wall: DateTime<Local>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.1 = wall;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Local::now())
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    fn wall(&self) -> DateTime<Local> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}
