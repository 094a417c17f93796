//! Fixed-period scheduling for the pipeline loops
//!
//! Best-effort cadence: each wait sleeps for whatever is left of the period
//! measured from the start of the current tick. Overruns are not made up
//! and accumulated drift is not corrected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Longest single sleep, so loops notice a cleared running flag promptly
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Drives a loop at a fixed period
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    tick_started: Instant,
}

impl Ticker {
    /// Creates a ticker whose first tick starts now
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            tick_started: Instant::now(),
        }
    }

    /// Marks the start of a tick
    pub fn begin(&mut self) -> Instant {
        self.tick_started = Instant::now();
        self.tick_started
    }

    /// Time left in the current period
    pub fn remaining(&self) -> Duration {
        self.period.saturating_sub(self.tick_started.elapsed())
    }

    /// Sleeps out the rest of the period unless `running` is cleared
    ///
    /// Returns false if the flag was cleared while waiting.
    pub fn wait(&self, running: &AtomicBool) -> bool {
        sleep_while(self.remaining(), running)
    }
}

/// Sleeps for `duration` in short slices, returning early (false) once
/// `running` is cleared
pub fn sleep_while(duration: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
