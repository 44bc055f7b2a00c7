//! Worker-local monotonic time.
//!
//! The event loop records one timestamp per iteration; everything that runs
//! inside that iteration reads the cached tick instead of calling into the
//! OS again. Off worker threads `now()` falls back to a real reading.

use std::cell::Cell;
use std::time::{Duration, Instant};

thread_local! {
    static TICK: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Refresh the cached tick. Called by the worker loop once per iteration.
pub fn update_tick() -> Instant {
    let now = Instant::now();
    TICK.with(|t| t.set(Some(now)));
    now
}

/// The current tick, cached per loop iteration on worker threads
pub fn now() -> Instant {
    TICK.with(|t| t.get()).unwrap_or_else(Instant::now)
}

/// Simple stopwatch over the worker clock
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self { started: now() }
    }

    /// Time elapsed since start without stopping the watch
    pub fn split(&self) -> Duration {
        now().saturating_duration_since(self.started)
    }

    pub fn restart(&mut self) {
        self.started = now();
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}
