//! Worker load measurement.
//!
//! The load of a worker is the share of wall time it spends outside the
//! reactor wait. The one-second figure is updated on each entry to the
//! wait; the minute and hour figures are arithmetic sliding averages over
//! the one-second samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SECONDS_PER_MINUTE: usize = 60;
const SECONDS_PER_HOUR: usize = 3600;

/// Fixed-window arithmetic sliding average
#[derive(Debug)]
pub struct SlidingAverage {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl SlidingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Load percentages over the three windows
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSnapshot {
    pub one_second: u8,
    pub one_minute: u8,
    pub one_hour: u8,
}

#[derive(Debug)]
pub struct LoadMeter {
    window_start: Instant,
    busy_in_window: Duration,
    last_sample: f64,
    minute: SlidingAverage,
    hour: SlidingAverage,
}

impl LoadMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            busy_in_window: Duration::ZERO,
            last_sample: 0.0,
            minute: SlidingAverage::new(SECONDS_PER_MINUTE),
            hour: SlidingAverage::new(SECONDS_PER_HOUR),
        }
    }

    /// Record one loop iteration: `busy` is the time spent processing,
    /// `now` the time the worker re-enters the wait. Closes the one-second
    /// window if it has elapsed.
    pub fn record(&mut self, busy: Duration, now: Instant) {
        self.busy_in_window += busy;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            let sample =
                (self.busy_in_window.as_secs_f64() / elapsed.as_secs_f64()).clamp(0.0, 1.0);
            self.last_sample = sample;
            self.minute.push(sample);
            self.hour.push(sample);
            self.window_start = now;
            self.busy_in_window = Duration::ZERO;
        }
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            one_second: to_percent(self.last_sample),
            one_minute: to_percent(self.minute.average()),
            one_hour: to_percent(self.hour.average()),
        }
    }
}

fn to_percent(ratio: f64) -> u8 {
    (ratio * 100.0).round().clamp(0.0, 100.0) as u8
}
