//! Throughput accounting
//!
//! A [`SpeedMeter`] is sampled on a fixed tick with the running byte total.
//! Each sample stores the byte delta over the time delta; the smoothed rate is
//! the mean of the last `window` samples. The all-time average divides the
//! total by the elapsed wall time.

use std::collections::VecDeque;
use std::time::Instant;

/// Default number of samples kept for the smoothed rate
pub const DEFAULT_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: usize,
    samples: VecDeque<f64>,
    started: Instant,
    last: (Instant, u64),
}

impl SpeedMeter {
    pub fn new(window: usize, now: Instant) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            started: now,
            last: (now, 0),
        }
    }

    /// Record the running byte total at `now`
    pub fn sample(&mut self, now: Instant, total_bytes: u64) {
        let (last_at, last_total) = self.last;
        let elapsed = now.saturating_duration_since(last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let delta = total_bytes.saturating_sub(last_total) as f64;
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(delta / elapsed);
        self.last = (now, total_bytes);
    }

    /// Smoothed bytes per second over the sample window
    pub fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Bytes per second since the meter started
    pub fn average(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.last.1 as f64 / elapsed
    }

    /// Byte total at the last sample
    pub fn total(&self) -> u64 {
        self.last.1
    }
}

/// Format a byte rate for display
pub fn format_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
