/*
 * meter.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Pollhttp, an asynchronous HTTP client with certificate capture.
 *
 * Pollhttp is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Pollhttp is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Pollhttp.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Sliding-window throughput meter.
//!
//! Each `record` appends a timestamped sample; rate queries sum the samples that fall
//! inside the window and divide by the window length in seconds (truncating).
//! Timestamps come from `tokio::time::Instant`, so tests can drive the clock with
//! `tokio::time::pause` / `advance`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Samples older than this are dropped on the next `record`.
const RETENTION: Duration = Duration::from_secs(60);

/// The averaging windows exposed on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    OneSecond,
    FiveSeconds,
    ThirtySeconds,
    OneMinute,
}

impl RateWindow {
    pub const ALL: [RateWindow; 4] = [
        RateWindow::OneSecond,
        RateWindow::FiveSeconds,
        RateWindow::ThirtySeconds,
        RateWindow::OneMinute,
    ];

    pub fn duration(self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Window length in seconds; also the divisor of the rate.
    pub fn seconds(self) -> u64 {
        match self {
            RateWindow::OneSecond => 1,
            RateWindow::FiveSeconds => 5,
            RateWindow::ThirtySeconds => 30,
            RateWindow::OneMinute => 60,
        }
    }

    /// Map a window length in seconds back to a window (used by the C API).
    pub fn from_seconds(seconds: u64) -> Option<RateWindow> {
        RateWindow::ALL.into_iter().find(|w| w.seconds() == seconds)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    amount: u64,
    at: Instant,
}

/// Timestamped amounts with lazy pruning. Shared between the writer (assembler) and
/// any number of readers; the sample queue has its own lock, independent of the body buffer.
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    samples: Mutex<VecDeque<Sample>>,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample stamped now, after trimming samples older than a minute.
    pub fn record(&self, amount: u64) {
        let now = Instant::now();
        let mut samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Timestamps are non-decreasing, so expired samples form a prefix.
        while let Some(front) = samples.front() {
            if now.saturating_duration_since(front.at) > RETENTION {
                samples.pop_front();
            } else {
                break;
            }
        }
        samples.push_back(Sample { amount, at: now });
    }

    /// Sum of amounts recorded less than `window` ago.
    pub fn total_within(&self, window: Duration) -> u64 {
        let now = Instant::now();
        let samples = match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut total = 0u64;
        for sample in samples.iter().rev() {
            if now.saturating_duration_since(sample.at) < window {
                total = total.saturating_add(sample.amount);
            } else {
                break;
            }
        }
        total
    }

    /// Average amount per second over `window`, truncated toward zero.
    /// Windows shorter than a second are treated as one second.
    pub fn query_rate(&self, window: Duration) -> u64 {
        let divisor = window.as_secs().max(1);
        self.total_within(window) / divisor
    }

    pub fn rate(&self, window: RateWindow) -> u64 {
        self.query_rate(window.duration())
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn five_second_window_averages_single_burst() {
        let meter = ThroughputMeter::new();
        meter.record(10);
        for _ in 1..=4 {
            advance(Duration::from_secs(1)).await;
            meter.record(0);
        }
        assert_eq!(meter.rate(RateWindow::FiveSeconds), 2);
        assert_eq!(meter.rate(RateWindow::OneSecond), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_second_window_excludes_sample_exactly_one_second_old() {
        let meter = ThroughputMeter::new();
        meter.record(10);
        assert_eq!(meter.rate(RateWindow::OneSecond), 10);
        advance(Duration::from_secs(1)).await;
        assert_eq!(meter.rate(RateWindow::OneSecond), 0);
        assert_eq!(meter.rate(RateWindow::FiveSeconds), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn longer_windows_divide_by_their_length() {
        let meter = ThroughputMeter::new();
        meter.record(60);
        advance(Duration::from_secs(2)).await;
        assert_eq!(meter.rate(RateWindow::ThirtySeconds), 2);
        assert_eq!(meter.rate(RateWindow::OneMinute), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn record_prunes_samples_older_than_a_minute() {
        let meter = ThroughputMeter::new();
        meter.record(5);
        meter.record(7);
        advance(Duration::from_secs(61)).await;
        meter.record(1);
        assert_eq!(meter.len(), 1);
        assert_eq!(meter.rate(RateWindow::OneMinute), 0);
        assert_eq!(meter.total_within(RateWindow::OneMinute.duration()), 1);
    }

    #[test]
    fn empty_meter_reports_zero() {
        let meter = ThroughputMeter::new();
        for w in RateWindow::ALL {
            assert_eq!(meter.rate(w), 0);
        }
        assert!(meter.is_empty());
    }

    #[test]
    fn window_from_seconds() {
        assert_eq!(RateWindow::from_seconds(30), Some(RateWindow::ThirtySeconds));
        assert_eq!(RateWindow::from_seconds(2), None);
    }
}
