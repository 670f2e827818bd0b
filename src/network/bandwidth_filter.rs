//! Windowed maximum-bandwidth estimator (C1).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::BandwidthSample;

#[derive(Debug)]
struct FilterState {
    samples: VecDeque<BandwidthSample>,
    current_max: f64,
}

/// A time-windowed maximum-bandwidth estimator, matching BBR-style max
/// bandwidth filtering: it retains samples within `max_window` and reports
/// the maximum `mbps` value still present.
#[derive(Debug)]
pub struct BandwidthFilter {
    max_window: Duration,
    state: Mutex<FilterState>,
}

impl BandwidthFilter {
    pub fn new(max_window: Duration) -> Self {
        Self {
            max_window,
            state: Mutex::new(FilterState {
                samples: VecDeque::new(),
                current_max: 0.0,
            }),
        }
    }

    /// Default window of 10 seconds, per §3.
    pub fn with_default_window() -> Self {
        Self::new(Duration::from_secs(10))
    }

    /// Append a sample, evict anything older than `max_window`, and
    /// recompute the current maximum.
    pub fn add_sample(&self, timestamp: Instant, mbps: f64, rtt_ms: f64, in_flight: usize) {
        let mut state = self.state.lock().unwrap();
        state.samples.push_back(BandwidthSample {
            timestamp,
            mbps,
            rtt_ms,
            in_flight,
        });

        let cutoff = timestamp.checked_sub(self.max_window);
        if let Some(cutoff) = cutoff {
            while let Some(front) = state.samples.front() {
                if front.timestamp < cutoff {
                    state.samples.pop_front();
                } else {
                    break;
                }
            }
        }

        state.current_max = state
            .samples
            .iter()
            .map(|s| s.mbps)
            .fold(0.0_f64, f64::max);
    }

    /// The maximum bandwidth among samples still within the window, or 0 if
    /// the window is empty.
    pub fn get_max_bandwidth(&self) -> f64 {
        self.state.lock().unwrap().current_max
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().unwrap().samples.len()
    }
}

impl Default for BandwidthFilter {
    fn default() -> Self {
        Self::with_default_window()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_bandwidth_within_window() {
        let filter = BandwidthFilter::new(Duration::from_millis(100));
        let now = Instant::now();
        filter.add_sample(now - Duration::from_secs(1), 100.0, 20.0, 1);
        filter.add_sample(now, 50.0, 20.0, 1);
        assert_eq!(filter.get_max_bandwidth(), 50.0);
    }

    #[test]
    fn empty_window_reports_zero() {
        let filter = BandwidthFilter::with_default_window();
        assert_eq!(filter.get_max_bandwidth(), 0.0);
    }

    #[test]
    fn keeps_max_while_in_window() {
        let filter = BandwidthFilter::new(Duration::from_secs(10));
        let now = Instant::now();
        filter.add_sample(now, 10.0, 20.0, 1);
        filter.add_sample(now, 90.0, 20.0, 1);
        filter.add_sample(now, 30.0, 20.0, 1);
        assert_eq!(filter.get_max_bandwidth(), 90.0);
    }
}
