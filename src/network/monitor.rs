//! Rolling bandwidth/latency monitor over the last N samples (C2).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// A single observed transfer outcome.
#[derive(Debug, Clone, Copy)]
pub struct NetworkSample {
    pub timestamp: Instant,
    pub mbps: f64,
    pub latency_ms: f64,
    pub chunk_size: u64,
    pub success: bool,
}

/// Classification of the current network condition, from the rolling
/// averages in `NetworkMonitor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCondition {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkCondition {
    /// `<1 poor, <5 fair, <25 good, >=25 excellent` (MB/s), per §4.2.
    pub fn from_mbps(mbps: f64) -> Self {
        if mbps < 1.0 {
            NetworkCondition::Poor
        } else if mbps < 5.0 {
            NetworkCondition::Fair
        } else if mbps < 25.0 {
            NetworkCondition::Good
        } else {
            NetworkCondition::Excellent
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    samples: VecDeque<NetworkSample>,
    avg_bandwidth: Option<f64>,
    avg_latency: Option<f64>,
}

/// Keeps the last `max_samples` network samples and recomputes rolling
/// averages over the successful ones on every insert.
#[derive(Debug)]
pub struct NetworkMonitor {
    max_samples: usize,
    state: Mutex<MonitorState>,
}

impl NetworkMonitor {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            state: Mutex::new(MonitorState {
                samples: VecDeque::new(),
                avg_bandwidth: None,
                avg_latency: None,
            }),
        }
    }

    /// Default of 10 samples, per §4.2.
    pub fn with_default_capacity() -> Self {
        Self::new(10)
    }

    pub fn record_sample(&self, sample: NetworkSample) {
        let mut state = self.state.lock().unwrap();
        state.samples.push_back(sample);
        while state.samples.len() > self.max_samples {
            state.samples.pop_front();
        }

        if sample.success {
            let successful: Vec<NetworkSample> =
                state.samples.iter().filter(|s| s.success).copied().collect();
            if successful.is_empty() {
                state.avg_bandwidth = None;
                state.avg_latency = None;
            } else {
                let n = successful.len() as f64;
                state.avg_bandwidth = Some(successful.iter().map(|s| s.mbps).sum::<f64>() / n);
                state.avg_latency =
                    Some(successful.iter().map(|s| s.latency_ms).sum::<f64>() / n);
            }
        }
    }

    pub fn get_average_bandwidth(&self) -> Option<f64> {
        self.state.lock().unwrap().avg_bandwidth
    }

    pub fn get_average_latency(&self) -> Option<f64> {
        self.state.lock().unwrap().avg_latency
    }

    pub fn get_network_condition(&self) -> Option<NetworkCondition> {
        self.get_average_bandwidth().map(NetworkCondition::from_mbps)
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().unwrap().samples.len()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
