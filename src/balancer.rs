//! Per-prefix weight/capacity assignment and rebalance triggering (C5).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::LoadBalancerConfig;

#[derive(Debug, Clone, Copy)]
pub struct PrefixWeight {
    pub weight: f64,
    pub capacity: usize,
}

#[derive(Debug)]
struct BalancerState {
    weights: HashMap<String, PrefixWeight>,
    last_rebalance: Option<Instant>,
}

/// Assigns a clamped weight to each registered prefix and decides when the
/// spread across prefixes warrants a rebalance.
#[derive(Debug)]
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    state: Mutex<BalancerState>,
}

/// A per-prefix `(throughput MB/s, error rate, latency ms, utilization)`
/// input to `rebalance_if_needed`.
#[derive(Debug, Clone, Copy)]
pub struct PrefixPerformance {
    pub throughput_mbps: f64,
    pub error_rate: f64,
    pub latency_ms: f64,
    pub utilization: f64,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BalancerState {
                weights: HashMap::new(),
                last_rebalance: None,
            }),
        }
    }

    pub fn register_prefix(&self, id: &str, capacity: usize) {
        let mut state = self.state.lock().unwrap();
        state.weights.entry(id.to_string()).or_insert(PrefixWeight {
            weight: 1.0,
            capacity,
        });
    }

    pub fn weight_of(&self, id: &str) -> Option<f64> {
        self.state.lock().unwrap().weights.get(id).map(|w| w.weight)
    }

    /// Runs at most every `rebalance_interval`. Triggers when the
    /// coefficient of variation of utilizations across prefixes exceeds
    /// `rebalance_threshold`, adjusting each prefix's weight by its
    /// performance score.
    pub fn rebalance_if_needed(&self, metrics: &HashMap<String, PrefixPerformance>) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = state.last_rebalance
            && now.duration_since(last) < self.config.rebalance_interval {
                return false;
            }

        if metrics.len() < 2 {
            state.last_rebalance = Some(now);
            return false;
        }

        let utilizations: Vec<f64> = metrics.values().map(|p| p.utilization).collect();
        let mean = utilizations.iter().sum::<f64>() / utilizations.len() as f64;
        if mean <= 0.0 {
            state.last_rebalance = Some(now);
            return false;
        }
        let variance = utilizations.iter().map(|u| (u - mean).powi(2)).sum::<f64>()
            / utilizations.len() as f64;
        let cv = variance.sqrt() / mean;

        if cv <= self.config.rebalance_threshold {
            state.last_rebalance = Some(now);
            return false;
        }

        for (id, perf) in metrics {
            let entry = state.weights.entry(id.clone()).or_insert(PrefixWeight {
                weight: 1.0,
                capacity: 0,
            });
            let score =
                perf.throughput_mbps / (1.0 + perf.error_rate + perf.latency_ms / 100.0);
            entry.weight = (entry.weight * (1.0 + 0.1 * score))
                .clamp(self.config.min_weight, self.config.max_weight);
        }

        state.last_rebalance = Some(now);
        true
    }

    pub fn rebalance_interval(&self) -> Duration {
        self.config.rebalance_interval
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf(throughput: f64, error_rate: f64, latency: f64, utilization: f64) -> PrefixPerformance {
        PrefixPerformance {
            throughput_mbps: throughput,
            error_rate,
            latency_ms: latency,
            utilization,
        }
    }

    #[test]
    fn weight_starts_at_one_and_is_clamped() {
        let balancer = LoadBalancer::default();
        balancer.register_prefix("p1", 10);
        assert_eq!(balancer.weight_of("p1"), Some(1.0));
    }

    #[test]
    fn skewed_utilization_triggers_rebalance_and_raises_weight() {
        let config = LoadBalancerConfig {
            rebalance_interval: Duration::from_secs(0),
            ..LoadBalancerConfig::default()
        };
        let balancer = LoadBalancer::new(config);
        balancer.register_prefix("p1", 10);
        balancer.register_prefix("p2", 10);

        let mut metrics = HashMap::new();
        metrics.insert("p1".to_string(), perf(80.0, 0.0, 10.0, 0.9));
        metrics.insert("p2".to_string(), perf(10.0, 0.0, 10.0, 0.1));

        let rebalanced = balancer.rebalance_if_needed(&metrics);
        assert!(rebalanced);
        assert!(balancer.weight_of("p1").unwrap() > 1.0);
    }

    #[test]
    fn uniform_utilization_does_not_trigger() {
        let config = LoadBalancerConfig {
            rebalance_interval: Duration::from_secs(0),
            ..LoadBalancerConfig::default()
        };
        let balancer = LoadBalancer::new(config);
        balancer.register_prefix("p1", 10);
        balancer.register_prefix("p2", 10);

        let mut metrics = HashMap::new();
        metrics.insert("p1".to_string(), perf(50.0, 0.0, 10.0, 0.5));
        metrics.insert("p2".to_string(), perf(50.0, 0.0, 10.0, 0.5));

        assert!(!balancer.rebalance_if_needed(&metrics));
    }

    #[test]
    fn respects_rebalance_interval() {
        let balancer = LoadBalancer::default();
        balancer.register_prefix("p1", 10);
        balancer.register_prefix("p2", 10);

        let mut metrics = HashMap::new();
        metrics.insert("p1".to_string(), perf(80.0, 0.0, 10.0, 0.9));
        metrics.insert("p2".to_string(), perf(10.0, 0.0, 10.0, 0.1));

        assert!(balancer.rebalance_if_needed(&metrics));
        // Second call immediately after should be throttled by the interval.
        assert!(!balancer.rebalance_if_needed(&metrics));
    }
}
