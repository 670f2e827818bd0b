//! Selects the optimal prefix for a pending upload and tracks per-prefix
//! performance (C6).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::balancer::{LoadBalancer, PrefixPerformance};
use crate::config::{CoordinationConfig, LoadBalancerConfig, SchedulingStrategy};
use crate::logging::Logger;
use crate::network::NetworkProfile;
use crate::upload::ScheduledUpload;

const HISTORY_CAP: usize = 20;

/// Live performance snapshot for one prefix, with bounded sample histories.
#[derive(Debug, Clone)]
pub struct PrefixMetrics {
    pub prefix_id: String,
    pub active_uploads: usize,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub congestion_window: usize,
    pub bandwidth_utilization: f64,
    pub queue_length: usize,
    pub processing_capacity: usize,
    pub last_update: Instant,
    pub throughput_history: VecDeque<f64>,
    pub latency_history: VecDeque<f64>,
    pub error_rate_history: VecDeque<f64>,
}

impl PrefixMetrics {
    fn new(prefix_id: String, initial_cwnd: usize, capacity: usize) -> Self {
        Self {
            prefix_id,
            active_uploads: 0,
            throughput_mbps: 0.0,
            latency_ms: 50.0,
            error_rate: 0.0,
            congestion_window: initial_cwnd.max(1),
            bandwidth_utilization: 0.0,
            queue_length: 0,
            processing_capacity: capacity,
            last_update: Instant::now(),
            throughput_history: VecDeque::new(),
            latency_history: VecDeque::new(),
            error_rate_history: VecDeque::new(),
        }
    }

    fn push_history(&mut self) {
        self.throughput_history.push_back(self.throughput_mbps);
        self.latency_history.push_back(self.latency_ms);
        self.error_rate_history.push_back(self.error_rate);
        while self.throughput_history.len() > HISTORY_CAP {
            self.throughput_history.pop_front();
        }
        while self.latency_history.len() > HISTORY_CAP {
            self.latency_history.pop_front();
        }
        while self.error_rate_history.len() > HISTORY_CAP {
            self.error_rate_history.pop_front();
        }
    }

    fn recent_average(history: &VecDeque<f64>, n: usize) -> Option<f64> {
        if history.is_empty() {
            return None;
        }
        let take = n.min(history.len());
        let sum: f64 = history.iter().rev().take(take).sum();
        Some(sum / take as f64)
    }

    fn overall_average(history: &VecDeque<f64>) -> Option<f64> {
        if history.is_empty() {
            None
        } else {
            Some(history.iter().sum::<f64>() / history.len() as f64)
        }
    }
}

/// Aggregate counters across all registered prefixes.
#[derive(Debug, Clone, Default)]
pub struct GlobalState {
    pub active_prefixes: HashSet<String>,
    pub total_in_flight: usize,
    pub global_throughput_mbps: f64,
    pub global_error_rate: f64,
    pub load_balance_efficiency: f64,
}

/// Scheduler-level metrics snapshot returned by `get_metrics`.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    pub global_throughput_mbps: f64,
    pub load_balance_efficiency: f64,
    pub average_queue_length: f64,
    pub network_utilization: f64,
}

struct SchedulerState {
    metrics: HashMap<String, PrefixMetrics>,
    global: GlobalState,
    profile: NetworkProfile,
}

/// Picks the best prefix for a pending upload under the configured
/// strategy, and owns per-prefix `PrefixMetrics` plus the aggregate
/// `GlobalState`. One reader-writer lock guards both; selection takes the
/// read side, updates take the write side.
pub struct Scheduler {
    config: CoordinationConfig,
    global_cwnd: usize,
    state: RwLock<SchedulerState>,
    balancer: LoadBalancer,
    logger: Logger,
    active: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    clock_parity: AtomicU64,
}

impl Scheduler {
    pub fn new(config: CoordinationConfig, logger: Logger) -> Self {
        let global_cwnd = config.global_congestion_window;
        Self {
            config,
            global_cwnd,
            state: RwLock::new(SchedulerState {
                metrics: HashMap::new(),
                global: GlobalState::default(),
                profile: NetworkProfile::new(),
            }),
            balancer: LoadBalancer::new(LoadBalancerConfig::default()),
            logger,
            active: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
            clock_parity: AtomicU64::new(0),
        }
    }

    /// Insert default metrics (latency baseline 50 ms, conservative initial
    /// congestion window of `globalCwnd/4`), register with the load
    /// balancer, and mark the prefix active.
    pub fn register_prefix(&self, id: &str, capacity: usize) {
        let mut state = self.state.write().unwrap();
        let initial_cwnd = (self.global_cwnd / 4).max(1);
        state
            .metrics
            .entry(id.to_string())
            .or_insert_with(|| PrefixMetrics::new(id.to_string(), initial_cwnd, capacity));
        state.global.active_prefixes.insert(id.to_string());
        self.balancer.register_prefix(id, capacity);
        self.logger.verbose(&format!("scheduler: registered prefix {id}"));
    }

    /// `weight_of` the load balancer, for callers that want to bias on it
    /// directly (e.g. a future `select_adaptive` refinement).
    pub fn prefix_weight(&self, id: &str) -> Option<f64> {
        self.balancer.weight_of(id)
    }

    /// Builds a `PrefixPerformance` snapshot per registered prefix and
    /// runs it through the load balancer's throttled rebalance check.
    fn rebalance(&self) {
        let state = self.state.read().unwrap();
        let metrics: HashMap<String, PrefixPerformance> = state
            .metrics
            .values()
            .map(|m| {
                (
                    m.prefix_id.clone(),
                    PrefixPerformance {
                        throughput_mbps: m.throughput_mbps,
                        error_rate: m.error_rate,
                        latency_ms: m.latency_ms,
                        utilization: m.bandwidth_utilization,
                    },
                )
            })
            .collect();
        drop(state);
        if self.balancer.rebalance_if_needed(&metrics) {
            self.logger.verbose("scheduler: rebalanced prefix weights");
        }
    }

    pub fn metrics_snapshot(&self, id: &str) -> Option<PrefixMetrics> {
        self.state.read().unwrap().metrics.get(id).cloned()
    }

    /// `SelectOptimalPrefix`: dispatches to the configured strategy.
    pub fn select_optimal_prefix(&self, upload: &ScheduledUpload) -> Option<String> {
        let state = self.state.read().unwrap();
        if state.metrics.is_empty() {
            return None;
        }
        match self.config.strategy {
            SchedulingStrategy::TcpLike => self.select_tcp_like(&state),
            SchedulingStrategy::FairShare => self.select_fair_share(&state),
            SchedulingStrategy::Adaptive => self.select_adaptive(&state, upload),
        }
    }

    fn tcp_like_scores(&self, state: &SchedulerState) -> Vec<(String, f64)> {
        let estimated_bandwidth = state.profile.estimated_bandwidth.unwrap_or(1.0).max(1e-6);
        state
            .metrics
            .values()
            .map(|m| {
                let cwnd_factor = m.congestion_window as f64 / self.global_cwnd as f64;
                let throughput_factor = m.throughput_mbps / estimated_bandwidth;
                let latency_factor = 1.0 / (1.0 + m.latency_ms / 100.0);
                let error_factor = 1.0 - m.error_rate;
                let load_factor = 1.0 - m.queue_length as f64 / (m.processing_capacity as f64 + 1.0);
                let score = 0.30 * cwnd_factor
                    + 0.25 * throughput_factor
                    + 0.20 * latency_factor
                    + 0.15 * error_factor
                    + 0.10 * load_factor;
                (m.prefix_id.clone(), score)
            })
            .collect()
    }

    fn select_tcp_like(&self, state: &SchedulerState) -> Option<String> {
        let mut scores = self.tcp_like_scores(state);
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if scores.len() >= 2 && (scores[0].1 - scores[1].1).abs() < 0.1 {
            let parity = self.clock_parity.fetch_add(1, Ordering::Relaxed) % 2;
            return Some(scores[parity as usize].0.clone());
        }
        scores.into_iter().next().map(|(id, _)| id)
    }

    fn select_fair_share(&self, state: &SchedulerState) -> Option<String> {
        state
            .metrics
            .values()
            .min_by(|a, b| {
                let score_a = a.bandwidth_utilization
                    + a.queue_length as f64 / a.processing_capacity.max(1) as f64;
                let score_b = b.bandwidth_utilization
                    + b.queue_length as f64 / b.processing_capacity.max(1) as f64;
                score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|m| m.prefix_id.clone())
    }

    fn select_adaptive(&self, state: &SchedulerState, upload: &ScheduledUpload) -> Option<String> {
        let base = self.select_tcp_like(state)?;
        let base_metrics = state.metrics.get(&base)?;

        let base_recent5 = PrefixMetrics::recent_average(&base_metrics.throughput_history, 5);
        let base_overall = PrefixMetrics::overall_average(&base_metrics.throughput_history);

        let mut candidate = base.clone();

        if let (Some(recent5), Some(overall)) = (base_recent5, base_overall)
            && overall > 0.0 && recent5 < 0.7 * overall
                && let Some(alt) = state.metrics.values().find(|m| {
                    m.prefix_id != base
                        && PrefixMetrics::recent_average(&m.throughput_history, 3)
                            .map(|r3| r3 > 1.2 * recent5)
                            .unwrap_or(false)
                        && (m.queue_length as f64) < 0.8 * m.processing_capacity as f64
                }) {
                    candidate = alt.prefix_id.clone();
                }

        if state.profile.confidence > 0.7
            && upload.estimated_size > 1024 * 1024 * 1024
            && state.profile.bandwidth_trend == crate::network::Trend::Increasing
            && let Some(strongest) = state
                .metrics
                .values()
                .filter(|m| {
                    PrefixMetrics::recent_average(&m.throughput_history, 3)
                        .zip(PrefixMetrics::overall_average(&m.throughput_history))
                        .map(|(r, o)| o > 0.0 && r > o)
                        .unwrap_or(false)
                })
                .max_by(|a, b| {
                    let ra = PrefixMetrics::recent_average(&a.throughput_history, 3).unwrap_or(0.0);
                    let rb = PrefixMetrics::recent_average(&b.throughput_history, 3).unwrap_or(0.0);
                    ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
                })
            {
                candidate = strongest.prefix_id.clone();
            }

        if let Some(deadline) = upload.deadline
            && deadline.saturating_duration_since(Instant::now()) < Duration::from_secs(3600)
                && let Some(fastest) = state
                    .metrics
                    .values()
                    .filter(|m| (m.queue_length as f64) < 0.8 * m.processing_capacity as f64)
                    .min_by(|a, b| a.latency_ms.partial_cmp(&b.latency_ms).unwrap())
                {
                    candidate = fastest.prefix_id.clone();
                }

        Some(candidate)
    }

    /// `UpdatePrefixMetrics`: overwrite current values, push to bounded
    /// histories, refresh `GlobalState`, and update the learned
    /// `NetworkProfile`.
    pub fn update_prefix_metrics(&self, id: &str, update: PrefixMetricsUpdate) {
        let mut state = self.state.write().unwrap();
        if let Some(m) = state.metrics.get_mut(id) {
            m.active_uploads = update.active_uploads;
            m.throughput_mbps = update.throughput_mbps;
            m.latency_ms = update.latency_ms;
            m.error_rate = update.error_rate;
            m.congestion_window = update.congestion_window;
            m.bandwidth_utilization = update.bandwidth_utilization;
            m.queue_length = update.queue_length;
            m.last_update = Instant::now();
            m.push_history();
        }

        let total_in_flight: usize = state.metrics.values().map(|m| m.active_uploads).sum();
        let global_throughput: f64 = state.metrics.values().map(|m| m.throughput_mbps).sum();
        let global_error_rate = if state.metrics.is_empty() {
            0.0
        } else {
            state.metrics.values().map(|m| m.error_rate).sum::<f64>() / state.metrics.len() as f64
        };
        state.global.total_in_flight = total_in_flight;
        state.global.global_throughput_mbps = global_throughput;
        state.global.global_error_rate = global_error_rate;

        let utilizations: Vec<f64> = state.metrics.values().map(|m| m.bandwidth_utilization).collect();
        state.global.load_balance_efficiency = load_balance_efficiency(&utilizations);

        state.profile.observe(update.throughput_mbps, update.latency_ms);

        let all_recent: Vec<f64> = state
            .metrics
            .values()
            .filter_map(|m| PrefixMetrics::recent_average(&m.throughput_history, 3))
            .collect();
        let all_overall: Vec<f64> = state
            .metrics
            .values()
            .filter_map(|m| PrefixMetrics::overall_average(&m.throughput_history))
            .collect();
        if !all_recent.is_empty() && !all_overall.is_empty() {
            let recent_avg = all_recent.iter().sum::<f64>() / all_recent.len() as f64;
            let overall_avg = all_overall.iter().sum::<f64>() / all_overall.len() as f64;
            state.profile.recompute_trend(recent_avg, overall_avg);
        }
    }

    pub fn get_metrics(&self) -> SchedulerMetrics {
        let state = self.state.read().unwrap();
        let utilizations: Vec<f64> = state.metrics.values().map(|m| m.bandwidth_utilization).collect();
        let average_queue_length = if state.metrics.is_empty() {
            0.0
        } else {
            state.metrics.values().map(|m| m.queue_length as f64).sum::<f64>()
                / state.metrics.len() as f64
        };
        let estimated_bandwidth = state.profile.estimated_bandwidth.unwrap_or(0.0);
        let network_utilization = if estimated_bandwidth > 0.0 {
            (state.global.global_throughput_mbps / estimated_bandwidth).min(1.0)
        } else {
            0.0
        };

        SchedulerMetrics {
            global_throughput_mbps: state.global.global_throughput_mbps,
            load_balance_efficiency: load_balance_efficiency(&utilizations),
            average_queue_length,
            network_utilization,
        }
    }

    pub fn global_state(&self) -> GlobalState {
        self.state.read().unwrap().global.clone()
    }

    pub fn network_profile(&self) -> NetworkProfile {
        self.state.read().unwrap().profile.clone()
    }

    /// Launches the scheduling (2s), metrics-collection (5s), and
    /// adaptive-optimization (10s) background loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();

        let scheduling = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            while scheduling.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                scheduling.rebalance();
            }
        }));

        let metrics_loop = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            while metrics_loop.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                metrics_loop.adjust_congestion_windows();
            }
        }));

        let adaptive = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            while adaptive.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                adaptive.raise_confidence();
            }
        }));
    }

    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Reduce congestion windows by 20% when `errorRate > 5%`, grow by 10%
    /// when `errorRate < 1%` and `utilization < 80%`, clamped to
    /// `[1, globalCwnd]`.
    fn adjust_congestion_windows(&self) {
        let mut state = self.state.write().unwrap();
        let global_cwnd = self.global_cwnd;
        for m in state.metrics.values_mut() {
            if m.error_rate > 0.05 {
                m.congestion_window =
                    ((m.congestion_window as f64 * 0.8).floor() as usize).clamp(1, global_cwnd);
            } else if m.error_rate < 0.01 && m.bandwidth_utilization < 0.8 {
                m.congestion_window =
                    ((m.congestion_window as f64 * 1.1).ceil() as usize).clamp(1, global_cwnd);
            }
        }
    }

    fn raise_confidence(&self) {
        let mut state = self.state.write().unwrap();
        state.profile.confidence = (state.profile.confidence + 0.01).min(1.0);
    }
}

fn load_balance_efficiency(utilizations: &[f64]) -> f64 {
    if utilizations.is_empty() {
        return 1.0;
    }
    let mean = utilizations.iter().sum::<f64>() / utilizations.len() as f64;
    let variance =
        utilizations.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / utilizations.len() as f64;
    (1.0 / (1.0 + variance)).min(1.0)
}

/// The subset of `PrefixMetrics` fields a caller reports after observing an
/// upload outcome; histories and derived state are maintained internally.
#[derive(Debug, Clone, Copy)]
pub struct PrefixMetricsUpdate {
    pub active_uploads: usize,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub congestion_window: usize,
    pub bandwidth_utilization: f64,
    pub queue_length: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;

    fn upload(prefix: Option<&str>, estimated_size: u64) -> ScheduledUpload {
        let archive = Archive::new("k", estimated_size, "application/octet-stream");
        let mut su = ScheduledUpload::new(archive);
        su.assigned_prefix = prefix.map(|s| s.to_string());
        su.estimated_size = estimated_size;
        su
    }

    fn update(throughput: f64, latency: f64, error_rate: f64) -> PrefixMetricsUpdate {
        PrefixMetricsUpdate {
            active_uploads: 1,
            throughput_mbps: throughput,
            latency_ms: latency,
            error_rate,
            congestion_window: 10,
            bandwidth_utilization: 0.5,
            queue_length: 0,
        }
    }

    #[test]
    fn tcp_like_prefers_higher_throughput_lower_latency() {
        let scheduler = Scheduler::new(CoordinationConfig::default().with_strategy(SchedulingStrategy::TcpLike), Logger::silent());
        scheduler.register_prefix("p1", 10);
        scheduler.register_prefix("p2", 10);

        scheduler.update_prefix_metrics("p1", update(50.0, 100.0, 0.01));
        scheduler.update_prefix_metrics("p2", update(80.0, 50.0, 0.001));

        let selected = scheduler.select_optimal_prefix(&upload(None, 10));
        assert_eq!(selected, Some("p2".to_string()));
    }

    #[test]
    fn histories_are_bounded_to_twenty() {
        let scheduler = Scheduler::new(CoordinationConfig::default(), Logger::silent());
        scheduler.register_prefix("p1", 10);
        for i in 0..30 {
            scheduler.update_prefix_metrics("p1", update(i as f64, 10.0, 0.0));
        }
        let snapshot = scheduler.metrics_snapshot("p1").unwrap();
        assert_eq!(snapshot.throughput_history.len(), 20);
    }

    #[test]
    fn register_prefix_is_visible_to_the_load_balancer() {
        let scheduler = Scheduler::new(CoordinationConfig::default(), Logger::silent());
        assert_eq!(scheduler.prefix_weight("p1"), None);
        scheduler.register_prefix("p1", 10);
        assert_eq!(scheduler.prefix_weight("p1"), Some(1.0));
    }

    #[test]
    fn global_state_aggregates_across_prefixes() {
        let scheduler = Scheduler::new(CoordinationConfig::default(), Logger::silent());
        scheduler.register_prefix("p1", 10);
        scheduler.register_prefix("p2", 10);
        scheduler.update_prefix_metrics("p1", update(10.0, 10.0, 0.0));
        scheduler.update_prefix_metrics("p2", update(20.0, 10.0, 0.0));

        let global = scheduler.global_state();
        assert_eq!(global.active_prefixes.len(), 2);
        assert!((global.global_throughput_mbps - 30.0).abs() < 1e-9);
    }

    #[test]
    fn empty_scheduler_selects_nothing() {
        let scheduler = Scheduler::new(CoordinationConfig::default(), Logger::silent());
        assert_eq!(scheduler.select_optimal_prefix(&upload(None, 10)), None);
    }
}
