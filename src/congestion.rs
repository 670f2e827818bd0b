//! Global and per-prefix window/bandwidth allocation with a TCP-like FSM
//! (C7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::CongestionConfig;
use crate::error::{CoordinationError, Result};
use crate::logging::Logger;
use crate::upload::ScheduledUpload;

/// The global FSM tag (§3). Initial state is `SlowStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    Avoidance,
    Recovery,
    FastRecovery,
}

/// Current resource allocation held for one prefix.
#[derive(Debug, Clone)]
pub struct PrefixAllocation {
    pub prefix_id: String,
    pub allocated_bandwidth_mbps: f64,
    pub congestion_window: usize,
    pub in_flight: usize,
    pub utilization: f64,
    pub priority: u8,
    pub last_adjustment: Instant,
}

impl PrefixAllocation {
    fn new(prefix_id: String, cwnd: usize) -> Self {
        Self {
            prefix_id,
            allocated_bandwidth_mbps: 0.0,
            congestion_window: cwnd,
            in_flight: 0,
            utilization: 0.0,
            priority: 3,
            last_adjustment: Instant::now(),
        }
    }
}

fn priority_factor(priority: u8) -> f64 {
    match priority {
        1 => 0.5,
        2 => 0.75,
        3 => 1.0,
        4 => 1.25,
        5 => 1.5,
        _ => 1.0,
    }
}

struct ControllerState {
    allocations: HashMap<String, PrefixAllocation>,
    global_cwnd: usize,
    slow_start_threshold: usize,
    total_bandwidth_mbps: f64,
    congestion_state: CongestionState,
    last_congestion_event: Option<Instant>,
    last_idle_since: Option<Instant>,
    learning_rate: f64,
    congestion_sensitivity: f64,
    recent_events: Vec<Instant>,
}

/// Per-prefix allocation plus the global TCP-like congestion FSM.
pub struct CongestionController {
    config: CongestionConfig,
    state: RwLock<ControllerState>,
    logger: Logger,
    active: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CongestionController {
    pub fn new(config: CongestionConfig, logger: Logger) -> Self {
        let global_cwnd = config.initial_global_cwnd;
        Self {
            state: RwLock::new(ControllerState {
                allocations: HashMap::new(),
                global_cwnd,
                slow_start_threshold: (global_cwnd / 2).max(2),
                total_bandwidth_mbps: 0.0,
                congestion_state: CongestionState::SlowStart,
                last_congestion_event: None,
                last_idle_since: Some(Instant::now()),
                learning_rate: 0.01,
                congestion_sensitivity: 0.3,
                recent_events: Vec::new(),
            }),
            config,
            logger,
            active: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn register_prefix(&self, id: &str) {
        let mut state = self.state.write().unwrap();
        let cwnd = state.global_cwnd;
        state
            .allocations
            .entry(id.to_string())
            .or_insert_with(|| PrefixAllocation::new(id.to_string(), (cwnd / 4).max(1)));
    }

    pub fn allocation(&self, id: &str) -> Option<PrefixAllocation> {
        self.state.read().unwrap().allocations.get(id).cloned()
    }

    /// `AllocateResources`: window-full returns an exponential backoff with
    /// jitter; otherwise bumps `in_flight` and applies the priority factor
    /// to allocated bandwidth.
    pub fn allocate_resources(&self, prefix_id: &str, upload: &ScheduledUpload) -> Result<PrefixAllocation> {
        let mut state = self.state.write().unwrap();
        let cwnd = state.allocations.get(prefix_id).map(|a| a.congestion_window);
        let cwnd = cwnd.ok_or_else(|| CoordinationError::PrefixNotRegistered {
            prefix_id: prefix_id.to_string(),
            message: "prefix has no congestion allocation".to_string(),
        })?;

        let allocation = state.allocations.get_mut(prefix_id).unwrap();

        if allocation.in_flight >= cwnd {
            let excess = allocation.in_flight - cwnd;
            let base = Duration::from_millis(100);
            let backoff = exponential_backoff(base, excess, Duration::from_secs(30));
            return Err(CoordinationError::CongestionWindowFull {
                prefix_id: prefix_id.to_string(),
                backoff,
            });
        }

        allocation.in_flight += 1;
        allocation.allocated_bandwidth_mbps =
            allocation.allocated_bandwidth_mbps.max(1.0) * priority_factor(upload.priority);
        allocation.priority = upload.priority;
        allocation.utilization = allocation.in_flight as f64 / cwnd.max(1) as f64;

        Ok(allocation.clone())
    }

    pub fn release(&self, prefix_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(allocation) = state.allocations.get_mut(prefix_id) {
            allocation.in_flight = allocation.in_flight.saturating_sub(1);
        }
    }

    /// `UpdatePrefixPerformance`: drive the FSM from the observed error rate,
    /// then apply the timeout and bandwidth-starvation detectors.
    pub fn update_prefix_performance(
        &self,
        prefix_id: &str,
        throughput_mbps: f64,
        latency_ms: f64,
        error_rate: f64,
        utilization: f64,
    ) {
        let mut state = self.state.write().unwrap();

        state.total_bandwidth_mbps = if state.total_bandwidth_mbps == 0.0 {
            throughput_mbps
        } else {
            0.1 * throughput_mbps + 0.9 * state.total_bandwidth_mbps
        };

        self.drive_fsm(&mut state, error_rate, utilization);

        if latency_ms > 1000.0 {
            self.timeout_detected(&mut state, prefix_id);
        }

        if let Some(allocation) = state.allocations.get(prefix_id) {
            let allocated = allocation.allocated_bandwidth_mbps;
            if allocated > 0.0 && throughput_mbps < 0.5 * allocated {
                self.starvation_detected(&mut state, prefix_id);
            }
        }

        if let Some(allocation) = state.allocations.get_mut(prefix_id) {
            allocation.utilization = utilization;
            allocation.last_adjustment = Instant::now();
        }

        self.retune_parameters(&mut state);
    }

    fn drive_fsm(&self, state: &mut ControllerState, error_rate: f64, _utilization: f64) {
        match state.congestion_state {
            CongestionState::SlowStart => {
                if error_rate < 0.01 {
                    let ssthresh = state.slow_start_threshold;
                    state.global_cwnd = ((state.global_cwnd as f64 * 1.5) as usize).min(ssthresh).max(1);
                    self.scale_bandwidth(state, 1.2);
                    if state.global_cwnd >= ssthresh {
                        state.congestion_state = CongestionState::Avoidance;
                    }
                } else {
                    self.handle_congestion(state);
                }
            }
            CongestionState::Avoidance => {
                if error_rate < 0.01 {
                    state.global_cwnd += 1;
                    self.scale_bandwidth(state, 1.05);
                } else {
                    self.handle_congestion(state);
                }
            }
            CongestionState::Recovery => {
                if error_rate < 0.005 {
                    state.global_cwnd = ((state.global_cwnd as f64 * 1.1) as usize).max(1);
                    self.scale_bandwidth(state, 1.02);
                    let elapsed_ok = state
                        .last_congestion_event
                        .map(|t| t.elapsed() > Duration::from_secs(60))
                        .unwrap_or(true);
                    if elapsed_ok {
                        state.congestion_state = CongestionState::Avoidance;
                    }
                } else if error_rate > 0.02 {
                    self.handle_congestion(state);
                }
            }
            CongestionState::FastRecovery => {
                if error_rate < 0.005 {
                    state.global_cwnd = state.slow_start_threshold;
                    state.congestion_state = CongestionState::Avoidance;
                } else {
                    state.global_cwnd = (state.global_cwnd.saturating_sub(1)).max(1);
                    self.scale_bandwidth(state, 0.95);
                }
            }
        }
        let clamped = state
            .global_cwnd
            .clamp(self.config.min_cwnd, self.config.max_cwnd);
        state.global_cwnd = clamped;
    }

    /// Congestion handling (multiplicative decrease): `ssthresh =
    /// max(cwnd/2, 2)`, `cwnd = ssthresh`, bandwidth ×0.7; FastRecovery when
    /// utilization > 0.6 and the last event was > 5 min ago, else Recovery.
    fn handle_congestion(&self, state: &mut ControllerState) {
        state.slow_start_threshold = (state.global_cwnd / 2).max(2);
        state.global_cwnd = state.slow_start_threshold;
        self.scale_bandwidth(state, 0.7);

        let avg_utilization = if state.allocations.is_empty() {
            0.0
        } else {
            state.allocations.values().map(|a| a.utilization).sum::<f64>()
                / state.allocations.len() as f64
        };
        let long_since_last = state
            .last_congestion_event
            .map(|t| t.elapsed() > Duration::from_secs(300))
            .unwrap_or(true);

        state.congestion_state = if avg_utilization > 0.6 && long_since_last {
            CongestionState::FastRecovery
        } else {
            CongestionState::Recovery
        };

        let now = Instant::now();
        state.last_congestion_event = Some(now);
        state.recent_events.push(now);
        state
            .recent_events
            .retain(|t| t.elapsed() < Duration::from_secs(600));

        self.logger.verbose(&format!(
            "congestion detected: cwnd -> {}, state -> {:?}",
            state.global_cwnd, state.congestion_state
        ));
    }

    fn timeout_detected(&self, state: &mut ControllerState, prefix_id: &str) {
        if let Some(allocation) = state.allocations.get_mut(prefix_id) {
            allocation.congestion_window = (allocation.congestion_window / 4).max(1);
            allocation.allocated_bandwidth_mbps *= 0.5;
        }
        state.congestion_state = CongestionState::Recovery;
    }

    fn starvation_detected(&self, state: &mut ControllerState, prefix_id: &str) {
        if let Some(allocation) = state.allocations.get_mut(prefix_id) {
            allocation.congestion_window = ((2 * allocation.congestion_window) / 3).max(1);
            allocation.allocated_bandwidth_mbps *= 0.8;
        }
    }

    fn scale_bandwidth(&self, state: &mut ControllerState, factor: f64) {
        state.total_bandwidth_mbps *= factor;
    }

    fn retune_parameters(&self, state: &mut ControllerState) {
        let stability = system_stability(&state.recent_events);
        state.learning_rate = if stability > 0.8 { 0.2 } else { 0.01 };

        let window = Duration::from_secs(600);
        let recent_frequency = state
            .recent_events
            .iter()
            .filter(|t| t.elapsed() < window)
            .count() as f64
            / window.as_secs_f64().max(1.0);
        state.congestion_sensitivity = if recent_frequency > 0.1 { 1.0 } else { 0.3 };
    }

    /// Rebalance allocations every cycle once the system has been stable
    /// for > 5 minutes: base share `totalBandwidth / |prefixes|`, times
    /// priority multiplier, times `(1 + 0.2·utilization)`.
    pub fn rebalance(&self) {
        let mut state = self.state.write().unwrap();
        if state.allocations.is_empty() {
            return;
        }
        let stable_long_enough = state
            .last_congestion_event
            .map(|t| t.elapsed() > Duration::from_secs(300))
            .unwrap_or(true);
        if !stable_long_enough {
            return;
        }

        let count = state.allocations.len() as f64;
        let total = state.total_bandwidth_mbps;
        for allocation in state.allocations.values_mut() {
            let base = total / count;
            allocation.allocated_bandwidth_mbps =
                base * priority_factor(allocation.priority) * (1.0 + 0.2 * allocation.utilization);
        }
    }

    pub fn congestion_state(&self) -> CongestionState {
        self.state.read().unwrap().congestion_state
    }

    pub fn global_cwnd(&self) -> usize {
        self.state.read().unwrap().global_cwnd
    }

    pub fn slow_start_threshold(&self) -> usize {
        self.state.read().unwrap().slow_start_threshold
    }

    pub fn learning_rate(&self) -> f64 {
        self.state.read().unwrap().learning_rate
    }

    pub fn congestion_sensitivity(&self) -> f64 {
        self.state.read().unwrap().congestion_sensitivity
    }

    /// Launches control (2s), bandwidth probing (`CycleLength`, BBR-enabled
    /// only), and adaptive recovery (10s) background loops. Idempotent.
    pub fn start(self: &Arc<Self>, bandwidth_filter: Arc<crate::network::BandwidthFilter>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();

        let control = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            while control.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                control.rebalance();
            }
        }));

        if self.config.enable_bbr_probing {
            let probing = Arc::clone(self);
            let filter = bandwidth_filter;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(probing.config.cycle_length);
                while probing.active.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    probing.probe_bandwidth(filter.get_max_bandwidth());
                }
            }));
        }

        let recovery = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            while recovery.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                recovery.adaptive_recovery();
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

    fn probe_bandwidth(&self, current_max: f64) {
        let mut state = self.state.write().unwrap();
        if let Some((_, allocation)) = state
            .allocations
            .iter_mut()
            .min_by(|a, b| a.1.utilization.partial_cmp(&b.1.utilization).unwrap())
        {
            allocation.allocated_bandwidth_mbps += current_max * self.config.probing_rate;
        }
    }

    fn adaptive_recovery(&self) {
        let mut state = self.state.write().unwrap();
        if state.congestion_state != CongestionState::Recovery {
            return;
        }
        let idle_long_enough = state
            .last_idle_since
            .map(|t| t.elapsed() > Duration::from_secs(120))
            .unwrap_or(false);
        let avg_utilization = if state.allocations.is_empty() {
            0.0
        } else {
            state.allocations.values().map(|a| a.utilization).sum::<f64>()
                / state.allocations.len() as f64
        };
        if idle_long_enough && avg_utilization < 0.7 {
            for allocation in state.allocations.values_mut() {
                allocation.congestion_window =
                    ((allocation.congestion_window as f64 * 1.2) as usize).max(1);
                allocation.allocated_bandwidth_mbps *= 1.1;
            }
        }
    }
}

fn exponential_backoff(base: Duration, excess: usize, cap: Duration) -> Duration {
    let multiplier = 2_f64.powi(excess as i32);
    let raw = base.mul_f64(multiplier).min(cap);
    let mut rng = rand::thread_rng();
    let jitter: f64 = rng.gen_range(-0.25..=0.25);
    raw.mul_f64((1.0 + jitter).max(0.0))
}

fn system_stability(recent_events: &[Instant]) -> f64 {
    if recent_events.len() < 2 {
        return 1.0;
    }
    let gaps: Vec<f64> = recent_events
        .windows(2)
        .map(|w| w[1].duration_since(w[0]).as_secs_f64())
        .collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
    (1.0 / (1.0 + variance)).clamp(0.0, 1.0)
}
