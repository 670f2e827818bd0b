//! Lifecycle, per-prefix channels, and end-to-end schedule+allocate
//! composition of the scheduler and congestion controller (C8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CoordinationConfig;
use crate::congestion::CongestionController;
use crate::error::{CoordinationError, Result};
use crate::logging::Logger;
use crate::network::BandwidthFilter;
use crate::scheduler::{PrefixMetricsUpdate, Scheduler};
use crate::upload::ScheduledUpload;

/// Rolled-up metrics exposed by `get_metrics`.
#[derive(Debug, Clone)]
pub struct CoordinationMetrics {
    pub active_prefixes: usize,
    pub global_throughput_mbps: f64,
    pub load_balance_efficiency: f64,
    pub coordination_overhead: f64,
    pub congestion_events: u64,
    pub improvement_factor: Option<f64>,
}

struct Baseline {
    throughput_mbps: f64,
}

/// Owns a bounded channel per prefix and composes the scheduler (C6) and
/// congestion controller (C7) into a single schedule+allocate+dispatch
/// surface.
pub struct PipelineCoordinator {
    config: CoordinationConfig,
    scheduler: Arc<Scheduler>,
    congestion: Arc<CongestionController>,
    bandwidth_filter: Arc<BandwidthFilter>,
    channels: Mutex<HashMap<String, mpsc::Sender<ScheduledUpload>>>,
    receivers: Mutex<HashMap<String, mpsc::Receiver<ScheduledUpload>>>,
    active: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
    congestion_event_count: std::sync::atomic::AtomicU64,
    baseline: Mutex<Option<Baseline>>,
}

impl PipelineCoordinator {
    pub fn new(config: CoordinationConfig, logger: Logger) -> Self {
        let congestion_config = crate::config::CongestionConfig {
            initial_global_cwnd: config.global_congestion_window,
            ..crate::config::CongestionConfig::default()
        };
        Self {
            scheduler: Arc::new(Scheduler::new(config.clone(), logger.clone())),
            congestion: Arc::new(CongestionController::new(congestion_config, logger.clone())),
            bandwidth_filter: Arc::new(BandwidthFilter::with_default_window()),
            channels: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            active: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            logger,
            congestion_event_count: std::sync::atomic::AtomicU64::new(0),
            baseline: Mutex::new(None),
            config,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Idempotent. Launches the scheduler, congestion controller, and the
    /// metrics-rollup loop (`UpdateInterval`, default 2s).
    pub fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.start();
        self.congestion.start(Arc::clone(&self.bandwidth_filter));

        let rollup = Arc::clone(self);
        let interval = self.config.update_interval;
        self.tasks.lock().unwrap().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while rollup.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                // Metrics are derived on demand in get_metrics(); this tick
                // exists so future rollup work has a natural home.
            }
        }));

        self.logger.info("coordinator started");
    }

    /// Idempotent. Closes all prefix channels; subsequent calls are no-ops.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.stop();
        self.congestion.stop();
        self.channels.lock().unwrap().clear();
        self.receivers.lock().unwrap().clear();
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
        self.logger.info("coordinator stopped");
    }

    pub fn register_prefix(&self, id: &str, capacity: usize) -> Result<()> {
        if !self.is_active() {
            return Err(CoordinationError::CoordinatorInactive(
                "cannot register prefix before start()".to_string(),
            ));
        }
        self.scheduler.register_prefix(id, capacity);
        self.congestion.register_prefix(id);
        let (tx, rx) = mpsc::channel(self.config.pipeline_depth);
        self.channels.lock().unwrap().insert(id.to_string(), tx);
        self.receivers.lock().unwrap().insert(id.to_string(), rx);
        Ok(())
    }

    /// Hands the dispatcher the receiving half of a prefix's channel. Each
    /// prefix's receiver can only be taken once.
    pub fn take_receiver(&self, prefix_id: &str) -> Option<mpsc::Receiver<ScheduledUpload>> {
        self.receivers.lock().unwrap().remove(prefix_id)
    }

    /// Selects a prefix via the scheduler, allocates a window slot via the
    /// congestion controller, and enqueues on that prefix's channel.
    pub fn schedule_upload(&self, mut upload: ScheduledUpload) -> Result<ScheduledUpload> {
        if !self.is_active() {
            return Err(CoordinationError::CoordinatorInactive(
                "cannot schedule upload before start()".to_string(),
            ));
        }

        let prefix_id = self
            .scheduler
            .select_optimal_prefix(&upload)
            .ok_or_else(|| {
                CoordinationError::NoPrefixesRegistered(
                    "no prefixes registered with the scheduler".to_string(),
                )
            })?;

        match self.congestion.allocate_resources(&prefix_id, &upload) {
            Ok(allocation) => {
                upload.assigned_prefix = Some(prefix_id.clone());
                upload.allocated_bandwidth_mbps = allocation.allocated_bandwidth_mbps;
                upload.allocated_window_slots = allocation.congestion_window;
            }
            Err(CoordinationError::CongestionWindowFull { backoff, prefix_id }) => {
                self.congestion_event_count.fetch_add(1, Ordering::Relaxed);
                upload.backoff_delay = backoff;
                return Err(CoordinationError::CongestionWindowFull { prefix_id, backoff });
            }
            Err(other) => return Err(other),
        }

        let channels = self.channels.lock().unwrap();
        let sender = channels.get(&prefix_id).ok_or_else(|| {
            CoordinationError::PrefixNotRegistered {
                prefix_id: prefix_id.clone(),
                message: "prefix has no open channel".to_string(),
            }
        })?;

        sender.try_send(upload.clone()).map_err(|_| {
            CoordinationError::PrefixQueueFull {
                prefix_id: prefix_id.clone(),
                message: "prefix channel is at capacity".to_string(),
            }
        })?;

        Ok(upload)
    }

    /// Forwards an observed outcome to both the scheduler and the
    /// congestion controller.
    pub fn update_prefix_metrics(
        &self,
        prefix_id: &str,
        throughput_mbps: f64,
        latency_ms: f64,
        error_rate: f64,
        queue_length: usize,
    ) {
        let allocation = self.congestion.allocation(prefix_id);
        let (cwnd, utilization) = allocation
            .map(|a| (a.congestion_window, a.utilization))
            .unwrap_or((1, 0.0));

        self.scheduler.update_prefix_metrics(
            prefix_id,
            PrefixMetricsUpdate {
                active_uploads: 1,
                throughput_mbps,
                latency_ms,
                error_rate,
                congestion_window: cwnd,
                bandwidth_utilization: utilization,
                queue_length,
            },
        );
        self.congestion
            .update_prefix_performance(prefix_id, throughput_mbps, latency_ms, error_rate, utilization);
        self.bandwidth_filter.add_sample(
            std::time::Instant::now(),
            throughput_mbps,
            latency_ms,
            queue_length,
        );
        self.congestion.release(prefix_id);

        // A metrics update means one previously-scheduled upload on this
        // prefix has now completed; drain one queued entry so the
        // channel's capacity tracks real in-flight work rather than every
        // upload ever scheduled.
        if let Some(rx) = self.receivers.lock().unwrap().get_mut(prefix_id) {
            let _ = rx.try_recv();
        }
    }

    /// Records a baseline (uncoordinated) throughput used to compute
    /// `improvement_factor` in subsequent metrics snapshots.
    pub fn record_baseline(&self, throughput_mbps: f64) {
        *self.baseline.lock().unwrap() = Some(Baseline { throughput_mbps });
    }

    pub fn get_metrics(&self) -> CoordinationMetrics {
        let scheduler_metrics = self.scheduler.get_metrics();
        let global = self.scheduler.global_state();
        let active_prefixes = global.active_prefixes.len();
        let coordination_overhead = (active_prefixes as f64 * 0.01).min(0.10);
        let congestion_events = self.congestion_event_count.load(Ordering::Relaxed);

        let improvement_factor = self.baseline.lock().unwrap().as_ref().and_then(|baseline| {
            if baseline.throughput_mbps > 0.0 && scheduler_metrics.global_throughput_mbps > 0.0 {
                Some(scheduler_metrics.global_throughput_mbps / baseline.throughput_mbps)
            } else {
                None
            }
        });

        CoordinationMetrics {
            active_prefixes,
            global_throughput_mbps: scheduler_metrics.global_throughput_mbps,
            load_balance_efficiency: scheduler_metrics.load_balance_efficiency,
            coordination_overhead,
            congestion_events,
            improvement_factor,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn congestion_controller(&self) -> &Arc<CongestionController> {
        &self.congestion
    }
}
