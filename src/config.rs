//! Configuration for the cross-prefix transfer coordination core.
//!
//! Follows the teacher's concurrency configuration shape: hierarchical,
//! `serde`-derived, `Default`-backed, validated before use, with fluent
//! builder methods for the common overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoordinationError, Result};

/// Prefix generation pattern (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefixPattern {
    Hash,
    Date,
    Sequential,
    Custom,
}

/// Archive-to-batch partitioning policy (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancing {
    RoundRobin,
    HashBased,
    LeastLoaded,
}

/// Prefix selection strategy used by the scheduler (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingStrategy {
    TcpLike,
    FairShare,
    Adaptive,
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingStrategy::TcpLike => write!(f, "tcp_like"),
            SchedulingStrategy::FairShare => write!(f, "fair_share"),
            SchedulingStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Bandwidth allocation strategy tag, plumbed through to the congestion
/// controller's rebalance step. The core ships one implementation
/// (priority-weighted, §4.7) but keeps the name configurable for forward
/// compatibility with alternative allocators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandwidthStrategy {
    FairShare,
    PriorityWeighted,
}

/// Top-level dispatch configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub max_prefixes: usize,
    pub prefix_pattern: PrefixPattern,
    pub custom_prefixes: Vec<String>,
    pub max_concurrent_uploads: usize,
    pub load_balancing: LoadBalancing,
    pub prefix_optimization: bool,
    pub enable_coordination: bool,
    pub coordination: CoordinationConfig,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_prefixes: 4,
            prefix_pattern: PrefixPattern::Hash,
            custom_prefixes: Vec::new(),
            max_concurrent_uploads: 3,
            load_balancing: LoadBalancing::LeastLoaded,
            prefix_optimization: true,
            enable_coordination: true,
            coordination: CoordinationConfig::default(),
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_prefixes == 0 {
            return Err(CoordinationError::Configuration(
                "max_prefixes must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(CoordinationError::Configuration(
                "max_concurrent_uploads must be greater than 0".to_string(),
            ));
        }
        if self.prefix_pattern == PrefixPattern::Custom && self.custom_prefixes.is_empty() {
            // Falls back to Date per §4.9; not an error, just worth noting
            // at validation time via the caller's logger.
        }
        self.coordination.validate()
    }

    pub fn with_max_prefixes(mut self, n: usize) -> Self {
        self.max_prefixes = n;
        self
    }

    pub fn with_load_balancing(mut self, lb: LoadBalancing) -> Self {
        self.load_balancing = lb;
        self
    }

    pub fn with_prefix_pattern(mut self, pattern: PrefixPattern) -> Self {
        self.prefix_pattern = pattern;
        self
    }

    pub fn with_max_concurrent_uploads(mut self, n: usize) -> Self {
        self.max_concurrent_uploads = n;
        self
    }
}

/// Coordination-layer configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub pipeline_depth: usize,
    pub global_congestion_window: usize,
    pub strategy: SchedulingStrategy,
    pub max_active_prefixes: usize,
    pub bandwidth_strategy: BandwidthStrategy,
    #[serde(with = "duration_secs")]
    pub update_interval: Duration,
    pub enable_advanced_flow_control: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 16,
            global_congestion_window: 32,
            strategy: SchedulingStrategy::Adaptive,
            max_active_prefixes: 16,
            bandwidth_strategy: BandwidthStrategy::FairShare,
            update_interval: Duration::from_secs(2),
            enable_advanced_flow_control: true,
        }
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_depth == 0 {
            return Err(CoordinationError::Configuration(
                "pipeline_depth must be greater than 0".to_string(),
            ));
        }
        if !(8..=1024).contains(&self.global_congestion_window) {
            return Err(CoordinationError::Configuration(
                "global_congestion_window must be within [8, 1024]".to_string(),
            ));
        }
        if self.max_active_prefixes == 0 {
            return Err(CoordinationError::Configuration(
                "max_active_prefixes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_global_congestion_window(mut self, window: usize) -> Self {
        self.global_congestion_window = window;
        self
    }
}

/// Adaptive planner configuration (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub initial_chunk_size: u64,
    pub max_concurrency: usize,
    pub history_capacity: usize,
    pub enable_content_type_hints: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 5 * 1024 * 1024,
            max_chunk_size: 100 * 1024 * 1024,
            initial_chunk_size: 8 * 1024 * 1024,
            max_concurrency: 10,
            history_capacity: 50,
            enable_content_type_hints: true,
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 || self.min_chunk_size > self.max_chunk_size {
            return Err(CoordinationError::Configuration(
                "min_chunk_size must be positive and <= max_chunk_size".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(CoordinationError::Configuration(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load balancer configuration (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(with = "duration_secs")]
    pub rebalance_interval: Duration,
    pub rebalance_threshold: f64,
    pub min_weight: f64,
    pub max_weight: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            rebalance_interval: Duration::from_secs(30),
            rebalance_threshold: 0.2,
            min_weight: 0.1,
            max_weight: 2.0,
        }
    }
}

/// Congestion controller configuration (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionConfig {
    pub initial_global_cwnd: usize,
    pub min_cwnd: usize,
    pub max_cwnd: usize,
    #[serde(with = "duration_secs")]
    pub cycle_length: Duration,
    pub enable_bbr_probing: bool,
    pub probing_rate: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            initial_global_cwnd: 32,
            min_cwnd: 8,
            max_cwnd: 1024,
            cycle_length: Duration::from_secs(8),
            enable_bbr_probing: true,
            probing_rate: 0.1,
        }
    }
}

impl CongestionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_cwnd == 0 || self.min_cwnd > self.max_cwnd {
            return Err(CoordinationError::Configuration(
                "min_cwnd must be positive and <= max_cwnd".to_string(),
            ));
        }
        if !(self.min_cwnd..=self.max_cwnd).contains(&self.initial_global_cwnd) {
            return Err(CoordinationError::Configuration(
                "initial_global_cwnd must be within [min_cwnd, max_cwnd]".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
