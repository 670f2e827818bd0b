//! Chunk size and concurrency planning (C4): blends file size, observed
//! network condition, content type, and session history into a multipart
//! upload plan.

use std::time::Duration;

use crate::config::PlannerConfig;
use crate::history::UploadHistory;
use crate::network::NetworkMonitor;

/// Recommended parameters for a single upload, with the confidence the
/// planner has in them.
#[derive(Debug, Clone, Copy)]
pub struct UploadPlan {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub confidence: f64,
    pub estimated_duration: Duration,
}

/// Decides chunk size and per-upload concurrency from file size, content
/// type, recent network samples (C2), and completed-session history (C3).
#[derive(Debug)]
pub struct AdaptivePlanner {
    config: PlannerConfig,
}

impl AdaptivePlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    fn base_chunk_size(&self, file_size: u64) -> u64 {
        const MB: u64 = 1024 * 1024;
        if file_size < 100 * MB {
            8 * MB
        } else if file_size < MB * 1024 {
            16 * MB
        } else if file_size < 10 * MB * 1024 {
            32 * MB
        } else {
            64 * MB
        }
    }

    fn content_type_multiplier(&self, content_type: &str) -> f64 {
        if !self.config.enable_content_type_hints {
            return 1.0;
        }
        match content_type {
            "application/zip" | "application/x-tar" => 1.3,
            ct if ct.starts_with("video/") => 1.4,
            "image/jpeg" | "image/png" => 1.1,
            "text/plain" | "application/json" => 0.8,
            _ => 1.0,
        }
    }

    fn network_multiplier(&self, monitor: &NetworkMonitor) -> f64 {
        let bandwidth = match monitor.get_average_bandwidth() {
            Some(bw) => bw,
            None => return 1.0,
        };
        let bandwidth_mult = if bandwidth < 1.0 {
            0.5
        } else if bandwidth < 5.0 {
            0.75
        } else if bandwidth < 25.0 {
            1.0
        } else {
            1.5
        };
        let latency_mult = match monitor.get_average_latency() {
            Some(latency) if latency > 500.0 => 1.5,
            Some(latency) if latency > 200.0 => 1.2,
            _ => 1.0,
        };
        bandwidth_mult * latency_mult
    }

    /// `CalculateOptimalChunkSize`: base size by file size, adjusted by
    /// network condition and content type, blended with matching history,
    /// then clamped to `[MinChunkSize, MaxChunkSize]`.
    pub fn calculate_optimal_chunk_size(
        &self,
        file_size: u64,
        content_type: &str,
        monitor: &NetworkMonitor,
        history: &UploadHistory,
    ) -> u64 {
        let base = self.base_chunk_size(file_size);
        let network_mult = self.network_multiplier(monitor);
        let content_mult = self.content_type_multiplier(content_type);

        let mut size = base as f64 * network_mult * content_mult;

        let matching = history.sessions_for_content_type(content_type);
        if !matching.is_empty() {
            let mean_history_chunk = matching.iter().map(|s| s.optimal_chunk as f64).sum::<f64>()
                / matching.len() as f64;
            size = 0.7 * size + 0.3 * mean_history_chunk;
        }

        (size.round() as u64).clamp(self.config.min_chunk_size, self.config.max_chunk_size)
    }

    /// `CalculateOptimalConcurrency`: base from bandwidth, capped at the
    /// number of chunks, blended with a recency-weighted historical optimum.
    pub fn calculate_optimal_concurrency(
        &self,
        file_size: u64,
        chunk_size: u64,
        monitor: &NetworkMonitor,
        history: &UploadHistory,
        content_type: &str,
    ) -> usize {
        let num_chunks = file_size.div_ceil(chunk_size.max(1)) as usize;

        let base = match monitor.get_average_bandwidth() {
            Some(bw) if bw < 1.0 => 2,
            Some(bw) if bw < 5.0 => 4,
            Some(bw) if bw < 25.0 => 8,
            Some(_) => self.config.max_concurrency,
            None => self.config.max_concurrency,
        };
        let base = base.min(num_chunks).max(1);

        let matching = history.sessions_for_content_type(content_type);
        if matching.is_empty() {
            return base;
        }

        let now = std::time::Instant::now();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for session in &matching {
            let age_hours = now.saturating_duration_since(session.end).as_secs_f64() / 3600.0;
            let weight = (-age_hours / 24.0).exp();
            weighted_sum += weight * session.optimal_concurrency as f64;
            weight_total += weight;
        }
        if weight_total <= 0.0 {
            return base;
        }
        let hist_opt = weighted_sum / weight_total;
        let blended = 0.7 * base as f64 + 0.3 * hist_opt;
        let blended = blended.round() as usize;

        if (1..=self.config.max_concurrency).contains(&blended) {
            blended.min(num_chunks).max(1)
        } else {
            base
        }
    }

    /// Confidence in the current recommendation: mean of sample-count
    /// based confidences from the network monitor and the session history.
    pub fn confidence(&self, monitor: &NetworkMonitor, history: &UploadHistory) -> f64 {
        let network_confidence = (monitor.sample_count() as f64 / 10.0).min(1.0);
        let history_confidence = (history.len() as f64 / 20.0).min(1.0);
        (network_confidence + history_confidence) / 2.0
    }

    /// `EstimateDuration`: effective bandwidth accounts for parallelism's
    /// diminishing returns; defaults to 5 MB/s when bandwidth is unknown.
    pub fn estimate_duration(
        &self,
        file_size: u64,
        concurrency: usize,
        monitor: &NetworkMonitor,
    ) -> Duration {
        let bandwidth_mbps = monitor.get_average_bandwidth().unwrap_or(5.0);
        let effective_bw = bandwidth_mbps * (0.7 + 0.3 / concurrency.max(1) as f64);
        if effective_bw <= 0.0 {
            return Duration::from_secs(0);
        }
        let mb = file_size as f64 / (1024.0 * 1024.0);
        Duration::from_secs_f64(mb / effective_bw)
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }
}

impl Default for AdaptivePlanner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::UploadSession;
    use std::time::Instant;

    #[test]
    fn chunk_size_within_bounds_with_no_signal() {
        let planner = AdaptivePlanner::default();
        let monitor = NetworkMonitor::with_default_capacity();
        let history = UploadHistory::with_default_capacity();

        let chunk = planner.calculate_optimal_chunk_size(
            50 * 1024 * 1024,
            "application/octet-stream",
            &monitor,
            &history,
        );
        assert!((5 * 1024 * 1024..=20 * 1024 * 1024).contains(&chunk));
    }

    #[test]
    fn video_with_good_network_scales_base_chunk() {
        let planner = AdaptivePlanner::default();
        let monitor = NetworkMonitor::with_default_capacity();
        monitor.record_sample(crate::network::NetworkSample {
            timestamp: Instant::now(),
            mbps: 20.0,
            latency_ms: 30.0,
            chunk_size: 32 * 1024 * 1024,
            success: true,
        });
        let history = UploadHistory::with_default_capacity();

        let chunk = planner.calculate_optimal_chunk_size(
            5 * 1024 * 1024 * 1024,
            "video/mp4",
            &monitor,
            &history,
        );
        assert!((30 * 1024 * 1024..=100 * 1024 * 1024).contains(&chunk));
    }

    #[test]
    fn concurrency_never_exceeds_chunk_count() {
        let planner = AdaptivePlanner::default();
        let monitor = NetworkMonitor::with_default_capacity();
        let history = UploadHistory::with_default_capacity();

        let concurrency = planner.calculate_optimal_concurrency(
            10 * 1024 * 1024,
            8 * 1024 * 1024,
            &monitor,
            &history,
            "application/octet-stream",
        );
        assert!((1..=2).contains(&concurrency));
    }

    #[test]
    fn history_blend_moves_toward_recorded_optimum() {
        let planner = AdaptivePlanner::default();
        let monitor = NetworkMonitor::with_default_capacity();
        let history = UploadHistory::with_default_capacity();

        let now = Instant::now();
        let best_chunk = 64 * 1024 * 1024;
        history.record(UploadSession::new(
            now,
            now,
            best_chunk,
            vec![best_chunk],
            vec![50.0],
            4,
            "application/octet-stream",
            true,
        ));

        let without_history =
            planner.base_chunk_size(50 * 1024 * 1024).clamp(planner.config.min_chunk_size, planner.config.max_chunk_size);
        let with_history = planner.calculate_optimal_chunk_size(
            50 * 1024 * 1024,
            "application/octet-stream",
            &monitor,
            &history,
        );

        let moved = (with_history as f64 - without_history as f64).abs();
        let total_distance = (best_chunk as f64 - without_history as f64).abs();
        assert!(moved >= 0.3 * total_distance - 1.0);
    }
}
