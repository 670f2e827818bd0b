//! Learned network parameters the scheduler maintains across prefix
//! updates: EWMA bandwidth, a monotone RTT baseline, trend, and confidence.

/// Direction of a bandwidth or latency trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    Unknown,
}

/// A learned summary of bandwidth, latency, and their trends, updated by
/// the scheduler on every `UpdatePrefixMetrics` call (§4.6).
#[derive(Debug, Clone)]
pub struct NetworkProfile {
    /// EWMA-updated bandwidth estimate, in MB/s.
    pub estimated_bandwidth: Option<f64>,
    /// Minimum observed RTT, non-increasing until `reset()`.
    pub baseline_rtt_ms: Option<f64>,
    pub bandwidth_trend: Trend,
    pub latency_trend: Trend,
    /// Learning confidence in `[0, 1]`, grows with samples and stability.
    pub confidence: f64,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            estimated_bandwidth: None,
            baseline_rtt_ms: None,
            bandwidth_trend: Trend::Unknown,
            latency_trend: Trend::Unknown,
            confidence: 0.0,
        }
    }
}

const EWMA_ALPHA: f64 = 0.1;
const CONFIDENCE_STEP: f64 = 0.01;

impl NetworkProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the EWMA bandwidth estimate, lower the RTT baseline if this
    /// observation beats it, and nudge confidence upward (capped at 1.0).
    pub fn observe(&mut self, throughput_mbps: f64, latency_ms: f64) {
        self.estimated_bandwidth = Some(match self.estimated_bandwidth {
            Some(prev) => EWMA_ALPHA * throughput_mbps + (1.0 - EWMA_ALPHA) * prev,
            None => throughput_mbps,
        });

        self.baseline_rtt_ms = Some(match self.baseline_rtt_ms {
            Some(prev) => prev.min(latency_ms),
            None => latency_ms,
        });

        self.confidence = (self.confidence + CONFIDENCE_STEP).min(1.0);
    }

    /// Recompute bandwidth/latency trends by comparing a recent-3 average
    /// against an overall-history average, with a ±10% threshold (§4.6).
    pub fn recompute_trend(&mut self, recent3_bw: f64, overall_bw: f64) {
        self.bandwidth_trend = classify_trend(recent3_bw, overall_bw);
    }

    pub fn recompute_latency_trend(&mut self, recent3_latency: f64, overall_latency: f64) {
        // Latency improving means it's decreasing; we still phrase the
        // trend in terms of latency's own direction.
        self.latency_trend = classify_trend(recent3_latency, overall_latency);
    }

    /// Reset the RTT baseline (and trend state), e.g. after a controller
    /// reset that invalidates prior observations.
    pub fn reset_rtt_baseline(&mut self) {
        self.baseline_rtt_ms = None;
    }
}

fn classify_trend(recent: f64, overall: f64) -> Trend {
    if overall <= 0.0 {
        return Trend::Unknown;
    }
    let delta = (recent - overall) / overall;
    if delta > 0.10 {
        Trend::Increasing
    } else if delta < -0.10 {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_baseline_is_monotone_non_increasing() {
        let mut profile = NetworkProfile::new();
        profile.observe(10.0, 100.0);
        assert_eq!(profile.baseline_rtt_ms, Some(100.0));
        profile.observe(10.0, 150.0);
        assert_eq!(profile.baseline_rtt_ms, Some(100.0));
        profile.observe(10.0, 60.0);
        assert_eq!(profile.baseline_rtt_ms, Some(60.0));
    }

    #[test]
    fn confidence_grows_and_caps() {
        let mut profile = NetworkProfile::new();
        for _ in 0..200 {
            profile.observe(10.0, 50.0);
        }
        assert!(profile.confidence <= 1.0);
        assert!(profile.confidence > 0.9);
    }

    #[test]
    fn trend_classification_thresholds() {
        assert_eq!(classify_trend(11.5, 10.0), Trend::Increasing);
        assert_eq!(classify_trend(8.5, 10.0), Trend::Decreasing);
        assert_eq!(classify_trend(10.2, 10.0), Trend::Stable);
    }
}
