//! Network condition estimation: a windowed max-bandwidth filter (C1), a
//! rolling-average monitor (C2), and the learned `NetworkProfile` the
//! scheduler maintains from per-prefix updates.

mod bandwidth_filter;
mod monitor;
mod profile;

pub use bandwidth_filter::BandwidthFilter;
pub use monitor::{NetworkCondition, NetworkMonitor, NetworkSample};
pub use profile::{NetworkProfile, Trend};

use std::time::Instant;

/// A time-stamped bandwidth observation retained in `BandwidthFilter`'s
/// sliding window. Timestamps are monotonic (`Instant`); wall-clock time
/// only appears in externally-exposed metrics snapshots.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthSample {
    pub timestamp: Instant,
    pub mbps: f64,
    pub rtt_ms: f64,
    pub in_flight: usize,
}
