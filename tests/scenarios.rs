//! End-to-end scenarios (S1-S6) exercised against the public API, mirroring
//! the teacher's top-level `tests/` placement for cross-module behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prefix_transfer_core::archive::Archive;
use prefix_transfer_core::config::{
    CongestionConfig, CoordinationConfig, LoadBalancing, ParallelConfig, PrefixPattern,
    SchedulingStrategy,
};
use prefix_transfer_core::congestion::CongestionController;
use prefix_transfer_core::dispatcher::PrefixDispatcher;
use prefix_transfer_core::network::{BandwidthFilter, NetworkMonitor};
use prefix_transfer_core::planner::AdaptivePlanner;
use prefix_transfer_core::scheduler::{PrefixMetricsUpdate, Scheduler};
use prefix_transfer_core::upload::{InMemoryUploader, ScheduledUpload};
use prefix_transfer_core::Logger;

fn archives(count: usize, size: u64) -> Vec<Archive> {
    (0..count)
        .map(|i| Archive::new(format!("a{i}.tar"), size, "application/octet-stream"))
        .collect()
}

#[tokio::test]
async fn s1_round_robin_sequential_split_across_two_prefixes() {
    let config = ParallelConfig::default()
        .with_max_prefixes(2)
        .with_prefix_pattern(PrefixPattern::Sequential)
        .with_load_balancing(LoadBalancing::RoundRobin);
    let uploader = Arc::new(InMemoryUploader::new());
    let dispatcher = PrefixDispatcher::new(config, uploader.clone(), Logger::silent());

    let result = dispatcher.upload_parallel(archives(4, 20)).await.unwrap();

    assert_eq!(result.total_errors, 0);
    assert_eq!(result.total_bytes, 80);
    assert_eq!(result.prefixes.len(), 2);
    assert!(result.prefixes.iter().all(|p| p.success == 2));
    assert_eq!(uploader.calls().len(), 4);
}

#[test]
fn s2_chunk_size_with_no_signal_is_base_clamped() {
    let planner = AdaptivePlanner::default();
    let monitor = NetworkMonitor::with_default_capacity();
    let history = prefix_transfer_core::history::UploadHistory::with_default_capacity();

    let chunk = planner.calculate_optimal_chunk_size(
        50 * 1024 * 1024,
        "application/octet-stream",
        &monitor,
        &history,
    );
    assert!((5 * 1024 * 1024..=20 * 1024 * 1024).contains(&chunk));
}

#[test]
fn s3_video_chunk_size_scales_with_content_and_history() {
    let planner = AdaptivePlanner::default();
    let monitor = NetworkMonitor::with_default_capacity();
    monitor.record_sample(prefix_transfer_core::network::NetworkSample {
        timestamp: Instant::now(),
        mbps: 20.0,
        latency_ms: 30.0,
        chunk_size: 32 * 1024 * 1024,
        success: true,
    });
    let history = prefix_transfer_core::history::UploadHistory::with_default_capacity();

    let chunk =
        planner.calculate_optimal_chunk_size(5 * 1024 * 1024 * 1024, "video/mp4", &monitor, &history);
    assert!((30 * 1024 * 1024..=100 * 1024 * 1024).contains(&chunk));
}

#[test]
fn s4_third_allocation_on_full_window_backs_off() {
    let config = CongestionConfig {
        initial_global_cwnd: 8,
        min_cwnd: 1,
        ..CongestionConfig::default()
    };
    let controller = CongestionController::new(config, Logger::silent());
    controller.register_prefix("p");

    let archive = Archive::new("a.tar", 10, "application/octet-stream");
    let first = controller
        .allocate_resources("p", &ScheduledUpload::new(archive.clone()))
        .unwrap();
    let second = controller
        .allocate_resources("p", &ScheduledUpload::new(archive.clone()))
        .unwrap();
    assert_eq!(first.in_flight, 1);
    assert_eq!(second.in_flight, 2);

    let third = controller.allocate_resources("p", &ScheduledUpload::new(archive));
    match third {
        Err(prefix_transfer_core::CoordinationError::CongestionWindowFull { backoff, .. }) => {
            assert!(backoff > Duration::from_millis(0));
        }
        other => panic!("expected congestion_window_full, got {other:?}"),
    }
}

#[test]
fn s5_tcp_like_prefers_higher_throughput_lower_latency() {
    let scheduler = Scheduler::new(
        CoordinationConfig {
            strategy: SchedulingStrategy::TcpLike,
            ..CoordinationConfig::default()
        },
        Logger::silent(),
    );
    scheduler.register_prefix("p1", 10);
    scheduler.register_prefix("p2", 10);

    scheduler.update_prefix_metrics(
        "p1",
        PrefixMetricsUpdate {
            active_uploads: 1,
            throughput_mbps: 50.0,
            latency_ms: 100.0,
            error_rate: 0.01,
            congestion_window: 4,
            bandwidth_utilization: 0.5,
            queue_length: 0,
        },
    );
    scheduler.update_prefix_metrics(
        "p2",
        PrefixMetricsUpdate {
            active_uploads: 1,
            throughput_mbps: 80.0,
            latency_ms: 50.0,
            error_rate: 0.001,
            congestion_window: 4,
            bandwidth_utilization: 0.5,
            queue_length: 0,
        },
    );

    let archive = Archive::new("a.tar", 10, "application/octet-stream");
    let upload = ScheduledUpload::new(archive);
    assert_eq!(scheduler.select_optimal_prefix(&upload), Some("p2".to_string()));
}

#[test]
fn s6_bandwidth_filter_reports_max_within_window() {
    let filter = BandwidthFilter::new(Duration::from_millis(100));
    let now = Instant::now();
    filter.add_sample(now - Duration::from_secs(1), 100.0, 10.0, 1);
    filter.add_sample(now, 50.0, 10.0, 1);
    assert_eq!(filter.get_max_bandwidth(), 50.0);
}
