//! Bounded history of completed upload sessions, keyed for lookup by
//! content type (C3).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::network::NetworkCondition;

/// A completed upload run, with the parameters actually used and the
/// outcomes the planner derives from them.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub start: Instant,
    pub end: Instant,
    pub total_bytes: u64,
    /// Parallel `(chunk_size, throughput_mbps)` observations, one per part.
    pub chunk_sizes: Vec<u64>,
    pub chunk_throughputs: Vec<f64>,
    pub concurrency: usize,
    pub content_type: String,
    pub success: bool,
    /// Derived on append: chunk size associated with this session's peak
    /// per-chunk throughput (`OptimalChunkFromSession`).
    pub optimal_chunk: u64,
    /// Derived on append: the concurrency to recommend next time — kept on
    /// success, reduced by one (floor 1) on failure.
    pub optimal_concurrency: usize,
    pub condition: Option<NetworkCondition>,
}

impl UploadSession {
    pub fn new(
        start: Instant,
        end: Instant,
        total_bytes: u64,
        chunk_sizes: Vec<u64>,
        chunk_throughputs: Vec<f64>,
        concurrency: usize,
        content_type: impl Into<String>,
        success: bool,
    ) -> Self {
        let content_type = content_type.into();
        let optimal_chunk =
            optimal_chunk_from_pairs(&chunk_sizes, &chunk_throughputs, *chunk_sizes.first().unwrap_or(&(8 * 1024 * 1024)));
        let optimal_concurrency = if success {
            concurrency
        } else {
            concurrency.saturating_sub(1).max(1)
        };
        let condition = average_mbps(&chunk_throughputs).map(NetworkCondition::from_mbps);

        Self {
            start,
            end,
            total_bytes,
            chunk_sizes,
            chunk_throughputs,
            concurrency,
            content_type,
            success,
            optimal_chunk,
            optimal_concurrency,
            condition,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// `OptimalChunkFromSession`: the chunk size paired with the maximum
/// observed per-chunk throughput, falling back to `initial_chunk_size`.
fn optimal_chunk_from_pairs(sizes: &[u64], throughputs: &[f64], initial_chunk_size: u64) -> u64 {
    sizes
        .iter()
        .zip(throughputs.iter())
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(size, _)| *size)
        .unwrap_or(initial_chunk_size)
}

fn average_mbps(throughputs: &[f64]) -> Option<f64> {
    if throughputs.is_empty() {
        None
    } else {
        Some(throughputs.iter().sum::<f64>() / throughputs.len() as f64)
    }
}

/// Bounded FIFO of `UploadSession`s (default capacity 50); evicts the
/// oldest session once full.
#[derive(Debug)]
pub struct UploadHistory {
    capacity: usize,
    sessions: Mutex<VecDeque<UploadSession>>,
}

impl UploadHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(50)
    }

    pub fn record(&self, session: UploadSession) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push_back(session);
        while sessions.len() > self.capacity {
            sessions.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `SessionsForContentType(ct)`: successful sessions matching `ct`, in
    /// recording order.
    pub fn sessions_for_content_type(&self, content_type: &str) -> Vec<UploadSession> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.success && s.content_type == content_type)
            .cloned()
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<UploadSession> {
        self.sessions.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for UploadHistory {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(
        content_type: &str,
        success: bool,
        concurrency: usize,
        sizes: Vec<u64>,
        throughputs: Vec<f64>,
    ) -> UploadSession {
        let now = Instant::now();
        UploadSession::new(
            now,
            now + Duration::from_secs(1),
            sizes.iter().sum(),
            sizes,
            throughputs,
            concurrency,
            content_type,
            success,
        )
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let history = UploadHistory::new(2);
        history.record(session("a", true, 4, vec![1], vec![1.0]));
        history.record(session("b", true, 4, vec![1], vec![1.0]));
        history.record(session("c", true, 4, vec![1], vec![1.0]));
        assert_eq!(history.len(), 2);
        let remaining = history.all_sessions();
        assert_eq!(remaining[0].content_type, "b");
        assert_eq!(remaining[1].content_type, "c");
    }

    #[test]
    fn failure_reduces_optimal_concurrency_floor_one() {
        let history = UploadHistory::new(10);
        history.record(session("a", false, 1, vec![1], vec![1.0]));
        let sessions = history.all_sessions();
        assert_eq!(sessions[0].optimal_concurrency, 1);
    }

    #[test]
    fn success_keeps_concurrency() {
        let s = session("a", true, 5, vec![1], vec![1.0]);
        assert_eq!(s.optimal_concurrency, 5);
    }

    #[test]
    fn optimal_chunk_tracks_peak_throughput() {
        let s = session(
            "video/mp4",
            true,
            4,
            vec![8 * 1024 * 1024, 16 * 1024 * 1024, 32 * 1024 * 1024],
            vec![10.0, 40.0, 25.0],
        );
        assert_eq!(s.optimal_chunk, 16 * 1024 * 1024);
    }

    #[test]
    fn lookup_filters_by_content_type_and_success() {
        let history = UploadHistory::new(10);
        history.record(session("video/mp4", true, 4, vec![1], vec![1.0]));
        history.record(session("video/mp4", false, 4, vec![1], vec![1.0]));
        history.record(session("text/plain", true, 4, vec![1], vec![1.0]));

        let matches = history.sessions_for_content_type("video/mp4");
        assert_eq!(matches.len(), 1);
        assert!(matches[0].success);
    }
}
