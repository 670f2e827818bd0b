//! `ScheduledUpload`: a coordination record for a single archive (§3).

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::archive::Archive;

/// Created on submission to the pipeline coordinator; mutated only by the
/// coordinator (C8) and congestion controller (C7); released after its
/// terminal result is reported.
#[derive(Debug, Clone)]
pub struct ScheduledUpload {
    pub archive: Archive,
    /// Filled in by the scheduler once a prefix is selected.
    pub assigned_prefix: Option<String>,
    /// `{1..5}`; defaults to the archive's effective priority.
    pub priority: u8,
    pub estimated_size: u64,
    pub scheduled_at: Instant,
    pub deadline: Option<Instant>,
    /// Reserved for future ordering; always empty today.
    pub dependencies: HashSet<String>,
    pub allocated_bandwidth_mbps: f64,
    pub allocated_window_slots: usize,
    pub backoff_delay: Duration,
    pub coordination_id: String,
    pub group_id: Option<String>,
}

impl ScheduledUpload {
    pub fn new(archive: Archive) -> Self {
        let priority = archive.effective_priority();
        let estimated_size = archive.size;
        Self {
            archive,
            assigned_prefix: None,
            priority,
            estimated_size,
            scheduled_at: Instant::now(),
            deadline: None,
            dependencies: HashSet::new(),
            allocated_bandwidth_mbps: 0.0,
            allocated_window_slots: 0,
            backoff_delay: Duration::from_secs(0),
            coordination_id: uuid::Uuid::new_v4().to_string(),
            group_id: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_defaults_from_archive() {
        let archive = Archive::new("k", 10, "application/octet-stream");
        let upload = ScheduledUpload::new(archive);
        assert_eq!(upload.priority, 3);
    }

    #[test]
    fn coordination_id_is_unique() {
        let a = ScheduledUpload::new(Archive::new("k", 10, "text/plain"));
        let b = ScheduledUpload::new(Archive::new("k", 10, "text/plain"));
        assert_ne!(a.coordination_id, b.coordination_id);
    }
}
