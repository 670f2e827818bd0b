//! The unit of upload (`Archive`) and its partitioned batch form
//! (`PrefixBatch`).

use std::collections::HashMap;

/// Expected access pattern for an archive once it lands in the object
/// store. Mirrors the storage-class hints a caller might pass through to an
/// out-of-scope storage-class selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Default)]
pub enum AccessPattern {
    Frequent,
    Infrequent,
    Rare,
    Archive,
    #[default]
    Unknown,
}


/// A single logical upload unit: a destination key plus a finite,
/// restartable byte stream and its declared metadata.
///
/// Archives are constructed by the caller, immutable once submitted to the
/// dispatcher, and dropped after their upload result is reported.
#[derive(Debug, Clone)]
pub struct Archive {
    /// Destination path within whichever prefix it is assigned to.
    pub key: String,
    /// Declared byte size of the (possibly compressed) stream that will be
    /// uploaded.
    pub size: u64,
    /// Size of the content before compression, if known.
    pub original_size: u64,
    /// Free-form compression label (`"gzip"`, `"zstd"`, `"none"`, ...).
    pub compression: String,
    /// Declared MIME-ish content type, used by the planner's content-type
    /// multiplier.
    pub content_type: String,
    /// Expected access pattern once stored.
    pub access_pattern: AccessPattern,
    /// Retention hint in days.
    pub retention_days: u32,
    /// Optional user metadata forwarded to the object store.
    pub metadata: HashMap<String, String>,
    /// Priority in `{1..5}`; `None` lets the coordinator apply the default
    /// (3) per the coordination record's convention.
    pub priority: Option<u8>,
}

impl Archive {
    pub fn new(key: impl Into<String>, size: u64, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size,
            original_size: size,
            compression: "none".to_string(),
            content_type: content_type.into(),
            access_pattern: AccessPattern::Unknown,
            retention_days: 0,
            metadata: HashMap::new(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.clamp(1, 5));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Priority used for scheduling: the declared value, or the documented
    /// default of 3 when unset.
    pub fn effective_priority(&self) -> u8 {
        self.priority.unwrap_or(3)
    }
}

/// A partitioned work unit produced by the dispatcher: a prefix string and
/// the archives assigned to it, along with a priority derived from their
/// aggregate size.
#[derive(Debug, Clone)]
pub struct PrefixBatch {
    pub prefix: String,
    pub archives: Vec<Archive>,
    pub priority: u64,
}

impl PrefixBatch {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            archives: Vec::new(),
            priority: 0,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.archives.iter().map(|a| a.size).sum()
    }

    /// Recompute `priority` as `floor(total_size / 1 MiB)`, per spec.
    pub fn recompute_priority(&mut self) {
        self.priority = self.total_size() / (1024 * 1024);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priority_is_three() {
        let archive = Archive::new("k", 100, "application/octet-stream");
        assert_eq!(archive.effective_priority(), 3);
    }

    #[test]
    fn explicit_priority_is_clamped() {
        let archive = Archive::new("k", 100, "application/octet-stream").with_priority(9);
        assert_eq!(archive.effective_priority(), 5);
    }

    #[test]
    fn batch_priority_is_floor_mib() {
        let mut batch = PrefixBatch::new("archives/batch-0000/");
        batch.archives.push(Archive::new("a", 2 * 1024 * 1024 + 500, "x"));
        batch.recompute_priority();
        assert_eq!(batch.priority, 2);
    }
}
