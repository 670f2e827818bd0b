//! Error handling for the cross-prefix transfer coordination core

use std::fmt;
use std::time::Duration;

/// Tagged error carried across the coordination surface.
///
/// Every variant maps to one of the recognized error types in the
/// coordination contract: `coordinator_inactive`, `no_prefixes_registered`,
/// `prefix_not_registered`, `congestion_window_full`, `prefix_queue_full`,
/// plus the configuration/upload/cancellation families.
#[derive(Debug)]
pub enum CoordinationError {
    /// Coordinator was never started, or `Stop()` has already been called.
    CoordinatorInactive(String),
    /// Dispatch attempted with zero registered prefixes.
    NoPrefixesRegistered(String),
    /// Lookup against a prefix id that was never registered.
    PrefixNotRegistered { prefix_id: String, message: String },
    /// Congestion window is saturated; caller should back off and retry.
    CongestionWindowFull { prefix_id: String, backoff: Duration },
    /// Per-prefix bounded channel rejected a non-blocking send.
    PrefixQueueFull { prefix_id: String, message: String },
    /// Invalid configuration or a programmer error (zero-capacity prefix,
    /// malformed sample, out-of-range parameter).
    Configuration(String),
    /// A transient failure reported by the external `Uploader`.
    Upload { prefix_id: Option<String>, message: String },
    /// Cooperative cancellation observed mid-operation.
    Cancelled(String),
}

impl Clone for CoordinationError {
    fn clone(&self) -> Self {
        match self {
            CoordinationError::CoordinatorInactive(msg) => {
                CoordinationError::CoordinatorInactive(msg.clone())
            }
            CoordinationError::NoPrefixesRegistered(msg) => {
                CoordinationError::NoPrefixesRegistered(msg.clone())
            }
            CoordinationError::PrefixNotRegistered { prefix_id, message } => {
                CoordinationError::PrefixNotRegistered {
                    prefix_id: prefix_id.clone(),
                    message: message.clone(),
                }
            }
            CoordinationError::CongestionWindowFull { prefix_id, backoff } => {
                CoordinationError::CongestionWindowFull {
                    prefix_id: prefix_id.clone(),
                    backoff: *backoff,
                }
            }
            CoordinationError::PrefixQueueFull { prefix_id, message } => {
                CoordinationError::PrefixQueueFull {
                    prefix_id: prefix_id.clone(),
                    message: message.clone(),
                }
            }
            CoordinationError::Configuration(msg) => CoordinationError::Configuration(msg.clone()),
            CoordinationError::Upload { prefix_id, message } => CoordinationError::Upload {
                prefix_id: prefix_id.clone(),
                message: message.clone(),
            },
            CoordinationError::Cancelled(msg) => CoordinationError::Cancelled(msg.clone()),
        }
    }
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationError::CoordinatorInactive(msg) => {
                write!(f, "coordinator_inactive: {}", msg)
            }
            CoordinationError::NoPrefixesRegistered(msg) => {
                write!(f, "no_prefixes_registered: {}", msg)
            }
            CoordinationError::PrefixNotRegistered { prefix_id, message } => {
                write!(f, "prefix_not_registered [{}]: {}", prefix_id, message)
            }
            CoordinationError::CongestionWindowFull { prefix_id, backoff } => write!(
                f,
                "congestion_window_full [{}]: retry after {:?}",
                prefix_id, backoff
            ),
            CoordinationError::PrefixQueueFull { prefix_id, message } => {
                write!(f, "prefix_queue_full [{}]: {}", prefix_id, message)
            }
            CoordinationError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            CoordinationError::Upload { prefix_id, message } => match prefix_id {
                Some(id) => write!(f, "upload failed [{}]: {}", id, message),
                None => write!(f, "upload failed: {}", message),
            },
            CoordinationError::Cancelled(msg) => write!(f, "cancelled: {}", msg),
        }
    }
}

impl std::error::Error for CoordinationError {}

impl CoordinationError {
    /// The stable tag name used by the contract in spec §6, when this
    /// variant has one.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            CoordinationError::CoordinatorInactive(_) => Some("coordinator_inactive"),
            CoordinationError::NoPrefixesRegistered(_) => Some("no_prefixes_registered"),
            CoordinationError::PrefixNotRegistered { .. } => Some("prefix_not_registered"),
            CoordinationError::CongestionWindowFull { .. } => Some("congestion_window_full"),
            CoordinationError::PrefixQueueFull { .. } => Some("prefix_queue_full"),
            _ => None,
        }
    }

    /// Backoff delay, if this is a window-full signal.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            CoordinationError::CongestionWindowFull { backoff, .. } => Some(*backoff),
            _ => None,
        }
    }

    pub fn prefix_id(&self) -> Option<&str> {
        match self {
            CoordinationError::PrefixNotRegistered { prefix_id, .. } => Some(prefix_id),
            CoordinationError::CongestionWindowFull { prefix_id, .. } => Some(prefix_id),
            CoordinationError::PrefixQueueFull { prefix_id, .. } => Some(prefix_id),
            CoordinationError::Upload { prefix_id, .. } => prefix_id.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Attach additional context to an existing error's message, preserving its
/// variant and tag.
pub fn context_error<T>(result: Result<T>, context: &str) -> Result<T> {
    result.map_err(|e| match e {
        CoordinationError::CoordinatorInactive(msg) => {
            CoordinationError::CoordinatorInactive(format!("{}: {}", context, msg))
        }
        CoordinationError::NoPrefixesRegistered(msg) => {
            CoordinationError::NoPrefixesRegistered(format!("{}: {}", context, msg))
        }
        CoordinationError::PrefixNotRegistered { prefix_id, message } => {
            CoordinationError::PrefixNotRegistered {
                prefix_id,
                message: format!("{}: {}", context, message),
            }
        }
        other @ CoordinationError::CongestionWindowFull { .. } => other,
        CoordinationError::PrefixQueueFull { prefix_id, message } => {
            CoordinationError::PrefixQueueFull {
                prefix_id,
                message: format!("{}: {}", context, message),
            }
        }
        CoordinationError::Configuration(msg) => {
            CoordinationError::Configuration(format!("{}: {}", context, msg))
        }
        CoordinationError::Upload { prefix_id, message } => CoordinationError::Upload {
            prefix_id,
            message: format!("{}: {}", context, message),
        },
        CoordinationError::Cancelled(msg) => {
            CoordinationError::Cancelled(format!("{}: {}", context, msg))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_contract() {
        assert_eq!(
            CoordinationError::CoordinatorInactive("x".into()).tag(),
            Some("coordinator_inactive")
        );
        assert_eq!(
            CoordinationError::CongestionWindowFull {
                prefix_id: "p1".into(),
                backoff: Duration::from_millis(100)
            }
            .tag(),
            Some("congestion_window_full")
        );
        assert_eq!(CoordinationError::Configuration("x".into()).tag(), None);
    }

    #[test]
    fn context_preserves_variant() {
        let err = CoordinationError::PrefixNotRegistered {
            prefix_id: "p1".into(),
            message: "missing".into(),
        };
        let wrapped = context_error::<()>(Err(err), "scheduling").unwrap_err();
        assert_eq!(wrapped.tag(), Some("prefix_not_registered"));
        assert!(wrapped.to_string().contains("scheduling"));
    }
}
