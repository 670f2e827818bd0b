//! Cross-prefix transfer coordination core.
//!
//! Uploads many large archives to an object store concurrently, spreads
//! them across generated key prefixes to defeat per-partition rate limits,
//! and adapts chunk size, concurrency, and bandwidth allocation in real
//! time from observed performance.
//!
//! ## Main modules
//! - [`archive`] - the `Archive` upload unit and its partitioned `PrefixBatch` form.
//! - [`config`] - hierarchical, validated configuration for every component.
//! - [`error`] - the tagged `CoordinationError` family.
//! - [`network`] - bandwidth filtering, rolling network monitoring, and the learned `NetworkProfile`.
//! - [`history`] - bounded history of completed upload sessions.
//! - [`planner`] - adaptive chunk size and concurrency planning.
//! - [`balancer`] - per-prefix weight assignment and rebalance triggers.
//! - [`scheduler`] - optimal prefix selection and per-prefix metrics.
//! - [`congestion`] - the TCP-like global congestion controller.
//! - [`coordinator`] - pipeline lifecycle and schedule+allocate composition.
//! - [`dispatcher`] - prefix generation, partitioning, and worker pools.
//! - [`upload`] - the `Uploader` integration surface and `ScheduledUpload`.
//! - [`logging`] - structured console logging.

pub mod archive;
pub mod balancer;
pub mod config;
pub mod congestion;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod logging;
pub mod network;
pub mod planner;
pub mod scheduler;
pub mod upload;

pub use archive::{Archive, PrefixBatch};
pub use config::{CoordinationConfig, ParallelConfig};
pub use coordinator::{CoordinationMetrics, PipelineCoordinator};
pub use dispatcher::{BatchResult, PrefixDispatcher};
pub use error::{CoordinationError, Result};
pub use logging::Logger;
pub use upload::{ScheduledUpload, UploadResult, Uploader};
