//! The coordination record for a single archive's trip through the
//! scheduler and congestion controller (`ScheduledUpload`), and the
//! `Uploader` integration surface (C10).

mod scheduled;
pub mod uploader;

pub use scheduled::ScheduledUpload;
pub use uploader::{InMemoryUploader, UploadResult, Uploader};
