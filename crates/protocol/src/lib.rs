//! Shared data model for medialift resumable uploads.
//!
//! Everything that crosses a crate boundary lives here: upload descriptors,
//! transfer state, progress snapshots, checkpoint records, and the error
//! taxonomy surfaced to callers.

mod error;
mod types;

pub use error::UploadError;
pub use types::{
    CheckpointEntry, PriorState, Progress, TransferState, UploadDescriptor, UploadFailure,
    UploadResult, UploadStatus,
};

/// Default chunk size: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default per-chunk retry ceiling (total attempts).
pub const DEFAULT_MAX_RETRIES: u32 = 3;
