use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UploadError;
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES};

/// Identity and policy for one upload. Immutable once a transfer starts;
/// owned by the transfer engine and mirrored into persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    /// Opaque upload identity.
    pub id: String,
    /// Destination URI receiving the chunk PUTs.
    pub destination: String,
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Per-chunk retry ceiling (total attempts).
    pub max_retries: u32,
    /// Skip the inspection/standardization collaborator.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_inspection: bool,
    /// Hold in `awaitingConfirmation` until the caller confirms.
    #[serde(default, skip_serializing_if = "is_false")]
    pub require_confirmation: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl UploadDescriptor {
    /// Creates a descriptor with a generated id and default policy.
    pub fn new(destination: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), destination)
    }

    /// Creates a descriptor with an explicit id and default policy.
    pub fn with_id(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            skip_inspection: false,
            require_confirmation: false,
        }
    }
}

/// Point-in-time progress of a transfer.
///
/// `completed_bytes` is monotonically non-decreasing while uploading; it may
/// include partial bytes of an in-flight chunk and therefore run ahead of
/// the resumable (acknowledged) offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    /// Fresh progress at `completed` of `total` bytes, stamped now.
    pub fn at(completed: u64, total: u64) -> Self {
        let now = Utc::now();
        Self {
            completed_bytes: completed,
            total_bytes: total,
            started_at: now,
            updated_at: now,
        }
    }

    /// Completed fraction in `[0, 1]`. Zero-byte files report 1.0.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.completed_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// Final accounting of a successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub bytes_uploaded: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Terminal failure payload: the error plus the last fully acknowledged
/// byte offset, so diagnostics can tell how far the transfer got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFailure {
    pub error: UploadError,
    pub acked_bytes: u64,
}

/// State of one transfer engine.
///
/// Single owner is the engine's control path. `Canceled`, `Succeeded`, and
/// `Failed` are terminal; only `Ready` and `Paused` may transition to
/// `Starting`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Ready,
    Starting,
    Uploading(Progress),
    Paused(Progress),
    Canceled,
    Succeeded(UploadResult),
    Failed(UploadFailure),
}

impl TransferState {
    /// Terminal states cannot transition further; the engine is single-use
    /// past any of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Canceled | TransferState::Succeeded(_) | TransferState::Failed(_)
        )
    }

    /// Resumable states are checkpointed; terminal states delete the
    /// checkpoint.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TransferState::Starting | TransferState::Uploading(_) | TransferState::Paused(_)
        )
    }

    /// Progress payload, if this state carries one.
    pub fn progress(&self) -> Option<&Progress> {
        match self {
            TransferState::Uploading(p) | TransferState::Paused(p) => Some(p),
            _ => None,
        }
    }

    /// Short state name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            TransferState::Ready => "ready",
            TransferState::Starting => "starting",
            TransferState::Uploading(_) => "uploading",
            TransferState::Paused(_) => "paused",
            TransferState::Canceled => "canceled",
            TransferState::Succeeded(_) => "succeeded",
            TransferState::Failed(_) => "failed",
        }
    }
}

/// Coarse prior-state code stored in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PriorState {
    WasInProgress,
    WasPaused,
}

impl PriorState {
    /// Maps a resumable state to its checkpoint code. Terminal states and
    /// `Ready` have no checkpoint and return `None`.
    pub fn of(state: &TransferState) -> Option<Self> {
        match state {
            TransferState::Starting | TransferState::Uploading(_) => Some(Self::WasInProgress),
            TransferState::Paused(_) => Some(Self::WasPaused),
            _ => None,
        }
    }
}

/// Durable resume record for one upload, keyed by descriptor id.
///
/// Created or overwritten on every resumable state change, deleted on
/// terminal states, garbage-collected by age when the store opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub saved_at: DateTime<Utc>,
    pub prior_state: PriorState,
    /// Last fully-acknowledged byte offset. Never includes partial bytes of
    /// an in-flight chunk.
    pub acked_bytes: u64,
    pub descriptor: UploadDescriptor,
    pub input_path: PathBuf,
}

/// Higher-level upload pipeline status, composed from (but distinct from)
/// [`TransferState`]. The bracketed stages of the pipeline only appear when
/// the corresponding collaborator is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Ready,
    Started,
    Inspecting,
    Standardizing,
    StandardizationSucceeded,
    StandardizationFailed,
    AwaitingConfirmation,
    Transporting,
    Paused,
    Finished { success: bool },
}

impl UploadStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, UploadStatus::Finished { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults() {
        let d = UploadDescriptor::new("https://upload.example/v1/media");
        assert!(!d.id.is_empty());
        assert_eq!(d.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(d.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!d.skip_inspection);

        let e = UploadDescriptor::new("https://upload.example/v1/media");
        assert_ne!(d.id, e.id);
    }

    #[test]
    fn state_classification() {
        let p = Progress::at(0, 100);
        assert!(!TransferState::Ready.is_terminal());
        assert!(TransferState::Starting.is_resumable());
        assert!(TransferState::Uploading(p).is_resumable());
        assert!(TransferState::Paused(p).is_resumable());
        assert!(TransferState::Canceled.is_terminal());
        assert!(
            TransferState::Failed(UploadFailure {
                error: UploadError::Cancelled,
                acked_bytes: 0,
            })
            .is_terminal()
        );
        assert!(!TransferState::Ready.is_resumable());
        assert!(!TransferState::Canceled.is_resumable());
    }

    #[test]
    fn prior_state_mapping() {
        let p = Progress::at(5, 10);
        assert_eq!(
            PriorState::of(&TransferState::Uploading(p)),
            Some(PriorState::WasInProgress)
        );
        assert_eq!(
            PriorState::of(&TransferState::Starting),
            Some(PriorState::WasInProgress)
        );
        assert_eq!(
            PriorState::of(&TransferState::Paused(p)),
            Some(PriorState::WasPaused)
        );
        assert_eq!(PriorState::of(&TransferState::Canceled), None);
        assert_eq!(PriorState::of(&TransferState::Ready), None);
    }

    #[test]
    fn progress_fraction() {
        assert_eq!(Progress::at(50, 200).fraction(), 0.25);
        assert_eq!(Progress::at(0, 0).fraction(), 1.0);
    }

    #[test]
    fn checkpoint_entry_roundtrip() {
        let entry = CheckpointEntry {
            saved_at: Utc::now(),
            prior_state: PriorState::WasPaused,
            acked_bytes: 16_777_216,
            descriptor: UploadDescriptor::with_id("u1", "https://upload.example/v1/media"),
            input_path: PathBuf::from("/videos/clip.mp4"),
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"ackedBytes\":16777216"));
        assert!(json.contains("\"wasPaused\""));

        let back: CheckpointEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn failure_payload_carries_acked_offset() {
        let failure = UploadFailure {
            error: UploadError::Http {
                code: 404,
                message: "not found".into(),
            },
            acked_bytes: 8_388_608,
        };
        let TransferState::Failed(f) = TransferState::Failed(failure.clone()) else {
            unreachable!()
        };
        assert_eq!(f.acked_bytes, 8_388_608);
        assert_eq!(f.error, failure.error);
    }

    #[test]
    fn upload_error_display() {
        let e = UploadError::Http {
            code: 404,
            message: "not found".into(),
        };
        assert_eq!(e.to_string(), "HTTP 404: not found");
        assert!(UploadError::Cancelled.is_cancellation());
        assert!(!e.is_cancellation());
    }
}
