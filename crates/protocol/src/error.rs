//! Upload error taxonomy.

use serde::{Deserialize, Serialize};

/// Terminal upload error reported to callers and carried by
/// [`TransferState::Failed`](crate::TransferState::Failed).
///
/// Cloneable by design: the same value is fanned out to every observer and
/// stored in the state machine, so underlying causes are flattened to
/// strings rather than wrapped error sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum UploadError {
    /// Local file could not be opened, seeked, or read.
    #[error("file error: {0}")]
    File(String),

    /// Transport-level failure below HTTP semantics (DNS, TLS, reset).
    #[error("connection error: {0}")]
    Connection(String),

    /// Non-retryable HTTP status.
    #[error("HTTP {code}: {message}")]
    Http { code: u16, message: String },

    /// User- or system-initiated cancellation. Reported distinctly from
    /// failures so callers do not treat a deliberate stop as an error.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Returns `true` for deliberate cancellation, as opposed to a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}
