//! Resumable chunked HTTP transfer engine.
//!
//! The core of medialift: a sequential byte-range [`ChunkReader`], a
//! per-chunk [`ChunkUploader`] with bounded retries and status
//! classification, and the whole-file [`TransferEngine`] state machine with
//! pause/resume/cancel and observer fan-out.

mod chunk;
mod engine;
mod transport;
mod worker;

pub use chunk::{ChunkReader, FileChunk};
pub use engine::{ObserverFn, ObserverToken, TransferEngine};
pub use transport::{
    ChunkRequest, ChunkTransport, HttpTransport, ProgressFn, StatusClass, classify_status,
    content_range,
};
pub use worker::{ChunkOutcome, ChunkUploader, ChunkWorkerError, RetryPolicy};

/// Errors produced by the transfer crate.
///
/// Chunk-level retryable outcomes are absorbed inside [`ChunkUploader`] up
/// to the retry ceiling; only exhaustion or a fatal classification escalates
/// through the engine to the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file error: {0}")]
    File(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP {code}: {message}")]
    Http { code: u16, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<&TransferError> for medialift_protocol::UploadError {
    fn from(e: &TransferError) -> Self {
        use medialift_protocol::UploadError;
        match e {
            TransferError::File(io) => UploadError::File(io.to_string()),
            TransferError::Connection(msg) => UploadError::Connection(msg.clone()),
            TransferError::Http { code, message } => UploadError::Http {
                code: *code,
                message: message.clone(),
            },
            TransferError::Cancelled => UploadError::Cancelled,
            TransferError::Internal(msg) => UploadError::Internal(msg.clone()),
        }
    }
}
