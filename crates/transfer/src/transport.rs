//! Chunk transport seam and the reqwest-backed HTTP implementation.
//!
//! `ChunkTransport` keeps the worker and engine decoupled from the actual
//! HTTP stack and testable with mocks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::TransferError;

/// Content type sent with every chunk PUT.
const CONTENT_TYPE: &str = "video/*";

/// Frame size for the streamed request body. Progress is observable at this
/// granularity.
const BODY_FRAME_SIZE: usize = 64 * 1024;

/// Classification of an HTTP response status for a chunk upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Chunk accepted; proceed to the next one.
    Success,
    /// Transient server condition; retry within the budget.
    Retryable,
    /// Terminates the chunk attempt without consuming retry budget.
    Fatal,
}

/// Fixed status classification table.
pub fn classify_status(code: u16) -> StatusClass {
    match code {
        200 | 201 | 202 | 204 | 308 => StatusClass::Success,
        408 | 502 | 503 | 504 => StatusClass::Retryable,
        _ => StatusClass::Fatal,
    }
}

/// Formats the `Content-Range` header value for a non-empty byte range:
/// `bytes {start}-{end-1}/{total}`.
pub fn content_range(start: u64, end: u64, total_size: u64) -> String {
    debug_assert!(end > start, "content range requires a non-empty chunk");
    format!("bytes {}-{}/{}", start, end - 1, total_size)
}

/// One chunk PUT, borrowed from the worker for the duration of the attempt.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRequest<'a> {
    /// Destination URI.
    pub destination: &'a str,
    /// Start byte, inclusive.
    pub start: u64,
    /// End byte, exclusive.
    pub end: u64,
    /// Total file size for the `Content-Range` header.
    pub total_size: u64,
    /// Chunk bytes.
    pub data: &'a [u8],
}

/// Callback invoked with the cumulative byte count sent in the current
/// attempt. Fired on every transport-layer update, unthrottled; callers may
/// throttle upstream.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Transmits exactly one chunk and reports the HTTP status code.
///
/// Transport-level failures below HTTP semantics surface as
/// [`TransferError::Connection`]; status interpretation is the worker's job.
pub trait ChunkTransport: Send + Sync {
    fn put_chunk<'a>(
        &'a self,
        req: ChunkRequest<'a>,
        on_progress: ProgressFn,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransferError>> + Send + 'a>>;
}

/// HTTP chunk transport over a shared reqwest client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with its own client and the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing client (shared connection pool).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ChunkTransport for HttpTransport {
    fn put_chunk<'a>(
        &'a self,
        req: ChunkRequest<'a>,
        on_progress: ProgressFn,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransferError>> + Send + 'a>> {
        Box::pin(async move {
            let range = content_range(req.start, req.end, req.total_size);

            // Stream the body in frames so byte-level progress is visible
            // as the transport consumes it.
            let data = Bytes::copy_from_slice(req.data);
            let frames: Vec<Bytes> = (0..data.len())
                .step_by(BODY_FRAME_SIZE)
                .map(|i| data.slice(i..(i + BODY_FRAME_SIZE).min(data.len())))
                .collect();

            let mut sent = 0u64;
            let body_stream = futures_util::stream::iter(frames.into_iter().map(move |frame| {
                sent += frame.len() as u64;
                on_progress(sent);
                Ok::<_, std::io::Error>(frame)
            }));

            let response = self
                .client
                .put(req.destination)
                .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
                .header(reqwest::header::CONTENT_RANGE, range.clone())
                .header(reqwest::header::CONTENT_LENGTH, req.data.len() as u64)
                .body(reqwest::Body::wrap_stream(body_stream))
                .send()
                .await
                .map_err(|e| TransferError::Connection(e.to_string()))?;

            let code = response.status().as_u16();
            debug!(range = %range, status = code, "chunk PUT completed");
            Ok(code)
        })
    }
}
