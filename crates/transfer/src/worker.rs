//! Per-chunk upload worker: one chunk, bounded retries, cooperative
//! cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::FileChunk;
use crate::transport::{ChunkRequest, ChunkTransport, ProgressFn, StatusClass, classify_status};
use crate::TransferError;

/// Per-chunk retry policy.
///
/// The retry ceiling is the hard contract: `max_retries` bounds the total
/// number of attempts. `delay` is an optional fixed pause between attempts,
/// zero in the base configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// `max_retries` attempts with no inter-attempt delay.
    pub fn limited(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::limited(medialift_protocol::DEFAULT_MAX_RETRIES)
    }
}

/// Successful chunk upload accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Attempts used, `>= 1`.
    pub tries: u32,
    /// Bytes acknowledged (the full chunk length).
    pub bytes: u64,
}

/// Failed chunk upload: retry budget exhausted, fatal status, or
/// cancellation. Carries the last-seen progress and the last underlying
/// cause.
#[derive(Debug, thiserror::Error)]
#[error("chunk upload failed after {tries} attempt(s): {cause}")]
pub struct ChunkWorkerError {
    pub tries: u32,
    /// Bytes sent in the final attempt before it failed.
    pub bytes_sent: u64,
    #[source]
    pub cause: TransferError,
}

impl ChunkWorkerError {
    /// `true` when the worker stopped because of cancellation rather than a
    /// transport or HTTP failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.cause, TransferError::Cancelled)
    }
}

/// Uploads exactly one [`FileChunk`], classifying the response and retrying
/// according to policy. A fresh worker is constructed per chunk.
pub struct ChunkUploader<'a> {
    transport: &'a dyn ChunkTransport,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> ChunkUploader<'a> {
    pub fn new(transport: &'a dyn ChunkTransport, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            transport,
            policy,
            cancel,
        }
    }

    /// Transmits `chunk` to `destination`.
    ///
    /// Retryable statuses (`408/502/503/504`) and transport-level errors are
    /// absorbed up to the retry ceiling. Any other non-success status is
    /// fatal immediately, regardless of remaining budget. `on_progress`
    /// fires with the cumulative byte count of the current attempt.
    pub async fn upload(
        &self,
        chunk: &FileChunk,
        destination: &str,
        on_progress: ProgressFn,
    ) -> Result<ChunkOutcome, ChunkWorkerError> {
        if chunk.is_empty() {
            return Err(ChunkWorkerError {
                tries: 0,
                bytes_sent: 0,
                cause: TransferError::Internal("attempted to upload the terminal chunk".into()),
            });
        }

        let last_sent = Arc::new(AtomicU64::new(0));
        let progress: ProgressFn = {
            let last_sent = Arc::clone(&last_sent);
            Arc::new(move |sent| {
                last_sent.store(sent, Ordering::Relaxed);
                on_progress(sent);
            })
        };

        let max_tries = self.policy.max_retries.max(1);
        let mut tries = 0u32;
        let mut last_cause;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.stopped(tries.max(1), &last_sent, TransferError::Cancelled));
            }

            tries += 1;
            last_sent.store(0, Ordering::Relaxed);

            let req = ChunkRequest {
                destination,
                start: chunk.start,
                end: chunk.end,
                total_size: chunk.total_size,
                data: &chunk.data,
            };

            let attempt = self.transport.put_chunk(req, Arc::clone(&progress));
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(self.stopped(tries, &last_sent, TransferError::Cancelled));
                }
                r = attempt => r,
            };

            match result {
                Ok(code) => match classify_status(code) {
                    StatusClass::Success => {
                        debug!(start = chunk.start, end = chunk.end, tries, "chunk acknowledged");
                        return Ok(ChunkOutcome {
                            tries,
                            bytes: chunk.len(),
                        });
                    }
                    StatusClass::Retryable => {
                        warn!(start = chunk.start, status = code, tries, "retryable status");
                        last_cause = TransferError::Http {
                            code,
                            message: status_message(code),
                        };
                    }
                    StatusClass::Fatal => {
                        return Err(self.stopped(
                            tries,
                            &last_sent,
                            TransferError::Http {
                                code,
                                message: status_message(code),
                            },
                        ));
                    }
                },
                Err(TransferError::Cancelled) => {
                    return Err(self.stopped(tries, &last_sent, TransferError::Cancelled));
                }
                Err(e @ TransferError::Connection(_)) => {
                    warn!(start = chunk.start, error = %e, tries, "transport error");
                    last_cause = e;
                }
                Err(e) => {
                    return Err(self.stopped(tries, &last_sent, e));
                }
            }

            if tries >= max_tries {
                return Err(self.stopped(tries, &last_sent, last_cause));
            }

            if !self.policy.delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(self.stopped(tries, &last_sent, TransferError::Cancelled));
                    }
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }
        }
    }

    fn stopped(&self, tries: u32, last_sent: &AtomicU64, cause: TransferError) -> ChunkWorkerError {
        ChunkWorkerError {
            tries,
            bytes_sent: last_sent.load(Ordering::Relaxed),
            cause,
        }
    }
}

fn status_message(code: u16) -> String {
    reqwest::StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unexpected status")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Mock transport replaying a scripted sequence of attempt results.
    struct MockTransport {
        script: Mutex<Vec<Result<u16, TransferError>>>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl MockTransport {
        fn new(script: Vec<Result<u16, TransferError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ChunkTransport for MockTransport {
        fn put_chunk<'a>(
            &'a self,
            req: ChunkRequest<'a>,
            on_progress: ProgressFn,
        ) -> Pin<Box<dyn Future<Output = Result<u16, TransferError>> + Send + 'a>> {
            self.calls.lock().unwrap().push((req.start, req.end));
            let len = req.data.len() as u64;
            Box::pin(async move {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    return Err(TransferError::Internal("script exhausted".into()));
                }
                let result = script.remove(0);
                if result.is_ok() {
                    on_progress(len);
                }
                result
            })
        }
    }

    fn test_chunk() -> FileChunk {
        FileChunk {
            start: 0,
            end: 4,
            total_size: 4,
            data: b"data".to_vec(),
        }
    }

    fn noop_progress() -> ProgressFn {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_within_budget() {
        let transport = MockTransport::new(vec![Ok(503), Ok(503), Ok(200)]);
        let worker = ChunkUploader::new(&transport, RetryPolicy::limited(3), CancellationToken::new());

        let outcome = worker
            .upload(&test_chunk(), "https://u.example/media", noop_progress())
            .await
            .unwrap();
        assert_eq!(outcome.tries, 3);
        assert_eq!(outcome.bytes, 4);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_on_repeated_retryable() {
        let transport = MockTransport::new(vec![Ok(503), Ok(503), Ok(200)]);
        let worker = ChunkUploader::new(&transport, RetryPolicy::limited(2), CancellationToken::new());

        let err = worker
            .upload(&test_chunk(), "https://u.example/media", noop_progress())
            .await
            .unwrap_err();
        assert_eq!(err.tries, 2);
        assert!(matches!(err.cause, TransferError::Http { code: 503, .. }));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn fatal_status_never_retries() {
        let transport = MockTransport::new(vec![Ok(404), Ok(200)]);
        let worker = ChunkUploader::new(&transport, RetryPolicy::limited(5), CancellationToken::new());

        let err = worker
            .upload(&test_chunk(), "https://u.example/media", noop_progress())
            .await
            .unwrap_err();
        assert_eq!(err.tries, 1);
        assert!(matches!(err.cause, TransferError::Http { code: 404, .. }));
        assert_eq!(transport.call_count(), 1, "no retry after a fatal status");
    }

    #[tokio::test]
    async fn transport_errors_consume_retry_budget() {
        let transport = MockTransport::new(vec![
            Err(TransferError::Connection("reset".into())),
            Ok(201),
        ]);
        let worker = ChunkUploader::new(&transport, RetryPolicy::limited(3), CancellationToken::new());

        let outcome = worker
            .upload(&test_chunk(), "https://u.example/media", noop_progress())
            .await
            .unwrap();
        assert_eq!(outcome.tries, 2);
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_failure() {
        let transport = MockTransport::new(vec![Ok(200)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = ChunkUploader::new(&transport, RetryPolicy::limited(3), cancel);

        let err = worker
            .upload(&test_chunk(), "https://u.example/media", noop_progress())
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(transport.call_count(), 0, "no attempt after cancellation");
    }

    #[tokio::test]
    async fn terminal_chunk_is_rejected() {
        let transport = MockTransport::new(vec![]);
        let worker = ChunkUploader::new(&transport, RetryPolicy::default(), CancellationToken::new());

        let empty = FileChunk {
            start: 10,
            end: 10,
            total_size: 10,
            data: Vec::new(),
        };
        let err = worker
            .upload(&empty, "https://u.example/media", noop_progress())
            .await
            .unwrap_err();
        assert!(matches!(err.cause, TransferError::Internal(_)));
    }

    #[tokio::test]
    async fn progress_reports_last_attempt_bytes() {
        let transport = MockTransport::new(vec![Ok(202)]);
        let worker = ChunkUploader::new(&transport, RetryPolicy::default(), CancellationToken::new());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressFn = {
            let seen = Arc::clone(&seen);
            Arc::new(move |sent| seen.lock().unwrap().push(sent))
        };

        worker
            .upload(&test_chunk(), "https://u.example/media", sink)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![4]);
    }
}
