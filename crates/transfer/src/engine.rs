//! Whole-file transfer engine: state machine, pause/resume/cancel, observer
//! fan-out.
//!
//! One engine drives one file end to end. Chunks are uploaded strictly
//! sequentially by a single control task, bounding memory to one chunk
//! buffer and keeping progress accounting trivial. Engines are single-use
//! past a terminal state; `Paused` is the only non-terminal state that
//! supports re-`start()` on the same instance.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use medialift_protocol::{Progress, TransferState, UploadDescriptor, UploadFailure, UploadResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::ChunkReader;
use crate::transport::{ChunkTransport, ProgressFn};
use crate::worker::{ChunkUploader, RetryPolicy};
use crate::TransferError;

/// State-change callback. Invoked for every transition, in generation
/// order, after the new state is visible through [`TransferEngine::state`].
pub type ObserverFn = Arc<dyn Fn(&TransferState) + Send + Sync>;

/// Opaque handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    Pause,
    Cancel,
}

struct ActiveRun {
    cancel: CancellationToken,
    stop: Arc<Mutex<Option<StopKind>>>,
}

/// Pending observer notifications, in transition order.
///
/// Transitions are enqueued under the lock but dispatched outside it, so
/// an observer may freely call back into the engine; a re-entrant
/// transition is appended and delivered by the active drainer.
#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<TransferState>,
    draining: bool,
}

struct EngineInner {
    descriptor: UploadDescriptor,
    input_path: PathBuf,
    transport: Arc<dyn ChunkTransport>,
    state_tx: watch::Sender<TransferState>,
    /// Serializes transitions so observers see them in generation order.
    dispatch: Mutex<DispatchQueue>,
    observers: Mutex<HashMap<u64, ObserverFn>>,
    next_token: AtomicU64,
    /// Last fully-acknowledged byte offset; the resumable checkpoint.
    acked: AtomicU64,
    progress: Mutex<Progress>,
    run: Mutex<Option<ActiveRun>>,
}

/// Drives one file's end-to-end chunked upload.
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    /// Engine for a fresh transfer starting at byte 0.
    pub fn new(
        descriptor: UploadDescriptor,
        input_path: impl Into<PathBuf>,
        transport: Arc<dyn ChunkTransport>,
    ) -> Self {
        Self::build(descriptor, input_path.into(), transport, 0, TransferState::Ready)
    }

    /// Engine seeded from a previously persisted checkpoint. Starts in
    /// `Paused` at `acked_bytes` so `start()` resumes mid-file.
    pub fn resumed(
        descriptor: UploadDescriptor,
        input_path: impl Into<PathBuf>,
        transport: Arc<dyn ChunkTransport>,
        acked_bytes: u64,
    ) -> Self {
        let progress = Progress::at(acked_bytes, 0);
        Self::build(
            descriptor,
            input_path.into(),
            transport,
            acked_bytes,
            TransferState::Paused(progress),
        )
    }

    fn build(
        descriptor: UploadDescriptor,
        input_path: PathBuf,
        transport: Arc<dyn ChunkTransport>,
        acked: u64,
        state: TransferState,
    ) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            inner: Arc::new(EngineInner {
                descriptor,
                input_path,
                transport,
                state_tx,
                dispatch: Mutex::new(DispatchQueue::default()),
                observers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                acked: AtomicU64::new(acked),
                progress: Mutex::new(Progress::at(acked, 0)),
                run: Mutex::new(None),
            }),
        }
    }

    /// Launches (or resumes) the transfer loop.
    ///
    /// Valid only from `Ready` or `Paused`; otherwise a no-op with a
    /// diagnostic log.
    pub fn start(&self) {
        let inner = &self.inner;
        let cancel = CancellationToken::new();
        let stop = Arc::new(Mutex::new(None));
        {
            let mut run = inner.run.lock().unwrap();
            if run.is_some() {
                debug!(upload = %inner.descriptor.id, "start ignored, transfer already running");
                return;
            }
            let current = inner.state_tx.borrow().clone();
            match current {
                TransferState::Ready | TransferState::Paused(_) => {}
                other => {
                    warn!(
                        upload = %inner.descriptor.id,
                        state = other.name(),
                        "start ignored from non-startable state"
                    );
                    return;
                }
            }
            *run = Some(ActiveRun {
                cancel: cancel.clone(),
                stop: Arc::clone(&stop),
            });
        }

        EngineInner::set_state(inner, TransferState::Starting);

        let task_inner = Arc::clone(inner);
        tokio::spawn(async move {
            EngineInner::run_transfer(task_inner, cancel, stop).await;
        });
    }

    /// Cooperatively stops the in-flight loop, leaving the engine `Paused`
    /// at the last acknowledged chunk boundary. No-op if nothing is running.
    pub fn pause(&self) {
        let run = self.inner.run.lock().unwrap();
        match run.as_ref() {
            Some(active) => {
                *active.stop.lock().unwrap() = Some(StopKind::Pause);
                active.cancel.cancel();
                info!(upload = %self.inner.descriptor.id, "pause requested");
            }
            None => {
                debug!(upload = %self.inner.descriptor.id, "pause ignored, no active transfer");
            }
        }
    }

    /// Terminal regardless of phase: discards in-flight work and transitions
    /// to `Canceled`. A new engine must be constructed to retry.
    pub fn cancel(&self) {
        {
            let run = self.inner.run.lock().unwrap();
            if let Some(active) = run.as_ref() {
                *active.stop.lock().unwrap() = Some(StopKind::Cancel);
                active.cancel.cancel();
                info!(upload = %self.inner.descriptor.id, "cancel requested");
                return;
            }
        }
        if self.inner.state_tx.borrow().is_terminal() {
            debug!(upload = %self.inner.descriptor.id, "cancel ignored, already terminal");
            return;
        }
        EngineInner::set_state(&self.inner, TransferState::Canceled);
    }

    /// Current state snapshot.
    pub fn state(&self) -> TransferState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch receiver over the state, for awaiting transitions.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.inner.state_tx.subscribe()
    }

    /// Last fully-acknowledged byte offset. Partial bytes of an in-flight or
    /// cancelled chunk are never included.
    pub fn acked_bytes(&self) -> u64 {
        self.inner.acked.load(Ordering::Relaxed)
    }

    pub fn descriptor(&self) -> &UploadDescriptor {
        &self.inner.descriptor
    }

    pub fn input_path(&self) -> &Path {
        &self.inner.input_path
    }

    /// Registers a state observer. Observers may be added or removed at any
    /// time; the set is snapshotted before each dispatch.
    pub fn add_observer(&self, observer: ObserverFn) -> ObserverToken {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().unwrap().insert(token, observer);
        ObserverToken(token)
    }

    /// Removes a previously registered observer. Unknown tokens are ignored.
    pub fn remove_observer(&self, token: ObserverToken) {
        self.inner.observers.lock().unwrap().remove(&token.0);
    }
}

impl EngineInner {
    /// Publishes a state transition. Terminal states latch: once reached,
    /// further transitions are dropped.
    ///
    /// The transition is recorded and enqueued under the dispatch lock, but
    /// observers run with the lock released, so a callback may mutate the
    /// engine (pause, cancel) without deadlocking; any transition it
    /// triggers is dispatched after the current one.
    fn set_state(inner: &Arc<EngineInner>, state: TransferState) {
        {
            let mut dispatch = inner.dispatch.lock().unwrap();
            if inner.state_tx.borrow().is_terminal() {
                debug!(
                    upload = %inner.descriptor.id,
                    dropped = state.name(),
                    "transition after terminal state dropped"
                );
                return;
            }
            debug!(upload = %inner.descriptor.id, state = state.name(), "state transition");
            inner.state_tx.send_replace(state.clone());
            dispatch.pending.push_back(state);
            if dispatch.draining {
                // A drainer further up the stack delivers this transition.
                return;
            }
            dispatch.draining = true;
        }

        loop {
            let next = {
                let mut dispatch = inner.dispatch.lock().unwrap();
                match dispatch.pending.pop_front() {
                    Some(state) => state,
                    None => {
                        dispatch.draining = false;
                        return;
                    }
                }
            };
            let observers: Vec<ObserverFn> =
                inner.observers.lock().unwrap().values().cloned().collect();
            for observer in observers {
                observer(&next);
            }
        }
    }

    /// Records byte-level progress (clamped monotonic) and publishes an
    /// `Uploading` snapshot.
    fn publish_progress(inner: &Arc<EngineInner>, completed: u64) {
        let snapshot = {
            let mut p = inner.progress.lock().unwrap();
            if completed > p.completed_bytes {
                p.completed_bytes = completed;
            }
            p.updated_at = Utc::now();
            *p
        };
        Self::set_state(inner, TransferState::Uploading(snapshot));
    }

    async fn run_transfer(
        inner: Arc<EngineInner>,
        cancel: CancellationToken,
        stop: Arc<Mutex<Option<StopKind>>>,
    ) {
        let resume_from = inner.acked.load(Ordering::Relaxed);
        let outcome = Self::transfer_loop(&inner, resume_from, &cancel).await;

        *inner.run.lock().unwrap() = None;

        match outcome {
            Ok(result) => {
                info!(
                    upload = %inner.descriptor.id,
                    bytes = result.bytes_uploaded,
                    "transfer succeeded"
                );
                Self::set_state(&inner, TransferState::Succeeded(result));
            }
            Err(TransferError::Cancelled) => {
                let kind = stop.lock().unwrap().take().unwrap_or(StopKind::Cancel);
                match kind {
                    StopKind::Pause => {
                        // The resumable offset is the last acknowledged chunk
                        // boundary; partial bytes of the cancelled chunk are
                        // discarded.
                        let acked = inner.acked.load(Ordering::Relaxed);
                        let snapshot = {
                            let mut p = inner.progress.lock().unwrap();
                            p.completed_bytes = acked;
                            p.updated_at = Utc::now();
                            *p
                        };
                        info!(upload = %inner.descriptor.id, acked, "transfer paused");
                        Self::set_state(&inner, TransferState::Paused(snapshot));
                    }
                    StopKind::Cancel => {
                        info!(upload = %inner.descriptor.id, "transfer canceled");
                        Self::set_state(&inner, TransferState::Canceled);
                    }
                }
            }
            Err(e) => {
                let acked = inner.acked.load(Ordering::Relaxed);
                warn!(upload = %inner.descriptor.id, acked, error = %e, "transfer failed");
                Self::set_state(
                    &inner,
                    TransferState::Failed(UploadFailure {
                        error: (&e).into(),
                        acked_bytes: acked,
                    }),
                );
            }
        }
    }

    async fn transfer_loop(
        inner: &Arc<EngineInner>,
        resume_from: u64,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, TransferError> {
        let descriptor = &inner.descriptor;
        let mut reader = ChunkReader::new(&inner.input_path, descriptor.chunk_size);
        reader.open()?;
        if resume_from > 0 {
            reader.seek(resume_from)?;
        }

        let total = reader.total_size();
        let started = Utc::now();
        {
            let mut p = inner.progress.lock().unwrap();
            *p = Progress {
                completed_bytes: resume_from,
                total_bytes: total,
                started_at: started,
                updated_at: started,
            };
        }
        Self::publish_progress(inner, resume_from);

        let mut acked = resume_from;
        loop {
            if cancel.is_cancelled() {
                reader.close();
                return Err(TransferError::Cancelled);
            }

            let chunk = match reader.read_next_chunk() {
                Ok(c) => c,
                Err(e) => {
                    reader.close();
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                break;
            }

            let worker = ChunkUploader::new(
                inner.transport.as_ref(),
                RetryPolicy::limited(descriptor.max_retries),
                cancel.clone(),
            );

            // The transport reports byte counts from its own execution
            // context; marshal them through a watch channel onto this
            // control path before touching shared progress.
            let (progress_tx, mut progress_rx) = watch::channel(0u64);
            let on_progress: ProgressFn = Arc::new(move |sent| {
                let _ = progress_tx.send(sent);
            });

            let result = {
                let mut upload = pin!(worker.upload(&chunk, &descriptor.destination, on_progress));
                let mut channel_open = true;
                loop {
                    if !channel_open {
                        break (&mut upload).await;
                    }
                    tokio::select! {
                        res = &mut upload => break res,
                        changed = progress_rx.changed() => match changed {
                            Ok(()) => {
                                let sent = *progress_rx.borrow_and_update();
                                Self::publish_progress(inner, acked + sent);
                            }
                            Err(_) => channel_open = false,
                        }
                    }
                }
            };

            match result {
                Ok(outcome) => {
                    acked += outcome.bytes;
                    inner.acked.store(acked, Ordering::Relaxed);
                    Self::publish_progress(inner, acked);
                    if chunk.len() < descriptor.chunk_size {
                        // Short chunk: end of file; skip the terminal read.
                        break;
                    }
                }
                Err(err) => {
                    reader.close();
                    if err.is_cancellation() {
                        return Err(TransferError::Cancelled);
                    }
                    return Err(err.cause);
                }
            }
        }

        reader.close();
        Ok(UploadResult {
            bytes_uploaded: acked,
            started_at: started,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChunkRequest;
    use std::future::Future;
    use std::io::Write;
    use std::pin::Pin;
    use std::time::Duration;

    /// Mock transport: scripted statuses (default 200), optional call index
    /// that blocks until cancelled.
    struct MockTransport {
        statuses: Mutex<Vec<u16>>,
        calls: Mutex<Vec<(u64, u64)>>,
        block_on_call: Mutex<Option<usize>>,
    }

    impl MockTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                block_on_call: Mutex::new(None),
            })
        }

        fn scripted(statuses: Vec<u16>) -> Arc<Self> {
            let t = Self::ok();
            *t.statuses.lock().unwrap() = statuses;
            t
        }

        fn block_on(&self, call: usize) {
            *self.block_on_call.lock().unwrap() = Some(call);
        }

        fn unblock(&self) {
            *self.block_on_call.lock().unwrap() = None;
        }

        fn ranges(&self) -> Vec<(u64, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ChunkTransport for MockTransport {
        fn put_chunk<'a>(
            &'a self,
            req: ChunkRequest<'a>,
            on_progress: ProgressFn,
        ) -> Pin<Box<dyn Future<Output = Result<u16, TransferError>> + Send + 'a>> {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((req.start, req.end));
                calls.len() - 1
            };
            let len = req.data.len() as u64;
            Box::pin(async move {
                if *self.block_on_call.lock().unwrap() == Some(index) {
                    futures_util::future::pending::<()>().await;
                }
                on_progress(len);
                let mut statuses = self.statuses.lock().unwrap();
                if statuses.is_empty() {
                    Ok(200)
                } else {
                    Ok(statuses.remove(0))
                }
            })
        }
    }

    fn test_file(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("clip.mp4");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn descriptor(chunk_size: u64) -> UploadDescriptor {
        let mut d = UploadDescriptor::with_id("u1", "https://upload.example/v1/media");
        d.chunk_size = chunk_size;
        d
    }

    async fn wait_for_state<F>(engine: &TransferEngine, pred: F) -> TransferState
    where
        F: Fn(&TransferState) -> bool,
    {
        let mut rx = engine.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&rx.borrow()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state not reached in time")
    }

    async fn wait_for_calls(transport: &Arc<MockTransport>, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.ranges().len() < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("transport calls not reached in time");
    }

    #[tokio::test]
    async fn uploads_whole_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789");
        let transport = MockTransport::ok();

        let engine = TransferEngine::new(descriptor(4), &path, transport.clone());
        assert_eq!(engine.state(), TransferState::Ready);
        engine.start();

        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        let TransferState::Succeeded(result) = state else {
            panic!("expected success, got {state:?}");
        };
        assert_eq!(result.bytes_uploaded, 10);
        assert_eq!(transport.ranges(), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(engine.acked_bytes(), 10);
    }

    #[tokio::test]
    async fn exact_multiple_of_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"01234567");
        let transport = MockTransport::ok();

        let engine = TransferEngine::new(descriptor(4), &path, transport.clone());
        engine.start();

        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        assert!(matches!(state, TransferState::Succeeded(r) if r.bytes_uploaded == 8));
        // The zero-length terminal chunk is never transmitted.
        assert_eq!(transport.ranges(), vec![(0, 4), (4, 8)]);
    }

    #[tokio::test]
    async fn empty_file_succeeds_without_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"");
        let transport = MockTransport::ok();

        let engine = TransferEngine::new(descriptor(4), &path, transport.clone());
        engine.start();

        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        assert!(matches!(state, TransferState::Succeeded(r) if r.bytes_uploaded == 0));
        assert!(transport.ranges().is_empty());
    }

    #[tokio::test]
    async fn fatal_status_fails_with_acked_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789");
        let transport = MockTransport::scripted(vec![200, 404]);

        let engine = TransferEngine::new(descriptor(4), &path, transport.clone());
        engine.start();

        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        let TransferState::Failed(failure) = state else {
            panic!("expected failure");
        };
        assert!(matches!(
            failure.error,
            medialift_protocol::UploadError::Http { code: 404, .. }
        ));
        // First chunk acknowledged, second failed; the payload carries the
        // acknowledged offset for diagnostics.
        assert_eq!(failure.acked_bytes, 4);
        assert_eq!(engine.acked_bytes(), 4);
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::ok();

        let engine =
            TransferEngine::new(descriptor(4), dir.path().join("missing.mp4"), transport);
        engine.start();

        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        assert!(matches!(
            state,
            TransferState::Failed(f) if matches!(f.error, medialift_protocol::UploadError::File(_))
        ));
    }

    #[tokio::test]
    async fn pause_then_resume_matches_uninterrupted_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789");
        let transport = MockTransport::ok();
        transport.block_on(2); // third chunk hangs in flight

        let engine = TransferEngine::new(descriptor(4), &path, transport.clone());
        engine.start();
        wait_for_calls(&transport, 3).await;

        engine.pause();
        let state = wait_for_state(&engine, |s| matches!(s, TransferState::Paused(_))).await;
        let TransferState::Paused(progress) = state else {
            unreachable!()
        };
        // Offset is the last acknowledged chunk boundary, not the partial chunk.
        assert_eq!(progress.completed_bytes, 8);
        assert_eq!(engine.acked_bytes(), 8);

        transport.unblock();
        engine.start();
        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        let TransferState::Succeeded(result) = state else {
            panic!("expected success, got {state:?}");
        };
        // Same final byte count as an uninterrupted run.
        assert_eq!(result.bytes_uploaded, 10);
        // The interrupted chunk was retransmitted from its boundary.
        assert_eq!(transport.ranges().last(), Some(&(8, 10)));
    }

    #[tokio::test]
    async fn resumed_engine_starts_mid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789");
        let transport = MockTransport::ok();

        let engine = TransferEngine::resumed(descriptor(4), &path, transport.clone(), 8);
        assert!(matches!(engine.state(), TransferState::Paused(_)));
        engine.start();

        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        assert!(matches!(state, TransferState::Succeeded(r) if r.bytes_uploaded == 10));
        assert_eq!(transport.ranges(), vec![(8, 10)]);
    }

    #[tokio::test]
    async fn cancel_mid_transfer_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789");
        let transport = MockTransport::ok();
        transport.block_on(1);

        let engine = TransferEngine::new(descriptor(4), &path, transport.clone());
        engine.start();
        wait_for_calls(&transport, 2).await;

        engine.cancel();
        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        assert_eq!(state, TransferState::Canceled);

        // Terminal: start is a no-op.
        engine.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.state(), TransferState::Canceled);
    }

    #[tokio::test]
    async fn cancel_from_ready_without_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"abc");
        let engine = TransferEngine::new(descriptor(4), &path, MockTransport::ok());

        engine.cancel();
        assert_eq!(engine.state(), TransferState::Canceled);
        // Idempotent.
        engine.cancel();
        assert_eq!(engine.state(), TransferState::Canceled);
    }

    #[tokio::test]
    async fn observers_see_transitions_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789");
        let engine = TransferEngine::new(descriptor(4), &path, MockTransport::ok());

        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.add_observer(Arc::new(move |state| {
            sink.lock().unwrap().push(state.name());
        }));

        engine.start();
        wait_for_state(&engine, TransferState::is_terminal).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&"starting"));
        assert_eq!(seen.last(), Some(&"succeeded"));
        assert!(seen.contains(&"uploading"));
        // No transitions after the terminal one.
        assert_eq!(seen.iter().filter(|s| **s == "succeeded").count(), 1);
    }

    #[tokio::test]
    async fn observer_may_mutate_the_engine_during_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789");
        let transport = MockTransport::ok();
        transport.block_on(2);

        let engine = Arc::new(TransferEngine::new(descriptor(4), &path, transport.clone()));

        // An observer that reacts to a pause by cancelling must not
        // deadlock the dispatch path.
        let target = Arc::clone(&engine);
        engine.add_observer(Arc::new(move |state| {
            if matches!(state, TransferState::Paused(_)) {
                target.cancel();
            }
        }));

        engine.start();
        wait_for_calls(&transport, 3).await;
        engine.pause();

        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        assert_eq!(state, TransferState::Canceled);
    }

    #[tokio::test]
    async fn removed_observer_is_not_called() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"abcd");
        let engine = TransferEngine::new(descriptor(4), &path, MockTransport::ok());

        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        let token = engine.add_observer(Arc::new(move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        }));
        engine.remove_observer(token);

        engine.start();
        wait_for_state(&engine, TransferState::is_terminal).await;
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn uploading_progress_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_file(dir.path(), b"0123456789abcdef");
        // Retryable status on the second chunk: its partial bytes reset, but
        // reported progress must not go backwards.
        let transport = MockTransport::scripted(vec![200, 503, 200, 200, 200]);

        let engine = TransferEngine::new(descriptor(4), &path, transport);

        let watermarks: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&watermarks);
        engine.add_observer(Arc::new(move |state| {
            if let TransferState::Uploading(p) = state {
                sink.lock().unwrap().push(p.completed_bytes);
            }
        }));

        engine.start();
        let state = wait_for_state(&engine, TransferState::is_terminal).await;
        assert!(matches!(state, TransferState::Succeeded(_)));

        let watermarks = watermarks.lock().unwrap();
        assert!(watermarks.windows(2).all(|w| w[0] <= w[1]), "{watermarks:?}");
    }
}
