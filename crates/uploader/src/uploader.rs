//! Upload pipeline orchestration.
//!
//! [`MediaUploader`] wires the registry and the collaborator seams together;
//! [`UploadHandle`] drives one upload through the pipeline:
//!
//! `started -> [inspecting -> standardizing] -> [awaitingConfirmation]
//!  -> transporting -> finished`
//!
//! The bracketed stages only run for fresh uploads; resuming a persisted
//! checkpoint or a live transfer re-attaches directly at `transporting`,
//! because the inspection decision was made when the upload first started.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use medialift_protocol::{
    Progress, TransferState, UploadDescriptor, UploadError, UploadResult, UploadStatus,
};
use medialift_registry::UploadRegistry;
use medialift_transfer::TransferEngine;

use crate::standardize::{Inspection, MediaStandardizer};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Byte-level progress callback, fired from the pipeline task.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Terminal outcome callback. Invoked at most once.
pub type ResultCallback = Box<dyn FnOnce(Result<UploadResult, UploadError>) + Send>;

/// Entry point of the upload pipeline. Cheap to clone per upload site; the
/// registry, standardizer and telemetry sink are shared.
pub struct MediaUploader {
    registry: Arc<UploadRegistry>,
    standardizer: Arc<dyn MediaStandardizer>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl MediaUploader {
    pub fn new(
        registry: Arc<UploadRegistry>,
        standardizer: Arc<dyn MediaStandardizer>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            registry,
            standardizer,
            telemetry,
        }
    }

    pub fn registry(&self) -> &Arc<UploadRegistry> {
        &self.registry
    }

    /// Creates a handle for one upload. Nothing runs until
    /// [`UploadHandle::start`].
    pub fn handle(&self, descriptor: UploadDescriptor, source: impl Into<PathBuf>) -> UploadHandle {
        let (status_tx, _) = watch::channel(UploadStatus::Ready);
        UploadHandle {
            inner: Arc::new(HandleInner {
                descriptor,
                source: source.into(),
                registry: Arc::clone(&self.registry),
                standardizer: Arc::clone(&self.standardizer),
                telemetry: Arc::clone(&self.telemetry),
                status_tx,
                engine: Mutex::new(None),
                progress_cb: Mutex::new(None),
                result_cb: Mutex::new(None),
                confirmed: Notify::new(),
                cancel: CancellationToken::new(),
                driving: AtomicBool::new(false),
            }),
        }
    }
}

/// Control surface for one upload moving through the pipeline.
///
/// A handle drives at most one pipeline run. `start` after a pause resumes
/// the transfer; `start` on a finished handle is a no-op.
#[derive(Clone)]
pub struct UploadHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    descriptor: UploadDescriptor,
    source: PathBuf,
    registry: Arc<UploadRegistry>,
    standardizer: Arc<dyn MediaStandardizer>,
    telemetry: Arc<dyn TelemetrySink>,
    status_tx: watch::Sender<UploadStatus>,
    engine: Mutex<Option<Arc<TransferEngine>>>,
    progress_cb: Mutex<Option<ProgressCallback>>,
    result_cb: Mutex<Option<ResultCallback>>,
    confirmed: Notify,
    cancel: CancellationToken,
    driving: AtomicBool,
}

/// Outcome of the pre-transport stages.
enum Prepared {
    Proceed(PathBuf),
    Abort(UploadError),
}

impl UploadHandle {
    pub fn id(&self) -> &str {
        &self.inner.descriptor.id
    }

    pub fn source(&self) -> &Path {
        &self.inner.source
    }

    /// Current pipeline status.
    pub fn status(&self) -> UploadStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Watch channel over pipeline status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<UploadStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Transfer-level state, once the transport stage is reached.
    pub fn transfer_state(&self) -> Option<TransferState> {
        self.inner
            .engine
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.state())
    }

    /// Registers the byte-progress callback. Replaces any previous one.
    pub fn on_progress(&self, callback: impl Fn(Progress) + Send + Sync + 'static) {
        *self.inner.progress_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Registers the terminal outcome callback. Invoked at most once.
    pub fn on_result(
        &self,
        callback: impl FnOnce(Result<UploadResult, UploadError>) + Send + 'static,
    ) {
        *self.inner.result_cb.lock().unwrap() = Some(Box::new(callback));
    }

    /// Starts (or resumes) the pipeline.
    ///
    /// With `force_restart` any live transfer and persisted checkpoint for
    /// this upload id are discarded first; otherwise an existing transfer or
    /// checkpoint is re-attached and the pre-transport stages are skipped.
    pub fn start(&self, force_restart: bool) {
        {
            let engine = self.inner.engine.lock().unwrap();
            if let Some(engine) = engine.as_ref()
                && engine.state().is_resumable()
                && !force_restart
            {
                engine.start();
                return;
            }
        }

        if self.inner.driving.swap(true, Ordering::SeqCst) {
            debug!(
                upload = %self.inner.descriptor.id,
                "start ignored, pipeline already running"
            );
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.drive(force_restart));
    }

    /// Pauses the transfer at the last acknowledged chunk boundary.
    pub fn pause(&self) {
        let engine = self.inner.engine.lock().unwrap().clone();
        match engine {
            Some(engine) => engine.pause(),
            None => debug!(
                upload = %self.inner.descriptor.id,
                "pause ignored, transport not active"
            ),
        }
    }

    /// Cancels the upload and discards its registration and checkpoint.
    pub fn cancel(&self) {
        if !self.inner.driving.load(Ordering::SeqCst) {
            self.inner
                .telemetry
                .report(TelemetryEvent::UploadCancelled {
                    id: self.inner.descriptor.id.clone(),
                });
            self.inner.finish(Err(UploadError::Cancelled), false);
            return;
        }
        self.inner.cancel.cancel();
    }

    /// Releases a pipeline held in `awaitingConfirmation`. May be called
    /// before the pipeline reaches the gate.
    pub fn confirm(&self) {
        self.inner.confirmed.notify_one();
    }
}

impl HandleInner {
    async fn drive(self: Arc<Self>, force_restart: bool) {
        let id = self.descriptor.id.clone();
        self.set_status(UploadStatus::Started);

        if force_restart {
            self.registry.acknowledge(&id);
        }

        let engine = match self.registry.resume(&id) {
            Some(engine) => {
                info!(upload = %id, "attached to existing transfer");
                engine
            }
            None => {
                let source = match self.prepare().await {
                    Prepared::Proceed(path) => path,
                    Prepared::Abort(err) => {
                        self.telemetry
                            .report(TelemetryEvent::UploadCancelled { id });
                        self.finish(Err(err), false);
                        return;
                    }
                };

                if self.descriptor.require_confirmation {
                    self.set_status(UploadStatus::AwaitingConfirmation);
                    tokio::select! {
                        _ = self.confirmed.notified() => {}
                        _ = self.cancel.cancelled() => {
                            self.telemetry
                                .report(TelemetryEvent::UploadCancelled { id });
                            self.finish(Err(UploadError::Cancelled), false);
                            return;
                        }
                    }
                }

                let engine = self.registry.create(self.descriptor.clone(), source);
                engine.start();
                engine
            }
        };

        *self.engine.lock().unwrap() = Some(Arc::clone(&engine));
        self.set_status(UploadStatus::Transporting);

        let mut rx = engine.subscribe();
        let mut cancel_requested = self.cancel.is_cancelled();
        if cancel_requested {
            self.registry.acknowledge(&id);
        }

        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                TransferState::Uploading(progress) => {
                    self.set_status(UploadStatus::Transporting);
                    let cb = self.progress_cb.lock().unwrap().clone();
                    if let Some(cb) = cb {
                        cb(progress);
                    }
                }
                TransferState::Paused(_) => self.set_status(UploadStatus::Paused),
                TransferState::Succeeded(result) => {
                    self.registry.acknowledge(&id);
                    self.telemetry.report(TelemetryEvent::UploadSucceeded {
                        id,
                        bytes: result.bytes_uploaded,
                    });
                    self.finish(Ok(result), true);
                    return;
                }
                TransferState::Failed(failure) => {
                    self.registry.acknowledge(&id);
                    self.telemetry.report(TelemetryEvent::UploadFailed {
                        id,
                        error: failure.error.clone(),
                    });
                    self.finish(Err(failure.error), false);
                    return;
                }
                TransferState::Canceled => {
                    // If a newer engine was registered under this id, the
                    // cancellation came from being replaced; leave the
                    // replacement's registration and checkpoint alone.
                    match self.registry.find_active(&id) {
                        Some(live) if !Arc::ptr_eq(&live, &engine) => {}
                        _ => self.registry.acknowledge(&id),
                    }
                    self.telemetry
                        .report(TelemetryEvent::UploadCancelled { id });
                    self.finish(Err(UploadError::Cancelled), false);
                    return;
                }
                TransferState::Ready | TransferState::Starting => {}
            }

            if cancel_requested {
                if rx.changed().await.is_err() {
                    return;
                }
            } else {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = self.cancel.cancelled() => {
                        cancel_requested = true;
                        self.registry.acknowledge(&id);
                    }
                }
            }
        }
    }

    /// Runs inspection and standardization, resolving the file the transport
    /// stage will read.
    async fn prepare(&self) -> Prepared {
        if self.descriptor.skip_inspection {
            return Prepared::Proceed(self.source.clone());
        }

        let id = &self.descriptor.id;
        self.set_status(UploadStatus::Inspecting);
        let inspection = tokio::select! {
            r = self.standardizer.inspect(&self.source) => r,
            _ = self.cancel.cancelled() => return Prepared::Abort(UploadError::Cancelled),
        };

        let reasons = match inspection {
            Ok(Inspection::Standard) => return Prepared::Proceed(self.source.clone()),
            Ok(Inspection::NonStandard { reasons }) => reasons,
            Err(e) => {
                warn!(upload = %id, error = %e, "inspection failed, transporting original");
                return Prepared::Proceed(self.source.clone());
            }
        };

        info!(upload = %id, ?reasons, "source needs standardization");
        self.set_status(UploadStatus::Standardizing);
        let standardized = tokio::select! {
            r = self.standardizer.standardize(&self.source) => r,
            _ = self.cancel.cancelled() => return Prepared::Abort(UploadError::Cancelled),
        };

        match standardized {
            Ok(substitute) => {
                self.set_status(UploadStatus::StandardizationSucceeded);
                self.telemetry.report(TelemetryEvent::StandardizationApplied {
                    id: id.clone(),
                    reasons,
                });
                Prepared::Proceed(substitute)
            }
            Err(e) => {
                self.set_status(UploadStatus::StandardizationFailed);
                self.telemetry.report(TelemetryEvent::StandardizationFailed {
                    id: id.clone(),
                    error: e.to_string(),
                });
                if self.standardizer.cancel_on_failure() {
                    Prepared::Abort(UploadError::Cancelled)
                } else {
                    warn!(upload = %id, error = %e, "standardization failed, transporting original");
                    Prepared::Proceed(self.source.clone())
                }
            }
        }
    }

    /// Publishes a status transition. `finished` latches.
    fn set_status(&self, status: UploadStatus) {
        self.status_tx.send_if_modified(|current| {
            if current.is_finished() || *current == status {
                return false;
            }
            debug!(upload = %self.descriptor.id, ?status, "pipeline status");
            *current = status;
            true
        });
    }

    /// Terminal transition: latches the status and fires the outcome
    /// callback exactly once.
    fn finish(&self, result: Result<UploadResult, UploadError>, success: bool) {
        let cb = self.result_cb.lock().unwrap().take();
        self.set_status(UploadStatus::Finished { success });
        if let Some(cb) = cb {
            cb(result);
        }
    }
}
