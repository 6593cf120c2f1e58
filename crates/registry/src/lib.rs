//! Process-wide table of live transfer engines.
//!
//! The registry deduplicates transfers (at most one live engine per upload
//! id), mirrors every engine state change into the checkpoint store through
//! a relay observer, re-broadcasts the managed set to external listeners,
//! and reconstructs engines from persisted checkpoints on demand.
//!
//! The registry is an explicitly constructed service: the store and
//! transport are injected, nothing is a process-wide static.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use medialift_protocol::{TransferState, UploadDescriptor};
use medialift_store::CheckpointStore;
use medialift_transfer::{ChunkTransport, TransferEngine};

/// Snapshot of one managed upload, broadcast to listeners on every change.
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub id: String,
    pub input_path: PathBuf,
    pub state: TransferState,
    pub acked_bytes: u64,
}

/// Managed-set callback. Receives the full current set, sorted by id.
pub type ListenerFn = Arc<dyn Fn(&[UploadSnapshot]) + Send + Sync>;

/// Opaque handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// One state change headed for the checkpoint file, applied off the
/// engine's dispatch path.
struct CheckpointWrite {
    state: TransferState,
    descriptor: UploadDescriptor,
    input_path: PathBuf,
    acked_bytes: u64,
}

struct RegistryInner {
    store: Arc<CheckpointStore>,
    transport: Arc<dyn ChunkTransport>,
    engines: Mutex<HashMap<String, Arc<TransferEngine>>>,
    listeners: Mutex<HashMap<u64, ListenerFn>>,
    next_token: AtomicU64,
    /// Feeds the checkpoint writer; file I/O never runs on an engine's
    /// control path.
    store_tx: mpsc::UnboundedSender<CheckpointWrite>,
}

/// Process-wide registry of live transfer engines.
pub struct UploadRegistry {
    inner: Arc<RegistryInner>,
}

impl UploadRegistry {
    /// Creates a registry over an injected store and transport.
    ///
    /// Must be called from within a tokio runtime: the registry owns a
    /// checkpoint-writer task that drains relay updates on a blocking
    /// thread, in order, so the engines never wait on the disk. The writer
    /// exits when the registry is dropped.
    pub fn new(store: Arc<CheckpointStore>, transport: Arc<dyn ChunkTransport>) -> Self {
        let (store_tx, mut store_rx) = mpsc::unbounded_channel::<CheckpointWrite>();
        let writer_store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            while let Some(write) = store_rx.blocking_recv() {
                writer_store.update(
                    &write.state,
                    &write.descriptor,
                    &write.input_path,
                    write.acked_bytes,
                );
            }
        });

        Self {
            inner: Arc::new(RegistryInner {
                store,
                transport,
                engines: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                store_tx,
            }),
        }
    }

    /// Records an engine under its descriptor id and subscribes the relay
    /// observer that mirrors state changes into the store and re-broadcasts
    /// the managed set.
    ///
    /// At most one live engine per id: a previous engine under the same id
    /// is cancelled and replaced.
    pub fn register(&self, engine: TransferEngine) -> Arc<TransferEngine> {
        let engine = Arc::new(engine);
        let id = engine.descriptor().id.clone();

        let replaced = self
            .inner
            .engines
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::clone(&engine));
        if let Some(old) = replaced {
            warn!(upload = %id, "replacing live engine registered under the same id");
            old.cancel();
        }

        let relay_inner = Arc::downgrade(&self.inner);
        let relay_engine = Arc::downgrade(&engine);
        engine.add_observer(Arc::new(move |state| {
            let (Some(inner), Some(engine)) = (relay_inner.upgrade(), relay_engine.upgrade())
            else {
                return;
            };
            // Hand the write to the checkpoint writer; a send after the
            // registry shut down only means there is nothing left to persist.
            let _ = inner.store_tx.send(CheckpointWrite {
                state: state.clone(),
                descriptor: engine.descriptor().clone(),
                input_path: engine.input_path().to_path_buf(),
                acked_bytes: engine.acked_bytes(),
            });
            RegistryInner::broadcast(&inner);
        }));

        debug!(upload = %id, "engine registered");
        RegistryInner::broadcast(&self.inner);
        engine
    }

    /// Builds a fresh engine over the registry's transport and registers it.
    pub fn create(
        &self,
        descriptor: UploadDescriptor,
        input_path: impl Into<PathBuf>,
    ) -> Arc<TransferEngine> {
        self.register(TransferEngine::new(
            descriptor,
            input_path.into(),
            Arc::clone(&self.inner.transport),
        ))
    }

    /// Returns the live (non-terminal) engine for `id`, if any, so a
    /// repeated start reuses rather than races a second transfer.
    pub fn find_active(&self, id: &str) -> Option<Arc<TransferEngine>> {
        self.inner
            .engines
            .lock()
            .unwrap()
            .get(id)
            .filter(|e| !e.state().is_terminal())
            .cloned()
    }

    /// Returns the live engine uploading `input_path`, if any.
    pub fn find_by_path(&self, input_path: &Path) -> Option<Arc<TransferEngine>> {
        self.inner
            .engines
            .lock()
            .unwrap()
            .values()
            .find(|e| e.input_path() == input_path && !e.state().is_terminal())
            .cloned()
    }

    /// Removes `id` from the live table and from persistence, cancelling any
    /// still-running engine. Invoked on success, non-retryable failure, and
    /// explicit cancellation.
    pub fn acknowledge(&self, id: &str) {
        let engine = self.inner.engines.lock().unwrap().remove(id);
        if let Some(engine) = engine {
            engine.cancel();
        }
        self.inner.store.remove(id);
        RegistryInner::broadcast(&self.inner);
        info!(upload = %id, "acknowledged");
    }

    /// Reconstructs an engine from the persisted checkpoint for `id` and
    /// starts it immediately. Reuses a live engine if one exists.
    pub fn resume(&self, id: &str) -> Option<Arc<TransferEngine>> {
        if let Some(live) = self.find_active(id) {
            debug!(upload = %id, "resume reuses live engine");
            live.start();
            return Some(live);
        }

        let entry = self.inner.store.read_entry(id)?;
        info!(upload = %id, acked = entry.acked_bytes, "resuming from checkpoint");
        let engine = TransferEngine::resumed(
            entry.descriptor,
            entry.input_path,
            Arc::clone(&self.inner.transport),
            entry.acked_bytes,
        );
        let engine = self.register(engine);
        engine.start();
        Some(engine)
    }

    /// Resumes every persisted checkpoint; intended for process-startup
    /// recovery.
    pub fn resume_all(&self) -> Vec<Arc<TransferEngine>> {
        self.inner
            .store
            .read_all()
            .into_iter()
            .filter_map(|entry| self.resume(&entry.descriptor.id))
            .collect()
    }

    /// Current managed set, sorted by id.
    pub fn snapshots(&self) -> Vec<UploadSnapshot> {
        RegistryInner::snapshots(&self.inner)
    }

    /// Registers a managed-set listener. Fired on every state change of any
    /// managed engine.
    pub fn add_listener(&self, listener: ListenerFn) -> ListenerToken {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().unwrap().insert(token, listener);
        ListenerToken(token)
    }

    /// Removes a previously registered listener. Unknown tokens are ignored.
    pub fn remove_listener(&self, token: ListenerToken) {
        self.inner.listeners.lock().unwrap().remove(&token.0);
    }
}

impl RegistryInner {
    fn snapshots(inner: &Arc<RegistryInner>) -> Vec<UploadSnapshot> {
        let mut snapshots: Vec<UploadSnapshot> = inner
            .engines
            .lock()
            .unwrap()
            .values()
            .map(|e| UploadSnapshot {
                id: e.descriptor().id.clone(),
                input_path: e.input_path().to_path_buf(),
                state: e.state(),
                acked_bytes: e.acked_bytes(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Notifies listeners with the current managed set. The listener set is
    /// snapshotted before dispatch; both locks are released while callbacks
    /// run.
    fn broadcast(inner: &Arc<RegistryInner>) {
        let snapshots = Self::snapshots(inner);
        let listeners: Vec<ListenerFn> =
            inner.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            listener(&snapshots);
        }
    }
}
