//! Durable checkpoint store: upload identity → [`CheckpointEntry`].
//!
//! A write-through cache over one JSON file. Every mutation rewrites the
//! whole backing file atomically from the in-memory map; writes happen per
//! chunk, not per byte, so the wholesale rewrite trades write efficiency
//! for correctness against partial-write corruption.
//!
//! Persistence is best-effort: failures are logged and swallowed, and must
//! never block or fail a transfer. A missing or malformed backing file is
//! an empty store, never an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use medialift_protocol::{CheckpointEntry, PriorState, TransferState, UploadDescriptor};

/// Checkpoint retention window. Entries older than this are purged when the
/// store opens.
const RETENTION_DAYS: i64 = 3;

/// Durable mapping from upload identity to checkpoint state.
///
/// All access is serialized by an internal mutex (single-writer
/// discipline). The backing file is lazily opened and cached on first
/// access per store instance.
pub struct CheckpointStore {
    path: PathBuf,
    retention: Duration,
    cache: Mutex<Option<HashMap<String, CheckpointEntry>>>,
}

impl CheckpointStore {
    /// Store backed by `path` with the default 3-day retention.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_retention(path, Duration::days(RETENTION_DAYS))
    }

    /// Store with an explicit retention window.
    pub fn with_retention(path: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            path: path.into(),
            retention,
            cache: Mutex::new(None),
        }
    }

    /// Mirrors a state change into persistence.
    ///
    /// Resumable states (`starting`/`uploading`/`paused`) upsert an entry;
    /// terminal states remove it. `acked_bytes` must be the last fully
    /// acknowledged chunk boundary. Never fails: persistence errors are
    /// logged and swallowed.
    pub fn update(
        &self,
        state: &TransferState,
        descriptor: &UploadDescriptor,
        input_path: &Path,
        acked_bytes: u64,
    ) {
        let Some(prior_state) = PriorState::of(state) else {
            if state.is_terminal() {
                self.remove(&descriptor.id);
            }
            return;
        };

        let mut cache = self.cache.lock().unwrap();
        let map = self.loaded(&mut cache);

        // Progress updates arrive per transport frame, but the checkpoint
        // only changes per acknowledged chunk. Skip the rewrite when the
        // durable content is unchanged.
        if let Some(existing) = map.get(&descriptor.id)
            && existing.acked_bytes == acked_bytes
            && existing.prior_state == prior_state
        {
            return;
        }

        map.insert(
            descriptor.id.clone(),
            CheckpointEntry {
                saved_at: Utc::now(),
                prior_state,
                acked_bytes,
                descriptor: descriptor.clone(),
                input_path: input_path.to_path_buf(),
            },
        );
        if let Err(e) = self.persist(map) {
            warn!(upload = %descriptor.id, error = %e, "failed to persist checkpoint");
        }
    }

    /// Removes the entry for `id`, if present. Never fails.
    pub fn remove(&self, id: &str) {
        let mut cache = self.cache.lock().unwrap();
        let map = self.loaded(&mut cache);
        if map.remove(id).is_some() {
            if let Err(e) = self.persist(map) {
                warn!(upload = %id, error = %e, "failed to persist checkpoint removal");
            }
        }
    }

    /// Returns the checkpoint for `id`, if one exists.
    pub fn read_entry(&self, id: &str) -> Option<CheckpointEntry> {
        let mut cache = self.cache.lock().unwrap();
        self.loaded(&mut cache).get(id).cloned()
    }

    /// Returns all live checkpoints.
    pub fn read_all(&self) -> Vec<CheckpointEntry> {
        let mut cache = self.cache.lock().unwrap();
        let mut entries: Vec<CheckpointEntry> = self.loaded(&mut cache).values().cloned().collect();
        entries.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        entries
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn loaded<'a>(
        &self,
        cache: &'a mut Option<HashMap<String, CheckpointEntry>>,
    ) -> &'a mut HashMap<String, CheckpointEntry> {
        cache.get_or_insert_with(|| self.load())
    }

    /// Loads the backing file, purging entries past the retention window
    /// before anything is returned.
    fn load(&self) -> HashMap<String, CheckpointEntry> {
        let entries: Vec<CheckpointEntry> = match fs::read_to_string(&self.path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "malformed checkpoint file, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "unreadable checkpoint file, starting empty");
                Vec::new()
            }
        };

        let cutoff = Utc::now() - self.retention;
        let (live, stale): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.saved_at > cutoff);
        if !stale.is_empty() {
            debug!(purged = stale.len(), "purged stale checkpoints");
        }

        live.into_iter()
            .map(|e| (e.descriptor.id.clone(), e))
            .collect()
    }

    /// Rewrites the whole backing file from the in-memory map, atomically
    /// (temp file + rename).
    fn persist(&self, map: &HashMap<String, CheckpointEntry>) -> std::io::Result<()> {
        let mut entries: Vec<&CheckpointEntry> = map.values().collect();
        entries.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        let json = serde_json::to_string_pretty(&entries)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(entries = map.len(), path = ?self.path, "persisted checkpoints");
        Ok(())
    }
}

/// Default checkpoint file location under the platform config directory.
pub fn default_checkpoint_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("medialift").join("checkpoints.json"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
