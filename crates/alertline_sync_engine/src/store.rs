//! Durable sync state.
//!
//! A [`StateStore`] keeps one
//! [`SyncStateRecord`](alertline_protocol::SyncStateRecord) per channel so that a
//! restarted process can tell the server where each channel should resume.
//! The engine never talks to a store directly on the receive path; it goes
//! through [`SyncStateCache`], which keeps the records in memory and writes
//! them out on a debounce.

use crate::error::{StoreError, StoreResult};
use alertline_protocol::{ChannelId, EventEnvelope, SyncStateMap};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A durable store for sync state records.
///
/// # Invariants
///
/// - `load` returns exactly what the last successful `save` wrote
/// - `save` replaces the whole document
/// - Stores must be `Send + Sync` so flushes can run off the receive path
pub trait StateStore: Send + Sync {
    /// Loads all records.
    fn load(&self) -> StoreResult<SyncStateMap>;

    /// Replaces all records.
    fn save(&self, state: &SyncStateMap) -> StoreResult<()>;

    /// Removes all records.
    fn clear(&self) -> StoreResult<()>;
}

/// An in-memory store for testing and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<SyncStateMap>,
    unavailable: AtomicBool,
    saves: std::sync::atomic::AtomicU64,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    pub fn with_state(state: SyncStateMap) -> Self {
        Self {
            state: RwLock::new(state),
            ..Self::default()
        }
    }

    /// Makes every operation fail until turned off again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Returns a copy of the stored records.
    pub fn snapshot(&self) -> SyncStateMap {
        self.state.read().clone()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> StoreResult<SyncStateMap> {
        self.check_available()?;
        Ok(self.state.read().clone())
    }

    fn save(&self, state: &SyncStateMap) -> StoreResult<()> {
        self.check_available()?;
        *self.state.write() = state.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        self.check_available()?;
        self.state.write().clear();
        Ok(())
    }
}

/// A store that keeps all records in one JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the
/// target, so a crash mid-write leaves the previous document intact.
///
/// # Example
///
/// ```no_run
/// use alertline_sync_engine::{FileStateStore, StateStore};
/// use std::path::Path;
///
/// let store = FileStateStore::open(Path::new("state/sync.json")).unwrap();
/// let records = store.load().unwrap();
/// println!("{} channels", records.len());
/// ```
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Opens a store at the given path, creating parent directories.
    ///
    /// The file itself is created on first save.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the path to the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> StoreResult<SyncStateMap> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(SyncStateMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncStateMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &SyncStateMap) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let bytes = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory view of the sync state with debounced persistence.
///
/// Updates only touch memory and set a dirty flag. [`flush`](Self::flush)
/// writes a snapshot; if the write fails the flag is set again so the next
/// flush retries. Flushes and [`clear`](Self::clear) take turns, so a
/// snapshot taken before a clear is never written after it.
pub struct SyncStateCache {
    store: Arc<dyn StateStore>,
    records: RwLock<SyncStateMap>,
    dirty: AtomicBool,
    write_lock: Mutex<()>,
}

impl SyncStateCache {
    /// Loads the cache from a store.
    ///
    /// A store that cannot be read yields an empty cache; the client keeps
    /// working from memory and later flushes try the store again.
    pub fn load(store: Arc<dyn StateStore>) -> Self {
        let records = match store.load() {
            Ok(records) => {
                tracing::debug!(channels = records.len(), "loaded sync state");
                records
            }
            Err(e) => {
                tracing::warn!(error = %e, "sync state unavailable, starting empty");
                SyncStateMap::new()
            }
        };
        Self {
            store,
            records: RwLock::new(records),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the highest persisted sequence for a channel.
    pub fn last_seq(&self, channel: &ChannelId) -> Option<u64> {
        self.records.read().get(channel).and_then(|r| r.last_seq)
    }

    /// Returns a copy of all records.
    pub fn snapshot(&self) -> SyncStateMap {
        self.records.read().clone()
    }

    /// Returns records for the given channels only.
    pub fn snapshot_for<'a>(&self, channels: impl IntoIterator<Item = &'a ChannelId>) -> SyncStateMap {
        let records = self.records.read();
        channels
            .into_iter()
            .filter_map(|ch| records.get(ch).map(|r| (ch.clone(), r.clone())))
            .collect()
    }

    /// Folds an accepted event into its channel's record.
    pub fn observe(&self, event: &EventEnvelope) {
        self.records
            .write()
            .entry(event.channel.clone())
            .or_default()
            .observe(event);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Drops all records, in memory and in the store.
    ///
    /// If the store cannot be cleared the cache stays dirty, so the next
    /// flush overwrites the stored records with the empty set.
    pub fn clear(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        self.records.write().clear();
        match self.store.clear() {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Returns true if there are unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Writes the records if dirty (or unconditionally with `force`).
    ///
    /// Returns whether a write happened.
    pub fn flush(&self, force: bool) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let was_dirty = self.dirty.swap(false, Ordering::SeqCst);
        if !was_dirty && !force {
            return Ok(false);
        }
        let snapshot = self.snapshot();
        match self.store.save(&snapshot) {
            Ok(()) => {
                tracing::trace!(channels = snapshot.len(), "sync state flushed");
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Runs [`flush`](Self::flush) on the blocking pool.
    pub async fn flush_async(self: &Arc<Self>, force: bool) -> StoreResult<bool> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.flush(force))
            .await
            .map_err(|e| StoreError::Unavailable(format!("flush task failed: {e}")))?
    }
}
