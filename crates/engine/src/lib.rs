//! # Engine — UndertowKV Storage Engine
//!
//! The central orchestrator tying together the [`memtable`], [`wal`], and
//! [`sstable`] crates into a tiered LSM key-value store.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌────────────────────────────────────────────────────┐
//! │                      STORE                         │
//! │                                                    │
//! │ set() → active memtable (WAL append, then insert)  │
//! │           |                                        │
//! │           |  (size >= threshold?)                  │
//! │           v            yes                         │
//! │     rotate: active -> immutable, fresh WAL         │
//! │           |                                        │
//! │           v  (flush thread)                        │
//! │     SSTable -> manager tier 0 -> manifest          │
//! │           |                                        │
//! │           |  (tier 0 >= 4?)                        │
//! │           v            yes                         │
//! │     merger thread: cascade into deeper tiers       │
//! │                                                    │
//! │ get() → active → immutable → tiers (newest first)  │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module       | Purpose                                             |
//! |--------------|-----------------------------------------------------|
//! | [`lib.rs`]   | `Store` façade: set/get/update/delete/close, rotation |
//! | [`manager`]  | Tier registry, recovery, id allocation, merge queue |
//! | [`merger`]   | Background cascading compaction                     |
//! | [`manifest`] | Atomic JSON layout document                         |
//!
//! ## Crash Safety
//!
//! Every write is durable in the active WAL before `set` returns. A crash
//! before flush replays the WAL; a crash mid-flush leaves an orphaned
//! segment that startup cleanup removes, with the WAL still authoritative;
//! a crash around a merge leaves either the old manifest or the new one.

mod manager;
mod manifest;
mod merger;

pub use manager::LsmManager;
pub use manifest::{Manifest, ManifestTier, MANIFEST_FILENAME, MANIFEST_TMP_FILENAME};

use anyhow::{ensure, Result};
use memtable::MemTable;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Reserved value marking a deleted key. `delete` stamps it; reads treat it
/// as not-found; merges into the deepest tier drop it.
pub const TOMBSTONE: &[u8] = b"null";

/// Deepest tier. Tombstones are dropped by merges that produce a segment
/// here; the tier is never merged further.
pub const MAX_LEVEL: usize = 2;

/// Segment count at which a tier is queued for merging.
pub const MERGE_THRESHOLD: usize = 4;

/// Default memtable byte budget before rotation.
pub const DEFAULT_MEMTABLE_BYTES: u64 = 300;

/// Maximum allowed key size in bytes (64 KiB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Maximum allowed value size in bytes (10 MiB).
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// How long a rotation sleeps between polls while the immutable slot is
/// still being flushed.
const ROTATE_POLL: Duration = Duration::from_millis(10);

/// Flush attempts before giving up and leaving recovery to the WAL.
const FLUSH_RETRIES: u32 = 3;

/// Point-in-time snapshot of engine internals, for the CLI `stats` command
/// and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub memtable_entries: usize,
    pub memtable_bytes: u64,
    pub immutable_pending: bool,
    /// Segment count per tier, level-ascending.
    pub tiers: Vec<usize>,
    pub next_entry_id: u64,
}

struct StoreState {
    active: Arc<MemTable>,
    /// Rotated memtable pending flush. At most one exists at a time.
    immutable: Option<Arc<MemTable>>,
}

/// The public key-value store.
///
/// Writes land in the active memtable (WAL first); when it outgrows the
/// configured threshold it rotates into the immutable slot and a background
/// thread flushes it into the manager's tier 0. Reads walk active →
/// immutable → tiers, newest first, and a [`TOMBSTONE`] anywhere masks
/// anything older.
pub struct Store {
    data_dir: PathBuf,
    state: Arc<RwLock<StoreState>>,
    manager: Arc<LsmManager>,
    max_memtable_bytes: u64,
    wal_sync: bool,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Opens (or creates) a store in `data_dir`, recovering tiers from the
    /// manifest and the active memtable from its WAL.
    ///
    /// `max_memtable_bytes` is the rotation threshold; `wal_sync` controls
    /// whether every WAL append fsyncs (durability per the engine contract —
    /// tests may turn it off for speed).
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        max_memtable_bytes: u64,
        wal_sync: bool,
    ) -> Result<Store> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let (manager, manifest) = LsmManager::open(&data_dir)?;

        let wal_name = if manifest.active_wal.is_empty() {
            let name = "wal_0000.log".to_string();
            manager.update_active_wal(&name)?;
            name
        } else {
            manifest.active_wal
        };

        // Replays the WAL if one survived a crash; a fresh file replays to
        // empty.
        let active = Arc::new(MemTable::open(data_dir.join(&wal_name), wal_sync)?);
        info!(
            data_dir = %data_dir.display(),
            wal = %wal_name,
            recovered_entries = active.len(),
            "store opened"
        );

        Ok(Store {
            data_dir,
            state: Arc::new(RwLock::new(StoreState {
                active,
                immutable: None,
            })),
            manager,
            max_memtable_bytes,
            wal_sync,
            flush_handle: Mutex::new(None),
        })
    }

    /// Inserts or replaces `key` -> `value`. Returns once the mutation is
    /// durable in the WAL; may trigger a memtable rotation on the way out.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "key must not be empty");
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key too large: {} bytes (max {})",
            key.len(),
            MAX_KEY_SIZE
        );
        ensure!(
            value.len() <= MAX_VALUE_SIZE,
            "value too large: {} bytes (max {})",
            value.len(),
            MAX_VALUE_SIZE
        );

        let should_flush = {
            let state = self.state.write().expect("store lock poisoned");
            state.active.insert(key, value)?;
            state.active.should_flush(self.max_memtable_bytes)
        };

        if should_flush {
            self.rotate_memtable()?;
        }
        Ok(())
    }

    /// Equivalent to [`set`](Store::set); kept for API symmetry.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set(key, value)
    }

    /// Deletes `key` by stamping the [`TOMBSTONE`] value. The tombstone
    /// travels the same path as any write and masks older entries in every
    /// tier until a bottom-level merge retires it.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.set(key, TOMBSTONE)
    }

    /// Looks up `key`, newest data first. `Ok(None)` means the key does not
    /// exist or was deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        {
            let state = self.state.read().expect("store lock poisoned");
            if let Some(value) = state.active.find(key) {
                return Ok(live(value));
            }
            if let Some(immutable) = &state.immutable {
                if let Some(value) = immutable.find(key) {
                    return Ok(live(value));
                }
            }
        }

        match self.manager.get(key)? {
            Some(value) => Ok(live(value)),
            None => Ok(None),
        }
    }

    /// Waits for the outstanding flush, closes both memtables, and shuts
    /// the manager (and its merger) down. Callers stop issuing writes
    /// before calling this.
    pub fn close(&self) -> Result<()> {
        if let Some(handle) = self.flush_handle.lock().expect("flush handle lock poisoned").take() {
            let _ = handle.join();
        }

        {
            let state = self.state.read().expect("store lock poisoned");
            state.active.close()?;
            if let Some(immutable) = &state.immutable {
                immutable.close()?;
            }
        }

        self.manager.close();
        Ok(())
    }

    /// Snapshot of engine internals.
    pub fn stats(&self) -> StoreStats {
        let state = self.state.read().expect("store lock poisoned");
        StoreStats {
            memtable_entries: state.active.len(),
            memtable_bytes: state.active.size_bytes(),
            immutable_pending: state.immutable.is_some(),
            tiers: self.manager.tier_segment_counts(),
            next_entry_id: self.manager.peek_next_entry_id(),
        }
    }

    /// Swaps the full memtable into the immutable slot and hands it to a
    /// flush thread.
    ///
    /// Rotation is serialized: while a previous immutable is still being
    /// flushed this polls every 10 ms. The double-check after retaking the
    /// lock covers the window where another caller already rotated.
    fn rotate_memtable(&self) -> Result<()> {
        let mut state = self.state.write().expect("store lock poisoned");
        if !state.active.should_flush(self.max_memtable_bytes) {
            return Ok(());
        }

        while state.immutable.is_some() {
            drop(state);
            std::thread::sleep(ROTATE_POLL);
            state = self.state.write().expect("store lock poisoned");
        }

        // The id itself is allocated by the flush; rotation only borrows the
        // number for the WAL name, so WAL and segment share an id per cycle.
        let wal_name = format!("wal_{:04}.log", self.manager.peek_next_entry_id());
        let fresh = Arc::new(MemTable::open(self.data_dir.join(&wal_name), self.wal_sync)?);

        let old = std::mem::replace(&mut state.active, fresh);
        old.make_read_only();
        state.immutable = Some(Arc::clone(&old));

        self.manager.update_active_wal(&wal_name)?;
        drop(state);

        // At most one flush runs at a time (the immutable slot was free),
        // so the previous handle has finished; reap it before spawning.
        let mut handle_slot = self.flush_handle.lock().expect("flush handle lock poisoned");
        if let Some(handle) = handle_slot.take() {
            let _ = handle.join();
        }

        let manager = Arc::clone(&self.manager);
        let state = Arc::clone(&self.state);
        let handle = std::thread::Builder::new()
            .name("undertow-flush".to_string())
            .spawn(move || flush_memtable(manager, state, old))?;
        *handle_slot = Some(handle);
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Store")
            .field("data_dir", &self.data_dir)
            .field("max_memtable_bytes", &self.max_memtable_bytes)
            .field("wal_sync", &self.wal_sync)
            .field("memtable_entries", &stats.memtable_entries)
            .field("memtable_bytes", &stats.memtable_bytes)
            .field("immutable_pending", &stats.immutable_pending)
            .field("tiers", &stats.tiers)
            .field("next_entry_id", &stats.next_entry_id)
            .finish()
    }
}

/// Maps the tombstone to not-found.
fn live(value: Vec<u8>) -> Option<Vec<u8>> {
    if value == TOMBSTONE {
        None
    } else {
        Some(value)
    }
}

/// Flush-thread body: persist the immutable memtable as a tier-0 segment,
/// retire its WAL, and free the slot.
///
/// Flush failures retry with a short backoff; after the last attempt the
/// immutable stays in place and the error is logged — the WAL on disk still
/// holds every record, so a restart recovers the data.
fn flush_memtable(
    manager: Arc<LsmManager>,
    state: Arc<RwLock<StoreState>>,
    memtable: Arc<MemTable>,
) {
    let sst_path = manager.create_sstable_path();

    let mut flushed = false;
    for attempt in 1..=FLUSH_RETRIES {
        match memtable.flush(&sst_path) {
            Ok(()) => {
                flushed = true;
                break;
            }
            Err(e) => {
                error!(attempt, error = %e, "memtable flush failed");
                std::thread::sleep(Duration::from_millis(50 * attempt as u64));
            }
        }
    }
    if !flushed {
        error!(
            segment = %sst_path.display(),
            "giving up on flush; contents remain recoverable from the wal"
        );
        return;
    }

    if let Err(e) = manager.add_sstable(&sst_path) {
        error!(segment = %sst_path.display(), error = %e, "failed to register flushed segment");
        return;
    }

    // Segment is in the manifest; the WAL has served its purpose.
    if let Err(e) = memtable.close() {
        warn!(error = %e, "failed to close flushed memtable wal");
    }
    if let Some(wal_path) = memtable.wal_path() {
        if let Err(e) = wal::delete_wal(&wal_path) {
            warn!(wal = %wal_path.display(), error = %e, "failed to delete flushed wal");
        }
    }

    let mut state = state.write().expect("store lock poisoned");
    if let Some(immutable) = &state.immutable {
        if Arc::ptr_eq(immutable, &memtable) {
            state.immutable = None;
        }
    }
}

#[cfg(test)]
mod tests;
