//! # LSM manager — tier registry and manifest owner
//!
//! The manager owns every open segment handle, the tier layout, the
//! `next_entry_id` counter used to name new files, and the manifest. All of
//! that sits behind one `RwLock`: reads traverse tiers under the read lock,
//! manifest-affecting updates hold the write lock for their full duration.
//!
//! Segments are shared as `Arc<Segment>` so the merger and in-flight reads
//! can keep a table alive after it leaves the tiers; the file handle closes
//! when the last reference drops.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender};
use sstable::SsTableReader;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use tracing::warn;

use crate::manifest::{Manifest, ManifestTier, MANIFEST_TMP_FILENAME};
use crate::merger;
use crate::MERGE_THRESHOLD;

/// Capacity of the merge request queue. Requests beyond this are dropped —
/// writers never block on compaction.
const MERGE_QUEUE_DEPTH: usize = 10;

/// File suffixes the engine owns; anything with one of these suffixes that
/// the manifest does not reference is an orphan.
const OWNED_SUFFIXES: [&str; 3] = [".db", ".idx", ".log"];

/// An open segment: the table reader plus the id parsed from its filename.
pub(crate) struct Segment {
    pub id: u64,
    pub table: SsTableReader,
}

impl Segment {
    /// Opens the table file and derives the segment id from its
    /// `sst_NNNN.db` filename.
    pub(crate) fn open(path: &Path) -> Result<Segment> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("segment path has no filename: {}", path.display()))?;
        let id = parse_segment_id(name)
            .with_context(|| format!("segment name does not match sst_NNNN.db: {}", name))?;
        let table = SsTableReader::open(path)?;
        Ok(Segment { id, table })
    }

    pub(crate) fn file_name(&self) -> String {
        self.table
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    }
}

/// One tier: segments of similar age, newest last.
pub(crate) struct Tier {
    pub level: usize,
    pub segments: Vec<Arc<Segment>>,
}

pub(crate) struct ManagerState {
    pub tiers: Vec<Tier>,
    pub next_entry_id: u64,
    pub active_wal: String,
}

impl ManagerState {
    /// Builds the manifest document mirroring this in-memory state.
    pub(crate) fn to_manifest(&self) -> Manifest {
        Manifest {
            tiers: self
                .tiers
                .iter()
                .map(|t| ManifestTier {
                    level: t.level,
                    segments: t.segments.iter().map(|s| s.file_name()).collect(),
                })
                .collect(),
            active_wal: self.active_wal.clone(),
            next_entry_id: self.next_entry_id,
        }
    }
}

/// Tiered registry of SSTables plus merge scheduling.
pub struct LsmManager {
    data_dir: PathBuf,
    state: RwLock<ManagerState>,
    merge_tx: Mutex<Option<Sender<Vec<Arc<Segment>>>>>,
    merger: Mutex<Option<JoinHandle<()>>>,
}

impl LsmManager {
    /// Recovers the tier layout from the data directory and starts the
    /// merger thread. Returns the manager and the manifest that describes
    /// the recovered state (the store needs its `active_wal`).
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<(Arc<LsmManager>, Manifest)> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let (state, manifest) = init_state(&data_dir)?;

        let (tx, rx) = bounded(MERGE_QUEUE_DEPTH);

        let manager = Arc::new(LsmManager {
            data_dir,
            state: RwLock::new(state),
            merge_tx: Mutex::new(Some(tx)),
            merger: Mutex::new(None),
        });

        let worker = Arc::clone(&manager);
        let handle = std::thread::Builder::new()
            .name("undertow-merger".to_string())
            .spawn(move || merger::run(worker, rx))?;
        *manager.merger.lock().expect("merger handle lock poisoned") = Some(handle);

        Ok((manager, manifest))
    }

    /// Searches all tiers for `key`: tier 0 upward, newest segment first
    /// within each tier. The first hit wins — deeper entries are older and
    /// shadowed. The value may be the tombstone; the store interprets it.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.read_state();
        for tier in &state.tiers {
            for seg in tier.segments.iter().rev() {
                if let Some(value) = seg.table.get(key)? {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// Allocates the next entry id and returns the canonical segment path
    /// `sst_NNNN.db` for it.
    pub fn create_sstable_path(&self) -> PathBuf {
        let mut state = self.write_state();
        let id = state.next_entry_id;
        state.next_entry_id += 1;
        self.data_dir.join(segment_file_name(id))
    }

    /// Reads the next entry id without allocating it. Used to name the WAL
    /// created by a rotation; the flush that follows allocates the id.
    pub fn peek_next_entry_id(&self) -> u64 {
        self.read_state().next_entry_id
    }

    /// Opens the segment at `path`, appends it to tier 0, and rewrites the
    /// manifest. When tier 0 reaches the merge threshold, a snapshot of its
    /// segments is queued for the merger (non-blocking; dropped with a
    /// warning when the queue is full).
    pub fn add_sstable(&self, path: &Path) -> Result<()> {
        let seg = Arc::new(Segment::open(path)?);

        let batch = {
            let mut state = self.write_state();
            if state.tiers.is_empty() {
                state.tiers.push(Tier {
                    level: 0,
                    segments: Vec::new(),
                });
            }
            state.tiers[0].segments.push(seg);

            if let Err(e) = state.to_manifest().write(&self.data_dir) {
                state.tiers[0].segments.pop();
                return Err(e.context("failed to write manifest after adding segment"));
            }

            if state.tiers[0].segments.len() >= MERGE_THRESHOLD {
                Some(state.tiers[0].segments.clone())
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.queue_merge(batch);
        }
        Ok(())
    }

    /// Records a new active WAL filename in the manifest.
    pub fn update_active_wal(&self, wal_name: &str) -> Result<()> {
        let mut state = self.write_state();
        let previous = std::mem::replace(&mut state.active_wal, wal_name.to_string());
        if let Err(e) = state.to_manifest().write(&self.data_dir) {
            state.active_wal = previous;
            return Err(e.context("failed to write manifest with new active wal"));
        }
        Ok(())
    }

    /// Stops the merger, then releases every segment handle.
    pub fn close(&self) {
        // Dropping the sender ends the worker's receive loop.
        drop(self.merge_tx.lock().expect("merge sender lock poisoned").take());
        if let Some(handle) = self.merger.lock().expect("merger handle lock poisoned").take() {
            let _ = handle.join();
        }
        self.write_state().tiers.clear();
    }

    /// Number of segments per tier, level-ascending. Stats and tests.
    pub fn tier_segment_counts(&self) -> Vec<usize> {
        self.read_state()
            .tiers
            .iter()
            .map(|t| t.segments.len())
            .collect()
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, ManagerState> {
        self.state.read().expect("manager lock poisoned")
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, ManagerState> {
        self.state.write().expect("manager lock poisoned")
    }

    fn queue_merge(&self, batch: Vec<Arc<Segment>>) {
        let tx = self.merge_tx.lock().expect("merge sender lock poisoned");
        if let Some(tx) = tx.as_ref() {
            if tx.try_send(batch).is_err() {
                warn!("merge queue full, dropping merge request");
            }
        }
    }
}

impl std::fmt::Debug for LsmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("LsmManager")
            .field("data_dir", &self.data_dir)
            .field("tiers", &state.tiers.iter().map(|t| t.segments.len()).collect::<Vec<_>>())
            .field("next_entry_id", &state.next_entry_id)
            .field("active_wal", &state.active_wal)
            .finish()
    }
}

/// Canonical segment filename for an entry id.
pub(crate) fn segment_file_name(id: u64) -> String {
    format!("sst_{:04}.db", id)
}

/// Parses `sst_NNNN.db` into its id.
fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("sst_")?
        .strip_suffix(".db")?
        .parse()
        .ok()
}

/// Parses `wal_NNNN.log` into its id.
fn parse_wal_id(name: &str) -> Option<u64> {
    name.strip_prefix("wal_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// Loads the persisted layout, or bootstraps one from the directory.
fn init_state(data_dir: &Path) -> Result<(ManagerState, Manifest)> {
    fs::create_dir_all(data_dir)?;

    match Manifest::load(data_dir)? {
        Some(manifest) => {
            let mut valid: HashSet<String> = HashSet::new();
            let mut tiers = Vec::new();

            for mt in &manifest.tiers {
                let mut segments = Vec::new();
                for name in &mt.segments {
                    let seg = Segment::open(&data_dir.join(name))
                        .with_context(|| format!("failed to load segment {}", name))?;
                    valid.insert(name.clone());
                    segments.push(Arc::new(seg));
                }
                tiers.push(Tier {
                    level: mt.level,
                    segments,
                });
            }

            if !manifest.active_wal.is_empty() {
                valid.insert(manifest.active_wal.clone());
            }
            cleanup_orphans(data_dir, &valid);

            let mut state = ManagerState {
                tiers,
                next_entry_id: manifest.next_entry_id,
                active_wal: manifest.active_wal.clone(),
            };
            reconcile_next_entry_id(&mut state);
            Ok((state, manifest))
        }
        None => {
            // No manifest: adopt whatever sst_NNNN.db files exist as a
            // single tier 0 and persist a bootstrap manifest.
            let segments = discover_segments(data_dir)?;
            let next_entry_id = segments.iter().map(|s| s.id + 1).max().unwrap_or(0);

            let tiers = if segments.is_empty() {
                Vec::new()
            } else {
                vec![Tier { level: 0, segments }]
            };

            let mut state = ManagerState {
                tiers,
                next_entry_id,
                active_wal: "wal_0000.log".to_string(),
            };
            reconcile_next_entry_id(&mut state);
            let manifest = state.to_manifest();
            manifest
                .write(data_dir)
                .context("failed to write bootstrap manifest")?;
            Ok((state, manifest))
        }
    }
}

/// Bumps `next_entry_id` past the active WAL's id. Rotation names the next
/// WAL after the un-allocated next id; if that id were at or below the
/// active WAL's, the "fresh" WAL would reopen the live file and replay its
/// contents instead of starting empty.
fn reconcile_next_entry_id(state: &mut ManagerState) {
    if let Some(id) = parse_wal_id(&state.active_wal) {
        state.next_entry_id = state.next_entry_id.max(id + 1);
    }
}

/// Enumerates `sst_NNNN.db` files in id order and opens each one.
fn discover_segments(data_dir: &Path) -> Result<Vec<Arc<Segment>>> {
    let mut found: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(id) = parse_segment_id(name) {
                found.push((id, path));
            }
        }
    }
    found.sort_by_key(|(id, _)| *id);

    let mut segments = Vec::with_capacity(found.len());
    for (_, path) in found {
        segments.push(Arc::new(Segment::open(&path)?));
    }
    Ok(segments)
}

/// Deletes engine-owned files the manifest does not reference, plus any
/// stale manifest temp left by an interrupted rewrite.
fn cleanup_orphans(data_dir: &Path, valid: &HashSet<String>) {
    let entries = match fs::read_dir(data_dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let owned = OWNED_SUFFIXES.iter().any(|s| name.ends_with(s));
        if (owned && !valid.contains(&name)) || name == MANIFEST_TMP_FILENAME {
            warn!(file = %name, "removing orphan file not referenced by manifest");
            let _ = fs::remove_file(&path);
        }
    }
}
