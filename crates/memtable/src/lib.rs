//! # Memtable — WAL-paired in-memory write buffer
//!
//! The write-facing half of the UndertowKV engine: a [`SkipList`] ordered map
//! combined with a [`wal::Wal`] under a single reader-writer lock.
//!
//! Every mutation is appended to the WAL **first**; only after the frame is
//! durable does the in-memory map change. This ordering is what makes a
//! crash between the two steps harmless — replaying the WAL reproduces the
//! map exactly.
//!
//! ## Lifecycle
//!
//! 1. Created with a fresh WAL path ([`MemTable::open`] replays any existing
//!    file, which for a new path means starting empty).
//! 2. Mutated by [`insert`](MemTable::insert) / [`delete`](MemTable::delete)
//!    until the store decides to rotate.
//! 3. Frozen via [`make_read_only`](MemTable::make_read_only) and flushed to
//!    an SSTable with [`flush`](MemTable::flush).
//! 4. Destroyed after the SSTable is registered in the manifest and the WAL
//!    is unlinked.

mod skiplist;

pub use skiplist::{SkipList, MAX_HEIGHT};

use anyhow::{Context, Result};
use sstable::SsTableWriter;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;
use wal::{Wal, WalReader, WalRecord};

/// A mutable (or frozen) in-memory table with write-ahead durability.
///
/// All state sits behind one `RwLock`: point reads take the read lock,
/// mutations and freezing take the write lock. The WAL handle lives inside
/// the lock so the append-then-insert sequence is atomic with respect to
/// other writers.
pub struct MemTable {
    inner: RwLock<Inner>,
}

struct Inner {
    map: SkipList,
    wal: Option<Wal>,
    /// Σ(len(key) + len(value)) over present entries.
    size_bytes: u64,
    read_only: bool,
}

impl Inner {
    /// Applies a put with size accounting: replacing a key swaps the value
    /// length, a fresh key adds key+value and an entry.
    fn apply_put(&mut self, key: &[u8], value: &[u8]) {
        match self.map.find(key).map(|v| v.len() as u64) {
            Some(old_len) => {
                self.size_bytes = self.size_bytes - old_len + value.len() as u64;
            }
            None => {
                self.size_bytes += (key.len() + value.len()) as u64;
            }
        }
        self.map.insert(key, value);
    }

    /// Applies a delete with size accounting. Returns whether a live entry
    /// was removed.
    fn apply_del(&mut self, key: &[u8]) -> bool {
        match self.map.find(key).map(|v| v.len() as u64) {
            Some(old_len) => {
                self.size_bytes -= key.len() as u64 + old_len;
                self.map.delete(key);
                true
            }
            None => false,
        }
    }
}

impl MemTable {
    /// Creates a memtable bound to the WAL at `wal_path`, replaying any
    /// frames already in the file.
    ///
    /// A brand-new path replays to empty. A CRC mismatch or unknown frame
    /// type aborts recovery with an error — the engine refuses to start on
    /// silent data loss. A truncated tail frame is a survivable crash
    /// artifact and is logged, not fatal.
    pub fn open<P: AsRef<Path>>(wal_path: P, sync: bool) -> Result<Self> {
        let wal_path = wal_path.as_ref();

        let mut inner = Inner {
            map: SkipList::new(),
            wal: None,
            size_bytes: 0,
            read_only: false,
        };

        match WalReader::open(wal_path) {
            Ok(mut reader) => {
                let summary = reader
                    .replay(|rec| match rec {
                        WalRecord::Put { key, value } => inner.apply_put(&key, &value),
                        WalRecord::Del { key } => {
                            inner.apply_del(&key);
                        }
                    })
                    .with_context(|| {
                        format!("wal replay failed for {}", wal_path.display())
                    })?;
                if summary.truncated {
                    warn!(
                        wal = %wal_path.display(),
                        records = summary.records,
                        "dropped partial tail frame during wal replay"
                    );
                }
            }
            Err(wal::WalError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                // Fresh memtable: no WAL yet.
            }
            Err(e) => {
                return Err(anyhow::anyhow!(e)
                    .context(format!("failed to open wal {}", wal_path.display())));
            }
        }

        inner.wal = Some(Wal::create(wal_path, sync)?);

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Creates a transient memtable with no WAL. Used by the merger as a
    /// scratch buffer where durability is supplied by the input segments.
    pub fn unlogged() -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: SkipList::new(),
                wal: None,
                size_bytes: 0,
                read_only: false,
            }),
        }
    }

    /// Inserts or replaces `key` -> `value`. The WAL append happens first;
    /// if it fails the map is untouched.
    ///
    /// # Panics
    ///
    /// Panics if the memtable has been frozen — the store façade never
    /// writes to a rotated memtable, so hitting this is a bug.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().expect("memtable lock poisoned");
        assert!(!inner.read_only, "insert into read-only memtable");

        if let Some(wal) = inner.wal.as_mut() {
            wal.write_put(key, value)?;
        }
        inner.apply_put(key, value);
        Ok(())
    }

    /// Removes `key` from the map, logging the deletion first.
    ///
    /// # Panics
    ///
    /// Panics if the memtable has been frozen.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.write().expect("memtable lock poisoned");
        assert!(!inner.read_only, "delete from read-only memtable");

        if let Some(wal) = inner.wal.as_mut() {
            wal.write_delete(key)?;
        }
        Ok(inner.apply_del(key))
    }

    /// Returns a copy of the value stored under `key`, if present.
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read().expect("memtable lock poisoned");
        inner.map.find(key).map(|v| v.to_vec())
    }

    /// True when the accounted byte size has reached `threshold`.
    #[must_use]
    pub fn should_flush(&self, threshold: u64) -> bool {
        let inner = self.inner.read().expect("memtable lock poisoned");
        inner.size_bytes >= threshold
    }

    /// Freezes the memtable. Mutations after this point are bugs.
    pub fn make_read_only(&self) {
        let mut inner = self.inner.write().expect("memtable lock poisoned");
        inner.read_only = true;
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read().expect("memtable lock poisoned").read_only
    }

    /// Writes the memtable contents to an SSTable at `path`.
    ///
    /// Marks the memtable read-only, then streams entries in key order into
    /// the table writer. Tombstones are written like any other value — the
    /// tier machinery decides when they may be dropped.
    pub fn flush<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.make_read_only();

        let inner = self.inner.read().expect("memtable lock poisoned");
        let mut writer = SsTableWriter::create(path.as_ref(), inner.map.len())?;
        for (key, value) in inner.map.iter() {
            writer.append(key, value)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Ordered snapshot of all entries. Used by the merger to drain a
    /// scratch memtable.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read().expect("memtable lock poisoned");
        inner
            .map
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect()
    }

    /// Resets the map and counters.
    ///
    /// # Panics
    ///
    /// Panics if the memtable is read-only; a frozen memtable is flushed and
    /// dropped, never recycled.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("memtable lock poisoned");
        assert!(!inner.read_only, "clear of read-only memtable");
        inner.map = SkipList::new();
        inner.size_bytes = 0;
    }

    /// Flushes the WAL. The file itself is unlinked by the store once the
    /// flush has been committed to the manifest.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().expect("memtable lock poisoned");
        if let Some(wal) = inner.wal.as_mut() {
            wal.close()?;
        }
        Ok(())
    }

    /// Path of the WAL backing this memtable, if any.
    #[must_use]
    pub fn wal_path(&self) -> Option<PathBuf> {
        let inner = self.inner.read().expect("memtable lock poisoned");
        inner.wal.as_ref().map(|w| w.path().to_path_buf())
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("memtable lock poisoned").map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted size: Σ(len(key) + len(value)) over present entries.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.inner.read().expect("memtable lock poisoned").size_bytes
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("memtable lock poisoned");
        f.debug_struct("MemTable")
            .field("entries", &inner.map.len())
            .field("size_bytes", &inner.size_bytes)
            .field("read_only", &inner.read_only)
            .field("wal", &inner.wal.as_ref().map(|w| w.path().to_path_buf()))
            .finish()
    }
}
