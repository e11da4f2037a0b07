use anyhow::{bail, ensure, Context, Result};
use bloom::BloomFilter;
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::format::{read_footer, Footer, IndexEntry, FOOTER_LEN};

/// Maximum key size we'll allocate during reads (64 KiB). Prevents OOM on
/// corrupt files.
const MAX_KEY_BYTES: usize = 64 * 1024;
/// Maximum value size we'll allocate during reads (10 MiB). Prevents OOM on
/// corrupt files.
const MAX_VALUE_BYTES: usize = 10 * 1024 * 1024;

/// Reads an immutable table file for point lookups.
///
/// On [`open`](SsTableReader::open) the footer is parsed (the magic must be
/// "SST1" and both regions must fall inside the file), then the bloom filter
/// and the full sparse index are loaded into memory. `min_key` comes from
/// index slot 0 — record 0 is always indexed — and `max_key` from a scan of
/// the final index block, so both equal the first/last keys of the data
/// region.
///
/// A persistent file handle is kept open for the lifetime of the reader,
/// wrapped in a `Mutex` so that `get` can be called through a shared `&self`
/// reference. A point lookup costs one seek plus a scan bounded by the index
/// stride.
pub struct SsTableReader {
    /// Path to the table file on disk.
    path: PathBuf,
    /// Sparse index: every Nth key with its data offset, ascending.
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    /// Persistent file handle, wrapped in Mutex for interior mutability.
    file: Mutex<BufReader<File>>,
    footer: Footer,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl SsTableReader {
    /// Opens a table file, validating the footer and loading the bloom
    /// filter and index into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path)
            .with_context(|| format!("failed to open sstable {}", path.display()))?;

        let (footer, filesize) = read_footer(&mut f)
            .with_context(|| format!("failed to parse footer of {}", path.display()))?;

        // Region bounds must line up with the file: data | index | bloom
        // (4-byte length prefix + bits) | footer.
        ensure!(
            footer
                .index_offset
                .checked_add(footer.index_size as u64)
                .is_some_and(|end| end == footer.bloom_offset),
            "index region does not abut bloom region"
        );
        ensure!(
            footer
                .bloom_offset
                .checked_add(4)
                .and_then(|v| v.checked_add(footer.bloom_size as u64))
                .and_then(|v| v.checked_add(FOOTER_LEN))
                .is_some_and(|end| end == filesize),
            "bloom region does not abut footer"
        );

        // Bloom region: length prefix must agree with the footer.
        f.seek(SeekFrom::Start(footer.bloom_offset))?;
        let bloom_len = f.read_u32::<BigEndian>()?;
        ensure!(
            bloom_len == footer.bloom_size,
            "bloom length prefix {} disagrees with footer {}",
            bloom_len,
            footer.bloom_size
        );
        let bloom = BloomFilter::read_from(&mut f)
            .with_context(|| format!("failed to load bloom filter of {}", path.display()))?;

        // Index region.
        f.seek(SeekFrom::Start(footer.index_offset))?;
        let mut index = Vec::new();
        let index_end = footer.index_offset + footer.index_size as u64;
        let mut pos = footer.index_offset;
        while pos < index_end {
            let key_len = f.read_u32::<BigEndian>()? as usize;
            ensure!(key_len <= MAX_KEY_BYTES, "corrupt index: key_len {}", key_len);
            let mut key = vec![0u8; key_len];
            f.read_exact(&mut key)?;
            let offset = f.read_u64::<BigEndian>()?;
            let size = f.read_u64::<BigEndian>()?;
            ensure!(
                offset < footer.index_offset,
                "corrupt index: offset {} past data region",
                offset
            );
            index.push(IndexEntry { key, offset, size });
            pos += 4 + key_len as u64 + 8 + 8;
        }
        ensure!(!index.is_empty(), "sstable has an empty index");

        // The fixed-size footer carries no keys; recover the bounds from the
        // index (slot 0 is the first data key) and the final block.
        let min_key = index[0].key.clone();
        let max_key = last_key_in_block(
            &mut f,
            index.last().expect("index checked non-empty").offset,
            footer.index_offset,
        )?;

        f.seek(SeekFrom::Start(0))?;

        Ok(Self {
            path,
            index,
            bloom,
            file: Mutex::new(BufReader::new(f)),
            footer,
            min_key,
            max_key,
        })
    }

    /// Point lookup for a single key.
    ///
    /// Fast paths: outside `[min_key, max_key]` or rejected by the bloom
    /// filter means the key is definitely absent. Otherwise binary-search
    /// the sparse index for the greatest entry whose key is <= the target
    /// (clamped at slot 0) and scan just that block.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return Ok(None);
        }
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }

        // Greatest indexed key <= target. partition_point returns the count
        // of entries with key <= target; zero means the target sorts below
        // the whole index.
        let pp = self.index.partition_point(|e| e.key.as_slice() <= key);
        if pp == 0 {
            return Ok(None);
        }
        let idx = pp - 1;

        let start = self.index[idx].offset;
        let end = match self.index.get(idx + 1) {
            Some(next) => next.offset,
            None => self.footer.index_offset,
        };

        let mut f = self
            .file
            .lock()
            .map_err(|e| anyhow::anyhow!("reader lock poisoned: {}", e))?;
        f.seek(SeekFrom::Start(start))?;

        let mut pos = start;
        while pos < end {
            let (rec_key, value, consumed) = read_record(&mut *f)?;
            pos += consumed;
            if rec_key == key {
                return Ok(Some(value));
            }
            if rec_key.as_slice() > key {
                // The block is sorted; we've passed where the key would be.
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// Scans the whole data region into a map, later occurrences winning.
    /// Used by the merger, which resolves duplicates across segments by
    /// insertion order.
    pub fn read_all_records(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| anyhow::anyhow!("reader lock poisoned: {}", e))?;
        f.seek(SeekFrom::Start(0))?;

        let mut entries = BTreeMap::new();
        let mut pos = 0u64;
        while pos < self.footer.index_offset {
            let (key, value, consumed) = read_record(&mut *f)?;
            pos += consumed;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest key in the data region.
    #[must_use]
    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    /// Largest key in the data region.
    #[must_use]
    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Number of sparse-index entries loaded.
    #[must_use]
    pub fn index_len(&self) -> usize {
        self.index.len()
    }
}

impl std::fmt::Debug for SsTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTableReader")
            .field("path", &self.path)
            .field("index_len", &self.index.len())
            .field("bloom", &self.bloom)
            .finish()
    }
}

/// Decodes one data record, returning the key, value, and bytes consumed.
fn read_record<R: Read>(r: &mut R) -> Result<(Vec<u8>, Vec<u8>, u64)> {
    let key_len = r.read_u32::<BigEndian>()? as usize;
    if key_len > MAX_KEY_BYTES {
        bail!("corrupt record: key_len {} exceeds maximum", key_len);
    }
    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key)?;

    let val_len = r.read_u32::<BigEndian>()? as usize;
    if val_len > MAX_VALUE_BYTES {
        bail!("corrupt record: val_len {} exceeds maximum", val_len);
    }
    let mut value = vec![0u8; val_len];
    r.read_exact(&mut value)?;

    Ok((key, value, 4 + key_len as u64 + 4 + val_len as u64))
}

/// Scans the block `[start, end)` and returns the key of its last record —
/// the table's maximum key when the block is the final one.
fn last_key_in_block<R: Read + Seek>(r: &mut R, start: u64, end: u64) -> Result<Vec<u8>> {
    r.seek(SeekFrom::Start(start))?;
    let mut pos = start;
    let mut last = Vec::new();
    while pos < end {
        let (key, _, consumed) = read_record(r)?;
        pos += consumed;
        last = key;
    }
    Ok(last)
}
