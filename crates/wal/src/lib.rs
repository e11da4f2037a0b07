//! # WAL — Write-Ahead Log
//!
//! Provides crash-safe durability for the UndertowKV storage engine.
//!
//! Every mutation (`Put` or `Delete`) is serialized into a binary frame and
//! appended to the WAL **before** the corresponding in-memory update. On
//! restart the WAL is replayed to reconstruct the memtable, guaranteeing that
//! no acknowledged write is lost. Each memtable owns exactly one WAL file;
//! the file is unlinked once the memtable has been persisted as an SSTable.
//!
//! ## Binary Frame Format
//!
//! ```text
//! [crc32: u32 BE][type: u8][key_len: u32 BE][key][val_len: u32 BE][value]
//! ```
//!
//! `type` is 1 for Put and 2 for Delete; a Delete frame carries a zero-length
//! value. The CRC32-IEEE checksum covers everything after itself (type,
//! lengths, key, value).
//!
//! ## Example
//!
//! ```rust,no_run
//! use wal::{Wal, WalRecord};
//!
//! let mut w = Wal::create("wal_0000.log", true).unwrap();
//! w.write_put(b"hello", b"world").unwrap();
//! drop(w);
//!
//! let mut r = wal::WalReader::open("wal_0000.log").unwrap();
//! r.replay(|rec| println!("{:?}", rec)).unwrap();
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Frame type for a key-value insertion.
pub const ENTRY_PUT: u8 = 1;
/// Frame type for a key deletion.
pub const ENTRY_DELETE: u8 = 2;

/// A single WAL record representing either a key-value insertion or a
/// deletion. Ordering is positional: frames are replayed in append order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A key-value insertion.
    Put {
        /// The lookup key.
        key: Vec<u8>,
        /// The payload value.
        value: Vec<u8>,
    },
    /// A key deletion.
    Del {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A frame failed CRC validation or contained an unknown frame type.
    /// Recovery refuses to proceed past a corrupt frame.
    #[error("corrupt wal frame")]
    Corrupt,
}

/// Outcome of a [`WalReader::replay`] pass.
///
/// A truncated tail frame (crash mid-append) is not corruption: every frame
/// before it was applied and the engine may resume writing. Callers should
/// surface `truncated` so the operator knows a crash tail was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Number of frames applied.
    pub records: usize,
    /// True when replay stopped at a partial tail frame.
    pub truncated: bool,
}

/// Append-only WAL writer.
///
/// Frames are serialized into a reusable in-memory buffer, checksummed, and
/// written to the underlying file in a single `write_all` call, then flushed.
/// When `sync` is `true`, every append is additionally followed by
/// `sync_all()` (fsync) so the frame is durable before the call returns.
pub struct Wal {
    file: File,
    path: PathBuf,
    sync: bool,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
}

impl Wal {
    /// Opens (or creates) a WAL file in append mode.
    ///
    /// # Arguments
    ///
    /// * `path` - file system path for the WAL (created if it does not exist).
    /// * `sync` - if true, every append is followed by `fsync`.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file,
            path,
            sync,
            buf: Vec::with_capacity(256),
        })
    }

    /// Returns the path this WAL writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a Put frame for `key` / `value`.
    pub fn write_put(&mut self, key: &[u8], value: &[u8]) -> Result<(), WalError> {
        self.write_entry(ENTRY_PUT, key, value)
    }

    /// Appends a Delete frame for `key`.
    pub fn write_delete(&mut self, key: &[u8]) -> Result<(), WalError> {
        self.write_entry(ENTRY_DELETE, key, &[])
    }

    /// Serializes one frame and appends it to the WAL file.
    ///
    /// Layout: `[crc32: u32 BE][type: u8][key_len: u32 BE][key]
    /// [val_len: u32 BE][value]`.
    fn write_entry(&mut self, entry_type: u8, key: &[u8], value: &[u8]) -> Result<(), WalError> {
        if key.len() > u32::MAX as usize || value.len() > u32::MAX as usize {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "WAL frame too large (length exceeds u32::MAX)",
            )));
        }

        // Reuse the internal buffer, reserving 4 bytes for the CRC.
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; 4]);

        self.buf.write_u8(entry_type)?;
        self.buf.write_u32::<BigEndian>(key.len() as u32)?;
        self.buf.extend_from_slice(key);
        self.buf.write_u32::<BigEndian>(value.len() as u32)?;
        self.buf.extend_from_slice(value);

        // CRC over everything after the checksum itself.
        let mut hasher = Crc32::new();
        hasher.update(&self.buf[4..]);
        let crc = hasher.finalize();
        self.buf[0..4].copy_from_slice(&crc.to_be_bytes());

        // Single write call for the entire frame.
        self.file.write_all(&self.buf)?;
        self.file.flush()?;

        if self.sync {
            self.file.sync_all()?;
        }

        Ok(())
    }

    /// Forces all buffered data to disk via `sync_all()`.
    ///
    /// Useful when `sync` is `false` (batched mode) and the caller wants to
    /// ensure durability at a specific point.
    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes pending writes. Called on memtable close.
    pub fn close(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        Ok(())
    }
}

/// Sequential WAL reader that yields valid records.
///
/// The reader is generic over any `Read` implementor, allowing it to be used
/// with real files (`WalReader<File>`) or in-memory buffers for testing.
///
/// During replay, each frame's CRC32 is verified. A truncated tail frame
/// (e.g., from a crash mid-write) stops replay and is reported in the
/// [`ReplaySummary`] — all fully-written frames before it are still applied.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
}

impl WalReader<File> {
    /// Opens an existing WAL file for sequential replay.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> WalReader<R> {
    /// Constructs a reader from any `Read` implementor.
    ///
    /// Useful for unit tests that supply an in-memory buffer (e.g.,
    /// `Cursor<Vec<u8>>`).
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Replays every valid frame in the WAL, calling `apply` for each one.
    ///
    /// # Termination
    ///
    /// - **Clean EOF** (no more bytes) -> `Ok` with `truncated: false`.
    /// - **Truncated tail** (partial frame at end) -> `Ok` with
    ///   `truncated: true` after applying all complete frames before it.
    /// - **CRC mismatch** -> `Err(WalError::Corrupt)`. Recovery must refuse
    ///   to start rather than silently drop acknowledged writes.
    /// - **Unknown frame type** -> `Err(WalError::Corrupt)`.
    /// - **I/O error** -> `Err(WalError::Io(...))`.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<ReplaySummary, WalError>
    where
        F: FnMut(WalRecord),
    {
        // Frames larger than this are treated as corruption, not allocation
        // requests.
        const MAX_LEN: u32 = 64 * 1024 * 1024;

        let mut summary = ReplaySummary {
            records: 0,
            truncated: false,
        };

        loop {
            let crc = match self.rdr.read_u32::<BigEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(summary),
                Err(e) => return Err(WalError::Io(e)),
            };

            // Everything after the CRC is part of a single frame; a short
            // read anywhere below is a crash tail, not corruption.
            let mut body = Vec::with_capacity(64);

            let entry_type = match self.rdr.read_u8() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(truncated(summary)),
                Err(e) => return Err(WalError::Io(e)),
            };
            body.push(entry_type);

            let key = match self.read_chunk(&mut body, MAX_LEN)? {
                Some(k) => k,
                None => return Ok(truncated(summary)),
            };
            let value = match self.read_chunk(&mut body, MAX_LEN)? {
                Some(v) => v,
                None => return Ok(truncated(summary)),
            };

            // Verify the checksum only once the full frame is in hand.
            let mut hasher = Crc32::new();
            hasher.update(&body);
            if hasher.finalize() != crc {
                return Err(WalError::Corrupt);
            }

            match entry_type {
                ENTRY_PUT => apply(WalRecord::Put { key, value }),
                ENTRY_DELETE => apply(WalRecord::Del { key }),
                _ => return Err(WalError::Corrupt),
            }
            summary.records += 1;
        }
    }

    /// Reads a `[len: u32 BE][bytes]` chunk, mirroring it into `body` for
    /// checksum verification. Returns `None` on a truncated tail.
    fn read_chunk(&mut self, body: &mut Vec<u8>, max_len: u32) -> Result<Option<Vec<u8>>, WalError> {
        let len = match self.rdr.read_u32::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        };
        if len > max_len {
            return Err(WalError::Corrupt);
        }
        body.extend_from_slice(&len.to_be_bytes());

        let mut bytes = vec![0u8; len as usize];
        match self.rdr.read_exact(&mut bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        }
        body.extend_from_slice(&bytes);
        Ok(Some(bytes))
    }
}

fn truncated(mut summary: ReplaySummary) -> ReplaySummary {
    summary.truncated = true;
    summary
}

/// Removes a WAL file from disk. Called after its memtable has been durably
/// materialized as a manifest-registered SSTable.
pub fn delete_wal<P: AsRef<Path>>(path: P) -> Result<(), WalError> {
    std::fs::remove_file(path)?;
    Ok(())
}
