use anyhow::{ensure, Result};
use bloom::BloomFilter;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{
    record_len, write_footer, write_index_entry, write_record, Footer, IndexEntry, INDEX_STRIDE,
};

/// Target false-positive rate for the embedded bloom filter.
const BLOOM_FPR: f64 = 0.01;

/// Streaming writer producing one immutable table file.
///
/// Keys must arrive in non-decreasing order — callers iterate a sorted
/// memtable, so this is a contract check rather than a sorting step. The
/// writer tracks min/max keys, feeds every key into a bloom filter sized for
/// `expected_keys` at 1% FPR, and captures a sparse index entry for every
/// [`INDEX_STRIDE`]th record (the 0th, 16th, 32nd, ...).
///
/// [`finalize`](SsTableWriter::finalize) lays the file out as:
/// data region, index region, bloom region, 28-byte footer; then flushes and
/// fsyncs.
pub struct SsTableWriter {
    file: BufWriter<File>,
    path: PathBuf,
    data_offset: u64,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    records: usize,
}

impl SsTableWriter {
    /// Creates the table file and a bloom filter sized for `expected_keys`.
    pub fn create<P: AsRef<Path>>(path: P, expected_keys: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        Ok(Self {
            file: BufWriter::new(file),
            path,
            data_offset: 0,
            index: Vec::with_capacity(expected_keys / INDEX_STRIDE + 1),
            bloom: BloomFilter::new(expected_keys, BLOOM_FPR),
            min_key: Vec::new(),
            max_key: Vec::new(),
            records: 0,
        })
    }

    /// Appends one record. Keys must be non-decreasing.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(
            self.records == 0 || key >= self.max_key.as_slice(),
            "keys must be appended in sorted order"
        );

        if self.records == 0 {
            self.min_key = key.to_vec();
        }
        self.max_key = key.to_vec();

        self.bloom.add(key);

        let size = record_len(key, value);
        if self.records % INDEX_STRIDE == 0 {
            self.index.push(IndexEntry {
                key: key.to_vec(),
                offset: self.data_offset,
                size,
            });
        }

        write_record(&mut self.file, key, value)?;
        self.data_offset += size;
        self.records += 1;
        Ok(())
    }

    /// Writes the index region, bloom region, and footer, then flushes and
    /// fsyncs the file.
    pub fn finalize(mut self) -> Result<()> {
        let index_offset = self.data_offset;
        let mut index_size = 0u64;
        for entry in &self.index {
            write_index_entry(&mut self.file, entry)?;
            index_size += 4 + entry.key.len() as u64 + 8 + 8;
        }

        let bloom_offset = index_offset + index_size;
        let bloom_size = self.bloom.serialized_size() as u32;
        // Length prefix lets the reader bound the region without trusting
        // the filter's own header.
        use byteorder::{BigEndian, WriteBytesExt};
        self.file.write_u32::<BigEndian>(bloom_size)?;
        self.bloom.write_to(&mut self.file)?;

        write_footer(
            &mut self.file,
            &Footer {
                index_offset,
                index_size: index_size as u32,
                bloom_offset,
                bloom_size,
            },
        )?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of records appended so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.records
    }

    /// Human-readable summary of what has been written.
    #[must_use]
    pub fn stats(&self) -> String {
        format!(
            "data: {} bytes, index entries: {}, bloom fpr: {:.2}%",
            self.data_offset,
            self.index.len(),
            self.bloom.estimated_fpr() * 100.0
        )
    }

    /// Path of the file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
