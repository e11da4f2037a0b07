//! # SSTable - Sorted String Table
//!
//! Immutable, on-disk storage files for the UndertowKV storage engine.
//!
//! When an in-memory memtable fills up it is flushed to disk as an SSTable.
//! SSTables are *write-once, read-many* — once finalized they are never
//! modified, only merged into deeper tiers and eventually unlinked.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA REGION (records in ascending key order)                  │
//! │                                                               │
//! │ key_len (u32) | key | val_len (u32) | value                   │
//! │ ... repeated for each record ...                              │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX REGION (every 16th key)                                 │
//! │                                                               │
//! │ key_len (u32) | key | offset (u64) | size (u64)               │
//! ├───────────────────────────────────────────────────────────────┤
//! │ BLOOM REGION                                                  │
//! │                                                               │
//! │ len (u32) | serialized BloomFilter                            │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 28 bytes)                                 │
//! │                                                               │
//! │ index_offset (u64) | index_size (u32)                         │
//! │ bloom_offset (u64) | bloom_size (u32) | magic "SST1" (u32)    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian. The sparse index means a point lookup reads
//! at most one stride's worth of records after a single seek; the bloom
//! filter short-circuits most lookups for absent keys without touching the
//! data region at all.

mod format;
mod reader;
mod writer;

pub use format::{Footer, IndexEntry, FOOTER_LEN, INDEX_STRIDE, SSTABLE_MAGIC};
pub use reader::SsTableReader;
pub use writer::SsTableWriter;

#[cfg(test)]
mod tests;
