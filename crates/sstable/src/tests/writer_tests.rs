use crate::format::{Footer, FOOTER_LEN, INDEX_STRIDE, SSTABLE_MAGIC};
use crate::{SsTableReader, SsTableWriter};
use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Seek, SeekFrom};
use tempfile::tempdir;

fn write_table(path: &std::path::Path, n: usize) -> Result<()> {
    let mut w = SsTableWriter::create(path, n)?;
    for i in 0..n {
        w.append(
            format!("key{:04}", i).as_bytes(),
            format!("val{:04}", i).as_bytes(),
        )?;
    }
    w.finalize()
}

fn read_footer_raw(path: &std::path::Path) -> Result<(Footer, u32, u64)> {
    let mut f = std::fs::File::open(path)?;
    let filesize = f.metadata()?.len();
    f.seek(SeekFrom::Start(filesize - FOOTER_LEN))?;
    let footer = Footer {
        index_offset: f.read_u64::<BigEndian>()?,
        index_size: f.read_u32::<BigEndian>()?,
        bloom_offset: f.read_u64::<BigEndian>()?,
        bloom_size: f.read_u32::<BigEndian>()?,
    };
    let magic = f.read_u32::<BigEndian>()?;
    Ok((footer, magic, filesize))
}

#[test]
fn footer_magic_and_offsets() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sst_0000.db");
    write_table(&path, 40)?;

    let (footer, magic, filesize) = read_footer_raw(&path)?;
    assert_eq!(magic, SSTABLE_MAGIC);
    assert!(footer.index_offset < filesize);
    assert_eq!(
        footer.index_offset + footer.index_size as u64,
        footer.bloom_offset
    );
    assert_eq!(
        footer.bloom_offset + 4 + footer.bloom_size as u64 + FOOTER_LEN,
        filesize
    );
    Ok(())
}

#[test]
fn sparse_index_captures_every_sixteenth_record() -> Result<()> {
    let dir = tempdir()?;

    // 40 records -> boundaries at 0, 16, 32 -> 3 index entries.
    let path = dir.path().join("sst_0000.db");
    write_table(&path, 40)?;
    let reader = SsTableReader::open(&path)?;
    assert_eq!(reader.index_len(), 3);

    // Exactly one full stride -> a single entry.
    let path = dir.path().join("sst_0001.db");
    write_table(&path, INDEX_STRIDE)?;
    let reader = SsTableReader::open(&path)?;
    assert_eq!(reader.index_len(), 1);

    // One past the stride -> a second boundary.
    let path = dir.path().join("sst_0002.db");
    write_table(&path, INDEX_STRIDE + 1)?;
    let reader = SsTableReader::open(&path)?;
    assert_eq!(reader.index_len(), 2);
    Ok(())
}

#[test]
fn min_and_max_bound_all_keys() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sst_0000.db");
    write_table(&path, 100)?;

    let reader = SsTableReader::open(&path)?;
    assert_eq!(reader.min_key(), b"key0000");
    assert_eq!(reader.max_key(), b"key0099");
    Ok(())
}

#[test]
fn append_rejects_out_of_order_keys() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sst_0000.db");

    let mut w = SsTableWriter::create(&path, 10)?;
    w.append(b"b", b"1")?;
    assert!(w.append(b"a", b"2").is_err());
    Ok(())
}

#[test]
fn append_accepts_equal_keys() -> Result<()> {
    // Non-decreasing, not strictly increasing: a repeated key is the
    // caller's business (memtables never produce one, but the contract is
    // only about ordering).
    let dir = tempdir()?;
    let path = dir.path().join("sst_0000.db");

    let mut w = SsTableWriter::create(&path, 2)?;
    w.append(b"a", b"1")?;
    w.append(b"a", b"2")?;
    w.finalize()
}

#[test]
fn writer_stats_mention_index_entries() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sst_0000.db");

    let mut w = SsTableWriter::create(&path, 40)?;
    for i in 0..40 {
        w.append(format!("key{:04}", i).as_bytes(), b"v")?;
    }
    assert_eq!(w.records(), 40);
    let stats = w.stats();
    assert!(stats.contains("index entries: 3"), "stats: {}", stats);
    Ok(())
}

#[test]
fn single_record_table_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sst_0000.db");

    let mut w = SsTableWriter::create(&path, 1)?;
    w.append(b"only", b"one")?;
    w.finalize()?;

    let reader = SsTableReader::open(&path)?;
    assert_eq!(reader.min_key(), b"only");
    assert_eq!(reader.max_key(), b"only");
    assert_eq!(reader.get(b"only")?, Some(b"one".to_vec()));
    Ok(())
}

#[test]
fn data_region_is_big_endian_length_prefixed() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("sst_0000.db");

    let mut w = SsTableWriter::create(&path, 1)?;
    w.append(b"key", b"value")?;
    w.finalize()?;

    let bytes = std::fs::read(&path)?;
    assert_eq!(&bytes[0..4], &3u32.to_be_bytes());
    assert_eq!(&bytes[4..7], b"key");
    assert_eq!(&bytes[7..11], &5u32.to_be_bytes());
    assert_eq!(&bytes[11..16], b"value");
    Ok(())
}
