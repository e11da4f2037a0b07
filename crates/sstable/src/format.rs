//! On-disk layout constants and codec helpers shared by the writer and
//! reader. All integers are big-endian.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};

/// Magic identifying the table format: ASCII "SST1".
pub const SSTABLE_MAGIC: u32 = 0x5353_5431;

/// Footer length: index_offset(8) + index_size(4) + bloom_offset(8) +
/// bloom_size(4) + magic(4).
pub const FOOTER_LEN: u64 = 28;

/// Every Nth appended record gets a sparse index entry.
pub const INDEX_STRIDE: usize = 16;

/// One sparse-index slot: the key at a stride boundary plus the location and
/// encoded size of its data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub offset: u64,
    pub size: u64,
}

/// Parsed footer fields locating the index and bloom regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_offset: u64,
    pub index_size: u32,
    pub bloom_offset: u64,
    pub bloom_size: u32,
}

/// Writes the fixed-size footer.
pub fn write_footer<W: Write>(w: &mut W, footer: &Footer) -> IoResult<()> {
    w.write_u64::<BigEndian>(footer.index_offset)?;
    w.write_u32::<BigEndian>(footer.index_size)?;
    w.write_u64::<BigEndian>(footer.bloom_offset)?;
    w.write_u32::<BigEndian>(footer.bloom_size)?;
    w.write_u32::<BigEndian>(SSTABLE_MAGIC)?;
    Ok(())
}

/// Reads the footer from the tail of the file, returning the parsed fields
/// and the file size. The magic must match; offsets are validated by the
/// caller against the file size.
pub fn read_footer<R: Read + Seek>(r: &mut R) -> IoResult<(Footer, u64)> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < FOOTER_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "file too small to contain a footer",
        ));
    }
    r.seek(SeekFrom::Start(filesize - FOOTER_LEN))?;

    let index_offset = r.read_u64::<BigEndian>()?;
    let index_size = r.read_u32::<BigEndian>()?;
    let bloom_offset = r.read_u64::<BigEndian>()?;
    let bloom_size = r.read_u32::<BigEndian>()?;
    let magic = r.read_u32::<BigEndian>()?;

    if magic != SSTABLE_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad sstable magic: {:#010x}", magic),
        ));
    }

    Ok((
        Footer {
            index_offset,
            index_size,
            bloom_offset,
            bloom_size,
        },
        filesize,
    ))
}

/// Encodes a data record: `[key_len: u32][key][val_len: u32][value]`.
/// Returns the encoded length.
pub fn write_record<W: Write>(w: &mut W, key: &[u8], value: &[u8]) -> IoResult<u64> {
    w.write_u32::<BigEndian>(key.len() as u32)?;
    w.write_all(key)?;
    w.write_u32::<BigEndian>(value.len() as u32)?;
    w.write_all(value)?;
    Ok(record_len(key, value))
}

/// Encoded length of a data record.
pub fn record_len(key: &[u8], value: &[u8]) -> u64 {
    4 + key.len() as u64 + 4 + value.len() as u64
}

/// Encodes one sparse index entry: `[key_len: u32][key][offset: u64]
/// [size: u64]`.
pub fn write_index_entry<W: Write>(w: &mut W, entry: &IndexEntry) -> IoResult<()> {
    w.write_u32::<BigEndian>(entry.key.len() as u32)?;
    w.write_all(&entry.key)?;
    w.write_u64::<BigEndian>(entry.offset)?;
    w.write_u64::<BigEndian>(entry.size)?;
    Ok(())
}
