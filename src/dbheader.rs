//! dbheader reads and writes the 100-byte header at the start of a database file.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("The magic bytes for this file are wrong.")]
    WrongMagic,
    #[error("Read version {0} is not supported (2 means the file needs WAL support).")]
    UnsupportedReadVersion(u8),
    #[error("Page size {0} is not a power of two between 512 and 65536.")]
    UnsupportedPageSize(u32),
    #[error("Schema format {0} is not supported (must be 1 through 4).")]
    UnsupportedSchemaFormat(u32),
    #[error("Text encoding {0} is not a defined encoding.")]
    UnknownTextEncoding(u32),
    #[error("Header is shorter than 100 bytes.")]
    Truncated,
}

pub const HEADER_LEN: usize = 100;
const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Fixed payload fractions; the format requires exactly these values.
const MAX_EMBEDDED_FRACTION: u8 = 64;
const MIN_EMBEDDED_FRACTION: u8 = 32;
const LEAF_FRACTION: u8 = 32;

/// Database text encodings.  Only UTF-8 text is decoded by this engine;
/// UTF-16 databases can still be scanned for integer and blob columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    fn from_u32(v: u32) -> Result<TextEncoding, Error> {
        match v {
            1 => Ok(TextEncoding::Utf8),
            2 => Ok(TextEncoding::Utf16Le),
            3 => Ok(TextEncoding::Utf16Be),
            x => Err(Error::UnknownTextEncoding(x)),
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            TextEncoding::Utf8 => 1,
            TextEncoding::Utf16Le => 2,
            TextEncoding::Utf16Be => 3,
        }
    }
}

/// The decoded database file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_per_page: u8,
    pub change_counter: u32,
    /// The in-header database size in pages.  Zero in files written by very
    /// old libraries; callers fall back to deriving it from the file length.
    pub page_count: u32,
    pub freelist_head: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    pub text_encoding: TextEncoding,
    pub user_version: u32,
    pub application_id: u32,
}

impl DbHeader {
    /// A fresh header for a newly created database of `page_size` bytes per
    /// page, one page long (the schema root).
    pub fn new(page_size: u32) -> DbHeader {
        DbHeader {
            page_size,
            write_version: 1,
            read_version: 1,
            reserved_per_page: 0,
            change_counter: 1,
            page_count: 1,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 1,
            schema_format: 4,
            default_cache_size: 0,
            text_encoding: TextEncoding::Utf8,
            user_version: 0,
            application_id: 0,
        }
    }

    /// Usable bytes per page once the per-page reserved region is excluded.
    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserved_per_page as u32
    }
}

pub fn is_valid_page_size(ps: u32) -> bool {
    (512..=65536).contains(&ps) && ps.is_power_of_two()
}

/// Parse a 100-byte header from the front of `buf` (page 1 or a prefix read).
pub fn parse(buf: &[u8]) -> Result<DbHeader, Error> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Truncated);
    }
    if &buf[0..16] != MAGIC {
        return Err(Error::WrongMagic);
    }
    let mut c = Cursor::new(&buf[16..]);
    let short = |_| Error::Truncated;

    // Offset 16: page size; the value 1 encodes 65536.
    let page_size = match c.read_u16::<BigEndian>().map_err(short)? {
        1 => 65536,
        x => x as u32,
    };
    if !is_valid_page_size(page_size) {
        return Err(Error::UnsupportedPageSize(page_size));
    }

    // Offsets 18/19: write and read format versions.  1 is the
    // rollback-journal format; 2 requires WAL support this engine does not
    // have, so reading such a file would see stale pages.
    let write_version = c.read_u8().map_err(short)?;
    let read_version = c.read_u8().map_err(short)?;
    if read_version > 1 {
        return Err(Error::UnsupportedReadVersion(read_version));
    }

    let reserved_per_page = c.read_u8().map_err(short)?;
    let _max_frac = c.read_u8().map_err(short)?;
    let _min_frac = c.read_u8().map_err(short)?;
    let _leaf_frac = c.read_u8().map_err(short)?;

    let change_counter = c.read_u32::<BigEndian>().map_err(short)?;
    let page_count = c.read_u32::<BigEndian>().map_err(short)?;
    let freelist_head = c.read_u32::<BigEndian>().map_err(short)?;
    let freelist_count = c.read_u32::<BigEndian>().map_err(short)?;
    let schema_cookie = c.read_u32::<BigEndian>().map_err(short)?;

    let schema_format = c.read_u32::<BigEndian>().map_err(short)?;
    if !(1..=4).contains(&schema_format) {
        return Err(Error::UnsupportedSchemaFormat(schema_format));
    }

    let default_cache_size = c.read_u32::<BigEndian>().map_err(short)?;
    let _largest_root_for_vacuum = c.read_u32::<BigEndian>().map_err(short)?;
    let text_encoding = TextEncoding::from_u32(c.read_u32::<BigEndian>().map_err(short)?)?;
    let user_version = c.read_u32::<BigEndian>().map_err(short)?;
    let _incremental_vacuum = c.read_u32::<BigEndian>().map_err(short)?;
    let application_id = c.read_u32::<BigEndian>().map_err(short)?;
    // Offsets 72..92 are reserved, then version-valid-for and the library
    // version number; none of them affect reading.

    Ok(DbHeader {
        page_size,
        write_version,
        read_version,
        reserved_per_page,
        change_counter,
        page_count,
        freelist_head,
        freelist_count,
        schema_cookie,
        schema_format,
        default_cache_size,
        text_encoding,
        user_version,
        application_id,
    })
}

/// Serialize the header into the first 100 bytes of `page1`.
pub fn write(page1: &mut [u8], h: &DbHeader) {
    assert!(page1.len() >= HEADER_LEN);
    page1[0..16].copy_from_slice(MAGIC);
    let mut c = Cursor::new(&mut page1[16..HEADER_LEN]);
    let encoded_page_size: u16 = if h.page_size == 65536 {
        1
    } else {
        h.page_size as u16
    };
    c.write_u16::<BigEndian>(encoded_page_size).unwrap();
    c.write_u8(h.write_version).unwrap();
    c.write_u8(h.read_version).unwrap();
    c.write_u8(h.reserved_per_page).unwrap();
    c.write_u8(MAX_EMBEDDED_FRACTION).unwrap();
    c.write_u8(MIN_EMBEDDED_FRACTION).unwrap();
    c.write_u8(LEAF_FRACTION).unwrap();
    c.write_u32::<BigEndian>(h.change_counter).unwrap();
    c.write_u32::<BigEndian>(h.page_count).unwrap();
    c.write_u32::<BigEndian>(h.freelist_head).unwrap();
    c.write_u32::<BigEndian>(h.freelist_count).unwrap();
    c.write_u32::<BigEndian>(h.schema_cookie).unwrap();
    c.write_u32::<BigEndian>(h.schema_format).unwrap();
    c.write_u32::<BigEndian>(h.default_cache_size).unwrap();
    c.write_u32::<BigEndian>(0).unwrap(); // largest root page (autovacuum off)
    c.write_u32::<BigEndian>(h.text_encoding.to_u32()).unwrap();
    c.write_u32::<BigEndian>(h.user_version).unwrap();
    c.write_u32::<BigEndian>(0).unwrap(); // incremental vacuum off
    c.write_u32::<BigEndian>(h.application_id).unwrap();
    // 20 reserved zero bytes, version-valid-for, sqlite version number.
    let pos = 16 + c.position() as usize;
    for b in &mut page1[pos..HEADER_LEN] {
        *b = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut h = DbHeader::new(4096);
        h.change_counter = 7;
        h.page_count = 42;
        h.freelist_head = 9;
        h.freelist_count = 3;
        h.schema_cookie = 5;
        let mut page = vec![0u8; 4096];
        write(&mut page, &h);
        assert_eq!(parse(&page).unwrap(), h);
    }

    #[test]
    fn test_page_size_encoding_64k() {
        let h = DbHeader::new(65536);
        let mut page = vec![0u8; HEADER_LEN];
        write(&mut page, &h);
        assert_eq!(&page[16..18], &[0, 1]); // 1 encodes 65536
        assert_eq!(parse(&page).unwrap().page_size, 65536);
    }

    #[test]
    fn test_bad_magic() {
        let mut page = vec![0u8; HEADER_LEN];
        write(&mut page, &DbHeader::new(4096));
        page[0] = b'X';
        assert_eq!(parse(&page), Err(Error::WrongMagic));
    }

    #[test]
    fn test_wal_read_version_rejected() {
        let mut page = vec![0u8; HEADER_LEN];
        write(&mut page, &DbHeader::new(4096));
        page[19] = 2;
        assert_eq!(parse(&page), Err(Error::UnsupportedReadVersion(2)));
    }

    #[test]
    fn test_invalid_page_sizes_rejected() {
        for bad in [0u32, 256, 300, 1536] {
            let mut h = DbHeader::new(4096);
            h.page_size = bad;
            let mut page = vec![0u8; HEADER_LEN];
            write(&mut page, &h);
            assert!(parse(&page).is_err(), "page size {bad} should fail");
        }
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(parse(&[0u8; 50]), Err(Error::Truncated));
    }
}
