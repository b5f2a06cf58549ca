//! header reads and writes the header region of a btree page.
//!
//! A btree page is divided into regions in the following order:
//! 1. The 100-byte database file header (page 1 only)
//! 2. The 8 or 12 byte btree page header
//! 3. The cell pointer array (2 bytes per cell, in key order)
//! 4. Unallocated space
//! 5. The cell content area, growing down from the end of the page

use byteorder::{BigEndian, ByteOrder};

use super::{Error, PageType};
use crate::pager::PageNum;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    /// Offset of the first freeblock, or 0 if none.
    pub first_freeblock: u16,
    pub cell_count: u16,
    /// Start of the cell content area; the on-disk 0 encodes 65536.
    pub content_start: u32,
    pub fragmented_bytes: u8,
    /// Right-most child, interior pages only.
    pub right_child: Option<PageNum>,
}

impl PageHeader {
    /// A header for a freshly initialized page with no cells.
    pub fn empty(page_type: PageType, usable_size: u32) -> PageHeader {
        PageHeader {
            page_type,
            first_freeblock: 0,
            cell_count: 0,
            content_start: usable_size,
            fragmented_bytes: 0,
            right_child: if page_type.is_leaf() { None } else { Some(0) },
        }
    }
}

/// Parse the page header at `start` (0, or 100 on page 1).
pub fn parse(page: &[u8], start: usize, pn: PageNum) -> Result<PageHeader, Error> {
    if page.len() < start + 8 {
        return Err(Error::corrupt(pn, "page too small for btree header"));
    }
    let type_byte = page[start];
    let page_type = PageType::from_byte(type_byte).ok_or(Error::UnknownPageType {
        page: pn,
        type_byte,
    })?;
    if !page_type.is_leaf() && page.len() < start + 12 {
        return Err(Error::corrupt(pn, "page too small for interior header"));
    }
    let first_freeblock = BigEndian::read_u16(&page[start + 1..]);
    let cell_count = BigEndian::read_u16(&page[start + 3..]);
    let content_start = match BigEndian::read_u16(&page[start + 5..]) {
        0 => 65536,
        x => x as u32,
    };
    let fragmented_bytes = page[start + 7];
    let right_child = if page_type.is_leaf() {
        None
    } else {
        Some(BigEndian::read_u32(&page[start + 8..]))
    };
    Ok(PageHeader {
        page_type,
        first_freeblock,
        cell_count,
        content_start,
        fragmented_bytes,
        right_child,
    })
}

/// Write `h` back at `start`.  The caller has already sized the page.
pub fn write(page: &mut [u8], start: usize, h: &PageHeader) {
    page[start] = h.page_type.to_byte();
    BigEndian::write_u16(&mut page[start + 1..], h.first_freeblock);
    BigEndian::write_u16(&mut page[start + 3..], h.cell_count);
    let encoded_start: u16 = if h.content_start == 65536 {
        0
    } else {
        h.content_start as u16
    };
    BigEndian::write_u16(&mut page[start + 5..], encoded_start);
    page[start + 7] = h.fragmented_bytes;
    if let Some(rc) = h.right_child {
        BigEndian::write_u32(&mut page[start + 8..], rc);
    }
}

/// Offset of cell-pointer-array entry `idx`.
pub fn cell_pointer_offset(page_type: PageType, start: usize, idx: usize) -> usize {
    start + page_type.header_len() + 2 * idx
}

/// Read the `idx`-th cell pointer.  Pointers are page-absolute offsets even
/// on page 1.
pub fn cell_pointer(
    page: &[u8],
    hdr: &PageHeader,
    start: usize,
    idx: usize,
    pn: PageNum,
) -> Result<usize, Error> {
    if idx >= hdr.cell_count as usize {
        return Err(Error::corrupt(
            pn,
            format!("cell index {idx} out of range ({} cells)", hdr.cell_count),
        ));
    }
    let at = cell_pointer_offset(hdr.page_type, start, idx);
    if at + 2 > page.len() {
        return Err(Error::corrupt(pn, "cell pointer array past end of page"));
    }
    let off = BigEndian::read_u16(&page[at..]) as usize;
    if off < start + hdr.page_type.header_len() || off >= page.len() {
        return Err(Error::corrupt(pn, format!("cell pointer {off} out of bounds")));
    }
    Ok(off)
}

/// Walk the freeblock chain, yielding `(offset, len)` pairs.  Used by the
/// validator's space accounting; the write path defragments instead of
/// keeping freeblocks.
pub fn freeblocks(page: &[u8], hdr: &PageHeader, pn: PageNum) -> Result<Vec<(usize, usize)>, Error> {
    let mut out = Vec::new();
    let mut at = hdr.first_freeblock as usize;
    let mut guard = 0;
    while at != 0 {
        if at + 4 > page.len() {
            return Err(Error::corrupt(pn, "freeblock past end of page"));
        }
        let next = BigEndian::read_u16(&page[at..]) as usize;
        let len = BigEndian::read_u16(&page[at + 2..]) as usize;
        out.push((at, len));
        if next != 0 && next <= at {
            return Err(Error::corrupt(pn, "freeblock chain not ascending"));
        }
        at = next;
        guard += 1;
        if guard > page.len() / 4 {
            return Err(Error::corrupt(pn, "freeblock chain does not terminate"));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip_leaf() {
        let mut page = vec![0u8; 512];
        let h = PageHeader {
            page_type: PageType::TableLeaf,
            first_freeblock: 0,
            cell_count: 3,
            content_start: 400,
            fragmented_bytes: 2,
            right_child: None,
        };
        write(&mut page, 0, &h);
        assert_eq!(parse(&page, 0, 2).unwrap(), h);
    }

    #[test]
    fn test_header_round_trip_interior() {
        let mut page = vec![0u8; 512];
        let h = PageHeader {
            page_type: PageType::IndexInterior,
            first_freeblock: 0,
            cell_count: 1,
            content_start: 200,
            fragmented_bytes: 0,
            right_child: Some(7),
        };
        write(&mut page, 0, &h);
        assert_eq!(parse(&page, 0, 3).unwrap(), h);
    }

    #[test]
    fn test_empty_64k_content_start_encoding() {
        let mut page = vec![0u8; 512]; // only the header matters here
        let h = PageHeader::empty(PageType::TableLeaf, 65536);
        write(&mut page, 0, &h);
        assert_eq!(&page[5..7], &[0, 0]);
        assert_eq!(parse(&page, 0, 2).unwrap().content_start, 65536);
    }

    #[test]
    fn test_unknown_page_type() {
        let mut page = vec![0u8; 512];
        page[0] = 0x07;
        assert!(matches!(
            parse(&page, 0, 4),
            Err(Error::UnknownPageType { page: 4, type_byte: 0x07 })
        ));
    }

    #[test]
    fn test_freeblock_chain_walk() {
        let mut page = vec![0u8; 512];
        let mut h = PageHeader::empty(PageType::TableLeaf, 512);
        h.first_freeblock = 200;
        h.content_start = 180;
        write(&mut page, 0, &h);
        // Two freeblocks: (200, 16) -> (300, 24) -> end.
        BigEndian::write_u16(&mut page[200..], 300);
        BigEndian::write_u16(&mut page[202..], 16);
        BigEndian::write_u16(&mut page[300..], 0);
        BigEndian::write_u16(&mut page[302..], 24);
        let h = parse(&page, 0, 2).unwrap();
        assert_eq!(freeblocks(&page, &h, 2).unwrap(), vec![(200, 16), (300, 24)]);

        // A backwards chain is corrupt, not an infinite loop.
        BigEndian::write_u16(&mut page[300..], 200);
        assert!(freeblocks(&page, &h, 2).is_err());
    }

    #[test]
    fn test_cell_pointer_bounds() {
        let mut page = vec![0u8; 512];
        let mut h = PageHeader::empty(PageType::TableLeaf, 512);
        h.cell_count = 1;
        h.content_start = 500;
        write(&mut page, 0, &h);
        BigEndian::write_u16(&mut page[8..], 500);
        assert_eq!(cell_pointer(&page, &h, 0, 0, 2).unwrap(), 500);
        assert!(cell_pointer(&page, &h, 0, 1, 2).is_err());
        // A pointer into the header region is corrupt.
        BigEndian::write_u16(&mut page[8..], 4);
        assert!(cell_pointer(&page, &h, 0, 0, 2).is_err());
    }
}
