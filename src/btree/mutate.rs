//! mutate edits btree page images for the write engine.
//!
//! The write path never patches cells in place.  A page is lifted into its
//! cell list, the list is edited, and the page image is rebuilt packed: cell
//! pointers ascending after the header, content starting at the lowest cell
//! offset, no freeblocks, no fragmented bytes.  That keeps every rebuilt page
//! canonical and makes split bookkeeping a plain list operation.

use super::header::{self, PageHeader};
use super::{cell, content_offset, Error, PageType, RowId};
use crate::pager::PageNum;
use byteorder::{BigEndian, ByteOrder};

/// Bytes available for cell pointers plus cell content on a page.
pub fn capacity(page_size: u32, pn: PageNum, page_type: PageType) -> usize {
    page_size as usize - content_offset(pn) - page_type.header_len()
}

/// Space the cell list consumes: each cell plus its 2-byte pointer.
pub fn cells_size(cells: &[Vec<u8>]) -> usize {
    cells.iter().map(|c| c.len() + 2).sum()
}

pub fn fits(page_size: u32, pn: PageNum, page_type: PageType, cells: &[Vec<u8>]) -> bool {
    cells_size(cells) <= capacity(page_size, pn, page_type)
}

/// Lift a page into its header and raw cell list, in pointer-array order.
pub fn read_cells(
    page: &[u8],
    pn: PageNum,
    usable: u32,
) -> Result<(PageHeader, Vec<Vec<u8>>), Error> {
    let start = content_offset(pn);
    let hdr = header::parse(page, start, pn)?;
    let mut cells = Vec::with_capacity(hdr.cell_count as usize);
    for i in 0..hdr.cell_count as usize {
        let off = header::cell_pointer(page, &hdr, start, i, pn)?;
        let len = cell::cell_len(hdr.page_type, &page[off..], usable, pn)?;
        cells.push(page[off..off + len].to_vec());
    }
    Ok((hdr, cells))
}

/// Rebuild a packed page image from a cell list.
///
/// The first `content_offset(pn)` bytes are left zeroed; on page 1 the
/// caller lays the file header over them afterwards.
pub fn build_page(
    page_size: u32,
    pn: PageNum,
    page_type: PageType,
    right_child: Option<PageNum>,
    cells: &[Vec<u8>],
) -> Result<Vec<u8>, Error> {
    if !fits(page_size, pn, page_type, cells) {
        // Callers split before building; reaching this is an engine bug, but
        // it must surface as an error, not a panic.
        return Err(Error::corrupt(pn, "cell list exceeds page capacity"));
    }
    let start = content_offset(pn);
    let mut page = vec![0u8; page_size as usize];
    let total: usize = cells.iter().map(|c| c.len()).sum();
    let content_start = page_size as usize - total;

    let hdr = PageHeader {
        page_type,
        first_freeblock: 0,
        cell_count: cells.len() as u16,
        content_start: if total == 0 { page_size } else { content_start as u32 },
        fragmented_bytes: 0,
        right_child,
    };
    header::write(&mut page, start, &hdr);

    let mut at = content_start;
    for (i, c) in cells.iter().enumerate() {
        page[at..at + c.len()].copy_from_slice(c);
        let ptr_at = header::cell_pointer_offset(page_type, start, i);
        BigEndian::write_u16(&mut page[ptr_at..], at as u16);
        at += c.len();
    }
    Ok(page)
}

/// Split a cell list near 50% fill by accumulated size.  The left half is
/// the largest prefix at or under half the total, so the right side rounds
/// up; both sides always keep at least one cell.
pub fn split_cells(mut cells: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    debug_assert!(cells.len() >= 2, "splitting fewer than two cells");
    let total: usize = cells.iter().map(|c| c.len() + 2).sum();
    let mut acc = 0usize;
    let mut split_at = 0usize;
    for (i, c) in cells.iter().enumerate() {
        let next = acc + c.len() + 2;
        if next * 2 > total && i > 0 {
            break;
        }
        acc = next;
        split_at = i + 1;
    }
    let split_at = split_at.clamp(1, cells.len() - 1);
    let right = cells.split_off(split_at);
    (cells, right)
}

/// Left-child pointer of a table- or index-interior cell.
pub fn interior_left_child(cell: &[u8]) -> PageNum {
    BigEndian::read_u32(cell)
}

/// Copy of an interior cell pointing at a different left child.
pub fn with_left_child(cell: &[u8], child: PageNum) -> Vec<u8> {
    let mut out = cell.to_vec();
    BigEndian::write_u32(&mut out[..4], child);
    out
}

/// Convert an index-leaf cell into the interior cell that carries the same
/// key above a split.  Leaf and interior index cells share the local-payload
/// threshold, so the byte layout only grows the child-pointer prefix.
pub fn index_leaf_to_interior(leaf_cell: &[u8], left_child: PageNum) -> Vec<u8> {
    let mut out = Vec::with_capacity(leaf_cell.len() + 4);
    out.extend_from_slice(&left_child.to_be_bytes());
    out.extend_from_slice(leaf_cell);
    out
}

/// Inverse of [`index_leaf_to_interior`]: the payload part of an interior
/// index cell, as a leaf cell.
pub fn index_interior_to_leaf(interior_cell: &[u8]) -> Vec<u8> {
    interior_cell[4..].to_vec()
}

pub fn table_leaf_rowid(cell_bytes: &[u8], usable: u32, pn: PageNum) -> Result<RowId, Error> {
    Ok(cell::parse_table_leaf(cell_bytes, usable, pn)?.0.rowid)
}

pub fn table_interior_rowid(cell_bytes: &[u8], pn: PageNum) -> Result<RowId, Error> {
    Ok(cell::parse_table_interior(cell_bytes, pn)?.0.rowid)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::sql_value::SqlValue;

    fn leaf_cell(rowid: RowId, text: &str) -> Vec<u8> {
        let payload = record::encode(&[SqlValue::Text(text.into())]);
        cell::build_table_leaf(rowid, payload.len(), &payload, None)
    }

    #[test]
    fn test_build_and_read_cells_round_trip() {
        let cells: Vec<Vec<u8>> = (1..=5).map(|i| leaf_cell(i, "row")).collect();
        let page = build_page(512, 2, PageType::TableLeaf, None, &cells).unwrap();
        let (hdr, back) = read_cells(&page, 2, 512).unwrap();
        assert_eq!(hdr.page_type, PageType::TableLeaf);
        assert_eq!(hdr.cell_count, 5);
        assert_eq!(back, cells);
        assert_eq!(hdr.first_freeblock, 0);
        assert_eq!(hdr.fragmented_bytes, 0);
    }

    #[test]
    fn test_build_page_1_leaves_header_room() {
        let cells = vec![leaf_cell(1, "schema row")];
        let page = build_page(512, 1, PageType::TableLeaf, None, &cells).unwrap();
        assert!(page[..100].iter().all(|b| *b == 0));
        let (hdr, back) = read_cells(&page, 1, 512).unwrap();
        assert_eq!(hdr.cell_count, 1);
        assert_eq!(back, cells);
    }

    #[test]
    fn test_build_page_overflow_detected() {
        let big = vec![leaf_cell(1, &"x".repeat(600))];
        assert!(!fits(512, 2, PageType::TableLeaf, &big));
        assert!(build_page(512, 2, PageType::TableLeaf, None, &big).is_err());
    }

    #[test]
    fn test_interior_page_round_trip() {
        let cells: Vec<Vec<u8>> = (1..=3)
            .map(|i| cell::build_table_interior(i + 10, i as i64 * 100))
            .collect();
        let page = build_page(512, 3, PageType::TableInterior, Some(99), &cells).unwrap();
        let (hdr, back) = read_cells(&page, 3, 512).unwrap();
        assert_eq!(hdr.right_child, Some(99));
        assert_eq!(back, cells);
        assert_eq!(interior_left_child(&back[0]), 11);
        assert_eq!(table_interior_rowid(&back[2], 3).unwrap(), 300);
    }

    #[test]
    fn test_split_cells_balances_by_size() {
        let cells: Vec<Vec<u8>> = (1..=10).map(|i| leaf_cell(i, "equal-size")).collect();
        let (left, right) = split_cells(cells.clone());
        assert_eq!(left.len() + right.len(), 10);
        assert_eq!(left.len(), 5);
        // Key order is preserved across the split.
        assert_eq!(left[..], cells[..5]);
        assert_eq!(right[..], cells[5..]);
    }

    #[test]
    fn test_split_cells_uneven_sizes() {
        // One huge cell then small ones; both sides must stay non-empty.
        let mut cells = vec![leaf_cell(1, &"a".repeat(300))];
        for i in 2..=4 {
            cells.push(leaf_cell(i, "s"));
        }
        let (left, right) = split_cells(cells);
        assert!(!left.is_empty());
        assert!(!right.is_empty());
        assert_eq!(left.len(), 1);
    }

    #[test]
    fn test_index_cell_promotion_round_trip() {
        let payload = record::encode(&[SqlValue::Text("key".into()), SqlValue::Int(7)]);
        let leaf = cell::build_index(None, payload.len(), &payload, None);
        let promoted = index_leaf_to_interior(&leaf, 42);
        assert_eq!(interior_left_child(&promoted), 42);
        assert_eq!(index_interior_to_leaf(&promoted), leaf);
        let rewired = with_left_child(&promoted, 43);
        assert_eq!(interior_left_child(&rewired), 43);
    }
}
