//! cell decodes and encodes the cells of btree pages.
//!
//! Cell formats, in order of appearance on the page:
//!
//! Table leaf (0x0d): payload length varint, rowid varint, the local part of
//! the payload, then a 4-byte first-overflow page number only when the
//! payload spills.
//!
//! Table interior (0x05): 4-byte left-child page number, rowid varint.  The
//! page's right-most child lives in the page header.
//!
//! Index leaf (0x0a): payload length varint, local payload, optional 4-byte
//! first-overflow page number.
//!
//! Index interior (0x02): 4-byte left-child page number, then the same shape
//! as an index leaf cell.

use byteorder::{BigEndian, ByteOrder};

use super::{Error, PageType, RowId};
use crate::pager::PageNum;
use crate::varint;

/// How much of a `payload_len`-byte payload stays on the btree page.
///
/// Let U be the usable page size.  A table-leaf payload may fill the page to
/// X = U-35; index payloads keep interior pages branchy with
/// X = ((U-12)*64/255)-23.  Once a payload spills, at least
/// M = ((U-12)*32/255)-23 bytes stay local, rounded so the spilled part is a
/// whole number of overflow pages when possible (the K formula).
pub fn local_payload_len(payload_len: usize, usable: u32, table_leaf: bool) -> usize {
    let x = max_local(usable, table_leaf);
    if payload_len <= x {
        return payload_len;
    }
    let m = min_local(usable);
    let k = m + (payload_len - m) % (usable as usize - 4);
    if k <= x {
        k
    } else {
        m
    }
}

pub fn max_local(usable: u32, table_leaf: bool) -> usize {
    if table_leaf {
        usable as usize - 35
    } else {
        (usable as usize - 12) * 64 / 255 - 23
    }
}

pub fn min_local(usable: u32) -> usize {
    (usable as usize - 12) * 32 / 255 - 23
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLeafCell<'a> {
    pub rowid: RowId,
    /// Total payload length, local and spilled together.
    pub payload_len: usize,
    pub local_payload: &'a [u8],
    pub first_overflow: Option<PageNum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInteriorCell {
    pub left_child: PageNum,
    pub rowid: RowId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCell<'a> {
    /// Present on interior cells only.
    pub left_child: Option<PageNum>,
    pub payload_len: usize,
    pub local_payload: &'a [u8],
    pub first_overflow: Option<PageNum>,
}

fn read_varint_at(cell: &[u8], at: usize, pn: PageNum) -> Result<(u64, usize), Error> {
    varint::decode(cell.get(at..).unwrap_or(&[]))
        .map_err(|_| Error::corrupt(pn, "truncated varint in cell"))
}

/// Decode the table-leaf cell starting at `cell[0]`, returning the cell and
/// its total encoded length on the page.
pub fn parse_table_leaf<'a>(
    cell: &'a [u8],
    usable: u32,
    pn: PageNum,
) -> Result<(TableLeafCell<'a>, usize), Error> {
    let (payload_len, n1) = read_varint_at(cell, 0, pn)?;
    let payload_len = payload_len as usize;
    let (rowid, n2) = read_varint_at(cell, n1, pn)?;
    let local = local_payload_len(payload_len, usable, true);
    let body = n1 + n2;
    if cell.len() < body + local {
        return Err(Error::corrupt(pn, "table leaf cell payload past end of page"));
    }
    let local_payload = &cell[body..body + local];
    let (first_overflow, total) = if local < payload_len {
        if cell.len() < body + local + 4 {
            return Err(Error::corrupt(pn, "overflow pointer past end of page"));
        }
        let ovf = BigEndian::read_u32(&cell[body + local..]);
        if ovf == 0 {
            return Err(Error::corrupt(pn, "spilled cell with zero overflow page"));
        }
        (Some(ovf), body + local + 4)
    } else {
        (None, body + local)
    };
    Ok((
        TableLeafCell {
            rowid: rowid as i64,
            payload_len,
            local_payload,
            first_overflow,
        },
        total,
    ))
}

pub fn parse_table_interior(
    cell: &[u8],
    pn: PageNum,
) -> Result<(TableInteriorCell, usize), Error> {
    if cell.len() < 5 {
        return Err(Error::corrupt(pn, "table interior cell too short"));
    }
    let left_child = BigEndian::read_u32(cell);
    let (rowid, n) = read_varint_at(cell, 4, pn)?;
    Ok((
        TableInteriorCell {
            left_child,
            rowid: rowid as i64,
        },
        4 + n,
    ))
}

/// Decode an index cell; `interior` selects whether a left-child pointer
/// prefixes the payload.
pub fn parse_index<'a>(
    cell: &'a [u8],
    usable: u32,
    interior: bool,
    pn: PageNum,
) -> Result<(IndexCell<'a>, usize), Error> {
    let mut at = 0;
    let left_child = if interior {
        if cell.len() < 4 {
            return Err(Error::corrupt(pn, "index interior cell too short"));
        }
        at = 4;
        Some(BigEndian::read_u32(cell))
    } else {
        None
    };
    let (payload_len, n) = read_varint_at(cell, at, pn)?;
    let payload_len = payload_len as usize;
    at += n;
    let local = local_payload_len(payload_len, usable, false);
    if cell.len() < at + local {
        return Err(Error::corrupt(pn, "index cell payload past end of page"));
    }
    let local_payload = &cell[at..at + local];
    at += local;
    let first_overflow = if local < payload_len {
        if cell.len() < at + 4 {
            return Err(Error::corrupt(pn, "overflow pointer past end of page"));
        }
        let ovf = BigEndian::read_u32(&cell[at..]);
        if ovf == 0 {
            return Err(Error::corrupt(pn, "spilled cell with zero overflow page"));
        }
        at += 4;
        Some(ovf)
    } else {
        None
    };
    Ok((
        IndexCell {
            left_child,
            payload_len,
            local_payload,
            first_overflow,
        },
        at,
    ))
}

/// Total encoded length of the cell starting at `cell[0]` on a page of the
/// given type.  The mutator uses this to lift cells off a page unchanged.
pub fn cell_len(
    page_type: PageType,
    cell: &[u8],
    usable: u32,
    pn: PageNum,
) -> Result<usize, Error> {
    match page_type {
        PageType::TableLeaf => parse_table_leaf(cell, usable, pn).map(|(_, n)| n),
        PageType::TableInterior => parse_table_interior(cell, pn).map(|(_, n)| n),
        PageType::IndexLeaf => parse_index(cell, usable, false, pn).map(|(_, n)| n),
        PageType::IndexInterior => parse_index(cell, usable, true, pn).map(|(_, n)| n),
    }
}

// ------------------------------------------------------------------
// Builders, used by the write engine.  The caller has already split the
// payload with `local_payload_len` and allocated any overflow chain.

pub fn build_table_leaf(
    rowid: RowId,
    payload_len: usize,
    local: &[u8],
    first_overflow: Option<PageNum>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(local.len() + 22);
    let mut buf = [0u8; varint::MAX_VARINT_LEN];
    let n = varint::encode(&mut buf, payload_len as u64);
    out.extend_from_slice(&buf[..n]);
    let n = varint::encode_i64(&mut buf, rowid);
    out.extend_from_slice(&buf[..n]);
    out.extend_from_slice(local);
    if let Some(ovf) = first_overflow {
        out.extend_from_slice(&ovf.to_be_bytes());
    }
    out
}

pub fn build_table_interior(left_child: PageNum, rowid: RowId) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.extend_from_slice(&left_child.to_be_bytes());
    let mut buf = [0u8; varint::MAX_VARINT_LEN];
    let n = varint::encode_i64(&mut buf, rowid);
    out.extend_from_slice(&buf[..n]);
    out
}

pub fn build_index(
    left_child: Option<PageNum>,
    payload_len: usize,
    local: &[u8],
    first_overflow: Option<PageNum>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(local.len() + 17);
    if let Some(lc) = left_child {
        out.extend_from_slice(&lc.to_be_bytes());
    }
    let mut buf = [0u8; varint::MAX_VARINT_LEN];
    let n = varint::encode(&mut buf, payload_len as u64);
    out.extend_from_slice(&buf[..n]);
    out.extend_from_slice(local);
    if let Some(ovf) = first_overflow {
        out.extend_from_slice(&ovf.to_be_bytes());
    }
    out
}
