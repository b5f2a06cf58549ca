//! overflow walks the singly linked chains that hold payload bytes too large
//! to stay on a btree page.
//!
//! An overflow page is a 4-byte next-page number (zero terminates the chain)
//! followed by payload content filling the rest of the usable space.

use byteorder::{BigEndian, ByteOrder};

use super::Error;
use crate::pager::{PageNum, PageSource};

/// Payload bytes each overflow page carries.
pub fn capacity_per_page(usable: u32) -> usize {
    usable as usize - 4
}

/// Assemble a full payload from its local part plus the overflow chain.
///
/// This is the one decode path that copies; in-page payloads are served as
/// borrowed spans and never reach here.
pub fn assemble_payload(
    source: &dyn PageSource,
    local: &[u8],
    payload_len: usize,
    first_overflow: Option<PageNum>,
    owner: PageNum,
) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(payload_len);
    out.extend_from_slice(local);
    let mut next = match first_overflow {
        None => {
            if out.len() != payload_len {
                return Err(Error::corrupt(owner, "payload shorter than declared"));
            }
            return Ok(out);
        }
        Some(pn) => pn,
    };
    let per_page = capacity_per_page(source.page_size());
    // An intact chain cannot be longer than the spilled byte count requires.
    let max_pages = (payload_len - local.len()) / per_page + 2;
    let mut visited = 0;
    while next != 0 {
        visited += 1;
        if visited > max_pages {
            return Err(Error::corrupt(owner, "overflow chain longer than payload"));
        }
        let page = source.page(next)?;
        let take = (payload_len - out.len()).min(per_page);
        out.extend_from_slice(&page[4..4 + take]);
        if out.len() == payload_len {
            break;
        }
        next = BigEndian::read_u32(&page[..4]);
        if next == 0 {
            return Err(Error::corrupt(owner, "overflow chain ended early"));
        }
    }
    Ok(out)
}

/// Collect the page numbers of a chain, first to last.  The write engine
/// frees these when the owning cell is deleted.
pub fn chain_pages(
    source: &dyn PageSource,
    first: PageNum,
    owner: PageNum,
) -> Result<Vec<PageNum>, Error> {
    let mut pages = Vec::new();
    let mut next = first;
    let limit = source.page_count() as usize + 1;
    while next != 0 {
        pages.push(next);
        if pages.len() > limit {
            return Err(Error::corrupt(owner, "overflow chain cycles"));
        }
        let page = source.page(next)?;
        next = BigEndian::read_u32(&page[..4]);
    }
    Ok(pages)
}

/// Split the spilled tail of a payload into per-page chunks, in chain order.
/// The write engine pairs each chunk with an allocated page.
pub fn chunk_payload(spilled: &[u8], usable: u32) -> Vec<&[u8]> {
    spilled.chunks(capacity_per_page(usable)).collect()
}

/// Build the image of one overflow page.
pub fn build_page(next: PageNum, chunk: &[u8], page_size: u32) -> Vec<u8> {
    let mut page = vec![0u8; page_size as usize];
    BigEndian::write_u32(&mut page[..4], next);
    page[4..4 + chunk.len()].copy_from_slice(chunk);
    page
}
