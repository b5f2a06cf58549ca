//! freelist reads and builds the linked trunk pages that track reusable
//! pages.
//!
//! A trunk page is: u32 page number of the next trunk (0 at the end), u32
//! leaf count, then that many u32 leaf page numbers.  Leaves hold no
//! structure at all; their numbers simply wait in a trunk until the
//! allocator hands them out again.

use byteorder::{BigEndian, ByteOrder};

use crate::pager::{PageNum, PageSource};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Corrupt freelist trunk page {page}: {reason}")]
    CorruptTrunk { page: PageNum, reason: &'static str },
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkPage {
    pub next_trunk: PageNum,
    pub leaves: Vec<PageNum>,
}

/// Leaf numbers one trunk page can carry.
pub fn max_leaves(page_size: u32) -> usize {
    (page_size as usize - 8) / 4
}

pub fn parse_trunk(page: &[u8], pn: PageNum) -> Result<TrunkPage, Error> {
    if page.len() < 8 {
        return Err(Error::CorruptTrunk {
            page: pn,
            reason: "trunk smaller than its fixed fields",
        });
    }
    let next_trunk = BigEndian::read_u32(&page[0..]);
    let count = BigEndian::read_u32(&page[4..]) as usize;
    if count > max_leaves(page.len() as u32) {
        return Err(Error::CorruptTrunk {
            page: pn,
            reason: "leaf count exceeds page capacity",
        });
    }
    let mut leaves = Vec::with_capacity(count);
    for i in 0..count {
        leaves.push(BigEndian::read_u32(&page[8 + 4 * i..]));
    }
    Ok(TrunkPage { next_trunk, leaves })
}

pub fn build_trunk(next_trunk: PageNum, leaves: &[PageNum], page_size: u32) -> Vec<u8> {
    debug_assert!(leaves.len() <= max_leaves(page_size));
    let mut page = vec![0u8; page_size as usize];
    BigEndian::write_u32(&mut page[0..], next_trunk);
    BigEndian::write_u32(&mut page[4..], leaves.len() as u32);
    for (i, leaf) in leaves.iter().enumerate() {
        BigEndian::write_u32(&mut page[8 + 4 * i..], *leaf);
    }
    page
}

/// Every page the freelist owns (trunks and leaves), walking from `head`.
/// The validator uses this for its reachability accounting.
pub fn all_pages(source: &dyn PageSource, head: PageNum) -> Result<Vec<PageNum>, Error> {
    let mut pages = Vec::new();
    let mut trunk_pn = head;
    let limit = source.page_count() as usize + 1;
    while trunk_pn != 0 {
        pages.push(trunk_pn);
        if pages.len() > limit {
            return Err(Error::CorruptTrunk {
                page: trunk_pn,
                reason: "trunk chain cycles",
            });
        }
        let page = source.page(trunk_pn)?;
        let trunk = parse_trunk(&page, trunk_pn)?;
        pages.extend_from_slice(&trunk.leaves);
        trunk_pn = trunk.next_trunk;
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trunk_round_trip() {
        let t = TrunkPage {
            next_trunk: 9,
            leaves: vec![4, 7, 12],
        };
        let page = build_trunk(t.next_trunk, &t.leaves, 512);
        assert_eq!(parse_trunk(&page, 3).unwrap(), t);
    }

    #[test]
    fn test_max_leaves() {
        assert_eq!(max_leaves(512), 126);
        assert_eq!(max_leaves(4096), 1022);
    }

    #[test]
    fn test_absurd_leaf_count_is_corrupt() {
        let mut page = build_trunk(0, &[], 512);
        BigEndian::write_u32(&mut page[4..], 10_000);
        assert!(parse_trunk(&page, 2).is_err());
    }

    #[test]
    fn test_walk_all_pages() {
        use crate::pager::{MemPager, PageSink};
        let pager = MemPager::new(512);
        pager.write_page(1, &vec![0u8; 512]).unwrap();
        pager
            .write_page(2, &build_trunk(3, &[5, 6], 512))
            .unwrap();
        pager.write_page(3, &build_trunk(0, &[4], 512)).unwrap();
        pager.write_page(4, &vec![0u8; 512]).unwrap();
        pager.write_page(5, &vec![0u8; 512]).unwrap();
        pager.write_page(6, &vec![0u8; 512]).unwrap();
        let pages = all_pages(&pager, 2).unwrap();
        assert_eq!(pages, vec![2, 5, 6, 3, 4]);
    }
}
