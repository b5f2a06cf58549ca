//! cursor is a stateful reader over one table or index btree.
//!
//! A cursor keeps an explicit stack of (page, slot) positions from the root
//! to its current row, so `next`/`prev` are incremental: advance within the
//! leaf, and only on leaf exhaustion climb to the parent and descend into the
//! next sibling.
//!
//! Table trees keep every row in the leaves; interior cells are pure
//! separators and are never yielded.  Index trees store entries in interior
//! cells too, so index iteration is a true in-order traversal: left subtree,
//! interior entry, next subtree.

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use super::{cell, content_offset, header, overflow, Error, PageType, RowId};
use super::header::PageHeader;
use crate::pager::{Page, PageNum, PageSource};
use crate::record::RecordView;
use crate::sql_value::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unpositioned,
    BeforeFirst,
    AtRow,
    AfterLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    Found,
    NotFound,
}

/// One level of the descent stack.
struct Level {
    pn: PageNum,
    page: Page,
    hdr: PageHeader,
    /// Leaf: index of the current cell.  Interior: index of the child slot
    /// being explored, `cell_count` meaning the right child.
    slot: usize,
    /// Index-interior only: the current row is this level's entry `slot`.
    on_entry: bool,
}

impl Level {
    fn start(&self) -> usize {
        content_offset(self.pn)
    }

    fn cell_count(&self) -> usize {
        self.hdr.cell_count as usize
    }
}

/// The payload of the current row, either borrowed from the page it lives on
/// or assembled from an overflow chain.
enum PayloadBuf {
    Local { page: Page, range: Range<usize> },
    Assembled(Vec<u8>),
}

struct CurrentRow {
    rowid: Option<RowId>,
    payload: PayloadBuf,
}

impl CurrentRow {
    fn bytes(&self) -> &[u8] {
        match &self.payload {
            PayloadBuf::Local { page, range } => &page[range.clone()],
            PayloadBuf::Assembled(v) => v,
        }
    }
}

pub struct Cursor {
    source: Arc<dyn PageSource>,
    root: PageNum,
    usable: u32,
    /// True for table trees; established from the root page type.
    table_tree: bool,
    state: CursorState,
    stack: Vec<Level>,
    current: Option<CurrentRow>,
    /// Commit-epoch guard; `None` for internal cursors the write engine
    /// drives within a transaction.
    epoch: Option<(Arc<AtomicU64>, u64)>,
}

/// Byte range of `sub` within `page`.  `sub` must be a sub-slice of `page`.
fn span_of(page: &[u8], sub: &[u8]) -> Range<usize> {
    let base = page.as_ptr() as usize;
    let at = sub.as_ptr() as usize - base;
    at..at + sub.len()
}

impl Cursor {
    pub fn new(source: Arc<dyn PageSource>, root: PageNum, usable: u32) -> Result<Cursor, Error> {
        let page = source.page(root)?;
        let hdr = header::parse(&page, content_offset(root), root)?;
        Ok(Cursor {
            source,
            root,
            usable,
            table_tree: hdr.page_type.is_table(),
            state: CursorState::BeforeFirst,
            stack: Vec::new(),
            current: None,
            epoch: None,
        })
    }

    /// Attach a commit-epoch guard; every operation fails with
    /// [`Error::Invalidated`] once the database has committed past `seen`.
    pub fn with_epoch(mut self, counter: Arc<AtomicU64>, seen: u64) -> Cursor {
        self.epoch = Some((counter, seen));
        self
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_table_tree(&self) -> bool {
        self.table_tree
    }

    /// Back to the state a fresh cursor starts in.
    pub fn rewind(&mut self) {
        self.stack.clear();
        self.current = None;
        self.state = CursorState::BeforeFirst;
    }

    fn check_epoch(&self) -> Result<(), Error> {
        if let Some((counter, seen)) = &self.epoch {
            if counter.load(AtomicOrdering::SeqCst) != *seen {
                return Err(Error::Invalidated);
            }
        }
        Ok(())
    }

    /// On any decode failure the cursor position is meaningless; drop it.
    fn poison<T>(&mut self, err: Error) -> Result<T, Error> {
        self.stack.clear();
        self.current = None;
        self.state = CursorState::Unpositioned;
        Err(err)
    }

    // ---- current-row accessors ----

    pub fn rowid(&self) -> Result<RowId, Error> {
        if self.state != CursorState::AtRow {
            return Err(Error::NotOnRow);
        }
        self.current
            .as_ref()
            .and_then(|c| c.rowid)
            .ok_or(Error::WrongTreeKind("table"))
    }

    /// The complete record payload of the current row.
    pub fn payload_bytes(&self) -> Result<&[u8], Error> {
        if self.state != CursorState::AtRow {
            return Err(Error::NotOnRow);
        }
        Ok(self.current.as_ref().ok_or(Error::NotOnRow)?.bytes())
    }

    /// Decode the current row's record.
    pub fn record(&self) -> Result<RecordView<'_>, Error> {
        Ok(RecordView::parse(self.payload_bytes()?)?)
    }

    // ---- page plumbing ----

    fn load_level(&self, pn: PageNum) -> Result<Level, Error> {
        let page = self.source.page(pn)?;
        let hdr = header::parse(&page, content_offset(pn), pn)?;
        if hdr.page_type.is_table() != self.table_tree {
            return Err(Error::corrupt(pn, "page kind does not match its tree"));
        }
        Ok(Level {
            pn,
            page,
            hdr,
            slot: 0,
            on_entry: false,
        })
    }

    fn cell_slice<'l>(&self, level: &'l Level, idx: usize) -> Result<&'l [u8], Error> {
        let off = header::cell_pointer(&level.page, &level.hdr, level.start(), idx, level.pn)?;
        Ok(&level.page[off..])
    }

    /// Child page at `slot` of an interior level.
    fn child(&self, level: &Level, slot: usize) -> Result<PageNum, Error> {
        let n = level.cell_count();
        if slot == n {
            return level
                .hdr
                .right_child
                .filter(|rc| *rc != 0)
                .ok_or_else(|| Error::corrupt(level.pn, "interior page missing right child"));
        }
        let cell = self.cell_slice(level, slot)?;
        let child = if self.table_tree {
            cell::parse_table_interior(cell, level.pn)?.0.left_child
        } else {
            cell::parse_index(cell, self.usable, true, level.pn)?
                .0
                .left_child
                .expect("interior cells carry a left child")
        };
        if child == 0 {
            return Err(Error::corrupt(level.pn, "zero child pointer"));
        }
        Ok(child)
    }

    /// Interior separator rowid at `slot` (table trees).
    fn separator_rowid(&self, level: &Level, slot: usize) -> Result<RowId, Error> {
        let cell = self.cell_slice(level, slot)?;
        Ok(cell::parse_table_interior(cell, level.pn)?.0.rowid)
    }

    /// Materialize the payload of a leaf or interior-index cell.
    fn payload_of(
        &self,
        level: &Level,
        idx: usize,
    ) -> Result<(Option<RowId>, PayloadBuf), Error> {
        let cell_bytes = self.cell_slice(level, idx)?;
        let (rowid, payload_len, local, first_overflow) = match level.hdr.page_type {
            PageType::TableLeaf => {
                let (c, _) = cell::parse_table_leaf(cell_bytes, self.usable, level.pn)?;
                (Some(c.rowid), c.payload_len, c.local_payload, c.first_overflow)
            }
            PageType::IndexLeaf => {
                let (c, _) = cell::parse_index(cell_bytes, self.usable, false, level.pn)?;
                (None, c.payload_len, c.local_payload, c.first_overflow)
            }
            PageType::IndexInterior => {
                let (c, _) = cell::parse_index(cell_bytes, self.usable, true, level.pn)?;
                (None, c.payload_len, c.local_payload, c.first_overflow)
            }
            PageType::TableInterior => {
                return Err(Error::corrupt(level.pn, "table interior cells hold no payload"))
            }
        };
        let payload = if first_overflow.is_some() {
            PayloadBuf::Assembled(overflow::assemble_payload(
                self.source.as_ref(),
                local,
                payload_len,
                first_overflow,
                level.pn,
            )?)
        } else {
            PayloadBuf::Local {
                page: level.page.clone(),
                range: span_of(&level.page, local),
            }
        };
        Ok((rowid, payload))
    }

    fn set_current_from_top(&mut self) -> Result<(), Error> {
        let top = self.stack.last().expect("stack not empty");
        let (rowid, payload) = self.payload_of(top, top.slot)?;
        self.current = Some(CurrentRow { rowid, payload });
        self.state = CursorState::AtRow;
        Ok(())
    }

    /// Decode the key record of an index cell for comparison.
    fn index_key_at(&self, level: &Level, idx: usize) -> Result<Vec<SqlValue>, Error> {
        let (_, payload) = self.payload_of(level, idx)?;
        let bytes = match &payload {
            PayloadBuf::Local { page, range } => &page[range.clone()],
            PayloadBuf::Assembled(v) => v.as_slice(),
        };
        Ok(RecordView::parse(bytes)?.values()?)
    }

    // ---- traversal ----

    /// Push `pn` and descend along the leftmost edge.  Returns true when a
    /// row was reached; false when the subtree is empty.
    fn descend_leftmost(&mut self, mut pn: PageNum) -> Result<bool, Error> {
        loop {
            let level = self.load_level(pn)?;
            if level.hdr.page_type.is_leaf() {
                let has_rows = level.cell_count() > 0;
                self.stack.push(level);
                if has_rows {
                    self.set_current_from_top()?;
                    return Ok(true);
                }
                self.stack.pop();
                return Ok(false);
            }
            let child = self.child(&level, 0)?;
            self.stack.push(level);
            pn = child;
        }
    }

    /// Push `pn` and descend along the rightmost edge to the last row.
    fn descend_rightmost(&mut self, mut pn: PageNum) -> Result<bool, Error> {
        loop {
            let level = self.load_level(pn)?;
            if level.hdr.page_type.is_leaf() {
                let n = level.cell_count();
                self.stack.push(level);
                if n > 0 {
                    self.stack.last_mut().unwrap().slot = n - 1;
                    self.set_current_from_top()?;
                    return Ok(true);
                }
                self.stack.pop();
                return Ok(false);
            }
            let n = level.cell_count();
            let child = self.child(&level, n)?;
            self.stack.push(level);
            self.stack.last_mut().unwrap().slot = n;
            pn = child;
        }
    }

    pub fn seek_first(&mut self) -> Result<bool, Error> {
        self.check_epoch()?;
        self.rewind();
        // An empty leftmost leaf climbs to whatever row follows it.
        match self
            .descend_leftmost(self.root)
            .and_then(|ok| if ok { Ok(true) } else { self.climb_next() })
        {
            Ok(b) => Ok(b),
            Err(e) => self.poison(e),
        }
    }

    pub fn seek_last(&mut self) -> Result<bool, Error> {
        self.check_epoch()?;
        self.rewind();
        match self
            .descend_rightmost(self.root)
            .and_then(|ok| if ok { Ok(true) } else { self.climb_prev() })
        {
            Ok(b) => Ok(b),
            Err(e) => self.poison(e),
        }
    }

    /// Step to the next row in key order.  Returns false once past the end.
    pub fn next(&mut self) -> Result<bool, Error> {
        self.check_epoch()?;
        match self.state {
            CursorState::BeforeFirst => self.seek_first(),
            CursorState::AfterLast => Ok(false),
            CursorState::Unpositioned => Err(Error::NotOnRow),
            CursorState::AtRow => match self.advance() {
                Ok(b) => Ok(b),
                Err(e) => self.poison(e),
            },
        }
    }

    /// Step to the previous row.  Returns false once before the start.
    pub fn prev(&mut self) -> Result<bool, Error> {
        self.check_epoch()?;
        match self.state {
            CursorState::AfterLast => self.seek_last(),
            CursorState::BeforeFirst => Ok(false),
            CursorState::Unpositioned => Err(Error::NotOnRow),
            CursorState::AtRow => match self.retreat() {
                Ok(b) => Ok(b),
                Err(e) => self.poison(e),
            },
        }
    }

    fn advance(&mut self) -> Result<bool, Error> {
        // First move off the current row.
        if let Some(top) = self.stack.last_mut() {
            if top.hdr.page_type.is_leaf() {
                top.slot += 1;
                if top.slot < top.cell_count() {
                    self.set_current_from_top()?;
                    return Ok(true);
                }
                self.stack.pop();
            } else if top.on_entry {
                // The current row is an interior index entry; continue into
                // the subtree to its right.
                top.on_entry = false;
                top.slot += 1;
                let slot = top.slot;
                let child = self.child(self.stack.last().unwrap(), slot)?;
                if self.descend_leftmost(child)? {
                    return Ok(true);
                }
                // An empty subtree (underflow is tolerated) just climbs.
            }
        }
        self.climb_next()
    }

    /// Climb until some ancestor has a next row, having just come up from
    /// the child at each level's `slot`.
    fn climb_next(&mut self) -> Result<bool, Error> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                self.current = None;
                self.state = CursorState::AfterLast;
                return Ok(false);
            };
            let n = top.cell_count();
            if self.table_tree {
                if top.slot < n {
                    top.slot += 1;
                    let slot = top.slot;
                    let child = self.child(self.stack.last().unwrap(), slot)?;
                    if self.descend_leftmost(child)? {
                        return Ok(true);
                    }
                    continue;
                }
                self.stack.pop();
            } else {
                // Index tree: coming back up from child `slot`, the entry at
                // `slot` is the next row in order.
                if top.slot < n {
                    top.on_entry = true;
                    self.set_current_from_top()?;
                    return Ok(true);
                }
                self.stack.pop();
            }
        }
    }

    fn retreat(&mut self) -> Result<bool, Error> {
        if let Some(top) = self.stack.last_mut() {
            if top.hdr.page_type.is_leaf() {
                if top.slot > 0 {
                    top.slot -= 1;
                    self.set_current_from_top()?;
                    return Ok(true);
                }
                self.stack.pop();
            } else if top.on_entry {
                // Previous row is the maximum of the child left of the entry.
                top.on_entry = false;
                let slot = top.slot;
                let child = self.child(self.stack.last().unwrap(), slot)?;
                if self.descend_rightmost(child)? {
                    return Ok(true);
                }
            }
        }
        self.climb_prev()
    }

    /// Mirror of [`Self::climb_next`] for backwards iteration.
    fn climb_prev(&mut self) -> Result<bool, Error> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                self.current = None;
                self.state = CursorState::BeforeFirst;
                return Ok(false);
            };
            if self.table_tree {
                if top.slot > 0 {
                    top.slot -= 1;
                    let slot = top.slot;
                    let child = self.child(self.stack.last().unwrap(), slot)?;
                    if self.descend_rightmost(child)? {
                        return Ok(true);
                    }
                    continue;
                }
                self.stack.pop();
            } else {
                // Coming back up from child `slot`; the entry left of it is
                // the previous row.
                if top.slot > 0 {
                    top.slot -= 1;
                    top.on_entry = true;
                    self.set_current_from_top()?;
                    return Ok(true);
                }
                self.stack.pop();
            }
        }
    }

    // ---- seeks ----

    /// Position on the row with rowid `r` in a table tree.
    ///
    /// On `NotFound` the cursor lands on the first row with a greater rowid
    /// (or `AfterLast` when none exists), which is what range scans resume
    /// from.
    pub fn seek_rowid(&mut self, r: RowId) -> Result<SeekResult, Error> {
        self.check_epoch()?;
        if !self.table_tree {
            return Err(Error::WrongTreeKind("table"));
        }
        self.rewind();
        match self.seek_rowid_inner(r) {
            Ok(res) => Ok(res),
            Err(e) => self.poison(e),
        }
    }

    fn seek_rowid_inner(&mut self, r: RowId) -> Result<SeekResult, Error> {
        let mut pn = self.root;
        loop {
            let level = self.load_level(pn)?;
            let n = level.cell_count();
            if level.hdr.page_type.is_leaf() {
                // Lower bound: first cell with rowid >= r.
                let mut lo = 0usize;
                let mut hi = n;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let cell = self.cell_slice(&level, mid)?;
                    let (c, _) = cell::parse_table_leaf(cell, self.usable, level.pn)?;
                    if c.rowid < r {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                self.stack.push(level);
                let top = self.stack.last_mut().unwrap();
                if lo < n {
                    top.slot = lo;
                    self.set_current_from_top()?;
                    let found = self.current.as_ref().and_then(|c| c.rowid) == Some(r);
                    return Ok(if found { SeekResult::Found } else { SeekResult::NotFound });
                }
                if n == 0 {
                    // Deletions can leave an empty leaf; the successor (if
                    // any) lives up the stack.
                    self.stack.pop();
                    self.climb_next()?;
                    return Ok(SeekResult::NotFound);
                }
                // All rowids here are smaller; stand on the last cell and
                // advance once to land on the first greater row.
                top.slot = n - 1;
                self.set_current_from_top()?;
                self.advance()?;
                return Ok(SeekResult::NotFound);
            }
            // Interior: first separator >= r bounds the left subtree that can
            // contain r (left subtree keys are <= the separator).
            let mut lo = 0usize;
            let mut hi = n;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if self.separator_rowid(&level, mid)? < r {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let child = self.child(&level, lo)?;
            self.stack.push(level);
            self.stack.last_mut().unwrap().slot = lo;
            pn = child;
        }
    }

    /// Position on the index entry with key `key`, comparing record-wise.
    ///
    /// On `NotFound` the cursor lands on the first entry with a greater key,
    /// matching the table-seek convention.
    pub fn seek_key(&mut self, key: &[SqlValue]) -> Result<SeekResult, Error> {
        self.check_epoch()?;
        if self.table_tree {
            return Err(Error::WrongTreeKind("index"));
        }
        self.rewind();
        match self.seek_key_inner(key) {
            Ok(res) => Ok(res),
            Err(e) => self.poison(e),
        }
    }

    fn seek_key_inner(&mut self, key: &[SqlValue]) -> Result<SeekResult, Error> {
        let mut pn = self.root;
        loop {
            let level = self.load_level(pn)?;
            let n = level.cell_count();
            // Lower bound by record collation.
            let mut lo = 0usize;
            let mut hi = n;
            let mut exact = None;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let probe = self.index_key_at(&level, mid)?;
                match SqlValue::collate_keys(&probe, key) {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Equal => {
                        exact = Some(mid);
                        hi = mid;
                    }
                    Ordering::Greater => hi = mid,
                }
            }
            if level.hdr.page_type.is_leaf() {
                self.stack.push(level);
                let top = self.stack.last_mut().unwrap();
                if lo < n {
                    top.slot = lo;
                    self.set_current_from_top()?;
                    return Ok(if exact == Some(lo) {
                        SeekResult::Found
                    } else {
                        SeekResult::NotFound
                    });
                }
                if n == 0 {
                    self.stack.pop();
                    self.climb_next()?;
                    return Ok(SeekResult::NotFound);
                }
                top.slot = n - 1;
                self.set_current_from_top()?;
                self.advance()?;
                return Ok(SeekResult::NotFound);
            }
            if exact == Some(lo) {
                // The separator itself is the match; interior entries are
                // real rows in index trees.
                self.stack.push(level);
                let top = self.stack.last_mut().unwrap();
                top.slot = lo;
                top.on_entry = true;
                self.set_current_from_top()?;
                return Ok(SeekResult::Found);
            }
            let child = self.child(&level, lo)?;
            self.stack.push(level);
            self.stack.last_mut().unwrap().slot = lo;
            pn = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::mutate::tests_support;

    // Cursor behavior over real multi-page trees is exercised through the
    // write engine's builders in mutate::tests and tests/integration_test.rs.
    // Here: the empty-tree edge cases on a hand-built root.

    #[test]
    fn test_empty_table_scan() {
        let (source, root, usable) = tests_support::empty_table(512);
        let mut cur = Cursor::new(source, root, usable).unwrap();
        assert!(!cur.seek_first().unwrap());
        assert_eq!(cur.state(), CursorState::AfterLast);
        assert!(!cur.next().unwrap());
        assert!(matches!(cur.record(), Err(Error::NotOnRow)));
    }

    #[test]
    fn test_empty_table_seek() {
        let (source, root, usable) = tests_support::empty_table(512);
        let mut cur = Cursor::new(source, root, usable).unwrap();
        assert_eq!(cur.seek_rowid(1).unwrap(), SeekResult::NotFound);
        assert_eq!(cur.state(), CursorState::AfterLast);
    }

    #[test]
    fn test_index_seek_on_table_tree_is_refused() {
        let (source, root, usable) = tests_support::empty_table(512);
        let mut cur = Cursor::new(source, root, usable).unwrap();
        assert!(matches!(
            cur.seek_key(&[SqlValue::Int(1)]),
            Err(Error::WrongTreeKind("index"))
        ));
    }
}
