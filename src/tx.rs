//! tx is the write engine: one serializable transaction over a database,
//! journaled for crash safety.
//!
//! All mutations accumulate in an in-memory dirty-page map; the database
//! file is untouched until commit.  The first touch of any pre-existing page
//! appends its pre-image to the rollback journal, so commit's write-back is
//! recoverable at any interruption point, and rollback is simply dropping
//! the dirty map.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::btree::{cell, mutate, overflow, Error as BtreeError, PageType, RowId};
use crate::database::Database;
use crate::dbheader::{self, DbHeader};
use crate::freelist;
use crate::journal::{self, Journal};
use crate::pager::{Page, PageNum, PageSink, PageSource};
use crate::record::{self, RecordView};
use crate::schema::{self, IndexInfo, Schema, TableInfo};
use crate::sql_value::SqlValue;

/// Records bigger than this are rejected outright rather than spilled into
/// an absurd overflow chain (matches SQLITE_MAX_LENGTH's default).
const MAX_RECORD_LEN: usize = 1_000_000_000;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Another write transaction is already open on this database.")]
    TxAlreadyOpen,
    #[error("Transaction is no longer active (committed, rolled back, or failed).")]
    NoActiveTx,
    #[error("Database is open read-only.")]
    ReadOnly,
    #[error("A row with rowid {0} already exists.")]
    DuplicateRowid(RowId),
    #[error("No row with rowid {0}.")]
    RowNotFound(RowId),
    #[error("Rowids are exhausted (the table reached i64::MAX).")]
    RowidOverflow,
    #[error("Record of {size} bytes exceeds the maximum record size.")]
    RecordTooLarge { size: usize },
    #[error("Column {column} of table {table} is NOT NULL.")]
    NotNullViolation { table: String, column: String },
    #[error("Value for column {column} of table {table} has the wrong type.")]
    DatatypeMismatch { table: String, column: String },
    #[error("Table {0} exists but cannot be written (WITHOUT ROWID tables are read-only here).")]
    TableNotWritable(String),
    #[error("Expected {expected} values for this table, got {got}.")]
    WrongValueCount { expected: usize, got: usize },
    #[error("Object {0} already exists in the schema.")]
    AlreadyExists(String),
    #[error("Disk is full.")]
    DiskFull,
    #[error("Recovery of a hot journal failed: {0}")]
    RecoveryFailed(String),
    #[error("Statement is not supported: {0}")]
    UnsupportedStatement(String),
    #[error(transparent)]
    Io(std::io::Error),
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error(transparent)]
    Btree(#[from] BtreeError),
    #[error(transparent)]
    Record(#[from] record::Error),
    #[error(transparent)]
    Schema(#[from] schema::Error),
    #[error(transparent)]
    Journal(#[from] journal::Error),
    #[error(transparent)]
    Freelist(#[from] freelist::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        // ENOSPC deserves its own face; everything else stays an I/O error.
        if e.raw_os_error() == Some(28) {
            Error::DiskFull
        } else {
            Error::Io(e)
        }
    }
}

/// Autocommit façade: each call runs in its own transaction and rolls back
/// on failure.
pub struct Writer<'db> {
    db: &'db mut Database,
}

impl<'db> Writer<'db> {
    pub(crate) fn new(db: &'db mut Database) -> Writer<'db> {
        Writer { db }
    }

    pub fn insert(&mut self, table: &str, values: &[SqlValue]) -> Result<RowId, Error> {
        let mut tx = Transaction::begin(self.db)?;
        match tx.insert(table, values) {
            Ok(rowid) => {
                tx.commit()?;
                Ok(rowid)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    pub fn update(&mut self, table: &str, rowid: RowId, values: &[SqlValue]) -> Result<(), Error> {
        let mut tx = Transaction::begin(self.db)?;
        match tx.update(table, rowid, values) {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    pub fn delete(&mut self, table: &str, rowid: RowId) -> Result<bool, Error> {
        let mut tx = Transaction::begin(self.db)?;
        match tx.delete(table, rowid) {
            Ok(found) => {
                tx.commit()?;
                Ok(found)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    pub fn execute_ddl(&mut self, sql: &str) -> Result<(), Error> {
        let mut tx = Transaction::begin(self.db)?;
        match tx.execute_ddl(sql) {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// An explicit multi-statement transaction.
    pub fn transaction(&mut self) -> Result<Transaction<'_>, Error> {
        Transaction::begin(self.db)
    }
}

/// One interior step of a descent: the page and the child slot taken.
#[derive(Debug, Clone, Copy)]
struct PathStep {
    pn: PageNum,
    slot: usize,
}

/// What a split pushes into the parent.
enum Promoted {
    /// Table trees promote the high rowid of the left half.
    TableKey(RowId),
    /// Index leaves move their divider cell up.
    IndexCell(Vec<u8>),
    /// Interior splits move their middle cell up.
    Mid(Vec<u8>),
}

impl Promoted {
    fn into_parent_cell(self, left_child: PageNum) -> Vec<u8> {
        match self {
            Promoted::TableKey(rowid) => cell::build_table_interior(left_child, rowid),
            Promoted::IndexCell(c) => mutate::index_leaf_to_interior(&c, left_child),
            Promoted::Mid(c) => mutate::with_left_child(&c, left_child),
        }
    }
}

/// Read-through view of the transaction: dirty pages shadow the base image.
struct TxView<'a> {
    dirty: &'a BTreeMap<PageNum, Vec<u8>>,
    base: &'a dyn PageSource,
    page_count: u32,
}

impl PageSource for TxView<'_> {
    fn page_size(&self) -> u32 {
        self.base.page_size()
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page(&self, pn: PageNum) -> Result<Page, crate::pager::Error> {
        if let Some(d) = self.dirty.get(&pn) {
            return Ok(Arc::from(d.as_slice()));
        }
        self.base.page(pn)
    }
}

pub struct Transaction<'db> {
    db: &'db mut Database,
    dirty: BTreeMap<PageNum, Vec<u8>>,
    journal: Option<Journal>,
    journaled: HashSet<PageNum>,
    /// Working header; committed into page 1 at the end.
    header: DbHeader,
    /// Working schema; DDL in this transaction is visible to later
    /// statements of the same transaction.
    schema: Schema,
    initial_page_count: u32,
    schema_changed: bool,
    finished: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db mut Database) -> Result<Transaction<'db>, Error> {
        if !db.writable {
            return Err(Error::ReadOnly);
        }
        let sink = db.sink.clone().ok_or(Error::ReadOnly)?;
        sink.lock_exclusive()?;
        // A journal surviving under the lock is another process's crashed
        // commit; fold it back before building on the file.  Replaying
        // through the sink keeps encrypted databases sealed.
        if let Some(path) = db.path.clone() {
            match journal::recover_with_sink(&path, sink.as_ref()) {
                Ok(journal::Recovery::Clean) => {}
                Ok(_) => db.reload_after_external_change()?,
                Err(e) => {
                    let _ = sink.unlock();
                    return Err(Error::RecoveryFailed(e.to_string()));
                }
            }
        }
        let mut header = db.header.clone();
        if header.page_count == 0 {
            header.page_count = sink.page_count();
        }
        let initial_page_count = header.page_count;
        Ok(Transaction {
            schema: db.schema.clone(),
            db,
            dirty: BTreeMap::new(),
            journal: None,
            journaled: HashSet::new(),
            header,
            initial_page_count,
            schema_changed: false,
            finished: false,
        })
    }

    fn sink(&self) -> Arc<dyn PageSink> {
        self.db.sink.clone().expect("writable database has a sink")
    }

    fn page_size(&self) -> u32 {
        self.header.page_size
    }

    fn usable(&self) -> u32 {
        self.header.usable_size()
    }

    fn view(&self) -> TxView<'_> {
        TxView {
            dirty: &self.dirty,
            base: self.db.sink_source(),
            page_count: self.header.page_count,
        }
    }

    /// Owned copy of a page as this transaction sees it.
    fn page(&self, pn: PageNum) -> Result<Vec<u8>, Error> {
        if let Some(d) = self.dirty.get(&pn) {
            return Ok(d.clone());
        }
        Ok(self.sink().page(pn)?.to_vec())
    }

    /// Stage a page image, journaling the pre-image on first touch.
    fn put_page(&mut self, pn: PageNum, image: Vec<u8>) -> Result<(), Error> {
        debug_assert_eq!(image.len(), self.page_size() as usize);
        if pn <= self.initial_page_count && !self.journaled.contains(&pn) {
            if let Some(path) = self.db.path.clone() {
                if self.journal.is_none() {
                    let journal =
                        Journal::create(&path, self.page_size(), self.initial_page_count).map_err(
                            |e| match e {
                                // A journal appearing under our exclusive
                                // lock means another writer is mid-commit.
                                journal::Error::Io(ref io)
                                    if io.kind() == std::io::ErrorKind::AlreadyExists =>
                                {
                                    Error::TxAlreadyOpen
                                }
                                other => Error::Journal(other),
                            },
                        )?;
                    self.journal = Some(journal);
                }
                let pre = self.sink().page(pn)?;
                self.journal
                    .as_mut()
                    .expect("just created")
                    .log_page(pn, &pre)?;
            }
            self.journaled.insert(pn);
        }
        self.dirty.insert(pn, image);
        Ok(())
    }

    /// Stage a rebuilt btree page, re-laying the file header on page 1.
    fn put_btree_page(&mut self, pn: PageNum, mut image: Vec<u8>) -> Result<(), Error> {
        if pn == 1 {
            dbheader::write(&mut image, &self.header);
        }
        self.put_page(pn, image)
    }

    // ---- allocator ----

    /// Take a page from the freelist, or grow the file by one page.
    fn allocate(&mut self) -> Result<PageNum, Error> {
        let ps = self.page_size();
        if self.header.freelist_head != 0 {
            let trunk_pn = self.header.freelist_head;
            let trunk_img = self.page(trunk_pn)?;
            let trunk = freelist::parse_trunk(&trunk_img, trunk_pn)?;
            if let Some(&leaf) = trunk.leaves.last() {
                let mut leaves = trunk.leaves;
                leaves.pop();
                self.put_page(trunk_pn, freelist::build_trunk(trunk.next_trunk, &leaves, ps))?;
                self.header.freelist_count -= 1;
                self.put_page(leaf, vec![0u8; ps as usize])?;
                debug!("allocated page {} from freelist", leaf);
                return Ok(leaf);
            }
            // Empty trunk: hand out the trunk page itself.
            self.header.freelist_head = trunk.next_trunk;
            self.header.freelist_count = self.header.freelist_count.saturating_sub(1);
            self.put_page(trunk_pn, vec![0u8; ps as usize])?;
            debug!("allocated trunk page {} from freelist", trunk_pn);
            return Ok(trunk_pn);
        }
        let pn = self.header.page_count + 1;
        self.header.page_count = pn;
        // A brand-new page has no pre-image; recovery truncates it away.
        self.dirty.insert(pn, vec![0u8; ps as usize]);
        debug!("grew file to page {}", pn);
        Ok(pn)
    }

    /// Return a page to the freelist.
    fn free_page(&mut self, pn: PageNum) -> Result<(), Error> {
        let ps = self.page_size();
        if self.header.freelist_head == 0 {
            self.put_page(pn, freelist::build_trunk(0, &[], ps))?;
            self.header.freelist_head = pn;
        } else {
            let head = self.header.freelist_head;
            let trunk_img = self.page(head)?;
            let trunk = freelist::parse_trunk(&trunk_img, head)?;
            if trunk.leaves.len() < freelist::max_leaves(ps) {
                let mut leaves = trunk.leaves;
                leaves.push(pn);
                self.put_page(head, freelist::build_trunk(trunk.next_trunk, &leaves, ps))?;
            } else {
                self.put_page(pn, freelist::build_trunk(head, &[], ps))?;
                self.header.freelist_head = pn;
            }
        }
        self.header.freelist_count += 1;
        Ok(())
    }

    // ---- payload spill ----

    /// Split a record payload into its local part and an allocated overflow
    /// chain for the rest.
    fn spill_payload(
        &mut self,
        payload: &[u8],
        table_leaf: bool,
    ) -> Result<(usize, Option<PageNum>), Error> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(Error::RecordTooLarge {
                size: payload.len(),
            });
        }
        let usable = self.usable();
        let local = cell::local_payload_len(payload.len(), usable, table_leaf);
        if local == payload.len() {
            return Ok((local, None));
        }
        let chunks = overflow::chunk_payload(&payload[local..], usable);
        let mut pages = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            pages.push(self.allocate()?);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(0);
            self.put_page(pages[i], overflow::build_page(next, chunk, self.page_size()))?;
        }
        Ok((local, Some(pages[0])))
    }

    /// Free every page of an overflow chain.
    fn free_overflow_chain(&mut self, first: PageNum) -> Result<(), Error> {
        let pages = overflow::chain_pages(&self.view(), first, first)?;
        for pn in pages {
            self.free_page(pn)?;
        }
        Ok(())
    }

    // ---- balancing ----

    /// Write `cells` to page `pn`, splitting up the path as needed.
    fn place_cells(
        &mut self,
        pn: PageNum,
        path: &[PathStep],
        ptype: PageType,
        right_child: Option<PageNum>,
        cells: Vec<Vec<u8>>,
    ) -> Result<(), Error> {
        let ps = self.page_size();
        if mutate::fits(ps, pn, ptype, &cells) {
            let image = mutate::build_page(ps, pn, ptype, right_child, &cells)?;
            return self.put_btree_page(pn, image);
        }
        if cells.len() < 2 {
            // A single cell that cannot fit an empty page cannot be stored.
            return Err(Error::RecordTooLarge {
                size: cells.first().map(|c| c.len()).unwrap_or(0),
            });
        }
        debug!("splitting page {} ({} cells)", pn, cells.len());

        let (left_cells, right_cells, promoted, left_rc, right_rc) = match ptype {
            PageType::TableLeaf => {
                let (l, r) = mutate::split_cells(cells);
                let sep = mutate::table_leaf_rowid(l.last().expect("left half non-empty"), self.usable(), pn)?;
                (l, r, Promoted::TableKey(sep), None, None)
            }
            PageType::IndexLeaf => {
                let (mut l, r) = mutate::split_cells(cells);
                let divider = l.pop().expect("left half non-empty");
                (l, r, Promoted::IndexCell(divider), None, None)
            }
            PageType::TableInterior | PageType::IndexInterior => {
                let (mut l, r) = mutate::split_cells(cells);
                let mid = l.pop().expect("left half non-empty");
                let left_rc = Some(mutate::interior_left_child(&mid));
                (l, r, Promoted::Mid(mid), left_rc, right_child)
            }
        };

        let new_right = self.allocate()?;
        match path.split_last() {
            Some((step, ancestors)) => {
                // Left half stays on `pn`; the sibling takes the upper keys.
                let left_img = mutate::build_page(ps, pn, ptype, left_rc, &left_cells)?;
                self.put_btree_page(pn, left_img)?;
                let right_img = mutate::build_page(ps, new_right, ptype, right_rc, &right_cells)?;
                self.put_btree_page(new_right, right_img)?;

                let parent_img = self.page(step.pn)?;
                let (phdr, mut pcells) = mutate::read_cells(&parent_img, step.pn, self.usable())?;
                let mut p_rc = phdr.right_child;
                // The slot that used to reach `pn` now owns only the upper
                // half; point it at the new sibling.
                if step.slot < pcells.len() {
                    pcells[step.slot] = mutate::with_left_child(&pcells[step.slot], new_right);
                } else {
                    p_rc = Some(new_right);
                }
                pcells.insert(step.slot, promoted.into_parent_cell(pn));
                self.place_cells(step.pn, ancestors, phdr.page_type, p_rc, pcells)
            }
            None => {
                // Root split: the root page number is pinned (the schema
                // records it), so both halves move to fresh pages and the
                // root becomes a two-child interior page.
                let new_left = self.allocate()?;
                let left_img = mutate::build_page(ps, new_left, ptype, left_rc, &left_cells)?;
                self.put_btree_page(new_left, left_img)?;
                let right_img = mutate::build_page(ps, new_right, ptype, right_rc, &right_cells)?;
                self.put_btree_page(new_right, right_img)?;

                let root_type = if ptype.is_table() {
                    PageType::TableInterior
                } else {
                    PageType::IndexInterior
                };
                let root_cells = vec![promoted.into_parent_cell(new_left)];
                debug!("root {} split into {} and {}", pn, new_left, new_right);
                self.place_cells(pn, &[], root_type, Some(new_right), root_cells)
            }
        }
    }

    // ---- table btree ----

    fn descend_table(&self, root: PageNum, rowid: RowId) -> Result<(Vec<PathStep>, PageNum), Error> {
        let mut path = Vec::new();
        let mut pn = root;
        loop {
            let img = self.page(pn)?;
            let (hdr, cells) = mutate::read_cells(&img, pn, self.usable())?;
            match hdr.page_type {
                PageType::TableLeaf => return Ok((path, pn)),
                PageType::TableInterior => {
                    let mut lo = 0usize;
                    let mut hi = cells.len();
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        if mutate::table_interior_rowid(&cells[mid], pn)? < rowid {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    let child = if lo < cells.len() {
                        mutate::interior_left_child(&cells[lo])
                    } else {
                        hdr.right_child.ok_or_else(|| {
                            BtreeError::corrupt(pn, "interior page missing right child")
                        })?
                    };
                    path.push(PathStep { pn, slot: lo });
                    pn = child;
                }
                _ => {
                    return Err(BtreeError::corrupt(pn, "index page inside a table btree").into())
                }
            }
        }
    }

    fn insert_table_row(
        &mut self,
        root: PageNum,
        rowid: RowId,
        payload: &[u8],
    ) -> Result<(), Error> {
        let (local, first_overflow) = self.spill_payload(payload, true)?;
        let new_cell = cell::build_table_leaf(rowid, payload.len(), &payload[..local], first_overflow);

        let (path, leaf_pn) = self.descend_table(root, rowid)?;
        let leaf_img = self.page(leaf_pn)?;
        let (hdr, mut cells) = mutate::read_cells(&leaf_img, leaf_pn, self.usable())?;
        debug_assert_eq!(hdr.page_type, PageType::TableLeaf);

        let mut lo = 0usize;
        let mut hi = cells.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if mutate::table_leaf_rowid(&cells[mid], self.usable(), leaf_pn)? < rowid {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < cells.len()
            && mutate::table_leaf_rowid(&cells[lo], self.usable(), leaf_pn)? == rowid
        {
            return Err(Error::DuplicateRowid(rowid));
        }
        cells.insert(lo, new_cell);
        self.place_cells(leaf_pn, &path, PageType::TableLeaf, None, cells)
    }

    /// Remove the row; true when it existed.
    fn delete_table_row(&mut self, root: PageNum, rowid: RowId) -> Result<bool, Error> {
        let (_path, leaf_pn) = self.descend_table(root, rowid)?;
        let leaf_img = self.page(leaf_pn)?;
        let (_hdr, mut cells) = mutate::read_cells(&leaf_img, leaf_pn, self.usable())?;
        let idx = cells
            .iter()
            .position(|c| {
                mutate::table_leaf_rowid(c, self.usable(), leaf_pn)
                    .map(|r| r == rowid)
                    .unwrap_or(false)
            });
        let Some(idx) = idx else {
            return Ok(false);
        };
        let (parsed, _) = cell::parse_table_leaf(&cells[idx], self.usable(), leaf_pn)?;
        let ovf = parsed.first_overflow;
        cells.remove(idx);
        // Shrinking always fits; underflow is tolerated.
        let image = mutate::build_page(self.page_size(), leaf_pn, PageType::TableLeaf, None, &cells)?;
        self.put_btree_page(leaf_pn, image)?;
        if let Some(first) = ovf {
            self.free_overflow_chain(first)?;
        }
        Ok(true)
    }

    /// Fetch a row's full payload as this transaction sees it.
    fn read_table_row(&self, root: PageNum, rowid: RowId) -> Result<Option<Vec<u8>>, Error> {
        let (_path, leaf_pn) = self.descend_table(root, rowid)?;
        let img = self.page(leaf_pn)?;
        let (_hdr, cells) = mutate::read_cells(&img, leaf_pn, self.usable())?;
        for c in &cells {
            let (parsed, _) = cell::parse_table_leaf(c, self.usable(), leaf_pn)?;
            if parsed.rowid == rowid {
                let payload = overflow::assemble_payload(
                    &self.view(),
                    parsed.local_payload,
                    parsed.payload_len,
                    parsed.first_overflow,
                    leaf_pn,
                )?;
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }

    fn subtree_max_rowid(&self, pn: PageNum) -> Result<Option<RowId>, Error> {
        let img = self.page(pn)?;
        let (hdr, cells) = mutate::read_cells(&img, pn, self.usable())?;
        match hdr.page_type {
            PageType::TableLeaf => Ok(match cells.last() {
                Some(c) => Some(mutate::table_leaf_rowid(c, self.usable(), pn)?),
                None => None,
            }),
            PageType::TableInterior => {
                // Rightmost subtree first; deleted rows can leave empty
                // leaves on the right edge, so fall back leftward.
                if let Some(rc) = hdr.right_child {
                    if let Some(m) = self.subtree_max_rowid(rc)? {
                        return Ok(Some(m));
                    }
                }
                for c in cells.iter().rev() {
                    let child = mutate::interior_left_child(c);
                    if let Some(m) = self.subtree_max_rowid(child)? {
                        return Ok(Some(m));
                    }
                }
                Ok(None)
            }
            _ => Err(BtreeError::corrupt(pn, "index page inside a table btree").into()),
        }
    }

    /// In-order scan of a table btree: (rowid, payload) pairs.
    fn scan_table(&self, pn: PageNum, out: &mut Vec<(RowId, Vec<u8>)>) -> Result<(), Error> {
        let img = self.page(pn)?;
        let (hdr, cells) = mutate::read_cells(&img, pn, self.usable())?;
        match hdr.page_type {
            PageType::TableLeaf => {
                for c in &cells {
                    let (parsed, _) = cell::parse_table_leaf(c, self.usable(), pn)?;
                    let payload = overflow::assemble_payload(
                        &self.view(),
                        parsed.local_payload,
                        parsed.payload_len,
                        parsed.first_overflow,
                        pn,
                    )?;
                    out.push((parsed.rowid, payload));
                }
                Ok(())
            }
            PageType::TableInterior => {
                for c in &cells {
                    self.scan_table(mutate::interior_left_child(c), out)?;
                }
                if let Some(rc) = hdr.right_child {
                    self.scan_table(rc, out)?;
                }
                Ok(())
            }
            _ => Err(BtreeError::corrupt(pn, "index page inside a table btree").into()),
        }
    }

    // ---- index btree ----

    fn index_cell_key(
        &self,
        cell_bytes: &[u8],
        interior: bool,
        pn: PageNum,
    ) -> Result<Vec<SqlValue>, Error> {
        let (c, _) = cell::parse_index(cell_bytes, self.usable(), interior, pn)?;
        let payload = overflow::assemble_payload(
            &self.view(),
            c.local_payload,
            c.payload_len,
            c.first_overflow,
            pn,
        )?;
        Ok(RecordView::parse(&payload)?.values()?)
    }

    fn insert_index_entry(&mut self, root: PageNum, payload: &[u8]) -> Result<(), Error> {
        let key = RecordView::parse(payload)?.values()?;
        let (local, first_overflow) = self.spill_payload(payload, false)?;
        let new_cell = cell::build_index(None, payload.len(), &payload[..local], first_overflow);

        // Descend to the leaf this key sorts into.
        let mut path = Vec::new();
        let mut pn = root;
        let (leaf_pn, mut cells) = loop {
            let img = self.page(pn)?;
            let (hdr, cells) = mutate::read_cells(&img, pn, self.usable())?;
            if hdr.page_type == PageType::IndexLeaf {
                break (pn, cells);
            }
            if hdr.page_type != PageType::IndexInterior {
                return Err(BtreeError::corrupt(pn, "table page inside an index btree").into());
            }
            let mut lo = 0usize;
            let mut hi = cells.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                let probe = self.index_cell_key(&cells[mid], true, pn)?;
                if SqlValue::collate_keys(&probe, &key) == std::cmp::Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let child = if lo < cells.len() {
                mutate::interior_left_child(&cells[lo])
            } else {
                hdr.right_child
                    .ok_or_else(|| BtreeError::corrupt(pn, "interior page missing right child"))?
            };
            path.push(PathStep { pn, slot: lo });
            pn = child;
        };

        let mut lo = 0usize;
        let mut hi = cells.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let probe = self.index_cell_key(&cells[mid], false, leaf_pn)?;
            if SqlValue::collate_keys(&probe, &key) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        cells.insert(lo, new_cell);
        self.place_cells(leaf_pn, &path, PageType::IndexLeaf, None, cells)
    }

    /// Delete the entry with exactly `key`.  Entries can live in interior
    /// pages; those are replaced by their in-order predecessor so the tree
    /// keeps its shape.
    fn delete_index_entry(&mut self, root: PageNum, key: &[SqlValue]) -> Result<bool, Error> {
        let mut path: Vec<PathStep> = Vec::new();
        let mut pn = root;
        loop {
            let img = self.page(pn)?;
            let (hdr, mut cells) = mutate::read_cells(&img, pn, self.usable())?;
            let interior = hdr.page_type == PageType::IndexInterior;
            let mut lo = 0usize;
            let mut hi = cells.len();
            let mut exact = false;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let probe = self.index_cell_key(&cells[mid], interior, pn)?;
                match SqlValue::collate_keys(&probe, key) {
                    std::cmp::Ordering::Less => lo = mid + 1,
                    std::cmp::Ordering::Equal => {
                        exact = true;
                        hi = mid;
                    }
                    std::cmp::Ordering::Greater => hi = mid,
                }
            }
            if !interior {
                if !(exact && lo < cells.len()) {
                    return Ok(false);
                }
                let (parsed, _) = cell::parse_index(&cells[lo], self.usable(), false, pn)?;
                let ovf = parsed.first_overflow;
                cells.remove(lo);
                let image =
                    mutate::build_page(self.page_size(), pn, PageType::IndexLeaf, None, &cells)?;
                self.put_btree_page(pn, image)?;
                if let Some(first) = ovf {
                    self.free_overflow_chain(first)?;
                }
                return Ok(true);
            }
            if exact {
                // Replace the interior entry with the predecessor leaf cell.
                let old_cell = cells[lo].clone();
                let (parsed, _) = cell::parse_index(&old_cell, self.usable(), true, pn)?;
                let left_child = parsed.left_child.expect("interior cell has a left child");
                let ovf = parsed.first_overflow;

                let pred = self.take_max_entry(left_child)?.ok_or_else(|| {
                    BtreeError::corrupt(pn, "interior index entry with an empty left subtree")
                })?;
                cells[lo] = mutate::index_leaf_to_interior(&pred, left_child);
                let rc = hdr.right_child;
                self.place_cells(pn, &path, PageType::IndexInterior, rc, cells)?;
                if let Some(first) = ovf {
                    self.free_overflow_chain(first)?;
                }
                return Ok(true);
            }
            let child = if lo < cells.len() {
                mutate::interior_left_child(&cells[lo])
            } else {
                hdr.right_child
                    .ok_or_else(|| BtreeError::corrupt(pn, "interior page missing right child"))?
            };
            path.push(PathStep { pn, slot: lo });
            pn = child;
        }
    }

    /// Detach and return the maximum entry of the subtree under `pn`, as a
    /// leaf-shaped cell.  Usually that is the last cell of the rightmost
    /// leaf; when deletions have emptied that leaf, the maximum is the
    /// nearest interior entry, whose removal re-hangs its left subtree as
    /// the new right child.
    fn take_max_entry(&mut self, pn: PageNum) -> Result<Option<Vec<u8>>, Error> {
        let img = self.page(pn)?;
        let (hdr, mut cells) = mutate::read_cells(&img, pn, self.usable())?;
        match hdr.page_type {
            PageType::IndexLeaf => {
                let Some(last) = cells.pop() else {
                    return Ok(None);
                };
                let image =
                    mutate::build_page(self.page_size(), pn, PageType::IndexLeaf, None, &cells)?;
                self.put_btree_page(pn, image)?;
                Ok(Some(last))
            }
            PageType::IndexInterior => {
                let rc = hdr
                    .right_child
                    .ok_or_else(|| BtreeError::corrupt(pn, "interior page missing right child"))?;
                if let Some(cell) = self.take_max_entry(rc)? {
                    return Ok(Some(cell));
                }
                // The right subtree is drained; this node's own last entry
                // is the maximum.  Its left child becomes the right child.
                let Some(last) = cells.pop() else {
                    return Ok(None);
                };
                let new_rc = mutate::interior_left_child(&last);
                let image = mutate::build_page(
                    self.page_size(),
                    pn,
                    PageType::IndexInterior,
                    Some(new_rc),
                    &cells,
                )?;
                self.put_btree_page(pn, image)?;
                self.free_page(rc)?;
                Ok(Some(mutate::index_interior_to_leaf(&last)))
            }
            _ => Err(BtreeError::corrupt(pn, "table page inside an index btree").into()),
        }
    }

    // ---- row operations ----

    fn table_info(&self, name: &str) -> Result<TableInfo, Error> {
        Ok(self.schema.table(name)?.clone())
    }

    fn check_row(&self, table: &TableInfo, values: &[SqlValue]) -> Result<(), Error> {
        if values.len() != table.columns.len() {
            return Err(Error::WrongValueCount {
                expected: table.columns.len(),
                got: values.len(),
            });
        }
        for (i, col) in table.columns.iter().enumerate() {
            if Some(i) == table.rowid_alias {
                continue; // rowid alias is supplied by the engine
            }
            if col.not_null && values[i] == SqlValue::Null {
                return Err(Error::NotNullViolation {
                    table: table.name.clone(),
                    column: col.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn resolve_rowid(&self, table: &TableInfo, values: &[SqlValue]) -> Result<RowId, Error> {
        if let Some(alias) = table.rowid_alias {
            match &values[alias] {
                SqlValue::Int(i) => return Ok(*i),
                SqlValue::Null => {}
                _ => {
                    return Err(Error::DatatypeMismatch {
                        table: table.name.clone(),
                        column: table.columns[alias].name.clone(),
                    })
                }
            }
        }
        match self.subtree_max_rowid(table.root_page)? {
            None => Ok(1),
            Some(m) => m.checked_add(1).ok_or(Error::RowidOverflow),
        }
    }

    /// Values as stored in the record: the rowid alias column is NULL on
    /// disk, its real value living in the cell key.
    fn stored_values(table: &TableInfo, values: &[SqlValue]) -> Vec<SqlValue> {
        let mut stored = values.to_vec();
        if let Some(alias) = table.rowid_alias {
            stored[alias] = SqlValue::Null;
        }
        stored
    }

    /// Values as seen by filters and indexes: the alias column carries the
    /// rowid.
    fn effective_values(table: &TableInfo, values: &[SqlValue], rowid: RowId) -> Vec<SqlValue> {
        let mut eff = values.to_vec();
        if let Some(alias) = table.rowid_alias {
            eff[alias] = SqlValue::Int(rowid);
        }
        eff
    }

    fn index_key(table: &TableInfo, index: &IndexInfo, eff: &[SqlValue], rowid: RowId) -> Result<Vec<SqlValue>, Error> {
        let mut key = Vec::with_capacity(index.columns.len() + 1);
        for (col_name, _order) in &index.columns {
            let idx = table.column_index(col_name).ok_or_else(|| {
                schema::Error::UnknownColumn(col_name.clone(), table.name.clone())
            })?;
            key.push(eff[idx].clone());
        }
        key.push(SqlValue::Int(rowid));
        Ok(key)
    }

    /// Errors in the middle of a statement can leave half a mutation in the
    /// dirty map, so every failed statement rolls the transaction back
    /// before returning.
    fn fail_and_rollback<T>(&mut self, r: Result<T, Error>) -> Result<T, Error> {
        if r.is_err() {
            let _ = self.finish_clean();
        }
        r
    }

    fn check_active(&self) -> Result<(), Error> {
        if self.finished {
            return Err(Error::NoActiveTx);
        }
        Ok(())
    }

    /// Insert a row, returning its rowid.
    pub fn insert(&mut self, table_name: &str, values: &[SqlValue]) -> Result<RowId, Error> {
        self.check_active()?;
        let r = self.insert_inner(table_name, values);
        self.fail_and_rollback(r)
    }

    fn insert_inner(&mut self, table_name: &str, values: &[SqlValue]) -> Result<RowId, Error> {
        let table = self.table_info(table_name)?;
        if table.without_rowid {
            return Err(Error::TableNotWritable(table.name));
        }
        self.check_row(&table, values)?;
        let rowid = self.resolve_rowid(&table, values)?;
        let stored = Self::stored_values(&table, values);
        let payload = record::encode(&stored);
        self.insert_table_row(table.root_page, rowid, &payload)?;

        let eff = Self::effective_values(&table, values, rowid);
        for index in self.schema.indices_of(&table.name).into_iter().cloned().collect::<Vec<_>>() {
            let key = Self::index_key(&table, &index, &eff, rowid)?;
            let entry = record::encode(&key);
            self.insert_index_entry(index.root_page, &entry)?;
        }
        debug!("inserted rowid {} into {}", rowid, table.name);
        Ok(rowid)
    }

    /// Delete a row; true when it existed.
    pub fn delete(&mut self, table_name: &str, rowid: RowId) -> Result<bool, Error> {
        self.check_active()?;
        let r = self.delete_inner(table_name, rowid);
        self.fail_and_rollback(r)
    }

    fn delete_inner(&mut self, table_name: &str, rowid: RowId) -> Result<bool, Error> {
        let table = self.table_info(table_name)?;
        if table.without_rowid {
            return Err(Error::TableNotWritable(table.name));
        }
        let Some(old_payload) = self.read_table_row(table.root_page, rowid)? else {
            return Ok(false);
        };
        let old_values = RecordView::parse(&old_payload)?.values()?;
        if !self.delete_table_row(table.root_page, rowid)? {
            return Ok(false);
        }
        let eff = Self::effective_values(&table, &old_values, rowid);
        for index in self.schema.indices_of(&table.name).into_iter().cloned().collect::<Vec<_>>() {
            let key = Self::index_key(&table, &index, &eff, rowid)?;
            self.delete_index_entry(index.root_page, &key)?;
        }
        debug!("deleted rowid {} from {}", rowid, table.name);
        Ok(true)
    }

    /// Replace a row's values, keeping its rowid.
    pub fn update(&mut self, table_name: &str, rowid: RowId, values: &[SqlValue]) -> Result<(), Error> {
        self.check_active()?;
        let r = self.update_inner(table_name, rowid, values);
        self.fail_and_rollback(r)
    }

    fn update_inner(&mut self, table_name: &str, rowid: RowId, values: &[SqlValue]) -> Result<(), Error> {
        let table = self.table_info(table_name)?;
        if table.without_rowid {
            return Err(Error::TableNotWritable(table.name));
        }
        self.check_row(&table, values)?;
        if let Some(alias) = table.rowid_alias {
            match &values[alias] {
                SqlValue::Null => {}
                SqlValue::Int(i) if *i == rowid => {}
                _ => {
                    return Err(Error::DatatypeMismatch {
                        table: table.name.clone(),
                        column: table.columns[alias].name.clone(),
                    })
                }
            }
        }
        if !self.delete(table_name, rowid)? {
            return Err(Error::RowNotFound(rowid));
        }
        let stored = Self::stored_values(&table, values);
        let payload = record::encode(&stored);
        self.insert_table_row(table.root_page, rowid, &payload)?;
        let eff = Self::effective_values(&table, values, rowid);
        for index in self.schema.indices_of(&table.name).into_iter().cloned().collect::<Vec<_>>() {
            let key = Self::index_key(&table, &index, &eff, rowid)?;
            let entry = record::encode(&key);
            self.insert_index_entry(index.root_page, &entry)?;
        }
        Ok(())
    }

    // ---- DDL ----

    /// `CREATE TABLE` and `CREATE INDEX`.
    pub fn execute_ddl(&mut self, sql: &str) -> Result<(), Error> {
        self.check_active()?;
        let r = self.execute_ddl_inner(sql);
        self.fail_and_rollback(r)
    }

    fn execute_ddl_inner(&mut self, sql: &str) -> Result<(), Error> {
        let upper = sql.trim_start().to_ascii_uppercase();
        if upper.starts_with("CREATE TABLE") {
            self.create_table(sql)
        } else if upper.starts_with("CREATE INDEX") || upper.starts_with("CREATE UNIQUE INDEX") {
            self.create_index(sql)
        } else {
            Err(Error::UnsupportedStatement(
                sql.split_whitespace().take(3).collect::<Vec<_>>().join(" "),
            ))
        }
    }

    fn create_table(&mut self, sql: &str) -> Result<(), Error> {
        let mut info = schema::parse_create_table(sql)?;
        if info.name.is_empty() {
            return Err(schema::Error::Parse("table has no name".to_string()).into());
        }
        if self.schema.table(&info.name).is_ok() {
            return Err(Error::AlreadyExists(info.name));
        }
        let root = self.allocate()?;
        let image = mutate::build_page(self.page_size(), root, PageType::TableLeaf, None, &[])?;
        self.put_btree_page(root, image)?;
        info.root_page = root;

        self.append_schema_row("table", &info.name, &info.name, root, sql)?;
        self.header.schema_cookie += 1;
        self.schema.tables.push(info);
        self.schema_changed = true;
        Ok(())
    }

    fn create_index(&mut self, sql: &str) -> Result<(), Error> {
        let mut info = schema::parse_create_index(sql)?;
        if info.name.is_empty() {
            return Err(schema::Error::Parse("index has no name".to_string()).into());
        }
        if self.schema.index(&info.name).is_ok() {
            return Err(Error::AlreadyExists(info.name));
        }
        let table = self.table_info(&info.table)?;
        // Validate the indexed columns up front.
        for (col, _) in &info.columns {
            if table.column_index(col).is_none() {
                return Err(schema::Error::UnknownColumn(col.clone(), table.name.clone()).into());
            }
        }
        let root = self.allocate()?;
        let image = mutate::build_page(self.page_size(), root, PageType::IndexLeaf, None, &[])?;
        self.put_btree_page(root, image)?;
        info.root_page = root;

        self.append_schema_row("index", &info.name, &info.table, root, sql)?;
        self.header.schema_cookie += 1;

        // Backfill from existing rows.
        let mut rows = Vec::new();
        self.scan_table(table.root_page, &mut rows)?;
        for (rowid, payload) in rows {
            let values = RecordView::parse(&payload)?.values()?;
            let eff = Self::effective_values(&table, &values, rowid);
            let key = Self::index_key(&table, &info, &eff, rowid)?;
            let entry = record::encode(&key);
            self.insert_index_entry(root, &entry)?;
        }

        self.schema.indices.push(info);
        self.schema_changed = true;
        Ok(())
    }

    fn append_schema_row(
        &mut self,
        kind: &str,
        name: &str,
        tbl_name: &str,
        root: PageNum,
        sql: &str,
    ) -> Result<(), Error> {
        let rowid = match self.subtree_max_rowid(schema::SCHEMA_ROOT)? {
            None => 1,
            Some(m) => m.checked_add(1).ok_or(Error::RowidOverflow)?,
        };
        let row = schema::schema_row(kind, name, tbl_name, root, sql);
        let payload = record::encode(&row);
        self.insert_table_row(schema::SCHEMA_ROOT, rowid, &payload)
    }

    // ---- lifecycle ----

    /// Durably apply the transaction: finalize the journal, write dirty
    /// pages in ascending page order, fsync, and drop the journal.
    pub fn commit(mut self) -> Result<(), Error> {
        if self.finished {
            return Err(Error::NoActiveTx);
        }
        if self.dirty.is_empty() && !self.schema_changed {
            self.finish_clean()?;
            return Ok(());
        }
        self.header.change_counter = self.header.change_counter.wrapping_add(1);
        let mut p1 = self.page(1)?;
        dbheader::write(&mut p1, &self.header);
        self.put_page(1, p1)?;

        if let Some(j) = self.journal.as_mut() {
            j.finalize()?;
        }
        let sink = self.sink();
        for (pn, image) in &self.dirty {
            sink.write_page(*pn, image)?;
        }
        sink.sync()?;
        if let Some(j) = self.journal.take() {
            j.delete()?;
        }
        sink.unlock()?;
        self.finished = true;

        let header = self.header.clone();
        let schema = std::mem::take(&mut self.schema);
        self.db.after_commit(header, schema);
        debug!("committed {} pages", self.dirty.len());
        Ok(())
    }

    /// Discard the transaction.  Nothing reached the database file, so this
    /// is deletion of the (unfinalized) journal plus dropping state.
    pub fn rollback(mut self) -> Result<(), Error> {
        self.finish_clean()
    }

    fn finish_clean(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.dirty.clear();
        if let Some(j) = self.journal.take() {
            j.delete()?;
        }
        self.sink().unlock()?;
        Ok(())
    }

    /// Test support: run commit's write-back but stop dead after
    /// `pages_to_write` page writes, as a process kill at that point would.
    /// The journal is left hot on disk; the database object must be
    /// reopened to recover.
    #[doc(hidden)]
    pub fn commit_interrupted(mut self, pages_to_write: usize) -> Result<(), Error> {
        self.header.change_counter = self.header.change_counter.wrapping_add(1);
        let mut p1 = self.page(1)?;
        dbheader::write(&mut p1, &self.header);
        self.put_page(1, p1)?;

        if let Some(j) = self.journal.as_mut() {
            j.finalize()?;
        }
        let sink = self.sink();
        for (pn, image) in self.dirty.iter().take(pages_to_write) {
            sink.write_page(*pn, image)?;
        }
        sink.sync()?;
        if let Some(j) = self.journal.take() {
            j.abandon(); // stays hot on disk
        }
        sink.unlock()?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish_clean();
        }
    }
}
