//! journal implements the rollback journal: a sidecar file of pre-image pages
//! that restores the database to its pre-transaction state after a rollback
//! or a crash.
//!
//! Layout: an 8-byte magic, then big-endian u32 fields (record count, random
//! nonce, initial database size in pages, sector size, page size), padded to
//! a sector boundary.  Each record is a u32 page number, one page of
//! pre-image bytes, and a u32 checksum seeded by the nonce.  The record count
//! is written last, during commit, so a journal abandoned before that point
//! reads as empty and is discarded.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::dbheader;
use crate::pager::PageNum;

pub const MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];
const SECTOR_SIZE: u32 = 512;
const HEADER_FIELDS_LEN: usize = 8 + 5 * 4;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error accessing journal file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Journal is corrupt: {0}")]
    Corrupt(&'static str),
}

/// `<db_path>.journal`
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".journal");
    PathBuf::from(name)
}

/// The checksum SQLite uses for journal records: the nonce plus every 200th
/// byte of the page, sampled from the tail.
pub fn record_checksum(nonce: u32, page: &[u8]) -> u32 {
    let mut sum = nonce;
    let mut i = page.len() as isize - 200;
    while i > 0 {
        sum = sum.wrapping_add(page[i as usize] as u32);
        i -= 200;
    }
    sum
}

/// An open journal being written for one transaction.
pub struct Journal {
    file: File,
    path: PathBuf,
    nonce: u32,
    page_size: u32,
    initial_page_count: u32,
    record_count: u32,
}

impl Journal {
    /// Create the journal and write its header with a zero record count.
    pub fn create(db_path: &Path, page_size: u32, initial_page_count: u32) -> Result<Journal, Error> {
        let path = journal_path(db_path);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(&path)?;
        let nonce: u32 = rand::random();
        let mut header = vec![0u8; SECTOR_SIZE as usize];
        header[..8].copy_from_slice(&MAGIC);
        {
            let mut c = std::io::Cursor::new(&mut header[8..HEADER_FIELDS_LEN]);
            c.write_u32::<BigEndian>(0).unwrap(); // record count, finalized later
            c.write_u32::<BigEndian>(nonce).unwrap();
            c.write_u32::<BigEndian>(initial_page_count).unwrap();
            c.write_u32::<BigEndian>(SECTOR_SIZE).unwrap();
            c.write_u32::<BigEndian>(page_size).unwrap();
        }
        file.write_all(&header)?;
        debug!(
            "journal {} created (initial size {} pages)",
            path.display(),
            initial_page_count
        );
        Ok(Journal {
            file,
            path,
            nonce,
            page_size,
            initial_page_count,
            record_count: 0,
        })
    }

    pub fn initial_page_count(&self) -> u32 {
        self.initial_page_count
    }

    /// Append the pre-image of page `pn`.
    pub fn log_page(&mut self, pn: PageNum, data: &[u8]) -> Result<(), Error> {
        debug_assert_eq!(data.len(), self.page_size as usize);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_u32::<BigEndian>(pn)?;
        self.file.write_all(data)?;
        self.file
            .write_u32::<BigEndian>(record_checksum(self.nonce, data))?;
        self.record_count += 1;
        Ok(())
    }

    /// Make the journal hot: pad to a sector boundary, write the real record
    /// count, and fsync.  After this returns, a crash during database
    /// write-back is recoverable.
    pub fn finalize(&mut self) -> Result<(), Error> {
        let len = self.file.seek(SeekFrom::End(0))?;
        let pad = (SECTOR_SIZE as u64 - len % SECTOR_SIZE as u64) % SECTOR_SIZE as u64;
        if pad > 0 {
            self.file.write_all(&vec![0u8; pad as usize])?;
        }
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_u32::<BigEndian>(self.record_count)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Remove the journal after a clean commit.
    pub fn delete(self) -> Result<(), Error> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Abandon without deleting; test support for crash simulation.
    #[doc(hidden)]
    pub fn abandon(self) {
        drop(self.file);
    }
}

/// What `recover_if_needed` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No journal present; nothing to do.
    Clean,
    /// A journal existed but held no committed records; discarded.
    DiscardedEmpty,
    /// Pre-images were rolled back into the database file.
    RolledBack { pages: u32 },
}

/// A parsed hot journal: the pre-images to put back, newest first dropped
/// at the first torn record.
struct HotJournal {
    initial_page_count: u32,
    page_size: u32,
    records: Vec<(PageNum, Vec<u8>)>,
}

enum JournalScan {
    Absent,
    Discardable,
    Hot(HotJournal),
}

/// Read and classify the journal next to `db_path`, if any.
///
/// Records after the first corrupt checksum are ignored: they belong to a
/// write the OS never fully flushed, which also means the corresponding
/// database pages were never rewritten.
fn scan_journal(db_path: &Path) -> Result<JournalScan, Error> {
    let jpath = journal_path(db_path);
    let mut jfile = match File::open(&jpath) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(JournalScan::Absent),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut magic = [0u8; 8];
    if jfile.read_exact(&mut magic).is_err() || magic != MAGIC {
        // Not a journal this engine wrote; a zero-length file from an
        // interrupted create is the common case.
        warn!("discarding unrecognized journal {}", jpath.display());
        return Ok(JournalScan::Discardable);
    }
    let record_count = jfile.read_u32::<BigEndian>()?;
    let nonce = jfile.read_u32::<BigEndian>()?;
    let initial_page_count = jfile.read_u32::<BigEndian>()?;
    let sector_size = jfile.read_u32::<BigEndian>()?;
    let page_size = jfile.read_u32::<BigEndian>()?;
    if record_count == 0 {
        return Ok(JournalScan::Discardable);
    }
    if !dbheader::is_valid_page_size(page_size) || sector_size == 0 {
        return Err(Error::Corrupt("implausible page or sector size"));
    }

    jfile.seek(SeekFrom::Start(sector_size as u64))?;
    let mut records: Vec<(PageNum, Vec<u8>)> = Vec::new();
    for _ in 0..record_count {
        let pn = match jfile.read_u32::<BigEndian>() {
            Ok(pn) => pn,
            Err(_) => break,
        };
        let mut page = vec![0u8; page_size as usize];
        if jfile.read_exact(&mut page).is_err() {
            break;
        }
        let cksum = match jfile.read_u32::<BigEndian>() {
            Ok(c) => c,
            Err(_) => break,
        };
        if cksum != record_checksum(nonce, &page) {
            warn!("journal record for page {} fails its checksum; stopping replay there", pn);
            break;
        }
        records.push((pn, page));
    }
    if records.is_empty() {
        return Err(Error::Corrupt("hot journal with no readable records"));
    }
    Ok(JournalScan::Hot(HotJournal {
        initial_page_count,
        page_size,
        records,
    }))
}

/// If a hot journal sits next to `db_path`, roll its pre-images back into
/// the database file (in reverse order, so the earliest image of a page
/// wins), truncate to the recorded initial size, fsync, and delete the
/// journal.
///
/// This writes the raw file directly and is only correct for plaintext
/// databases; encrypted databases recover through their page sink with
/// [`recover_with_sink`].
pub fn recover_if_needed(db_path: &Path) -> Result<Recovery, Error> {
    let jpath = journal_path(db_path);
    let hot = match scan_journal(db_path)? {
        JournalScan::Absent => return Ok(Recovery::Clean),
        JournalScan::Discardable => {
            std::fs::remove_file(&jpath)?;
            return Ok(Recovery::DiscardedEmpty);
        }
        JournalScan::Hot(h) => h,
    };

    let mut db = std::fs::OpenOptions::new().read(true).write(true).open(db_path)?;
    let pages = hot.records.len() as u32;
    for (pn, image) in hot.records.into_iter().rev() {
        db.seek(SeekFrom::Start((pn as u64 - 1) * hot.page_size as u64))?;
        db.write_all(&image)?;
    }
    db.set_len(hot.initial_page_count as u64 * hot.page_size as u64)?;
    db.sync_all()?;
    drop(db);
    std::fs::remove_file(&jpath)?;
    debug!("rolled back {} pages from {}", pages, jpath.display());
    Ok(Recovery::RolledBack { pages })
}

/// Like [`recover_if_needed`], but replays through a [`PageSink`], so page
/// images pass back through whatever transform (encryption) the sink
/// applies on write.
pub fn recover_with_sink(
    db_path: &Path,
    sink: &dyn crate::pager::PageSink,
) -> Result<Recovery, Error> {
    let jpath = journal_path(db_path);
    let hot = match scan_journal(db_path)? {
        JournalScan::Absent => return Ok(Recovery::Clean),
        JournalScan::Discardable => {
            std::fs::remove_file(&jpath)?;
            return Ok(Recovery::DiscardedEmpty);
        }
        JournalScan::Hot(h) => h,
    };
    if hot.page_size != sink.page_size() {
        return Err(Error::Corrupt("journal page size does not match the database"));
    }
    let sink_err = |e: crate::pager::Error| match e {
        crate::pager::Error::Io(io) => Error::Io(io),
        _ => Error::Corrupt("sink rejected a rolled-back page"),
    };
    let pages = hot.records.len() as u32;
    for (pn, image) in hot.records.into_iter().rev() {
        sink.write_page(pn, &image).map_err(sink_err)?;
    }
    sink.truncate(hot.initial_page_count).map_err(sink_err)?;
    sink.sync().map_err(sink_err)?;
    std::fs::remove_file(&jpath)?;
    debug!("rolled back {} pages via sink from {}", pages, jpath.display());
    Ok(Recovery::RolledBack { pages })
}
