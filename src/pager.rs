//! Page sources supply fixed-size pages of one database image, numbered from 1
//! to match how SQLite numbers pages.
//!
//! The complete state of a database lives in a single sequence of pages; every
//! reader and the write engine go through the [`PageSource`] / [`PageSink`]
//! capability traits so the same cursor code runs over an in-memory image, a
//! plain file, a memory-mapped file, or the caching wrapper in
//! `page_cache`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

/// Page numbers are 1-based, to match how SQLite numbers pages.
pub type PageNum = u32;

/// An immutable page span.  Cheap to clone; holders keep the bytes alive, so
/// cache eviction can never free a span still in use.
pub type Page = Arc<[u8]>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Page {page} is out of range for a database of {count} pages.")]
    OutOfRange { page: PageNum, count: u32 },
    #[error("Error accessing database file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Page {page} extends past the end of the file.")]
    Truncated { page: PageNum },
    #[error("Page source is read-only.")]
    ReadOnly,
}

/// Read capability over a database image.
pub trait PageSource: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> u32;

    /// Number of pages the image currently holds.
    fn page_count(&self) -> u32;

    /// Fetch page `pn`.  Page 1 includes the 100-byte file header; callers
    /// that interpret page 1 as a btree page skip it themselves.
    fn page(&self, pn: PageNum) -> Result<Page, Error>;
}

/// Write capability over a database image.  The write engine is the only
/// consumer; all methods take `&self` so one shared handle serves readers and
/// the single writer.
pub trait PageSink: PageSource {
    /// Replace page `pn` (1-based).  Writing one page past the end grows the
    /// image by one page.
    fn write_page(&self, pn: PageNum, data: &[u8]) -> Result<(), Error>;

    /// Shrink the image to exactly `pages` pages.
    fn truncate(&self, pages: u32) -> Result<(), Error>;

    /// Flush written pages to durable storage.
    fn sync(&self) -> Result<(), Error>;

    /// Take the process-level exclusive lock for a write transaction.
    fn lock_exclusive(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Release the transaction lock.
    fn unlock(&self) -> Result<(), Error> {
        Ok(())
    }
}

fn check_range(pn: PageNum, count: u32) -> Result<(), Error> {
    if pn == 0 || pn > count {
        return Err(Error::OutOfRange { page: pn, count });
    }
    Ok(())
}

// ------------------------------------------------------------------
// In-memory source/sink.

/// A database image held entirely in memory.  Backs `:memory:` databases and
/// most unit tests.
pub struct MemPager {
    page_size: u32,
    pages: RwLock<Vec<Page>>,
}

impl MemPager {
    pub fn new(page_size: u32) -> Self {
        MemPager {
            page_size,
            pages: RwLock::new(Vec::new()),
        }
    }

    /// Split a raw database image into pages.  The image length must be a
    /// multiple of `page_size`.
    pub fn from_bytes(image: &[u8], page_size: u32) -> Self {
        let pages = image
            .chunks(page_size as usize)
            .map(Arc::from)
            .collect::<Vec<Page>>();
        MemPager {
            page_size,
            pages: RwLock::new(pages),
        }
    }

    /// Copy the whole image back out, page by page.  Test support.
    pub fn to_bytes(&self) -> Vec<u8> {
        let pages = self.pages.read();
        let mut out = Vec::with_capacity(pages.len() * self.page_size as usize);
        for p in pages.iter() {
            out.extend_from_slice(p);
        }
        out
    }
}

impl PageSource for MemPager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.pages.read().len() as u32
    }

    fn page(&self, pn: PageNum) -> Result<Page, Error> {
        let pages = self.pages.read();
        check_range(pn, pages.len() as u32)?;
        Ok(pages[pn as usize - 1].clone())
    }
}

impl PageSink for MemPager {
    fn write_page(&self, pn: PageNum, data: &[u8]) -> Result<(), Error> {
        let mut pages = self.pages.write();
        let count = pages.len() as u32;
        if pn == count + 1 {
            pages.push(Arc::from(data));
            return Ok(());
        }
        check_range(pn, count)?;
        pages[pn as usize - 1] = Arc::from(data);
        Ok(())
    }

    fn truncate(&self, n: u32) -> Result<(), Error> {
        self.pages.write().truncate(n as usize);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}

// ------------------------------------------------------------------
// File-backed source/sink.

/// Reads and writes pages of a database file through the OS page cache,
/// positioning at `(pn - 1) * page_size`.
pub struct FilePager {
    file: Mutex<File>,
    page_size: u32,
    writable: bool,
}

impl FilePager {
    /// Open for reading.  Takes a shared advisory lock so a writer in another
    /// process cannot commit underneath us.
    pub fn open_read_only(path: &Path, page_size: u32) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new().read(true).open(path)?;
        file.lock_shared()?;
        Ok(FilePager {
            file: Mutex::new(file),
            page_size,
            writable: false,
        })
    }

    /// Open for reading and writing.  The exclusive lock is not taken here
    /// but per write transaction, via [`PageSink::lock_exclusive`].
    pub fn open_read_write(path: &Path, page_size: u32) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(FilePager {
            file: Mutex::new(file),
            page_size,
            writable: true,
        })
    }
}

impl PageSource for FilePager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        let file = self.file.lock();
        match file.metadata() {
            Ok(m) => (m.len() / self.page_size as u64) as u32,
            Err(_) => 0,
        }
    }

    fn page(&self, pn: PageNum) -> Result<Page, Error> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let count = (len / self.page_size as u64) as u32;
        check_range(pn, count)?;
        let mut buf = vec![0u8; self.page_size as usize];
        file.seek(SeekFrom::Start((pn as u64 - 1) * self.page_size as u64))?;
        file.read_exact(&mut buf)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::Truncated { page: pn },
                _ => Error::Io(e),
            })?;
        Ok(Arc::from(buf.into_boxed_slice()))
    }
}

impl PageSink for FilePager {
    fn write_page(&self, pn: PageNum, data: &[u8]) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut file = self.file.lock();
        let count = (file.metadata()?.len() / self.page_size as u64) as u32;
        if pn == 0 || pn > count + 1 {
            return Err(Error::OutOfRange { page: pn, count });
        }
        file.seek(SeekFrom::Start((pn as u64 - 1) * self.page_size as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn truncate(&self, pages: u32) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let file = self.file.lock();
        file.set_len(pages as u64 * self.page_size as u64)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }

    fn lock_exclusive(&self) -> Result<(), Error> {
        let file = self.file.lock();
        file.lock_exclusive()?;
        Ok(())
    }

    fn unlock(&self) -> Result<(), Error> {
        let file = self.file.lock();
        FileExt::unlock(&*file)?;
        Ok(())
    }
}

// ------------------------------------------------------------------
// Memory-mapped source.

/// Read-only source over a memory-mapped database file.  Useful for large
/// databases where the OS should manage residency.
pub struct MmapPager {
    map: memmap2::Mmap,
    page_size: u32,
}

impl MmapPager {
    pub fn open(path: &Path, page_size: u32) -> Result<Self, Error> {
        let file = File::open(path)?;
        file.lock_shared()?;
        // Safety: the shared advisory lock keeps cooperating writers out for
        // the lifetime of the map.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(MmapPager { map, page_size })
    }
}

impl PageSource for MmapPager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        (self.map.len() / self.page_size as usize) as u32
    }

    fn page(&self, pn: PageNum) -> Result<Page, Error> {
        check_range(pn, self.page_count())?;
        let start = (pn as usize - 1) * self.page_size as usize;
        let end = start + self.page_size as usize;
        if end > self.map.len() {
            return Err(Error::Truncated { page: pn });
        }
        Ok(Arc::from(&self.map[start..end]))
    }
}
