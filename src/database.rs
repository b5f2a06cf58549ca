//! Defines the `Database` type, the handle over one open database image.
//!
//! Opening runs crash recovery first (a hot rollback journal is replayed
//! before any page is interpreted), validates the file header, loads the
//! schema, and assembles the page-source stack: base pager, optional
//! encryption adapter, optional LRU cache with prefetch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::btree::cursor::Cursor;
use crate::btree::RowId;
use crate::crypto::{EncryptedPager, EncryptionOptions};
use crate::dbheader::{self, DbHeader};
use crate::filter::{BoundFilter, Filter};
use crate::journal;
use crate::page_cache::{PageCache, PrefetchConfig};
use crate::pager::{FilePager, MemPager, MmapPager, PageSink, PageSource};
use crate::record::RecordView;
use crate::schema::{self, Schema, TableInfo};
use crate::sql_value::SqlValue;
use crate::tx::{Transaction, Writer};

pub const MEMORY_PATH: &str = ":memory:";
const DEFAULT_PAGE_CACHE_CAPACITY: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Database file does not exist: {0}")]
    NoSuchFile(PathBuf),
    #[error("Database file already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("Database is open read-only.")]
    ReadOnly,
    #[error("Recovery of a hot journal failed: {0}")]
    RecoveryFailed(String),
    #[error("Table {0} cannot be scanned ({1}).")]
    Unscannable(String, &'static str),
    #[error(transparent)]
    Header(#[from] dbheader::Error),
    #[error(transparent)]
    Pager(#[from] crate::pager::Error),
    #[error(transparent)]
    Btree(#[from] crate::btree::Error),
    #[error(transparent)]
    Schema(#[from] schema::Error),
    #[error(transparent)]
    Filter(#[from] crate::filter::Error),
    #[error(transparent)]
    Record(#[from] crate::record::Error),
    #[error(transparent)]
    Tx(#[from] crate::tx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How to open a database.
#[derive(Clone, Default)]
pub struct OpenOptions {
    pub writable: bool,
    /// Map the file read-only instead of going through read() calls.
    /// Ignored for writable opens.
    pub memory_map: bool,
    /// Pages held by the LRU cache; 0 disables caching entirely.
    pub page_cache_capacity: Option<usize>,
    /// Sequential-scan prefetch; `None` disables it.
    pub prefetch: Option<PrefetchConfig>,
    /// Whole-database page-granularity encryption.
    pub encryption: Option<EncryptionOptions>,
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions {
            writable: false,
            memory_map: false,
            page_cache_capacity: Some(DEFAULT_PAGE_CACHE_CAPACITY),
            prefetch: Some(PrefetchConfig::default()),
            encryption: None,
        }
    }

    pub fn writable(mut self, yes: bool) -> Self {
        self.writable = yes;
        self
    }

    pub fn memory_map(mut self, yes: bool) -> Self {
        self.memory_map = yes;
        self
    }

    pub fn page_cache_capacity(mut self, pages: usize) -> Self {
        self.page_cache_capacity = Some(pages);
        self
    }

    pub fn prefetch(mut self, cfg: Option<PrefetchConfig>) -> Self {
        self.prefetch = cfg;
        self
    }

    pub fn encryption(mut self, enc: EncryptionOptions) -> Self {
        self.encryption = Some(enc);
        self
    }
}

/// One open database.
pub struct Database {
    pub(crate) path: Option<PathBuf>,
    pub(crate) writable: bool,
    /// Raw pager, uncached; the write engine reads committed pages here.
    pub(crate) base: Arc<dyn PageSource>,
    /// Same pager with write capability, when writable.
    pub(crate) sink: Option<Arc<dyn PageSink>>,
    /// What readers use: the cache wrapper when configured, else `base`.
    source: Arc<dyn PageSource>,
    cache: Option<Arc<PageCache>>,
    pub(crate) header: DbHeader,
    pub(crate) schema: Schema,
    /// Bumped on every commit; open cursors check it and refuse to run on.
    epoch: Arc<AtomicU64>,
    options: OpenOptions,
}

impl Database {
    /// Open an existing database (or a fresh in-memory one for
    /// [`MEMORY_PATH`]) with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Database, Error> {
        Self::open_with(path, OpenOptions::new())
    }

    pub fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<Database, Error> {
        let path = path.as_ref();
        if path.as_os_str() == MEMORY_PATH {
            return Self::new_in_memory(4096, options);
        }
        if !path.exists() {
            return Err(Error::NoSuchFile(path.to_path_buf()));
        }

        // Fold back any interrupted commit before reading a single page.
        // Plaintext files recover directly; encrypted files must replay
        // through their pager so pre-images are sealed again on the way
        // back in, which needs the pager built first.
        if options.encryption.is_none() {
            match journal::recover_if_needed(path) {
                Ok(journal::Recovery::Clean) => {}
                Ok(outcome) => info!("recovered {} ({:?})", path.display(), outcome),
                Err(e) => return Err(Error::RecoveryFailed(e.to_string())),
            }
        }

        let (base, sink): (Arc<dyn PageSource>, Option<Arc<dyn PageSink>>) =
            if let Some(enc) = &options.encryption {
                // Recovery always needs write access to the file.
                let pager = Arc::new(EncryptedPager::open(path, enc, true)?);
                match journal::recover_with_sink(path, pager.as_ref()) {
                    Ok(journal::Recovery::Clean) => {}
                    Ok(outcome) => info!("recovered {} ({:?})", path.display(), outcome),
                    Err(e) => return Err(Error::RecoveryFailed(e.to_string())),
                }
                (
                    pager.clone() as Arc<dyn PageSource>,
                    options.writable.then(|| pager as Arc<dyn PageSink>),
                )
            } else {
                // The header's own page size frames the file; read it from
                // the first 100 bytes before building the pager.
                let header_bytes = read_prefix(path, dbheader::HEADER_LEN)?;
                let probe = dbheader::parse(&header_bytes)?;
                if options.writable {
                    let pager = Arc::new(FilePager::open_read_write(path, probe.page_size)?);
                    (
                        pager.clone() as Arc<dyn PageSource>,
                        Some(pager as Arc<dyn PageSink>),
                    )
                } else if options.memory_map {
                    (
                        Arc::new(MmapPager::open(path, probe.page_size)?) as Arc<dyn PageSource>,
                        None,
                    )
                } else {
                    (
                        Arc::new(FilePager::open_read_only(path, probe.page_size)?)
                            as Arc<dyn PageSource>,
                        None,
                    )
                }
            };

        Self::assemble(Some(path.to_path_buf()), base, sink, options)
    }

    /// Create a new empty database file and open it writable.
    pub fn create(path: impl AsRef<Path>, page_size: u32) -> Result<Database, Error> {
        Self::create_with(path, page_size, OpenOptions::new().writable(true))
    }

    pub fn create_with(
        path: impl AsRef<Path>,
        page_size: u32,
        options: OpenOptions,
    ) -> Result<Database, Error> {
        let path = path.as_ref();
        if path.as_os_str() == MEMORY_PATH {
            return Self::new_in_memory(page_size, options);
        }
        if path.exists() {
            return Err(Error::AlreadyExists(path.to_path_buf()));
        }
        if !dbheader::is_valid_page_size(page_size) {
            return Err(dbheader::Error::UnsupportedPageSize(page_size).into());
        }
        std::fs::File::create(path)?;
        if let Some(enc) = &options.encryption {
            let pager = EncryptedPager::open(path, enc, true)?;
            pager.write_page(1, &empty_page1(page_size))?;
            pager.sync()?;
        } else {
            let pager = FilePager::open_read_write(path, page_size)?;
            pager.write_page(1, &empty_page1(page_size))?;
            pager.sync()?;
        }
        debug!("created database {} ({} byte pages)", path.display(), page_size);
        Self::open_with(path, options.writable(true))
    }

    fn new_in_memory(page_size: u32, options: OpenOptions) -> Result<Database, Error> {
        let pager = Arc::new(MemPager::new(page_size));
        pager.write_page(1, &empty_page1(page_size))?;
        Self::assemble(
            None,
            pager.clone() as Arc<dyn PageSource>,
            Some(pager as Arc<dyn PageSink>),
            OpenOptions {
                writable: true,
                ..options
            },
        )
    }

    fn assemble(
        path: Option<PathBuf>,
        base: Arc<dyn PageSource>,
        sink: Option<Arc<dyn PageSink>>,
        options: OpenOptions,
    ) -> Result<Database, Error> {
        let page1 = base.page(1)?;
        let header = dbheader::parse(&page1)?;
        let capacity = options
            .page_cache_capacity
            .unwrap_or(DEFAULT_PAGE_CACHE_CAPACITY);
        let (source, cache) = if capacity > 0 {
            let cache = Arc::new(PageCache::new(base.clone(), capacity, options.prefetch));
            (cache.clone() as Arc<dyn PageSource>, Some(cache))
        } else {
            (base.clone(), None)
        };
        let schema = schema::load(source.clone(), header.usable_size())?;
        Ok(Database {
            path,
            writable: options.writable && sink.is_some(),
            base,
            sink,
            source,
            cache,
            header,
            schema,
            epoch: Arc::new(AtomicU64::new(0)),
            options,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// Cache counters, when a page cache is configured.
    pub fn cache_stats(&self) -> Option<crate::page_cache::CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.schema.tables.iter()
    }

    pub fn indices(&self) -> impl Iterator<Item = &schema::IndexInfo> {
        self.schema.indices.iter()
    }

    pub fn table_info(&self, name: &str) -> Result<&TableInfo, Error> {
        Ok(self.schema.table(name)?)
    }

    /// The reader-facing page source (cached when caching is on).
    pub fn page_source(&self) -> Arc<dyn PageSource> {
        self.source.clone()
    }

    pub(crate) fn sink_source(&self) -> &dyn PageSource {
        self.base.as_ref()
    }

    /// A raw cursor over a table's btree.
    pub fn table_cursor(&self, table: &str) -> Result<Cursor, Error> {
        let info = self.schema.table(table)?;
        if info.without_rowid {
            return Err(Error::Unscannable(info.name.clone(), "WITHOUT ROWID"));
        }
        if info.root_page == 0 {
            return Err(Error::Unscannable(info.name.clone(), "no root page"));
        }
        let cur = Cursor::new(self.source.clone(), info.root_page, self.header.usable_size())?
            .with_epoch(self.epoch.clone(), self.epoch.load(Ordering::SeqCst));
        Ok(cur)
    }

    /// A raw cursor over an index's btree.
    pub fn index_cursor(&self, index: &str) -> Result<Cursor, Error> {
        let info = self.schema.index(index)?;
        let cur = Cursor::new(self.source.clone(), info.root_page, self.header.usable_size())?
            .with_epoch(self.epoch.clone(), self.epoch.load(Ordering::SeqCst));
        Ok(cur)
    }

    /// A row reader over a table, optionally projected and filtered.
    pub fn reader(&self, table: &str) -> Result<Reader, Error> {
        self.build_reader(table, None, None)
    }

    pub fn reader_projected(&self, table: &str, columns: &[&str]) -> Result<Reader, Error> {
        self.build_reader(table, Some(columns), None)
    }

    pub fn reader_filtered(&self, table: &str, filter: &Filter) -> Result<Reader, Error> {
        self.build_reader(table, None, Some(filter))
    }

    pub fn reader_with(
        &self,
        table: &str,
        columns: &[&str],
        filter: &Filter,
    ) -> Result<Reader, Error> {
        self.build_reader(table, Some(columns), Some(filter))
    }

    fn build_reader(
        &self,
        table: &str,
        columns: Option<&[&str]>,
        filter: Option<&Filter>,
    ) -> Result<Reader, Error> {
        let info = self.schema.table(table)?.clone();
        let cursor = self.table_cursor(table)?;
        let bound = match filter {
            Some(f) => Some(f.bind(&info)?),
            None => None,
        };
        let projection = match columns {
            None => None,
            Some(names) => {
                let mut idxs = Vec::with_capacity(names.len());
                for n in names {
                    let idx = info.column_index(n).ok_or_else(|| {
                        schema::Error::UnknownColumn((*n).to_string(), info.name.clone())
                    })?;
                    idxs.push(idx);
                }
                Some(idxs)
            }
        };
        Ok(Reader {
            cursor,
            table: info,
            filter: bound,
            projection,
        })
    }

    /// The write façade.  Fails on read-only databases.
    pub fn writer(&mut self) -> Result<Writer<'_>, Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        Ok(Writer::new(self))
    }

    /// Begin an explicit transaction directly.
    pub fn begin(&mut self) -> Result<Transaction<'_>, Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        Ok(Transaction::begin(self)?)
    }

    pub(crate) fn after_commit(&mut self, header: DbHeader, schema: Schema) {
        self.header = header;
        self.schema = schema;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-read header and schema after another process changed the file
    /// (observed during begin's recovery check).
    pub(crate) fn reload_after_external_change(&mut self) -> Result<(), crate::tx::Error> {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let page1 = self.base.page(1).map_err(crate::tx::Error::Pager)?;
        self.header = dbheader::parse(&page1)
            .map_err(|e| crate::tx::Error::RecoveryFailed(e.to_string()))?;
        self.schema = schema::load(self.source.clone(), self.header.usable_size())?;
        Ok(())
    }
}

fn read_prefix(path: &Path, len: usize) -> Result<Vec<u8>, Error> {
    use std::io::Read;
    let mut buf = vec![0u8; len];
    let mut f = std::fs::File::open(path)?;
    f.read_exact(&mut buf)
        .map_err(|_| dbheader::Error::Truncated)?;
    Ok(buf)
}

/// Page 1 of a brand-new database: file header plus an empty schema leaf.
fn empty_page1(page_size: u32) -> Vec<u8> {
    use crate::btree::{mutate, PageType};
    let mut page = mutate::build_page(page_size, 1, PageType::TableLeaf, None, &[])
        .expect("empty page always fits");
    dbheader::write(&mut page, &DbHeader::new(page_size));
    page
}

/// A materialized row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub rowid: RowId,
    pub values: Vec<SqlValue>,
}

/// Cursor-backed row reader with optional projection and filter.
pub struct Reader {
    cursor: Cursor,
    table: TableInfo,
    filter: Option<BoundFilter>,
    projection: Option<Vec<usize>>,
}

impl Reader {
    pub fn table(&self) -> &TableInfo {
        &self.table
    }

    /// Direct access to the underlying cursor, for seeks.
    pub fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    /// The next matching row, or `None` at the end of the table.
    pub fn next_row(&mut self) -> Result<Option<Row>, Error> {
        while self.cursor.next()? {
            let rowid = self.cursor.rowid()?;
            let rec = self.cursor.record()?;
            if let Some(f) = &self.filter {
                if !f.matches(&rec, Some(rowid))? {
                    continue;
                }
            }
            let values = materialize(&self.table, &rec, rowid, self.projection.as_deref())?;
            return Ok(Some(Row { rowid, values }));
        }
        Ok(None)
    }
}

impl Iterator for Reader {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Decode the visible values of a row: the rowid-alias column reads back as
/// the rowid, and a projection selects/reorders columns.
fn materialize(
    table: &TableInfo,
    rec: &RecordView<'_>,
    rowid: RowId,
    projection: Option<&[usize]>,
) -> Result<Vec<SqlValue>, Error> {
    let column_value = |i: usize| -> Result<SqlValue, Error> {
        if table.rowid_alias == Some(i) {
            return Ok(SqlValue::Int(rowid));
        }
        // Tolerate records narrower than the declared schema (columns added
        // after the row was written read as NULL).
        if i >= rec.column_count() {
            return Ok(SqlValue::Null);
        }
        Ok(rec.value(i)?)
    };
    match projection {
        None => (0..table.columns.len()).map(column_value).collect(),
        Some(idxs) => idxs.iter().map(|i| column_value(*i)).collect(),
    }
}
