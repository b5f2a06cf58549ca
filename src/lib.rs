//! sharcdb is a reader/writer engine for the SQLite 3 on-disk format, plus
//! the two caches that sit directly on top of it.
//!
//! The layers, bottom up:
//! * `varint` and `serial_type` are the binary primitives of the format.
//! * `pager` supplies immutable pages by 1-based number; `page_cache` is an
//!   LRU over any page source with sequential-scan prefetch.
//! * `dbheader`, `btree::{header,cell,overflow}` and `freelist` decode the
//!   on-disk structures; `record` decodes and encodes row payloads.
//! * `schema` reads the catalogue; `btree::cursor` iterates and seeks over
//!   table and index trees; `filter` evaluates predicate trees over records.
//! * `tx` + `journal` + `btree::mutate` form the write engine: journaled
//!   transactions, freelist allocation, page splits.
//! * `database` is the user-facing handle tying those together.
//! * `value_cache` is an independent concurrent TTL/LRU cache sharing the
//!   `crypto` primitives; `validator` checks file shape and mutation
//!   ledgers.
//!
//! ```no_run
//! use sharcdb::{Database, Filter};
//!
//! # fn main() -> Result<(), sharcdb::database::Error> {
//! let mut db = Database::create("app.db", 4096)?;
//! {
//!     let mut w = db.writer()?;
//!     w.execute_ddl("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")?;
//!     w.insert("users", &[sharcdb::SqlValue::Null, "ada".into()])?;
//! }
//! let adults = Filter::column("name").starts_with("a");
//! for row in db.reader_filtered("users", &adults)? {
//!     println!("{:?}", row?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod crypto;
pub mod database;
pub mod dbheader;
pub mod filter;
pub mod freelist;
pub mod journal;
pub mod page_cache;
pub mod pager;
pub mod record;
pub mod schema;
pub mod serial_type;
pub mod sql_type;
pub mod sql_value;
pub mod tx;
pub mod validator;
pub mod value_cache;
pub mod varint;

pub use crate::btree::cursor::{Cursor, CursorState, SeekResult};
pub use crate::database::{Database, Error, OpenOptions, Reader, Row};
pub use crate::filter::Filter;
pub use crate::page_cache::PrefetchConfig;
pub use crate::sql_type::SqlType;
pub use crate::sql_value::SqlValue;
pub use crate::tx::{Transaction, Writer};
pub use crate::value_cache::{CacheConfig, EntryOptions, ValueCache};
