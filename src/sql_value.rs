//! Defines an enum of all the possible values a stored column can hold, and
//! the record-wise ordering index btrees are sorted by.

use std::cmp::Ordering;

use enum_as_inner::EnumAsInner;

/// Can hold any value that can be stored in a table.
/// These are the storage classes SQLite files use: `NULL`, `INTEGER`, `REAL`,
/// `TEXT` and `BLOB`.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(x) => write!(f, "{}", x),
            SqlValue::Real(x) => write!(f, "{}", x),
            SqlValue::Text(x) => write!(f, "{}", x),
            SqlValue::Blob(b) => write!(f, "<BLOB[{}]>", b.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> SqlValue {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> SqlValue {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> SqlValue {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> SqlValue {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> SqlValue {
        SqlValue::Blob(v)
    }
}

impl SqlValue {
    /// Storage-class rank used by the file format's key ordering:
    /// NULL < numeric < TEXT < BLOB.
    fn class_rank(&self) -> u8 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Int(_) | SqlValue::Real(_) => 1,
            SqlValue::Text(_) => 2,
            SqlValue::Blob(_) => 3,
        }
    }

    /// Record-wise collation of a single value.
    ///
    /// Integers and reals compare numerically across classes, text compares
    /// bytewise (the BINARY collation), blobs by unsigned-byte lexicographic
    /// order.  NULLs compare equal to each other and before everything else.
    /// Total: NaN reals are ordered before all other numerics so sorting
    /// never panics on a malformed file.
    pub fn collate(&self, other: &SqlValue) -> Ordering {
        use SqlValue::*;
        let rank = self.class_rank().cmp(&other.class_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Int(a), Int(b)) => a.cmp(b),
            (Real(a), Real(b)) => total_cmp_f64(*a, *b),
            (Int(a), Real(b)) => total_cmp_f64(*a as f64, *b),
            (Real(a), Int(b)) => total_cmp_f64(*a, *b as f64),
            (Text(a), Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Blob(a), Blob(b)) => a.cmp(b),
            _ => unreachable!("class ranks matched"),
        }
    }

    /// Collate two whole keys column by column; a shorter key that is a
    /// prefix of a longer one orders first.
    pub fn collate_keys(a: &[SqlValue], b: &[SqlValue]) -> Ordering {
        for (x, y) in a.iter().zip(b.iter()) {
            let ord = x.collate(y);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.len().cmp(&b.len())
    }
}

fn total_cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| {
        // NaN sorts below every number and equal to itself.
        match (a.is_nan(), b.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => unreachable!(),
        }
    })
}
