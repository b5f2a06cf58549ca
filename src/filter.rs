//! filter is a compiled predicate tree evaluated against records without
//! materializing rows.
//!
//! A [`Filter`] names columns; binding it to a table resolves every name to a
//! column index (or the rowid) once, so evaluation inside a scan does no
//! string work.  Evaluation follows SQL three-valued logic internally and
//! collapses to two-valued at the root: NULL means the row does not match.

use crate::btree::RowId;
use crate::record::RecordView;
use crate::schema::TableInfo;
use crate::sql_value::SqlValue;
use std::cmp::Ordering;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Column {0} not found in table {1}.")]
    UnknownColumn(String, String),
    #[error(transparent)]
    Record(#[from] crate::record::Error),
}

/// An unbound predicate tree.  Build with the constructor helpers:
///
/// ```
/// use sharcdb::filter::Filter;
/// let f = Filter::column("age").ge(Filter::literal(18))
///     .and(Filter::column("name").starts_with("a"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Column(String),
    Literal(SqlValue),
    IsNull(Box<Filter>),
    Eq(Box<Filter>, Box<Filter>),
    Ne(Box<Filter>, Box<Filter>),
    Lt(Box<Filter>, Box<Filter>),
    Le(Box<Filter>, Box<Filter>),
    Gt(Box<Filter>, Box<Filter>),
    Ge(Box<Filter>, Box<Filter>),
    Between(Box<Filter>, Box<Filter>, Box<Filter>),
    In(Box<Filter>, Vec<SqlValue>),
    StartsWith(Box<Filter>, String),
    Contains(Box<Filter>, String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn column(name: impl Into<String>) -> Filter {
        Filter::Column(name.into())
    }

    pub fn literal(v: impl Into<SqlValue>) -> Filter {
        Filter::Literal(v.into())
    }

    pub fn is_null(self) -> Filter {
        Filter::IsNull(Box::new(self))
    }

    pub fn eq(self, rhs: Filter) -> Filter {
        Filter::Eq(Box::new(self), Box::new(rhs))
    }

    pub fn ne(self, rhs: Filter) -> Filter {
        Filter::Ne(Box::new(self), Box::new(rhs))
    }

    pub fn lt(self, rhs: Filter) -> Filter {
        Filter::Lt(Box::new(self), Box::new(rhs))
    }

    pub fn le(self, rhs: Filter) -> Filter {
        Filter::Le(Box::new(self), Box::new(rhs))
    }

    pub fn gt(self, rhs: Filter) -> Filter {
        Filter::Gt(Box::new(self), Box::new(rhs))
    }

    pub fn ge(self, rhs: Filter) -> Filter {
        Filter::Ge(Box::new(self), Box::new(rhs))
    }

    pub fn between(self, lo: impl Into<SqlValue>, hi: impl Into<SqlValue>) -> Filter {
        Filter::Between(
            Box::new(self),
            Box::new(Filter::Literal(lo.into())),
            Box::new(Filter::Literal(hi.into())),
        )
    }

    pub fn in_set(self, set: impl IntoIterator<Item = SqlValue>) -> Filter {
        Filter::In(Box::new(self), set.into_iter().collect())
    }

    pub fn starts_with(self, prefix: impl Into<String>) -> Filter {
        Filter::StartsWith(Box::new(self), prefix.into())
    }

    pub fn contains(self, needle: impl Into<String>) -> Filter {
        Filter::Contains(Box::new(self), needle.into())
    }

    pub fn and(self, rhs: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Resolve every column name against `table`.  The rowid pseudo-columns
    /// `rowid`, `_rowid_` and `oid` bind to the rowid, as does the table's
    /// `INTEGER PRIMARY KEY` alias column.
    pub fn bind(&self, table: &TableInfo) -> Result<BoundFilter, Error> {
        let node = self.bind_node(table)?;
        Ok(BoundFilter { node })
    }

    fn bind_node(&self, table: &TableInfo) -> Result<Node, Error> {
        use Filter::*;
        Ok(match self {
            Column(name) => Node::Operand(bind_column(name, table)?),
            Literal(v) => Node::Operand(Operand::Literal(v.clone())),
            IsNull(e) => Node::IsNull(Box::new(e.bind_node(table)?)),
            Eq(a, b) => Node::Cmp(CmpOp::Eq, bx(a, table)?, bx(b, table)?),
            Ne(a, b) => Node::Cmp(CmpOp::Ne, bx(a, table)?, bx(b, table)?),
            Lt(a, b) => Node::Cmp(CmpOp::Lt, bx(a, table)?, bx(b, table)?),
            Le(a, b) => Node::Cmp(CmpOp::Le, bx(a, table)?, bx(b, table)?),
            Gt(a, b) => Node::Cmp(CmpOp::Gt, bx(a, table)?, bx(b, table)?),
            Ge(a, b) => Node::Cmp(CmpOp::Ge, bx(a, table)?, bx(b, table)?),
            Between(e, lo, hi) => Node::Between(bx(e, table)?, bx(lo, table)?, bx(hi, table)?),
            In(e, set) => Node::In(bx(e, table)?, set.clone()),
            StartsWith(e, p) => Node::StartsWith(bx(e, table)?, p.clone()),
            Contains(e, n) => Node::Contains(bx(e, table)?, n.clone()),
            And(a, b) => Node::And(bx(a, table)?, bx(b, table)?),
            Or(a, b) => Node::Or(bx(a, table)?, bx(b, table)?),
            Not(e) => Node::Not(bx(e, table)?),
        })
    }
}

fn bx(f: &Filter, table: &TableInfo) -> Result<Box<Node>, Error> {
    Ok(Box::new(f.bind_node(table)?))
}

fn bind_column(name: &str, table: &TableInfo) -> Result<Operand, Error> {
    if let Some(idx) = table.column_index(name) {
        if table.rowid_alias == Some(idx) {
            return Ok(Operand::Rowid);
        }
        return Ok(Operand::Column(idx));
    }
    let lowered = name.to_ascii_lowercase();
    if !table.without_rowid && matches!(lowered.as_str(), "rowid" | "_rowid_" | "oid") {
        return Ok(Operand::Rowid);
    }
    Err(Error::UnknownColumn(
        name.to_string(),
        table.name.clone(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Operand {
    Column(usize),
    Rowid,
    Literal(SqlValue),
}

#[derive(Debug, Clone)]
enum Node {
    Operand(Operand),
    IsNull(Box<Node>),
    Cmp(CmpOp, Box<Node>, Box<Node>),
    Between(Box<Node>, Box<Node>, Box<Node>),
    In(Box<Node>, Vec<SqlValue>),
    StartsWith(Box<Node>, String),
    Contains(Box<Node>, String),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
}

/// A filter with every column resolved, ready to run inside a scan.
#[derive(Debug, Clone)]
pub struct BoundFilter {
    node: Node,
}

impl BoundFilter {
    /// Two-valued verdict for one row: an unknown (NULL) result is a
    /// non-match.
    pub fn matches(&self, rec: &RecordView<'_>, rowid: Option<RowId>) -> Result<bool, Error> {
        Ok(self.node.truth(rec, rowid)? == Some(true))
    }
}

impl Node {
    fn value(&self, rec: &RecordView<'_>, rowid: Option<RowId>) -> Result<SqlValue, Error> {
        match self {
            Node::Operand(Operand::Literal(v)) => Ok(v.clone()),
            Node::Operand(Operand::Rowid) => {
                Ok(rowid.map(SqlValue::Int).unwrap_or(SqlValue::Null))
            }
            Node::Operand(Operand::Column(idx)) => Ok(rec.value(*idx)?),
            // A nested predicate used as a value contributes its truth value.
            other => Ok(match other.truth(rec, rowid)? {
                None => SqlValue::Null,
                Some(b) => SqlValue::Int(b as i64),
            }),
        }
    }

    fn truth(&self, rec: &RecordView<'_>, rowid: Option<RowId>) -> Result<Option<bool>, Error> {
        use Node::*;
        Ok(match self {
            Operand(_) => {
                // A bare value is truthy when non-NULL and non-zero.
                match self.value(rec, rowid)? {
                    SqlValue::Null => None,
                    SqlValue::Int(i) => Some(i != 0),
                    SqlValue::Real(f) => Some(f != 0.0),
                    _ => Some(true),
                }
            }
            IsNull(e) => Some(e.value(rec, rowid)? == SqlValue::Null),
            Cmp(op, a, b) => {
                let av = a.value(rec, rowid)?;
                let bv = b.value(rec, rowid)?;
                compare(*op, &av, &bv)
            }
            Between(e, lo, hi) => {
                let v = e.value(rec, rowid)?;
                let lo = lo.value(rec, rowid)?;
                let hi = hi.value(rec, rowid)?;
                and3(compare(CmpOp::Ge, &v, &lo), compare(CmpOp::Le, &v, &hi))
            }
            In(e, set) => {
                let v = e.value(rec, rowid)?;
                if v == SqlValue::Null {
                    None
                } else if set
                    .iter()
                    .any(|m| *m != SqlValue::Null && v.collate(m) == Ordering::Equal)
                {
                    Some(true)
                } else if set.iter().any(|m| *m == SqlValue::Null) {
                    // Not found, but a NULL member makes the answer unknown.
                    None
                } else {
                    Some(false)
                }
            }
            StartsWith(e, prefix) => match e.value(rec, rowid)? {
                SqlValue::Null => None,
                SqlValue::Text(s) => Some(s.starts_with(prefix.as_str())),
                _ => Some(false),
            },
            Contains(e, needle) => match e.value(rec, rowid)? {
                SqlValue::Null => None,
                SqlValue::Text(s) => Some(s.contains(needle.as_str())),
                _ => Some(false),
            },
            And(a, b) => and3(a.truth(rec, rowid)?, b.truth(rec, rowid)?),
            Or(a, b) => or3(a.truth(rec, rowid)?, b.truth(rec, rowid)?),
            Not(e) => e.truth(rec, rowid)?.map(|b| !b),
        })
    }
}

/// Three-valued comparison.  NULL on either side is unknown; otherwise values
/// compare by the same collation the index btrees use, so integers and reals
/// compare numerically and cross-class operands order by storage class.
fn compare(op: CmpOp, a: &SqlValue, b: &SqlValue) -> Option<bool> {
    if *a == SqlValue::Null || *b == SqlValue::Null {
        return None;
    }
    let ord = a.collate(b);
    Some(match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    })
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}
