//! schema reads the database catalogue out of the schema btree on page 1.
//!
//! Every object lives in a row of the schema table
//! `(type, name, tbl_name, rootpage, sql)`.  The CREATE statement scanner
//! here is deliberately minimal and tolerant: it lifts the column list with
//! balanced-paren scanning, recognizes the handful of constraint words the
//! engine acts on, and ignores everything else.  An unparseable statement
//! catalogues the object by name instead of failing the load.

use std::str::FromStr;
use std::sync::Arc;

use itertools::Itertools;
use log::debug;

use crate::btree::cursor::Cursor;
use crate::btree::RowId;
use crate::pager::{PageNum, PageSource};
use crate::sql_type::SqlType;
use crate::sql_value::SqlValue;

/// The schema btree is rooted at page 1, always.
pub const SCHEMA_ROOT: PageNum = 1;
pub const SCHEMA_TABLE_NAME: &str = "sqlite_schema";
pub const SCHEMA_SQL: &str =
    "CREATE TABLE sqlite_schema (type text, name text, tbl_name text, rootpage integer, sql text)";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Table {0} not found in database.")]
    UnknownTable(String),
    #[error("Index {0} not found in database.")]
    UnknownIndex(String),
    #[error("Column {0} not found in table {1}.")]
    UnknownColumn(String, String),
    #[error("Cannot parse CREATE statement: {0}")]
    Parse(String),
    #[error("Schema row is malformed: {0}")]
    BadRow(&'static str),
    #[error(transparent)]
    Btree(#[from] crate::btree::Error),
    #[error(transparent)]
    Record(#[from] crate::record::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Raw declared type text, e.g. `VARCHAR(20)`; empty when undeclared.
    pub decl_type: String,
    pub sql_type: SqlType,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub root_page: PageNum,
    pub columns: Vec<ColumnInfo>,
    /// Index of an `INTEGER PRIMARY KEY` column, which aliases the rowid.
    pub rowid_alias: Option<usize>,
    pub without_rowid: bool,
    pub sql: String,
}

impl TableInfo {
    /// Resolve a column name, ASCII case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub root_page: PageNum,
    pub columns: Vec<(String, SortOrder)>,
    pub unique: bool,
    pub sql: String,
}

/// Objects catalogued by name only (views, triggers, unparseable rows).
#[derive(Debug, Clone, PartialEq)]
pub struct OtherObject {
    pub kind: String,
    pub name: String,
    pub tbl_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub tables: Vec<TableInfo>,
    pub indices: Vec<IndexInfo>,
    pub others: Vec<OtherObject>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Result<&TableInfo, Error> {
        if name.eq_ignore_ascii_case(SCHEMA_TABLE_NAME) || name.eq_ignore_ascii_case("sqlite_master")
        {
            return Ok(schema_table_info_ref());
        }
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    pub fn index(&self, name: &str) -> Result<&IndexInfo, Error> {
        self.indices
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))
    }

    pub fn indices_of(&self, table: &str) -> Vec<&IndexInfo> {
        self.indices
            .iter()
            .filter(|i| i.table.eq_ignore_ascii_case(table))
            .collect()
    }
}

fn schema_table_info_ref() -> &'static TableInfo {
    use std::sync::OnceLock;
    static INFO: OnceLock<TableInfo> = OnceLock::new();
    INFO.get_or_init(|| {
        parse_create_table(SCHEMA_SQL)
            .map(|mut t| {
                t.root_page = SCHEMA_ROOT;
                t.name = SCHEMA_TABLE_NAME.to_string();
                t
            })
            .expect("schema table DDL parses")
    })
}

/// The catalogue row layout of the schema table itself.
pub fn schema_table_info() -> TableInfo {
    schema_table_info_ref().clone()
}

/// Walk the schema btree and build the catalogue.
pub fn load(source: Arc<dyn PageSource>, usable: u32) -> Result<Schema, Error> {
    let mut schema = Schema::default();
    let mut cur = Cursor::new(source, SCHEMA_ROOT, usable)?;
    while cur.next()? {
        let rec = cur.record()?;
        if rec.column_count() < 5 {
            return Err(Error::BadRow("schema row has fewer than 5 columns"));
        }
        let kind = rec.get_text(0)?.to_string();
        let name = rec.get_text(1)?.to_string();
        let tbl_name = rec.get_text(2)?.to_string();
        // Views store a NULL root page; internal autoindexes a NULL sql.
        let root_page = if rec.is_null(3)? { 0 } else { rec.get_i64(3)? as PageNum };
        let sql = if rec.is_null(4)? {
            String::new()
        } else {
            rec.get_text(4)?.to_string()
        };

        match kind.as_str() {
            "table" => match parse_create_table(&sql) {
                Ok(mut t) => {
                    t.name = name;
                    t.root_page = root_page;
                    t.sql = sql;
                    schema.tables.push(t);
                }
                Err(e) => {
                    debug!("cataloguing table {} without columns: {}", name, e);
                    schema.others.push(OtherObject { kind, name, tbl_name });
                }
            },
            "index" => {
                if sql.is_empty() {
                    // Internal autoindex; key layout is implied, skip it.
                    schema.others.push(OtherObject { kind, name, tbl_name });
                    continue;
                }
                match parse_create_index(&sql) {
                    Ok(mut i) => {
                        i.name = name;
                        i.root_page = root_page;
                        i.sql = sql;
                        schema.indices.push(i);
                    }
                    Err(e) => {
                        debug!("cataloguing index {} without columns: {}", name, e);
                        schema.others.push(OtherObject { kind, name, tbl_name });
                    }
                }
            }
            _ => schema.others.push(OtherObject { kind, name, tbl_name }),
        }
    }
    Ok(schema)
}

/// Encode one schema-table row.
pub fn schema_row(kind: &str, name: &str, tbl_name: &str, root_page: PageNum, sql: &str) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(kind.to_string()),
        SqlValue::Text(name.to_string()),
        SqlValue::Text(tbl_name.to_string()),
        SqlValue::Int(root_page as RowId),
        SqlValue::Text(sql.to_string()),
    ]
}

// ------------------------------------------------------------------
// The permissive CREATE scanner.

/// Words that terminate a column's declared type.
const CONSTRAINT_WORDS: &[&str] = &[
    "PRIMARY", "NOT", "NULL", "UNIQUE", "CHECK", "DEFAULT", "COLLATE", "REFERENCES", "GENERATED",
    "AS", "CONSTRAINT",
];

fn is_constraint_word(w: &str) -> bool {
    CONSTRAINT_WORDS.iter().any(|c| w.eq_ignore_ascii_case(c))
}

/// Strip one layer of identifier quoting: "x", [x], `x`, 'x'.
fn unquote(s: &str) -> String {
    let b = s.as_bytes();
    if b.len() >= 2 {
        let (open, close) = (b[0], b[b.len() - 1]);
        let stripped = match (open, close) {
            (b'"', b'"') | (b'`', b'`') | (b'\'', b'\'') => true,
            (b'[', b']') => true,
            _ => false,
        };
        if stripped {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Split `s` into words.  Quoted identifiers stay one word; a parenthesized
/// group becomes a single word including its parens, so `VARCHAR (20)` and
/// `CHECK (x > 0)` each tokenize into two words.
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for ch in s.chars() {
        if let Some(q) = quote {
            cur.push(ch);
            let closes = match q {
                '[' => ch == ']',
                _ => ch == q,
            };
            if closes {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' | '`' | '[' => {
                quote = Some(ch);
                cur.push(ch);
            }
            '(' => {
                if depth == 0 && !cur.is_empty() {
                    words.push(std::mem::take(&mut cur));
                }
                depth += 1;
                cur.push(ch);
            }
            ')' => {
                cur.push(ch);
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    words.push(std::mem::take(&mut cur));
                }
            }
            c if c.is_whitespace() && depth == 0 => {
                if !cur.is_empty() {
                    words.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        words.push(cur);
    }
    words
}

/// Split on commas at paren depth zero, respecting quotes.
fn split_top_level_commas(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for ch in s.chars() {
        if let Some(q) = quote {
            cur.push(ch);
            let closes = match q {
                '[' => ch == ']',
                _ => ch == q,
            };
            if closes {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' | '`' | '[' => {
                quote = Some(ch);
                cur.push(ch);
            }
            '(' => {
                depth += 1;
                cur.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                cur.push(ch);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut cur)),
            c => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur);
    }
    parts
}

/// Locate the outermost parenthesized body and the text after it.
fn balanced_paren_body(s: &str) -> Result<(&str, &str), Error> {
    let open = s
        .find('(')
        .ok_or_else(|| Error::Parse("no column list".to_string()))?;
    let mut depth = 0usize;
    for (i, ch) in s[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let at = open + i;
                    return Ok((&s[open + 1..at], &s[at + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(Error::Parse("unbalanced parentheses".to_string()))
}

/// Scan a `CREATE TABLE` statement.  The returned `TableInfo` has no root
/// page; the caller fills in name (from the catalogue row), root and sql.
pub fn parse_create_table(sql: &str) -> Result<TableInfo, Error> {
    let head_words = split_words(sql);
    if head_words.len() < 3
        || !head_words[0].eq_ignore_ascii_case("CREATE")
        || !head_words[1].eq_ignore_ascii_case("TABLE")
    {
        return Err(Error::Parse("not a CREATE TABLE statement".to_string()));
    }
    let name = object_name(&head_words, 2)?;
    let (body, tail) = balanced_paren_body(sql)?;
    let tail_words = split_words(tail);
    let without_rowid = tail_words
        .windows(2)
        .any(|w| w[0].eq_ignore_ascii_case("WITHOUT") && w[1].eq_ignore_ascii_case("ROWID"));

    let mut columns: Vec<ColumnInfo> = Vec::new();
    let mut table_pk: Vec<String> = Vec::new();

    for item in split_top_level_commas(body) {
        let words = split_words(item.trim());
        if words.is_empty() {
            continue;
        }
        let first = words[0].to_ascii_uppercase();
        match first.as_str() {
            "PRIMARY" => {
                // PRIMARY KEY (a, b DESC)
                if let Some(group) = words.iter().find(|w| w.starts_with('(')) {
                    let inner = &group[1..group.len() - 1];
                    for col in split_top_level_commas(inner) {
                        let cw = split_words(col.trim());
                        if let Some(name) = cw.first() {
                            table_pk.push(unquote(name));
                        }
                    }
                }
            }
            // Other table-level constraints carry nothing the engine acts on.
            "UNIQUE" | "CHECK" | "FOREIGN" | "CONSTRAINT" => {}
            _ => {
                let name = unquote(&words[0]);
                let type_words: Vec<&String> = words[1..]
                    .iter()
                    .take_while(|w| !is_constraint_word(w) && !w.starts_with('('))
                    .collect();
                // Re-attach a size group like (20) to the type text.
                let mut type_end = 1 + type_words.len();
                let mut decl_type = type_words.iter().join(" ");
                if let Some(group) = words.get(type_end) {
                    if group.starts_with('(') && !type_words.is_empty() {
                        decl_type.push_str(group);
                        type_end += 1;
                    }
                }
                let rest: Vec<String> = words[type_end..]
                    .iter()
                    .map(|w| w.to_ascii_uppercase())
                    .collect();
                let primary_key = rest.windows(2).any(|w| w[0] == "PRIMARY" && w[1] == "KEY");
                let not_null = rest.windows(2).any(|w| w[0] == "NOT" && w[1] == "NULL");
                let sql_type = SqlType::from_str(&decl_type).unwrap_or(SqlType::Any);
                columns.push(ColumnInfo {
                    name,
                    decl_type,
                    sql_type,
                    not_null,
                    primary_key,
                });
            }
        }
    }

    if columns.is_empty() {
        return Err(Error::Parse("no columns found".to_string()));
    }

    for pk in &table_pk {
        if let Some(c) = columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(pk))
        {
            c.primary_key = true;
        }
    }

    // An INTEGER PRIMARY KEY column aliases the rowid, unless the table has
    // no rowid at all.  The declared type must be exactly INTEGER.
    let pk_cols: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.primary_key)
        .map(|(i, _)| i)
        .collect();
    let rowid_alias = if !without_rowid
        && pk_cols.len() == 1
        && columns[pk_cols[0]].decl_type.eq_ignore_ascii_case("INTEGER")
    {
        Some(pk_cols[0])
    } else {
        None
    };

    Ok(TableInfo {
        name,
        root_page: 0,
        columns,
        rowid_alias,
        without_rowid,
        sql: sql.to_string(),
    })
}

/// Object name at `at` in a CREATE statement's words, skipping
/// `IF NOT EXISTS` and a `main.`-style schema qualifier.  The column list
/// may be glued to the name (`CREATE TABLE t(...)`), in which case
/// `split_words` has already cut it off at the paren.
fn object_name(words: &[String], mut at: usize) -> Result<String, Error> {
    if words.get(at).is_some_and(|w| w.eq_ignore_ascii_case("IF"))
        && words.get(at + 1).is_some_and(|w| w.eq_ignore_ascii_case("NOT"))
        && words.get(at + 2).is_some_and(|w| w.eq_ignore_ascii_case("EXISTS"))
    {
        at += 3;
    }
    let raw = words
        .get(at)
        .ok_or_else(|| Error::Parse("statement names no object".to_string()))?;
    let unqualified = raw.rsplit('.').next().unwrap_or(raw.as_str());
    let name = unquote(unqualified);
    if name.is_empty() || name.starts_with('(') {
        return Err(Error::Parse("statement names no object".to_string()));
    }
    Ok(name)
}

/// Scan a `CREATE INDEX` statement.
pub fn parse_create_index(sql: &str) -> Result<IndexInfo, Error> {
    let words = split_words(sql);
    if words.is_empty() || !words[0].eq_ignore_ascii_case("CREATE") {
        return Err(Error::Parse("not a CREATE statement".to_string()));
    }
    let unique = words.get(1).is_some_and(|w| w.eq_ignore_ascii_case("UNIQUE"));
    let idx_kw = if unique { 2 } else { 1 };
    if !words
        .get(idx_kw)
        .is_some_and(|w| w.eq_ignore_ascii_case("INDEX"))
    {
        return Err(Error::Parse("not a CREATE INDEX statement".to_string()));
    }
    let name = object_name(&words, idx_kw + 1)?;
    let on_at = words
        .iter()
        .position(|w| w.eq_ignore_ascii_case("ON"))
        .ok_or_else(|| Error::Parse("CREATE INDEX without ON".to_string()))?;
    let table = words
        .get(on_at + 1)
        .map(|w| unquote(w))
        .ok_or_else(|| Error::Parse("CREATE INDEX without table".to_string()))?;

    let (body, _) = balanced_paren_body(&sql[sql.to_ascii_uppercase().find(" ON ").map(|i| i + 4).unwrap_or(0)..])?;
    let mut columns = Vec::new();
    for item in split_top_level_commas(body) {
        let cw = split_words(item.trim());
        if cw.is_empty() {
            continue;
        }
        let order = if cw.iter().any(|w| w.eq_ignore_ascii_case("DESC")) {
            SortOrder::Desc
        } else {
            SortOrder::Asc
        };
        columns.push((unquote(&cw[0]), order));
    }
    if columns.is_empty() {
        return Err(Error::Parse("index has no columns".to_string()));
    }
    Ok(IndexInfo {
        name,
        table,
        root_page: 0,
        columns,
        unique,
        sql: sql.to_string(),
    })
}
