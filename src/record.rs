//! Btree cells hold records, which contain table rows and index keys.
//!
//! A record is a header and a body.  The header begins with a varint giving
//! the total header length (itself included), followed by one serial-type
//! varint per column; the body concatenates the column values in order.

use crate::serial_type;
use crate::sql_value::SqlValue;
use crate::varint;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Record header is malformed: {0}")]
    BadHeader(&'static str),
    #[error(transparent)]
    Varint(#[from] varint::Error),
    #[error(transparent)]
    SerialType(#[from] serial_type::Error),
    #[error("Record body is shorter than its header declares.")]
    ShortBody,
    #[error("Column {index} out of range for a record of {count} columns.")]
    ColumnOutOfRange { index: usize, count: usize },
    #[error("Column {index} holds {actual}, not the requested type.")]
    WrongType { index: usize, actual: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnSlot {
    serial_type: i64,
    offset: usize,
    len: usize,
}

/// A decoded view over one record.  Column access is zero-copy: accessors
/// hand out slices of the payload the view was parsed from.
#[derive(Debug)]
pub struct RecordView<'a> {
    payload: &'a [u8],
    slots: Vec<ColumnSlot>,
}

impl<'a> RecordView<'a> {
    /// Parse the record header and lay out the column slots.
    ///
    /// `payload` must be the complete record; a spilled record is assembled
    /// from its overflow chain before it gets here.
    pub fn parse(payload: &'a [u8]) -> Result<RecordView<'a>, Error> {
        let (header_len, n) = varint::decode(payload)?;
        let header_len = header_len as usize;
        if header_len < n || header_len > payload.len() {
            return Err(Error::BadHeader("header length out of range"));
        }
        let mut slots = Vec::new();
        let mut at = n;
        let mut body_at = header_len;
        while at < header_len {
            let (code, used) = varint::decode_i64(&payload[at..header_len])?;
            at += used;
            let len = serial_type::content_size(code)?;
            slots.push(ColumnSlot {
                serial_type: code,
                offset: body_at,
                len,
            });
            body_at += len;
        }
        if body_at > payload.len() {
            return Err(Error::ShortBody);
        }
        Ok(RecordView { payload, slots })
    }

    pub fn column_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<ColumnSlot, Error> {
        self.slots.get(index).copied().ok_or(Error::ColumnOutOfRange {
            index,
            count: self.slots.len(),
        })
    }

    pub fn serial_type(&self, index: usize) -> Result<i64, Error> {
        Ok(self.slot(index)?.serial_type)
    }

    /// The raw value bytes of a column, exactly as stored.
    pub fn get_raw(&self, index: usize) -> Result<&'a [u8], Error> {
        let s = self.slot(index)?;
        Ok(&self.payload[s.offset..s.offset + s.len])
    }

    pub fn is_null(&self, index: usize) -> Result<bool, Error> {
        Ok(self.slot(index)?.serial_type == 0)
    }

    pub fn get_i64(&self, index: usize) -> Result<i64, Error> {
        match self.value(index)? {
            SqlValue::Int(i) => Ok(i),
            v => Err(Error::WrongType {
                index,
                actual: class_name(&v),
            }),
        }
    }

    pub fn get_f64(&self, index: usize) -> Result<f64, Error> {
        match self.value(index)? {
            SqlValue::Real(f) => Ok(f),
            SqlValue::Int(i) => Ok(i as f64),
            v => Err(Error::WrongType {
                index,
                actual: class_name(&v),
            }),
        }
    }

    /// Borrowed text; fails on non-text columns and invalid UTF-8.
    pub fn get_text(&self, index: usize) -> Result<&'a str, Error> {
        let s = self.slot(index)?;
        if s.serial_type < 13 || s.serial_type % 2 == 0 {
            return Err(Error::WrongType {
                index,
                actual: serial_class_name(s.serial_type),
            });
        }
        std::str::from_utf8(&self.payload[s.offset..s.offset + s.len])
            .map_err(|_| Error::BadHeader("text column is not valid UTF-8"))
    }

    pub fn get_blob(&self, index: usize) -> Result<&'a [u8], Error> {
        let s = self.slot(index)?;
        if s.serial_type < 12 || s.serial_type % 2 != 0 {
            return Err(Error::WrongType {
                index,
                actual: serial_class_name(s.serial_type),
            });
        }
        Ok(&self.payload[s.offset..s.offset + s.len])
    }

    /// Decode one column into an owned [`SqlValue`].
    pub fn value(&self, index: usize) -> Result<SqlValue, Error> {
        let s = self.slot(index)?;
        Ok(serial_type::read_value(
            s.serial_type,
            &self.payload[s.offset..s.offset + s.len],
        )?)
    }

    /// Decode every column.  Index-key comparison and row materialization
    /// use this; filters go column-at-a-time instead.
    pub fn values(&self) -> Result<Vec<SqlValue>, Error> {
        (0..self.slots.len()).map(|i| self.value(i)).collect()
    }
}

fn class_name(v: &SqlValue) -> &'static str {
    match v {
        SqlValue::Null => "NULL",
        SqlValue::Int(_) => "INTEGER",
        SqlValue::Real(_) => "REAL",
        SqlValue::Text(_) => "TEXT",
        SqlValue::Blob(_) => "BLOB",
    }
}

fn serial_class_name(code: i64) -> &'static str {
    match code {
        0 => "NULL",
        1..=6 | 8 | 9 => "INTEGER",
        7 => "REAL",
        x if x >= 13 && x % 2 == 1 => "TEXT",
        x if x >= 12 => "BLOB",
        _ => "invalid",
    }
}

/// Encode `values` into record format, choosing the smallest serial type for
/// each column.
pub fn encode(values: &[SqlValue]) -> Vec<u8> {
    let mut types = Vec::with_capacity(values.len());
    let mut types_len = 0;
    for v in values {
        let code = serial_type::pick_serial_type(v);
        types_len += varint::encoded_len(code as u64);
        types.push(code);
    }
    // The header length varint counts itself; one byte almost always
    // suffices, but bump it if the total crosses a varint length boundary.
    let mut header_len = types_len + 1;
    if varint::encoded_len(header_len as u64) > 1 {
        header_len = types_len + varint::encoded_len((types_len + 2) as u64);
    }

    let mut out = Vec::with_capacity(header_len + 16);
    let mut buf = [0u8; varint::MAX_VARINT_LEN];
    let n = varint::encode(&mut buf, header_len as u64);
    out.extend_from_slice(&buf[..n]);
    for code in &types {
        let n = varint::encode(&mut buf, *code as u64);
        out.extend_from_slice(&buf[..n]);
    }
    debug_assert_eq!(out.len(), header_len);
    for v in values {
        serial_type::write_value(&mut out, v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use SqlValue::*;

    #[test]
    fn test_parse_literal_one() {
        // 2-byte header, serial type 9 (literal 1), empty body.
        let rec = [0x02u8, 0x09];
        let view = RecordView::parse(&rec).unwrap();
        assert_eq!(view.column_count(), 1);
        assert_eq!(view.value(0).unwrap(), Int(1));
    }

    #[test]
    fn test_parse_various_types() {
        // literal 0 | literal 1 | float 3.1415 | "Ten" | NULL
        let rec: &[u8] = &[
            0x06, 0x08, 0x09, 0x07, 0x13, 0x00, 0x40, 0x09, 0x21, 0xca, 0xc0, 0x83, 0x12, 0x6f,
            0x54, 0x65, 0x6e,
        ];
        let view = RecordView::parse(rec).unwrap();
        assert_eq!(view.column_count(), 5);
        assert_eq!(view.value(0).unwrap(), Int(0));
        assert_eq!(view.value(1).unwrap(), Int(1));
        assert!(matches!(view.value(2).unwrap(), Real(f) if (f - 3.1415).abs() < 1e-9));
        assert_eq!(view.get_text(3).unwrap(), "Ten");
        assert!(view.is_null(4).unwrap());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let rows: Vec<Vec<SqlValue>> = vec![
            vec![],
            vec![Null],
            vec![Int(0), Int(1), Int(-1)],
            vec![Int(i64::MAX), Int(i64::MIN)],
            vec![Real(2.5), Text("héllo".into()), Blob(vec![1, 2, 3])],
            vec![Null, Int(42), Text(String::new()), Blob(vec![])],
            vec![Text("世界".into())],
        ];
        for row in rows {
            let bytes = encode(&row);
            let view = RecordView::parse(&bytes).unwrap();
            assert_eq!(view.values().unwrap(), row, "round trip {row:?}");
            // Re-encoding is byte-identical.
            assert_eq!(encode(&view.values().unwrap()), bytes);
        }
    }

    #[test]
    fn test_encode_long_record_header() {
        // Enough columns that the header-length varint needs two bytes.
        let row: Vec<SqlValue> = (0..200).map(|i| Int(i)).collect();
        let bytes = encode(&row);
        let view = RecordView::parse(&bytes).unwrap();
        assert_eq!(view.values().unwrap(), row);
    }

    #[test]
    fn test_typed_accessor_mismatches() {
        let bytes = encode(&[Int(5), Text("x".into())]);
        let view = RecordView::parse(&bytes).unwrap();
        assert!(view.get_text(0).is_err());
        assert!(view.get_blob(1).is_err());
        assert_eq!(view.get_i64(0).unwrap(), 5);
        assert!(matches!(
            view.value(9),
            Err(Error::ColumnOutOfRange { index: 9, count: 2 })
        ));
    }

    #[test]
    fn test_short_body_is_error() {
        // Header says one 4-byte int but the body has 2 bytes.
        let rec = [0x02u8, 0x04, 0x00, 0x01];
        assert!(RecordView::parse(&rec).is_err());
    }

    #[test]
    fn test_reserved_serial_type_rejected() {
        let rec = [0x02u8, 0x0a];
        assert!(RecordView::parse(&rec).is_err());
    }
}
