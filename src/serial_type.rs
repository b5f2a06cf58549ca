//! Serial types are how SQLite stores values inside records.
//!
//! Each column in a record is tagged with a serial-type code in the record
//! header.  Summarizing the format:
//!
//! | Code      | Content size | Meaning |
//! |-----------|--------------|---------|
//! | 0         | 0            | NULL |
//! | 1..6      | 1,2,3,4,6,8  | big-endian twos-complement integer |
//! | 7         | 8            | big-endian IEEE 754 double |
//! | 8, 9      | 0            | the literals 0 and 1 |
//! | 10, 11    | (error)      | reserved; never valid on disk |
//! | N≥12 even | (N-12)/2     | BLOB |
//! | N≥13 odd  | (N-13)/2     | TEXT |

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::sql_value::SqlValue;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Serial type code {0} is reserved and never appears in a well-formed file.")]
    ReservedCode(i64),
    #[error("Serial type code {0} is not valid.")]
    InvalidCode(i64),
    #[error("Value bytes are shorter than serial type {0} requires.")]
    ShortValue(i64),
    #[error("Bytes were not valid UTF-8 text.")]
    InvalidText(#[from] std::string::FromUtf8Error),
}

/// Number of payload bytes a value with serial type `code` occupies.
///
/// The reserved codes 10 and 11 fail, as does any negative code.
pub fn content_size(code: i64) -> Result<usize, Error> {
    match code {
        0 | 8 | 9 => Ok(0),
        1 => Ok(1),
        2 => Ok(2),
        3 => Ok(3),
        4 => Ok(4),
        5 => Ok(6),
        6 | 7 => Ok(8),
        10 | 11 => Err(Error::ReservedCode(code)),
        x if x >= 12 => Ok(((x as usize) - 12 - (x % 2) as usize) / 2),
        x => Err(Error::InvalidCode(x)),
    }
}

/// Deserialize `data` tagged with `code` into a [`SqlValue`].
///
/// `data` must hold exactly the bytes of this one value (use
/// [`content_size`] to slice them out of a record body).
pub fn read_value(code: i64, data: &[u8]) -> Result<SqlValue, Error> {
    use SqlValue::*;
    let need = content_size(code)?;
    if data.len() < need {
        return Err(Error::ShortValue(code));
    }
    let mut c = std::io::Cursor::new(data);
    let short = |_| Error::ShortValue(code);
    match code {
        0 => Ok(Null),
        1 => Ok(Int(c.read_i8().map_err(short)? as i64)),
        2 => Ok(Int(c.read_i16::<BigEndian>().map_err(short)? as i64)),
        3 => Ok(Int(read_i24(data))),
        4 => Ok(Int(c.read_i32::<BigEndian>().map_err(short)? as i64)),
        5 => Ok(Int(read_i48(data))),
        6 => Ok(Int(c.read_i64::<BigEndian>().map_err(short)?)),
        7 => Ok(Real(c.read_f64::<BigEndian>().map_err(short)?)),
        8 => Ok(Int(0)),
        9 => Ok(Int(1)),
        x if x >= 12 && x % 2 == 0 => Ok(Blob(data[..need].to_vec())),
        x if x >= 13 => Ok(Text(String::from_utf8(data[..need].to_vec())?)),
        x => Err(Error::InvalidCode(x)),
    }
}

/// Read an integer column as i64 without building a `SqlValue`.
/// Used on hot paths (rowid-alias columns, index rowid suffix).
pub fn read_int(code: i64, data: &[u8]) -> Result<i64, Error> {
    match read_value(code, data)? {
        SqlValue::Int(i) => Ok(i),
        SqlValue::Real(f) => Ok(f as i64),
        _ => Err(Error::InvalidCode(code)),
    }
}

fn read_i24(data: &[u8]) -> i64 {
    let mut bytes = [0u8; 4];
    bytes[1..4].copy_from_slice(&data[..3]);
    // Sign-extend from bit 23.
    bytes[0] = if bytes[1] & 0x80 != 0 { 0xff } else { 0 };
    i32::from_be_bytes(bytes) as i64
}

fn read_i48(data: &[u8]) -> i64 {
    let mut bytes = [0u8; 8];
    bytes[2..8].copy_from_slice(&data[..6]);
    let fill = if bytes[2] & 0x80 != 0 { 0xff } else { 0 };
    bytes[0] = fill;
    bytes[1] = fill;
    i64::from_be_bytes(bytes)
}

/// Choose the smallest serial type that can represent `value`.
///
/// Integers pick the narrowest twos-complement width; 0 and 1 use the
/// zero-length literal codes, which requires schema format 4 (the only
/// format this engine writes).
pub fn pick_serial_type(value: &SqlValue) -> i64 {
    match value {
        SqlValue::Null => 0,
        SqlValue::Int(0) => 8,
        SqlValue::Int(1) => 9,
        SqlValue::Int(i) => {
            let i = *i;
            if (-0x80..0x80).contains(&i) {
                1
            } else if (-0x8000..0x8000).contains(&i) {
                2
            } else if (-0x0080_0000..0x0080_0000).contains(&i) {
                3
            } else if (-0x8000_0000_i64..0x8000_0000).contains(&i) {
                4
            } else if (-0x8000_0000_0000_i64..0x8000_0000_0000).contains(&i) {
                5
            } else {
                6
            }
        }
        SqlValue::Real(_) => 7,
        SqlValue::Blob(b) => 12 + 2 * b.len() as i64,
        SqlValue::Text(s) => 13 + 2 * s.len() as i64,
    }
}

/// Serialize `value` under the serial type [`pick_serial_type`] chose for it.
/// Appends to `out` and returns the number of bytes written.
pub fn write_value(out: &mut Vec<u8>, value: &SqlValue) -> usize {
    let before = out.len();
    match value {
        SqlValue::Null => {}
        SqlValue::Int(0) | SqlValue::Int(1) => {}
        SqlValue::Int(i) => {
            let i = *i;
            match pick_serial_type(value) {
                1 => out.write_i8(i as i8).unwrap(),
                2 => out.write_i16::<BigEndian>(i as i16).unwrap(),
                3 => out.extend_from_slice(&i32::to_be_bytes(i as i32)[1..4]),
                4 => out.write_i32::<BigEndian>(i as i32).unwrap(),
                5 => out.extend_from_slice(&i64::to_be_bytes(i)[2..8]),
                6 => out.write_i64::<BigEndian>(i).unwrap(),
                _ => unreachable!("integer serial types are 1..=6"),
            }
        }
        SqlValue::Real(f) => out.write_f64::<BigEndian>(*f).unwrap(),
        SqlValue::Text(s) => out.extend_from_slice(s.as_bytes()),
        SqlValue::Blob(b) => out.extend_from_slice(b),
    }
    out.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;
    use SqlValue::*;

    #[test]
    fn test_content_sizes() {
        assert_eq!(content_size(0).unwrap(), 0);
        assert_eq!(content_size(1).unwrap(), 1);
        assert_eq!(content_size(5).unwrap(), 6);
        assert_eq!(content_size(6).unwrap(), 8);
        assert_eq!(content_size(7).unwrap(), 8);
        assert_eq!(content_size(8).unwrap(), 0);
        assert_eq!(content_size(12).unwrap(), 0); // empty blob
        assert_eq!(content_size(13).unwrap(), 0); // empty string
        assert_eq!(content_size(18).unwrap(), 3);
        assert_eq!(content_size(19).unwrap(), 3);
    }

    #[test]
    fn test_reserved_codes_fail() {
        assert_eq!(content_size(10), Err(Error::ReservedCode(10)));
        assert_eq!(content_size(11), Err(Error::ReservedCode(11)));
        assert!(read_value(10, &[]).is_err());
        assert!(content_size(-1).is_err());
    }

    #[test]
    fn test_read_integers() {
        assert_eq!(read_value(1, &[0x7f]).unwrap(), Int(127));
        assert_eq!(read_value(1, &[0xff]).unwrap(), Int(-1));
        assert_eq!(read_value(2, &[0x01, 0x00]).unwrap(), Int(256));
        assert_eq!(read_value(3, &[0xff, 0xff, 0xff]).unwrap(), Int(-1));
        assert_eq!(read_value(3, &[0x01, 0x00, 0x00]).unwrap(), Int(65536));
        assert_eq!(
            read_value(5, &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]).unwrap(),
            Int(-1)
        );
        assert_eq!(
            read_value(5, &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00]).unwrap(),
            Int(1 << 16)
        );
        assert_eq!(
            read_value(6, &0x1122_3344_5566_7788_i64.to_be_bytes()).unwrap(),
            Int(0x1122_3344_5566_7788)
        );
        assert_eq!(read_value(8, &[]).unwrap(), Int(0));
        assert_eq!(read_value(9, &[]).unwrap(), Int(1));
    }

    #[test]
    fn test_read_real_text_blob() {
        assert_eq!(
            read_value(7, &3.5_f64.to_be_bytes()).unwrap(),
            Real(3.5)
        );
        assert_eq!(read_value(19, b"Foo").unwrap(), Text("Foo".to_string()));
        assert_eq!(
            read_value(18, &[0, 1, 255]).unwrap(),
            Blob(vec![0, 1, 255])
        );
        assert_eq!(read_value(13, b"").unwrap(), Text(String::new()));
    }

    #[test]
    fn test_pick_smallest_type() {
        assert_eq!(pick_serial_type(&Null), 0);
        assert_eq!(pick_serial_type(&Int(0)), 8);
        assert_eq!(pick_serial_type(&Int(1)), 9);
        assert_eq!(pick_serial_type(&Int(2)), 1);
        assert_eq!(pick_serial_type(&Int(-1)), 1);
        assert_eq!(pick_serial_type(&Int(127)), 1);
        assert_eq!(pick_serial_type(&Int(128)), 2);
        assert_eq!(pick_serial_type(&Int(-129)), 2);
        assert_eq!(pick_serial_type(&Int(1 << 20)), 3);
        assert_eq!(pick_serial_type(&Int(1 << 25)), 4);
        assert_eq!(pick_serial_type(&Int(1 << 40)), 5);
        assert_eq!(pick_serial_type(&Int(i64::MAX)), 6);
        assert_eq!(pick_serial_type(&Int(i64::MIN)), 6);
        assert_eq!(pick_serial_type(&Real(0.0)), 7);
        assert_eq!(pick_serial_type(&Text("abc".into())), 19);
        assert_eq!(pick_serial_type(&Blob(vec![1, 2, 3])), 18);
    }

    #[test]
    fn test_write_read_round_trip() {
        let values = vec![
            Null,
            Int(0),
            Int(1),
            Int(-1),
            Int(300),
            Int(-70_000),
            Int(1 << 33),
            Int(i64::MAX),
            Int(i64::MIN),
            Real(3.25),
            Real(-0.0),
            Text("héllo".into()),
            Blob(vec![0xde, 0xad, 0xbe, 0xef]),
        ];
        for v in values {
            let code = pick_serial_type(&v);
            let mut buf = Vec::new();
            let n = write_value(&mut buf, &v);
            assert_eq!(n, content_size(code).unwrap(), "size for {v:?}");
            assert_eq!(read_value(code, &buf).unwrap(), v, "round trip {v:?}");
        }
    }
}
