//! The 1..9-byte big-endian varint encoding used throughout the file format.
//!
//! Bytes one through eight each contribute their low seven bits, with the
//! high bit set while more bytes follow; a ninth byte, when reached,
//! contributes all eight of its bits for a 64-bit total.  Signed values are
//! the same bits reinterpreted as twos-complement i64, so negative numbers
//! always take nine bytes.

pub const MAX_VARINT_LEN: usize = 9;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Varint ends before its continuation bits do.")]
    Truncated,
}

/// Decode the varint starting at `buf[0]`, returning the value and the
/// number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<(u64, usize), Error> {
    let mut result: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        if i == MAX_VARINT_LEN - 1 {
            return Ok(((result << 8) | byte as u64, MAX_VARINT_LEN));
        }
        result = (result << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(Error::Truncated)
}

/// Decode as twos-complement i64.  Rowids and serial-type codes use this.
pub fn decode_i64(buf: &[u8]) -> Result<(i64, usize), Error> {
    let (v, n) = decode(buf)?;
    Ok((v as i64, n))
}

/// Number of bytes [`encode`] will emit for `value`.
pub fn encoded_len(value: u64) -> usize {
    if value >> 56 != 0 {
        return MAX_VARINT_LEN;
    }
    let mut n = 1;
    let mut v = value >> 7;
    while v != 0 {
        n += 1;
        v >>= 7;
    }
    n
}

/// Encode `value` in shortest form into the front of `buf`, returning the
/// number of bytes written.  `buf` must hold at least [`MAX_VARINT_LEN`]
/// bytes.
pub fn encode(buf: &mut [u8], value: u64) -> usize {
    let n = encoded_len(value);
    if n == MAX_VARINT_LEN {
        buf[8] = value as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            buf[i] = (v as u8 & 0x7f) | 0x80;
            v >>= 7;
        }
    } else {
        let mut v = value;
        for i in (0..n).rev() {
            buf[i] = v as u8 & 0x7f;
            if i != n - 1 {
                buf[i] |= 0x80;
            }
            v >>= 7;
        }
    }
    n
}

pub fn encode_i64(buf: &mut [u8], value: i64) -> usize {
    encode(buf, value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_each_length() {
        assert_eq!(decode(&[0x01]).unwrap(), (1, 1));
        assert_eq!(decode(&[0x7f]).unwrap(), (127, 1));
        assert_eq!(decode(&[0x81, 0x00]).unwrap(), (128, 2));
        assert_eq!(decode(&[0x80, 0x40]).unwrap(), (64, 2));
        assert_eq!(decode(&[0x81, 0x80, 0x00]).unwrap(), (1 << 14, 3));
        assert_eq!(decode(&[0x81, 0x80, 0x80, 0x00]).unwrap(), (1 << 21, 4));
        assert_eq!(
            decode(&[0x81, 0x80, 0x80, 0x80, 0x00]).unwrap(),
            (1 << 28, 5)
        );
        assert_eq!(
            decode(&[0x81, 0x80, 0x80, 0x80, 0x80, 0x00]).unwrap(),
            (1 << 35, 6)
        );
        assert_eq!(
            decode(&[0x81, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00]).unwrap(),
            (1 << 42, 7)
        );
        assert_eq!(
            decode(&[0x81, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00]).unwrap(),
            (1 << 49, 8)
        );
        // The ninth byte takes all eight bits.
        assert_eq!(
            decode(&[0x81, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00]).unwrap(),
            (1 << 57, 9)
        );
    }

    #[test]
    fn test_decode_all_ones_is_minus_one() {
        let (v, n) = decode(&[0xff; 9]).unwrap();
        assert_eq!(n, 9);
        assert_eq!(v, u64::MAX);
        assert_eq!(decode_i64(&[0xff; 9]).unwrap(), (-1, 9));
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode(&[]), Err(Error::Truncated));
        assert_eq!(decode(&[0x80]), Err(Error::Truncated));
        assert_eq!(decode(&[0xff, 0xff, 0xff]), Err(Error::Truncated));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode(&[0x02, 0xee, 0xee]).unwrap(), (2, 1));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (1, 1),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (1 << 21, 4),
            (1 << 28, 5),
            (1 << 35, 6),
            (1 << 42, 7),
            ((1 << 56) - 1, 8),
            (1 << 56, 9),
            (u64::MAX, 9),
        ];
        for &(value, want_len) in cases {
            assert_eq!(encoded_len(value), want_len, "len of {value}");
            let n = encode(&mut buf, value);
            assert_eq!(n, want_len, "encode of {value}");
            assert_eq!(decode(&buf[..n]).unwrap(), (value, n), "decode of {value}");
        }
    }

    #[test]
    fn test_encode_negative_rowid_is_nine_bytes() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        for value in [-1i64, -42, i64::MIN] {
            let n = encode_i64(&mut buf, value);
            assert_eq!(n, 9);
            assert_eq!(decode_i64(&buf[..n]).unwrap(), (value, 9));
        }
    }
}
