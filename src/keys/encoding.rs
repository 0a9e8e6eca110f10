//! Order-preserving byte string escaping.
//!
//! Escaped form: every `0x00` becomes `0x00 0xFF` and the string is terminated
//! by `0x00 0x01`. For any byte strings `a < b`, `escape(a) < escape(b)` and no
//! escaped string is a prefix of another, so fixed-width suffixes can follow.

use crate::error::{Error, Result};

const ESCAPE: u8 = 0x00;
const ESCAPED_00: u8 = 0xff;
const ESCAPED_TERM: u8 = 0x01;

/// First byte after the terminator that sorts after every suffix of an
/// escaped string.
pub(crate) const ESCAPED_PAST_TERM: u8 = 0x02;

/// Appends the escaped, terminated form of `key` to `buf`.
pub fn encode_bytes_ascending(buf: &mut Vec<u8>, key: &[u8]) {
    buf.reserve(key.len() + 2);
    for &b in key {
        if b == ESCAPE {
            buf.push(ESCAPE);
            buf.push(ESCAPED_00);
        } else {
            buf.push(b);
        }
    }
    buf.push(ESCAPE);
    buf.push(ESCAPED_TERM);
}

/// Decodes an escaped string from the front of `buf`, returning the decoded
/// bytes and the remainder following the terminator.
pub fn decode_bytes_ascending(buf: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        let b = buf[i];
        if b != ESCAPE {
            out.push(b);
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            Some(&ESCAPED_TERM) => return Ok((out, &buf[i + 2..])),
            Some(&ESCAPED_00) => {
                out.push(ESCAPE);
                i += 2;
            }
            Some(other) => {
                return Err(Error::Codec(format!(
                    "invalid escape byte {other:#04x} at offset {}",
                    i + 1
                )))
            }
            None => break,
        }
    }
    Err(Error::Codec("unterminated escaped byte string".to_string()))
}

/// Length of the escaped form of `key`, terminator included.
pub fn encoded_len(key: &[u8]) -> usize {
    key.len() + key.iter().filter(|&&b| b == ESCAPE).count() + 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_bytes_ascending(&mut buf, key);
        buf
    }

    #[test]
    fn test_roundtrip_with_zero_bytes() {
        for key in [&b""[..], b"a", b"a\x00b", b"\x00\x00", b"\xff\x00\x01"] {
            let buf = enc(key);
            assert_eq!(buf.len(), encoded_len(key));
            let (decoded, rest) = decode_bytes_ascending(&buf).unwrap();
            assert_eq!(decoded, key);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_order_preserved_for_prefixes() {
        let keys: Vec<&[u8]> = vec![b"", b"\x00", b"a", b"a\x00", b"a\x00\x00", b"a\x01", b"ab", b"b"];
        for pair in keys.windows(2) {
            assert!(enc(pair[0]) < enc(pair[1]), "{:?} vs {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_remainder_returned() {
        let mut buf = enc(b"key");
        buf.extend_from_slice(b"tail");
        let (decoded, rest) = decode_bytes_ascending(&buf).unwrap();
        assert_eq!(decoded, b"key");
        assert_eq!(rest, b"tail");
    }

    #[test]
    fn test_unterminated_is_error() {
        assert!(decode_bytes_ascending(b"abc").is_err());
        assert!(decode_bytes_ascending(b"a\x00\x07").is_err());
    }
}
