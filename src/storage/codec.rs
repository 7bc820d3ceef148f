//! Order-preserving, self-describing byte encoding for keys and values.
//!
//! Every encoded value starts with a one-byte type tag so decoding never
//! needs external schema context, and the byte order of the encoding
//! matches the `Ord` order of the corresponding [`crate::datom::Value`]
//! variant, so lexicographic key comparison in the underlying store
//! reproduces the index orderings in [`crate::datom::Index`]. Integers
//! and floats are big-endian with their sign bit flipped (and, for
//! floats, the remaining bits inverted when negative) so two's-complement
//! and IEEE-754 bit patterns sort the same way as the numbers they
//! represent. Transaction ids are additionally bitwise-negated when they
//! appear as the last component of a key so that, within a fixed (e, a,
//! v), the most recent transaction sorts first — the same trick the
//! storage layer used (`!self.tx`), generalized to every index.
//!
//! Keys are capped at 511 bytes; anything a caller tries to encode above
//! that is rejected rather than silently truncated.
//!
//! Transaction ids are not part of any key: a live datom's key is its
//! bare `(e, a, v)` triple (in whichever order its index places them),
//! and the one row that key maps to is overwritten on re-assertion and
//! deleted outright on retraction. This keeps "does a live datom exist
//! for (e, a, v)" a single point lookup rather than a scan over every
//! transaction that ever touched it.

use std::rc::Rc;

use thiserror::Error;
use uuid::Uuid;

use crate::datom::{Value, ValueType};

pub const MAX_KEY_LEN: usize = 511;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input while decoding")]
    EndOfInput,
    #[error("unknown value type tag {0}")]
    UnknownTag(u8),
    #[error("value does not match declared type {0:?}")]
    TypeMismatch(ValueType),
    #[error("encoded value exceeds the {MAX_KEY_LEN} byte key limit")]
    TooLong,
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
}

mod tag {
    pub const LONG: u8 = 0;
    pub const DOUBLE: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const KEYWORD: u8 = 3;
    pub const SYMBOL: u8 = 4;
    pub const STR: u8 = 5;
    pub const UUID: u8 = 6;
    pub const INSTANT: u8 = 7;
    pub const BOOLEAN: u8 = 8;
    pub const BYTES: u8 = 9;
    pub const REF: u8 = 10;
}

/// Flips the sign bit so two's-complement big-endian bytes sort the same
/// way as the signed integers they represent.
fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn decode_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1u64 << 63)) as i64
}

/// Standard order-preserving float encoding: flip the sign bit always,
/// and additionally flip every other bit when the original was negative
/// (detected via the pre-flip sign bit), so that negative floats sort
/// before positive ones and more-negative sorts before less-negative.
fn encode_f64(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let flipped = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    flipped.to_be_bytes()
}

fn decode_f64(bytes: [u8; 8]) -> f64 {
    let bits = u64::from_be_bytes(bytes);
    let original = if bits & (1u64 << 63) != 0 {
        bits & !(1u64 << 63)
    } else {
        !bits
    };
    f64::from_bits(original)
}

fn encode_f32(value: f32) -> [u8; 4] {
    let bits = value.to_bits();
    let flipped = if bits & (1u32 << 31) != 0 {
        !bits
    } else {
        bits | (1u32 << 31)
    };
    flipped.to_be_bytes()
}

fn decode_f32(bytes: [u8; 4]) -> f32 {
    let bits = u32::from_be_bytes(bytes);
    let original = if bits & (1u32 << 31) != 0 {
        bits & !(1u32 << 31)
    } else {
        !bits
    };
    f32::from_bits(original)
}

/// Appends the encoding of `value` to `out`. Returns [`CodecError::TooLong`]
/// if the result would exceed [`MAX_KEY_LEN`].
pub fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let start = out.len();
    match value {
        Value::Long(v) => {
            out.push(tag::LONG);
            out.extend_from_slice(&encode_i64(*v));
        }
        Value::Double(v) => {
            out.push(tag::DOUBLE);
            out.extend_from_slice(&encode_f64(*v));
        }
        Value::Float(v) => {
            out.push(tag::FLOAT);
            out.extend_from_slice(&encode_f32(*v));
        }
        Value::Keyword(s) => {
            out.push(tag::KEYWORD);
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Value::Symbol(s) => {
            out.push(tag::SYMBOL);
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Value::Str(s) => {
            out.push(tag::STR);
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Value::Uuid(u) => {
            out.push(tag::UUID);
            out.extend_from_slice(u.as_bytes());
        }
        Value::Instant(millis) => {
            out.push(tag::INSTANT);
            out.extend_from_slice(&encode_i64(*millis));
        }
        Value::Boolean(b) => {
            out.push(tag::BOOLEAN);
            out.push(if *b { 0x01 } else { 0x02 });
        }
        Value::Bytes(b) => {
            out.push(tag::BYTES);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        Value::Ref(e) => {
            out.push(tag::REF);
            out.extend_from_slice(&e.to_be_bytes());
        }
    }
    if out.len() - start > MAX_KEY_LEN {
        out.truncate(start);
        return Err(CodecError::TooLong);
    }
    Ok(())
}

pub fn encoded_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    encode_value(value, &mut buffer)?;
    Ok(buffer)
}

/// Decodes a single value from the front of `input`, returning the value
/// and the remaining, unconsumed bytes.
pub fn decode_value(input: &[u8]) -> Result<(Value, &[u8]), CodecError> {
    let (&head, rest) = input.split_first().ok_or(CodecError::EndOfInput)?;
    match head {
        tag::LONG => {
            let (bytes, rest) = take::<8>(rest)?;
            Ok((Value::Long(decode_i64(bytes)), rest))
        }
        tag::DOUBLE => {
            let (bytes, rest) = take::<8>(rest)?;
            Ok((Value::Double(decode_f64(bytes)), rest))
        }
        tag::FLOAT => {
            let (bytes, rest) = take::<4>(rest)?;
            Ok((Value::Float(decode_f32(bytes)), rest))
        }
        tag::KEYWORD => {
            let (s, rest) = take_nul_terminated(rest)?;
            Ok((Value::Keyword(s), rest))
        }
        tag::SYMBOL => {
            let (s, rest) = take_nul_terminated(rest)?;
            Ok((Value::Symbol(s), rest))
        }
        tag::STR => {
            let (s, rest) = take_nul_terminated(rest)?;
            Ok((Value::Str(s), rest))
        }
        tag::UUID => {
            let (bytes, rest) = take::<16>(rest)?;
            Ok((Value::Uuid(Uuid::from_bytes(bytes)), rest))
        }
        tag::INSTANT => {
            let (bytes, rest) = take::<8>(rest)?;
            Ok((Value::Instant(decode_i64(bytes)), rest))
        }
        tag::BOOLEAN => {
            let (&b, rest) = rest.split_first().ok_or(CodecError::EndOfInput)?;
            match b {
                0x01 => Ok((Value::Boolean(true), rest)),
                0x02 => Ok((Value::Boolean(false), rest)),
                other => Err(CodecError::UnknownTag(other)),
            }
        }
        tag::BYTES => {
            let (len_bytes, rest) = take::<4>(rest)?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if rest.len() < len {
                return Err(CodecError::EndOfInput);
            }
            let (bytes, rest) = rest.split_at(len);
            Ok((Value::Bytes(Rc::from(bytes)), rest))
        }
        tag::REF => {
            let (bytes, rest) = take::<8>(rest)?;
            Ok((Value::Ref(u64::from_be_bytes(bytes)), rest))
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn take<const N: usize>(input: &[u8]) -> Result<([u8; N], &[u8]), CodecError> {
    if input.len() < N {
        return Err(CodecError::EndOfInput);
    }
    let (head, rest) = input.split_at(N);
    let mut array = [0u8; N];
    array.copy_from_slice(head);
    Ok((array, rest))
}

fn take_nul_terminated(input: &[u8]) -> Result<(Rc<str>, &[u8]), CodecError> {
    let end = input
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::EndOfInput)?;
    let s = std::str::from_utf8(&input[..end]).map_err(|_| CodecError::InvalidUtf8)?;
    Ok((Rc::from(s), &input[end + 1..]))
}

/// Appends a big-endian `u64` with its sign-independent top bit untouched
/// (entity/attribute ids are never negative, so a plain big-endian
/// encoding already preserves numeric order).
pub fn encode_u64(value: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn decode_u64(bytes: [u8; 8]) -> u64 {
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = encoded_value(&value).expect("encodes");
        let (decoded, rest) = decode_value(&encoded).expect("decodes");
        assert!(rest.is_empty());
        assert_eq!(value, decoded);
    }

    #[test]
    fn roundtrips_every_value_type() {
        roundtrip(Value::Long(42));
        roundtrip(Value::Long(i64::MIN));
        roundtrip(Value::Long(i64::MAX));
        roundtrip(Value::Double(3.25));
        roundtrip(Value::Double(-0.0));
        roundtrip(Value::Double(0.0));
        roundtrip(Value::Float(-1.5));
        roundtrip(Value::str(""));
        roundtrip(Value::str("a".repeat(200)));
        roundtrip(Value::keyword("db/ident"));
        roundtrip(Value::symbol("?x"));
        roundtrip(Value::Boolean(true));
        roundtrip(Value::Boolean(false));
        roundtrip(Value::Ref(7));
        roundtrip(Value::Instant(1_700_000_000_000));
        roundtrip(Value::Uuid(Uuid::nil()));
        roundtrip(Value::Bytes(Rc::from(&b"\x00\x01\x02"[..])));
    }

    #[test]
    fn negative_longs_sort_before_positive() {
        let lo = encoded_value(&Value::Long(-1)).unwrap();
        let hi = encoded_value(&Value::Long(1)).unwrap();
        assert!(lo < hi);
    }

    #[test]
    fn negative_doubles_sort_before_positive_and_preserve_magnitude_order() {
        let very_negative = encoded_value(&Value::Double(-100.0)).unwrap();
        let negative = encoded_value(&Value::Double(-1.0)).unwrap();
        let positive = encoded_value(&Value::Double(1.0)).unwrap();
        assert!(very_negative < negative);
        assert!(negative < positive);
    }

    #[test]
    fn strings_sort_lexicographically() {
        let a = encoded_value(&Value::str("abc")).unwrap();
        let b = encoded_value(&Value::str("abd")).unwrap();
        assert!(a < b);
    }

    #[test]
    fn booleans_encode_to_the_documented_wire_bytes() {
        assert_eq!(vec![tag::BOOLEAN, 0x01], encoded_value(&Value::Boolean(true)).unwrap());
        assert_eq!(vec![tag::BOOLEAN, 0x02], encoded_value(&Value::Boolean(false)).unwrap());
    }

    #[test]
    fn u64_roundtrips() {
        let mut buf = Vec::new();
        encode_u64(42, &mut buf);
        let mut array = [0u8; 8];
        array.copy_from_slice(&buf);
        assert_eq!(42, decode_u64(array));
    }

    #[quickcheck_macros::quickcheck]
    fn long_roundtrip_matches_ordering(a: i64, b: i64) -> bool {
        let ea = encoded_value(&Value::Long(a)).unwrap();
        let eb = encoded_value(&Value::Long(b)).unwrap();
        (a < b) == (ea < eb)
    }

    #[quickcheck_macros::quickcheck]
    fn long_roundtrips(value: i64) -> bool {
        let encoded = encoded_value(&Value::Long(value)).unwrap();
        let (decoded, rest) = decode_value(&encoded).unwrap();
        rest.is_empty() && decoded == Value::Long(value)
    }
}
