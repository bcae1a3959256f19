//! Two integer encodings appear on the wire and must not be confused:
//!
//! - The CQL `varint` *type* (§4.1 table): a minimal-length big-endian
//!   two's-complement integer, arbitrary precision. Used for `varint` and
//!   for the unscaled part of `decimal`. See [`encode_cql_varint`].
//! - The protocol's own "vint": a variable-length unsigned encoding where
//!   the number of extra bytes is unary-coded into the leading byte's high
//!   bits, optionally wrapped in zig-zag for signed values. Used for the
//!   three components of the `duration` type and for unsigned element
//!   counts inside `vector<T, N>` when `T` is variable-width. See
//!   [`encode_unsigned_vint`] / [`encode_vint`].

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_bigint::BigInt;

/// Encodes `n` as a minimal-length big-endian two's-complement integer,
/// matching the CQL `varint` wire type. `num-bigint`'s `to_signed_bytes_be`
/// already produces the shortest two's-complement form (including the
/// leading `0x00` needed when a positive value's high bit would otherwise
/// read as negative), so this is a thin, documented wrapper rather than a
/// hand-rolled minimality check.
pub fn encode_cql_varint(n: &BigInt, out: &mut BytesMut) {
    out.extend_from_slice(&n.to_signed_bytes_be());
}

/// Decodes a minimal-length big-endian two's-complement integer.
pub fn decode_cql_varint(bytes: &[u8]) -> BigInt {
    BigInt::from_signed_bytes_be(bytes)
}

/// Encodes an unsigned value using the protocol's vint scheme.
pub fn encode_unsigned_vint(value: u64, out: &mut BytesMut) {
    let extra_bytes = unsigned_vint_extra_bytes(value);
    if extra_bytes == 0 {
        out.put_u8(value as u8);
        return;
    }
    if extra_bytes == 8 {
        out.put_u8(0xFF);
        out.put_u64(value);
        return;
    }
    let leading_ones: u8 = (((1u16 << extra_bytes) - 1) << (8 - extra_bytes)) as u8;
    let top_mask: u64 = (1u64 << (7 - extra_bytes)) - 1;
    let top = (value >> (8 * extra_bytes)) as u8 & (top_mask as u8);
    out.put_u8(leading_ones | top);
    for i in (0..extra_bytes).rev() {
        out.put_u8((value >> (8 * i)) as u8);
    }
}

/// Decodes an unsigned protocol vint, advancing `buf` past the bytes consumed.
pub fn decode_unsigned_vint(buf: &mut Bytes) -> Result<u64, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::MalformedVint("empty input"));
    }
    let first = buf[0];
    let extra_bytes = first.leading_ones() as usize;
    if buf.len() < 1 + extra_bytes {
        return Err(CodecError::MalformedVint("truncated"));
    }
    buf.advance(1);
    if extra_bytes == 0 {
        return Ok(first as u64);
    }
    if extra_bytes == 8 {
        return Ok(buf.get_u64());
    }
    let top_mask = (1u8 << (7 - extra_bytes)) - 1;
    let mut value = (first & top_mask) as u64;
    for _ in 0..extra_bytes {
        value = (value << 8) | buf.get_u8() as u64;
    }
    Ok(value)
}

/// Encodes a signed value as a zig-zagged protocol vint.
pub fn encode_vint(value: i64, out: &mut BytesMut) {
    encode_unsigned_vint(zigzag_encode(value), out);
}

/// Decodes a zig-zagged signed protocol vint.
pub fn decode_vint(buf: &mut Bytes) -> Result<i64, CodecError> {
    decode_unsigned_vint(buf).map(zigzag_decode)
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Minimal number of extra bytes (0-8) needed to hold `value` in the vint scheme:
/// capacity with `n` extra bytes is `7 + 7n` bits.
fn unsigned_vint_extra_bytes(value: u64) -> usize {
    for n in 0..8 {
        let bits = 7 + 7 * n;
        if value < (1u64 << bits) {
            return n;
        }
    }
    8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duration_vint_matches_spec_example() {
        // {months: 1, days: 2, nanos: 115} -> 02 04 80 E6
        let mut out = BytesMut::new();
        encode_vint(1, &mut out);
        encode_vint(2, &mut out);
        encode_vint(115, &mut out);
        assert_eq!(&out[..], &[0x02, 0x04, 0x80, 0xE6]);
    }

    #[test]
    fn varint_big_decimal_matches_spec_example() {
        let n: BigInt = "123456789123456789123456789".parse().unwrap();
        let mut out = BytesMut::new();
        encode_cql_varint(&n, &mut out);
        assert_eq!(
            &out[..],
            &[0x66, 0x1E, 0xFD, 0xF2, 0xE3, 0xB1, 0x9F, 0x7C, 0x04, 0x5F, 0x15]
        );
        assert_eq!(decode_cql_varint(&out), n);
    }

    #[test]
    fn vint_round_trip_small_and_large() {
        for v in [0i64, 1, -1, 63, 64, -64, 8191, -8192, i64::MAX, i64::MIN] {
            let mut out = BytesMut::new();
            encode_vint(v, &mut out);
            let mut bytes = out.freeze();
            assert_eq!(decode_vint(&mut bytes).unwrap(), v);
            assert!(bytes.is_empty());
        }
    }

    #[quickcheck_macros::quickcheck]
    fn prop_vint_round_trip(v: i64) -> bool {
        let mut out = BytesMut::new();
        encode_vint(v, &mut out);
        let mut bytes = out.freeze();
        decode_vint(&mut bytes).unwrap() == v
    }

    #[quickcheck_macros::quickcheck]
    fn prop_varint_round_trip(v: i64) -> bool {
        let n = BigInt::from(v);
        let mut out = BytesMut::new();
        encode_cql_varint(&n, &mut out);
        decode_cql_varint(&out) == n
    }
}
