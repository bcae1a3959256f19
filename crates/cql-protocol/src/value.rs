//! Canonical domain values and their wire (un)marshalling, per the native
//! protocol's per-type table. [`encode_value`]/[`decode_value`] are the single
//! recursive entry points: they are used both for top-level bind/column
//! values and, recursively, for collection elements, tuple fields, and
//! UDT fields, since the `[bytes]` (length-prefixed, -1 = null) wire shape
//! is uniform across all of those positions.

use crate::error::CodecError;
use crate::types::ColumnType;
use crate::varint::{decode_cql_varint, decode_vint, encode_cql_varint, encode_vint};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_bigint::BigInt;
use std::net::IpAddr;
use uuid::Uuid;

/// Days between the proleptic epoch CQL `date` uses on the wire (an
/// unsigned `u32` centered so that day 2^31 is the Unix epoch) and the
/// signed, Unix-epoch-relative day count [`Value::Date`] uses as its
/// canonical form.
const DATE_WIRE_OFFSET: i64 = 1 << 31;

#[derive(Debug, Clone, PartialEq)]
pub struct CqlDecimal {
    pub scale: i32,
    pub unscaled: BigInt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanos: i64,
}

/// A value in any of the positions the wire format allows: a top-level
/// bound value or column, a collection element, a tuple field, or a UDT
/// field. `Null` is used uniformly in all of these positions to mean wire
/// length `-1` ("absent element" inside collections/tuples).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Protocol v4+ "not set": the bind variable is left unchanged
    /// server-side rather than written as NULL. Only legal when encoding a
    /// bound EXECUTE value; never produced by decode.
    Unset,
    Ascii(String),
    Text(String),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Varint(BigInt),
    Decimal(CqlDecimal),
    Float(f32),
    Double(f64),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Signed days relative to the Unix epoch (not the wire's biased `u32`).
    Date(i64),
    /// Nanoseconds since midnight.
    Time(i64),
    Duration(CqlDuration),
    Uuid(Uuid),
    TimeUuid(Uuid),
    Inet(IpAddr),
    Blob(Bytes),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
    /// Fields in declaration order; a trailing run of `Null`s is omitted
    /// entirely on encode: trailing absent fields are omitted rather than
    /// written as explicit nulls.
    Udt(Vec<(String, Value)>),
    Vector(Vec<Value>),
}

/// Encodes `value` as the length-prefixed `[bytes]` wire form for `ty`:
/// `-1` for [`Value::Null`], `-2` for [`Value::Unset`], otherwise a 4-byte
/// big-endian length followed by the type's body encoding.
pub fn encode_value(ty: &ColumnType, value: &Value, out: &mut BytesMut) -> Result<(), CodecError> {
    match value {
        Value::Null => {
            out.put_i32(-1);
            Ok(())
        }
        Value::Unset => {
            out.put_i32(-2);
            Ok(())
        }
        _ => {
            let mut body = BytesMut::new();
            encode_body(ty, value, &mut body)?;
            out.put_i32(body.len() as i32);
            out.extend_from_slice(&body);
            Ok(())
        }
    }
}

/// Decodes a length-prefixed `[bytes]` value. Returns `Value::Null` for a
/// declared length of `-1`; any other negative length is a protocol error
/// (servers never send `-2` in a decoded result).
pub fn decode_value(ty: &ColumnType, buf: &mut Bytes) -> Result<Value, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::TruncatedFrame {
            expected: 4,
            actual: buf.remaining(),
        });
    }
    let len = buf.get_i32();
    if len == -1 {
        return Ok(Value::Null);
    }
    if len == -2 {
        return Err(CodecError::UnexpectedUnset);
    }
    if len < 0 {
        return Err(CodecError::NegativeCollectionCount(len));
    }
    let len = len as usize;
    if len > buf.remaining() {
        return Err(CodecError::LengthOverrun {
            declared: len as i64,
            remaining: buf.remaining(),
        });
    }
    let mut body = buf.copy_to_bytes(len);
    decode_body(ty, &mut body)
}

fn encode_body(ty: &ColumnType, value: &Value, out: &mut BytesMut) -> Result<(), CodecError> {
    match (ty, value) {
        (ColumnType::Ascii, Value::Ascii(s)) | (ColumnType::Varchar, Value::Text(s)) => {
            out.extend_from_slice(s.as_bytes());
        }
        // Accept either string variant regardless of declared type; the
        // distinction is purely advisory for ascii-vs-utf8 validation,
        // which real clusters don't enforce either.
        (ColumnType::Ascii, Value::Text(s)) | (ColumnType::Varchar, Value::Ascii(s)) => {
            out.extend_from_slice(s.as_bytes());
        }
        (ColumnType::TinyInt, Value::TinyInt(v)) => out.put_i8(*v),
        (ColumnType::SmallInt, Value::SmallInt(v)) => out.put_i16(*v),
        (ColumnType::Int, Value::Int(v)) => out.put_i32(*v),
        (ColumnType::BigInt, Value::BigInt(v)) => out.put_i64(*v),
        (ColumnType::Varint, Value::Varint(v)) => encode_cql_varint(v, out),
        (ColumnType::Decimal, Value::Decimal(d)) => {
            out.put_i32(d.scale);
            encode_cql_varint(&d.unscaled, out);
        }
        (ColumnType::Float, Value::Float(v)) => out.put_f32(*v),
        (ColumnType::Double, Value::Double(v)) => out.put_f64(*v),
        (ColumnType::Boolean, Value::Boolean(v)) => out.put_u8(if *v { 1 } else { 0 }),
        (ColumnType::Timestamp, Value::Timestamp(v)) => out.put_i64(*v),
        (ColumnType::Date, Value::Date(days)) => {
            let wire = days
                .checked_add(DATE_WIRE_OFFSET)
                .ok_or(CodecError::IntegerRange { target: "date" })?;
            let wire: u32 = wire
                .try_into()
                .map_err(|_| CodecError::IntegerRange { target: "date" })?;
            out.put_u32(wire);
        }
        (ColumnType::Time, Value::Time(v)) => out.put_i64(*v),
        (ColumnType::Duration, Value::Duration(d)) => {
            encode_vint(d.months as i64, out);
            encode_vint(d.days as i64, out);
            encode_vint(d.nanos, out);
        }
        (ColumnType::Uuid, Value::Uuid(u)) | (ColumnType::TimeUuid, Value::TimeUuid(u)) => {
            out.extend_from_slice(u.as_bytes());
        }
        (ColumnType::Inet, Value::Inet(addr)) => match addr {
            IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
        },
        (ColumnType::Blob, Value::Blob(b)) => out.extend_from_slice(b),
        (ColumnType::List(elem_ty), Value::List(items))
        | (ColumnType::Set(elem_ty), Value::Set(items)) => {
            out.put_i32(items.len() as i32);
            for item in items {
                encode_value(elem_ty, item, out)?;
            }
        }
        (ColumnType::Map(key_ty, val_ty), Value::Map(entries)) => {
            out.put_i32(entries.len() as i32);
            for (k, v) in entries {
                encode_value(key_ty, k, out)?;
                encode_value(val_ty, v, out)?;
            }
        }
        (ColumnType::Tuple(field_tys), Value::Tuple(fields)) => {
            for (field_ty, field_val) in field_tys.iter().zip(fields) {
                encode_value(field_ty, field_val, out)?;
            }
        }
        (ColumnType::Udt { fields: field_tys, .. }, Value::Udt(fields)) => {
            let last_present = fields
                .iter()
                .rposition(|(_, v)| !matches!(v, Value::Null))
                .map(|i| i + 1)
                .unwrap_or(0);
            for ((field_ty_name, field_ty), (_, field_val)) in
                field_tys.iter().zip(fields.iter()).take(last_present)
            {
                let _ = field_ty_name;
                encode_value(field_ty, field_val, out)?;
            }
        }
        (ColumnType::Vector(elem_ty, dim), Value::Vector(items)) => {
            if items.len() as u32 != *dim {
                return Err(CodecError::VectorDimensionMismatch {
                    expected: *dim,
                    actual: items.len() as u32,
                });
            }
            if let Some(_width) = fixed_width(elem_ty) {
                for item in items {
                    encode_body(elem_ty, item, out)?;
                }
            } else {
                for item in items {
                    let mut inner = BytesMut::new();
                    encode_body(elem_ty, item, &mut inner)?;
                    crate::varint::encode_unsigned_vint(inner.len() as u64, out);
                    out.extend_from_slice(&inner);
                }
            }
        }
        (ty, value) => {
            return Err(CodecError::UnknownType(format!(
                "value {:?} does not match declared type {:?}",
                value, ty
            )))
        }
    }
    Ok(())
}

fn decode_body(ty: &ColumnType, body: &mut Bytes) -> Result<Value, CodecError> {
    Ok(match ty {
        ColumnType::Ascii => Value::Ascii(decode_utf8(body)?),
        ColumnType::Varchar => Value::Text(decode_utf8(body)?),
        ColumnType::TinyInt => Value::TinyInt(require(body, 1)?.get_i8()),
        ColumnType::SmallInt => Value::SmallInt(require(body, 2)?.get_i16()),
        ColumnType::Int => Value::Int(require(body, 4)?.get_i32()),
        ColumnType::BigInt => Value::BigInt(require(body, 8)?.get_i64()),
        ColumnType::Varint => Value::Varint(decode_cql_varint(body)),
        ColumnType::Decimal => {
            let scale = require(body, 4)?.get_i32();
            let unscaled = decode_cql_varint(body);
            Value::Decimal(CqlDecimal { scale, unscaled })
        }
        ColumnType::Float => Value::Float(require(body, 4)?.get_f32()),
        ColumnType::Double => Value::Double(require(body, 8)?.get_f64()),
        ColumnType::Boolean => Value::Boolean(require(body, 1)?.get_u8() != 0),
        ColumnType::Timestamp => Value::Timestamp(require(body, 8)?.get_i64()),
        ColumnType::Date => {
            let wire = require(body, 4)?.get_u32();
            Value::Date(wire as i64 - DATE_WIRE_OFFSET)
        }
        ColumnType::Time => Value::Time(require(body, 8)?.get_i64()),
        ColumnType::Duration => {
            let months = decode_vint(body).map_err(|_| CodecError::IncompleteDuration("months"))?;
            let days = decode_vint(body).map_err(|_| CodecError::IncompleteDuration("days"))?;
            let nanos = decode_vint(body).map_err(|_| CodecError::IncompleteDuration("nanos"))?;
            Value::Duration(CqlDuration {
                months: months as i32,
                days: days as i32,
                nanos,
            })
        }
        ColumnType::Uuid => Value::Uuid(decode_uuid(body)?),
        ColumnType::TimeUuid => Value::TimeUuid(decode_uuid(body)?),
        ColumnType::Inet => Value::Inet(decode_inet(body)?),
        ColumnType::Blob => Value::Blob(body.copy_to_bytes(body.remaining())),
        ColumnType::List(elem_ty) => Value::List(decode_collection_items(elem_ty, body)?),
        ColumnType::Set(elem_ty) => Value::Set(decode_collection_items(elem_ty, body)?),
        ColumnType::Map(key_ty, val_ty) => {
            let count = require(body, 4)?.get_i32();
            if count < 0 {
                return Err(CodecError::NegativeCollectionCount(count));
            }
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let k = decode_value(key_ty, body)?;
                let v = decode_value(val_ty, body)?;
                entries.push((k, v));
            }
            Value::Map(entries)
        }
        ColumnType::Tuple(field_tys) => {
            let mut fields = Vec::with_capacity(field_tys.len());
            for field_ty in field_tys {
                if body.is_empty() {
                    fields.push(Value::Null);
                } else {
                    fields.push(decode_value(field_ty, body)?);
                }
            }
            Value::Tuple(fields)
        }
        ColumnType::Udt { fields: field_tys, .. } => {
            let mut fields = Vec::with_capacity(field_tys.len());
            for (name, field_ty) in field_tys {
                if body.is_empty() {
                    fields.push((name.clone(), Value::Null));
                } else {
                    fields.push((name.clone(), decode_value(field_ty, body)?));
                }
            }
            Value::Udt(fields)
        }
        ColumnType::Vector(elem_ty, dim) => {
            let items = if let Some(width) = fixed_width(elem_ty) {
                if body.remaining() % width != 0 {
                    return Err(CodecError::VectorDimensionMismatch {
                        expected: *dim,
                        actual: (body.remaining() / width.max(1)) as u32,
                    });
                }
                let actual = (body.remaining() / width) as u32;
                if actual != *dim {
                    return Err(CodecError::VectorDimensionMismatch {
                        expected: *dim,
                        actual,
                    });
                }
                let mut items = Vec::with_capacity(*dim as usize);
                for _ in 0..*dim {
                    let mut elem_bytes = body.copy_to_bytes(width);
                    items.push(decode_body(elem_ty, &mut elem_bytes)?);
                }
                items
            } else {
                let mut items = Vec::with_capacity(*dim as usize);
                for _ in 0..*dim {
                    let elem_len = crate::varint::decode_unsigned_vint(body)? as usize;
                    if elem_len > body.remaining() {
                        return Err(CodecError::LengthOverrun {
                            declared: elem_len as i64,
                            remaining: body.remaining(),
                        });
                    }
                    let mut elem_bytes = body.copy_to_bytes(elem_len);
                    items.push(decode_body(elem_ty, &mut elem_bytes)?);
                }
                if !body.is_empty() {
                    return Err(CodecError::VectorDimensionMismatch {
                        expected: *dim,
                        actual: *dim + 1,
                    });
                }
                items
            };
            Value::Vector(items)
        }
    })
}

fn decode_collection_items(elem_ty: &ColumnType, body: &mut Bytes) -> Result<Vec<Value>, CodecError> {
    let count = require(body, 4)?.get_i32();
    if count < 0 {
        return Err(CodecError::NegativeCollectionCount(count));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(decode_value(elem_ty, body)?);
    }
    Ok(items)
}

fn decode_utf8(body: &mut Bytes) -> Result<String, CodecError> {
    let bytes = body.copy_to_bytes(body.remaining());
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn decode_uuid(body: &mut Bytes) -> Result<Uuid, CodecError> {
    if body.remaining() != 16 {
        return Err(CodecError::BadUuidLength(body.remaining()));
    }
    let mut raw = [0u8; 16];
    body.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

fn decode_inet(body: &mut Bytes) -> Result<IpAddr, CodecError> {
    match body.remaining() {
        4 => {
            let mut raw = [0u8; 4];
            body.copy_to_slice(&mut raw);
            Ok(IpAddr::from(raw))
        }
        16 => {
            let mut raw = [0u8; 16];
            body.copy_to_slice(&mut raw);
            Ok(IpAddr::from(raw))
        }
        other => Err(CodecError::TruncatedFrame {
            expected: 4,
            actual: other,
        }),
    }
}

fn require(body: &mut Bytes, n: usize) -> Result<&mut Bytes, CodecError> {
    if body.remaining() < n {
        return Err(CodecError::TruncatedFrame {
            expected: n,
            actual: body.remaining(),
        });
    }
    Ok(body)
}

/// Fixed encoded width in bytes for scalar types, or `None` for
/// variable-width types. Only scalar (non-collection) types are fixed-width,
/// which matters for `vector<T, N>`'s choice between fixed- and
/// variable-width element encoding.
fn fixed_width(ty: &ColumnType) -> Option<usize> {
    Some(match ty {
        ColumnType::TinyInt => 1,
        ColumnType::SmallInt => 2,
        ColumnType::Int => 4,
        ColumnType::BigInt => 8,
        ColumnType::Float => 4,
        ColumnType::Double => 8,
        ColumnType::Boolean => 1,
        ColumnType::Timestamp => 8,
        ColumnType::Date => 4,
        ColumnType::Time => 8,
        ColumnType::Uuid | ColumnType::TimeUuid => 16,
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn roundtrip(ty: ColumnType, value: Value) {
        let mut out = BytesMut::new();
        encode_value(&ty, &value, &mut out).unwrap();
        let mut bytes = out.freeze();
        let decoded = decode_value(&ty, &mut bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn null_encodes_as_minus_one() {
        let mut out = BytesMut::new();
        encode_value(&ColumnType::Int, &Value::Null, &mut out).unwrap();
        assert_eq!(&out[..], &(-1i32).to_be_bytes());
    }

    #[test]
    fn empty_text_encodes_present_but_zero_length() {
        let mut out = BytesMut::new();
        encode_value(&ColumnType::Varchar, &Value::Text(String::new()), &mut out).unwrap();
        assert_eq!(&out[..], &0i32.to_be_bytes());
        let mut bytes = out.freeze();
        assert_eq!(
            decode_value(&ColumnType::Varchar, &mut bytes).unwrap(),
            Value::Text(String::new())
        );
    }

    #[test]
    fn empty_list_encodes_zero_count_not_zero_length() {
        let ty = ColumnType::List(Box::new(ColumnType::Int));
        let mut out = BytesMut::new();
        encode_value(&ty, &Value::List(vec![]), &mut out).unwrap();
        // outer length = 4 (just the i32 count), not 0.
        assert_eq!(&out[..4], &4i32.to_be_bytes());
        assert_eq!(&out[4..], &0i32.to_be_bytes());
    }

    #[test]
    fn scalars_round_trip() {
        roundtrip(ColumnType::Boolean, Value::Boolean(true));
        roundtrip(ColumnType::Int, Value::Int(-42));
        roundtrip(ColumnType::BigInt, Value::BigInt(i64::MIN));
        roundtrip(ColumnType::Float, Value::Float(1.5));
        roundtrip(ColumnType::Double, Value::Double(-2.25));
        roundtrip(ColumnType::Timestamp, Value::Timestamp(1_700_000_000_000));
        roundtrip(ColumnType::Date, Value::Date(0));
        roundtrip(ColumnType::Date, Value::Date(-1));
        roundtrip(ColumnType::Time, Value::Time(12_345_678));
        roundtrip(
            ColumnType::Inet,
            Value::Inet(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
        );
    }

    #[test]
    fn uuid_round_trip_matches_spec_example() {
        let u = Uuid::parse_str("3dcd9800-f3d9-11bf-86d4-b8e8562c0cd0").unwrap();
        let mut out = BytesMut::new();
        encode_value(&ColumnType::Uuid, &Value::Uuid(u), &mut out).unwrap();
        assert_eq!(out.len(), 4 + 16);
        roundtrip(ColumnType::Uuid, Value::Uuid(u));
    }

    #[test]
    fn timeuuid_wrong_length_errors() {
        let mut out = BytesMut::new();
        out.put_i32(6);
        out.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        let mut bytes = out.freeze();
        let err = decode_value(&ColumnType::TimeUuid, &mut bytes).unwrap_err();
        assert_eq!(err, CodecError::BadUuidLength(6));
    }

    #[test]
    fn fixed_size_vector_round_trips_and_checks_dimension() {
        let ty = ColumnType::Vector(Box::new(ColumnType::Float), 3);
        let value = Value::Vector(vec![
            Value::Float(8.0),
            Value::Float(2.5),
            Value::Float(-5.0),
        ]);
        roundtrip(ty.clone(), value);

        let bad = Value::Vector(vec![Value::Float(8.0), Value::Float(-5.0)]);
        let mut out = BytesMut::new();
        let err = encode_value(&ty, &bad, &mut out).unwrap_err();
        assert_eq!(
            err,
            CodecError::VectorDimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn udt_omits_trailing_absent_fields() {
        let ty = ColumnType::Udt {
            keyspace: "ks".into(),
            name: "ut".into(),
            fields: vec![
                ("a".into(), ColumnType::Int),
                ("b".into(), ColumnType::Int),
                ("c".into(), ColumnType::Int),
            ],
        };
        let value = Value::Udt(vec![
            ("a".into(), Value::Int(1)),
            ("b".into(), Value::Null),
            ("c".into(), Value::Null),
        ]);
        let mut out = BytesMut::new();
        encode_value(&ty, &value, &mut out).unwrap();
        // Only field "a" (4 + 4 bytes) is written; "b"/"c" are omitted entirely.
        assert_eq!(out.len(), 4 + 4);
    }

    #[test]
    fn map_and_nested_set_round_trip() {
        let ty = ColumnType::Map(Box::new(ColumnType::Varchar), Box::new(ColumnType::Int));
        let value = Value::Map(vec![
            (Value::Text("a".into()), Value::Int(1)),
            (Value::Text("b".into()), Value::Int(2)),
        ]);
        roundtrip(ty, value);
    }
}
