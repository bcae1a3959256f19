//! RESULT frame payloads (RESULT kinds 1-5) and the row/column
//! shapes they carry.

use bytes::{Buf, Bytes};
use cql_protocol::{CodecError, ColumnType, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowsMetadata {
    pub columns: Vec<ColumnSpec>,
    pub paging_state: Option<Bytes>,
    /// Set when protocol v5's `Metadata_changed` flag accompanies a RESULT
    /// for a statement whose schema changed since it was prepared: callers
    /// must re-fetch metadata for that prepared statement id.
    pub metadata_changed: bool,
    /// The replacement result-metadata id, present iff `metadata_changed`
    /// is set, so the connection can update the cache entry under
    /// single-flight discipline before returning rows.
    pub new_metadata_id: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<Value>,
}

impl Row {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.columns.get(index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowsResult {
    pub metadata: RowsMetadata,
    pub rows: Vec<Row>,
}

impl RowsResult {
    /// Surfaces a lightweight-transaction outcome: the
    /// `[applied]` boolean plus, when the update did not apply, the
    /// current row that blocked it. A result with no `[applied]` column
    /// (i.e. this wasn't a CAS statement) is a dedicated error rather
    /// than a silent `true`, since callers rely on this to tell a normal
    /// write apart from a rejected conditional one.
    pub fn cas_applied(&self) -> Result<(bool, Option<Row>), crate::error::DriverError> {
        let applied_index = self.metadata.columns.iter().position(|c| c.name == "[applied]");
        let Some(applied_index) = applied_index else {
            return Err(crate::error::DriverError::NotCasResult);
        };
        let Some(row) = self.rows.first() else {
            return Ok((false, None));
        };
        let applied = matches!(row.get(applied_index), Some(Value::Boolean(true)));
        if applied {
            Ok((true, None))
        } else {
            Ok((false, Some(row.clone())))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub statement_id: Bytes,
    pub result_metadata_id: Option<Bytes>,
    pub bind_columns: Vec<ColumnSpec>,
    pub result_columns: Vec<ColumnSpec>,
    /// Indices of `bind_columns` that make up the partition key, in
    /// partition-key component order, as reported by the server's
    /// `pk_indices`. Used to compute the routing key for
    /// token-aware host selection without re-parsing CQL.
    pub pk_indices: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPayload {
    Void,
    Rows(RowsMetadata),
    SetKeyspace(String),
    Prepared(PreparedMetadata),
    SchemaChange,
}

const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;
const FLAG_METADATA_CHANGED: i32 = 0x0008;

pub fn decode_rows_metadata(buf: &mut Bytes) -> Result<RowsMetadata, CodecError> {
    require(buf, 4)?;
    let flags = buf.get_i32();
    require(buf, 4)?;
    let column_count = buf.get_i32();
    if column_count < 0 {
        return Err(CodecError::NegativeCollectionCount(column_count));
    }

    let paging_state = if flags & FLAG_HAS_MORE_PAGES != 0 {
        Some(decode_bytes(buf)?)
    } else {
        None
    };

    let metadata_changed = flags & FLAG_METADATA_CHANGED != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;
    let global_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    // Ordered before the `no_metadata` early return: a `Metadata_changed`
    // RESULT overrides `SKIP_METADATA`'s no-columns shape but still carries
    // the new id in this position, right after `paging_state`.
    let new_metadata_id = if metadata_changed {
        Some(decode_short_bytes(buf)?)
    } else {
        None
    };

    if no_metadata {
        return Ok(RowsMetadata {
            columns: Vec::new(),
            paging_state,
            metadata_changed,
            new_metadata_id,
        });
    }

    let (global_keyspace, global_table) = if global_spec {
        (decode_string(buf)?, decode_string(buf)?)
    } else {
        (String::new(), String::new())
    };

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let (keyspace, table) = if global_spec {
            (global_keyspace.clone(), global_table.clone())
        } else {
            (decode_string(buf)?, decode_string(buf)?)
        };
        let name = decode_string(buf)?;
        let ty = decode_option_type(buf)?;
        columns.push(ColumnSpec { keyspace, table, name, ty });
    }

    Ok(RowsMetadata {
        columns,
        paging_state,
        metadata_changed,
        new_metadata_id,
    })
}

pub fn decode_rows_result(buf: &mut Bytes) -> Result<RowsResult, CodecError> {
    let metadata = decode_rows_metadata(buf)?;
    require(buf, 4)?;
    let row_count = buf.get_i32();
    if row_count < 0 {
        return Err(CodecError::NegativeCollectionCount(row_count));
    }
    let mut rows = Vec::with_capacity(row_count as usize);
    for _ in 0..row_count {
        let mut columns = Vec::with_capacity(metadata.columns.len());
        for col in &metadata.columns {
            columns.push(cql_protocol::value::decode_value(&col.ty, buf)?);
        }
        rows.push(Row { columns });
    }
    Ok(RowsResult { metadata, rows })
}

pub fn decode_prepared_metadata(buf: &mut Bytes, protocol_v5_or_later: bool) -> Result<PreparedMetadata, CodecError> {
    let statement_id = decode_short_bytes(buf)?;
    let result_metadata_id = if protocol_v5_or_later {
        Some(decode_short_bytes(buf)?)
    } else {
        None
    };

    require(buf, 4)?;
    let flags = buf.get_i32();
    require(buf, 4)?;
    let column_count = buf.get_i32();
    require(buf, 4)?;
    let pk_count = buf.get_i32();
    if pk_count < 0 || column_count < 0 {
        return Err(CodecError::NegativeCollectionCount(pk_count.min(column_count)));
    }
    let mut pk_indices = Vec::with_capacity(pk_count as usize);
    for _ in 0..pk_count {
        require(buf, 2)?;
        pk_indices.push(buf.get_u16());
    }

    let global_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let (global_keyspace, global_table) = if global_spec {
        (decode_string(buf)?, decode_string(buf)?)
    } else {
        (String::new(), String::new())
    };
    let mut bind_columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let (keyspace, table) = if global_spec {
            (global_keyspace.clone(), global_table.clone())
        } else {
            (decode_string(buf)?, decode_string(buf)?)
        };
        let name = decode_string(buf)?;
        let ty = decode_option_type(buf)?;
        bind_columns.push(ColumnSpec { keyspace, table, name, ty });
    }

    let result_metadata = decode_rows_metadata(buf)?;

    Ok(PreparedMetadata {
        statement_id,
        result_metadata_id,
        bind_columns,
        result_columns: result_metadata.columns,
        pk_indices,
    })
}

fn require(buf: &Bytes, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::TruncatedFrame {
            expected: n,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn decode_string(buf: &mut Bytes) -> Result<String, CodecError> {
    require(buf, 2)?;
    let len = buf.get_u16() as usize;
    require(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn decode_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    require(buf, 4)?;
    let len = buf.get_i32();
    if len < 0 {
        return Err(CodecError::NegativeCollectionCount(len));
    }
    require(buf, len as usize)?;
    Ok(buf.copy_to_bytes(len as usize))
}

fn decode_short_bytes(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    require(buf, 2)?;
    let len = buf.get_u16() as usize;
    require(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Decodes a single `<option>` type descriptor: a 2-byte id, followed by
/// type-specific payload for the parameterized ids, distinct from the
/// class-name strings `types::parse_class_name` handles for schema-table
/// responses.
fn decode_option_type(buf: &mut Bytes) -> Result<ColumnType, CodecError> {
    require(buf, 2)?;
    let id = buf.get_u16();
    Ok(match id {
        0x0000 => {
            // CUSTOM: the payload is a `[string]` naming the server's
            // marshal class, same spelling `types::parse_class_name`
            // already handles for schema-table responses (this is how a
            // `vector<T, N>` column shows up in RESULT metadata, since
            // the native protocol never gave it a dedicated option id).
            let class_name = decode_string(buf)?;
            ColumnType::parse_class_name(&class_name)?
        }
        0x0001 => ColumnType::Ascii,
        0x0002 => ColumnType::BigInt,
        0x0003 => ColumnType::Blob,
        0x0004 => ColumnType::Boolean,
        // Counter has no dedicated canonical value: it's wire-identical
        // to a plain bigint (an 8-byte big-endian i64).
        0x0005 => ColumnType::BigInt,
        0x0006 => ColumnType::Decimal,
        0x0007 => ColumnType::Double,
        0x0008 => ColumnType::Float,
        0x0009 => ColumnType::Int,
        0x000A => ColumnType::Varchar,
        0x000B => ColumnType::Timestamp,
        0x000C => ColumnType::Uuid,
        0x000D => ColumnType::Varchar,
        0x000E => ColumnType::Varint,
        0x000F => ColumnType::TimeUuid,
        0x0010 => ColumnType::Inet,
        0x0011 => ColumnType::Date,
        0x0012 => ColumnType::Time,
        0x0013 => ColumnType::SmallInt,
        0x0014 => ColumnType::TinyInt,
        0x0015 => ColumnType::Duration,
        0x0020 => {
            let elem = decode_option_type(buf)?;
            ColumnType::List(Box::new(elem))
        }
        0x0021 => {
            let key = decode_option_type(buf)?;
            let val = decode_option_type(buf)?;
            ColumnType::Map(Box::new(key), Box::new(val))
        }
        0x0022 => {
            let elem = decode_option_type(buf)?;
            ColumnType::Set(Box::new(elem))
        }
        0x0030 => {
            let keyspace = decode_string(buf)?;
            let name = decode_string(buf)?;
            require(buf, 2)?;
            let count = buf.get_u16();
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let field_name = decode_string(buf)?;
                let field_ty = decode_option_type(buf)?;
                fields.push((field_name, field_ty));
            }
            ColumnType::Udt { keyspace, name, fields }
        }
        0x0031 => {
            require(buf, 2)?;
            let count = buf.get_u16();
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                fields.push(decode_option_type(buf)?);
            }
            ColumnType::Tuple(fields)
        }
        other => return Err(CodecError::UnknownType(format!("option id 0x{:04x}", other))),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn decodes_rows_metadata_with_no_metadata_flag() {
        let mut out = BytesMut::new();
        out.put_i32(FLAG_NO_METADATA);
        out.put_i32(0);
        let mut bytes = out.freeze();
        let meta = decode_rows_metadata(&mut bytes).unwrap();
        assert!(meta.columns.is_empty());
        assert!(meta.paging_state.is_none());
    }

    #[test]
    fn decodes_rows_metadata_with_paging_state() {
        let mut out = BytesMut::new();
        out.put_i32(FLAG_HAS_MORE_PAGES | FLAG_NO_METADATA);
        out.put_i32(0);
        out.put_i32(3);
        out.extend_from_slice(b"abc");
        let mut bytes = out.freeze();
        let meta = decode_rows_metadata(&mut bytes).unwrap();
        assert_eq!(meta.paging_state.as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn decodes_int_and_text_option_ids() {
        // `int` is 0x0009 and `text` is 0x000A on the wire, not 0x0008/n.a.
        // as an off-by-one table would have it.
        let mut int_buf = BytesMut::new();
        int_buf.put_u16(0x0009);
        let mut int_bytes = int_buf.freeze();
        assert_eq!(decode_option_type(&mut int_bytes).unwrap(), ColumnType::Int);

        let mut text_buf = BytesMut::new();
        text_buf.put_u16(0x000A);
        let mut text_bytes = text_buf.freeze();
        assert_eq!(decode_option_type(&mut text_bytes).unwrap(), ColumnType::Varchar);
    }

    #[test]
    fn decodes_counter_as_bigint() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0005);
        let mut bytes = buf.freeze();
        assert_eq!(decode_option_type(&mut bytes).unwrap(), ColumnType::BigInt);
    }

    #[test]
    fn decodes_custom_vector_class_name() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0000);
        let class_name = "org.apache.cassandra.db.marshal.VectorType(org.apache.cassandra.db.marshal.FloatType, 3)";
        buf.put_u16(class_name.len() as u16);
        buf.extend_from_slice(class_name.as_bytes());
        let mut bytes = buf.freeze();
        assert_eq!(
            decode_option_type(&mut bytes).unwrap(),
            ColumnType::Vector(Box::new(ColumnType::Float), 3)
        );
    }

    #[test]
    fn decodes_new_metadata_id_when_metadata_changed() {
        let mut out = BytesMut::new();
        out.put_i32(FLAG_METADATA_CHANGED | FLAG_NO_METADATA);
        out.put_i32(0);
        out.put_u16(4);
        out.extend_from_slice(b"abcd");
        let mut bytes = out.freeze();
        let meta = decode_rows_metadata(&mut bytes).unwrap();
        assert!(meta.metadata_changed);
        assert_eq!(meta.new_metadata_id.as_deref(), Some(&b"abcd"[..]));
    }
}
