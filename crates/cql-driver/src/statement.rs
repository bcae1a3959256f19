//! What a caller hands the executor: a bare CQL string, a prepared
//! statement handle, or a batch of either.

use crate::metadata::PreparedMetadata;
use cql_protocol::{Consistency, SerialConsistency, Value};
use std::sync::Arc;

/// Per-statement execution parameters that aren't part of the statement
/// text itself, carried in QUERY/EXECUTE's parameter block.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub page_size: Option<i32>,
    pub paging_state: Option<bytes::Bytes>,
    pub timestamp: Option<i64>,
    /// Whether it is safe to retry or speculatively re-send this
    /// statement. Defaults to `false`: a driver that assumed idempotence
    /// would silently double-apply non-idempotent writes on retry.
    pub idempotent: bool,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        ExecutionParams {
            consistency: Consistency::LocalQuorum,
            serial_consistency: None,
            page_size: Some(5000),
            paging_state: None,
            timestamp: None,
            idempotent: false,
        }
    }
}

/// A bare CQL string to be sent as a QUERY frame, or re-sent (after a
/// first-time PREPARE round-trip the executor manages transparently) as
/// an EXECUTE frame once it has been prepared and cached.
#[derive(Debug, Clone)]
pub struct Statement {
    pub text: Arc<str>,
    pub params: ExecutionParams,
}

impl Statement {
    pub fn new(text: impl Into<Arc<str>>) -> Statement {
        Statement {
            text: text.into(),
            params: ExecutionParams::default(),
        }
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.params.consistency = consistency;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.params.idempotent = true;
        self
    }
}

/// A handle to a statement that has been PREPAREd against the cluster at
/// least once. Safe to reuse across many executions and many connections:
/// the executor re-prepares transparently per-connection as needed on an
/// `UNPREPARED` response.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub text: Arc<str>,
    pub metadata: Arc<PreparedMetadata>,
    pub params: ExecutionParams,
}

impl PreparedStatement {
    pub fn bind(&self, values: Vec<Value>) -> BoundStatement {
        BoundStatement {
            prepared: self.clone(),
            values,
        }
    }
}

/// A prepared statement with its bind values attached, ready to execute.
#[derive(Debug, Clone)]
pub struct BoundStatement {
    pub prepared: PreparedStatement,
    pub values: Vec<Value>,
}

impl BoundStatement {
    /// The serialized partition key the server would use to route this
    /// request, computed from `pk_indices`: each indexed bind value's
    /// body bytes, concatenated with a 2-byte length prefix and a
    /// trailing `0x00` per component
    /// when there's more than one (Cassandra's "composite key" wire
    /// format), or the bare bytes when there's exactly one.
    pub fn routing_key(&self) -> Option<smallvec::SmallVec<[u8; 64]>> {
        let pk_indices = &self.prepared.metadata.pk_indices;
        if pk_indices.is_empty() {
            return None;
        }
        let mut components: Vec<bytes::BytesMut> = Vec::with_capacity(pk_indices.len());
        for &idx in pk_indices {
            let col = self.prepared.metadata.bind_columns.get(idx as usize)?;
            let value = self.values.get(idx as usize)?;
            let mut body = bytes::BytesMut::new();
            cql_protocol::value::encode_value(&col.ty, value, &mut body).ok()?;
            // encode_value writes a 4-byte length prefix; strip it back off
            // since the routing key wants raw component bytes.
            components.push(body.split_off(4));
        }

        let mut key = smallvec::SmallVec::new();
        if components.len() == 1 {
            key.extend_from_slice(&components[0]);
        } else {
            for component in &components {
                let len = component.len() as u16;
                key.extend_from_slice(&len.to_be_bytes());
                key.extend_from_slice(component);
                key.push(0);
            }
        }
        Some(key)
    }

    /// Encodes every bind value against its bind-column type, each already
    /// carrying its own 4-byte `[bytes]` length prefix (or unset/null
    /// encoding) as EXECUTE's VALUES block expects.
    pub fn bind_values_encoded(&self) -> Result<Vec<bytes::Bytes>, cql_protocol::CodecError> {
        self.values
            .iter()
            .zip(&self.prepared.metadata.bind_columns)
            .map(|(value, col)| {
                let mut body = bytes::BytesMut::new();
                cql_protocol::value::encode_value(&col.ty, value, &mut body)?;
                Ok(body.freeze())
            })
            .collect()
    }
}

/// One entry in a BATCH: either an unprepared string with
/// literal values, or a prepared statement id with bind values.
#[derive(Debug, Clone)]
pub enum BatchStatement {
    Simple { text: Arc<str>, values: Vec<Value> },
    Prepared(BoundStatement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    Logged,
    Unlogged,
    Counter,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_type: BatchType,
    pub statements: Vec<BatchStatement>,
    pub params: ExecutionParams,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Batch {
        Batch {
            batch_type,
            statements: Vec::new(),
            params: ExecutionParams {
                page_size: None,
                ..ExecutionParams::default()
            },
        }
    }
}
