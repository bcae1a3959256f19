//! Ties together host selection, the connection pool, the prepared
//! statement cache, and the retry/speculative controllers into the single
//! entry point a `Session` calls for every statement.

use crate::connection::{decode_error_body, Connection};
use crate::error::{DriverError, ServerError};
use crate::host::HostId;
use crate::metadata::{decode_prepared_metadata, decode_rows_result, PreparedMetadata, RowsMetadata, RowsResult};
use crate::policy::LoadBalancingPolicy;
use crate::pool::HostPool;
use crate::prepared_cache::{CacheKey, PrepareOutcome, PreparedCache};
use crate::retry::{Retry, RetryDecision};
use crate::speculative::{self, SpeculativeExecutionPolicy};
use crate::statement::{Batch, BatchStatement, BoundStatement, ExecutionParams, PreparedStatement, Statement};
use crate::topology::SharedClusterData;
use bytes::{Buf, Bytes, BytesMut};
use cql_protocol::{Opcode, ProtocolVersion};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Executor {
    pub pools: std::sync::RwLock<Arc<HashMap<HostId, Arc<HostPool>>>>,
    pub cluster: std::sync::RwLock<SharedClusterData>,
    pub policy: Arc<dyn LoadBalancingPolicy>,
    pub prepared: PreparedCache,
    pub speculative: SpeculativeExecutionPolicy,
    pub default_keyspace: std::sync::Mutex<Option<String>>,
}

/// What came back from a successful QUERY/EXECUTE, surfaced to the
/// `Session` API layer.
#[derive(Debug, Clone)]
pub enum ExecResult {
    Rows(RowsResult),
    Void,
    SetKeyspace(String),
    SchemaChange,
}

impl Executor {
    fn cluster_snapshot(&self) -> SharedClusterData {
        self.cluster.read().unwrap().clone()
    }

    fn pool_for(&self, host_id: HostId) -> Option<Arc<HostPool>> {
        self.pools.read().unwrap().get(&host_id).cloned()
    }

    pub fn swap_cluster(&self, new_cluster: SharedClusterData) {
        *self.cluster.write().unwrap() = new_cluster;
    }

    pub fn swap_pools(&self, new_pools: Arc<HashMap<HostId, Arc<HostPool>>>) {
        *self.pools.write().unwrap() = new_pools;
    }

    pub async fn execute_statement(
        &self,
        statement: &Statement,
        mut retry: impl Retry,
    ) -> Result<ExecResult, DriverError> {
        self.run_with_retry(None, &statement.params, &mut retry, |conn, _host_id| {
            let text = statement.text.clone();
            let params = statement.params.clone();
            Box::pin(async move { send_query(&conn, &text, &params).await })
        })
        .await
    }

    pub async fn prepare(&self, text: Arc<str>) -> Result<PreparedStatement, DriverError> {
        let keyspace: Arc<str> = self
            .default_keyspace
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default()
            .into();

        let cluster = self.cluster_snapshot();
        let plan = self.policy.plan(None, &cluster);
        let mut last_err = None;

        for host in &plan {
            let Some(pool) = self.pool_for(host.id()) else { continue };
            let Some(conn) = pool.pick().await else { continue };

            let key = CacheKey {
                host_id: host.id(),
                keyspace: keyspace.clone(),
                statement_text: text.clone(),
            };

            match self.prepared.get_or_claim(&key) {
                PrepareOutcome::Ready(metadata) => {
                    return Ok(PreparedStatement {
                        text: text.clone(),
                        metadata,
                        params: ExecutionParams::default(),
                    });
                }
                PrepareOutcome::Await(mut rx) => {
                    // `wait_for` checks the current value before blocking,
                    // so this can't miss a result the preparing caller
                    // already sent before we subscribed.
                    let resolved = rx.wait_for(|v| v.is_some()).await.ok().and_then(|v| v.clone());
                    match resolved {
                        Some(Ok(metadata)) => {
                            return Ok(PreparedStatement {
                                text: text.clone(),
                                metadata,
                                params: ExecutionParams::default(),
                            });
                        }
                        Some(Err(message)) => {
                            last_err = Some(DriverError::Execution(message));
                            continue;
                        }
                        None => continue,
                    }
                }
                PrepareOutcome::MustPrepare => {
                    let mut body = BytesMut::new();
                    encode_long_string(&text, &mut body);
                    match conn.roundtrip(Opcode::Prepare, body.freeze(), Default::default()).await {
                        Ok(frame) if frame.header.opcode == Opcode::Result => {
                            let mut body = frame.body;
                            let kind = decode_i32(&mut body)?;
                            if kind != 4 {
                                self.prepared.fail(&key, "unexpected RESULT kind for PREPARE".into());
                                last_err = Some(DriverError::Execution("unexpected RESULT kind for PREPARE".into()));
                                continue;
                            }
                            let prepared = decode_prepared_metadata(
                                &mut body,
                                conn.protocol_version() == ProtocolVersion::V5,
                            )?;
                            let prepared = Arc::new(prepared);
                            self.prepared.complete(&key, prepared.clone());
                            return Ok(PreparedStatement {
                                text: text.clone(),
                                metadata: prepared,
                                params: ExecutionParams::default(),
                            });
                        }
                        Ok(frame) if frame.header.opcode == Opcode::Error => {
                            let err = decode_error_body(frame.body);
                            self.prepared.fail(&key, err.to_string());
                            last_err = Some(err);
                        }
                        Ok(_other) => {
                            self.prepared.fail(&key, "unexpected opcode for PREPARE response".into());
                        }
                        Err(e) => {
                            self.prepared.fail(&key, e.to_string());
                            last_err = Some(e);
                        }
                    }
                }
            }
        }

        Err(last_err.unwrap_or(DriverError::NoHostAvailable))
    }

    pub async fn execute_bound(
        &self,
        bound: &BoundStatement,
        mut retry: impl Retry,
    ) -> Result<ExecResult, DriverError> {
        let params = bound.prepared.params.clone();
        self.run_with_retry(Some(bound), &params, &mut retry, |conn, host_id| {
            let bound = bound.clone();
            Box::pin(async move { self.send_execute_reprepare(&conn, &bound, host_id).await })
        })
        .await
    }

    pub async fn execute_batch(&self, batch: &Batch, mut retry: impl Retry) -> Result<(), DriverError> {
        // Validated client-side before any frame is sent: the protocol's
        // BATCH statement count is a u16, so 65,536 is already
        // unrepresentable on the wire.
        if batch.statements.len() > u16::MAX as usize {
            return Err(DriverError::TooManyStatements(batch.statements.len()));
        }

        let first_bound = batch.statements.iter().find_map(|s| match s {
            BatchStatement::Prepared(b) => Some(b.clone()),
            _ => None,
        });
        let params = batch.params.clone();

        self.run_with_retry(first_bound.as_ref(), &params, &mut retry, |conn, _host_id| {
            let batch = batch.clone();
            Box::pin(async move { send_batch(&conn, &batch).await })
        })
        .await?;
        Ok(())
    }

    /// Sends EXECUTE for `bound`; if the server reports `UNPREPARED` for its
    /// statement id, re-prepares the same text on the same socket and
    /// retries EXECUTE exactly once before giving up, so the caller never
    /// observes `UNPREPARED` itself.
    async fn send_execute_reprepare(
        &self,
        conn: &Connection,
        bound: &BoundStatement,
        host_id: HostId,
    ) -> Result<ExecResult, DriverError> {
        match send_execute(conn, bound).await {
            Ok(ExecResult::Rows(rows)) if rows.metadata.metadata_changed => {
                self.record_metadata_change(host_id, bound, &rows);
                Ok(ExecResult::Rows(rows))
            }
            Err(DriverError::Server(ServerError::Unprepared { .. })) => {
                let keyspace: Arc<str> = self
                    .default_keyspace
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_default()
                    .into();
                let key = CacheKey {
                    host_id,
                    keyspace,
                    statement_text: bound.prepared.text.clone(),
                };
                self.prepared.invalidate(&key);

                let mut body = BytesMut::new();
                encode_long_string(&bound.prepared.text, &mut body);
                let frame = conn.roundtrip(Opcode::Prepare, body.freeze(), Default::default()).await?;
                match frame.header.opcode {
                    Opcode::Result => {
                        let mut result_body = frame.body;
                        let kind = decode_i32(&mut result_body)?;
                        if kind != 4 {
                            let err = DriverError::Execution("unexpected RESULT kind for PREPARE".into());
                            self.prepared.fail(&key, err.to_string());
                            return Err(err);
                        }
                        let new_metadata = decode_prepared_metadata(
                            &mut result_body,
                            conn.protocol_version() == ProtocolVersion::V5,
                        )
                        .map_err(DriverError::Protocol)?;
                        if new_metadata.statement_id != bound.prepared.metadata.statement_id {
                            // A differing id is still usable; it just means
                            // this host's id for the text changed underneath
                            // the cached entry.
                            tracing::debug!(
                                addr = %conn.remote_addr(),
                                "re-prepare returned a different statement id for the same text",
                            );
                        }
                        let new_metadata = Arc::new(new_metadata);
                        self.prepared.complete(&key, new_metadata.clone());
                        let retried = BoundStatement {
                            prepared: PreparedStatement {
                                text: bound.prepared.text.clone(),
                                metadata: new_metadata,
                                params: bound.prepared.params.clone(),
                            },
                            values: bound.values.clone(),
                        };
                        match send_execute(conn, &retried).await {
                            Ok(ExecResult::Rows(rows)) if rows.metadata.metadata_changed => {
                                self.record_metadata_change(host_id, &retried, &rows);
                                Ok(ExecResult::Rows(rows))
                            }
                            other => other,
                        }
                    }
                    Opcode::Error => {
                        let err = decode_error_body(frame.body);
                        self.prepared.fail(&key, err.to_string());
                        Err(err)
                    }
                    other => Err(DriverError::Protocol(cql_protocol::CodecError::UnexpectedOpcode(other as u8))),
                }
            }
            other => other,
        }
    }

    /// Applies a protocol v5 `Metadata_changed` RESULT to the
    /// prepared-statement cache, so the next
    /// EXECUTE of this statement on any connection picks up the new result
    /// columns instead of re-decoding rows against stale metadata.
    fn record_metadata_change(&self, host_id: HostId, bound: &BoundStatement, rows: &RowsResult) {
        let Some(new_metadata_id) = rows.metadata.new_metadata_id.clone() else {
            return;
        };
        let keyspace: Arc<str> = self
            .default_keyspace
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default()
            .into();
        let key = CacheKey {
            host_id,
            keyspace,
            statement_text: bound.prepared.text.clone(),
        };
        let updated = Arc::new(PreparedMetadata {
            statement_id: bound.prepared.metadata.statement_id.clone(),
            result_metadata_id: Some(new_metadata_id),
            bind_columns: bound.prepared.metadata.bind_columns.clone(),
            result_columns: rows.metadata.columns.clone(),
            pk_indices: bound.prepared.metadata.pk_indices.clone(),
        });
        self.prepared.update_result_metadata(&key, updated);
    }

    /// Common retry/speculative-execution harness shared by query, bound
    /// execute, and batch. `send` performs one attempt against a given
    /// connection and returns its parsed result.
    async fn run_with_retry<'a, Send>(
        &'a self,
        bound: Option<&'a BoundStatement>,
        params: &ExecutionParams,
        retry: &mut impl Retry,
        send: Send,
    ) -> Result<ExecResult, DriverError>
    where
        Send: Fn(Connection, HostId) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ExecResult, DriverError>> + std::marker::Send + 'a>>,
    {
        let cluster = self.cluster_snapshot();
        let mut plan = self.policy.plan(bound, &cluster);
        retry.reset();
        let mut attempts: u32 = 0;

        loop {
            if plan.is_empty() {
                return Err(DriverError::NoHostAvailable);
            }

            let idempotent = params.idempotent;
            let plan_len = plan.len();
            let pools = self.pools.read().unwrap().clone();
            let send = &send;
            let plan_ref = &plan;

            let result = speculative::race(plan_len, self.speculative, idempotent, move |i| {
                let host = plan_ref[i].clone();
                let pools = pools.clone();
                async move {
                    let pool = pools.get(&host.id()).cloned().ok_or(DriverError::NoHostAvailable)?;
                    let conn = pool.pick().await.ok_or(DriverError::NoHostAvailable)?;
                    send(conn, host.id()).await
                }
            })
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempts += 1;
                    match retry.decide(&e, idempotent, attempts) {
                        RetryDecision::Rethrow => return Err(e),
                        RetryDecision::RetrySame => {
                            if let Some(delay) = retry.backoff(attempts) {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        RetryDecision::RetryNext => {
                            if !plan.is_empty() {
                                plan.remove(0);
                            }
                            if let Some(delay) = retry.backoff(attempts) {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        RetryDecision::Ignore => {}
                    }
                }
            }
        }
    }
}

async fn send_query(conn: &Connection, text: &str, params: &ExecutionParams) -> Result<ExecResult, DriverError> {
    let mut body = BytesMut::new();
    encode_long_string(text, &mut body);
    encode_query_params(&mut body, &[], params);
    let frame = conn.roundtrip(Opcode::Query, body.freeze(), Default::default()).await?;
    parse_result_frame(frame)
}

async fn send_execute(conn: &Connection, bound: &BoundStatement) -> Result<ExecResult, DriverError> {
    let mut body = BytesMut::new();
    encode_short_bytes(&bound.prepared.metadata.statement_id, &mut body);
    let values = bound.bind_values_encoded().map_err(DriverError::Protocol)?;
    encode_query_params(&mut body, &values, &bound.prepared.params);
    let frame = conn.roundtrip(Opcode::Execute, body.freeze(), Default::default()).await?;
    let result = parse_result_frame(frame)?;
    Ok(result)
}

async fn send_batch(conn: &Connection, batch: &Batch) -> Result<ExecResult, DriverError> {
    let mut body = BytesMut::new();
    let batch_type = match batch.batch_type {
        crate::statement::BatchType::Logged => 0u8,
        crate::statement::BatchType::Unlogged => 1u8,
        crate::statement::BatchType::Counter => 2u8,
    };
    body.extend_from_slice(&[batch_type]);
    body.extend_from_slice(&(batch.statements.len() as u16).to_be_bytes());
    for stmt in &batch.statements {
        match stmt {
            BatchStatement::Simple { text, values } => {
                body.extend_from_slice(&[0u8]);
                encode_long_string(text, &mut body);
                body.extend_from_slice(&(values.len() as u16).to_be_bytes());
                for v in values {
                    cql_protocol::value::encode_value(&cql_protocol::ColumnType::Blob, v, &mut body)
                        .map_err(DriverError::Protocol)?;
                }
            }
            BatchStatement::Prepared(bound) => {
                body.extend_from_slice(&[1u8]);
                encode_short_bytes(&bound.prepared.metadata.statement_id, &mut body);
                body.extend_from_slice(&(bound.values.len() as u16).to_be_bytes());
                for (v, col) in bound.values.iter().zip(&bound.prepared.metadata.bind_columns) {
                    cql_protocol::value::encode_value(&col.ty, v, &mut body).map_err(DriverError::Protocol)?;
                }
            }
        }
    }
    body.extend_from_slice(&batch.params.consistency.to_u16().to_be_bytes());
    body.extend_from_slice(&[0x00]);

    let frame = conn.roundtrip(Opcode::Batch, body.freeze(), Default::default()).await?;
    parse_result_frame(frame)
}

fn parse_result_frame(frame: cql_protocol::Frame) -> Result<ExecResult, DriverError> {
    match frame.header.opcode {
        Opcode::Error => Err(decode_error_body(frame.body)),
        Opcode::Result => {
            let mut body = frame.body;
            let kind = decode_i32(&mut body)?;
            match kind {
                1 => Ok(ExecResult::Void),
                2 => {
                    let result = decode_rows_result(&mut body).map_err(DriverError::Protocol)?;
                    Ok(ExecResult::Rows(result))
                }
                3 => {
                    let ks = decode_string(&mut body)?;
                    Ok(ExecResult::SetKeyspace(ks))
                }
                5 => Ok(ExecResult::SchemaChange),
                4 => Err(DriverError::Execution("unexpected PREPARE result in query/execute path".into())),
                other => Err(DriverError::Execution(format!("unknown RESULT kind {other}"))),
            }
        }
        other => Err(DriverError::Protocol(cql_protocol::CodecError::UnexpectedOpcode(other as u8))),
    }
}

/// `values` are already-encoded `[bytes]` wire values (4-byte length
/// prefix included, via [`BoundStatement::bind_values_encoded`]); this
/// keeps the per-column type information out of the framing code, which
/// has no business knowing about `ColumnType`.
fn encode_query_params(body: &mut BytesMut, values: &[Bytes], params: &ExecutionParams) {
    body.extend_from_slice(&params.consistency.to_u16().to_be_bytes());

    let mut flags = 0u8;
    const FLAG_VALUES: u8 = 0x01;
    const FLAG_PAGE_SIZE: u8 = 0x04;
    const FLAG_PAGING_STATE: u8 = 0x08;
    const FLAG_SERIAL_CONSISTENCY: u8 = 0x10;
    const FLAG_TIMESTAMP: u8 = 0x20;

    if !values.is_empty() {
        flags |= FLAG_VALUES;
    }
    if params.page_size.is_some() {
        flags |= FLAG_PAGE_SIZE;
    }
    if params.paging_state.is_some() {
        flags |= FLAG_PAGING_STATE;
    }
    if params.serial_consistency.is_some() {
        flags |= FLAG_SERIAL_CONSISTENCY;
    }
    if params.timestamp.is_some() {
        flags |= FLAG_TIMESTAMP;
    }

    body.extend_from_slice(&[flags]);

    if flags & FLAG_VALUES != 0 {
        body.extend_from_slice(&(values.len() as u16).to_be_bytes());
        for v in values {
            body.extend_from_slice(v);
        }
    }
    if flags & FLAG_PAGE_SIZE != 0 {
        body.extend_from_slice(&params.page_size.unwrap().to_be_bytes());
    }
    if flags & FLAG_PAGING_STATE != 0 {
        let state = params.paging_state.as_ref().unwrap();
        body.extend_from_slice(&(state.len() as i32).to_be_bytes());
        body.extend_from_slice(state);
    }
    if flags & FLAG_SERIAL_CONSISTENCY != 0 {
        body.extend_from_slice(&params.serial_consistency.unwrap().to_u16().to_be_bytes());
    }
    if flags & FLAG_TIMESTAMP != 0 {
        body.extend_from_slice(&params.timestamp.unwrap().to_be_bytes());
    }
}

fn encode_long_string(s: &str, out: &mut BytesMut) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_short_bytes(b: &[u8], out: &mut BytesMut) {
    out.extend_from_slice(&(b.len() as u16).to_be_bytes());
    out.extend_from_slice(b);
}

fn decode_i32(buf: &mut Bytes) -> Result<i32, DriverError> {
    if buf.remaining() < 4 {
        return Err(DriverError::Protocol(cql_protocol::CodecError::TruncatedFrame { expected: 4, actual: buf.remaining() }));
    }
    Ok(buf.get_i32())
}

fn decode_string(buf: &mut Bytes) -> Result<String, DriverError> {
    if buf.remaining() < 2 {
        return Err(DriverError::Protocol(cql_protocol::CodecError::TruncatedFrame { expected: 2, actual: buf.remaining() }));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(DriverError::Protocol(cql_protocol::CodecError::TruncatedFrame { expected: len, actual: buf.remaining() }));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| DriverError::Protocol(cql_protocol::CodecError::InvalidUtf8))
}
