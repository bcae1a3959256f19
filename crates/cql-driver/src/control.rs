//! The privileged connection used for topology/schema discovery and
//! server-pushed events. Exactly one of these exists per
//! `Session`; it owns its own [`Connection`] rather than sharing a
//! `HostPool`, keeping metadata refresh isolated from any one query's
//! dispatch path.

use crate::connection::{Connection, ServerEvent};
use crate::error::DriverError;
use crate::host::{Host, HostId};
use crate::metadata::{decode_rows_result, Row};
use crate::session::Authenticator;
use crate::topology::{ClusterData, ReplicationStrategy};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use cql_protocol::{CodecError, Opcode, PartitionerKind, ProtocolVersion, Token, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event kinds the control connection subscribes to via REGISTER.
/// `disable_schema_events` drops `SCHEMA_CHANGE` from this set.
fn register_event_types(disable_schema_events: bool) -> Vec<&'static str> {
    let mut types = vec!["TOPOLOGY_CHANGE", "STATUS_CHANGE"];
    if !disable_schema_events {
        types.push("SCHEMA_CHANGE");
    }
    types
}

/// A freshly refreshed ring: hosts, their tokens, the partitioner, and
/// per-keyspace replication strategies, ready to become a [`ClusterData`]
/// snapshot the executor swaps in atomically.
pub struct Snapshot {
    pub hosts: Vec<Host>,
    pub partitioner: PartitionerKind,
    pub strategies: HashMap<String, ReplicationStrategy>,
    ring: Vec<(Token, Host)>,
}

impl Snapshot {
    pub fn into_cluster_data(self) -> ClusterData {
        ClusterData::new(self.partitioner, self.ring, self.strategies)
    }
}

/// Per-host tokens keyed by host id, consulted only while building the
/// ring: a host's tokens belong to the ring, not its identity.
type TokensByHost = HashMap<HostId, Vec<Token>>;

pub struct ControlConnection {
    connection: std::sync::Mutex<Connection>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    disable_schema_events: bool,
}

impl ControlConnection {
    /// Opens a connection to `host`, issues REGISTER for the configured
    /// event types, and returns the handle plus its event stream.
    pub async fn open(
        host: &Host,
        version: ProtocolVersion,
        authenticator: Option<&(dyn Authenticator)>,
        disable_schema_events: bool,
        request_timeout: std::time::Duration,
        heartbeat_interval: Option<std::time::Duration>,
    ) -> Result<ControlConnection, DriverError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection =
            Connection::connect_with_options(host, version, None, authenticator, tx, request_timeout, heartbeat_interval).await?;

        let mut body = BytesMut::new();
        let types = register_event_types(disable_schema_events);
        body.extend_from_slice(&(types.len() as u16).to_be_bytes());
        for ty in &types {
            body.extend_from_slice(&(ty.len() as u16).to_be_bytes());
            body.extend_from_slice(ty.as_bytes());
        }
        let response = connection.roundtrip(Opcode::Register, body.freeze(), Default::default()).await?;
        if response.header.opcode == Opcode::Error {
            return Err(crate::connection::decode_error_body(response.body));
        }

        Ok(ControlConnection {
            connection: std::sync::Mutex::new(connection),
            events: rx,
            disable_schema_events,
        })
    }

    /// Waits for the next server-pushed event. Topology and status events
    /// for the same node may arrive back to back; callers are expected to
    /// process them strictly in receive order, topology before status,
    /// guaranteed here simply because this is the only reader of `events`
    /// and never reorders its queue.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    async fn query(&self, cql: &str) -> Result<Vec<Row>, DriverError> {
        let frame = {
            let conn = self.connection.lock().unwrap().clone();
            conn.query_simple(cql).await?
        };
        let mut body = frame.body;
        if body.remaining() < 4 {
            return Err(DriverError::Protocol(CodecError::TruncatedFrame { expected: 4, actual: body.remaining() }));
        }
        let kind = body.get_i32();
        if kind != 2 {
            return Ok(Vec::new());
        }
        let result = decode_rows_result(&mut body).map_err(DriverError::Protocol)?;
        Ok(result.rows)
    }

    /// Full metadata refresh: local node info, peers (v2 when
    /// available), and every keyspace's replication strategy, compiled
    /// into one [`Snapshot`] the caller swaps in atomically.
    pub async fn refresh(&self) -> Result<Snapshot, DriverError> {
        let local_rows = self
            .query("SELECT host_id, rpc_address, data_center, rack, tokens, partitioner FROM system.local")
            .await?;

        let partitioner = local_rows
            .first()
            .and_then(|row| text_column(row, 5))
            .map(|s| parse_partitioner(&s))
            .unwrap_or(PartitionerKind::Murmur3);

        let mut hosts = Vec::new();
        let mut tokens_by_host: TokensByHost = HashMap::new();

        for row in &local_rows {
            if let Some(host) = row_to_host(row) {
                if let Some(tokens) = set_text_column(row, 4) {
                    tokens_by_host.insert(host.id(), tokens.iter().map(|t| parse_token(partitioner, t)).collect());
                }
                hosts.push(host);
            }
        }

        let peer_rows = match self
            .query("SELECT host_id, native_address, native_port, data_center, rack, tokens FROM system.peers_v2")
            .await
        {
            Ok(rows) => rows,
            Err(_) => {
                self.query("SELECT host_id, rpc_address, data_center, rack, tokens FROM system.peers").await?
            }
        };

        for row in &peer_rows {
            if let Some(host) = row_to_host(row) {
                let token_col = if row.columns.len() >= 6 { 5 } else { 4 };
                if let Some(tokens) = set_text_column(row, token_col) {
                    tokens_by_host.insert(host.id(), tokens.iter().map(|t| parse_token(partitioner, t)).collect());
                }
                hosts.push(host);
            }
        }

        let keyspace_rows = self.query("SELECT keyspace_name, replication FROM system_schema.keyspaces").await?;
        let mut strategies = HashMap::new();
        for row in &keyspace_rows {
            let Some(name) = text_column(row, 0) else { continue };
            let Some(Value::Map(entries)) = row.columns.get(1) else { continue };
            strategies.insert(name, parse_replication_strategy(entries));
        }

        let mut ring = Vec::new();
        for host in &hosts {
            if let Some(tokens) = tokens_by_host.get(&host.id()) {
                for token in tokens {
                    ring.push((token.clone(), host.clone()));
                }
            }
        }

        Ok(Snapshot { hosts, partitioner, strategies, ring })
    }
}

fn row_to_host(row: &Row) -> Option<Host> {
    let host_id = uuid_column(row, 0)?;
    let (addr, port) = match row.columns.len() {
        // system.peers_v2 / the 6-column queries carry a separate port column.
        6 => (inet_column(row, 1)?, u16_column(row, 2)?),
        _ => (inet_column(row, 1)?, 9042u16),
    };
    let dc_index = if row.columns.len() == 6 { 3 } else { 2 };
    let rack_index = dc_index + 1;
    let dc = text_column(row, dc_index).unwrap_or_default();
    let rack = text_column(row, rack_index).unwrap_or_default();
    Some(Host::new(HostId(host_id), SocketAddr::new(addr, port), dc, rack))
}

fn uuid_column(row: &Row, index: usize) -> Option<Uuid> {
    match row.get(index)? {
        Value::Uuid(u) | Value::TimeUuid(u) => Some(*u),
        _ => None,
    }
}

fn inet_column(row: &Row, index: usize) -> Option<IpAddr> {
    match row.get(index)? {
        Value::Inet(addr) => Some(*addr),
        _ => None,
    }
}

fn u16_column(row: &Row, index: usize) -> Option<u16> {
    match row.get(index)? {
        Value::Int(v) => u16::try_from(*v).ok(),
        _ => None,
    }
}

fn text_column(row: &Row, index: usize) -> Option<String> {
    match row.get(index)? {
        Value::Text(s) | Value::Ascii(s) => Some(s.clone()),
        _ => None,
    }
}

fn set_text_column(row: &Row, index: usize) -> Option<Vec<String>> {
    match row.get(index)? {
        Value::Set(items) => Some(
            items
                .iter()
                .filter_map(|v| match v {
                    Value::Text(s) | Value::Ascii(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    }
}

fn parse_partitioner(class_name: &str) -> PartitionerKind {
    if class_name.ends_with("Murmur3Partitioner") {
        PartitionerKind::Murmur3
    } else if class_name.ends_with("RandomPartitioner") {
        PartitionerKind::Random
    } else {
        PartitionerKind::ByteOrdered
    }
}

fn parse_token(partitioner: PartitionerKind, token: &str) -> Token {
    match partitioner {
        PartitionerKind::Murmur3 => Token::Int64(token.parse().unwrap_or(0)),
        PartitionerKind::Random => Token::BigUint(token.parse().unwrap_or_default()),
        PartitionerKind::ByteOrdered => Token::Bytes(token.as_bytes().to_vec()),
    }
}

/// Parses `system_schema.keyspaces.replication`, a `map<text, text>` with
/// a `class` entry naming the strategy and strategy-specific remaining
/// entries.
fn parse_replication_strategy(entries: &[(Value, Value)]) -> ReplicationStrategy {
    let mut class = None;
    let mut options = HashMap::new();
    for (k, v) in entries {
        let (Value::Text(k) | Value::Ascii(k)) = k else { continue };
        let (Value::Text(v) | Value::Ascii(v)) = v else { continue };
        if k == "class" {
            class = Some(v.clone());
        } else {
            options.insert(k.clone(), v.clone());
        }
    }

    match class.as_deref() {
        Some(c) if c.ends_with("SimpleStrategy") => {
            let rf = options.get("replication_factor").and_then(|s| s.parse().ok()).unwrap_or(1);
            ReplicationStrategy::Simple { replication_factor: rf }
        }
        Some(c) if c.ends_with("NetworkTopologyStrategy") => {
            let datacenter_factors = options
                .into_iter()
                .filter_map(|(dc, rf)| rf.parse::<u32>().ok().map(|rf| (dc, rf)))
                .collect();
            ReplicationStrategy::NetworkTopology { datacenter_factors }
        }
        _ => ReplicationStrategy::Unknown,
    }
}

/// Inspects a server-pushed EVENT body's leading `<string>` event type so
/// the caller can dispatch without fully decoding the type-specific tail.
pub fn peek_event_type(body: &Bytes) -> Option<String> {
    let mut buf = body.clone();
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return None;
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_simple_strategy() {
        let entries = vec![
            (Value::Text("class".into()), Value::Text("org.apache.cassandra.locator.SimpleStrategy".into())),
            (Value::Text("replication_factor".into()), Value::Text("3".into())),
        ];
        match parse_replication_strategy(&entries) {
            ReplicationStrategy::Simple { replication_factor } => assert_eq!(replication_factor, 3),
            other => panic!("expected Simple, got {other:?}"),
        }
    }

    #[test]
    fn parses_network_topology_strategy() {
        let entries = vec![
            (
                Value::Text("class".into()),
                Value::Text("org.apache.cassandra.locator.NetworkTopologyStrategy".into()),
            ),
            (Value::Text("dc1".into()), Value::Text("3".into())),
            (Value::Text("dc2".into()), Value::Text("2".into())),
        ];
        match parse_replication_strategy(&entries) {
            ReplicationStrategy::NetworkTopology { datacenter_factors } => {
                assert_eq!(datacenter_factors.get("dc1"), Some(&3));
                assert_eq!(datacenter_factors.get("dc2"), Some(&2));
            }
            other => panic!("expected NetworkTopology, got {other:?}"),
        }
    }

    #[test]
    fn parses_murmur3_partitioner_class_name() {
        assert_eq!(parse_partitioner("org.apache.cassandra.dht.Murmur3Partitioner"), PartitionerKind::Murmur3);
        assert_eq!(parse_partitioner("org.apache.cassandra.dht.RandomPartitioner"), PartitionerKind::Random);
        assert_eq!(parse_partitioner("org.apache.cassandra.dht.ByteOrderedPartitioner"), PartitionerKind::ByteOrdered);
    }
}
