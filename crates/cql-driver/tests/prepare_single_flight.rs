//! Exercises single-flight PREPARE coordination under real concurrency:
//! several `Executor::prepare()` callers for the same statement text,
//! sharing one connection, against a fake server that only ever answers
//! one PREPARE frame.

use bytes::{BufMut, BytesMut};
use cql_driver::executor::Executor;
use cql_driver::host::{Host, HostId};
use cql_driver::policy::RoundRobinPolicy;
use cql_driver::pool::{HostPool, PoolConfig};
use cql_driver::prepared_cache::PreparedCache;
use cql_driver::speculative::SpeculativeExecutionPolicy;
use cql_driver::topology::ClusterData;
use cql_protocol::{try_decode_frame, Direction, Frame, FrameFlags, Opcode, PartitionerKind, ProtocolVersion};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

fn loopback_host(addr: std::net::SocketAddr) -> Host {
    Host::new(HostId(Uuid::nil()), addr, "dc1".to_string(), "rack1".to_string())
}

async fn read_frame(socket: &mut TcpStream) -> Frame {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Ok(Some(frame)) = try_decode_frame(&mut buf) {
            return frame;
        }
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await.expect("peer closed before sending a full frame");
        assert!(n > 0, "peer closed before sending a full frame");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_frame(socket: &mut TcpStream, stream: i16, opcode: Opcode, body: &[u8]) {
    let mut out = BytesMut::new();
    cql_protocol::encode_frame(ProtocolVersion::V4, Direction::Response, FrameFlags::default(), stream, opcode, body, &mut out);
    socket.write_all(&out).await.unwrap();
}

/// Minimal PREPARE RESULT (kind=4) body: zero bind columns, zero pk
/// columns, and `FLAG_NO_METADATA` set on the nested result metadata so
/// there's no column list to encode either.
fn minimal_prepared_result_body(statement_id: &[u8]) -> BytesMut {
    const FLAG_NO_METADATA: i32 = 0x0004;
    let mut body = BytesMut::new();
    body.put_i32(4); // kind: Prepared
    body.put_u16(statement_id.len() as u16);
    body.extend_from_slice(statement_id);
    body.put_i32(0); // flags: no global table spec
    body.put_i32(0); // column_count
    body.put_i32(0); // pk_count
    body.put_i32(FLAG_NO_METADATA); // result metadata flags
    body.put_i32(0); // result metadata column_count
    body
}

#[tokio::test]
async fn concurrent_prepare_calls_issue_exactly_one_prepare_frame() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let prepare_count = Arc::new(AtomicUsize::new(0));
    let server_prepare_count = prepare_count.clone();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let startup = read_frame(&mut socket).await;
        assert_eq!(startup.header.opcode, Opcode::Startup);
        write_frame(&mut socket, startup.header.stream, Opcode::Ready, &[]).await;

        // Exactly one PREPARE is expected: every other concurrent caller
        // must resolve off the single in-flight result instead of sending
        // its own request.
        let prepare = read_frame(&mut socket).await;
        assert_eq!(prepare.header.opcode, Opcode::Prepare);
        server_prepare_count.fetch_add(1, Ordering::SeqCst);

        let body = minimal_prepared_result_body(b"stmt-id");
        write_frame(&mut socket, prepare.header.stream, Opcode::Result, &body).await;

        // Hold the socket open so a second, unexpected PREPARE would be
        // observable (and hang the test on an unconsumed read) rather
        // than silently succeeding against a closed connection.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let host = loopback_host(addr);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let pool_config = Arc::new(PoolConfig {
        connections_per_host: 1,
        protocol_version: ProtocolVersion::V4,
        keyspace: None,
        request_timeout: Duration::from_secs(5),
        heartbeat_interval: None,
    });
    let pool = Arc::new(HostPool::new(host.clone(), pool_config, events_tx));
    pool.fill(None).await.unwrap();

    let mut pools = HashMap::new();
    pools.insert(host.id(), pool);
    let ring = vec![(cql_protocol::Token::Int64(0), host.clone())];
    let cluster = Arc::new(ClusterData::new(PartitionerKind::Murmur3, ring, HashMap::new()));

    let executor = Arc::new(Executor {
        pools: std::sync::RwLock::new(Arc::new(pools)),
        cluster: std::sync::RwLock::new(cluster),
        policy: Arc::new(RoundRobinPolicy::new()),
        prepared: PreparedCache::new(10),
        speculative: SpeculativeExecutionPolicy::Disabled,
        default_keyspace: std::sync::Mutex::new(None),
    });

    let text: Arc<str> = Arc::from("SELECT * FROM ks.t WHERE k = ?");
    let mut callers = Vec::new();
    for _ in 0..8 {
        let executor = executor.clone();
        let text = text.clone();
        callers.push(tokio::spawn(async move { executor.prepare(text).await }));
    }

    for caller in callers {
        let prepared = caller.await.unwrap().unwrap();
        assert_eq!(&prepared.metadata.statement_id[..], b"stmt-id");
    }

    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    assert_eq!(prepare_count.load(Ordering::SeqCst), 1);
}
