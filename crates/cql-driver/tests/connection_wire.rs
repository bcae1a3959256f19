//! Exercises `Connection` against a hand-rolled fake server bound to a
//! loopback socket, rather than mocking at the frame level: the STARTUP
//! handshake, a QUERY roundtrip, the request timeout, and the idle
//! heartbeat all depend on real read/write interleaving over a socket
//! that unit tests inside `connection.rs` can't reach.

use bytes::{BufMut, Bytes, BytesMut};
use cql_driver::connection::Connection;
use cql_driver::host::{Host, HostId};
use cql_protocol::{decode_header, try_decode_frame, Direction, Frame, FrameFlags, Opcode, ProtocolVersion};
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

/// A READY with no keyspace and no auth: the minimal handshake a server
/// offers when it has no AUTHENTICATE to issue.
async fn serve_ready_handshake(mut socket: TcpStream) -> TcpStream {
    let startup = read_frame(&mut socket).await;
    assert_eq!(startup.header.opcode, Opcode::Startup);
    write_frame(&mut socket, startup.header.stream, Opcode::Ready, &[]).await;
    socket
}

#[tokio::test]
async fn connect_completes_ready_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        serve_ready_handshake(socket).await;
    });

    let host = loopback_host(addr);
    let (tx, _rx) = mpsc::unbounded_channel();
    let conn = Connection::connect(&host, ProtocolVersion::V4, None, None, tx).await.unwrap();
    assert!(!conn.is_closed());
    assert_eq!(conn.protocol_version(), ProtocolVersion::V4);

    server.await.unwrap();
}

#[tokio::test]
async fn query_simple_round_trips_a_rows_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = serve_ready_handshake(socket).await;

        let query = read_frame(&mut socket).await;
        assert_eq!(query.header.opcode, Opcode::Query);

        // Void result: kind=1 (Void), the simplest RESULT body that still
        // proves the roundtrip delivered the response to the right stream.
        let mut body = BytesMut::new();
        body.put_i32(1);
        write_frame(&mut socket, query.header.stream, Opcode::Result, &body).await;
    });

    let host = loopback_host(addr);
    let (tx, _rx) = mpsc::unbounded_channel();
    let conn = Connection::connect(&host, ProtocolVersion::V4, None, None, tx).await.unwrap();

    let response = conn.query_simple("SELECT * FROM system.local").await.unwrap();
    assert_eq!(response.header.opcode, Opcode::Result);

    server.await.unwrap();
}

#[tokio::test]
async fn roundtrip_times_out_when_server_never_replies() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = serve_ready_handshake(socket).await;
        // Never answer the QUERY; hold the socket open past the test.
        let _ = read_frame(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let host = loopback_host(addr);
    let (tx, _rx) = mpsc::unbounded_channel();
    let conn = Connection::connect_with_options(&host, ProtocolVersion::V4, None, None, tx, Duration::from_millis(100), None)
        .await
        .unwrap();

    let err = conn.query_simple("SELECT * FROM system.local").await.unwrap_err();
    assert!(matches!(err, cql_driver::error::DriverError::Timeout), "expected Timeout, got {err:?}");

    server.abort();
}

#[tokio::test]
async fn idle_connection_sends_options_heartbeat() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = serve_ready_handshake(socket).await;

        let heartbeat = read_frame(&mut socket).await;
        assert_eq!(heartbeat.header.opcode, Opcode::Options);
        write_frame(&mut socket, heartbeat.header.stream, Opcode::Supported, &Bytes::new()).await;
    });

    let host = loopback_host(addr);
    let (tx, _rx) = mpsc::unbounded_channel();
    let conn = Connection::connect_with_options(
        &host,
        ProtocolVersion::V4,
        None,
        None,
        tx,
        Duration::from_secs(12),
        Some(Duration::from_millis(50)),
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn failed_heartbeat_closes_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = serve_ready_handshake(socket).await;
        let heartbeat = read_frame(&mut socket).await;
        assert_eq!(heartbeat.header.opcode, Opcode::Options);
        drop(socket);
    });

    let host = loopback_host(addr);
    let (tx, _rx) = mpsc::unbounded_channel();
    let conn = Connection::connect_with_options(
        &host,
        ProtocolVersion::V4,
        None,
        None,
        tx,
        Duration::from_millis(200),
        Some(Duration::from_millis(50)),
    )
    .await
    .unwrap();

    server.await.unwrap();
    // The background heartbeat task needs a moment after the peer drop to
    // observe the failed roundtrip and flip the closed flag.
    for _ in 0..20 {
        if conn.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(conn.is_closed());
}

#[tokio::test]
async fn decode_header_rejects_unknown_protocol_version() {
    let mut buf = BytesMut::new();
    buf.put_u8(0x7F); // nonsense version nibble, request direction
    buf.put_u8(0);
    buf.put_i16(0);
    buf.put_u8(Opcode::Options as u8);
    buf.put_u32(0);
    assert!(decode_header(&buf).is_err());
}
