//! One multiplexed TCP connection to a single host. Frames are
//! read by a single background task and dispatched to whichever caller is
//! waiting on that stream id; writes are serialized through an
//! async-aware mutex so many callers can share one socket the way the
//! protocol's stream multiplexing intends.

use crate::error::{DriverError, ServerError};
use crate::host::Host;
use crate::stream_id::StreamIdAllocator;
use bytes::{Buf, Bytes, BytesMut};
use cql_protocol::{decode_header, try_decode_frame, Direction, Frame, FrameFlags, Opcode, ProtocolVersion};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::Duration;

/// Server-pushed frames with a negative stream id: schema/topology/status
/// change notifications requested via REGISTER.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub body: Bytes,
}

struct PendingSlot {
    reply: oneshot::Sender<Result<Frame, DriverError>>,
}

struct Shared {
    pending: Mutex<HashMap<i16, PendingSlot>>,
    allocator: Mutex<StreamIdAllocator>,
    writer: AsyncMutex<WriteHalf<TcpStream>>,
    addr: std::net::SocketAddr,
    version: ProtocolVersion,
    closed: std::sync::atomic::AtomicBool,
    request_timeout: Duration,
    last_activity: Mutex<Instant>,
}

/// A live connection to one host. Cheap to clone; clones share the
/// underlying socket and background reader task.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Opens a TCP connection, negotiates the protocol version and
    /// compression via OPTIONS/STARTUP, and spawns the background reader.
    /// Authentication (if the server sends AUTHENTICATE) is driven by
    /// `authenticator`. `heartbeat_interval`, if set, starts a background
    /// task that sends an idle-triggered OPTIONS frame.
    pub async fn connect(
        host: &Host,
        version: ProtocolVersion,
        keyspace: Option<&str>,
        authenticator: Option<&(dyn crate::session::Authenticator)>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Connection, DriverError> {
        Connection::connect_with_options(host, version, keyspace, authenticator, events, Duration::from_secs(12), None).await
    }

    pub async fn connect_with_options(
        host: &Host,
        version: ProtocolVersion,
        keyspace: Option<&str>,
        authenticator: Option<&(dyn crate::session::Authenticator)>,
        events: mpsc::UnboundedSender<ServerEvent>,
        request_timeout: Duration,
        heartbeat_interval: Option<Duration>,
    ) -> Result<Connection, DriverError> {
        let addr = host.rpc_address();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| DriverError::Connection { addr, source })?;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = tokio::io::split(stream);

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            allocator: Mutex::new(StreamIdAllocator::new()),
            writer: AsyncMutex::new(write_half),
            addr,
            version,
            closed: std::sync::atomic::AtomicBool::new(false),
            request_timeout,
            last_activity: Mutex::new(Instant::now()),
        });

        let conn = Connection { shared };
        conn.spawn_reader(read_half, events);

        conn.startup(keyspace, authenticator).await?;

        if let Some(interval) = heartbeat_interval {
            conn.spawn_heartbeat(interval);
        }

        Ok(conn)
    }

    /// Sends an idle-triggered OPTIONS frame whenever no frame has crossed
    /// the wire in either direction for `interval`; a failed
    /// or timed-out heartbeat marks the connection `Closed` the same way a
    /// read error on the background reader does.
    fn spawn_heartbeat(&self, interval: Duration) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if conn.is_closed() {
                    return;
                }
                let idle = conn.shared.last_activity.lock().unwrap().elapsed();
                if idle < interval {
                    continue;
                }
                match conn.roundtrip(Opcode::Options, Bytes::new(), FrameFlags::default()).await {
                    Ok(frame) if frame.header.opcode == Opcode::Supported => {}
                    _ => {
                        tracing::warn!(addr = %conn.shared.addr, "heartbeat failed, closing connection");
                        conn.shared.closed.store(true, std::sync::atomic::Ordering::Release);
                        return;
                    }
                }
            }
        });
    }

    fn spawn_reader(&self, read_half: ReadHalf<TcpStream>, events: mpsc::UnboundedSender<ServerEvent>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut reader = read_half;
            if shared.version.supports_segmentation() {
                let mut segment_buf = BytesMut::with_capacity(64 * 1024);
                let mut frame_buf = BytesMut::with_capacity(64 * 1024);
                loop {
                    match read_one_segment(&mut reader, &mut segment_buf).await {
                        Ok(Some(segment)) => {
                            // Compression isn't negotiated by this driver yet,
                            // so every segment payload is carried uncompressed.
                            match cql_protocol::decompress_payload(cql_protocol::SegmentCompression::None, &segment.payload) {
                                Ok(payload) => frame_buf.extend_from_slice(&payload),
                                Err(_) => {
                                    close_connection(&shared);
                                    break;
                                }
                            }
                            loop {
                                match try_decode_frame(&mut frame_buf) {
                                    Ok(Some(frame)) => dispatch_frame(&shared, &events, frame),
                                    Ok(None) => break,
                                    Err(_) => {
                                        close_connection(&shared);
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(None) | Err(_) => {
                            close_connection(&shared);
                            break;
                        }
                    }
                }
            } else {
                let mut buf = BytesMut::with_capacity(64 * 1024);
                loop {
                    match read_one_frame(&mut reader, &mut buf).await {
                        Ok(Some(frame)) => dispatch_frame(&shared, &events, frame),
                        Ok(None) | Err(_) => {
                            close_connection(&shared);
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn startup(&self, keyspace: Option<&str>, authenticator: Option<&(dyn crate::session::Authenticator)>) -> Result<(), DriverError> {
        let mut options = indexmap::IndexMap::new();
        options.insert("CQL_VERSION".to_string(), "3.0.0".to_string());
        let body = encode_string_map(&options);
        let response = self.roundtrip(Opcode::Startup, body, FrameFlags::default()).await?;

        match response.header.opcode {
            Opcode::Ready => {}
            Opcode::Authenticate => {
                self.handle_authenticate(response.body, authenticator).await?;
            }
            Opcode::Error => return Err(decode_error_body(response.body)),
            other => return Err(DriverError::Protocol(cql_protocol::CodecError::UnexpectedOpcode(other as u8))),
        }

        if let Some(ks) = keyspace {
            let use_stmt = format!("USE \"{}\"", ks.replace('"', "\"\""));
            self.query_simple(&use_stmt).await?;
        }
        Ok(())
    }

    async fn handle_authenticate(&self, _body: Bytes, authenticator: Option<&(dyn crate::session::Authenticator)>) -> Result<(), DriverError> {
        let Some(authenticator) = authenticator else {
            return Err(DriverError::Configuration(
                "server requires authentication but no authenticator was configured".to_string(),
            ));
        };
        let mut token = authenticator.initial_response();
        loop {
            let mut body = BytesMut::new();
            encode_bytes(&token, &mut body);
            let response = self.roundtrip(Opcode::AuthResponse, body.freeze(), FrameFlags::default()).await?;
            match response.header.opcode {
                Opcode::AuthSuccess => return Ok(()),
                Opcode::AuthChallenge => {
                    let mut body = response.body;
                    let challenge = decode_bytes(&mut body)?;
                    token = authenticator.evaluate_challenge(&challenge);
                }
                Opcode::Error => return Err(decode_error_body(response.body)),
                other => return Err(DriverError::Protocol(cql_protocol::CodecError::UnexpectedOpcode(other as u8))),
            }
        }
    }

    /// Sends a bare QUERY frame and returns its raw response frame;
    /// exposed for STARTUP's `USE` and for the control connection's
    /// system-table bootstrap queries that don't need the full executor.
    pub async fn query_simple(&self, cql: &str) -> Result<Frame, DriverError> {
        let mut body = BytesMut::new();
        encode_long_string(cql, &mut body);
        body.extend_from_slice(&cql_protocol::Consistency::One.to_u16().to_be_bytes());
        body.extend_from_slice(&[0x00]); // empty query flags byte (v3/v4)
        let response = self.roundtrip(Opcode::Query, body.freeze(), FrameFlags::default()).await?;
        if response.header.opcode == Opcode::Error {
            return Err(decode_error_body(response.body));
        }
        Ok(response)
    }

    /// Sends `opcode`/`body` on a freshly allocated stream id and awaits
    /// the matching response, with a fixed request timeout.
    pub async fn roundtrip(&self, opcode: Opcode, body: Bytes, flags: FrameFlags) -> Result<Frame, DriverError> {
        if self.shared.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(DriverError::ConnectionClosed { addr: self.shared.addr });
        }

        let stream = self
            .shared
            .allocator
            .lock()
            .unwrap()
            .allocate()
            .ok_or_else(|| DriverError::Execution("connection has no free stream ids".to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(stream, PendingSlot { reply: tx });

        let mut out = BytesMut::new();
        cql_protocol::encode_frame(self.shared.version, Direction::Request, flags, stream, opcode, &body, &mut out);
        let wire = if self.shared.version.supports_segmentation() {
            encode_as_segments(&out)
        } else {
            out
        };

        let write_result = {
            let mut writer = self.shared.writer.lock().await;
            writer.write_all(&wire).await
        };

        if let Err(source) = write_result {
            self.shared.pending.lock().unwrap().remove(&stream);
            self.shared.allocator.lock().unwrap().release(stream);
            return Err(DriverError::Connection { addr: self.shared.addr, source });
        }

        *self.shared.last_activity.lock().unwrap() = Instant::now();
        let result = tokio::time::timeout(self.shared.request_timeout, rx).await;

        match result {
            Ok(Ok(frame_result)) => {
                // The reader already removed this stream's `pending` entry
                // and released its id back to the allocator when it
                // dispatched the frame to us.
                *self.shared.last_activity.lock().unwrap() = Instant::now();
                frame_result
            }
            Ok(Err(_canceled)) => {
                // The sender was dropped without a send: only reachable if
                // a `pending` entry was lost without going through the
                // reader's close-and-drain path, which always sends first.
                // Release defensively since the reader will never observe
                // this stream id again.
                self.shared.allocator.lock().unwrap().release(stream);
                Err(DriverError::ConnectionClosed { addr: self.shared.addr })
            }
            Err(_elapsed) => {
                // Leave the `pending` entry and the stream id allocated.
                // The id only returns to the pool once the reader actually
                // observes and discards this stream's late response
                // (`dispatch_frame`), so a concurrent `roundtrip` can never
                // be handed a still-in-flight id.
                Err(DriverError::Timeout)
            }
        }
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.shared.addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.version
    }

    pub fn in_flight(&self) -> usize {
        self.shared.allocator.lock().unwrap().in_use()
    }
}

/// Delivers a decoded frame to its waiting caller (or to the event
/// channel, for a server push) and releases its stream id back to the
/// allocator. This is the *only* place a non-negative stream id is ever
/// released: the id stays allocated, and its `pending` entry stays in the
/// map, for as long as the caller is still waiting *or* has already timed
/// out and orphaned it, so a concurrent `roundtrip` can never be handed a
/// still-in-flight id.
fn dispatch_frame(shared: &Arc<Shared>, events: &mpsc::UnboundedSender<ServerEvent>, frame: Frame) {
    *shared.last_activity.lock().unwrap() = Instant::now();
    if frame.header.stream < 0 {
        let _ = events.send(ServerEvent { body: frame.body });
        return;
    }
    let slot = shared.pending.lock().unwrap().remove(&frame.header.stream);
    shared.allocator.lock().unwrap().release(frame.header.stream);
    if let Some(slot) = slot {
        let _ = slot.reply.send(Ok(frame));
    }
    // A `slot` of `None` here means a frame arrived referencing a stream
    // id this connection never allocated (a server protocol violation);
    // a timed-out caller's own slot stays in `pending` until exactly this
    // point, so that case always finds `Some`.
}

fn close_connection(shared: &Arc<Shared>) {
    shared.closed.store(true, std::sync::atomic::Ordering::Release);
    let mut pending = shared.pending.lock().unwrap();
    for (_, slot) in pending.drain() {
        let _ = slot.reply.send(Err(DriverError::ConnectionClosed { addr: shared.addr }));
    }
}

/// Wraps an already-encoded frame in the v5 segmentation layer. A frame
/// that fits in one segment's payload budget goes out as a single
/// self-contained segment; a larger one is split across consecutive
/// non-self-contained segments, which the peer's decoder concatenates
/// before resuming frame parsing. Compression isn't negotiated by this
/// driver yet, so segments always carry their payload uncompressed.
fn encode_as_segments(frame_bytes: &[u8]) -> BytesMut {
    let mut wire = BytesMut::new();
    if frame_bytes.len() <= cql_protocol::segment::MAX_PAYLOAD_LEN {
        cql_protocol::encode_segment(frame_bytes, true, &mut wire).expect("checked against MAX_PAYLOAD_LEN above");
    } else {
        for chunk in frame_bytes.chunks(cql_protocol::segment::MAX_PAYLOAD_LEN) {
            cql_protocol::encode_segment(chunk, false, &mut wire).expect("chunk size bounded by MAX_PAYLOAD_LEN");
        }
    }
    wire
}

async fn read_one_segment(
    reader: &mut ReadHalf<TcpStream>,
    buf: &mut BytesMut,
) -> Result<Option<cql_protocol::Segment>, std::io::Error> {
    loop {
        match cql_protocol::try_decode_segment(buf) {
            Ok(Some(segment)) => return Ok(Some(segment)),
            Ok(None) => {}
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
        let mut chunk = [0u8; 16 * 1024];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_one_frame(reader: &mut ReadHalf<TcpStream>, buf: &mut BytesMut) -> Result<Option<Frame>, std::io::Error> {
    loop {
        if let Ok(Some(frame)) = try_decode_frame(buf) {
            return Ok(Some(frame));
        }
        // Peek the header (if buffered) purely to fail fast on a malformed
        // stream rather than growing `buf` without bound; real length
        // comes from the header once 9 bytes are available.
        if buf.len() >= cql_protocol::frame::HEADER_LEN {
            let _ = decode_header(buf);
        }
        let mut chunk = [0u8; 16 * 1024];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn encode_string_map(map: &indexmap::IndexMap<String, String>) -> Bytes {
    let mut out = BytesMut::new();
    out.extend_from_slice(&(map.len() as u16).to_be_bytes());
    for (k, v) in map {
        encode_string(k, &mut out);
        encode_string(v, &mut out);
    }
    out.freeze()
}

fn encode_string(s: &str, out: &mut BytesMut) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_long_string(s: &str, out: &mut BytesMut) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_bytes(b: &[u8], out: &mut BytesMut) {
    out.extend_from_slice(&(b.len() as i32).to_be_bytes());
    out.extend_from_slice(b);
}

fn decode_bytes(buf: &mut Bytes) -> Result<Bytes, DriverError> {
    if buf.remaining() < 4 {
        return Err(DriverError::Protocol(cql_protocol::CodecError::TruncatedFrame {
            expected: 4,
            actual: buf.remaining(),
        }));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(Bytes::new());
    }
    Ok(buf.copy_to_bytes(len as usize))
}

/// Parses an ERROR frame body into a typed [`DriverError::Server`]: a
/// 4-byte code followed by a UTF-8 string message, then code-specific
/// fields this driver doesn't need for error reporting purposes.
pub fn decode_error_body(mut body: Bytes) -> DriverError {
    if body.remaining() < 4 {
        return DriverError::Protocol(cql_protocol::CodecError::TruncatedFrame {
            expected: 4,
            actual: body.remaining(),
        });
    }
    let code = body.get_i32();
    let message = match decode_bytes_as_short_string(&mut body) {
        Ok(s) => s,
        Err(e) => return DriverError::Protocol(e),
    };
    match ServerError::decode(code, message, &mut body) {
        Ok(server_error) => DriverError::Server(server_error),
        Err(e) => DriverError::Protocol(e),
    }
}

fn decode_bytes_as_short_string(buf: &mut Bytes) -> Result<String, cql_protocol::CodecError> {
    if buf.remaining() < 2 {
        return Err(cql_protocol::CodecError::TruncatedFrame { expected: 2, actual: buf.remaining() });
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(cql_protocol::CodecError::TruncatedFrame { expected: len, actual: buf.remaining() });
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| cql_protocol::CodecError::InvalidUtf8)
}
