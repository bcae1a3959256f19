//! Driver-facing error taxonomy: every error a caller can
//! observe is one of these buckets, each with its own retryability
//! rule baked in rather than left to the caller to rediscover.

use cql_protocol::CodecError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {addr} closed")]
    ConnectionClosed { addr: SocketAddr },

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("value marshalling failed: {0}")]
    Marshalling(CodecError),

    #[error("{0}")]
    Execution(String),

    #[error("no healthy replica was available to route this request")]
    NoHostAvailable,

    #[error("request timed out waiting for a response")]
    Timeout,

    #[error("statement requires a value for unbound parameter `{0}`")]
    UnboundParameter(String),

    #[error("result has no `[applied]` column; this statement was not a conditional (CAS) update")]
    NotCasResult,

    #[error("batch has {0} statements, exceeding the protocol's 65535-statement limit")]
    TooManyStatements(usize),
}

impl DriverError {
    /// Whether a retry policy may legally consider retrying the query that
    /// produced this error. Marshalling and configuration errors are never
    /// retryable: retrying would repeat the same mistake.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Configuration(_) => false,
            DriverError::Connection { .. } => true,
            DriverError::ConnectionClosed { .. } => true,
            DriverError::Protocol(_) => false,
            DriverError::Server(e) => e.is_retryable(),
            DriverError::Marshalling(_) => false,
            DriverError::Execution(_) => false,
            DriverError::NoHostAvailable => false,
            DriverError::Timeout => true,
            DriverError::UnboundParameter(_) => false,
            DriverError::NotCasResult => false,
            DriverError::TooManyStatements(_) => false,
        }
    }
}

/// A server-reported ERROR frame, typed by its error code. `message` is
/// the server's human-readable text,
/// preserved verbatim for diagnostics.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServerError {
    #[error("server error: {message}")]
    ServerError { message: String },

    #[error("protocol error reported by server: {message}")]
    ProtocolError { message: String },

    #[error("authentication failed: {message}")]
    AuthenticationError { message: String },

    #[error("unavailable: need {required} replicas at consistency {consistency:?}, {alive} alive")]
    Unavailable {
        message: String,
        consistency: cql_protocol::Consistency,
        required: i32,
        alive: i32,
    },

    #[error("overloaded: {message}")]
    Overloaded { message: String },

    #[error("query is in an invalid state for bootstrapping: {message}")]
    IsBootstrapping { message: String },

    #[error("truncate failed: {message}")]
    TruncateError { message: String },

    #[error("write timeout: {received}/{block_for} replicas acknowledged a {write_type} write")]
    WriteTimeout {
        message: String,
        consistency: cql_protocol::Consistency,
        received: i32,
        block_for: i32,
        write_type: String,
    },

    #[error("read timeout: {received}/{block_for} replicas responded (data present: {data_present})")]
    ReadTimeout {
        message: String,
        consistency: cql_protocol::Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },

    #[error("read failure: {received}/{block_for} replicas responded, {num_failures} failed")]
    ReadFailure {
        message: String,
        consistency: cql_protocol::Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        data_present: bool,
    },

    #[error("function failure in {keyspace}.{function}: {message}")]
    FunctionFailure {
        message: String,
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("write failure: {received}/{block_for} replicas acknowledged, {num_failures} failed")]
    WriteFailure {
        message: String,
        consistency: cql_protocol::Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        write_type: String,
    },

    #[error("syntax error: {message}")]
    SyntaxError { message: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("invalid query: {message}")]
    Invalid { message: String },

    #[error("config error: {message}")]
    ConfigError { message: String },

    #[error("already exists: keyspace={keyspace} table={table}")]
    AlreadyExists { message: String, keyspace: String, table: String },

    #[error("unprepared: no cached statement for id {statement_id:?}")]
    Unprepared { message: String, statement_id: Vec<u8> },

    #[error("server reported unknown error code 0x{code:08x}: {message}")]
    Unknown { code: i32, message: String },

    #[error("CAS write outcome unknown: {received}/{block_for} replicas acknowledged")]
    CasWriteUnknown {
        message: String,
        consistency: cql_protocol::Consistency,
        received: i32,
        block_for: i32,
    },
}

impl ServerError {
    /// Which server errors a retry policy is *permitted* to consider
    /// retrying. The policy still applies its
    /// own idempotency gate on top of this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::Unavailable { .. }
                | ServerError::Overloaded { .. }
                | ServerError::WriteTimeout { .. }
                | ServerError::ReadTimeout { .. }
                | ServerError::ReadFailure { .. }
                | ServerError::WriteFailure { .. }
                | ServerError::IsBootstrapping { .. }
                | ServerError::CasWriteUnknown { .. }
        )
    }

    /// Parses the code-specific tail of an ERROR frame body, which for
    /// most codes is nothing beyond `message` but for a handful
    /// carries structured fields a retry policy or caller needs (the
    /// consistency/replica counts behind `Unavailable`/`*Timeout`/`*Failure`,
    /// or the keyspace/table behind `AlreadyExists`).
    pub fn decode(code: i32, message: String, body: &mut bytes::Bytes) -> Result<ServerError, CodecError> {
        use bytes::Buf;

        fn require(body: &bytes::Bytes, n: usize) -> Result<(), CodecError> {
            if body.remaining() < n {
                return Err(CodecError::TruncatedFrame { expected: n, actual: body.remaining() });
            }
            Ok(())
        }
        fn short_string(body: &mut bytes::Bytes) -> Result<String, CodecError> {
            require(body, 2)?;
            let len = body.get_u16() as usize;
            require(body, len)?;
            let bytes = body.copy_to_bytes(len);
            String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
        }
        fn consistency(body: &mut bytes::Bytes) -> Result<cql_protocol::Consistency, CodecError> {
            require(body, 2)?;
            cql_protocol::Consistency::from_u16(body.get_u16())
        }
        fn i32_field(body: &mut bytes::Bytes) -> Result<i32, CodecError> {
            require(body, 4)?;
            Ok(body.get_i32())
        }

        Ok(match code {
            0x0000 => ServerError::ServerError { message },
            0x000A => ServerError::ProtocolError { message },
            0x0100 => ServerError::AuthenticationError { message },
            0x1000 => ServerError::Unavailable {
                message,
                consistency: consistency(body)?,
                required: i32_field(body)?,
                alive: i32_field(body)?,
            },
            0x1001 => ServerError::Overloaded { message },
            0x1002 => ServerError::IsBootstrapping { message },
            0x1003 => ServerError::TruncateError { message },
            0x1100 => ServerError::WriteTimeout {
                message,
                consistency: consistency(body)?,
                received: i32_field(body)?,
                block_for: i32_field(body)?,
                write_type: short_string(body)?,
            },
            0x1200 => {
                let consistency = consistency(body)?;
                let received = i32_field(body)?;
                let block_for = i32_field(body)?;
                require(body, 1)?;
                let data_present = body.get_u8() != 0;
                ServerError::ReadTimeout { message, consistency, received, block_for, data_present }
            }
            0x1300 => {
                let consistency = consistency(body)?;
                let received = i32_field(body)?;
                let block_for = i32_field(body)?;
                let num_failures = i32_field(body)?;
                require(body, 1)?;
                let data_present = body.get_u8() != 0;
                ServerError::ReadFailure { message, consistency, received, block_for, num_failures, data_present }
            }
            0x1400 => {
                let keyspace = short_string(body)?;
                let function = short_string(body)?;
                require(body, 2)?;
                let count = body.get_u16();
                let mut arg_types = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    arg_types.push(short_string(body)?);
                }
                ServerError::FunctionFailure { message, keyspace, function, arg_types }
            }
            0x1500 => {
                let consistency = consistency(body)?;
                let received = i32_field(body)?;
                let block_for = i32_field(body)?;
                let num_failures = i32_field(body)?;
                let write_type = short_string(body)?;
                ServerError::WriteFailure { message, consistency, received, block_for, num_failures, write_type }
            }
            0x1700 => ServerError::CasWriteUnknown {
                message,
                consistency: consistency(body)?,
                received: i32_field(body)?,
                block_for: i32_field(body)?,
            },
            0x2000 => ServerError::SyntaxError { message },
            0x2100 => ServerError::Unauthorized { message },
            0x2200 => ServerError::Invalid { message },
            0x2300 => ServerError::ConfigError { message },
            0x2400 => ServerError::AlreadyExists {
                message,
                keyspace: short_string(body)?,
                table: short_string(body)?,
            },
            0x2500 => {
                require(body, 2)?;
                let len = body.get_u16() as usize;
                require(body, len)?;
                let statement_id = body.copy_to_bytes(len).to_vec();
                ServerError::Unprepared { message, statement_id }
            }
            other => ServerError::Unknown { code: other, message },
        })
    }

    /// Convenience for call sites that only have `message` and no
    /// remaining body to parse (tests, or a truncated ERROR frame);
    /// always produces a message-only variant or [`ServerError::Unknown`].
    pub fn from_code(code: i32, message: String) -> ServerError {
        let mut empty = bytes::Bytes::new();
        ServerError::decode(code, message.clone(), &mut empty).unwrap_or(ServerError::Unknown { code, message })
    }
}
