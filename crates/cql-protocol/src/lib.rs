//! Wire framing, value marshalling, and token hashing for the native CQL
//! protocol, versions 3 through 5. This crate has no notion of a
//! connection, a cluster, or a session; it only knows how to turn bytes
//! into typed values and back. `cql-driver` builds the client on top of it.

pub mod consistency;
pub mod error;
pub mod frame;
pub mod partitioner;
pub mod segment;
pub mod types;
pub mod value;
pub mod varint;

pub use consistency::{Consistency, SerialConsistency};
pub use error::CodecError;
pub use frame::{decode_header, encode_frame, try_decode_frame, Direction, Frame, FrameFlags, FrameHeader, Opcode, ProtocolVersion};
pub use partitioner::{PartitionerKind, Token};
pub use segment::{compress_payload, decompress_payload, encode_segment, try_decode_segment, Segment, SegmentCompression};
pub use types::ColumnType;
pub use value::{CqlDecimal, CqlDuration, Value};
