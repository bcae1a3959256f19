//! The outer frame envelope shared by every protocol version: a 9-byte
//! header followed by a body whose shape is opcode- and direction-specific.
//! Segmentation (protocol v5) wraps zero or more whole frames
//! in its own envelope and is handled separately in [`crate::segment`].

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 9;

/// The `version` byte's low nibble, common to request and response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3,
    V4,
    V5,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V3 => 3,
            ProtocolVersion::V4 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    pub fn from_u8(v: u8) -> Option<ProtocolVersion> {
        match v {
            3 => Some(ProtocolVersion::V3),
            4 => Some(ProtocolVersion::V4),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    /// Whether this version carries the `Metadata_changed` result flag and
    /// the segmentation layer (both introduced in v5).
    pub fn supports_segmentation(self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

/// Per-frame header flags. Several are version-gated; callers
/// are responsible for only setting flags their negotiated version supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    pub compression: bool,
    pub tracing: bool,
    pub custom_payload: bool,
    pub warning: bool,
    /// Protocol v5+: body uses the BETA checksum/segmentation framing.
    pub use_beta: bool,
}

impl FrameFlags {
    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.compression {
            b |= 0x01;
        }
        if self.tracing {
            b |= 0x02;
        }
        if self.custom_payload {
            b |= 0x04;
        }
        if self.warning {
            b |= 0x08;
        }
        if self.use_beta {
            b |= 0x10;
        }
        b
    }

    fn from_byte(b: u8) -> FrameFlags {
        FrameFlags {
            compression: b & 0x01 != 0,
            tracing: b & 0x02 != 0,
            custom_payload: b & 0x04 != 0,
            warning: b & 0x08 != 0,
            use_beta: b & 0x10 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Result<Opcode, CodecError> {
        Ok(match b {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(CodecError::UnexpectedOpcode(other)),
        })
    }
}

/// Direction bit in the `version` byte: 0x00 request, 0x80 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub direction: Direction,
    pub flags: FrameFlags,
    pub stream: i16,
    pub opcode: Opcode,
    pub body_len: u32,
}

/// A fully assembled frame: header plus raw (still possibly compressed)
/// body bytes. Decompression happens one layer up, since frames read off a
/// v5 connection are handed to us already decompressed by the segment layer
/// while v3/v4 frames carry their own per-frame compression flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

/// Writes the 9-byte header and appends `body` unmodified. Callers are
/// responsible for compressing `body` first and setting `flags.compression`
/// accordingly; this function only serializes what it's given.
pub fn encode_frame(
    version: ProtocolVersion,
    direction: Direction,
    flags: FrameFlags,
    stream: i16,
    opcode: Opcode,
    body: &[u8],
    out: &mut BytesMut,
) {
    let version_byte = version.as_u8() | if direction == Direction::Response { 0x80 } else { 0 };
    out.put_u8(version_byte);
    out.put_u8(flags.to_byte());
    out.put_i16(stream);
    out.put_u8(opcode as u8);
    out.put_u32(body.len() as u32);
    out.extend_from_slice(body);
}

/// Parses just the 9-byte header, leaving `buf` positioned at the start of
/// the body. Returns `None` if fewer than [`HEADER_LEN`] bytes are
/// available (caller should wait for more data).
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let version_byte = buf[0];
    let direction = if version_byte & 0x80 != 0 {
        Direction::Response
    } else {
        Direction::Request
    };
    let version = ProtocolVersion::from_u8(version_byte & 0x7F)
        .ok_or(CodecError::UnknownType(format!("protocol version {}", version_byte & 0x7F)))?;
    let flags = FrameFlags::from_byte(buf[1]);
    let stream = i16::from_be_bytes([buf[2], buf[3]]);
    let opcode = Opcode::from_u8(buf[4])?;
    let body_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    Ok(Some(FrameHeader {
        version,
        direction,
        flags,
        stream,
        opcode,
        body_len,
    }))
}

/// Attempts to pull one complete frame out of `buf`, advancing it past the
/// consumed bytes on success. Returns `Ok(None)` if the header or body
/// isn't fully buffered yet, matching `tokio_util::codec::Decoder`'s
/// "need more data" convention.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    let header = match decode_header(buf)? {
        Some(h) => h,
        None => return Ok(None),
    };
    let total_len = HEADER_LEN + header.body_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    let body = buf.split_to(header.body_len as usize).freeze();
    Ok(Some(Frame { header, body }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut out = BytesMut::new();
        encode_frame(
            ProtocolVersion::V4,
            Direction::Request,
            FrameFlags {
                compression: true,
                ..Default::default()
            },
            7,
            Opcode::Query,
            b"hello",
            &mut out,
        );
        let frame = try_decode_frame(&mut out).unwrap().unwrap();
        assert_eq!(frame.header.version, ProtocolVersion::V4);
        assert_eq!(frame.header.direction, Direction::Request);
        assert!(frame.header.flags.compression);
        assert_eq!(frame.header.stream, 7);
        assert_eq!(frame.header.opcode, Opcode::Query);
        assert_eq!(&frame.body[..], b"hello");
        assert!(out.is_empty());
    }

    #[test]
    fn incomplete_header_returns_none() {
        let mut buf = BytesMut::from(&[0x04, 0x00, 0x00][..]);
        assert_eq!(try_decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn incomplete_body_returns_none_and_preserves_buffer() {
        let mut out = BytesMut::new();
        encode_frame(
            ProtocolVersion::V4,
            Direction::Response,
            FrameFlags::default(),
            -1,
            Opcode::Event,
            b"0123456789",
            &mut out,
        );
        out.truncate(HEADER_LEN + 3);
        let before = out.clone();
        assert_eq!(try_decode_frame(&mut out).unwrap(), None);
        assert_eq!(out, before);
    }

    #[test]
    fn unknown_opcode_errors() {
        let mut out = BytesMut::new();
        out.put_u8(0x04);
        out.put_u8(0x00);
        out.put_i16(0);
        out.put_u8(0x42);
        out.put_u32(0);
        assert!(matches!(
            try_decode_frame(&mut out),
            Err(CodecError::UnexpectedOpcode(0x42))
        ));
    }
}
