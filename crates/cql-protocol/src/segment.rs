//! Protocol v5's segmentation layer: every byte on a v5
//! connection is wrapped in segments of at most [`MAX_PAYLOAD_LEN`],
//! each with its own header/payload checksums, independent of how many
//! (possibly partial) frames a segment's payload contains.
//!
//! Segment header layout (little-endian, 6 bytes total before CRC24):
//! 17 bits payload length, 1 bit "self-contained" flag, 22 bits of header
//! data packed into a 3-byte little-endian integer, followed by a 3-byte
//! CRC24 of those 3 bytes. When compression is negotiated, the payload is
//! itself `[4-byte uncompressed length][compressed bytes]`, and a
//! `compressed length == uncompressed length` payload is sent uncompressed
//! verbatim (skips the codec), matching how an already-incompressible
//! payload is handled to avoid paying a compression pass for nothing.

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_24_BLE as CRC24_POLY, CRC_32_ISCSI};

/// Segments above this size are never produced, and are rejected on
/// decode as protocol violations.
pub const MAX_PAYLOAD_LEN: usize = 128 * 1024;

const HEADER_DATA_LEN: usize = 3;
const HEADER_CRC_LEN: usize = 3;
const PAYLOAD_CRC_LEN: usize = 4;

const CRC24: Crc<u32> = Crc::<u32>::new(&CRC24_POLY);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compression negotiated at STARTUP, applied uniformly to every segment
/// payload rather than per-frame (v5 moves compression below the frame
/// layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentCompression {
    None,
    Lz4,
    Snappy,
}

/// One decoded segment: `payload` is the decompressed bytes, which may
/// contain zero or more complete frames plus a trailing partial frame
/// unless `self_contained` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub self_contained: bool,
    pub payload: Bytes,
}

fn crc24(data: &[u8]) -> u32 {
    CRC24.checksum(data) & 0x00FF_FFFF
}

/// Encodes `payload` (already compressed if `compression` requires it,
/// with the uncompressed-length prefix already applied by the caller via
/// [`compress_payload`]) as one on-wire segment.
pub fn encode_segment(payload: &[u8], self_contained: bool, out: &mut BytesMut) -> Result<(), CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::SegmentTooLarge(payload.len()));
    }
    let mut header_data = [0u8; HEADER_DATA_LEN];
    let packed: u32 = (payload.len() as u32) | ((self_contained as u32) << 17);
    header_data[0] = packed as u8;
    header_data[1] = (packed >> 8) as u8;
    header_data[2] = (packed >> 16) as u8;

    out.extend_from_slice(&header_data);
    let crc = crc24(&header_data);
    out.put_u8(crc as u8);
    out.put_u8((crc >> 8) as u8);
    out.put_u8((crc >> 16) as u8);

    out.extend_from_slice(payload);
    let payload_crc = CRC32.checksum(payload);
    out.put_u32_le(payload_crc);
    Ok(())
}

/// Attempts to pull one complete segment out of `buf`. Returns `Ok(None)`
/// if not enough bytes are buffered yet.
pub fn try_decode_segment(buf: &mut BytesMut) -> Result<Option<Segment>, CodecError> {
    if buf.len() < HEADER_DATA_LEN + HEADER_CRC_LEN {
        return Ok(None);
    }
    let header_data = [buf[0], buf[1], buf[2]];
    let expected_crc = crc24(&header_data);
    let actual_crc = (buf[3] as u32) | ((buf[4] as u32) << 8) | ((buf[5] as u32) << 16);
    if expected_crc != actual_crc {
        return Err(CodecError::SegmentHeaderCrc);
    }

    let packed = (header_data[0] as u32) | ((header_data[1] as u32) << 8) | ((header_data[2] as u32) << 16);
    let payload_len = (packed & 0x1_FFFF) as usize;
    let self_contained = (packed >> 17) & 1 != 0;

    let total_len = HEADER_DATA_LEN + HEADER_CRC_LEN + payload_len + PAYLOAD_CRC_LEN;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(HEADER_DATA_LEN + HEADER_CRC_LEN);
    let payload = buf.split_to(payload_len).freeze();
    let expected_payload_crc = buf.get_u32_le();
    let actual_payload_crc = CRC32.checksum(&payload);
    if expected_payload_crc != actual_payload_crc {
        return Err(CodecError::SegmentPayloadCrc);
    }

    Ok(Some(Segment {
        self_contained,
        payload,
    }))
}

/// Applies negotiated compression to one segment's worth of frame bytes,
/// producing the `[4-byte uncompressed length][bytes]` payload shape the
/// segment layer expects. When the compressed form isn't smaller, the
/// uncompressed bytes are sent as-is with the length prefix set to the
/// literal sentinel `0`, the wire's signal to skip decompression (the
/// real length is then just the remaining payload length).
pub fn compress_payload(compression: SegmentCompression, data: &[u8]) -> Result<BytesMut, CodecError> {
    let mut out = BytesMut::new();
    match compression {
        SegmentCompression::None => {
            out.extend_from_slice(data);
        }
        SegmentCompression::Lz4 => {
            let compressed = lz4_flex::block::compress(data);
            if compressed.len() < data.len() {
                out.put_u32_le(data.len() as u32);
                out.extend_from_slice(&compressed);
            } else {
                out.put_u32_le(0);
                out.extend_from_slice(data);
            }
        }
        SegmentCompression::Snappy => {
            let mut encoder = snap::raw::Encoder::new();
            let compressed = encoder
                .compress_vec(data)
                .map_err(|e| CodecError::Compression("snappy", e.to_string()))?;
            if compressed.len() < data.len() {
                out.put_u32_le(data.len() as u32);
                out.extend_from_slice(&compressed);
            } else {
                out.put_u32_le(0);
                out.extend_from_slice(data);
            }
        }
    }
    Ok(out)
}

/// Inverts [`compress_payload`]: reads the 4-byte uncompressed length
/// prefix and decompresses the remainder, unless the prefix is the `0`
/// sentinel (sent uncompressed, remaining bytes are the real payload).
pub fn decompress_payload(compression: SegmentCompression, payload: &[u8]) -> Result<Bytes, CodecError> {
    if matches!(compression, SegmentCompression::None) {
        return Ok(Bytes::copy_from_slice(payload));
    }
    if payload.len() < 4 {
        return Err(CodecError::TruncatedFrame {
            expected: 4,
            actual: payload.len(),
        });
    }
    let uncompressed_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let body = &payload[4..];
    if uncompressed_len == 0 {
        return Ok(Bytes::copy_from_slice(body));
    }
    match compression {
        SegmentCompression::None => unreachable!(),
        SegmentCompression::Lz4 => {
            let decompressed = lz4_flex::block::decompress(body, uncompressed_len)
                .map_err(|e| CodecError::Compression("lz4", e.to_string()))?;
            Ok(Bytes::from(decompressed))
        }
        SegmentCompression::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            let decompressed = decoder
                .decompress_vec(body)
                .map_err(|e| CodecError::Compression("snappy", e.to_string()))?;
            Ok(Bytes::from(decompressed))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn segment_round_trips_self_contained() {
        let mut out = BytesMut::new();
        encode_segment(b"a small frame", true, &mut out).unwrap();
        let seg = try_decode_segment(&mut out).unwrap().unwrap();
        assert!(seg.self_contained);
        assert_eq!(&seg.payload[..], b"a small frame");
        assert!(out.is_empty());
    }

    #[test]
    fn incomplete_segment_returns_none() {
        let mut out = BytesMut::new();
        encode_segment(b"payload", false, &mut out).unwrap();
        out.truncate(out.len() - 2);
        let before = out.clone();
        assert_eq!(try_decode_segment(&mut out).unwrap(), None);
        assert_eq!(out, before);
    }

    #[test]
    fn corrupted_header_crc_errors() {
        let mut out = BytesMut::new();
        encode_segment(b"payload", true, &mut out).unwrap();
        out[0] ^= 0xFF;
        assert_eq!(try_decode_segment(&mut out), Err(CodecError::SegmentHeaderCrc));
    }

    #[test]
    fn corrupted_payload_crc_errors() {
        let mut out = BytesMut::new();
        encode_segment(b"payload", true, &mut out).unwrap();
        let last = out.len() - 1;
        out[last] ^= 0xFF;
        assert_eq!(try_decode_segment(&mut out), Err(CodecError::SegmentPayloadCrc));
    }

    #[test]
    fn oversized_payload_rejected() {
        let data = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let mut out = BytesMut::new();
        assert_eq!(
            encode_segment(&data, true, &mut out),
            Err(CodecError::SegmentTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn lz4_compression_round_trips() {
        let data = b"frame bytes frame bytes frame bytes frame bytes".repeat(8);
        let compressed = compress_payload(SegmentCompression::Lz4, &data).unwrap();
        let decompressed = decompress_payload(SegmentCompression::Lz4, &compressed).unwrap();
        assert_eq!(&decompressed[..], &data[..]);
    }

    #[test]
    fn incompressible_payload_falls_back_to_uncompressed() {
        let data = vec![1u8, 2, 3];
        let compressed = compress_payload(SegmentCompression::Lz4, &data).unwrap();
        // uncompressed_len prefix is the literal `0` sentinel: sent as-is.
        let uncompressed_len = u32::from_le_bytes([compressed[0], compressed[1], compressed[2], compressed[3]]);
        assert_eq!(uncompressed_len, 0);
        assert_eq!(compressed.len() - 4, data.len());
        let decompressed = decompress_payload(SegmentCompression::Lz4, &compressed).unwrap();
        assert_eq!(&decompressed[..], &data[..]);
    }
}
