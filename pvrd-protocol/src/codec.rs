//! Frame-level encoding and decoding.
//!
//! Frame format (all integers big-endian):
//!
//! ```text
//! +--------+--------+--------+---------+---------+---------+----------+
//! | Opcode | Class  | ReqID  | Version | PayLen  | RawLen  | Payload  |
//! | u32    | u32    | u32    | u16     | u32     | u32     | variable |
//! +--------+--------+--------+---------+---------+---------+----------+
//! ```
//!
//! `RawLen` is zero for uncompressed payloads; otherwise it is the
//! decompressed payload size and `PayLen` counts the zlib bytes that
//! actually travel on the wire.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::packet::Packet;
use crate::types::{PacketClass, MAX_FRAME_SIZE};

/// Frame header size: 3 * u32 + u16 + 2 * u32 = 22 bytes.
pub const HEADER_SIZE: usize = 22;

/// Decoded frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub opcode: u32,
    pub class: PacketClass,
    pub uid: u32,
    pub version: u16,
    pub payload_len: u32,
    pub raw_len: u32,
}

/// Try to decode a frame header from the front of `buf`.
/// Returns `None` if not enough bytes have arrived yet.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let opcode = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let class_raw = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let uid = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let version = u16::from_be_bytes(buf[12..14].try_into().unwrap());
    let payload_len = u32::from_be_bytes(buf[14..18].try_into().unwrap());
    let raw_len = u32::from_be_bytes(buf[18..22].try_into().unwrap());

    let class = PacketClass::try_from(class_raw).map_err(ProtocolError::UnknownClass)?;

    if payload_len > MAX_FRAME_SIZE || raw_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(
            payload_len.max(raw_len),
            MAX_FRAME_SIZE,
        ));
    }

    Ok(Some(FrameHeader {
        opcode,
        class,
        uid,
        version,
        payload_len,
        raw_len,
    }))
}

/// Build a [`Packet`] from a decoded header and its complete payload
/// bytes, running the decompression pass when the header says one was
/// applied. The caller guarantees `payload.len() == header.payload_len`.
pub fn packet_from_frame(header: &FrameHeader, payload: &[u8]) -> Result<Packet, ProtocolError> {
    let payload = if header.raw_len > 0 {
        Packet::decompress(payload, header.raw_len as usize)?
    } else {
        Bytes::copy_from_slice(payload)
    };

    Ok(Packet::from_parts(
        header.opcode,
        header.class,
        header.uid,
        header.version,
        payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_header_yields_none() {
        let partial = [0u8; HEADER_SIZE - 1];
        assert!(decode_header(&partial).unwrap().is_none());
    }

    #[test]
    fn unknown_class_is_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            decode_header(&buf),
            Err(ProtocolError::UnknownClass(99))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[4..8].copy_from_slice(&1u32.to_be_bytes());
        buf[14..18].copy_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(matches!(
            decode_header(&buf),
            Err(ProtocolError::FrameTooLarge(_, _))
        ));
    }
}
