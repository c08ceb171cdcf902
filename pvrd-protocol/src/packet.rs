//! Wire packets with sequentially typed payload fields.
//!
//! A [`Packet`] is built by appending fixed-width integers and
//! length-prefixed UTF-8 strings in the order the opcode's contract
//! demands, and read back in the same order. Readers may probe
//! [`Packet::eop`] at any point to support optional trailing fields
//! added in later protocol versions.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::codec::HEADER_SIZE;
use crate::error::ProtocolError;
use crate::types::PacketClass;

/// Payloads below this size are never compressed; the header overhead
/// would outweigh the savings.
const COMPRESS_MIN: usize = 512;

/// A decoded or under-construction wire message.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Operation (requests/responses) or push/stream message id.
    pub opcode: u32,
    /// Message class.
    pub class: PacketClass,
    /// Request id; responses echo the request's value. Zero for pushes.
    pub uid: u32,
    /// Protocol version the payload layout was produced for.
    pub version: u16,
    payload: BytesMut,
    /// Compressed payload ready for the wire, if compress() ran.
    compressed: Option<Bytes>,
    rpos: usize,
}

impl Packet {
    /// Create an empty packet.
    pub fn new(opcode: u32, class: PacketClass) -> Self {
        Self {
            opcode,
            class,
            uid: 0,
            version: 0,
            payload: BytesMut::new(),
            compressed: None,
            rpos: 0,
        }
    }

    /// Create a response packet echoing a request's identity.
    pub fn response_to(req: &Packet) -> Self {
        let mut p = Packet::new(req.opcode, PacketClass::RequestResponse);
        p.uid = req.uid;
        p.version = req.version;
        p
    }

    /// Reconstruct a packet from decoded header fields and its
    /// (already decompressed) payload.
    pub(crate) fn from_parts(
        opcode: u32,
        class: PacketClass,
        uid: u32,
        version: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            opcode,
            class,
            uid,
            version,
            payload: BytesMut::from(&payload[..]),
            compressed: None,
            rpos: 0,
        }
    }

    /// Uncompressed payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// True once every payload byte has been consumed by `get_*` calls.
    pub fn eop(&self) -> bool {
        self.rpos >= self.payload.len()
    }

    // --- writers -----------------------------------------------------

    pub fn put_u8(&mut self, v: u8) {
        self.payload.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.payload.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.payload.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.payload.put_u64(v);
    }

    pub fn put_s32(&mut self, v: i32) {
        self.payload.put_i32(v);
    }

    pub fn put_s64(&mut self, v: i64) {
        self.payload.put_i64(v);
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_string(&mut self, s: &str) {
        let bytes = s.as_bytes();
        self.payload.put_u32(bytes.len() as u32);
        self.payload.put_slice(bytes);
    }

    /// Append raw bytes without a length prefix (media block payloads).
    pub fn put_blob(&mut self, data: &[u8]) {
        self.payload.put_slice(data);
    }

    // --- readers -----------------------------------------------------

    fn take(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        if self.payload.len() - self.rpos < n {
            return Err(ProtocolError::Malformed {
                expected: n,
                actual: self.payload.len() - self.rpos,
            });
        }
        let start = self.rpos;
        self.rpos += n;
        Ok(&self.payload[start..start + n])
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_s32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_s64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Remaining payload bytes, consumed to the end.
    pub fn get_remaining(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(&self.payload[self.rpos..]);
        self.rpos = self.payload.len();
        rest
    }

    // --- compression -------------------------------------------------

    /// Run the serialized payload through a zlib pass. Level 0 and
    /// small payloads are left untouched; a result that fails to shrink
    /// the payload is discarded. The pass is transparent to field
    /// decoding on the peer side.
    pub fn compress(&mut self, level: u8) -> Result<(), ProtocolError> {
        if level == 0 || self.payload.len() < COMPRESS_MIN {
            return Ok(());
        }

        let mut encoder =
            ZlibEncoder::new(Vec::new(), Compression::new(u32::from(level.min(9))));
        encoder
            .write_all(&self.payload)
            .and_then(|_| encoder.finish())
            .map(|out| {
                if out.len() < self.payload.len() {
                    self.compressed = Some(Bytes::from(out));
                }
            })
            .map_err(|e| ProtocolError::Compression(e.to_string()))
    }

    pub(crate) fn decompress(data: &[u8], raw_len: usize) -> Result<Bytes, ProtocolError> {
        let mut out = Vec::with_capacity(raw_len);
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        if out.len() != raw_len {
            return Err(ProtocolError::Compression(format!(
                "expected {} decompressed bytes, got {}",
                raw_len,
                out.len()
            )));
        }
        Ok(Bytes::from(out))
    }

    /// Serialize header and payload into a single wire frame.
    pub fn frame(&self) -> Bytes {
        let (wire, raw_len) = match &self.compressed {
            Some(c) => (&c[..], self.payload.len() as u32),
            None => (&self.payload[..], 0),
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + wire.len());
        buf.put_u32(self.opcode);
        buf.put_u32(self.class as u32);
        buf.put_u32(self.uid);
        buf.put_u16(self.version);
        buf.put_u32(wire.len() as u32);
        buf.put_u32(raw_len);
        buf.put_slice(wire);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_header, packet_from_frame};

    fn roundtrip(p: &Packet) -> Packet {
        let frame = p.frame();
        let header = decode_header(&frame).unwrap().unwrap();
        packet_from_frame(&header, &frame[HEADER_SIZE..HEADER_SIZE + header.payload_len as usize])
            .unwrap()
    }

    #[test]
    fn every_field_type_roundtrips() {
        let mut p = Packet::new(63, PacketClass::RequestResponse);
        p.uid = 7;
        p.version = 5;
        p.put_u8(0xAB);
        p.put_u16(0xBEEF);
        p.put_u32(0xDEADBEEF);
        p.put_u64(0x0123_4567_89AB_CDEF);
        p.put_s32(-42);
        p.put_s64(-1_234_567_890_123);
        p.put_string("Das Erste HD");
        p.put_string("");

        let mut q = roundtrip(&p);
        assert_eq!(q.opcode, 63);
        assert_eq!(q.uid, 7);
        assert_eq!(q.version, 5);
        assert_eq!(q.get_u8().unwrap(), 0xAB);
        assert_eq!(q.get_u16().unwrap(), 0xBEEF);
        assert_eq!(q.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(q.get_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(q.get_s32().unwrap(), -42);
        assert_eq!(q.get_s64().unwrap(), -1_234_567_890_123);
        assert_eq!(q.get_string().unwrap(), "Das Erste HD");
        assert_eq!(q.get_string().unwrap(), "");
        assert!(q.eop());
    }

    #[test]
    fn compressed_payload_is_transparent() {
        for version in 4..=7u16 {
            let mut p = Packet::new(102, PacketClass::RequestResponse);
            p.version = version;
            for i in 0..200u32 {
                p.put_u32(i);
                p.put_string("a rather repetitive recording title");
            }
            let raw_len = p.payload_len();
            p.compress(6).unwrap();

            let frame = p.frame();
            let header = decode_header(&frame).unwrap().unwrap();
            assert!(header.raw_len as usize == raw_len);
            assert!((header.payload_len as usize) < raw_len);

            let mut q = packet_from_frame(
                &header,
                &frame[HEADER_SIZE..HEADER_SIZE + header.payload_len as usize],
            )
            .unwrap();
            for i in 0..200u32 {
                assert_eq!(q.get_u32().unwrap(), i);
                assert_eq!(q.get_string().unwrap(), "a rather repetitive recording title");
            }
            assert!(q.eop());
        }
    }

    #[test]
    fn level_zero_never_compresses() {
        let mut p = Packet::new(1, PacketClass::RequestResponse);
        for _ in 0..1000 {
            p.put_u8(0);
        }
        p.compress(0).unwrap();
        let frame = p.frame();
        let header = decode_header(&frame).unwrap().unwrap();
        assert_eq!(header.raw_len, 0);
        assert_eq!(header.payload_len, 1000);
    }

    #[test]
    fn eop_probes_optional_trailing_fields() {
        let mut p = Packet::new(1, PacketClass::RequestResponse);
        p.put_u8(2);
        p.put_string("client");

        let mut q = roundtrip(&p);
        q.get_u8().unwrap();
        q.get_string().unwrap();
        // older client: no language fields follow
        assert!(q.eop());

        let mut p = Packet::new(1, PacketClass::RequestResponse);
        p.put_u8(2);
        p.put_string("client");
        p.put_string("deu");
        p.put_u8(0);
        let mut q = roundtrip(&p);
        q.get_u8().unwrap();
        q.get_string().unwrap();
        assert!(!q.eop());
        assert_eq!(q.get_string().unwrap(), "deu");
    }

    #[test]
    fn truncated_field_read_fails() {
        let mut p = Packet::new(2, PacketClass::RequestResponse);
        p.put_u16(1);
        let mut q = roundtrip(&p);
        assert!(matches!(
            q.get_u32(),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn malformed_string_prefix_fails() {
        let mut p = Packet::new(2, PacketClass::RequestResponse);
        p.put_u32(1_000_000); // length prefix far past the payload end
        let mut q = roundtrip(&p);
        assert!(matches!(
            q.get_string(),
            Err(ProtocolError::Malformed { .. })
        ));
    }
}
