//! Wire protocol for the pvrd PVR session server.
//!
//! This crate defines the binary protocol spoken between pvrd and its
//! clients: framed packets with a typed sequential payload, opcode and
//! status-code constants, protocol version gates, and an optional zlib
//! compression pass over serialized payloads.
//!
//! # Example
//!
//! ```rust
//! use pvrd_protocol::{decode_header, packet_from_frame, Packet, PacketClass, HEADER_SIZE};
//!
//! let mut req = Packet::new(pvrd_protocol::opcode::GET_TIME, PacketClass::RequestResponse);
//! req.uid = 1;
//! let frame = req.frame();
//!
//! let header = decode_header(&frame).unwrap().unwrap();
//! let decoded = packet_from_frame(&header, &frame[HEADER_SIZE..]).unwrap();
//! assert_eq!(decoded.opcode, pvrd_protocol::opcode::GET_TIME);
//! ```

pub mod codec;
pub mod error;
pub mod packet;
pub mod types;

pub use codec::{decode_header, packet_from_frame, FrameHeader, HEADER_SIZE};
pub use error::ProtocolError;
pub use packet::Packet;
pub use types::{
    has_artwork, has_service_reference, opcode, status_push, stream_msg, PacketClass, StatusCode,
    MAX_FRAME_SIZE, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN,
};
