//! Opcode, status and message-class definitions for the pvrd protocol.

use serde::{Deserialize, Serialize};

/// Newest protocol version this server speaks.
pub const PROTOCOL_VERSION: u16 = 7;

/// Oldest protocol version this server still accepts at login.
pub const PROTOCOL_VERSION_MIN: u16 = 4;

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Message class carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketClass {
    /// Request from a client, or the matching response.
    RequestResponse = 1,
    /// Live/recorded media delivery.
    Stream = 2,
    /// Server-initiated status push, not correlated to a request.
    Status = 3,
}

impl TryFrom<u32> for PacketClass {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(PacketClass::RequestResponse),
            2 => Ok(PacketClass::Stream),
            3 => Ok(PacketClass::Status),
            other => Err(other),
        }
    }
}

/// Request opcodes, grouped by numeric range. The ranges are part of
/// the wire contract and stable across protocol versions.
pub mod opcode {
    // 1-19: general purpose
    pub const LOGIN: u32 = 1;
    pub const GET_TIME: u32 = 2;
    pub const ENABLE_STATUS_INTERFACE: u32 = 3;
    pub const UPDATE_CHANNELS: u32 = 4;
    pub const CHANNEL_FILTER: u32 = 5;

    // 20-39: live streaming
    pub const STREAM_OPEN: u32 = 20;
    pub const STREAM_CLOSE: u32 = 21;
    pub const STREAM_REQUEST: u32 = 22;
    pub const STREAM_PAUSE: u32 = 23;
    pub const STREAM_SIGNAL: u32 = 24;

    // 40-59: recording playback
    pub const REC_OPEN: u32 = 40;
    pub const REC_CLOSE: u32 = 41;
    pub const REC_GET_BLOCK: u32 = 42;
    pub const REC_GET_PACKET: u32 = 43;
    pub const REC_UPDATE: u32 = 46;
    pub const REC_SEEK: u32 = 47;

    // 60-79: channel and group enumeration
    pub const CHANNELS_COUNT: u32 = 61;
    pub const CHANNELS_LIST: u32 = 63;
    pub const GROUPS_COUNT: u32 = 65;
    pub const GROUPS_LIST: u32 = 66;
    pub const GROUPS_MEMBERS: u32 = 67;

    // 80-99: timers
    pub const TIMER_COUNT: u32 = 80;
    pub const TIMER_GET: u32 = 81;
    pub const TIMER_LIST: u32 = 82;
    pub const TIMER_ADD: u32 = 83;
    pub const TIMER_DELETE: u32 = 84;
    pub const TIMER_UPDATE: u32 = 85;

    // 100-119: recordings and artwork
    pub const RECORDINGS_DISKSIZE: u32 = 100;
    pub const RECORDINGS_COUNT: u32 = 101;
    pub const RECORDINGS_LIST: u32 = 102;
    pub const RECORDINGS_RENAME: u32 = 103;
    pub const RECORDINGS_DELETE: u32 = 104;
    pub const RECORDINGS_SET_PLAYCOUNT: u32 = 105;
    pub const RECORDINGS_SET_POSITION: u32 = 106;
    pub const RECORDINGS_GET_POSITION: u32 = 107;
    pub const RECORDINGS_GET_MARKS: u32 = 108;
    pub const RECORDINGS_SET_URLS: u32 = 109;
    pub const ARTWORK_GET: u32 = 110;
    pub const ARTWORK_SET: u32 = 111;

    // 120-139: EPG
    pub const EPG_FOR_CHANNEL: u32 = 120;

    // 140-159: channel scanner
    pub const SCAN_SUPPORTED: u32 = 140;
    pub const SCAN_GET_SETUP: u32 = 141;
    pub const SCAN_SET_SETUP: u32 = 142;
    pub const SCAN_START: u32 = 143;
    pub const SCAN_STOP: u32 = 144;
    pub const SCAN_GET_STATUS: u32 = 145;
}

/// Opcodes of server-initiated status pushes (class [`PacketClass::Status`]).
pub mod status_push {
    pub const TIMER_CHANGE: u32 = 500;
    pub const RECORDING_INFO: u32 = 501;
    pub const OSD_MESSAGE: u32 = 502;
    pub const CHANNELS_CHANGE: u32 = 503;
    pub const RECORDINGS_CHANGE: u32 = 504;
    pub const SCAN_PROGRESS: u32 = 505;
    /// Carries a full channel record; requires protocol version >= 6.
    pub const CHANNEL_CHANGED: u32 = 506;
}

/// Opcodes of media messages (class [`PacketClass::Stream`]).
pub mod stream_msg {
    /// One demultiplexed media packet.
    pub const MUX_PACKET: u32 = 2;
    /// Tuner signal quality snapshot.
    pub const SIGNAL_INFO: u32 = 5;
}

/// Status code returned in the first response field of most handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    /// The operation targets a timer that is currently recording.
    RecordingRunning = 1,
    /// The backing catalog is under concurrent edit.
    DataLocked = 2,
    /// The referenced entity does not exist.
    DataUnknown = 3,
    /// A request field failed validation.
    DataInvalid = 4,
    Error = 5,
    /// The collaborator for this operation is absent.
    NotSupported = 6,
}

impl From<StatusCode> for u32 {
    fn from(value: StatusCode) -> Self {
        value as u32
    }
}

/// Protocol version from which the channel service-reference string is
/// part of the channel enumeration record.
pub fn has_service_reference(version: u16) -> bool {
    version > 4
}

/// Protocol version from which artwork URLs and the channel-changed
/// status push are valid.
pub fn has_artwork(version: u16) -> bool {
    version >= 6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_class_roundtrip() {
        for class in [
            PacketClass::RequestResponse,
            PacketClass::Stream,
            PacketClass::Status,
        ] {
            assert_eq!(PacketClass::try_from(class as u32), Ok(class));
        }
        assert_eq!(PacketClass::try_from(9), Err(9));
    }

    #[test]
    fn version_gates() {
        assert!(!has_service_reference(4));
        assert!(has_service_reference(5));
        assert!(!has_artwork(5));
        assert!(has_artwork(6));
        assert!(has_artwork(PROTOCOL_VERSION));
    }
}
