//! Recording-playback sub-session.
//!
//! Wraps a backend recording reader for one session. At most one
//! playback can be open at a time; a second open request is refused
//! while the first is active.

use log::debug;
use pvrd_protocol::{stream_msg, Packet, PacketClass};

use crate::backend::{Backend, BackendError, Recording, RecordingReader};
use crate::server::session::SessionShared;

pub struct Playback {
    reader: Box<dyn RecordingReader>,
}

impl Playback {
    pub fn open(backend: &Backend, recording: &Recording) -> Result<Self, BackendError> {
        let reader = backend.store.open(recording)?;
        debug!(
            "opened playback of '{}' ({} bytes)",
            recording.title,
            reader.length_bytes()
        );
        Ok(Self { reader })
    }

    pub fn length_bytes(&self) -> u64 {
        self.reader.length_bytes()
    }

    pub fn is_raw_ts(&self) -> bool {
        self.reader.is_raw_ts()
    }

    pub fn duration_secs(&self) -> u32 {
        self.reader.duration_secs()
    }

    /// Refresh the length of a recording still being written.
    pub fn update(&mut self) -> u64 {
        self.reader.update_length()
    }

    /// Up to `amount` bytes at `offset`, truncated at end of file.
    pub fn get_block(&mut self, offset: u64, amount: u32) -> Result<Vec<u8>, BackendError> {
        self.reader.read_block(offset, amount)
    }

    /// Queue the next demuxed packet as a stream message; false when
    /// the reader has nothing ready.
    pub fn queue_packet(&mut self, shared: &SessionShared) -> bool {
        let Some(chunk) = self.reader.next_packet() else {
            return false;
        };

        let mut p = Packet::new(stream_msg::MUX_PACKET, PacketClass::Stream);
        p.version = shared.version();
        p.put_u16(chunk.pid);
        p.put_s64(chunk.pts);
        p.put_s64(chunk.dts);
        p.put_u32(chunk.duration);
        p.put_u8(chunk.key_frame);
        p.put_u32(chunk.data.len() as u32);
        p.put_blob(&chunk.data);
        shared.queue.push(p);
        true
    }

    /// Reposition the packet cursor; returns the PTS at that offset.
    pub fn seek(&mut self, offset: u64) -> i64 {
        self.reader.seek(offset)
    }
}
