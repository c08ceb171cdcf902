//! Live-streaming sub-session.
//!
//! Wraps a backend live feed for one session. Exactly one instance can
//! exist per session; opening always tears the previous one down
//! first. Delivery is strictly demand driven: a request pulls one
//! chunk and appends it to the session's outbound queue, nothing is
//! pushed unsolicited.

use log::{debug, info};
use pvrd_protocol::{stream_msg, Packet, PacketClass};

use crate::backend::{Backend, BackendError, Channel, LiveFeed, LiveStreamParams};
use crate::server::session::SessionShared;

pub struct LiveStream {
    feed: Box<dyn LiveFeed>,
    channel_uid: u32,
    channel_name: String,
}

impl LiveStream {
    pub fn open(
        backend: &Backend,
        channel: &Channel,
        params: LiveStreamParams,
    ) -> Result<Self, BackendError> {
        let feed = backend.live.open(channel, params)?;
        Ok(Self {
            feed,
            channel_uid: channel.uid,
            channel_name: channel.name.clone(),
        })
    }

    pub fn channel_uid(&self) -> u32 {
        self.channel_uid
    }

    /// Pull one media chunk and queue it as a stream message. A dry
    /// pipeline queues nothing; the client simply asks again.
    pub fn request_packet(&mut self, shared: &SessionShared) {
        let Some(chunk) = self.feed.poll_chunk() else {
            return;
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
    }

    /// Queue a signal-quality snapshot as a stream message.
    pub fn request_signal_info(&self, shared: &SessionShared) {
        let info = self.feed.signal_info();

        let mut p = Packet::new(stream_msg::SIGNAL_INFO, PacketClass::Stream);
        p.version = shared.version();
        p.put_string(&info.device);
        p.put_string(&info.status);
        p.put_u16(info.snr);
        p.put_u16(info.strength);
        p.put_u32(info.ber);
        p.put_u32(info.unc);
        shared.queue.push(p);
    }

    pub fn pause(&mut self, on: bool) {
        info!("live stream {}", if on { "paused" } else { "resumed" });
        self.feed.pause(on);
    }

    /// Follow a backend-side definition change of the tuned channel.
    pub fn retune(&mut self, channel: &Channel) {
        debug!(
            "retuning live stream from '{}' to '{}'",
            self.channel_name, channel.name
        );
        self.channel_name = channel.name.clone();
        self.feed.retune(channel);
    }
}
