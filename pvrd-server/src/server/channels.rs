//! Wire shaping for channel and timer records.

use pvrd_protocol::{has_service_reference, Packet};

use crate::backend::{Channel, ChannelSource, Timer};

/// Enigma-style service reference. The namespace hash encodes the
/// transmission source; satellite positions map east to the raw tenths
/// value and west to 1800 plus tenths.
pub fn service_reference(channel: &Channel) -> String {
    let hash: u32 = match channel.source {
        ChannelSource::Satellite(tenths) => {
            let flipped = -tenths;
            let pos = if flipped < 0 { -flipped } else { 1800 + flipped };
            (pos as u32) << 16
        }
        ChannelSource::Cable => 0xFFFF_0000,
        ChannelSource::Terrestrial => 0xEEEE_0000,
        ChannelSource::Atsc => 0xDDDD_0000,
    };

    let service_type = if channel.is_radio() {
        2
    } else if channel.vtype == 27 {
        19
    } else {
        1
    };

    format!(
        "1_0_{}_{:X}_{:X}_{:X}_{:X}_0_0_0",
        service_type, channel.sid, channel.tid, channel.nid, hash
    )
}

/// Percent-encode everything outside the URL-safe set.
fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Picon URL for a channel, empty when no picon base is configured.
/// The service reference doubles as the file name; it is
/// percent-encoded for http bases and used verbatim for local paths.
pub fn logo_url(channel: &Channel, picons_url: &str) -> String {
    if picons_url.is_empty() {
        return String::new();
    }

    let mut filename = service_reference(channel);
    if picons_url.starts_with("http") {
        filename = url_encode(&filename);
    }

    format!("{}/{}.png", picons_url.trim_end_matches('/'), filename)
}

/// Channel record as GetChannels and the channel-changed push emit it.
pub fn put_channel(p: &mut Packet, channel: &Channel, version: u16, picons_url: &str) {
    p.put_u32(channel.number);
    p.put_string(&channel.name);
    p.put_u32(channel.uid);
    p.put_u32(channel.ca());
    p.put_string(&logo_url(channel, picons_url));

    if has_service_reference(version) {
        p.put_string(&service_reference(channel));
    }
}

/// Timer record; `conflict` carries the live conflict-check bits OR'd
/// into the stored flags.
pub fn put_timer(p: &mut Packet, timer: &Timer, conflict: u32) {
    p.put_u32(timer.uid);
    p.put_u32(timer.flags | conflict);
    p.put_u32(timer.priority);
    p.put_u32(timer.lifetime);
    p.put_u32(timer.channel_uid);
    p.put_u32(timer.start);
    p.put_u32(timer.stop);
    p.put_u32(timer.day);
    p.put_u32(timer.weekdays);
    p.put_string(&timer.file);
}
