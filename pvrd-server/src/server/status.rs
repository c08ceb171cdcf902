//! Status notification multiplexer.
//!
//! Backend events arrive on a broadcast channel; a per-session
//! forwarder task translates them into status packets on the session's
//! outbound queue. Forwarding is gated by the client's status-interface
//! flag, the channel-changed push additionally by protocol version.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use pvrd_protocol::{has_artwork, status_push, Packet, PacketClass};

use crate::backend::{Backend, BackendEvent, Channel, ScanStatus};
use crate::server::channels::put_channel;
use crate::server::filter::count_wanted;
use crate::server::listener::ServerConfig;
use crate::server::session::SessionShared;

/// Backend UI prompts that are meaningless on a remote client and are
/// never forwarded.
const OSD_DENYLIST: &[&str] = &[
    "Channel not available!",
    "Delete timer?",
    "Delete recording?",
    "Press any key to cancel shutdown",
    "Press any key to cancel restart",
    "Editing - shut down anyway?",
    "Recording - shut down anyway?",
    "shut down anyway?",
    "Recording - restart anyway?",
    "Editing - restart anyway?",
    "Delete channel?",
    "Timer still recording - really delete?",
    "Delete marks information?",
    "Delete resume information?",
    "CAM is in use - really reset?",
    "Really restart?",
    "Stop recording?",
    "Cancel editing?",
    "Cutter already running - Add to cutting queue?",
    "No index-file found. Creating may take minutes. Create one?",
];

fn status_packet(op: u32, version: u16) -> Packet {
    let mut p = Packet::new(op, PacketClass::Status);
    p.version = version;
    p
}

/// Spawn the forwarder task for one session. Aborted by the session on
/// exit; every event only ever appends to the outbound queue.
pub fn spawn_forwarder(
    backend: Backend,
    shared: Arc<SessionShared>,
    config: Arc<ServerConfig>,
) -> JoinHandle<()> {
    let mut rx = backend.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => forward(&backend, &shared, &config, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "[Session {}] status forwarder lagged, {} events dropped",
                        shared.id, skipped
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn forward(
    backend: &Backend,
    shared: &SessionShared,
    config: &ServerConfig,
    event: BackendEvent,
) {
    match event {
        BackendEvent::TimerListChanged => {
            if shared.status_enabled() {
                info!("[Session {}] notifying timer change", shared.id);
                shared
                    .queue
                    .push(status_packet(status_push::TIMER_CHANGE, shared.version()));
            }
        }
        BackendEvent::RecordingListChanged => {
            if shared.status_enabled() {
                shared.queue.push(status_packet(
                    status_push::RECORDINGS_CHANGE,
                    shared.version(),
                ));
            }
        }
        BackendEvent::ChannelListChanged => channel_list_changed(backend, shared),
        BackendEvent::ChannelChanged(channel) => channel_changed(shared, config, &channel),
        BackendEvent::RecordingActivity {
            device,
            on,
            name,
            filename,
        } => {
            if shared.status_enabled() {
                let mut p = status_packet(status_push::RECORDING_INFO, shared.version());
                p.put_u32(device);
                p.put_u32(u32::from(on));
                p.put_string(&name);
                p.put_string(&filename);
                shared.queue.push(p);
            }
        }
        BackendEvent::StatusMessage(message) => {
            if !shared.status_enabled() {
                return;
            }
            if OSD_DENYLIST
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&message))
            {
                return;
            }
            let mut p = status_packet(status_push::OSD_MESSAGE, shared.version());
            p.put_u32(0);
            p.put_string(&message);
            shared.queue.push(p);
        }
    }
}

/// List-membership change, deduplicated on the channel count the
/// client last saw through its own filter.
fn channel_list_changed(backend: &Backend, shared: &SessionShared) {
    if !shared.status_enabled() {
        return;
    }

    let snapshot = backend.channels.snapshot();
    let count = {
        let filter = shared.filter.lock().unwrap_or_else(|e| e.into_inner());
        count_wanted(&snapshot, &filter)
    };

    if shared.channel_count() == count {
        debug!(
            "[Session {}] {} channels, no visible change",
            shared.id, count
        );
        return;
    }

    info!(
        "[Session {}] channel list changed ({} -> {} visible), notifying",
        shared.id,
        shared.channel_count(),
        count
    );
    shared
        .queue
        .push(status_packet(status_push::CHANNELS_CHANGE, shared.version()));
}

/// A single channel was retuned or renamed. The live streamer always
/// follows; the status push is gated on the interface flag and the
/// protocol version.
fn channel_changed(shared: &SessionShared, config: &ServerConfig, channel: &Channel) {
    {
        let mut slot = shared.streamer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = slot.as_mut() {
            if stream.channel_uid() == channel.uid {
                stream.retune(channel);
            }
        }
    }

    let version = shared.version();
    if !shared.status_enabled() || !has_artwork(version) {
        return;
    }

    let mut p = status_packet(status_push::CHANNEL_CHANGED, version);
    put_channel(&mut p, channel, version, &config.picons_url);
    shared.queue.push(p);
}

/// Serialize a scan status block; shared between the polled push and
/// the scan-status request handler.
pub fn put_scan_status(p: &mut Packet, status: &ScanStatus) {
    p.put_u8(status.state);
    p.put_u16(status.progress);
    p.put_u16(status.strength);
    p.put_u16(status.num_channels);
    p.put_u16(status.new_channels);
    p.put_string(&status.device);
    p.put_string(&status.transponder);
}

/// Queue a scan-progress push; called from the session's idle tick
/// while a scan runs.
pub fn queue_scan_status(backend: &Backend, shared: &SessionShared) {
    let Some(status) = backend.scanner.status() else {
        return;
    };

    let mut p = status_packet(status_push::SCAN_PROGRESS, shared.version());
    put_scan_status(&mut p, &status);
    if let Err(e) = p.compress(shared.compression()) {
        warn!("[Session {}] scan status compression failed: {}", shared.id, e);
        return;
    }
    shared.queue.push(p);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory;

    fn shared_enabled(version: u16) -> Arc<SessionShared> {
        let shared = Arc::new(SessionShared::new(1));
        shared.set_status_enabled(true);
        shared.set_version(version);
        shared
    }

    #[test]
    fn pushes_are_gated_by_the_interface_flag() {
        let backend = memory::build(None, false);
        let config = ServerConfig::default();
        let shared = Arc::new(SessionShared::new(1));
        shared.set_version(7);

        forward(&backend, &shared, &config, BackendEvent::TimerListChanged);
        assert!(shared.queue.is_empty());

        shared.set_status_enabled(true);
        forward(&backend, &shared, &config, BackendEvent::TimerListChanged);
        let p = shared.queue.pop().unwrap();
        assert_eq!(p.opcode, status_push::TIMER_CHANGE);
        assert_eq!(p.class, PacketClass::Status);
    }

    #[test]
    fn channel_list_change_dedupes_on_visible_count() {
        let backend = memory::build(
            Some(
                toml::from_str(
                    r#"
                    [[channels]]
                    name = "One"
                    uid = 1
                    sid = 5
                    vpid = 101
                    "#,
                )
                .unwrap(),
            ),
            false,
        );
        let config = ServerConfig::default();
        let shared = shared_enabled(7);

        // client has not counted yet (0 cached), one channel visible
        forward(&backend, &shared, &config, BackendEvent::ChannelListChanged);
        assert_eq!(
            shared.queue.pop().unwrap().opcode,
            status_push::CHANNELS_CHANGE
        );

        // cache matches the visible count: no push
        shared.set_channel_count(1);
        forward(&backend, &shared, &config, BackendEvent::ChannelListChanged);
        assert!(shared.queue.is_empty());
    }

    #[test]
    fn noisy_backend_prompts_are_dropped() {
        let backend = memory::build(None, false);
        let config = ServerConfig::default();
        let shared = shared_enabled(7);

        forward(
            &backend,
            &shared,
            &config,
            BackendEvent::StatusMessage("Delete timer?".to_string()),
        );
        assert!(shared.queue.is_empty());

        forward(
            &backend,
            &shared,
            &config,
            BackendEvent::StatusMessage("Disk almost full".to_string()),
        );
        let mut p = shared.queue.pop().unwrap();
        assert_eq!(p.opcode, status_push::OSD_MESSAGE);
        assert_eq!(p.get_u32().unwrap(), 0);
        assert_eq!(p.get_string().unwrap(), "Disk almost full");
    }

    #[test]
    fn channel_changed_push_requires_version_six() {
        let backend = memory::build(None, false);
        let config = ServerConfig::default();
        let channel = crate::backend::Channel {
            number: 1,
            name: "Demo".to_string(),
            uid: 9,
            provider: String::new(),
            group_sep: false,
            sid: 5,
            vpid: 101,
            vtype: 2,
            audio_langs: Vec::new(),
            digital_langs: Vec::new(),
            caids: Vec::new(),
            source: crate::backend::ChannelSource::Cable,
            tid: 0,
            nid: 0,
        };

        let old = shared_enabled(5);
        forward(
            &backend,
            &old,
            &config,
            BackendEvent::ChannelChanged(channel.clone()),
        );
        assert!(old.queue.is_empty());

        let new = shared_enabled(6);
        forward(
            &backend,
            &new,
            &config,
            BackendEvent::ChannelChanged(channel),
        );
        assert_eq!(
            new.queue.pop().unwrap().opcode,
            status_push::CHANNEL_CHANGED
        );
    }

    #[test]
    fn recording_activity_carries_device_and_names() {
        let backend = memory::build(None, false);
        let config = ServerConfig::default();
        let shared = shared_enabled(7);

        forward(
            &backend,
            &shared,
            &config,
            BackendEvent::RecordingActivity {
                device: 2,
                on: true,
                name: "Tatort".to_string(),
                filename: "movies/tatort".to_string(),
            },
        );
        let mut p = shared.queue.pop().unwrap();
        assert_eq!(p.opcode, status_push::RECORDING_INFO);
        assert_eq!(p.get_u32().unwrap(), 2);
        assert_eq!(p.get_u32().unwrap(), 1);
        assert_eq!(p.get_string().unwrap(), "Tatort");
        assert_eq!(p.get_string().unwrap(), "movies/tatort");
    }
}
