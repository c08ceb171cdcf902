//! Per-opcode request handling.
//!
//! One handler per request opcode. Handlers translate backend errors
//! into wire status codes; a malformed request payload is the only
//! request fault that tears the connection down.

use std::sync::Arc;

use chrono::Local;
use log::{debug, error, info, warn};

use pvrd_protocol::{
    has_artwork, opcode, Packet, ProtocolError, StatusCode, PROTOCOL_VERSION,
    PROTOCOL_VERSION_MIN,
};

use crate::backend::{
    Backend, BackendError, LiveStreamParams, Recording, RecordingIndex, ScanSetup,
    TimerDefinition, TIMER_ACTIVE,
};
use crate::server::channels::{put_channel, put_timer};
use crate::server::filter::{
    self, compute_groups, count_wanted, group_key, wanted, ChannelKind, GroupCatalogs,
};
use crate::server::listener::ServerConfig;
use crate::server::playback::Playback;
use crate::server::session::{SessionShared, SessionState};
use crate::server::status::put_scan_status;
use crate::server::streaming::LiveStream;

/// What the session loop should do with a handled request.
pub enum Outcome {
    Reply(Packet),
    /// Handled, but the opcode carries no response.
    None,
    /// Unrecoverable; the session tears the connection down.
    Close,
}

/// Borrowed view of everything a handler may touch.
pub struct HandlerContext<'a> {
    pub backend: &'a Backend,
    pub shared: &'a Arc<SessionShared>,
    pub config: &'a Arc<ServerConfig>,
    pub playback: &'a mut Option<Playback>,
    pub groups: &'a mut GroupCatalogs,
    pub state: &'a mut SessionState,
}

pub fn handle(ctx: &mut HandlerContext, req: &mut Packet) -> Outcome {
    match dispatch(ctx, req) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                "[Session {}] malformed payload for opcode {}: {}",
                ctx.shared.id, req.opcode, e
            );
            Outcome::Close
        }
    }
}

fn dispatch(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    match req.opcode {
        opcode::LOGIN => login(ctx, req),
        opcode::GET_TIME => get_time(req),
        opcode::ENABLE_STATUS_INTERFACE => enable_status_interface(ctx, req),
        opcode::UPDATE_CHANNELS => update_channels(ctx, req),
        opcode::CHANNEL_FILTER => channel_filter(ctx, req),

        opcode::STREAM_OPEN => stream_open(ctx, req),
        opcode::STREAM_CLOSE => stream_close(ctx, req),
        opcode::STREAM_REQUEST => stream_request(ctx),
        opcode::STREAM_PAUSE => stream_pause(ctx, req),
        opcode::STREAM_SIGNAL => stream_signal(ctx),

        opcode::REC_OPEN => rec_open(ctx, req),
        opcode::REC_CLOSE => rec_close(ctx, req),
        opcode::REC_GET_BLOCK => rec_get_block(ctx, req),
        opcode::REC_GET_PACKET => rec_get_packet(ctx, req),
        opcode::REC_UPDATE => rec_update(ctx, req),
        opcode::REC_SEEK => rec_seek(ctx, req),

        opcode::CHANNELS_COUNT => channels_count(ctx, req),
        opcode::CHANNELS_LIST => channels_list(ctx, req),
        opcode::GROUPS_COUNT => groups_count(ctx, req),
        opcode::GROUPS_LIST => groups_list(ctx, req),
        opcode::GROUPS_MEMBERS => groups_members(ctx, req),

        opcode::TIMER_COUNT => timer_count(ctx, req),
        opcode::TIMER_GET => timer_get(ctx, req),
        opcode::TIMER_LIST => timer_list(ctx, req),
        opcode::TIMER_ADD => timer_add(ctx, req),
        opcode::TIMER_DELETE => timer_delete(ctx, req),
        opcode::TIMER_UPDATE => timer_update(ctx, req),

        opcode::RECORDINGS_DISKSIZE => recordings_disk_size(ctx, req),
        opcode::RECORDINGS_COUNT => recordings_count(ctx, req),
        opcode::RECORDINGS_LIST => recordings_list(ctx, req),
        opcode::RECORDINGS_RENAME => recordings_rename(ctx, req),
        opcode::RECORDINGS_DELETE => recordings_delete(ctx, req),
        opcode::RECORDINGS_SET_PLAYCOUNT => recordings_set_play_count(ctx, req),
        opcode::RECORDINGS_SET_POSITION => recordings_set_position(ctx, req),
        opcode::RECORDINGS_GET_POSITION => recordings_get_position(ctx, req),
        opcode::RECORDINGS_GET_MARKS => recordings_get_marks(ctx, req),
        opcode::RECORDINGS_SET_URLS => recordings_set_urls(ctx, req),

        opcode::ARTWORK_GET => artwork_get(ctx, req),
        opcode::ARTWORK_SET => artwork_set(ctx, req),

        opcode::EPG_FOR_CHANNEL => epg_for_channel(ctx, req),

        opcode::SCAN_SUPPORTED => scan_supported(ctx, req),
        opcode::SCAN_GET_SETUP => scan_get_setup(ctx, req),
        opcode::SCAN_SET_SETUP => scan_set_setup(ctx, req),
        opcode::SCAN_START => scan_start(ctx, req),
        opcode::SCAN_STOP => scan_stop(ctx, req),
        opcode::SCAN_GET_STATUS => scan_get_status(ctx, req),

        other => {
            debug!("[Session {}] unknown opcode {}, ignored", ctx.shared.id, other);
            Ok(Outcome::None)
        }
    }
}

// ---------------------------------------------------------------------
// helpers

fn reply(resp: Packet) -> Result<Outcome, ProtocolError> {
    Ok(Outcome::Reply(resp))
}

fn status_reply(req: &Packet, code: StatusCode) -> Packet {
    let mut resp = Packet::response_to(req);
    resp.put_u32(code.into());
    resp
}

/// Generic backend-to-wire status mapping; handlers override where the
/// protocol demands a different code.
fn backend_status(e: &BackendError) -> StatusCode {
    match e {
        BackendError::NotFound => StatusCode::DataUnknown,
        BackendError::Locked | BackendError::Duplicate | BackendError::InUse => {
            StatusCode::DataLocked
        }
        BackendError::Invalid => StatusCode::DataInvalid,
        BackendError::Unsupported => StatusCode::NotSupported,
        BackendError::Io(_) => StatusCode::Error,
    }
}

fn now_parts() -> (u32, i32) {
    let now = Local::now();
    (now.timestamp() as u32, now.offset().local_minus_utc())
}

/// Compress a bulk response with the negotiated level. A compression
/// failure drops this one reply; the session stays up.
fn finish_compressed(shared: &SessionShared, mut resp: Packet) -> Outcome {
    match resp.compress(shared.compression()) {
        Ok(()) => Outcome::Reply(resp),
        Err(e) => {
            warn!(
                "[Session {}] response compression failed, dropping reply: {}",
                shared.id, e
            );
            Outcome::None
        }
    }
}

fn recording_by_recid(backend: &Backend, recid: &str) -> Option<Recording> {
    let uid = RecordingIndex::parse(recid)?;
    let path = backend.rec_index.lookup(uid)?;
    backend.recordings.by_path(&path)
}

fn recording_path(backend: &Backend, recid: &str) -> Option<String> {
    RecordingIndex::parse(recid).and_then(|uid| backend.rec_index.lookup(uid))
}

// ---------------------------------------------------------------------
// session setup

fn login(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let version = req.version;
    let compression = req.get_u8()?;
    let client_name = req.get_string()?;

    // optional preferred language
    let mut language = None;
    if !req.eop() {
        let tag = req.get_string()?;
        let stream_type = req.get_u8()?;
        ctx.shared.set_lang_stream_type(stream_type);
        language = Some(tag);
    }

    if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION).contains(&version) {
        error!(
            "[Session {}] client '{}' has unsupported protocol version {}, terminating client",
            ctx.shared.id, client_name, version
        );
        return Ok(Outcome::Close);
    }

    ctx.shared.set_version(version);
    ctx.shared.set_compression(compression);

    info!(
        "[Session {}] welcome client '{}' with protocol version {}",
        ctx.shared.id, client_name, version
    );

    if let Some(tag) = language {
        let index = filter::language_index(&tag);
        match index {
            Some(i) => info!(
                "[Session {}] preferred language: {} / stream type {}",
                ctx.shared.id,
                filter::language_code(i).unwrap_or("?"),
                ctx.shared.lang_stream_type()
            ),
            None => debug!(
                "[Session {}] unknown preferred language '{}'",
                ctx.shared.id, tag
            ),
        }
        ctx.shared
            .filter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .language_index = index;
    }

    *ctx.state = SessionState::LoggedIn;

    let (epoch, offset) = now_parts();
    let mut resp = Packet::response_to(req);
    resp.put_u32(epoch);
    resp.put_s32(offset);
    resp.put_string(&ctx.config.server_name);
    resp.put_string(env!("CARGO_PKG_VERSION"));
    reply(resp)
}

fn get_time(req: &Packet) -> Result<Outcome, ProtocolError> {
    let (epoch, offset) = now_parts();
    let mut resp = Packet::response_to(req);
    resp.put_u32(epoch);
    resp.put_s32(offset);
    reply(resp)
}

fn enable_status_interface(
    ctx: &mut HandlerContext,
    req: &mut Packet,
) -> Result<Outcome, ProtocolError> {
    let enabled = req.get_u8()? != 0;
    ctx.shared.set_status_enabled(enabled);
    reply(status_reply(req, StatusCode::Ok))
}

fn update_channels(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let policy = req.get_u8()?;

    if policy <= 5 {
        info!(
            "[Session {}] setting channel update method: {}",
            ctx.shared.id, policy
        );
        ctx.backend.channels.set_update_policy(policy);
        reply(status_reply(req, StatusCode::Ok))
    } else {
        reply(status_reply(req, StatusCode::DataInvalid))
    }
}

fn channel_filter(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let want_fta = req.get_u32()? != 0;
    let language_only = req.get_u32()? != 0;

    let count = req.get_u32()?;
    let mut caids = Vec::new();

    // sanity cap on the CA-id set
    if count < 20 {
        for _ in 0..count {
            caids.push(req.get_u32()?);
        }
    }

    info!(
        "[Session {}] channel filter: fta={} native-language={} caids={:04X?}",
        ctx.shared.id, want_fta, language_only, caids
    );

    let mut settings = ctx.shared.filter.lock().unwrap_or_else(|e| e.into_inner());
    settings.want_fta = want_fta;
    settings.language_only = language_only;
    settings.caids = caids;
    drop(settings);

    reply(status_reply(req, StatusCode::Ok))
}

// ---------------------------------------------------------------------
// live streaming

fn stream_open(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let uid = req.get_u32()?;

    let mut priority = 50;
    let mut wait_for_key_frame = false;
    let mut raw_pts = false;

    if !req.eop() {
        priority = req.get_s32()?;
    }
    if !req.eop() {
        wait_for_key_frame = req.get_u8()? != 0;
    }
    if !req.eop() {
        raw_pts = req.get_u8()? != 0;
    }

    ctx.shared.close_streamer();

    // uid first, then channel number
    let channel = ctx
        .backend
        .channels
        .by_uid(uid)
        .or_else(|| ctx.backend.channels.by_number(uid));

    let Some(channel) = channel else {
        error!("[Session {}] can't find channel {:08x}", ctx.shared.id, uid);
        return reply(status_reply(req, StatusCode::DataInvalid));
    };

    let language_index = ctx
        .shared
        .filter
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .language_index;

    let params = LiveStreamParams {
        priority,
        timeout_secs: ctx.config.stream_timeout_secs,
        wait_for_key_frame,
        raw_pts,
        language_index,
        language_stream_type: ctx.shared.lang_stream_type(),
    };

    match LiveStream::open(ctx.backend, &channel, params) {
        Ok(stream) => {
            info!(
                "[Session {}] started streaming of channel {} (timeout {} seconds, priority {})",
                ctx.shared.id, channel.name, ctx.config.stream_timeout_secs, priority
            );
            *ctx.shared.streamer.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
            reply(status_reply(req, StatusCode::Ok))
        }
        Err(e) => {
            warn!(
                "[Session {}] can't stream channel {}: {}",
                ctx.shared.id, channel.name, e
            );
            reply(status_reply(req, backend_status(&e)))
        }
    }
}

fn stream_close(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    ctx.shared.close_streamer();
    reply(Packet::response_to(req))
}

fn stream_request(ctx: &mut HandlerContext) -> Result<Outcome, ProtocolError> {
    let mut slot = ctx.shared.streamer.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(stream) = slot.as_mut() {
        stream.request_packet(ctx.shared);
    }
    Ok(Outcome::None)
}

fn stream_pause(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let on = req.get_u32()? != 0;
    info!(
        "[Session {}] live stream {}",
        ctx.shared.id,
        if on { "paused" } else { "resumed" }
    );

    let mut slot = ctx.shared.streamer.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(stream) = slot.as_mut() {
        stream.pause(on);
    }
    drop(slot);

    reply(Packet::response_to(req))
}

fn stream_signal(ctx: &mut HandlerContext) -> Result<Outcome, ProtocolError> {
    let slot = ctx.shared.streamer.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(stream) = slot.as_ref() {
        stream.request_signal_info(ctx.shared);
    }
    Ok(Outcome::None)
}

// ---------------------------------------------------------------------
// recording playback

fn rec_open(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;

    if ctx.playback.is_some() {
        warn!(
            "[Session {}] playback already open, rejecting open for {}",
            ctx.shared.id, recid
        );
        return reply(status_reply(req, StatusCode::DataLocked));
    }

    let Some(recording) = recording_by_recid(ctx.backend, &recid) else {
        error!("[Session {}] unknown recording id {}", ctx.shared.id, recid);
        return reply(status_reply(req, StatusCode::DataUnknown));
    };

    match Playback::open(ctx.backend, &recording) {
        Ok(playback) => {
            info!(
                "[Session {}] opened recording '{}' ({} bytes)",
                ctx.shared.id,
                recording.title,
                playback.length_bytes()
            );

            let mut resp = status_reply(req, StatusCode::Ok);
            resp.put_u32(0);
            resp.put_u64(playback.length_bytes());
            resp.put_u8(u8::from(playback.is_raw_ts()));
            resp.put_u32(playback.duration_secs());

            *ctx.playback = Some(playback);
            reply(resp)
        }
        Err(e) => {
            error!(
                "[Session {}] unable to open recording '{}': {}",
                ctx.shared.id, recording.title, e
            );
            reply(status_reply(req, backend_status(&e)))
        }
    }
}

fn rec_close(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    *ctx.playback = None;
    reply(status_reply(req, StatusCode::Ok))
}

fn rec_get_block(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let Some(playback) = ctx.playback.as_mut() else {
        error!(
            "[Session {}] get block called with no recording open",
            ctx.shared.id
        );
        return Ok(Outcome::None);
    };

    let position = req.get_u64()?;
    let amount = req.get_u32()?;

    let mut resp = Packet::response_to(req);
    match playback.get_block(position, amount) {
        Ok(data) => resp.put_blob(&data),
        Err(e) => warn!("[Session {}] block read failed: {}", ctx.shared.id, e),
    }
    reply(resp)
}

fn rec_get_packet(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let Some(playback) = ctx.playback.as_mut() else {
        return Ok(Outcome::None);
    };

    // the demuxed packet travels as a stream message; the response
    // itself stays empty
    playback.queue_packet(ctx.shared);
    reply(Packet::response_to(req))
}

fn rec_update(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let Some(playback) = ctx.playback.as_mut() else {
        return Ok(Outcome::None);
    };

    let length = playback.update();
    let mut resp = Packet::response_to(req);
    resp.put_u32(0);
    resp.put_u64(length);
    reply(resp)
}

fn rec_seek(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let Some(playback) = ctx.playback.as_mut() else {
        return Ok(Outcome::None);
    };

    let position = req.get_u64()?;
    let pts = playback.seek(position);

    let mut resp = Packet::response_to(req);
    resp.put_u64(pts as u64);
    reply(resp)
}

// ---------------------------------------------------------------------
// channel access

fn channels_count(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let snapshot = ctx.backend.channels.snapshot();
    let settings = ctx
        .shared
        .filter
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let count = count_wanted(&snapshot, &settings);
    ctx.shared.set_channel_count(count);

    let mut resp = Packet::response_to(req);
    resp.put_u32(count);
    reply(resp)
}

fn channels_list(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let kind = ChannelKind::from(req.get_u32()?);
    let version = ctx.shared.version();

    let snapshot = ctx.backend.channels.snapshot();
    let settings = ctx
        .shared
        .filter
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    ctx.shared
        .set_channel_count(count_wanted(&snapshot, &settings));

    let mut resp = Packet::response_to(req);
    for channel in &snapshot {
        if !wanted(channel, kind, &settings) {
            continue;
        }
        put_channel(&mut resp, channel, version, &ctx.config.picons_url);
    }

    Ok(finish_compressed(ctx.shared, resp))
}

fn groups_count(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let automatic = req.get_u32()? == 1;

    let snapshot = ctx.backend.channels.snapshot();
    let settings = ctx
        .shared
        .filter
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    *ctx.groups = compute_groups(&snapshot, automatic, &settings);

    let mut resp = Packet::response_to(req);
    resp.put_u32(ctx.groups.total());
    reply(resp)
}

fn groups_list(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let radio = req.get_u8()? != 0;

    let mut resp = Packet::response_to(req);
    for group in ctx.groups.by_radio(radio).values() {
        resp.put_string(&group.name);
        resp.put_u8(u8::from(group.radio));
    }
    reply(resp)
}

fn groups_members(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let name = req.get_string()?;
    let radio = req.get_u8()? != 0;

    let mut resp = Packet::response_to(req);

    let Some(group) = ctx.groups.by_radio(radio).get(&name) else {
        return reply(resp);
    };
    let automatic = group.automatic;

    let snapshot = ctx.backend.channels.snapshot();
    let settings = ctx
        .shared
        .filter
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    ctx.shared
        .set_channel_count(count_wanted(&snapshot, &settings));

    let kind = if radio {
        ChannelKind::RadioOnly
    } else {
        ChannelKind::Any
    };

    let mut last_sep = String::new();
    let mut index = 0u32;
    for channel in &snapshot {
        let Some(key) = group_key(channel, automatic, &mut last_sep) else {
            continue;
        };
        if key != name || !wanted(channel, kind, &settings) {
            continue;
        }
        index += 1;
        resp.put_u32(channel.uid);
        resp.put_u32(index);
    }

    reply(resp)
}

// ---------------------------------------------------------------------
// timer access

fn timer_count(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let mut resp = Packet::response_to(req);
    resp.put_u32(ctx.backend.timers.count());
    reply(resp)
}

fn timer_get(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let number = req.get_u32()?;

    let timer = number
        .checked_sub(1)
        .and_then(|i| ctx.backend.timers.get(i as usize));

    let Some(timer) = timer else {
        return reply(status_reply(req, StatusCode::DataUnknown));
    };

    let mut resp = status_reply(req, StatusCode::Ok);
    put_timer(&mut resp, &timer, ctx.backend.timers.conflict_flags(&timer));
    reply(resp)
}

fn timer_list(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    if ctx.backend.timers.being_edited() {
        error!(
            "[Session {}] unable to list timers, catalog under edit",
            ctx.shared.id
        );
        return reply(status_reply(req, StatusCode::DataLocked));
    }

    let timers = ctx.backend.timers.list();

    let mut resp = Packet::response_to(req);
    resp.put_u32(timers.len() as u32);
    for timer in &timers {
        put_timer(&mut resp, timer, ctx.backend.timers.conflict_flags(timer));
    }
    reply(resp)
}

/// Timer fields shared by add and update, in their fixed wire order.
fn read_timer_definition(req: &mut Packet) -> Result<TimerDefinition, ProtocolError> {
    let active = req.get_u32()?;
    Ok(TimerDefinition {
        flags: if active > 0 { TIMER_ACTIVE } else { 0 },
        priority: req.get_u32()?,
        lifetime: req.get_u32()?,
        channel_uid: req.get_u32()?,
        start: req.get_u32()?,
        stop: req.get_u32()?,
        day: req.get_u32()?,
        weekdays: req.get_u32()?,
        file: req.get_string()?,
        aux: req.get_string()?,
    })
}

fn timer_add(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    if ctx.backend.timers.being_edited() {
        error!(
            "[Session {}] unable to add timer, catalog under edit",
            ctx.shared.id
        );
        return reply(status_reply(req, StatusCode::DataLocked));
    }

    let _index = req.get_u32()?; // unused
    let mut def = read_timer_definition(req)?;

    // instant timers
    if def.start == 0 || def.start == u32::MAX {
        def.start = now_parts().0;
    }

    match ctx.backend.timers.add(def) {
        Ok(()) => {
            info!("[Session {}] timer added", ctx.shared.id);
            reply(status_reply(req, StatusCode::Ok))
        }
        Err(e) => {
            error!("[Session {}] timer not added: {}", ctx.shared.id, e);
            reply(status_reply(req, backend_status(&e)))
        }
    }
}

fn timer_delete(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let uid = req.get_u32()?;
    let force = req.get_u32()? != 0;

    let Some(timer) = ctx.backend.timers.by_uid(uid) else {
        error!(
            "[Session {}] unable to delete timer, invalid identifier {}",
            ctx.shared.id, uid
        );
        return reply(status_reply(req, StatusCode::DataInvalid));
    };

    if ctx.backend.timers.being_edited() {
        error!(
            "[Session {}] unable to delete timer, catalog under edit",
            ctx.shared.id
        );
        return reply(status_reply(req, StatusCode::DataLocked));
    }

    if timer.recording && !force {
        error!(
            "[Session {}] timer {} is recording, use force to stop it",
            ctx.shared.id, uid
        );
        return reply(status_reply(req, StatusCode::RecordingRunning));
    }

    match ctx.backend.timers.delete(uid) {
        Ok(()) => {
            info!("[Session {}] deleted timer {}", ctx.shared.id, uid);
            reply(status_reply(req, StatusCode::Ok))
        }
        Err(e) => reply(status_reply(req, backend_status(&e))),
    }
}

fn timer_update(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let uid = req.get_u32()?;

    let Some(timer) = ctx.backend.timers.by_uid(uid) else {
        error!("[Session {}] timer {} not defined", ctx.shared.id, uid);
        return reply(status_reply(req, StatusCode::DataUnknown));
    };

    if timer.recording {
        info!(
            "[Session {}] will not update timer {}, currently recording",
            ctx.shared.id, uid
        );
        return reply(status_reply(req, StatusCode::Ok));
    }

    let def = read_timer_definition(req)?;

    match ctx.backend.timers.update(uid, def) {
        Ok(()) => reply(status_reply(req, StatusCode::Ok)),
        Err(e) => {
            error!("[Session {}] timer update failed: {}", ctx.shared.id, e);
            reply(status_reply(req, backend_status(&e)))
        }
    }
}

// ---------------------------------------------------------------------
// recording access

fn recordings_disk_size(
    ctx: &mut HandlerContext,
    req: &mut Packet,
) -> Result<Outcome, ProtocolError> {
    let space = ctx.backend.recordings.disk_space();

    let mut resp = Packet::response_to(req);
    resp.put_u32(space.total_mb);
    resp.put_u32(space.free_mb);
    resp.put_u32(space.used_percent);
    reply(resp)
}

fn recordings_count(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let mut resp = Packet::response_to(req);
    resp.put_u32(ctx.backend.recordings.count());
    reply(resp)
}

fn recordings_list(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let mut resp = Packet::response_to(req);

    for recording in ctx.backend.recordings.list() {
        let uid = ctx.backend.rec_index.register(&recording.path);

        resp.put_u32(recording.start);
        resp.put_u32(recording.duration);
        resp.put_u32(recording.priority);
        resp.put_u32(recording.lifetime);
        resp.put_string(&recording.channel_name);
        resp.put_string(&recording.title);
        resp.put_string(&recording.subtitle);
        resp.put_string(&recording.description);

        // stored folder names carry '_' for ' '
        resp.put_string(&recording.directory.replace('_', " "));

        resp.put_string(&RecordingIndex::format(uid));
        resp.put_u32(ctx.backend.recordings.play_count(&recording.path));
        resp.put_u32(recording.content);

        let (poster, background) = ctx.backend.recordings.urls(&recording.path);
        resp.put_string(&poster);
        resp.put_string(&background);
    }

    Ok(finish_compressed(ctx.shared, resp))
}

fn recordings_rename(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;
    let new_title = req.get_string()?;

    let Some(recording) = recording_by_recid(ctx.backend, &recid) else {
        return reply(status_reply(req, StatusCode::DataInvalid));
    };

    info!(
        "[Session {}] renaming recording '{}' to '{}'",
        ctx.shared.id, recording.title, new_title
    );

    match ctx.backend.recordings.rename(&recording.path, &new_title) {
        Ok(()) => reply(status_reply(req, StatusCode::Ok)),
        Err(e) => {
            error!("[Session {}] rename failed: {}", ctx.shared.id, e);
            reply(status_reply(req, StatusCode::Error))
        }
    }
}

fn recordings_delete(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;

    let Some(recording) = recording_by_recid(ctx.backend, &recid) else {
        error!("[Session {}] recording {} not found", ctx.shared.id, recid);
        return reply(status_reply(req, StatusCode::DataUnknown));
    };

    match ctx.backend.recordings.delete(&recording.path) {
        Ok(()) => {
            info!(
                "[Session {}] recording '{}' deleted",
                ctx.shared.id, recording.title
            );
            reply(status_reply(req, StatusCode::Ok))
        }
        Err(e @ BackendError::InUse) => {
            error!(
                "[Session {}] recording '{}' is in use",
                ctx.shared.id, recording.title
            );
            reply(status_reply(req, backend_status(&e)))
        }
        Err(e) => {
            error!("[Session {}] error deleting recording: {}", ctx.shared.id, e);
            reply(status_reply(req, StatusCode::Error))
        }
    }
}

fn recordings_set_play_count(
    ctx: &mut HandlerContext,
    req: &mut Packet,
) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;
    let count = req.get_u32()?;

    if let Some(path) = recording_path(ctx.backend, &recid) {
        ctx.backend.recordings.set_play_count(&path, count);
    }
    reply(Packet::response_to(req))
}

fn recordings_set_position(
    ctx: &mut HandlerContext,
    req: &mut Packet,
) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;
    let position = req.get_u64()?;

    if let Some(path) = recording_path(ctx.backend, &recid) {
        ctx.backend.recordings.set_position(&path, position);
    }
    reply(Packet::response_to(req))
}

fn recordings_get_position(
    ctx: &mut HandlerContext,
    req: &mut Packet,
) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;

    let position = recording_path(ctx.backend, &recid)
        .map(|path| ctx.backend.recordings.position(&path))
        .unwrap_or(0);

    let mut resp = Packet::response_to(req);
    resp.put_u64(position);
    reply(resp)
}

fn recordings_get_marks(
    ctx: &mut HandlerContext,
    req: &mut Packet,
) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;

    let Some(recording) = recording_by_recid(ctx.backend, &recid) else {
        error!(
            "[Session {}] get marks: recording {} not found",
            ctx.shared.id, recid
        );
        return reply(status_reply(req, StatusCode::DataUnknown));
    };

    let Some((frame_rate, marks)) = ctx.backend.recordings.marks(&recording.path) else {
        info!(
            "[Session {}] no marks found for '{}'",
            ctx.shared.id, recording.title
        );
        return reply(status_reply(req, StatusCode::NotSupported));
    };

    let mut resp = status_reply(req, StatusCode::Ok);
    resp.put_u64((frame_rate * 10000.0) as u64);

    for mark in &marks {
        resp.put_string(&mark.kind);
        resp.put_u64(mark.begin);
        resp.put_u64(mark.end);
        resp.put_string(&mark.text);
    }
    reply(resp)
}

fn recordings_set_urls(
    ctx: &mut HandlerContext,
    req: &mut Packet,
) -> Result<Outcome, ProtocolError> {
    let recid = req.get_string()?;
    let poster = req.get_string()?;
    let background = req.get_string()?;
    let movie_id = req.get_u32()?;

    if let Some(path) = recording_path(ctx.backend, &recid) {
        ctx.backend
            .recordings
            .set_urls(&path, &poster, &background, movie_id);
    }
    reply(Packet::response_to(req))
}

// ---------------------------------------------------------------------
// artwork

fn artwork_get(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let title = req.get_string()?;
    let content = req.get_u32()?;

    let (poster, background) = ctx
        .backend
        .artwork
        .get(content, &title)
        .unwrap_or_else(|| ("x".to_string(), "x".to_string()));

    let mut resp = Packet::response_to(req);
    resp.put_string(&poster);
    resp.put_string(&background);
    resp.put_u32(0); // external id, unused
    reply(resp)
}

fn artwork_set(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let title = req.get_string()?;
    let content = req.get_u32()?;
    let poster = req.get_string()?;
    let background = req.get_string()?;
    let external_id = req.get_u32()?;

    info!(
        "[Session {}] set artwork: {} ({}): {}",
        ctx.shared.id, title, content, background
    );
    ctx.backend
        .artwork
        .set(content, &title, &poster, &background, external_id);
    reply(Packet::response_to(req))
}

// ---------------------------------------------------------------------
// epg

fn epg_for_channel(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let channel_uid = req.get_u32()?;
    let start_time = req.get_u32()?;
    let duration = req.get_u32()?;

    let mut resp = Packet::response_to(req);

    if ctx.backend.channels.by_uid(channel_uid).is_none() {
        debug!(
            "[Session {}] epg requested for unknown channel {:08x}",
            ctx.shared.id, channel_uid
        );
        resp.put_u32(0);
        return reply(resp);
    }

    let Some(events) = ctx.backend.epg.schedule(channel_uid) else {
        debug!(
            "[Session {}] no schedule for channel {:08x}",
            ctx.shared.id, channel_uid
        );
        resp.put_u32(0);
        return reply(resp);
    };

    let version = ctx.shared.version();
    let now = u64::from(now_parts().0);
    let mut any = false;

    // window math in u64, the bounds are client-supplied
    for event in &events {
        let end = u64::from(event.start) + u64::from(event.duration);
        if end < now {
            continue;
        }
        if end <= u64::from(start_time) {
            continue;
        }
        if duration != 0 && u64::from(event.start) >= u64::from(start_time) + u64::from(duration) {
            continue;
        }

        resp.put_u32(event.id);
        resp.put_u32(event.start);
        resp.put_u32(event.duration);
        resp.put_u32(event.content);
        resp.put_u32(event.rating);
        resp.put_string(&event.title);
        resp.put_string(&event.subtitle);
        resp.put_string(&event.description);

        if has_artwork(version) {
            let (poster, background) = ctx
                .backend
                .artwork
                .get(event.content, &event.title)
                .unwrap_or_else(|| ("x".to_string(), "x".to_string()));
            resp.put_string(&poster);
            resp.put_string(&background);
        }

        any = true;
    }

    if !any {
        resp.put_u32(0);
    }

    Ok(finish_compressed(ctx.shared, resp))
}

// ---------------------------------------------------------------------
// channel scanning

fn scan_supported(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let code = if ctx.backend.scanner.available() {
        StatusCode::Ok
    } else {
        StatusCode::NotSupported
    };
    reply(status_reply(req, code))
}

fn scan_get_setup(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let scanner = &ctx.backend.scanner;

    let (Some(setup), Some(satellites), Some(countries)) =
        (scanner.setup(), scanner.satellites(), scanner.countries())
    else {
        info!("[Session {}] unable to get scanner setup", ctx.shared.id);
        return reply(status_reply(req, StatusCode::NotSupported));
    };

    let mut resp = status_reply(req, StatusCode::Ok);

    resp.put_u16(setup.verbosity);
    resp.put_u16(setup.log_file);
    resp.put_u16(setup.dvb_type);
    resp.put_u16(setup.dvbt_inversion);
    resp.put_u16(setup.dvbc_inversion);
    resp.put_u16(setup.dvbc_symbolrate);
    resp.put_u16(setup.dvbc_qam);
    resp.put_u16(setup.country_id);
    resp.put_u16(setup.sat_id);
    resp.put_u32(setup.flags);
    resp.put_u16(setup.atsc_type);

    resp.put_u16(satellites.len() as u16);
    for entry in &satellites {
        resp.put_s32(entry.id);
        resp.put_string(&entry.short_name);
        resp.put_string(&entry.full_name);
    }

    resp.put_u16(countries.len() as u16);
    for entry in &countries {
        resp.put_s32(entry.id);
        resp.put_string(&entry.short_name);
        resp.put_string(&entry.full_name);
    }

    Ok(finish_compressed(ctx.shared, resp))
}

fn scan_set_setup(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let setup = ScanSetup {
        verbosity: req.get_u16()?,
        log_file: req.get_u16()?,
        dvb_type: req.get_u16()?,
        dvbt_inversion: req.get_u16()?,
        dvbc_inversion: req.get_u16()?,
        dvbc_symbolrate: req.get_u16()?,
        dvbc_qam: req.get_u16()?,
        country_id: req.get_u16()?,
        sat_id: req.get_u16()?,
        flags: req.get_u32()?,
        atsc_type: req.get_u16()?,
    };

    if !ctx.backend.scanner.set_setup(setup) {
        info!("[Session {}] unable to store scanner setup", ctx.shared.id);
        return reply(status_reply(req, StatusCode::NotSupported));
    }

    info!("[Session {}] new scanner setup stored", ctx.shared.id);
    reply(status_reply(req, StatusCode::Ok))
}

fn scan_start(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    if !ctx.backend.scanner.start() {
        info!("[Session {}] unable to start channel scanner", ctx.shared.id);
        return reply(status_reply(req, StatusCode::NotSupported));
    }

    info!("[Session {}] channel scanner started", ctx.shared.id);
    reply(status_reply(req, StatusCode::Ok))
}

fn scan_stop(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    if !ctx.backend.scanner.stop() {
        info!("[Session {}] unable to stop channel scanner", ctx.shared.id);
        return reply(status_reply(req, StatusCode::NotSupported));
    }

    info!("[Session {}] channel scanner stopped", ctx.shared.id);
    reply(status_reply(req, StatusCode::Ok))
}

fn scan_get_status(ctx: &mut HandlerContext, req: &mut Packet) -> Result<Outcome, ProtocolError> {
    let Some(status) = ctx.backend.scanner.status() else {
        return reply(status_reply(req, StatusCode::NotSupported));
    };

    let mut resp = status_reply(req, StatusCode::Ok);
    put_scan_status(&mut resp, &status);
    Ok(finish_compressed(ctx.shared, resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use pvrd_protocol::PacketClass;
    use tokio::sync::broadcast;

    use crate::backend::memory::{
        self, MemoryArtwork, MemoryChannels, MemoryGuide, MemoryLive, MemoryRecordings,
        MemoryScanner, MemoryStore, MemoryTimers,
    };
    use crate::backend::RecordingMark;

    struct Fixture {
        backend: Backend,
        shared: Arc<SessionShared>,
        config: Arc<ServerConfig>,
        playback: Option<Playback>,
        groups: GroupCatalogs,
        state: SessionState,
    }

    impl Fixture {
        fn new(catalog: &str) -> Self {
            Self::with_scanner(catalog, false)
        }

        fn with_scanner(catalog: &str, scanner: bool) -> Self {
            let catalog = if catalog.is_empty() {
                None
            } else {
                Some(toml::from_str(catalog).unwrap())
            };
            Self::with_backend(memory::build(catalog, scanner))
        }

        fn with_backend(backend: Backend) -> Self {
            let shared = Arc::new(SessionShared::new(1));
            shared.set_version(PROTOCOL_VERSION);
            Self {
                backend,
                shared,
                config: Arc::new(ServerConfig::default()),
                playback: None,
                groups: GroupCatalogs::default(),
                state: SessionState::LoggedIn,
            }
        }

        fn call(&mut self, req: &mut Packet) -> Outcome {
            let mut ctx = HandlerContext {
                backend: &self.backend,
                shared: &self.shared,
                config: &self.config,
                playback: &mut self.playback,
                groups: &mut self.groups,
                state: &mut self.state,
            };
            handle(&mut ctx, req)
        }

        fn reply(&mut self, req: &mut Packet) -> Packet {
            match self.call(req) {
                Outcome::Reply(p) => p,
                Outcome::None => panic!("opcode {} produced no reply", req.opcode),
                Outcome::Close => panic!("opcode {} closed the session", req.opcode),
            }
        }
    }

    fn request(op: u32) -> Packet {
        let mut p = Packet::new(op, PacketClass::RequestResponse);
        p.uid = 7;
        p.version = PROTOCOL_VERSION;
        p
    }

    fn status_of(resp: &mut Packet) -> u32 {
        resp.get_u32().unwrap()
    }

    const CHANNELS: &str = r#"
        [[channels]]
        name = "Bouquet A"
        uid = 1
        separator = true

        [[channels]]
        name = "Das Erste"
        uid = 2
        provider = "ARD"
        sid = 5
        vpid = 101
        vtype = 2

        [[channels]]
        name = "Radio Eins"
        uid = 3
        provider = "RBB"
        sid = 6
        audio = ["ger"]
    "#;

    #[test]
    fn login_negotiates_version_and_compression() {
        let mut fx = Fixture::new("");
        fx.state = SessionState::Connected;
        fx.shared.set_version(0);

        let mut req = request(opcode::LOGIN);
        req.version = 6;
        req.put_u8(3);
        req.put_string("test client");
        req.put_string("deu");
        req.put_u8(2);

        let mut resp = fx.reply(&mut req);
        assert_eq!(fx.state, SessionState::LoggedIn);
        assert_eq!(fx.shared.version(), 6);
        assert_eq!(fx.shared.compression(), 3);
        assert_eq!(fx.shared.lang_stream_type(), 2);
        assert_eq!(
            fx.shared.filter.lock().unwrap().language_index,
            filter::language_index("deu")
        );

        assert_eq!(resp.version, 6);
        assert!(resp.get_u32().unwrap() > 0);
        resp.get_s32().unwrap();
        assert!(!resp.get_string().unwrap().is_empty());
        assert!(!resp.get_string().unwrap().is_empty());
        assert!(resp.eop());
    }

    #[test]
    fn login_rejects_out_of_range_versions() {
        for version in [3u16, 8] {
            let mut fx = Fixture::new("");
            fx.state = SessionState::Connected;

            let mut req = request(opcode::LOGIN);
            req.version = version;
            req.put_u8(0);
            req.put_string("old client");

            assert!(matches!(fx.call(&mut req), Outcome::Close));
            assert_eq!(fx.state, SessionState::Connected);
        }
    }

    #[test]
    fn unknown_opcode_is_ignored() {
        let mut fx = Fixture::new("");
        let mut req = request(9999);
        assert!(matches!(fx.call(&mut req), Outcome::None));
    }

    #[test]
    fn truncated_payload_closes_the_session() {
        let mut fx = Fixture::new("");
        // timer delete without its two u32 fields
        let mut req = request(opcode::TIMER_DELETE);
        assert!(matches!(fx.call(&mut req), Outcome::Close));
    }

    #[test]
    fn update_channels_validates_the_policy() {
        let mut fx = Fixture::new("");

        let mut req = request(opcode::UPDATE_CHANNELS);
        req.put_u8(5);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);

        let mut req = request(opcode::UPDATE_CHANNELS);
        req.put_u8(6);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::DataInvalid as u32);
    }

    #[test]
    fn channel_filter_updates_session_settings() {
        let mut fx = Fixture::new("");

        let mut req = request(opcode::CHANNEL_FILTER);
        req.put_u32(0);
        req.put_u32(1);
        req.put_u32(2);
        req.put_u32(0x1702);
        req.put_u32(0x0500);

        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);

        let settings = fx.shared.filter.lock().unwrap().clone();
        assert!(!settings.want_fta);
        assert!(settings.language_only);
        assert_eq!(settings.caids, vec![0x1702, 0x0500]);
    }

    #[test]
    fn channels_count_caches_the_filtered_total() {
        let mut fx = Fixture::new(CHANNELS);

        let mut resp = fx.reply(&mut request(opcode::CHANNELS_COUNT));
        // TV channel once, radio channel twice (full list + radio list)
        assert_eq!(resp.get_u32().unwrap(), 3);
        assert_eq!(fx.shared.channel_count(), 3);
    }

    #[test]
    fn channels_list_honors_kind_selection() {
        let mut fx = Fixture::new(CHANNELS);

        let mut req = request(opcode::CHANNELS_LIST);
        req.put_u32(1); // radio only
        let mut resp = fx.reply(&mut req);

        assert_eq!(resp.get_u32().unwrap(), 3); // channel number
        assert_eq!(resp.get_string().unwrap(), "Radio Eins");
        assert_eq!(resp.get_u32().unwrap(), 3); // uid
        resp.get_u32().unwrap();
        resp.get_string().unwrap();
        resp.get_string().unwrap(); // service ref, v7
        assert!(resp.eop());
    }

    #[test]
    fn group_flow_builds_lists_and_members() {
        let mut fx = Fixture::new(CHANNELS);

        let mut req = request(opcode::GROUPS_COUNT);
        req.put_u32(0); // separator groups
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_u32().unwrap(), 2); // Bouquet A in tv and radio

        let mut req = request(opcode::GROUPS_LIST);
        req.put_u8(0);
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_string().unwrap(), "Bouquet A");
        assert_eq!(resp.get_u8().unwrap(), 0);
        assert!(resp.eop());

        let mut req = request(opcode::GROUPS_MEMBERS);
        req.put_string("Bouquet A");
        req.put_u8(1); // radio members
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_u32().unwrap(), 3); // uid
        assert_eq!(resp.get_u32().unwrap(), 1); // 1-based sequence
        assert!(resp.eop());
    }

    #[test]
    fn unknown_group_yields_an_empty_member_list() {
        let mut fx = Fixture::new(CHANNELS);

        let mut req = request(opcode::GROUPS_MEMBERS);
        req.put_string("No Such Group");
        req.put_u8(0);
        let resp = fx.reply(&mut req);
        assert!(resp.eop());
    }

    #[test]
    fn stream_open_falls_back_to_channel_number() {
        let mut fx = Fixture::new(CHANNELS);

        // uid 2 resolves directly
        let mut req = request(opcode::STREAM_OPEN);
        req.put_u32(2);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert!(fx.shared.streamer.lock().unwrap().is_some());

        // unknown id closes the previous streamer and fails
        let mut req = request(opcode::STREAM_OPEN);
        req.put_u32(999);
        req.put_s32(80);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::DataInvalid as u32);
        assert!(fx.shared.streamer.lock().unwrap().is_none());
    }

    #[test]
    fn timer_add_maps_backend_errors() {
        let mut fx = Fixture::new(CHANNELS);

        fn add_request(start: u32, stop: u32) -> Packet {
            let mut req = request(opcode::TIMER_ADD);
            req.put_u32(0); // index, unused
            req.put_u32(1); // active
            req.put_u32(50);
            req.put_u32(99);
            req.put_u32(2); // channel uid
            req.put_u32(start);
            req.put_u32(stop);
            req.put_u32(0);
            req.put_u32(0);
            req.put_string("Tatort");
            req.put_string("");
            req
        }

        let mut resp = fx.reply(&mut add_request(5000, 6000));
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);

        // identical window on the same channel
        let mut resp = fx.reply(&mut add_request(5000, 6000));
        assert_eq!(status_of(&mut resp), StatusCode::DataLocked as u32);

        // stop before start
        let mut resp = fx.reply(&mut add_request(6000, 5000));
        assert_eq!(status_of(&mut resp), StatusCode::DataInvalid as u32);
    }

    #[test]
    fn timer_delete_force_semantics() {
        let mut fx = Fixture::new(
            r#"
            [[timers]]
            channel_uid = 2
            start = 1000
            stop = 2000
            flags = 1
            file = "Tatort"
            recording = true
            "#,
        );

        let uid = fx.backend.timers.list()[0].uid;

        let mut req = request(opcode::TIMER_DELETE);
        req.put_u32(uid);
        req.put_u32(0);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::RecordingRunning as u32);
        assert_eq!(fx.backend.timers.count(), 1);

        let mut req = request(opcode::TIMER_DELETE);
        req.put_u32(uid);
        req.put_u32(1);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert_eq!(fx.backend.timers.count(), 0);

        // already gone
        let mut req = request(opcode::TIMER_DELETE);
        req.put_u32(uid);
        req.put_u32(1);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::DataInvalid as u32);
    }

    #[test]
    fn timer_update_skips_a_recording_timer() {
        let mut fx = Fixture::new(
            r#"
            [[timers]]
            channel_uid = 2
            start = 1000
            stop = 2000
            file = "Tatort"
            recording = true
            "#,
        );

        let uid = fx.backend.timers.list()[0].uid;

        let mut req = request(opcode::TIMER_UPDATE);
        req.put_u32(uid);
        // remaining fields are not read for a recording timer
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert_eq!(fx.backend.timers.list()[0].file, "Tatort");
    }

    #[test]
    fn timer_list_is_locked_while_the_catalog_is_edited() {
        let (events, _) = broadcast::channel(16);
        let timers = Arc::new(MemoryTimers::new(Vec::new(), events.clone()));
        let backend = Backend::new(
            Arc::new(MemoryChannels::new(Vec::new())),
            timers.clone(),
            Arc::new(MemoryRecordings::new(
                Vec::new(),
                HashMap::new(),
                events.clone(),
            )),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryGuide::new(Vec::new())),
            Arc::new(MemoryLive),
            Arc::new(MemoryScanner::new(false)),
            Arc::new(MemoryArtwork::new()),
            events,
        );
        let mut fx = Fixture::with_backend(backend);

        timers.set_editing(true);
        let mut resp = fx.reply(&mut request(opcode::TIMER_LIST));
        assert_eq!(status_of(&mut resp), StatusCode::DataLocked as u32);

        timers.set_editing(false);
        let mut resp = fx.reply(&mut request(opcode::TIMER_LIST));
        assert_eq!(resp.get_u32().unwrap(), 0);
    }

    #[test]
    fn timer_get_uses_one_based_indices() {
        let mut fx = Fixture::new(
            r#"
            [[timers]]
            channel_uid = 2
            start = 1000
            stop = 2000
            file = "Tatort"
            "#,
        );

        let mut req = request(opcode::TIMER_GET);
        req.put_u32(1);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        resp.get_u32().unwrap(); // uid

        for number in [0u32, 2] {
            let mut req = request(opcode::TIMER_GET);
            req.put_u32(number);
            let mut resp = fx.reply(&mut req);
            assert_eq!(status_of(&mut resp), StatusCode::DataUnknown as u32);
        }
    }

    const RECORDINGS: &str = r#"
        [[recordings]]
        path = "movies/tatort/2026-01-01"
        title = "Tatort"
        directory = "My_Shows"
        channel_name = "Das Erste"
        duration = 90
        size_kb = 16
    "#;

    #[test]
    fn recordings_list_registers_ids_and_maps_directories() {
        let mut fx = Fixture::new(RECORDINGS);

        let mut resp = fx.reply(&mut request(opcode::RECORDINGS_LIST));
        resp.get_u32().unwrap(); // start
        assert_eq!(resp.get_u32().unwrap(), 90); // duration
        resp.get_u32().unwrap(); // priority
        resp.get_u32().unwrap(); // lifetime
        assert_eq!(resp.get_string().unwrap(), "Das Erste");
        assert_eq!(resp.get_string().unwrap(), "Tatort");
        resp.get_string().unwrap(); // subtitle
        resp.get_string().unwrap(); // description
        assert_eq!(resp.get_string().unwrap(), "My Shows");

        let recid = resp.get_string().unwrap();
        assert_eq!(recid.len(), 8);

        // the listed id resolves for follow-up requests
        let mut req = request(opcode::RECORDINGS_SET_POSITION);
        req.put_string(&recid);
        req.put_u64(4711);
        fx.reply(&mut req);

        let mut req = request(opcode::RECORDINGS_GET_POSITION);
        req.put_string(&recid);
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_u64().unwrap(), 4711);
    }

    #[test]
    fn playback_open_is_exclusive() {
        let mut fx = Fixture::new(RECORDINGS);
        let uid = fx.backend.rec_index.register("movies/tatort/2026-01-01");
        let recid = RecordingIndex::format(uid);

        let mut req = request(opcode::REC_OPEN);
        req.put_string("00000000");
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::DataUnknown as u32);

        let mut req = request(opcode::REC_OPEN);
        req.put_string(&recid);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert_eq!(resp.get_u32().unwrap(), 0);
        assert_eq!(resp.get_u64().unwrap(), 16 * 1024);
        assert_eq!(resp.get_u8().unwrap(), 1);
        assert_eq!(resp.get_u32().unwrap(), 90);

        // second open leaves the running playback untouched
        let mut req = request(opcode::REC_OPEN);
        req.put_string(&recid);
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::DataLocked as u32);
        assert!(fx.playback.is_some());

        let mut resp = fx.reply(&mut request(opcode::REC_CLOSE));
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert!(fx.playback.is_none());
    }

    #[test]
    fn playback_requests_without_a_recording_are_silent() {
        let mut fx = Fixture::new("");

        let mut req = request(opcode::REC_GET_BLOCK);
        req.put_u64(0);
        req.put_u32(1024);
        assert!(matches!(fx.call(&mut req), Outcome::None));

        assert!(matches!(fx.call(&mut request(opcode::REC_GET_PACKET)), Outcome::None));
        assert!(matches!(fx.call(&mut request(opcode::REC_UPDATE)), Outcome::None));
    }

    #[test]
    fn marks_report_not_supported_when_absent() {
        let mut fx = Fixture::new(RECORDINGS);
        let uid = fx.backend.rec_index.register("movies/tatort/2026-01-01");

        let mut req = request(opcode::RECORDINGS_GET_MARKS);
        req.put_string(&RecordingIndex::format(uid));
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::NotSupported as u32);

        let mut req = request(opcode::RECORDINGS_GET_MARKS);
        req.put_string("0000ffff");
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::DataUnknown as u32);
    }

    #[test]
    fn marks_reply_carries_scaled_fps_and_records() {
        let (events, _) = broadcast::channel(16);
        let recording = Recording {
            path: "movies/cut/demo".to_string(),
            start: 0,
            duration: 60,
            priority: 50,
            lifetime: 99,
            channel_name: "Das Erste".to_string(),
            title: "Demo".to_string(),
            subtitle: String::new(),
            description: String::new(),
            directory: String::new(),
            content: 0,
            in_progress: false,
        };
        let recordings = Arc::new(MemoryRecordings::new(
            vec![recording],
            HashMap::new(),
            events.clone(),
        ));
        recordings.set_marks(
            "movies/cut/demo",
            vec![RecordingMark {
                kind: "SCENE".to_string(),
                begin: 1500,
                end: 3000,
                text: "opening".to_string(),
            }],
        );
        let backend = Backend::new(
            Arc::new(MemoryChannels::new(Vec::new())),
            Arc::new(MemoryTimers::new(Vec::new(), events.clone())),
            recordings,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryGuide::new(Vec::new())),
            Arc::new(MemoryLive),
            Arc::new(MemoryScanner::new(false)),
            Arc::new(MemoryArtwork::new()),
            events,
        );
        let mut fx = Fixture::with_backend(backend);
        let uid = fx.backend.rec_index.register("movies/cut/demo");

        let mut req = request(opcode::RECORDINGS_GET_MARKS);
        req.put_string(&RecordingIndex::format(uid));
        let mut resp = fx.reply(&mut req);
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert_eq!(resp.get_u64().unwrap(), 250_000); // 25 fps, scaled by 10000
        assert_eq!(resp.get_string().unwrap(), "SCENE");
        assert_eq!(resp.get_u64().unwrap(), 1500);
        assert_eq!(resp.get_u64().unwrap(), 3000);
        assert_eq!(resp.get_string().unwrap(), "opening");
        assert!(resp.eop());
    }

    #[test]
    fn artwork_falls_back_to_placeholders() {
        let mut fx = Fixture::new("");

        let mut req = request(opcode::ARTWORK_SET);
        req.put_string("Tatort");
        req.put_u32(0x10);
        req.put_string("http://img/poster");
        req.put_string("http://img/backdrop");
        req.put_u32(42);
        fx.reply(&mut req);

        let mut req = request(opcode::ARTWORK_GET);
        req.put_string("Tatort");
        req.put_u32(0x10);
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_string().unwrap(), "http://img/poster");
        assert_eq!(resp.get_string().unwrap(), "http://img/backdrop");
        assert_eq!(resp.get_u32().unwrap(), 0);

        let mut req = request(opcode::ARTWORK_GET);
        req.put_string("Unknown");
        req.put_u32(0x10);
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_string().unwrap(), "x");
        assert_eq!(resp.get_string().unwrap(), "x");
    }

    const GUIDE: &str = r#"
        [[channels]]
        name = "Das Erste"
        uid = 2
        sid = 5
        vpid = 101

        [[guide]]
        channel_uid = 2
        id = 900
        start = 4100000000
        duration = 3600
        title = "Evening News"

        [[guide]]
        channel_uid = 2
        id = 901
        start = 1000
        duration = 60
        title = "Long Gone"
    "#;

    #[test]
    fn epg_skips_past_events_and_gates_artwork() {
        let mut fx = Fixture::new(GUIDE);
        fx.shared.set_version(5);

        let mut req = request(opcode::EPG_FOR_CHANNEL);
        req.put_u32(2);
        req.put_u32(0);
        req.put_u32(0);
        let mut resp = fx.reply(&mut req);

        assert_eq!(resp.get_u32().unwrap(), 900);
        assert_eq!(resp.get_u32().unwrap(), 4100000000);
        assert_eq!(resp.get_u32().unwrap(), 3600);
        resp.get_u32().unwrap(); // content
        resp.get_u32().unwrap(); // rating
        assert_eq!(resp.get_string().unwrap(), "Evening News");
        resp.get_string().unwrap();
        resp.get_string().unwrap();
        // no artwork pair below version 6
        assert!(resp.eop());

        fx.shared.set_version(6);
        let mut req = request(opcode::EPG_FOR_CHANNEL);
        req.put_u32(2);
        req.put_u32(0);
        req.put_u32(0);
        let mut resp = fx.reply(&mut req);
        for _ in 0..5 {
            resp.get_u32().unwrap();
        }
        for _ in 0..3 {
            resp.get_string().unwrap();
        }
        assert_eq!(resp.get_string().unwrap(), "x");
        assert_eq!(resp.get_string().unwrap(), "x");
    }

    #[test]
    fn epg_window_near_the_epoch_ceiling_matches() {
        let mut fx = Fixture::new(GUIDE);
        fx.shared.set_version(5);

        // start + duration would wrap in u32
        let mut req = request(opcode::EPG_FOR_CHANNEL);
        req.put_u32(2);
        req.put_u32(4_100_000_001);
        req.put_u32(300_000_000);
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_u32().unwrap(), 900);
    }

    #[test]
    fn epg_writes_a_single_zero_when_nothing_matches() {
        let mut fx = Fixture::new(GUIDE);

        // unknown channel
        let mut req = request(opcode::EPG_FOR_CHANNEL);
        req.put_u32(99);
        req.put_u32(0);
        req.put_u32(0);
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_u32().unwrap(), 0);
        assert!(resp.eop());

        // window past the only future event
        let mut req = request(opcode::EPG_FOR_CHANNEL);
        req.put_u32(2);
        req.put_u32(4150000000);
        req.put_u32(0);
        let mut resp = fx.reply(&mut req);
        assert_eq!(resp.get_u32().unwrap(), 0);
        assert!(resp.eop());
    }

    #[test]
    fn scanner_is_not_supported_without_hardware() {
        let mut fx = Fixture::new("");

        let mut resp = fx.reply(&mut request(opcode::SCAN_SUPPORTED));
        assert_eq!(status_of(&mut resp), StatusCode::NotSupported as u32);

        let mut resp = fx.reply(&mut request(opcode::SCAN_GET_SETUP));
        assert_eq!(status_of(&mut resp), StatusCode::NotSupported as u32);
    }

    #[test]
    fn scanner_setup_lists_satellites_and_countries() {
        let mut fx = Fixture::with_scanner("", true);

        let mut resp = fx.reply(&mut request(opcode::SCAN_SUPPORTED));
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);

        let mut resp = fx.reply(&mut request(opcode::SCAN_GET_SETUP));
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);

        for _ in 0..9 {
            resp.get_u16().unwrap();
        }
        resp.get_u32().unwrap(); // flags
        resp.get_u16().unwrap(); // atsc type

        let satellites = resp.get_u16().unwrap();
        assert!(satellites > 0);
        for _ in 0..satellites {
            resp.get_s32().unwrap();
            resp.get_string().unwrap();
            resp.get_string().unwrap();
        }
        let countries = resp.get_u16().unwrap();
        assert!(countries > 0);
    }

    #[test]
    fn scan_start_reports_status_while_running() {
        let mut fx = Fixture::with_scanner("", true);

        let mut resp = fx.reply(&mut request(opcode::SCAN_START));
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert!(fx.backend.scanner.is_scanning());

        let mut resp = fx.reply(&mut request(opcode::SCAN_GET_STATUS));
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        resp.get_u8().unwrap(); // state
        resp.get_u16().unwrap(); // progress

        let mut resp = fx.reply(&mut request(opcode::SCAN_STOP));
        assert_eq!(status_of(&mut resp), StatusCode::Ok as u32);
        assert!(!fx.backend.scanner.is_scanning());
    }
}
