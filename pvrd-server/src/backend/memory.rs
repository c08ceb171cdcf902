//! In-memory backend.
//!
//! Serves a catalog loaded from a TOML file (or nothing at all) and
//! synthesizes live and playback media. Every catalog is individually
//! locked; mutations emit [`BackendEvent`]s on the shared broadcast
//! channel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use log::info;
use serde::Deserialize;
use tokio::sync::broadcast;

use super::{
    Artwork, Backend, BackendError, BackendEvent, Channel, ChannelCatalog, ChannelSource,
    DiskSpace, EpgCatalog, EpgEvent, LiveFeed, LiveSource, LiveStreamParams, Recording,
    RecordingCatalog, RecordingMark, RecordingReader, RecordingStore, ScanListEntry, ScanSetup,
    ScanStatus, Scanner, SignalInfo, StreamChunk, Timer, TimerCatalog, TimerDefinition,
};

/// Synthetic media cadence: one chunk per 40 ms in 90 kHz units.
const CHUNK_PTS_STEP: i64 = 3600;
/// Payload bytes per synthetic chunk, seven TS cells.
const CHUNK_SIZE: usize = 188 * 7;

// ---------------------------------------------------------------------
// catalog file

fn default_frame_rate() -> f64 {
    25.0
}

#[derive(Debug, Deserialize, Default)]
pub struct CatalogFile {
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    #[serde(default)]
    pub timers: Vec<TimerSpec>,
    #[serde(default)]
    pub recordings: Vec<RecordingSpec>,
    #[serde(default)]
    pub guide: Vec<GuideSpec>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    pub uid: u32,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub separator: bool,
    #[serde(default)]
    pub sid: u32,
    #[serde(default)]
    pub vpid: u32,
    #[serde(default)]
    pub vtype: u32,
    #[serde(default)]
    pub audio: Vec<String>,
    #[serde(default)]
    pub digital: Vec<String>,
    #[serde(default)]
    pub caids: Vec<u32>,
    /// "C", "T", "A" or an orbital position like "S19.2E".
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tid: u32,
    #[serde(default)]
    pub nid: u32,
}

#[derive(Debug, Deserialize)]
pub struct TimerSpec {
    pub channel_uid: u32,
    pub start: u32,
    pub stop: u32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_lifetime")]
    pub lifetime: u32,
    #[serde(default)]
    pub day: u32,
    #[serde(default)]
    pub weekdays: u32,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub recording: bool,
}

fn default_priority() -> u32 {
    50
}

fn default_lifetime() -> u32 {
    99
}

#[derive(Debug, Deserialize)]
pub struct RecordingSpec {
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub start: u32,
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub content: u32,
    #[serde(default)]
    pub in_progress: bool,
    /// Size of the synthesized media blob in kilobytes.
    #[serde(default = "default_size_kb")]
    pub size_kb: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
}

fn default_size_kb() -> u32 {
    512
}

#[derive(Debug, Deserialize)]
pub struct GuideSpec {
    pub channel_uid: u32,
    pub id: u32,
    pub start: u32,
    pub duration: u32,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: u32,
    #[serde(default)]
    pub rating: u32,
}

impl CatalogFile {
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        let text = std::fs::read_to_string(path).map_err(|e| BackendError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| BackendError::Io(e.to_string()))
    }
}

/// Parse a catalog source tag. Unknown tags fall back to cable.
fn parse_source(tag: &str) -> ChannelSource {
    let mut chars = tag.chars();
    match chars.next() {
        Some('S') | Some('s') => {
            let rest = chars.as_str();
            let west = rest.ends_with('W') || rest.ends_with('w');
            let digits = rest.trim_end_matches(['E', 'W', 'e', 'w']);
            let degrees: f64 = digits.parse().unwrap_or(0.0);
            let mut tenths = (degrees * 10.0).round() as i32;
            if west {
                tenths = -tenths;
            }
            ChannelSource::Satellite(tenths)
        }
        Some('T') | Some('t') => ChannelSource::Terrestrial,
        Some('A') | Some('a') => ChannelSource::Atsc,
        _ => ChannelSource::Cable,
    }
}

impl ChannelSpec {
    fn into_channel(self, number: u32) -> Channel {
        Channel {
            number,
            name: self.name,
            uid: self.uid,
            provider: self.provider,
            group_sep: self.separator,
            sid: self.sid,
            vpid: self.vpid,
            vtype: self.vtype,
            audio_langs: self.audio,
            digital_langs: self.digital,
            caids: self.caids,
            source: parse_source(&self.source),
            tid: self.tid,
            nid: self.nid,
        }
    }
}

// ---------------------------------------------------------------------
// channels

pub struct MemoryChannels {
    inner: RwLock<Vec<Channel>>,
}

impl MemoryChannels {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            inner: RwLock::new(channels),
        }
    }
}

impl ChannelCatalog for MemoryChannels {
    fn snapshot(&self) -> Vec<Channel> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn by_uid(&self, uid: u32) -> Option<Channel> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.uid == uid)
            .cloned()
    }

    fn by_number(&self, number: u32) -> Option<Channel> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.number == number)
            .cloned()
    }

    fn set_update_policy(&self, policy: u8) {
        info!("channel update policy set to {}", policy);
    }
}

// ---------------------------------------------------------------------
// timers

struct TimerState {
    next_uid: u32,
    timers: Vec<Timer>,
}

pub struct MemoryTimers {
    state: Mutex<TimerState>,
    editing: AtomicBool,
    events: broadcast::Sender<BackendEvent>,
}

impl MemoryTimers {
    pub fn new(specs: Vec<TimerSpec>, events: broadcast::Sender<BackendEvent>) -> Self {
        let mut next_uid = 1;
        let timers = specs
            .into_iter()
            .map(|s| {
                let uid = next_uid;
                next_uid += 1;
                Timer {
                    uid,
                    flags: s.flags,
                    priority: s.priority,
                    lifetime: s.lifetime,
                    channel_uid: s.channel_uid,
                    start: s.start,
                    stop: s.stop,
                    day: s.day,
                    weekdays: s.weekdays,
                    file: s.file,
                    aux: String::new(),
                    recording: s.recording,
                }
            })
            .collect();
        Self {
            state: Mutex::new(TimerState { next_uid, timers }),
            editing: AtomicBool::new(false),
            events,
        }
    }

    /// Test hook simulating a concurrent editor holding the catalog.
    pub fn set_editing(&self, on: bool) {
        self.editing.store(on, Ordering::SeqCst);
    }

    fn notify(&self) {
        let _ = self.events.send(BackendEvent::TimerListChanged);
    }
}

impl TimerCatalog for MemoryTimers {
    fn count(&self) -> u32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).timers.len() as u32
    }

    fn get(&self, index: usize) -> Option<Timer> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timers
            .get(index)
            .cloned()
    }

    fn list(&self) -> Vec<Timer> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timers
            .clone()
    }

    fn by_uid(&self, uid: u32) -> Option<Timer> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .timers
            .iter()
            .find(|t| t.uid == uid)
            .cloned()
    }

    fn being_edited(&self) -> bool {
        self.editing.load(Ordering::SeqCst)
    }

    fn add(&self, def: TimerDefinition) -> Result<(), BackendError> {
        if def.stop <= def.start {
            return Err(BackendError::Invalid);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let clash = state.timers.iter().any(|t| {
            t.channel_uid == def.channel_uid && t.start == def.start && t.stop == def.stop
        });
        if clash {
            return Err(BackendError::Duplicate);
        }
        let uid = state.next_uid;
        state.next_uid += 1;
        state.timers.push(Timer {
            uid,
            flags: def.flags,
            priority: def.priority,
            lifetime: def.lifetime,
            channel_uid: def.channel_uid,
            start: def.start,
            stop: def.stop,
            day: def.day,
            weekdays: def.weekdays,
            file: def.file,
            aux: def.aux,
            recording: false,
        });
        drop(state);
        self.notify();
        Ok(())
    }

    fn delete(&self, uid: u32) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.timers.len();
        state.timers.retain(|t| t.uid != uid);
        if state.timers.len() == before {
            return Err(BackendError::NotFound);
        }
        drop(state);
        self.notify();
        Ok(())
    }

    fn update(&self, uid: u32, def: TimerDefinition) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let timer = state
            .timers
            .iter_mut()
            .find(|t| t.uid == uid)
            .ok_or(BackendError::NotFound)?;
        timer.flags = def.flags;
        timer.priority = def.priority;
        timer.lifetime = def.lifetime;
        timer.channel_uid = def.channel_uid;
        timer.start = def.start;
        timer.stop = def.stop;
        timer.day = def.day;
        timer.weekdays = def.weekdays;
        timer.file = def.file;
        timer.aux = def.aux;
        drop(state);
        self.notify();
        Ok(())
    }

    fn conflict_flags(&self, timer: &Timer) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let overlap = state.timers.iter().any(|t| {
            t.uid != timer.uid
                && t.flags & super::TIMER_ACTIVE != 0
                && t.channel_uid != timer.channel_uid
                && t.start < timer.stop
                && timer.start < t.stop
        });
        if overlap {
            // soft conflict: another device is busy in that window
            0x0800
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------
// recordings

#[derive(Default, Clone)]
struct RecordingMeta {
    play_count: u32,
    position: u64,
    poster: String,
    background: String,
    marks: Vec<RecordingMark>,
    frame_rate: f64,
}

pub struct MemoryRecordings {
    inner: RwLock<Vec<Recording>>,
    meta: Mutex<HashMap<String, RecordingMeta>>,
    disk: DiskSpace,
    events: broadcast::Sender<BackendEvent>,
}

impl MemoryRecordings {
    pub fn new(
        recordings: Vec<Recording>,
        frame_rates: HashMap<String, f64>,
        events: broadcast::Sender<BackendEvent>,
    ) -> Self {
        let meta = recordings
            .iter()
            .map(|r| {
                (
                    r.path.clone(),
                    RecordingMeta {
                        frame_rate: frame_rates.get(&r.path).copied().unwrap_or(25.0),
                        ..RecordingMeta::default()
                    },
                )
            })
            .collect();
        Self {
            inner: RwLock::new(recordings),
            meta: Mutex::new(meta),
            disk: DiskSpace {
                total_mb: 512_000,
                free_mb: 384_000,
                used_percent: 25,
            },
            events,
        }
    }

    /// Test hook for seeding editing marks.
    pub fn set_marks(&self, path: &str, marks: Vec<RecordingMark>) {
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.entry(path.to_string()).or_default().marks = marks;
    }

    fn notify(&self) {
        let _ = self.events.send(BackendEvent::RecordingListChanged);
    }
}

impl RecordingCatalog for MemoryRecordings {
    fn count(&self) -> u32 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len() as u32
    }

    fn list(&self) -> Vec<Recording> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn by_path(&self, path: &str) -> Option<Recording> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.path == path)
            .cloned()
    }

    fn delete(&self, path: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = inner
            .iter()
            .find(|r| r.path == path)
            .ok_or(BackendError::NotFound)?;
        if record.in_progress {
            return Err(BackendError::InUse);
        }
        inner.retain(|r| r.path != path);
        drop(inner);
        self.meta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        self.notify();
        Ok(())
    }

    fn rename(&self, path: &str, new_title: &str) -> Result<(), BackendError> {
        if new_title.is_empty() {
            return Err(BackendError::Invalid);
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = inner
            .iter_mut()
            .find(|r| r.path == path)
            .ok_or(BackendError::NotFound)?;
        record.title = new_title.to_string();
        drop(inner);
        self.notify();
        Ok(())
    }

    fn disk_space(&self) -> DiskSpace {
        self.disk
    }

    fn play_count(&self, path: &str) -> u32 {
        self.meta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|m| m.play_count)
            .unwrap_or(0)
    }

    fn set_play_count(&self, path: &str, count: u32) {
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.entry(path.to_string()).or_default().play_count = count;
    }

    fn position(&self, path: &str) -> u64 {
        self.meta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|m| m.position)
            .unwrap_or(0)
    }

    fn set_position(&self, path: &str, position: u64) {
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.entry(path.to_string()).or_default().position = position;
    }

    fn urls(&self, path: &str) -> (String, String) {
        self.meta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .map(|m| (m.poster.clone(), m.background.clone()))
            .unwrap_or_default()
    }

    fn set_urls(&self, path: &str, poster: &str, background: &str, _movie_id: u32) {
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        let entry = meta.entry(path.to_string()).or_default();
        entry.poster = poster.to_string();
        entry.background = background.to_string();
    }

    fn marks(&self, path: &str) -> Option<(f64, Vec<RecordingMark>)> {
        let meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        let entry = meta.get(path)?;
        if entry.marks.is_empty() {
            return None;
        }
        Some((entry.frame_rate, entry.marks.clone()))
    }
}

// ---------------------------------------------------------------------
// recording store

struct StoredBlob {
    data: Bytes,
    duration: u32,
    raw_ts: bool,
}

pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Arc<StoredBlob>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, path: &str, size: usize, duration: u32) {
        // deterministic pattern so block reads are checkable
        let data: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
        let blob = Arc::new(StoredBlob {
            data,
            duration,
            raw_ts: true,
        });
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), blob);
    }
}

impl RecordingStore for MemoryStore {
    fn open(&self, recording: &Recording) -> Result<Box<dyn RecordingReader>, BackendError> {
        let blob = self
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&recording.path)
            .cloned()
            .ok_or(BackendError::NotFound)?;
        Ok(Box::new(MemoryReader { blob, cursor: 0 }))
    }
}

struct MemoryReader {
    blob: Arc<StoredBlob>,
    cursor: u64,
}

impl MemoryReader {
    fn pts_at(&self, offset: u64) -> i64 {
        let len = self.blob.data.len() as u64;
        if len == 0 {
            return 0;
        }
        (offset.min(len) as i64) * (self.blob.duration as i64) * 90_000 / len as i64
    }
}

impl RecordingReader for MemoryReader {
    fn length_bytes(&self) -> u64 {
        self.blob.data.len() as u64
    }

    fn update_length(&mut self) -> u64 {
        self.blob.data.len() as u64
    }

    fn is_raw_ts(&self) -> bool {
        self.blob.raw_ts
    }

    fn duration_secs(&self) -> u32 {
        self.blob.duration
    }

    fn read_block(&mut self, offset: u64, amount: u32) -> Result<Vec<u8>, BackendError> {
        let len = self.blob.data.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = (offset + amount as u64).min(len);
        Ok(self.blob.data[offset as usize..end as usize].to_vec())
    }

    fn next_packet(&mut self) -> Option<StreamChunk> {
        let len = self.blob.data.len() as u64;
        if self.cursor >= len {
            return None;
        }
        let end = (self.cursor + CHUNK_SIZE as u64).min(len);
        let pts = self.pts_at(self.cursor);
        let chunk = StreamChunk {
            pid: 0x100,
            pts,
            dts: pts,
            duration: 40,
            key_frame: 1,
            data: self.blob.data.slice(self.cursor as usize..end as usize),
        };
        self.cursor = end;
        Some(chunk)
    }

    fn seek(&mut self, offset: u64) -> i64 {
        self.cursor = offset.min(self.blob.data.len() as u64);
        self.pts_at(self.cursor)
    }
}

// ---------------------------------------------------------------------
// live capture

pub struct MemoryLive;

/// Chunks per group of pictures; the first chunk of each group is a
/// key frame.
const KEY_FRAME_INTERVAL: u64 = 25;

/// Stream clock origin for feeds keeping source timestamps.
const RAW_PTS_BASE: i64 = 8 * 90_000;

impl LiveSource for MemoryLive {
    fn open(
        &self,
        channel: &Channel,
        params: LiveStreamParams,
    ) -> Result<Box<dyn LiveFeed>, BackendError> {
        if channel.sid == 0 {
            return Err(BackendError::NotFound);
        }
        if params.priority > 99 || params.timeout_secs == 0 {
            return Err(BackendError::Invalid);
        }
        let audio_base: u16 = if params.language_stream_type != 0 {
            0x120
        } else {
            0x110
        };
        Ok(Box::new(MemoryFeed {
            channel_name: channel.name.clone(),
            audio_pid: audio_base + params.language_index.unwrap_or(0) as u16,
            base_pts: if params.raw_pts { RAW_PTS_BASE } else { 0 },
            wait_for_key_frame: params.wait_for_key_frame,
            started: false,
            counter: 0,
            paused: false,
        }))
    }
}

struct MemoryFeed {
    channel_name: String,
    /// Audio track selected from the session's language preference.
    audio_pid: u16,
    base_pts: i64,
    wait_for_key_frame: bool,
    /// Set once the first key frame has been delivered.
    started: bool,
    counter: u64,
    paused: bool,
}

impl LiveFeed for MemoryFeed {
    fn poll_chunk(&mut self) -> Option<StreamChunk> {
        if self.paused {
            return None;
        }
        loop {
            let index = self.counter;
            self.counter += 1;

            // every fourth chunk carries the selected audio track
            let audio = index % 4 == 3;
            let key = !audio && index % KEY_FRAME_INTERVAL == 0;
            if self.wait_for_key_frame && !self.started && !key {
                continue;
            }
            if key {
                self.started = true;
            }

            let pts = self.base_pts + index as i64 * CHUNK_PTS_STEP;
            return Some(StreamChunk {
                pid: if audio { self.audio_pid } else { 0x100 },
                pts,
                dts: pts,
                duration: 40,
                key_frame: u8::from(key),
                data: Bytes::from(vec![0x47; CHUNK_SIZE]),
            });
        }
    }

    fn signal_info(&self) -> SignalInfo {
        SignalInfo {
            device: format!("memory capture ({})", self.channel_name),
            status: "LOCKED".to_string(),
            snr: 28_000,
            strength: 52_000,
            ber: 0,
            unc: 0,
        }
    }

    fn pause(&mut self, on: bool) {
        self.paused = on;
    }

    fn retune(&mut self, channel: &Channel) {
        self.channel_name = channel.name.clone();
        self.counter = 0;
        self.started = false;
    }
}

// ---------------------------------------------------------------------
// scanner

struct ScanState {
    setup: ScanSetup,
    status: ScanStatus,
    scanning: bool,
}

pub struct MemoryScanner {
    available: bool,
    state: Mutex<ScanState>,
}

impl MemoryScanner {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            state: Mutex::new(ScanState {
                setup: ScanSetup::default(),
                status: ScanStatus::default(),
                scanning: false,
            }),
        }
    }
}

impl Scanner for MemoryScanner {
    fn available(&self) -> bool {
        self.available
    }

    fn setup(&self) -> Option<ScanSetup> {
        if !self.available {
            return None;
        }
        Some(
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .setup
                .clone(),
        )
    }

    fn satellites(&self) -> Option<Vec<ScanListEntry>> {
        if !self.available {
            return None;
        }
        Some(vec![
            ScanListEntry {
                id: 0,
                short_name: "S19E2".to_string(),
                full_name: "Astra 19.2E".to_string(),
            },
            ScanListEntry {
                id: 1,
                short_name: "S13E0".to_string(),
                full_name: "Hotbird 13.0E".to_string(),
            },
        ])
    }

    fn countries(&self) -> Option<Vec<ScanListEntry>> {
        if !self.available {
            return None;
        }
        Some(vec![
            ScanListEntry {
                id: 0,
                short_name: "DE".to_string(),
                full_name: "Germany".to_string(),
            },
            ScanListEntry {
                id: 1,
                short_name: "FR".to_string(),
                full_name: "France".to_string(),
            },
        ])
    }

    fn set_setup(&self, setup: ScanSetup) -> bool {
        if !self.available {
            return false;
        }
        self.state.lock().unwrap_or_else(|e| e.into_inner()).setup = setup;
        true
    }

    fn start(&self) -> bool {
        if !self.available {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.scanning {
            return false;
        }
        state.scanning = true;
        state.status = ScanStatus {
            state: 1,
            progress: 0,
            strength: 0,
            num_channels: 0,
            new_channels: 0,
            device: "memory tuner".to_string(),
            transponder: String::new(),
        };
        true
    }

    fn stop(&self) -> bool {
        if !self.available {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.scanning = false;
        state.status.state = 0;
        true
    }

    fn status(&self) -> Option<ScanStatus> {
        if !self.available {
            return None;
        }
        Some(
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .status
                .clone(),
        )
    }

    fn is_scanning(&self) -> bool {
        self.available
            && self
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .scanning
    }
}

// ---------------------------------------------------------------------
// artwork and guide

pub struct MemoryArtwork {
    inner: Mutex<HashMap<(u32, String), (String, String)>>,
}

impl MemoryArtwork {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Artwork for MemoryArtwork {
    fn get(&self, content: u32, title: &str) -> Option<(String, String)> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(content, title.to_string()))
            .cloned()
    }

    fn set(&self, content: u32, title: &str, poster: &str, background: &str, _external_id: u32) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (content, title.to_string()),
                (poster.to_string(), background.to_string()),
            );
    }
}

pub struct MemoryGuide {
    schedules: RwLock<HashMap<u32, Vec<EpgEvent>>>,
}

impl MemoryGuide {
    pub fn new(specs: Vec<GuideSpec>) -> Self {
        let mut schedules: HashMap<u32, Vec<EpgEvent>> = HashMap::new();
        for spec in specs {
            schedules.entry(spec.channel_uid).or_default().push(EpgEvent {
                id: spec.id,
                start: spec.start,
                duration: spec.duration,
                content: spec.content,
                rating: spec.rating,
                title: spec.title,
                subtitle: spec.subtitle,
                description: spec.description,
            });
        }
        for events in schedules.values_mut() {
            events.sort_by_key(|e| e.start);
        }
        Self {
            schedules: RwLock::new(schedules),
        }
    }
}

impl EpgCatalog for MemoryGuide {
    fn schedule(&self, channel_uid: u32) -> Option<Vec<EpgEvent>> {
        self.schedules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel_uid)
            .cloned()
    }
}

// ---------------------------------------------------------------------
// assembly

/// Build a complete backend from an optional catalog file.
pub fn build(catalog: Option<CatalogFile>, scanner_available: bool) -> Backend {
    let catalog = catalog.unwrap_or_default();
    let (events, _) = broadcast::channel(64);

    let channels: Vec<Channel> = catalog
        .channels
        .into_iter()
        .enumerate()
        .map(|(i, spec)| spec.into_channel(i as u32 + 1))
        .collect();
    info!("catalog loaded: {} channels", channels.len());

    let store = Arc::new(MemoryStore::new());
    let mut frame_rates = HashMap::new();
    let recordings: Vec<Recording> = catalog
        .recordings
        .into_iter()
        .map(|spec| {
            store.insert(&spec.path, spec.size_kb as usize * 1024, spec.duration);
            frame_rates.insert(spec.path.clone(), spec.frame_rate);
            Recording {
                path: spec.path,
                start: spec.start,
                duration: spec.duration,
                priority: 50,
                lifetime: 99,
                channel_name: spec.channel_name,
                title: spec.title,
                subtitle: spec.subtitle,
                description: spec.description,
                directory: spec.directory,
                content: spec.content,
                in_progress: spec.in_progress,
            }
        })
        .collect();

    Backend::new(
        Arc::new(MemoryChannels::new(channels)),
        Arc::new(MemoryTimers::new(catalog.timers, events.clone())),
        Arc::new(MemoryRecordings::new(recordings, frame_rates, events.clone())),
        store,
        Arc::new(MemoryGuide::new(catalog.guide)),
        Arc::new(MemoryLive),
        Arc::new(MemoryScanner::new(scanner_available)),
        Arc::new(MemoryArtwork::new()),
        events,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_tags_parse() {
        assert_eq!(parse_source("S19.2E"), ChannelSource::Satellite(192));
        assert_eq!(parse_source("S0.8W"), ChannelSource::Satellite(-8));
        assert_eq!(parse_source("T"), ChannelSource::Terrestrial);
        assert_eq!(parse_source("A"), ChannelSource::Atsc);
        assert_eq!(parse_source(""), ChannelSource::Cable);
        assert_eq!(parse_source("C"), ChannelSource::Cable);
    }

    #[test]
    fn catalog_toml_parses() {
        let file: CatalogFile = toml::from_str(
            r#"
            [[channels]]
            name = "Das Erste"
            uid = 1001
            provider = "ARD"
            sid = 28106
            vpid = 101
            vtype = 2
            audio = ["deu"]
            source = "S19.2E"

            [[timers]]
            channel_uid = 1001
            start = 1000
            stop = 2000

            [[recordings]]
            path = "movies/blade~runner"
            title = "Blade Runner"
            duration = 7020

            [[guide]]
            channel_uid = 1001
            id = 9
            start = 1000
            duration = 3600
            title = "News"
            "#,
        )
        .unwrap();
        assert_eq!(file.channels.len(), 1);
        assert_eq!(file.timers[0].priority, 50);
        assert_eq!(file.recordings[0].size_kb, 512);
        assert_eq!(file.guide[0].channel_uid, 1001);
    }

    #[test]
    fn timer_mutations_emit_events() {
        let (tx, mut rx) = broadcast::channel(8);
        let timers = MemoryTimers::new(Vec::new(), tx);
        timers
            .add(TimerDefinition {
                flags: 1,
                priority: 50,
                lifetime: 99,
                channel_uid: 7,
                start: 100,
                stop: 200,
                day: 0,
                weekdays: 0,
                file: "News".to_string(),
                aux: String::new(),
            })
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            BackendEvent::TimerListChanged
        ));

        let uid = timers.list()[0].uid;
        timers.delete(uid).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            BackendEvent::TimerListChanged
        ));
        assert_eq!(timers.count(), 0);
    }

    #[test]
    fn duplicate_timer_is_rejected() {
        let (tx, _rx) = broadcast::channel(8);
        let timers = MemoryTimers::new(Vec::new(), tx);
        let def = TimerDefinition {
            flags: 1,
            priority: 50,
            lifetime: 99,
            channel_uid: 7,
            start: 100,
            stop: 200,
            day: 0,
            weekdays: 0,
            file: "News".to_string(),
            aux: String::new(),
        };
        timers.add(def.clone()).unwrap();
        assert_eq!(timers.add(def), Err(BackendError::Duplicate));
    }

    #[test]
    fn reader_short_reads_at_end_of_file() {
        let store = MemoryStore::new();
        store.insert("demo", 1000, 60);
        let recording = Recording {
            path: "demo".to_string(),
            start: 0,
            duration: 60,
            priority: 50,
            lifetime: 99,
            channel_name: String::new(),
            title: "Demo".to_string(),
            subtitle: String::new(),
            description: String::new(),
            directory: String::new(),
            content: 0,
            in_progress: false,
        };
        let mut reader = store.open(&recording).unwrap();
        assert_eq!(reader.length_bytes(), 1000);
        assert_eq!(reader.read_block(0, 100).unwrap().len(), 100);
        assert_eq!(reader.read_block(995, 100).unwrap().len(), 5);
        assert!(reader.read_block(2000, 100).unwrap().is_empty());
    }

    #[test]
    fn reader_seek_scales_pts_by_offset() {
        let store = MemoryStore::new();
        store.insert("demo", 9000, 10);
        let recording = Recording {
            path: "demo".to_string(),
            start: 0,
            duration: 10,
            priority: 50,
            lifetime: 99,
            channel_name: String::new(),
            title: "Demo".to_string(),
            subtitle: String::new(),
            description: String::new(),
            directory: String::new(),
            content: 0,
            in_progress: false,
        };
        let mut reader = store.open(&recording).unwrap();
        assert_eq!(reader.seek(0), 0);
        // halfway through a 10 s blob is 5 s in 90 kHz units
        assert_eq!(reader.seek(4500), 5 * 90_000);
    }

    #[test]
    fn paused_feed_yields_nothing() {
        let channel = Channel {
            number: 1,
            name: "Demo".to_string(),
            uid: 1,
            provider: String::new(),
            group_sep: false,
            sid: 5,
            vpid: 101,
            vtype: 2,
            audio_langs: Vec::new(),
            digital_langs: Vec::new(),
            caids: Vec::new(),
            source: ChannelSource::Cable,
            tid: 0,
            nid: 0,
        };
        let params = LiveStreamParams {
            priority: 50,
            timeout_secs: 10,
            wait_for_key_frame: false,
            raw_pts: false,
            language_index: None,
            language_stream_type: 0,
        };
        let mut feed = MemoryLive.open(&channel, params).unwrap();
        assert!(feed.poll_chunk().is_some());
        feed.pause(true);
        assert!(feed.poll_chunk().is_none());
        feed.pause(false);
        assert!(feed.poll_chunk().is_some());
    }

    #[test]
    fn unavailable_scanner_reports_nothing() {
        let scanner = MemoryScanner::new(false);
        assert!(!scanner.available());
        assert!(scanner.setup().is_none());
        assert!(!scanner.start());
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn scan_start_is_exclusive() {
        let scanner = MemoryScanner::new(true);
        assert!(scanner.start());
        assert!(!scanner.start());
        assert!(scanner.is_scanning());
        assert!(scanner.stop());
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn live_feed_honors_stream_params() {
        let channel = Channel {
            number: 1,
            name: "Demo".to_string(),
            uid: 7,
            provider: String::new(),
            group_sep: false,
            sid: 5,
            vpid: 101,
            vtype: 2,
            audio_langs: vec!["deu".to_string()],
            digital_langs: vec!["deu".to_string()],
            caids: Vec::new(),
            source: ChannelSource::Cable,
            tid: 0,
            nid: 0,
        };
        let live = MemoryLive;

        let params = LiveStreamParams {
            priority: 50,
            timeout_secs: 10,
            wait_for_key_frame: true,
            raw_pts: true,
            language_index: Some(2),
            language_stream_type: 1,
        };
        let mut feed = live.open(&channel, params).unwrap();

        // delivery starts on a key frame with the source clock kept
        let first = feed.poll_chunk().unwrap();
        assert_eq!(first.key_frame, 1);
        assert_eq!(first.pts, RAW_PTS_BASE);

        // the preferred language selects the digital audio track
        let audio = (0..8)
            .filter_map(|_| feed.poll_chunk())
            .find(|c| c.pid != 0x100)
            .unwrap();
        assert_eq!(audio.pid, 0x122);

        let bad = LiveStreamParams {
            priority: 50,
            timeout_secs: 0,
            wait_for_key_frame: false,
            raw_pts: false,
            language_index: None,
            language_stream_type: 0,
        };
        assert_eq!(live.open(&channel, bad).err(), Some(BackendError::Invalid));
    }
}
