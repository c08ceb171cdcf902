//! Backend collaborator interfaces.
//!
//! The session engine never owns catalog data. Channels, timers,
//! recordings, EPG, the live-capture pipeline and the channel scanner
//! are injected services with their own internal locking; a session
//! borrows a consistent snapshot for the duration of one operation.
//! Catalog changes are fanned out to sessions over a broadcast channel
//! and only ever result in packets appended to a session's outbound
//! queue.

pub mod memory;
pub mod recordings;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub use recordings::RecordingIndex;

/// Errors surfaced by backend collaborators. Handlers translate these
/// into wire status codes; none of them tears down a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("entity not found")]
    NotFound,
    #[error("catalog is under concurrent edit")]
    Locked,
    #[error("entity already exists")]
    Duplicate,
    #[error("definition failed validation")]
    Invalid,
    #[error("entity is in use")]
    InUse,
    #[error("operation not supported by this backend")]
    Unsupported,
    #[error("backend i/o error: {0}")]
    Io(String),
}

/// Transmission source a channel is received from; feeds the
/// service-reference derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSource {
    /// Satellite with its orbital position in tenths of a degree
    /// (negative = west).
    Satellite(i32),
    Cable,
    Terrestrial,
    Atsc,
}

/// One channel as the catalog hands it out.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Position in the channel list, 1-based.
    pub number: u32,
    pub name: String,
    /// Opaque stable identity, independent of the list position.
    pub uid: u32,
    pub provider: String,
    /// Group separator entry rather than a tunable service.
    pub group_sep: bool,
    /// Service id; zero marks an untunable placeholder.
    pub sid: u32,
    /// Video pid; 0 = none, 1 = encrypted-radio placeholder.
    pub vpid: u32,
    /// Video format id; 27 (H.264) and 36 (HEVC) classify as (U)HD.
    pub vtype: u32,
    /// Language tags of the MPEG audio tracks.
    pub audio_langs: Vec<String>,
    /// Language tags of the digital (AC-3 etc.) audio tracks.
    pub digital_langs: Vec<String>,
    /// Conditional-access system ids; empty = free to air.
    pub caids: Vec<u32>,
    pub source: ChannelSource,
    pub tid: u32,
    pub nid: u32,
}

impl Channel {
    /// Channels without a video pid are radio; vpid 1 is the encrypted
    /// radio placeholder. A channel with neither video nor audio pids
    /// is assumed to be a video channel.
    pub fn is_radio(&self) -> bool {
        if self.vpid == 0 && self.audio_langs.is_empty() && self.digital_langs.is_empty() {
            return false;
        }
        self.vpid == 0 || self.vpid == 1
    }

    /// First conditional-access id, zero for free-to-air.
    pub fn ca(&self) -> u32 {
        self.caids.first().copied().unwrap_or(0)
    }
}

/// Timer flag bit: the timer is armed.
pub const TIMER_ACTIVE: u32 = 1;

#[derive(Debug, Clone)]
pub struct Timer {
    pub uid: u32,
    pub flags: u32,
    pub priority: u32,
    pub lifetime: u32,
    pub channel_uid: u32,
    pub start: u32,
    pub stop: u32,
    pub day: u32,
    pub weekdays: u32,
    pub file: String,
    pub aux: String,
    /// The timer is recording right now.
    pub recording: bool,
}

/// Fields a client supplies when creating or replacing a timer.
#[derive(Debug, Clone)]
pub struct TimerDefinition {
    pub flags: u32,
    pub priority: u32,
    pub lifetime: u32,
    pub channel_uid: u32,
    pub start: u32,
    pub stop: u32,
    pub day: u32,
    pub weekdays: u32,
    pub file: String,
    pub aux: String,
}

#[derive(Debug, Clone)]
pub struct Recording {
    /// Backend-side identity; stable for the life of the recording.
    pub path: String,
    pub start: u32,
    pub duration: u32,
    pub priority: u32,
    pub lifetime: u32,
    pub channel_name: String,
    pub title: String,
    pub subtitle: String,
    pub description: String,
    /// Folder hierarchy with '/' separators, empty for top-level.
    pub directory: String,
    /// EPG content descriptor of the recorded event.
    pub content: u32,
    /// Still being written by an active timer.
    pub in_progress: bool,
}

/// An editing mark inside a recording.
#[derive(Debug, Clone)]
pub struct RecordingMark {
    pub kind: String,
    pub begin: u64,
    pub end: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSpace {
    pub total_mb: u32,
    pub free_mb: u32,
    pub used_percent: u32,
}

#[derive(Debug, Clone)]
pub struct EpgEvent {
    pub id: u32,
    pub start: u32,
    pub duration: u32,
    pub content: u32,
    pub rating: u32,
    pub title: String,
    pub subtitle: String,
    pub description: String,
}

/// One demultiplexed media unit from the live pipeline or a recording.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub pid: u16,
    pub pts: i64,
    pub dts: i64,
    pub duration: u32,
    /// 1 if this chunk starts a key frame.
    pub key_frame: u8,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct SignalInfo {
    pub device: String,
    pub status: String,
    pub snr: u16,
    pub strength: u16,
    pub ber: u32,
    pub unc: u32,
}

/// Parameters a client negotiates when opening a live stream.
#[derive(Debug, Clone, Copy)]
pub struct LiveStreamParams {
    pub priority: i32,
    pub timeout_secs: u32,
    pub wait_for_key_frame: bool,
    pub raw_pts: bool,
    pub language_index: Option<usize>,
    pub language_stream_type: u8,
}

#[derive(Debug, Clone, Default)]
pub struct ScanSetup {
    pub verbosity: u16,
    pub log_file: u16,
    pub dvb_type: u16,
    pub dvbt_inversion: u16,
    pub dvbc_inversion: u16,
    pub dvbc_symbolrate: u16,
    pub dvbc_qam: u16,
    pub country_id: u16,
    pub sat_id: u16,
    pub flags: u32,
    pub atsc_type: u16,
}

#[derive(Debug, Clone)]
pub struct ScanListEntry {
    pub id: i32,
    pub short_name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScanStatus {
    pub state: u8,
    pub progress: u16,
    pub strength: u16,
    pub num_channels: u16,
    pub new_channels: u16,
    pub device: String,
    pub transponder: String,
}

/// Backend activity fanned out to sessions. Every variant only ever
/// appends to a session's outbound queue; dispatch logic never runs on
/// the notifying task.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A single channel was retuned or renamed.
    ChannelChanged(Channel),
    /// Channel list membership changed.
    ChannelListChanged,
    TimerListChanged,
    RecordingListChanged,
    /// A recording started (`on`) or stopped on a capture device.
    RecordingActivity {
        device: u32,
        on: bool,
        name: String,
        filename: String,
    },
    /// Free-text message from the backend UI layer.
    StatusMessage(String),
}

pub trait ChannelCatalog: Send + Sync {
    /// Consistent view of the full channel list.
    fn snapshot(&self) -> Vec<Channel>;
    fn by_uid(&self, uid: u32) -> Option<Channel>;
    fn by_number(&self, number: u32) -> Option<Channel>;
    /// Forward the client-selected channel update policy (0-5).
    fn set_update_policy(&self, policy: u8);
}

pub trait TimerCatalog: Send + Sync {
    fn count(&self) -> u32;
    /// Timer by 0-based list index.
    fn get(&self, index: usize) -> Option<Timer>;
    fn list(&self) -> Vec<Timer>;
    fn by_uid(&self, uid: u32) -> Option<Timer>;
    /// True while the catalog is under concurrent edit; all mutation
    /// is rejected with DataLocked in that window.
    fn being_edited(&self) -> bool;
    fn add(&self, def: TimerDefinition) -> Result<(), BackendError>;
    /// Remove a timer; the backend stops an active recording first.
    fn delete(&self, uid: u32) -> Result<(), BackendError>;
    fn update(&self, uid: u32, def: TimerDefinition) -> Result<(), BackendError>;
    /// Live conflict-check bits OR'd into the timer flags on the wire.
    fn conflict_flags(&self, timer: &Timer) -> u32;
}

pub trait RecordingCatalog: Send + Sync {
    fn count(&self) -> u32;
    fn list(&self) -> Vec<Recording>;
    fn by_path(&self, path: &str) -> Option<Recording>;
    fn delete(&self, path: &str) -> Result<(), BackendError>;
    fn rename(&self, path: &str, new_title: &str) -> Result<(), BackendError>;
    fn disk_space(&self) -> DiskSpace;
    fn play_count(&self, path: &str) -> u32;
    fn set_play_count(&self, path: &str, count: u32);
    fn position(&self, path: &str) -> u64;
    fn set_position(&self, path: &str, position: u64);
    /// (poster, background) artwork for a recording; empty when unset.
    fn urls(&self, path: &str) -> (String, String);
    fn set_urls(&self, path: &str, poster: &str, background: &str, movie_id: u32);
    /// Editing marks and the frame rate they are scaled by; `None`
    /// when the recording carries no marks.
    fn marks(&self, path: &str) -> Option<(f64, Vec<RecordingMark>)>;
}

/// Turns a recording into a readable byte/packet source.
pub trait RecordingStore: Send + Sync {
    fn open(&self, recording: &Recording) -> Result<Box<dyn RecordingReader>, BackendError>;
}

pub trait RecordingReader: Send {
    fn length_bytes(&self) -> u64;
    /// Refresh the length of a recording still being written.
    fn update_length(&mut self) -> u64;
    fn is_raw_ts(&self) -> bool;
    fn duration_secs(&self) -> u32;
    /// Up to `amount` bytes at `offset`; fewer at end-of-file, never an
    /// error for short reads.
    fn read_block(&mut self, offset: u64, amount: u32) -> Result<Vec<u8>, BackendError>;
    /// One demuxed packet, or `None` when none is ready.
    fn next_packet(&mut self) -> Option<StreamChunk>;
    /// Reposition the packet cursor; returns the PTS at that offset.
    fn seek(&mut self, offset: u64) -> i64;
}

pub trait LiveSource: Send + Sync {
    fn open(
        &self,
        channel: &Channel,
        params: LiveStreamParams,
    ) -> Result<Box<dyn LiveFeed>, BackendError>;
}

pub trait LiveFeed: Send {
    /// One media chunk, or `None` when the pipeline has nothing yet.
    fn poll_chunk(&mut self) -> Option<StreamChunk>;
    fn signal_info(&self) -> SignalInfo;
    fn pause(&mut self, on: bool);
    /// Follow a backend-side channel definition change without client
    /// involvement.
    fn retune(&mut self, channel: &Channel);
}

pub trait Scanner: Send + Sync {
    /// False when no scan-capable hardware is present.
    fn available(&self) -> bool;
    fn setup(&self) -> Option<ScanSetup>;
    fn satellites(&self) -> Option<Vec<ScanListEntry>>;
    fn countries(&self) -> Option<Vec<ScanListEntry>>;
    /// Apply and persist a new setup.
    fn set_setup(&self, setup: ScanSetup) -> bool;
    fn start(&self) -> bool;
    fn stop(&self) -> bool;
    fn status(&self) -> Option<ScanStatus>;
    fn is_scanning(&self) -> bool;
}

pub trait Artwork: Send + Sync {
    fn get(&self, content: u32, title: &str) -> Option<(String, String)>;
    fn set(&self, content: u32, title: &str, poster: &str, background: &str, external_id: u32);
}

/// Bundle of collaborator handles injected into every session.
#[derive(Clone)]
pub struct Backend {
    pub channels: Arc<dyn ChannelCatalog>,
    pub timers: Arc<dyn TimerCatalog>,
    pub recordings: Arc<dyn RecordingCatalog>,
    pub store: Arc<dyn RecordingStore>,
    pub epg: Arc<dyn EpgCatalog>,
    pub live: Arc<dyn LiveSource>,
    pub scanner: Arc<dyn Scanner>,
    pub artwork: Arc<dyn Artwork>,
    pub rec_index: Arc<RecordingIndex>,
    events: broadcast::Sender<BackendEvent>,
}

pub trait EpgCatalog: Send + Sync {
    /// All events scheduled on a channel, or `None` when the channel
    /// has no schedule at all.
    fn schedule(&self, channel_uid: u32) -> Option<Vec<EpgEvent>>;
}

impl Backend {
    pub fn new(
        channels: Arc<dyn ChannelCatalog>,
        timers: Arc<dyn TimerCatalog>,
        recordings: Arc<dyn RecordingCatalog>,
        store: Arc<dyn RecordingStore>,
        epg: Arc<dyn EpgCatalog>,
        live: Arc<dyn LiveSource>,
        scanner: Arc<dyn Scanner>,
        artwork: Arc<dyn Artwork>,
        events: broadcast::Sender<BackendEvent>,
    ) -> Self {
        Self {
            channels,
            timers,
            recordings,
            store,
            epg,
            live,
            scanner,
            artwork,
            rec_index: Arc::new(RecordingIndex::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}
