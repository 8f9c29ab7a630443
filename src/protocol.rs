//! Event-bus protocol shared by all runtime components.
//!
//! This module defines all message payloads exchanged between the playback
//! session, the player adapter, the playlist manager, the media controls
//! bridge and the host console.

use std::path::PathBuf;

use serde::Serialize;

use crate::playlist::{NewTrack, PlaylistSnapshot, PlaylistSummary, PlaylistUpdate, Track};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Session(SessionCommand),
    Player(PlayerMessage),
    Playlist(PlaylistMessage),
    Notify(SessionNotification),
}

/// Lifecycle state of the playback session. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
    Ended,
    Error,
}

impl PlaybackState {
    /// States in which a track is attached to the engine.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Loading | Self::Playing | Self::Paused)
    }
}

/// Commands accepted by the playback session, from the UI, the OS media
/// surface or internal timers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Replace the queue with a freshly read playlist and start at `start_index`.
    PlayQueue {
        snapshot: PlaylistSnapshot,
        start_index: usize,
    },
    PlayIndex(usize),
    /// Resume when paused, restart the current track when idle or ended.
    Play,
    Pause,
    Resume,
    TogglePlayPause,
    Next,
    Previous,
    SeekTo(f64),
    /// Seek to a fraction (0.0..=1.0) of the current track duration.
    SeekToFraction(f64),
    SetVolume(u8),
    Stop,
    /// Stop and forget playlist context (logout).
    Reset,
    Retry,
    SetVisibility(bool),
    /// Ask the session to publish a [`SessionSnapshot`].
    PublishSnapshot,
    /// Fired by the load watchdog; ignored unless `generation` is current.
    LoadDeadline { generation: u64 },
}

/// Raw engine callbacks and adapter timers, tagged with the generation that
/// was current when they were produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerMessage {
    /// The embedded engine finished initializing and accepts commands.
    EngineReady,
    Engine {
        generation: u64,
        signal: EngineSignal,
    },
    /// Periodic progress tick from the adapter's time-update task.
    Tick { generation: u64, epoch: u64 },
    /// Delayed "treat as ended" after an unplayable-source error.
    UnplayableElapsed { generation: u64 },
}

/// Engine callback payloads before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSignal {
    StateChange(i32),
    Error(i32),
}

/// Playlist-domain commands (towards the store) and reload notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistMessage {
    ListPlaylists,
    SearchPlaylists(String),
    OpenPlaylist {
        id: String,
    },
    PlayPlaylist {
        id: String,
        start_index: usize,
    },
    CreatePlaylist {
        name: String,
        description: String,
    },
    UpdatePlaylist {
        id: String,
        update: PlaylistUpdate,
    },
    DeletePlaylist {
        id: String,
    },
    AddTrack {
        playlist_id: String,
        track: NewTrack,
    },
    AddLocalFile {
        playlist_id: String,
        path: PathBuf,
    },
    RemoveTrack {
        playlist_id: String,
        track_id: String,
    },
    ReorderTracks {
        playlist_id: String,
        order: Vec<String>,
    },
    PlaylistsListed(Vec<PlaylistSummary>),
    PlaylistOpened(PlaylistSnapshot),
    /// Post-mutation reload of a playlist.
    PlaylistRefreshed(PlaylistSnapshot),
    PlaylistCreated(PlaylistSummary),
    PlaylistDeleted {
        id: String,
    },
    TrackAdded {
        playlist_id: String,
        track: Track,
    },
    TrackRemoved {
        playlist_id: String,
        track_id: String,
    },
    /// A store call failed; never affects playback state.
    SyncFailed {
        operation: String,
        message: String,
    },
}

/// Session output consumed by UI indicators.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    StateChanged {
        state: PlaybackState,
        generation: u64,
    },
    TrackChanged {
        index: usize,
        track: Track,
        playlist_name: Option<String>,
    },
    Progress {
        current_time: f64,
        duration: Option<f64>,
    },
    VolumeChanged(u8),
    QueueChanged {
        length: usize,
        current_index: Option<usize>,
    },
    /// A track failed to load and was skipped (or ended the skip chain).
    TrackFailed {
        index: usize,
        track_id: String,
        error: String,
    },
    /// An explicit command failed without changing the queue position.
    CommandFailed { command: String, error: String },
    /// The session entered the terminal `Error` state.
    Halted { error: String },
    Snapshot(SessionSnapshot),
}

/// Read-only view of the session for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: PlaybackState,
    pub generation: u64,
    pub queue_length: usize,
    pub current_index: Option<usize>,
    pub current_track: Option<Track>,
    pub playlist_id: Option<String>,
    pub playlist_name: Option<String>,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub volume: u8,
    pub consecutive_failures: usize,
    pub last_error: Option<String>,
    pub wake_lock_held: bool,
    pub visible: bool,
}
