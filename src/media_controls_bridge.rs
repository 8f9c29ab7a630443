//! OS media controls bridge (MPRIS/SMTC/Now Playing) and wake-lock owner.
//!
//! The bridge mirrors session state onto the platform "now playing" surface
//! via `souvlaki` and forwards transport events back to the session as bus
//! commands. It never mutates session state itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, PlatformConfig, SeekDirection,
};
use tokio::sync::broadcast::Sender;

use crate::config::{Config, MediaControlsConfig};
use crate::playlist::Track;
use crate::protocol::{Message, PlaybackState, SessionCommand};
use crate::wake_lock::{KeepAwakeLock, ScreenWakeLock};

const SEEK_STEP_MS: u64 = 10_000;
const ARTWORK_SIZES: [u32; 6] = [96, 128, 192, 256, 384, 512];

/// Snapshot read by the platform event handler to resolve relative events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlState {
    pub is_playing: bool,
    pub elapsed_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPublishState {
    Stopped,
    Paused,
    Playing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artwork {
    pub src: String,
    pub sizes: String,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingMetadata {
    pub title: String,
    pub artist: String,
    /// Name of the playlist the track was queued from.
    pub album: Option<String>,
    pub artwork: Vec<Artwork>,
    pub duration: Option<Duration>,
}

/// Platform "now playing" surface.
pub trait NowPlayingSurface {
    fn publish_playback(&mut self, state: PlaybackPublishState) -> Result<(), String>;
    /// `None` clears the surface.
    fn publish_metadata(&mut self, metadata: Option<&NowPlayingMetadata>) -> Result<(), String>;
}

pub struct SouvlakiSurface {
    controls: MediaControls,
}

impl SouvlakiSurface {
    #[cfg(not(target_os = "windows"))]
    pub fn create(
        config: &MediaControlsConfig,
        bus_producer: Sender<Message>,
        control_state: Arc<Mutex<ControlState>>,
    ) -> Option<Self> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: &config.display_name,
            dbus_name: &config.dbus_name,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!(
                    "MediaControlsBridge: failed to create media controls backend: {:?}",
                    err
                );
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            let snapshot = match control_state.lock() {
                Ok(state) => *state,
                Err(poisoned) => *poisoned.into_inner(),
            };

            if let Some(command) = map_control_event(event, snapshot) {
                let _ = bus_producer.send(Message::Session(command));
            }
        }) {
            warn!(
                "MediaControlsBridge: failed to attach media controls handler: {:?}",
                err
            );
            return None;
        }

        Some(Self { controls })
    }

    #[cfg(target_os = "windows")]
    pub fn create(
        _config: &MediaControlsConfig,
        _bus_producer: Sender<Message>,
        _control_state: Arc<Mutex<ControlState>>,
    ) -> Option<Self> {
        // Souvlaki requires an HWND on Windows and this host has no window.
        warn!("MediaControlsBridge: Windows media controls are disabled (no HWND)");
        None
    }
}

impl NowPlayingSurface for SouvlakiSurface {
    fn publish_playback(&mut self, state: PlaybackPublishState) -> Result<(), String> {
        let playback = match state {
            PlaybackPublishState::Stopped => MediaPlayback::Stopped,
            PlaybackPublishState::Paused => MediaPlayback::Paused { progress: None },
            PlaybackPublishState::Playing => MediaPlayback::Playing { progress: None },
        };
        self.controls
            .set_playback(playback)
            .map_err(|err| format!("{:?}", err))
    }

    fn publish_metadata(&mut self, metadata: Option<&NowPlayingMetadata>) -> Result<(), String> {
        let result = match metadata {
            Some(metadata) => {
                let cover_url = metadata.artwork.last().map(|artwork| {
                    if artwork.src.contains("://") {
                        artwork.src.clone()
                    } else {
                        format!("file://{}", artwork.src)
                    }
                });
                self.controls.set_metadata(MediaMetadata {
                    title: Some(metadata.title.as_str()),
                    artist: Some(metadata.artist.as_str()),
                    album: metadata.album.as_deref(),
                    cover_url: cover_url.as_deref(),
                    duration: metadata.duration,
                })
            }
            None => self.controls.set_metadata(MediaMetadata::default()),
        };
        result.map_err(|err| format!("{:?}", err))
    }
}

pub(crate) fn map_control_event(
    event: MediaControlEvent,
    state: ControlState,
) -> Option<SessionCommand> {
    match event {
        MediaControlEvent::Play => Some(SessionCommand::Play),
        MediaControlEvent::Pause => Some(SessionCommand::Pause),
        MediaControlEvent::Toggle => {
            if state.is_playing {
                Some(SessionCommand::Pause)
            } else {
                Some(SessionCommand::Play)
            }
        }
        MediaControlEvent::Next => Some(SessionCommand::Next),
        MediaControlEvent::Previous => Some(SessionCommand::Previous),
        MediaControlEvent::Stop => Some(SessionCommand::Stop),
        MediaControlEvent::SetPosition(position) => {
            seek_command_from_target_ms(state, position.0.as_millis() as u64)
        }
        MediaControlEvent::SeekBy(direction, delta) => {
            let delta_ms = delta.as_millis() as u64;
            let target_ms = match direction {
                SeekDirection::Forward => state.elapsed_ms.saturating_add(delta_ms),
                SeekDirection::Backward => state.elapsed_ms.saturating_sub(delta_ms),
            };
            seek_command_from_target_ms(state, target_ms)
        }
        MediaControlEvent::Seek(direction) => {
            let target_ms = match direction {
                SeekDirection::Forward => state.elapsed_ms.saturating_add(SEEK_STEP_MS),
                SeekDirection::Backward => state.elapsed_ms.saturating_sub(SEEK_STEP_MS),
            };
            seek_command_from_target_ms(state, target_ms)
        }
        MediaControlEvent::SetVolume(_)
        | MediaControlEvent::OpenUri(_)
        | MediaControlEvent::Raise
        | MediaControlEvent::Quit => None,
    }
}

/// Unknown durations (`total_ms == 0`) are left for the session to clamp.
fn seek_command_from_target_ms(state: ControlState, target_ms: u64) -> Option<SessionCommand> {
    let target_ms = if state.total_ms == 0 {
        target_ms
    } else {
        target_ms.min(state.total_ms)
    };
    Some(SessionCommand::SeekTo(target_ms as f64 / 1000.0))
}

fn artwork_mime(src: &str) -> &'static str {
    let lower = src.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Artwork entries for every size the OS surface may ask for.
pub fn artwork_for(thumbnail: Option<&str>) -> Vec<Artwork> {
    let Some(src) = thumbnail.map(str::trim).filter(|src| !src.is_empty()) else {
        return Vec::new();
    };
    ARTWORK_SIZES
        .iter()
        .map(|size| Artwork {
            src: src.to_string(),
            sizes: format!("{size}x{size}"),
            mime: artwork_mime(src).to_string(),
        })
        .collect()
}

pub struct MediaControlsBridge {
    surface: Option<Box<dyn NowPlayingSurface>>,
    wake_lock: Option<Box<dyn ScreenWakeLock>>,
    wake_lock_held: bool,
    visible: bool,
    control_state: Arc<Mutex<ControlState>>,
    current_metadata: Option<NowPlayingMetadata>,
    last_published_playback: Option<PlaybackPublishState>,
}

impl MediaControlsBridge {
    pub fn new(
        surface: Option<Box<dyn NowPlayingSurface>>,
        wake_lock: Option<Box<dyn ScreenWakeLock>>,
        control_state: Arc<Mutex<ControlState>>,
    ) -> Self {
        Self {
            surface,
            wake_lock,
            wake_lock_held: false,
            visible: true,
            control_state,
            current_metadata: None,
            last_published_playback: None,
        }
    }

    /// Builds the bridge with the platform surface and keep-awake lock the
    /// config enables.
    pub fn from_config(config: &Config, bus_producer: Sender<Message>) -> Self {
        let control_state = Arc::new(Mutex::new(ControlState::default()));
        let surface = if config.media_controls.enabled {
            SouvlakiSurface::create(
                &config.media_controls,
                bus_producer,
                Arc::clone(&control_state),
            )
            .map(|surface| Box::new(surface) as Box<dyn NowPlayingSurface>)
        } else {
            None
        };
        let wake_lock = config.wake_lock.enabled.then(|| {
            Box::new(KeepAwakeLock::new(&config.media_controls.display_name))
                as Box<dyn ScreenWakeLock>
        });
        Self::new(surface, wake_lock, control_state)
    }

    pub fn wake_lock_held(&self) -> bool {
        self.wake_lock_held
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn on_state_changed(&mut self, state: PlaybackState) {
        let is_playing = state == PlaybackState::Playing;
        self.update_control_state(|control| {
            control.is_playing = is_playing;
            if state == PlaybackState::Idle {
                control.elapsed_ms = 0;
                control.total_ms = 0;
            }
        });

        let desired = match state {
            PlaybackState::Idle => PlaybackPublishState::Stopped,
            PlaybackState::Playing => PlaybackPublishState::Playing,
            _ => PlaybackPublishState::Paused,
        };
        self.publish_playback_if_needed(desired);

        if is_playing {
            if self.visible {
                self.acquire_wake_lock();
            }
        } else {
            self.release_wake_lock();
        }
    }

    /// Hiding drops the wake lock; showing again while playing re-acquires it.
    pub fn set_visibility(&mut self, visible: bool, state: PlaybackState) {
        self.visible = visible;
        if visible && state == PlaybackState::Playing {
            self.acquire_wake_lock();
        } else if !visible {
            self.release_wake_lock();
        }
    }

    pub fn publish_track(&mut self, track: &Track, album: Option<&str>) {
        let metadata = NowPlayingMetadata {
            title: track.title.clone(),
            artist: track.artist.clone(),
            album: album.map(ToString::to_string),
            artwork: artwork_for(track.thumbnail.as_deref()),
            duration: track
                .duration_secs
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(Duration::from_secs_f64),
        };
        self.update_control_state(|control| {
            control.elapsed_ms = 0;
            control.total_ms = metadata.duration.map_or(0, |d| d.as_millis() as u64);
        });
        self.current_metadata = Some(metadata);
        self.publish_metadata();
    }

    pub fn clear_track(&mut self) {
        self.update_control_state(|control| {
            control.elapsed_ms = 0;
            control.total_ms = 0;
        });
        if self.current_metadata.take().is_some() {
            self.publish_metadata();
        }
    }

    /// Keeps seek resolution current and republishes metadata once the
    /// duration becomes known or changes.
    pub fn publish_progress(&mut self, current_time: f64, duration: Option<f64>) {
        let duration = duration
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);
        self.update_control_state(|control| {
            control.elapsed_ms = (current_time.max(0.0) * 1000.0) as u64;
            if let Some(duration) = duration {
                control.total_ms = duration.as_millis() as u64;
            }
        });

        let changed = match self.current_metadata.as_mut() {
            Some(metadata) if duration.is_some() && metadata.duration != duration => {
                metadata.duration = duration;
                true
            }
            _ => false,
        };
        if changed {
            self.publish_metadata();
        }
    }

    fn update_control_state<F>(&self, update: F)
    where
        F: FnOnce(&mut ControlState),
    {
        match self.control_state.lock() {
            Ok(mut state) => update(&mut state),
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                update(&mut state);
            }
        }
    }

    fn publish_playback_if_needed(&mut self, desired: PlaybackPublishState) {
        if self.last_published_playback == Some(desired) {
            return;
        }
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        if let Err(err) = surface.publish_playback(desired) {
            warn!(
                "MediaControlsBridge: failed to publish playback state {:?}: {}",
                desired, err
            );
            return;
        }
        self.last_published_playback = Some(desired);
    }

    fn publish_metadata(&mut self) {
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        if let Err(err) = surface.publish_metadata(self.current_metadata.as_ref()) {
            warn!("MediaControlsBridge: failed to publish metadata: {}", err);
        }
    }

    fn acquire_wake_lock(&mut self) {
        if self.wake_lock_held {
            return;
        }
        let Some(wake_lock) = self.wake_lock.as_mut() else {
            return;
        };
        match wake_lock.acquire() {
            Ok(()) => {
                debug!("MediaControlsBridge: wake lock acquired");
                self.wake_lock_held = true;
            }
            Err(err) => warn!("MediaControlsBridge: failed to acquire wake lock: {}", err),
        }
    }

    fn release_wake_lock(&mut self) {
        if !self.wake_lock_held {
            return;
        }
        if let Some(wake_lock) = self.wake_lock.as_mut() {
            wake_lock.release();
        }
        debug!("MediaControlsBridge: wake lock released");
        self.wake_lock_held = false;
    }
}

impl Drop for MediaControlsBridge {
    fn drop(&mut self) {
        self.release_wake_lock();
    }
}
