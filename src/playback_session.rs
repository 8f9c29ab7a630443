//! Playback session state machine.
//!
//! The session owns the queue, the player adapter and the media controls
//! bridge. It consumes one bus message at a time and runs each transition
//! to completion before reading the next, which is what keeps rapid user
//! commands and late engine callbacks from interleaving. Engine replies are
//! tagged with the generation of the load that produced them; anything not
//! matching the current generation is dropped before it can touch state.

use std::{thread, time::Duration};

use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::config::PlaybackConfig;
use crate::media_controls_bridge::MediaControlsBridge;
use crate::player::engine::{EngineError, MediaEngine, PlayerErrorKind};
use crate::player::player_adapter::{AdapterSettings, PlayerAdapter, PlayerEvent, PlayerState};
use crate::playlist::{PlaylistSnapshot, Track};
use crate::protocol::{
    Message, PlaybackState, PlayerMessage, PlaylistMessage, SessionCommand, SessionNotification,
    SessionSnapshot,
};
use crate::queue::{QueueController, QueueError, RemoveOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("track did not become ready in time")]
    LoadTimeout,
    #[error("source unavailable")]
    SourceUnavailable,
    #[error("source does not allow embedded playback")]
    EmbeddingDisallowed,
    #[error("engine fault")]
    EngineFault,
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("queue is empty")]
    QueueEmpty,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("gave up after {attempts} consecutive tracks failed to load")]
    AutoSkipExhausted { attempts: usize },
}

impl From<PlayerErrorKind> for SessionError {
    fn from(kind: PlayerErrorKind) -> Self {
        match kind {
            PlayerErrorKind::InvalidParameters => Self::InvalidParameters,
            PlayerErrorKind::EngineFault => Self::EngineFault,
            PlayerErrorKind::SourceUnavailable => Self::SourceUnavailable,
            PlayerErrorKind::EmbeddingDisallowed => Self::EmbeddingDisallowed,
        }
    }
}

fn engine_fault(command: &str, err: EngineError) -> SessionError {
    warn!("PlaybackSession: engine rejected {}: {}", command, err);
    SessionError::EngineFault
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub load_timeout: Duration,
    /// `None` bounds auto-skip by the queue length.
    pub max_consecutive_failures: Option<usize>,
}

impl SessionSettings {
    pub fn from_config(playback: &PlaybackConfig) -> Self {
        Self {
            load_timeout: Duration::from_millis(playback.load_timeout_ms),
            max_consecutive_failures: playback.max_consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Progress {
    current_time: f64,
    duration: Option<f64>,
}

#[derive(Debug, Clone)]
struct QueueOrigin {
    playlist_id: String,
    playlist_name: String,
}

pub struct PlaybackSession<E: MediaEngine> {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    settings: SessionSettings,
    queue: QueueController,
    origin: Option<QueueOrigin>,
    state: PlaybackState,
    progress: Progress,
    generation: u64,
    adapter: PlayerAdapter<E>,
    bridge: MediaControlsBridge,
    consecutive_failures: usize,
    /// Unrecoverable error waiting for the adapter's synthetic end.
    pending_failure: Option<SessionError>,
    last_error: Option<SessionError>,
}

impl<E: MediaEngine> PlaybackSession<E> {
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        engine: E,
        bridge: MediaControlsBridge,
        playback: &PlaybackConfig,
    ) -> Self {
        let adapter = PlayerAdapter::new(
            engine,
            bus_producer.clone(),
            AdapterSettings::from_config(playback),
        );
        Self {
            bus_consumer,
            bus_producer,
            settings: SessionSettings::from_config(playback),
            queue: QueueController::new(),
            origin: None,
            state: PlaybackState::Idle,
            progress: Progress::default(),
            generation: 0,
            adapter,
            bridge,
            consecutive_failures: 0,
            pending_failure: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn queue(&self) -> &QueueController {
        &self.queue
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Replaces the queue with `snapshot` and starts at `start_index`.
    pub fn play_queue(
        &mut self,
        snapshot: PlaylistSnapshot,
        start_index: usize,
    ) -> Result<(), SessionError> {
        if snapshot.tracks.is_empty() {
            return Err(SessionError::QueueEmpty);
        }
        if start_index >= snapshot.tracks.len() {
            return Err(QueueError::IndexOutOfRange {
                index: start_index,
                len: snapshot.tracks.len(),
            }
            .into());
        }

        info!(
            "PlaybackSession: queueing playlist '{}' ({} tracks) from index {}",
            snapshot.name,
            snapshot.tracks.len(),
            start_index
        );
        self.origin = Some(QueueOrigin {
            playlist_id: snapshot.id,
            playlist_name: snapshot.name,
        });
        self.queue.load(snapshot.tracks);
        self.queue.set_current(start_index)?;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.begin_load()
    }

    pub fn play_index(&mut self, index: usize) -> Result<(), SessionError> {
        self.queue.set_current(index)?;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.begin_load()
    }

    /// Resumes from `Paused`, restarts the current track from `Idle` or
    /// `Ended`, retries from `Error`.
    pub fn play(&mut self) -> Result<(), SessionError> {
        match self.state {
            PlaybackState::Paused => self.resume(),
            PlaybackState::Idle | PlaybackState::Ended => {
                if self.queue.is_empty() {
                    return Err(SessionError::QueueEmpty);
                }
                self.consecutive_failures = 0;
                self.begin_load()
            }
            PlaybackState::Error => self.retry(),
            PlaybackState::Loading | PlaybackState::Playing => Ok(()),
        }
    }

    pub fn pause(&mut self) -> Result<(), SessionError> {
        if self.state != PlaybackState::Playing {
            debug!("PlaybackSession: pause ignored in {:?}", self.state);
            return Ok(());
        }
        self.adapter
            .pause()
            .map_err(|err| engine_fault("pause", err))?;
        self.transition(PlaybackState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.state != PlaybackState::Paused {
            debug!("PlaybackSession: resume ignored in {:?}", self.state);
            return Ok(());
        }
        self.adapter.play().map_err(|err| engine_fault("play", err))?;
        self.transition(PlaybackState::Playing);
        Ok(())
    }

    pub fn toggle_play_pause(&mut self) -> Result<(), SessionError> {
        if self.state == PlaybackState::Playing {
            self.pause()
        } else {
            self.play()
        }
    }

    pub fn skip_next(&mut self) -> Result<(), SessionError> {
        if self.state == PlaybackState::Error {
            debug!("PlaybackSession: skip ignored while halted");
            return Ok(());
        }
        if self.queue.is_empty() {
            return Err(SessionError::QueueEmpty);
        }
        if self.queue.next().is_none() {
            debug!("PlaybackSession: already at the last track");
            return Ok(());
        }
        self.consecutive_failures = 0;
        self.begin_load()
    }

    pub fn skip_previous(&mut self) -> Result<(), SessionError> {
        if self.state == PlaybackState::Error {
            debug!("PlaybackSession: skip ignored while halted");
            return Ok(());
        }
        if self.queue.is_empty() {
            return Err(SessionError::QueueEmpty);
        }
        if self.queue.previous().is_none() {
            debug!("PlaybackSession: already at the first track");
            return Ok(());
        }
        self.consecutive_failures = 0;
        self.begin_load()
    }

    pub fn seek_to(&mut self, seconds: f64) -> Result<(), SessionError> {
        if !seconds.is_finite() {
            return Err(SessionError::InvalidParameters);
        }
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            debug!("PlaybackSession: seek ignored in {:?}", self.state);
            return Ok(());
        }
        let target = match self.known_duration() {
            Some(duration) => seconds.clamp(0.0, duration),
            None => seconds.max(0.0),
        };
        self.adapter
            .seek_to(target)
            .map_err(|err| engine_fault("seek", err))?;
        self.progress.current_time = target;
        self.bridge.publish_progress(target, self.progress.duration);
        self.notify(SessionNotification::Progress {
            current_time: target,
            duration: self.progress.duration,
        });
        Ok(())
    }

    pub fn seek_to_fraction(&mut self, fraction: f64) -> Result<(), SessionError> {
        if !fraction.is_finite() {
            return Err(SessionError::InvalidParameters);
        }
        match self.known_duration() {
            Some(duration) => self.seek_to(fraction.clamp(0.0, 1.0) * duration),
            None => {
                debug!("PlaybackSession: seek by fraction ignored, duration unknown");
                Ok(())
            }
        }
    }

    pub fn set_volume(&mut self, volume: u8) -> Result<(), SessionError> {
        let volume = volume.min(100);
        self.adapter
            .set_volume(volume)
            .map_err(|err| engine_fault("set_volume", err))?;
        self.notify(SessionNotification::VolumeChanged(volume));
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.queue.clear();
        self.origin = None;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.clear_playback();
        Ok(())
    }

    /// Logout: stop and forget the playlist context.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        info!("PlaybackSession: reset");
        self.stop()
    }

    pub fn retry(&mut self) -> Result<(), SessionError> {
        if self.state != PlaybackState::Error {
            debug!("PlaybackSession: retry ignored in {:?}", self.state);
            return Ok(());
        }
        if self.queue.is_empty() {
            return Err(SessionError::QueueEmpty);
        }
        self.consecutive_failures = 0;
        self.last_error = None;
        self.begin_load()
    }

    pub fn set_visibility(&mut self, visible: bool) -> Result<(), SessionError> {
        self.bridge.set_visibility(visible, self.state);
        Ok(())
    }

    /// Applies a track removal; an active session jumps to the successor
    /// when the current track goes away.
    pub fn remove_track(&mut self, track_id: &str) -> Result<(), SessionError> {
        match self.queue.remove_by_id(track_id) {
            RemoveOutcome::NotFound => Ok(()),
            RemoveOutcome::RemovedOther => {
                self.notify_queue_changed();
                Ok(())
            }
            RemoveOutcome::RemovedCurrent { now_empty: true } => {
                self.clear_playback();
                Ok(())
            }
            RemoveOutcome::RemovedCurrent { now_empty: false } => {
                self.notify_queue_changed();
                if self.state.is_active() {
                    self.begin_load()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Reloads the queue from a fresh read of the playlist it came from.
    /// The current track is re-anchored by id; if it is gone, removal
    /// semantics apply.
    pub fn refresh_queue(&mut self, snapshot: PlaylistSnapshot) -> Result<(), SessionError> {
        let Some(origin) = self.origin.as_mut() else {
            return Ok(());
        };
        if origin.playlist_id != snapshot.id {
            return Ok(());
        }
        origin.playlist_name = snapshot.name;

        let current_id = self.queue.current().map(|track| track.id.clone());
        let survivors_before_current = match self.queue.current_index() {
            Some(index) => self.queue.tracks()[..index]
                .iter()
                .filter(|old| snapshot.tracks.iter().any(|new| new.id == old.id))
                .count(),
            None => 0,
        };

        self.queue.load(snapshot.tracks);
        if self.queue.is_empty() {
            self.clear_playback();
            return Ok(());
        }

        if let Some(position) = current_id
            .as_deref()
            .and_then(|id| self.queue.position_of(id))
        {
            self.queue.set_current(position)?;
            self.notify_queue_changed();
            return Ok(());
        }

        let index = survivors_before_current.min(self.queue.len() - 1);
        self.queue.set_current(index)?;
        self.notify_queue_changed();
        if current_id.is_some() && self.state.is_active() {
            self.begin_load()
        } else {
            Ok(())
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            generation: self.generation,
            queue_length: self.queue.len(),
            current_index: self.queue.current_index(),
            current_track: self.queue.current().cloned(),
            playlist_id: self.origin.as_ref().map(|o| o.playlist_id.clone()),
            playlist_name: self.origin.as_ref().map(|o| o.playlist_name.clone()),
            current_time: self.progress.current_time,
            duration: self.progress.duration,
            volume: self.adapter.volume(),
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.as_ref().map(ToString::to_string),
            wake_lock_held: self.bridge.wake_lock_held(),
            visible: self.bridge.is_visible(),
        }
    }

    fn known_duration(&self) -> Option<f64> {
        self.progress.duration.or_else(|| self.adapter.duration())
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self.bus_producer.send(Message::Notify(notification));
    }

    fn notify_queue_changed(&self) {
        self.notify(SessionNotification::QueueChanged {
            length: self.queue.len(),
            current_index: self.queue.current_index(),
        });
    }

    fn transition(&mut self, next: PlaybackState) {
        if self.state != next {
            debug!("PlaybackSession: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.bridge.on_state_changed(next);
        self.notify(SessionNotification::StateChanged {
            state: next,
            generation: self.generation,
        });
    }

    /// Stops the engine and returns to `Idle`, keeping whatever is left in
    /// the queue.
    fn clear_playback(&mut self) {
        if let Err(err) = self.adapter.stop() {
            warn!("PlaybackSession: engine stop failed: {}", err);
        }
        self.generation += 1;
        self.progress = Progress::default();
        self.pending_failure = None;
        self.transition(PlaybackState::Idle);
        self.bridge.clear_track();
        self.notify_queue_changed();
    }

    fn begin_load(&mut self) -> Result<(), SessionError> {
        let Some(track) = self.queue.current().cloned() else {
            return Err(SessionError::QueueEmpty);
        };
        let index = self.queue.current_index().unwrap_or_default();
        self.generation += 1;
        self.progress = Progress {
            current_time: 0.0,
            duration: track.duration_secs,
        };
        self.pending_failure = None;

        info!(
            "PlaybackSession: loading [{}] '{}' generation={}",
            index, track.title, self.generation
        );
        self.transition(PlaybackState::Loading);
        let playlist_name = self.origin.as_ref().map(|o| o.playlist_name.clone());
        self.bridge.publish_track(&track, playlist_name.as_deref());
        self.notify_track_changed(index, &track, playlist_name);
        self.notify_queue_changed();

        if let Err(err) = self.adapter.load(&track.source_id, self.generation) {
            // Fail through the bus so each skip returns to the run loop.
            self.pending_failure = Some(engine_fault("load", err));
            self.post_load_deadline();
            return Ok(());
        }
        self.arm_load_deadline();
        Ok(())
    }

    fn post_load_deadline(&self) {
        let _ = self
            .bus_producer
            .send(Message::Session(SessionCommand::LoadDeadline {
                generation: self.generation,
            }));
    }

    fn notify_track_changed(&self, index: usize, track: &Track, playlist_name: Option<String>) {
        self.notify(SessionNotification::TrackChanged {
            index,
            track: track.clone(),
            playlist_name,
        });
    }

    fn arm_load_deadline(&self) {
        let bus_producer = self.bus_producer.clone();
        let generation = self.generation;
        let timeout = self.settings.load_timeout;
        let spawn_result = thread::Builder::new()
            .name("session-load-deadline".to_string())
            .spawn(move || {
                thread::sleep(timeout);
                let _ = bus_producer.send(Message::Session(SessionCommand::LoadDeadline {
                    generation,
                }));
            });
        if let Err(err) = spawn_result {
            warn!("PlaybackSession: failed to arm load deadline: {}", err);
        }
    }

    fn failure_bound(&self) -> usize {
        self.settings
            .max_consecutive_failures
            .unwrap_or(self.queue.len())
            .max(1)
    }

    /// Counts the failure and advances, or halts once the bound is hit or
    /// the queue runs out.
    fn handle_load_failure(&mut self, error: SessionError) {
        self.consecutive_failures += 1;
        self.pending_failure = None;
        let index = self.queue.current_index().unwrap_or_default();
        let track_id = self
            .queue
            .current()
            .map(|track| track.id.clone())
            .unwrap_or_default();
        warn!(
            "PlaybackSession: track [{}] {} failed ({}), consecutive failures={}",
            index, track_id, error, self.consecutive_failures
        );
        self.notify(SessionNotification::TrackFailed {
            index,
            track_id,
            error: error.to_string(),
        });

        if self.consecutive_failures >= self.failure_bound() {
            self.halt(SessionError::AutoSkipExhausted {
                attempts: self.consecutive_failures,
            });
            return;
        }
        if self.queue.next().is_none() {
            self.halt(error);
            return;
        }
        if let Err(err) = self.begin_load() {
            warn!("PlaybackSession: auto-skip failed: {}", err);
        }
    }

    fn halt(&mut self, error: SessionError) {
        if let Err(err) = self.adapter.stop() {
            warn!("PlaybackSession: engine stop failed: {}", err);
        }
        warn!("PlaybackSession: halted: {}", error);
        self.last_error = Some(error.clone());
        self.transition(PlaybackState::Error);
        self.notify(SessionNotification::Halted {
            error: error.to_string(),
        });
    }

    fn handle_load_deadline(&mut self, generation: u64) {
        if generation != self.generation || self.state != PlaybackState::Loading {
            return;
        }
        let error = self
            .pending_failure
            .take()
            .unwrap_or(SessionError::LoadTimeout);
        self.handle_load_failure(error);
    }

    fn is_current(&self, generation: u64) -> bool {
        if generation != self.generation {
            trace!(
                "PlaybackSession: discarding stale event generation={} current={}",
                generation,
                self.generation
            );
            return false;
        }
        true
    }

    fn handle_player_message(&mut self, message: PlayerMessage) {
        match message {
            PlayerMessage::EngineReady => {
                info!("PlaybackSession: engine ready");
                if let Err(err) = self.adapter.handle_engine_ready() {
                    let error = engine_fault("buffered command", err);
                    if self.state == PlaybackState::Loading {
                        self.handle_load_failure(error);
                    }
                }
            }
            PlayerMessage::Engine { generation, signal } => {
                if !self.is_current(generation) {
                    return;
                }
                for event in self.adapter.handle_signal(signal) {
                    self.handle_player_event(event);
                }
            }
            PlayerMessage::Tick { generation, epoch } => {
                if !self.is_current(generation) {
                    return;
                }
                if let Some(event) = self.adapter.handle_tick(epoch) {
                    self.handle_player_event(event);
                }
            }
            PlayerMessage::UnplayableElapsed { generation } => {
                if !self.is_current(generation) {
                    return;
                }
                let event = self.adapter.handle_unplayable_elapsed();
                self.handle_player_event(event);
            }
        }
    }

    fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Ready => self.on_track_ready(),
            PlayerEvent::StateChanged(PlayerState::Playing) => {
                // Engines that autoplay skip the cued state.
                if self.state == PlaybackState::Loading {
                    self.enter_playing();
                }
            }
            PlayerEvent::StateChanged(PlayerState::Ended) => self.on_track_ended(),
            PlayerEvent::StateChanged(state) => {
                trace!("PlaybackSession: engine reports {:?}", state);
            }
            PlayerEvent::Error { kind } => self.on_player_error(kind),
            PlayerEvent::TimeUpdate {
                current_time,
                duration,
            } => {
                if self.state != PlaybackState::Playing {
                    return;
                }
                self.progress = Progress {
                    current_time,
                    duration: duration.or(self.progress.duration),
                };
                self.bridge
                    .publish_progress(current_time, self.progress.duration);
                self.notify(SessionNotification::Progress {
                    current_time,
                    duration: self.progress.duration,
                });
            }
        }
    }

    fn on_track_ready(&mut self) {
        if self.state != PlaybackState::Loading {
            debug!("PlaybackSession: ready ignored in {:?}", self.state);
            return;
        }
        if let Err(err) = self.adapter.play() {
            let error = engine_fault("play", err);
            self.handle_load_failure(error);
            return;
        }
        self.enter_playing();
    }

    fn enter_playing(&mut self) {
        self.consecutive_failures = 0;
        self.last_error = None;
        if let Some(duration) = self.adapter.duration() {
            self.progress.duration = Some(duration);
        }
        self.transition(PlaybackState::Playing);
    }

    fn on_track_ended(&mut self) {
        if let Some(error) = self.pending_failure.take() {
            if self.state.is_active() {
                self.handle_load_failure(error);
            }
            return;
        }
        match self.state {
            PlaybackState::Playing | PlaybackState::Paused => {
                if self.queue.next().is_some() {
                    if let Err(err) = self.begin_load() {
                        warn!("PlaybackSession: advancing failed: {}", err);
                    }
                } else {
                    info!("PlaybackSession: reached the end of the queue");
                    if let Some(duration) = self.progress.duration {
                        self.progress.current_time = duration;
                    }
                    self.transition(PlaybackState::Ended);
                }
            }
            state => debug!("PlaybackSession: end ignored in {:?}", state),
        }
    }

    fn on_player_error(&mut self, kind: PlayerErrorKind) {
        let error = SessionError::from(kind);
        match self.state {
            PlaybackState::Loading | PlaybackState::Playing | PlaybackState::Paused
                if kind.is_unrecoverable() =>
            {
                debug!("PlaybackSession: {} pending synthetic end", error);
                self.pending_failure = Some(error);
            }
            PlaybackState::Loading => self.handle_load_failure(error),
            PlaybackState::Playing | PlaybackState::Paused => {
                warn!("PlaybackSession: engine error during playback: {}", error);
                self.last_error = Some(error.clone());
                self.notify(SessionNotification::CommandFailed {
                    command: "playback".to_string(),
                    error: error.to_string(),
                });
            }
            state => debug!("PlaybackSession: engine error ignored in {:?}", state),
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        let label = command_label(&command);
        let result = match command {
            SessionCommand::PlayQueue {
                snapshot,
                start_index,
            } => self.play_queue(snapshot, start_index),
            SessionCommand::PlayIndex(index) => self.play_index(index),
            SessionCommand::Play => self.play(),
            SessionCommand::Pause => self.pause(),
            SessionCommand::Resume => self.resume(),
            SessionCommand::TogglePlayPause => self.toggle_play_pause(),
            SessionCommand::Next => self.skip_next(),
            SessionCommand::Previous => self.skip_previous(),
            SessionCommand::SeekTo(seconds) => self.seek_to(seconds),
            SessionCommand::SeekToFraction(fraction) => self.seek_to_fraction(fraction),
            SessionCommand::SetVolume(volume) => self.set_volume(volume),
            SessionCommand::Stop => self.stop(),
            SessionCommand::Reset => self.reset(),
            SessionCommand::Retry => self.retry(),
            SessionCommand::SetVisibility(visible) => self.set_visibility(visible),
            SessionCommand::PublishSnapshot => {
                self.notify(SessionNotification::Snapshot(self.snapshot()));
                Ok(())
            }
            SessionCommand::LoadDeadline { generation } => {
                self.handle_load_deadline(generation);
                Ok(())
            }
        };

        if let Err(error) = result {
            warn!("PlaybackSession: {} failed: {}", label, error);
            self.notify(SessionNotification::CommandFailed {
                command: label.to_string(),
                error: error.to_string(),
            });
        }
    }

    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::Session(command) => self.handle_command(command),
            Message::Player(message) => self.handle_player_message(message),
            Message::Playlist(
                PlaylistMessage::PlaylistRefreshed(snapshot)
                | PlaylistMessage::PlaylistOpened(snapshot),
            ) => {
                if let Err(err) = self.refresh_queue(snapshot) {
                    warn!("PlaybackSession: queue refresh failed: {}", err);
                }
            }
            Message::Playlist(PlaylistMessage::TrackRemoved {
                playlist_id,
                track_id,
            }) => {
                let from_queue_playlist = self
                    .origin
                    .as_ref()
                    .is_some_and(|origin| origin.playlist_id == playlist_id);
                if from_queue_playlist {
                    if let Err(err) = self.remove_track(&track_id) {
                        warn!("PlaybackSession: track removal failed: {}", err);
                    }
                }
            }
            Message::Playlist(_) | Message::Notify(_) => {}
        }
    }

    /// Starts the blocking session loop.
    pub fn run(&mut self) {
        info!("PlaybackSession: started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("PlaybackSession: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        if let Err(err) = self.adapter.stop() {
            warn!("PlaybackSession: engine stop failed: {}", err);
        }
    }
}

fn command_label(command: &SessionCommand) -> &'static str {
    match command {
        SessionCommand::PlayQueue { .. } => "play_queue",
        SessionCommand::PlayIndex(_) => "play_index",
        SessionCommand::Play => "play",
        SessionCommand::Pause => "pause",
        SessionCommand::Resume => "resume",
        SessionCommand::TogglePlayPause => "toggle_play_pause",
        SessionCommand::Next => "skip_next",
        SessionCommand::Previous => "skip_previous",
        SessionCommand::SeekTo(_) => "seek_to",
        SessionCommand::SeekToFraction(_) => "seek_to_fraction",
        SessionCommand::SetVolume(_) => "set_volume",
        SessionCommand::Stop => "stop",
        SessionCommand::Reset => "reset",
        SessionCommand::Retry => "retry",
        SessionCommand::SetVisibility(_) => "set_visibility",
        SessionCommand::PublishSnapshot => "snapshot",
        SessionCommand::LoadDeadline { .. } => "load_deadline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_controls_bridge::test_support::{
        recording_bridge, CountingWakeLock, RecordingSurface, SurfaceCall,
    };
    use crate::player::engine::{
        ERROR_EMBEDDING_DISALLOWED, ERROR_EMBEDDING_DISALLOWED_ALT, ERROR_HTML5_FAULT,
        ERROR_NOT_FOUND, STATE_CUED, STATE_ENDED, STATE_PLAYING,
    };
    use crate::player::player_adapter::test_support::{EngineCall, ScriptedEngine};
    use crate::protocol::EngineSignal;
    use tokio::sync::broadcast;

    struct Harness {
        session: PlaybackSession<ScriptedEngine>,
        engine: ScriptedEngine,
        surface: RecordingSurface,
        wake_lock: CountingWakeLock,
        receiver: Receiver<Message>,
    }

    impl Harness {
        fn new() -> Self {
            let mut harness = Self::without_engine_ready();
            harness
                .session
                .handle_message(Message::Player(PlayerMessage::EngineReady));
            harness
        }

        fn without_engine_ready() -> Self {
            Self::with_playback(PlaybackConfig {
                load_timeout_ms: 60_000,
                time_update_interval_ms: 60_000,
                unplayable_skip_delay_ms: 60_000,
                ..PlaybackConfig::default()
            })
        }

        fn with_playback(playback: PlaybackConfig) -> Self {
            let (bus_sender, receiver) = broadcast::channel(4096);
            let (bridge, surface, wake_lock) = recording_bridge();
            let engine = ScriptedEngine {
                current_time: 30.0,
                duration: 120.0,
                ..ScriptedEngine::default()
            };
            let session = PlaybackSession::new(
                bus_sender.subscribe(),
                bus_sender,
                engine.clone(),
                bridge,
                &playback,
            );
            Self {
                session,
                engine,
                surface,
                wake_lock,
                receiver,
            }
        }

        fn engine_state(&mut self, code: i32) {
            let generation = self.session.generation();
            self.engine_state_for(generation, code);
        }

        fn engine_state_for(&mut self, generation: u64, code: i32) {
            self.session
                .handle_message(Message::Player(PlayerMessage::Engine {
                    generation,
                    signal: EngineSignal::StateChange(code),
                }));
        }

        fn engine_error(&mut self, code: i32) {
            let generation = self.session.generation();
            self.session
                .handle_message(Message::Player(PlayerMessage::Engine {
                    generation,
                    signal: EngineSignal::Error(code),
                }));
        }

        fn unplayable_elapsed(&mut self) {
            let generation = self.session.generation();
            self.session
                .handle_message(Message::Player(PlayerMessage::UnplayableElapsed {
                    generation,
                }));
        }

        fn command(&mut self, command: SessionCommand) {
            self.session.handle_message(Message::Session(command));
        }

        fn notifications(&mut self) -> Vec<SessionNotification> {
            let mut notifications = Vec::new();
            while let Ok(message) = self.receiver.try_recv() {
                if let Message::Notify(notification) = message {
                    notifications.push(notification);
                }
            }
            notifications
        }

        /// Feeds session commands the session posted to itself back in,
        /// collecting notifications on the way.
        fn pump_session_commands(&mut self) -> Vec<SessionNotification> {
            let mut notifications = Vec::new();
            while let Ok(message) = self.receiver.try_recv() {
                match message {
                    Message::Session(command) => self.command(command),
                    Message::Notify(notification) => notifications.push(notification),
                    _ => {}
                }
            }
            notifications
        }

        fn wait_for_load_deadline(&mut self, timeout: Duration) -> Option<u64> {
            let start = std::time::Instant::now();
            while start.elapsed() < timeout {
                match self.receiver.try_recv() {
                    Ok(Message::Session(SessionCommand::LoadDeadline { generation })) => {
                        return Some(generation);
                    }
                    Ok(_) => {}
                    Err(_) => thread::sleep(Duration::from_millis(5)),
                }
            }
            None
        }

        fn current_id(&self) -> Option<String> {
            self.session.queue().current().map(|track| track.id.clone())
        }

        fn play_calls(&self) -> usize {
            self.engine
                .calls()
                .into_iter()
                .filter(|call| *call == EngineCall::Play)
                .count()
        }
    }

    fn playlist(id: &str, ids: &[&str]) -> PlaylistSnapshot {
        PlaylistSnapshot {
            id: id.to_string(),
            name: "Road Trip".to_string(),
            tracks: ids
                .iter()
                .map(|id| Track::new(*id, format!("/music/{}.flac", id), id.to_uppercase()))
                .collect(),
        }
    }

    #[test]
    fn test_pause_resume_then_end_pairs_wake_lock_calls() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a"]), 0)
            .expect("queue");
        assert_eq!(h.session.state(), PlaybackState::Loading);

        h.engine_state(STATE_CUED);
        assert_eq!(h.session.state(), PlaybackState::Playing);
        h.session.pause().expect("pause");
        assert_eq!(h.session.state(), PlaybackState::Paused);
        h.session.resume().expect("resume");
        assert_eq!(h.session.state(), PlaybackState::Playing);
        h.engine_state(STATE_ENDED);

        assert_eq!(h.session.state(), PlaybackState::Ended);
        assert_eq!(h.wake_lock.acquisitions(), 2);
        assert_eq!(h.wake_lock.releases(), 2);
        assert!(!h.session.snapshot().wake_lock_held);
        assert_eq!(h.engine.loads(), vec!["/music/a.flac".to_string()]);
    }

    #[test]
    fn test_stale_generation_events_never_change_state() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        let stale = h.session.generation();
        h.session.skip_next().expect("next");
        assert_eq!(h.current_id().as_deref(), Some("b"));
        let before = h.session.snapshot();

        h.engine_state_for(stale, STATE_CUED);
        h.engine_state_for(stale, STATE_PLAYING);
        h.session
            .handle_message(Message::Player(PlayerMessage::Engine {
                generation: stale,
                signal: EngineSignal::Error(ERROR_HTML5_FAULT),
            }));
        h.session
            .handle_message(Message::Player(PlayerMessage::Tick {
                generation: stale,
                epoch: 1,
            }));
        h.session
            .handle_message(Message::Player(PlayerMessage::UnplayableElapsed {
                generation: stale,
            }));

        assert_eq!(h.session.snapshot(), before);
        assert_eq!(h.wake_lock.acquisitions(), 0);
        assert_eq!(h.play_calls(), 0);

        h.engine_state(STATE_CUED);
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.current_id().as_deref(), Some("b"));
    }

    #[test]
    fn test_unplayable_queue_halts_after_one_attempt_per_track() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c", "d", "e"]), 0)
            .expect("queue");

        for _ in 0..5 {
            assert_eq!(h.session.state(), PlaybackState::Loading);
            h.engine_error(ERROR_NOT_FOUND);
            assert_eq!(h.session.state(), PlaybackState::Loading);
            h.unplayable_elapsed();
        }

        assert_eq!(h.session.state(), PlaybackState::Error);
        assert_eq!(h.engine.loads().len(), 5);
        assert_eq!(
            h.session.last_error(),
            Some(&SessionError::AutoSkipExhausted { attempts: 5 })
        );
        assert_eq!(h.engine.calls().last(), Some(&EngineCall::Stop));
        let failures = h
            .notifications()
            .into_iter()
            .filter(|n| matches!(n, SessionNotification::TrackFailed { .. }))
            .count();
        assert_eq!(failures, 5);
    }

    #[test]
    fn test_engine_faults_while_loading_skip_immediately() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.engine_error(ERROR_HTML5_FAULT);
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.current_id().as_deref(), Some("b"));

        h.engine_state(STATE_CUED);
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.session.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_configured_failure_bound_halts_early() {
        let mut h = Harness::new();
        h.session.settings.max_consecutive_failures = Some(2);
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c", "d"]), 0)
            .expect("queue");
        h.engine_error(ERROR_HTML5_FAULT);
        h.engine_error(ERROR_HTML5_FAULT);
        assert_eq!(h.session.state(), PlaybackState::Error);
        assert_eq!(h.engine.loads().len(), 2);
    }

    #[test]
    fn test_failure_on_last_track_halts_instead_of_wrapping() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 2)
            .expect("queue");
        h.engine_error(ERROR_HTML5_FAULT);
        assert_eq!(h.session.state(), PlaybackState::Error);
        assert_eq!(h.session.last_error(), Some(&SessionError::EngineFault));
        assert_eq!(h.engine.loads().len(), 1);
    }

    #[test]
    fn test_end_of_last_track_enters_ended_without_loading() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 2)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.engine_state(STATE_ENDED);

        assert_eq!(h.session.state(), PlaybackState::Ended);
        assert_eq!(h.engine.loads(), vec!["/music/c.flac".to_string()]);
        assert_eq!(h.session.queue().current_index(), Some(2));
    }

    #[test]
    fn test_end_advances_to_next_track() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.engine_state(STATE_ENDED);
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.current_id().as_deref(), Some("b"));
    }

    #[test]
    fn test_next_then_previous_clamps_at_first_track() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);

        h.session.skip_next().expect("next");
        assert_eq!(h.session.queue().current_index(), Some(1));
        assert_eq!(h.current_id().as_deref(), Some("b"));

        h.session.skip_previous().expect("previous");
        h.session.skip_previous().expect("previous at start");
        assert_eq!(h.session.queue().current_index(), Some(0));
        assert_eq!(h.current_id().as_deref(), Some("a"));
        assert_eq!(
            h.engine.loads(),
            vec![
                "/music/a.flac".to_string(),
                "/music/b.flac".to_string(),
                "/music/a.flac".to_string(),
            ]
        );
    }

    #[test]
    fn test_rapid_next_presses_only_latest_load_plays() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c", "d"]), 0)
            .expect("queue");
        let first = h.session.generation();
        for _ in 0..3 {
            h.command(SessionCommand::Next);
        }
        for stale in first..h.session.generation() {
            h.engine_state_for(stale, STATE_CUED);
        }
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.play_calls(), 0);

        h.engine_state(STATE_CUED);
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.current_id().as_deref(), Some("d"));
        assert_eq!(h.play_calls(), 1);
    }

    #[test]
    fn test_load_timeout_skips_and_stale_deadline_is_ignored() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        let first = h.session.generation();
        h.command(SessionCommand::LoadDeadline { generation: first });
        assert_eq!(h.current_id().as_deref(), Some("b"));
        assert_eq!(h.session.state(), PlaybackState::Loading);

        h.command(SessionCommand::LoadDeadline { generation: first });
        assert_eq!(h.current_id().as_deref(), Some("b"));

        let notifications = h.notifications();
        assert!(notifications.iter().any(|n| matches!(
            n,
            SessionNotification::TrackFailed { index: 0, error, .. }
                if error == &SessionError::LoadTimeout.to_string()
        )));
    }

    #[test]
    fn test_engine_fault_on_pause_is_reported_without_moving() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.engine.set_failing(true);

        h.command(SessionCommand::Pause);
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.session.queue().current_index(), Some(0));
        assert!(h.notifications().iter().any(|n| matches!(
            n,
            SessionNotification::CommandFailed { command, .. } if command == "pause"
        )));
    }

    #[test]
    fn test_engine_fault_during_playback_keeps_position() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.engine_error(ERROR_HTML5_FAULT);
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.current_id().as_deref(), Some("a"));
        assert_eq!(h.engine.loads().len(), 1);
    }

    #[test]
    fn test_retry_from_error_reloads_same_track() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a"]), 0)
            .expect("queue");
        h.engine_error(ERROR_HTML5_FAULT);
        assert_eq!(h.session.state(), PlaybackState::Error);

        h.command(SessionCommand::Next);
        assert_eq!(h.session.state(), PlaybackState::Error);

        h.command(SessionCommand::Retry);
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.engine.loads().len(), 2);
        assert!(h.session.last_error().is_none());
    }

    #[test]
    fn test_stop_clears_queue_and_releases_wake_lock() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        let playing_generation = h.session.generation();

        h.command(SessionCommand::Stop);
        assert_eq!(h.session.state(), PlaybackState::Idle);
        assert!(h.session.queue().is_empty());
        assert_eq!(h.session.queue().current_index(), None);
        assert_eq!(h.wake_lock.releases(), 1);
        assert_eq!(h.surface.calls().last(), Some(&SurfaceCall::Metadata(None)));

        h.engine_state_for(playing_generation, STATE_ENDED);
        assert_eq!(h.session.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_removing_current_track_jumps_to_successor() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);

        h.session
            .handle_message(Message::Playlist(PlaylistMessage::TrackRemoved {
                playlist_id: "pl-1".to_string(),
                track_id: "a".to_string(),
            }));
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.current_id().as_deref(), Some("b"));
        assert_eq!(h.session.queue().len(), 2);
        assert_eq!(
            h.engine.loads(),
            vec!["/music/a.flac".to_string(), "/music/b.flac".to_string()]
        );
    }

    #[test]
    fn test_removing_only_track_returns_to_idle() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.session.remove_track("a").expect("remove");
        assert_eq!(h.session.state(), PlaybackState::Idle);
        assert_eq!(h.session.queue().current_index(), None);
        assert!(!h.session.snapshot().wake_lock_held);
    }

    #[test]
    fn test_removal_from_other_playlist_is_ignored() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.session
            .handle_message(Message::Playlist(PlaylistMessage::TrackRemoved {
                playlist_id: "pl-2".to_string(),
                track_id: "a".to_string(),
            }));
        assert_eq!(h.session.queue().len(), 2);
    }

    #[test]
    fn test_refresh_reanchors_current_track_without_reloading() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 1)
            .expect("queue");
        h.engine_state(STATE_CUED);

        let mut refreshed = playlist("pl-1", &["c", "b"]);
        refreshed.name = "Road Trip 2".to_string();
        h.session
            .handle_message(Message::Playlist(PlaylistMessage::PlaylistRefreshed(
                refreshed,
            )));

        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.session.queue().current_index(), Some(1));
        assert_eq!(h.current_id().as_deref(), Some("b"));
        assert_eq!(h.engine.loads().len(), 1);
        assert_eq!(
            h.session.snapshot().playlist_name.as_deref(),
            Some("Road Trip 2")
        );
    }

    #[test]
    fn test_refresh_without_current_track_jumps() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 1)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.session
            .refresh_queue(playlist("pl-1", &["a", "c"]))
            .expect("refresh");
        assert_eq!(h.current_id().as_deref(), Some("c"));
        assert_eq!(h.session.state(), PlaybackState::Loading);
    }

    #[test]
    fn test_refresh_of_other_playlist_is_ignored() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.session
            .refresh_queue(playlist("pl-2", &["x"]))
            .expect("refresh");
        assert_eq!(h.current_id().as_deref(), Some("a"));
        assert_eq!(h.session.queue().len(), 2);
    }

    #[test]
    fn test_hidden_page_holds_no_wake_lock_until_shown() {
        let mut h = Harness::new();
        h.command(SessionCommand::SetVisibility(false));
        h.session
            .play_queue(playlist("pl-1", &["a"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        assert_eq!(h.wake_lock.acquisitions(), 0);

        h.command(SessionCommand::SetVisibility(true));
        assert_eq!(h.wake_lock.acquisitions(), 1);
        assert!(h.session.snapshot().wake_lock_held);
    }

    #[test]
    fn test_commands_before_engine_ready_replay_latest_load() {
        let mut h = Harness::without_engine_ready();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.session.skip_next().expect("next");
        assert!(h.engine.calls().is_empty());

        h.session
            .handle_message(Message::Player(PlayerMessage::EngineReady));
        assert_eq!(
            h.engine.calls(),
            vec![
                EngineCall::Volume(100),
                EngineCall::Load {
                    source_id: "/music/b.flac".to_string(),
                    autoplay: false,
                    generation: h.session.generation(),
                },
            ]
        );
    }

    #[test]
    fn test_progress_updates_only_while_playing() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.engine_state(STATE_PLAYING);
        let generation = h.session.generation();

        h.session
            .handle_message(Message::Player(PlayerMessage::Tick {
                generation,
                epoch: 1,
            }));
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.current_time, 30.0);
        assert_eq!(snapshot.duration, Some(120.0));

        h.session.pause().expect("pause");
        h.session
            .handle_message(Message::Player(PlayerMessage::Tick {
                generation,
                epoch: 1,
            }));
        assert_eq!(h.session.snapshot().current_time, 30.0);
    }

    #[test]
    fn test_seek_fraction_uses_known_duration() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.command(SessionCommand::SeekToFraction(0.5));
        assert_eq!(h.engine.calls().last(), Some(&EngineCall::Seek(60.0)));
        assert_eq!(h.session.snapshot().current_time, 60.0);

        h.command(SessionCommand::SeekTo(500.0));
        assert_eq!(h.engine.calls().last(), Some(&EngineCall::Seek(120.0)));
    }

    #[test]
    fn test_play_queue_rejects_out_of_range_start() {
        let mut h = Harness::new();
        let result = h.session.play_queue(playlist("pl-1", &["a", "b"]), 5);
        assert_eq!(
            result,
            Err(SessionError::Queue(QueueError::IndexOutOfRange {
                index: 5,
                len: 2
            }))
        );
        assert!(h.session.queue().is_empty());
        assert_eq!(h.session.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_play_from_ended_restarts_current_track() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        h.engine_state(STATE_ENDED);
        h.command(SessionCommand::TogglePlayPause);
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.engine.loads().len(), 2);
    }

    #[test]
    fn test_snapshot_is_published_on_request() {
        let mut h = Harness::new();
        h.command(SessionCommand::SetVolume(40));
        h.command(SessionCommand::PublishSnapshot);
        let snapshot = h.notifications().into_iter().find_map(|n| match n {
            SessionNotification::Snapshot(snapshot) => Some(snapshot),
            _ => None,
        });
        let snapshot = snapshot.expect("snapshot notification");
        assert_eq!(snapshot.state, PlaybackState::Idle);
        assert_eq!(snapshot.volume, 40);
        assert!(snapshot.visible);
    }
    #[test]
    fn test_rejected_loads_skip_one_track_per_bus_round_trip() {
        let mut h = Harness::new();
        h.engine.set_failing(true);
        let ids: Vec<String> = (0..2000).map(|i| format!("t{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        h.session
            .play_queue(playlist("pl-1", &id_refs), 0)
            .expect("queue");

        // The rejected load is reported through the bus, not inline.
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.session.queue().current_index(), Some(0));
        assert_eq!(h.session.snapshot().consecutive_failures, 0);

        let notifications = h.pump_session_commands();
        assert_eq!(h.session.state(), PlaybackState::Error);
        assert_eq!(
            h.session.last_error(),
            Some(&SessionError::AutoSkipExhausted { attempts: 2000 })
        );
        let failures = notifications
            .iter()
            .filter(|n| matches!(n, SessionNotification::TrackFailed { .. }))
            .count();
        assert_eq!(failures, 2000);
    }

    #[test]
    fn test_stop_interrupts_skip_chain_of_rejected_loads() {
        let mut h = Harness::new();
        h.engine.set_failing(true);
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 0)
            .expect("queue");
        h.command(SessionCommand::Stop);
        h.pump_session_commands();

        assert_eq!(h.session.state(), PlaybackState::Idle);
        assert!(h.session.queue().is_empty());
        assert!(h.session.last_error().is_none());
    }

    #[test]
    fn test_opening_queue_playlist_reloads_queue() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 1)
            .expect("queue");
        h.engine_state(STATE_CUED);

        h.session
            .handle_message(Message::Playlist(PlaylistMessage::PlaylistOpened(
                playlist("pl-1", &["a", "b", "c"]),
            )));
        assert_eq!(h.session.queue().len(), 3);
        assert_eq!(h.current_id().as_deref(), Some("b"));
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.engine.loads().len(), 1);

        h.session
            .handle_message(Message::Playlist(PlaylistMessage::PlaylistOpened(
                playlist("pl-2", &["x"]),
            )));
        assert_eq!(h.session.queue().len(), 3);
        assert_eq!(h.session.snapshot().playlist_id.as_deref(), Some("pl-1"));
    }

    #[test]
    fn test_load_deadline_timer_fires_for_stalled_load() {
        let mut h = Harness::with_playback(PlaybackConfig {
            load_timeout_ms: 20,
            time_update_interval_ms: 60_000,
            unplayable_skip_delay_ms: 60_000,
            ..PlaybackConfig::default()
        });
        h.session
            .handle_message(Message::Player(PlayerMessage::EngineReady));
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        let first = h.session.generation();

        let generation = h
            .wait_for_load_deadline(Duration::from_secs(5))
            .expect("deadline fired");
        assert_eq!(generation, first);
        h.command(SessionCommand::LoadDeadline { generation });

        assert_eq!(h.current_id().as_deref(), Some("b"));
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.session.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_deadline_reports_pending_unrecoverable_error() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b"]), 0)
            .expect("queue");
        h.engine_error(ERROR_NOT_FOUND);
        let generation = h.session.generation();
        h.command(SessionCommand::LoadDeadline { generation });

        assert_eq!(h.current_id().as_deref(), Some("b"));
        let notifications = h.notifications();
        assert!(notifications.iter().any(|n| matches!(
            n,
            SessionNotification::TrackFailed { index: 0, error, .. }
                if error == &SessionError::SourceUnavailable.to_string()
        )));
        assert!(!notifications.iter().any(|n| matches!(
            n,
            SessionNotification::TrackFailed { error, .. }
                if error == &SessionError::LoadTimeout.to_string()
        )));

        // The synthetic end of the superseded load is stale by now.
        h.session
            .handle_message(Message::Player(PlayerMessage::UnplayableElapsed {
                generation,
            }));
        assert_eq!(h.current_id().as_deref(), Some("b"));
    }

    #[test]
    fn test_embedding_disallowed_codes_auto_skip() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 0)
            .expect("queue");

        h.engine_error(ERROR_EMBEDDING_DISALLOWED);
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.current_id().as_deref(), Some("a"));
        h.unplayable_elapsed();
        assert_eq!(h.current_id().as_deref(), Some("b"));

        h.engine_error(ERROR_EMBEDDING_DISALLOWED_ALT);
        h.unplayable_elapsed();
        assert_eq!(h.current_id().as_deref(), Some("c"));
        assert_eq!(h.session.snapshot().consecutive_failures, 2);

        let disallowed = SessionError::EmbeddingDisallowed.to_string();
        let failures = h
            .notifications()
            .into_iter()
            .filter(|n| matches!(
                n,
                SessionNotification::TrackFailed { error, .. } if *error == disallowed
            ))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_unrecoverable_error_while_playing_skips_on_synthetic_end() {
        let mut h = Harness::new();
        h.session
            .play_queue(playlist("pl-1", &["a", "b", "c"]), 0)
            .expect("queue");
        h.engine_state(STATE_CUED);
        assert_eq!(h.session.state(), PlaybackState::Playing);

        h.engine_error(ERROR_NOT_FOUND);
        assert_eq!(h.session.state(), PlaybackState::Playing);
        assert_eq!(h.current_id().as_deref(), Some("a"));
        h.unplayable_elapsed();
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.current_id().as_deref(), Some("b"));

        h.engine_state(STATE_CUED);
        h.session.pause().expect("pause");
        h.engine_error(ERROR_EMBEDDING_DISALLOWED);
        assert_eq!(h.session.state(), PlaybackState::Paused);
        h.unplayable_elapsed();
        assert_eq!(h.session.state(), PlaybackState::Loading);
        assert_eq!(h.current_id().as_deref(), Some("c"));
        assert_eq!(h.session.snapshot().consecutive_failures, 1);
    }
}
