//! Uniform player capability interface over a [`MediaEngine`].
//!
//! The adapter buffers commands until the engine is ready, normalizes raw
//! engine callbacks into [`PlayerEvent`]s and owns the two timers tied to a
//! load: the progress ticker (alive only while the engine reports playing)
//! and the delayed end-of-track for unplayable sources.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, trace, warn};
use tokio::sync::broadcast::Sender;

use super::engine::{EngineError, EngineState, MediaEngine, PlayerErrorKind};
use crate::config::PlaybackConfig;
use crate::protocol::{EngineSignal, Message, PlayerMessage};

/// Engine sub-state reported to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Playing,
    Paused,
    Buffering,
    Ended,
}

/// Normalized player event.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The track of the current load is cued and can start.
    Ready,
    StateChanged(PlayerState),
    Error { kind: PlayerErrorKind },
    TimeUpdate {
        current_time: f64,
        duration: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum PendingCommand {
    Load { source_id: String, generation: u64 },
    Play,
    Pause,
    Seek(f64),
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterSettings {
    pub time_update_interval: Duration,
    pub unplayable_skip_delay: Duration,
    pub initial_volume: u8,
}

impl AdapterSettings {
    pub fn from_config(playback: &PlaybackConfig) -> Self {
        Self {
            time_update_interval: Duration::from_millis(playback.time_update_interval_ms),
            unplayable_skip_delay: Duration::from_millis(playback.unplayable_skip_delay_ms),
            initial_volume: playback.initial_volume,
        }
    }
}

/// Periodic progress task; dropping it stops the thread.
struct Ticker {
    stop: Arc<AtomicBool>,
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub struct PlayerAdapter<E: MediaEngine> {
    engine: E,
    bus_sender: Sender<Message>,
    settings: AdapterSettings,
    engine_ready: bool,
    pending: Option<PendingCommand>,
    volume: u8,
    generation: u64,
    ticker: Option<Ticker>,
    tick_epoch: u64,
}

impl<E: MediaEngine> PlayerAdapter<E> {
    pub fn new(engine: E, bus_sender: Sender<Message>, settings: AdapterSettings) -> Self {
        Self {
            engine,
            bus_sender,
            engine_ready: false,
            pending: None,
            volume: settings.initial_volume.min(100),
            generation: 0,
            ticker: None,
            tick_epoch: 0,
            settings,
        }
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    #[cfg(test)]
    pub fn is_ticking(&self) -> bool {
        self.ticker.is_some()
    }

    /// Starts loading a track without autoplay; the engine's cued state for
    /// `generation` surfaces as [`PlayerEvent::Ready`].
    pub fn load(&mut self, source_id: &str, generation: u64) -> Result<(), EngineError> {
        self.generation = generation;
        self.cancel_ticker();
        self.dispatch(PendingCommand::Load {
            source_id: source_id.to_string(),
            generation,
        })
    }

    pub fn play(&mut self) -> Result<(), EngineError> {
        self.dispatch(PendingCommand::Play)
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        self.cancel_ticker();
        self.dispatch(PendingCommand::Pause)
    }

    pub fn seek_to(&mut self, seconds: f64) -> Result<(), EngineError> {
        self.dispatch(PendingCommand::Seek(seconds.max(0.0)))
    }

    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.cancel_ticker();
        self.pending = None;
        if self.engine_ready {
            self.engine.stop()
        } else {
            Ok(())
        }
    }

    /// Remembered across loads and re-applied whenever the engine signals
    /// readiness.
    pub fn set_volume(&mut self, volume: u8) -> Result<(), EngineError> {
        self.volume = volume.min(100);
        if self.engine_ready {
            self.engine.set_volume(self.volume)
        } else {
            Ok(())
        }
    }

    pub fn current_time(&self) -> f64 {
        self.engine.current_time()
    }

    pub fn duration(&self) -> Option<f64> {
        let duration = self.engine.duration();
        (duration.is_finite() && duration > 0.0).then_some(duration)
    }

    /// Marks the engine ready and replays the buffered command, if any.
    pub fn handle_engine_ready(&mut self) -> Result<(), EngineError> {
        self.engine_ready = true;
        let volume_result = self.engine.set_volume(self.volume);
        let replay_result = match self.pending.take() {
            Some(command) => {
                debug!("PlayerAdapter: replaying buffered {:?}", command);
                self.execute(command)
            }
            None => Ok(()),
        };
        volume_result.and(replay_result)
    }

    /// Normalizes one engine callback of the current generation.
    pub fn handle_signal(&mut self, signal: EngineSignal) -> Vec<PlayerEvent> {
        match signal {
            EngineSignal::StateChange(code) => match EngineState::from_code(code) {
                Some(EngineState::Cued) => vec![PlayerEvent::Ready],
                Some(EngineState::Playing) => {
                    self.start_ticker();
                    vec![PlayerEvent::StateChanged(PlayerState::Playing)]
                }
                Some(EngineState::Paused) => {
                    self.cancel_ticker();
                    vec![PlayerEvent::StateChanged(PlayerState::Paused)]
                }
                Some(EngineState::Buffering) => {
                    self.cancel_ticker();
                    vec![PlayerEvent::StateChanged(PlayerState::Buffering)]
                }
                Some(EngineState::Ended) => {
                    self.cancel_ticker();
                    vec![PlayerEvent::StateChanged(PlayerState::Ended)]
                }
                Some(EngineState::Unstarted) => {
                    self.cancel_ticker();
                    Vec::new()
                }
                None => {
                    warn!("PlayerAdapter: unknown engine state code {}", code);
                    Vec::new()
                }
            },
            EngineSignal::Error(code) => {
                let kind = PlayerErrorKind::from_code(code);
                self.cancel_ticker();
                if kind.is_unrecoverable() {
                    self.schedule_unplayable_end();
                }
                vec![PlayerEvent::Error { kind }]
            }
        }
    }

    /// A tick only yields progress while its ticker is the live one.
    pub fn handle_tick(&self, epoch: u64) -> Option<PlayerEvent> {
        if self.ticker.is_none() || epoch != self.tick_epoch {
            trace!("PlayerAdapter: dropping tick from cancelled ticker");
            return None;
        }
        Some(PlayerEvent::TimeUpdate {
            current_time: self.current_time(),
            duration: self.duration(),
        })
    }

    pub fn handle_unplayable_elapsed(&mut self) -> PlayerEvent {
        self.cancel_ticker();
        PlayerEvent::StateChanged(PlayerState::Ended)
    }

    fn dispatch(&mut self, command: PendingCommand) -> Result<(), EngineError> {
        if !self.engine_ready {
            trace!("PlayerAdapter: buffering {:?} until engine is ready", command);
            self.pending = Some(command);
            return Ok(());
        }
        self.execute(command)
    }

    fn execute(&mut self, command: PendingCommand) -> Result<(), EngineError> {
        match command {
            PendingCommand::Load {
                source_id,
                generation,
            } => self.engine.load(&source_id, false, generation),
            PendingCommand::Play => self.engine.play(),
            PendingCommand::Pause => self.engine.pause(),
            PendingCommand::Seek(seconds) => self.engine.seek_to(seconds),
        }
    }

    fn cancel_ticker(&mut self) {
        if self.ticker.take().is_some() {
            self.tick_epoch += 1;
        }
    }

    fn start_ticker(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        self.tick_epoch += 1;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let bus_sender = self.bus_sender.clone();
        let interval = self.settings.time_update_interval;
        let generation = self.generation;
        let epoch = self.tick_epoch;

        let spawn_result = thread::Builder::new()
            .name("player-ticker".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                if thread_stop.load(Ordering::Relaxed) {
                    break;
                }
                let tick = Message::Player(PlayerMessage::Tick { generation, epoch });
                if bus_sender.send(tick).is_err() {
                    break;
                }
            });
        match spawn_result {
            Ok(_) => self.ticker = Some(Ticker { stop }),
            Err(err) => warn!("PlayerAdapter: failed to start progress ticker: {}", err),
        }
    }

    fn schedule_unplayable_end(&self) {
        let bus_sender = self.bus_sender.clone();
        let delay = self.settings.unplayable_skip_delay;
        let generation = self.generation;
        let spawn_result = thread::Builder::new()
            .name("player-unplayable".to_string())
            .spawn(move || {
                thread::sleep(delay);
                let _ = bus_sender.send(Message::Player(PlayerMessage::UnplayableElapsed {
                    generation,
                }));
            });
        if let Err(err) = spawn_result {
            warn!("PlayerAdapter: failed to schedule unplayable skip: {}", err);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{EngineCall, ScriptedEngine};
    use super::*;
    use crate::player::engine::{
        ERROR_HTML5_FAULT, ERROR_NOT_FOUND, STATE_CUED, STATE_ENDED, STATE_PAUSED, STATE_PLAYING,
    };
    use std::time::Instant;
    use tokio::sync::broadcast::{self, Receiver};

    fn settings(interval_ms: u64, unplayable_ms: u64) -> AdapterSettings {
        AdapterSettings {
            time_update_interval: Duration::from_millis(interval_ms),
            unplayable_skip_delay: Duration::from_millis(unplayable_ms),
            initial_volume: 80,
        }
    }

    fn adapter_with(
        settings: AdapterSettings,
    ) -> (PlayerAdapter<ScriptedEngine>, ScriptedEngine, Receiver<Message>) {
        let (bus_sender, receiver) = broadcast::channel(256);
        let engine = ScriptedEngine {
            duration: 200.0,
            current_time: 12.5,
            ..ScriptedEngine::default()
        };
        let adapter = PlayerAdapter::new(engine.clone(), bus_sender, settings);
        (adapter, engine, receiver)
    }

    fn wait_for_message<F>(
        receiver: &mut Receiver<Message>,
        timeout: Duration,
        mut predicate: F,
    ) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match receiver.try_recv() {
                Ok(message) if predicate(&message) => return Some(message),
                Ok(_) => {}
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
        None
    }

    #[test]
    fn test_commands_before_ready_are_buffered_latest_wins() {
        let (mut adapter, engine, _receiver) = adapter_with(settings(1000, 1000));
        adapter.load("/music/a.flac", 1).expect("buffered");
        adapter.load("/music/b.flac", 2).expect("buffered");
        assert!(engine.calls().is_empty());

        adapter.handle_engine_ready().expect("ready");
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Volume(80),
                EngineCall::Load {
                    source_id: "/music/b.flac".to_string(),
                    autoplay: false,
                    generation: 2,
                },
            ]
        );
    }

    #[test]
    fn test_volume_is_remembered_and_reapplied_on_ready() {
        let (mut adapter, engine, _receiver) = adapter_with(settings(1000, 1000));
        adapter.set_volume(130).expect("buffered volume");
        assert_eq!(adapter.volume(), 100);
        adapter.pause().expect("buffered pause");
        adapter.handle_engine_ready().expect("ready");
        assert_eq!(
            engine.calls(),
            vec![EngineCall::Volume(100), EngineCall::Pause]
        );
    }

    #[test]
    fn test_cued_state_normalizes_to_ready() {
        let (mut adapter, _engine, _receiver) = adapter_with(settings(1000, 1000));
        assert_eq!(
            adapter.handle_signal(EngineSignal::StateChange(STATE_CUED)),
            vec![PlayerEvent::Ready]
        );
    }

    #[test]
    fn test_ticker_runs_only_while_playing() {
        let (mut adapter, _engine, mut receiver) = adapter_with(settings(10, 1000));
        adapter.handle_engine_ready().expect("ready");
        adapter.load("/music/a.flac", 4).expect("load");

        adapter.handle_signal(EngineSignal::StateChange(STATE_PLAYING));
        assert!(adapter.is_ticking());
        let tick = wait_for_message(&mut receiver, Duration::from_secs(2), |message| {
            matches!(message, Message::Player(PlayerMessage::Tick { .. }))
        })
        .expect("ticker should fire");
        let Message::Player(PlayerMessage::Tick { generation, epoch }) = tick else {
            panic!("expected tick");
        };
        assert_eq!(generation, 4);
        assert_eq!(
            adapter.handle_tick(epoch),
            Some(PlayerEvent::TimeUpdate {
                current_time: 12.5,
                duration: Some(200.0),
            })
        );

        adapter.handle_signal(EngineSignal::StateChange(STATE_PAUSED));
        assert!(!adapter.is_ticking());
        assert_eq!(adapter.handle_tick(epoch), None);
    }

    #[test]
    fn test_ended_and_errors_cancel_ticker() {
        let (mut adapter, _engine, _receiver) = adapter_with(settings(1000, 1000));
        adapter.handle_signal(EngineSignal::StateChange(STATE_PLAYING));
        assert_eq!(
            adapter.handle_signal(EngineSignal::StateChange(STATE_ENDED)),
            vec![PlayerEvent::StateChanged(PlayerState::Ended)]
        );
        assert!(!adapter.is_ticking());

        adapter.handle_signal(EngineSignal::StateChange(STATE_PLAYING));
        assert_eq!(
            adapter.handle_signal(EngineSignal::Error(ERROR_HTML5_FAULT)),
            vec![PlayerEvent::Error {
                kind: PlayerErrorKind::EngineFault
            }]
        );
        assert!(!adapter.is_ticking());
    }

    #[test]
    fn test_unplayable_source_schedules_synthetic_end() {
        let (mut adapter, _engine, mut receiver) = adapter_with(settings(1000, 5));
        adapter.handle_engine_ready().expect("ready");
        adapter.load("/music/missing.flac", 9).expect("load");

        assert_eq!(
            adapter.handle_signal(EngineSignal::Error(ERROR_NOT_FOUND)),
            vec![PlayerEvent::Error {
                kind: PlayerErrorKind::SourceUnavailable
            }]
        );
        let elapsed = wait_for_message(&mut receiver, Duration::from_secs(2), |message| {
            matches!(message, Message::Player(PlayerMessage::UnplayableElapsed { .. }))
        });
        assert!(matches!(
            elapsed,
            Some(Message::Player(PlayerMessage::UnplayableElapsed { generation: 9 }))
        ));
        assert_eq!(
            adapter.handle_unplayable_elapsed(),
            PlayerEvent::StateChanged(PlayerState::Ended)
        );
    }

    #[test]
    fn test_unknown_duration_is_none() {
        let (bus_sender, _receiver) = broadcast::channel(4);
        let adapter = PlayerAdapter::new(ScriptedEngine::default(), bus_sender, settings(1000, 1000));
        assert_eq!(adapter.duration(), None);
    }
}
