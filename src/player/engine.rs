//! Raw embedded-engine contract.
//!
//! Engines speak numeric state/error codes through [`EngineCallbacks`]; the
//! player adapter is the only consumer that interprets them.

use log::trace;
use thiserror::Error;
use tokio::sync::broadcast::Sender;

use crate::protocol::{EngineSignal, Message, PlayerMessage};

pub const STATE_UNSTARTED: i32 = -1;
pub const STATE_ENDED: i32 = 0;
pub const STATE_PLAYING: i32 = 1;
pub const STATE_PAUSED: i32 = 2;
pub const STATE_BUFFERING: i32 = 3;
pub const STATE_CUED: i32 = 5;

pub const ERROR_INVALID_PARAMETERS: i32 = 2;
pub const ERROR_HTML5_FAULT: i32 = 5;
pub const ERROR_NOT_FOUND: i32 = 100;
pub const ERROR_EMBEDDING_DISALLOWED: i32 = 101;
pub const ERROR_EMBEDDING_DISALLOWED_ALT: i32 = 150;

/// Engine state reported through `on_state_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

impl EngineState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            STATE_UNSTARTED => Some(Self::Unstarted),
            STATE_ENDED => Some(Self::Ended),
            STATE_PLAYING => Some(Self::Playing),
            STATE_PAUSED => Some(Self::Paused),
            STATE_BUFFERING => Some(Self::Buffering),
            STATE_CUED => Some(Self::Cued),
            _ => None,
        }
    }
}

/// Normalized engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlayerErrorKind {
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("engine fault")]
    EngineFault,
    #[error("source unavailable")]
    SourceUnavailable,
    #[error("embedding disallowed")]
    EmbeddingDisallowed,
}

impl PlayerErrorKind {
    /// Unknown codes are treated as engine faults.
    pub fn from_code(code: i32) -> Self {
        match code {
            ERROR_INVALID_PARAMETERS => Self::InvalidParameters,
            ERROR_NOT_FOUND => Self::SourceUnavailable,
            ERROR_EMBEDDING_DISALLOWED | ERROR_EMBEDDING_DISALLOWED_ALT => {
                Self::EmbeddingDisallowed
            }
            _ => Self::EngineFault,
        }
    }

    /// The current track can never play; the adapter turns these into a
    /// delayed end-of-track so the session moves on.
    pub fn is_unrecoverable(self) -> bool {
        matches!(self, Self::SourceUnavailable | Self::EmbeddingDisallowed)
    }
}

/// Failure to deliver a command to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine worker is not running")]
    Disconnected,
    #[error("audio device error: {0}")]
    Device(String),
}

/// Command surface of an embedded engine. All calls return immediately;
/// outcomes arrive later through [`EngineCallbacks`].
pub trait MediaEngine {
    /// Starts loading `source_id`. Callbacks produced by this load carry
    /// `generation`.
    fn load(&mut self, source_id: &str, autoplay: bool, generation: u64)
        -> Result<(), EngineError>;
    fn play(&mut self) -> Result<(), EngineError>;
    fn pause(&mut self) -> Result<(), EngineError>;
    fn stop(&mut self) -> Result<(), EngineError>;
    fn seek_to(&mut self, seconds: f64) -> Result<(), EngineError>;
    fn set_volume(&mut self, volume: u8) -> Result<(), EngineError>;
    fn current_time(&self) -> f64;
    /// Zero while unknown.
    fn duration(&self) -> f64;
}

/// Notification slots an engine invokes from its own threads.
pub trait EngineCallbacks: Send + Sync {
    /// The engine finished initializing and accepts commands.
    fn on_ready(&self);
    fn on_state_change(&self, generation: u64, code: i32);
    fn on_error(&self, generation: u64, code: i32);
}

/// Forwards engine callbacks onto the event bus.
pub struct BusEngineCallbacks {
    bus_sender: Sender<Message>,
}

impl BusEngineCallbacks {
    pub fn new(bus_sender: Sender<Message>) -> Self {
        Self { bus_sender }
    }

    fn publish(&self, message: PlayerMessage) {
        trace!("BusEngineCallbacks: {:?}", message);
        let _ = self.bus_sender.send(Message::Player(message));
    }
}

impl EngineCallbacks for BusEngineCallbacks {
    fn on_ready(&self) {
        self.publish(PlayerMessage::EngineReady);
    }

    fn on_state_change(&self, generation: u64, code: i32) {
        self.publish(PlayerMessage::Engine {
            generation,
            signal: EngineSignal::StateChange(code),
        });
    }

    fn on_error(&self, generation: u64, code: i32) {
        self.publish(PlayerMessage::Engine {
            generation,
            signal: EngineSignal::Error(code),
        });
    }
}
