//! Writes runtime config changes (volume) back to the config file.

use std::path::PathBuf;

use log::{debug, info, warn};
use tokio::sync::broadcast::Receiver;

use crate::{
    config::Config,
    config_persistence::persist_config_file,
    protocol::{Message, SessionNotification},
};

/// Returns the config to persist for a volume change, or `None` when the
/// stored value already matches.
pub(crate) fn apply_volume_update(config: &Config, volume: u8) -> Option<Config> {
    let volume = volume.min(100);
    if config.playback.initial_volume == volume {
        return None;
    }
    let mut next = config.clone();
    next.playback.initial_volume = volume;
    Some(next)
}

pub struct ConfigCoordinator {
    bus_consumer: Receiver<Message>,
    config: Config,
    config_path: PathBuf,
}

impl ConfigCoordinator {
    pub fn new(bus_consumer: Receiver<Message>, config: Config, config_path: PathBuf) -> Self {
        Self {
            bus_consumer,
            config,
            config_path,
        }
    }

    fn handle_message(&mut self, message: Message) {
        if let Message::Notify(SessionNotification::VolumeChanged(volume)) = message {
            if let Some(next) = apply_volume_update(&self.config, volume) {
                debug!("ConfigCoordinator: persisting volume {}", volume);
                persist_config_file(&next, &self.config_path);
                self.config = next;
            }
        }
    }

    pub fn run(&mut self) {
        info!("ConfigCoordinator: started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("ConfigCoordinator: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
