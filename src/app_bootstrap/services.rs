use std::{any::Any, path::PathBuf, sync::Arc, thread};

use log::{error, warn};
use tokio::sync::broadcast;

use crate::{
    app_config_coordinator::ConfigCoordinator,
    command_console,
    config::Config,
    db_manager::SqlitePlaylistStore,
    media_controls_bridge::MediaControlsBridge,
    playback_session::PlaybackSession,
    player::{engine::BusEngineCallbacks, local_engine::LocalEngine},
    playlist_manager::PlaylistManager,
    protocol::Message,
};

pub struct BackgroundServicesConfig {
    pub bus_sender: broadcast::Sender<Message>,
    pub config: Config,
    pub config_path: PathBuf,
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn spawn_named<F>(name: &str, body: F)
where
    F: FnOnce() + Send + 'static,
{
    let thread_name = name.to_string();
    let spawn_result = thread::Builder::new().name(name.to_string()).spawn(move || {
        let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        if let Err(payload) = run_result {
            error!(
                "{} thread terminated due to panic: {}",
                thread_name,
                panic_payload_to_string(payload.as_ref())
            );
        }
    });
    if let Err(err) = spawn_result {
        error!("Failed to spawn {} thread: {}", name, err);
    }
}

/// Opens the configured playlist database, falling back to an in-memory
/// store so browsing and playback keep working without persistence.
fn open_playlist_store(config: &Config) -> Option<SqlitePlaylistStore> {
    let path = config
        .store
        .database_path
        .clone()
        .or_else(SqlitePlaylistStore::default_database_path);
    if let Some(path) = path {
        match SqlitePlaylistStore::open(&path) {
            Ok(store) => return Some(store),
            Err(err) => warn!(
                "Failed to open playlist database {}: {}. Using an in-memory store",
                path.display(),
                err
            ),
        }
    }
    match SqlitePlaylistStore::new_in_memory() {
        Ok(store) => Some(store),
        Err(err) => {
            error!("Failed to create in-memory playlist store: {}", err);
            None
        }
    }
}

pub fn spawn_background_services(services: BackgroundServicesConfig) {
    let BackgroundServicesConfig {
        bus_sender,
        config,
        config_path,
    } = services;

    let playlist_manager_bus_receiver = bus_sender.subscribe();
    let playlist_manager_bus_sender = bus_sender.clone();
    let playlist_config = config.clone();
    spawn_named("playlist-manager", move || {
        let Some(store) = open_playlist_store(&playlist_config) else {
            return;
        };
        let mut playlist_manager = PlaylistManager::new(
            playlist_manager_bus_receiver,
            playlist_manager_bus_sender,
            store,
        );
        playlist_manager.run();
    });

    // The engine and the OS media surface are created on the session thread
    // so every call into them happens from that one thread.
    let session_bus_receiver = bus_sender.subscribe();
    let session_bus_sender = bus_sender.clone();
    let session_config = config.clone();
    spawn_named("playback-session", move || {
        let callbacks = Arc::new(BusEngineCallbacks::new(session_bus_sender.clone()));
        let engine = LocalEngine::spawn(callbacks);
        let bridge = MediaControlsBridge::from_config(&session_config, session_bus_sender.clone());
        let mut session = PlaybackSession::new(
            session_bus_receiver,
            session_bus_sender,
            engine,
            bridge,
            &session_config.playback,
        );
        session.run();
    });

    let coordinator_bus_receiver = bus_sender.subscribe();
    spawn_named("config-coordinator", move || {
        let mut coordinator = ConfigCoordinator::new(coordinator_bus_receiver, config, config_path);
        coordinator.run();
    });

    let reporter_bus_receiver = bus_sender.subscribe();
    spawn_named("console-reporter", move || {
        command_console::run_reporter(reporter_bus_receiver);
    });
}
