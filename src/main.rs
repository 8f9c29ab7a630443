mod app_bootstrap;
mod app_config_coordinator;
mod command_console;
mod config;
mod config_persistence;
mod db_manager;
mod media_controls_bridge;
mod metadata_tags;
mod playback_session;
mod player;
mod playlist;
mod playlist_manager;
mod playlist_store;
mod protocol;
mod queue;
mod wake_lock;

use std::io;

use app_bootstrap::services::{spawn_background_services, BackgroundServicesConfig};
use command_console::CommandConsole;
use config_persistence::{default_config_path, load_config_file};
use log::info;
use tokio::sync::broadcast;

const LOG_LEVEL_ENV: &str = "NMPLAY_LOG";

fn log_level_override() -> Option<log::LevelFilter> {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Trace);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_path = default_config_path();
    let config = load_config_file(&config_path);
    log::set_max_level(log_level_override().unwrap_or_else(|| config.log_level_filter()));

    info!("Using config file {}", config_path.display());

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel(1024);

    spawn_background_services(BackgroundServicesConfig {
        bus_sender: bus_sender.clone(),
        config,
        config_path,
    });

    let console = CommandConsole::new(bus_sender);
    console.run(io::stdin().lock());
    Ok(())
}
