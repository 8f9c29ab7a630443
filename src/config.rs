//! Persistent application configuration model and defaults.

use std::path::PathBuf;

/// Root configuration persisted to `nmplay.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Playback timing and volume preferences.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// OS "now playing" integration.
    pub media_controls: MediaControlsConfig,
    #[serde(default)]
    /// Screen wake lock while playing.
    pub wake_lock: WakeLockConfig,
    #[serde(default)]
    /// Playlist store location.
    pub store: StoreConfig,
    #[serde(default)]
    /// Log verbosity.
    pub logging: LoggingConfig,
}

/// Playback session timing and volume preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    /// Window a `Loading` state may last before it surfaces as a load timeout.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// Cadence of progress updates while the engine is playing.
    #[serde(default = "default_time_update_interval_ms")]
    pub time_update_interval_ms: u64,
    /// Delay before an unplayable source is treated as ended.
    #[serde(default = "default_unplayable_skip_delay_ms")]
    pub unplayable_skip_delay_ms: u64,
    #[serde(default = "default_volume")]
    pub initial_volume: u8,
    /// Consecutive auto-skips before giving up; unset means queue length.
    #[serde(default)]
    pub max_consecutive_failures: Option<usize>,
}

/// OS media controls preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MediaControlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_dbus_name")]
    pub dbus_name: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct WakeLockConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StoreConfig {
    /// SQLite database path; defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_load_timeout_ms() -> u64 {
    15_000
}

fn default_time_update_interval_ms() -> u64 {
    1_000
}

fn default_unplayable_skip_delay_ms() -> u64 {
    1_000
}

fn default_volume() -> u8 {
    100
}

fn default_display_name() -> String {
    "NM Music".to_string()
}

fn default_dbus_name() -> String {
    "nmplay".to_string()
}

fn default_log_level() -> String {
    "debug".to_string()
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout_ms(),
            time_update_interval_ms: default_time_update_interval_ms(),
            unplayable_skip_delay_ms: default_unplayable_skip_delay_ms(),
            initial_volume: default_volume(),
            max_consecutive_failures: None,
        }
    }
}

impl Default for MediaControlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            display_name: default_display_name(),
            dbus_name: default_dbus_name(),
        }
    }
}

impl Default for WakeLockConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Clamps values loaded from disk into their supported ranges.
    pub fn sanitized(self) -> Self {
        let playback = PlaybackConfig {
            load_timeout_ms: self.playback.load_timeout_ms.clamp(1_000, 120_000),
            time_update_interval_ms: self.playback.time_update_interval_ms.clamp(100, 10_000),
            unplayable_skip_delay_ms: self.playback.unplayable_skip_delay_ms.min(10_000),
            initial_volume: self.playback.initial_volume.min(100),
            max_consecutive_failures: self
                .playback
                .max_consecutive_failures
                .map(|limit| limit.max(1)),
        };
        Self { playback, ..self }
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.logging.level.trim().to_ascii_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Debug,
        }
    }
}
