//! Playlist and track value types shared by the store, the queue and the UI.

use serde::{Deserialize, Serialize};

/// Artist label used when a track has no artist metadata.
pub const UNKNOWN_ARTIST: &str = "unknown";

/// One playable item. Immutable once it is part of a queue snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Stable track id inside its playlist.
    pub id: String,
    /// Engine-specific source identifier (a file path for the local engine).
    pub source_id: String,
    pub title: String,
    pub artist: String,
    /// Thumbnail/artwork reference, if any.
    pub thumbnail: Option<String>,
    /// Duration in seconds; `None` until resolved.
    pub duration_secs: Option<f64>,
}

impl Track {
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            title: title.into(),
            artist: UNKNOWN_ARTIST.to_string(),
            thumbnail: None,
            duration_secs: None,
        }
    }

    pub fn with_artist(mut self, artist: Option<&str>) -> Self {
        self.artist = normalize_artist(artist);
        self
    }
}

/// Track payload submitted to the store before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrack {
    pub source_id: String,
    pub title: String,
    pub artist: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Minimal playlist metadata used for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub track_count: usize,
}

/// Partial edit of playlist metadata; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Full playlist read from the store at an explicit reload point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    pub id: String,
    pub name: String,
    pub tracks: Vec<Track>,
}

/// Trims an artist label and falls back to [`UNKNOWN_ARTIST`].
pub fn normalize_artist(artist: Option<&str>) -> String {
    artist
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| UNKNOWN_ARTIST.to_string())
}
