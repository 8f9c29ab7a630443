//! Persistence contract for playlists and their tracks.

use thiserror::Error;

use crate::playlist::{NewTrack, PlaylistSnapshot, PlaylistSummary, PlaylistUpdate, Track};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("playlist name must not be empty")]
    InvalidName,
    #[error("new order for playlist {playlist_id} does not match its tracks")]
    InvalidOrder { playlist_id: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Playlist storage. Reads return fresh copies; the session never holds a
/// live view into the store.
pub trait PlaylistStore {
    /// All playlists, most recently updated first.
    fn list_playlists(&self) -> Result<Vec<PlaylistSummary>, StoreError>;
    /// Case-insensitive substring match on playlist names.
    fn search_playlists(&self, query: &str) -> Result<Vec<PlaylistSummary>, StoreError>;
    fn fetch_playlist(&self, id: &str) -> Result<PlaylistSnapshot, StoreError>;
    fn create_playlist(
        &mut self,
        name: &str,
        description: &str,
    ) -> Result<PlaylistSummary, StoreError>;
    /// Renames a playlist and/or edits its description.
    fn update_playlist(
        &mut self,
        id: &str,
        update: PlaylistUpdate,
    ) -> Result<PlaylistSummary, StoreError>;
    fn delete_playlist(&mut self, id: &str) -> Result<(), StoreError>;
    /// Appends a track and returns it with its assigned id.
    fn add_track(&mut self, playlist_id: &str, track: NewTrack) -> Result<Track, StoreError>;
    fn remove_track(&mut self, playlist_id: &str, track_id: &str) -> Result<(), StoreError>;
    /// `order` must list every track id of the playlist exactly once.
    fn reorder_tracks(&mut self, playlist_id: &str, order: &[String]) -> Result<(), StoreError>;
}
