use std::path::Path;

use log::{debug, info, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::{
    metadata_tags,
    playlist::NewTrack,
    playlist_store::{PlaylistStore, StoreError},
    protocol::{self, PlaylistMessage, SessionCommand},
};

// Owns the playlist store and turns playlist commands into store calls and
// reload snapshots. It never touches playback state directly; playing a
// playlist is a `PlayQueue` command for the session.
pub struct PlaylistManager<S: PlaylistStore> {
    bus_consumer: Receiver<protocol::Message>,
    bus_producer: Sender<protocol::Message>,
    store: S,
}

impl<S: PlaylistStore> PlaylistManager<S> {
    pub fn new(
        bus_consumer: Receiver<protocol::Message>,
        bus_producer: Sender<protocol::Message>,
        store: S,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            store,
        }
    }

    fn send(&self, message: PlaylistMessage) {
        let _ = self
            .bus_producer
            .send(protocol::Message::Playlist(message));
    }

    fn report_failure(&self, operation: &str, err: StoreError) {
        warn!("PlaylistManager: {} failed: {}", operation, err);
        self.send(PlaylistMessage::SyncFailed {
            operation: operation.to_string(),
            message: err.to_string(),
        });
    }

    /// Re-reads a playlist after a mutation so the session can refresh its
    /// queue from the source of truth.
    fn publish_refreshed(&self, playlist_id: &str) {
        match self.store.fetch_playlist(playlist_id) {
            Ok(snapshot) => self.send(PlaylistMessage::PlaylistRefreshed(snapshot)),
            Err(err) => self.report_failure("refresh", err),
        }
    }

    fn add_track(&mut self, playlist_id: &str, track: NewTrack) {
        match self.store.add_track(playlist_id, track) {
            Ok(track) => {
                debug!(
                    "PlaylistManager: added '{}' to playlist {}",
                    track.title, playlist_id
                );
                self.send(PlaylistMessage::TrackAdded {
                    playlist_id: playlist_id.to_string(),
                    track,
                });
                self.publish_refreshed(playlist_id);
            }
            Err(err) => self.report_failure("add_track", err),
        }
    }

    fn add_local_file(&mut self, playlist_id: &str, path: &Path) {
        if !path.is_file() {
            self.report_failure(
                "add_local_file",
                StoreError::NotFound {
                    entity: "file",
                    id: path.display().to_string(),
                },
            );
            return;
        }
        let track = metadata_tags::new_track_from_file(path);
        self.add_track(playlist_id, track);
    }

    fn handle_message(&mut self, message: PlaylistMessage) {
        match message {
            PlaylistMessage::ListPlaylists => match self.store.list_playlists() {
                Ok(playlists) => self.send(PlaylistMessage::PlaylistsListed(playlists)),
                Err(err) => self.report_failure("list_playlists", err),
            },
            PlaylistMessage::SearchPlaylists(query) => {
                match self.store.search_playlists(&query) {
                    Ok(playlists) => self.send(PlaylistMessage::PlaylistsListed(playlists)),
                    Err(err) => self.report_failure("search_playlists", err),
                }
            }
            PlaylistMessage::OpenPlaylist { id } => match self.store.fetch_playlist(&id) {
                Ok(snapshot) => self.send(PlaylistMessage::PlaylistOpened(snapshot)),
                Err(err) => self.report_failure("open_playlist", err),
            },
            PlaylistMessage::PlayPlaylist { id, start_index } => {
                match self.store.fetch_playlist(&id) {
                    Ok(snapshot) => {
                        info!(
                            "PlaylistManager: playing '{}' from index {}",
                            snapshot.name, start_index
                        );
                        let _ = self.bus_producer.send(protocol::Message::Session(
                            SessionCommand::PlayQueue {
                                snapshot,
                                start_index,
                            },
                        ));
                    }
                    Err(err) => self.report_failure("play_playlist", err),
                }
            }
            PlaylistMessage::CreatePlaylist { name, description } => {
                match self.store.create_playlist(&name, &description) {
                    Ok(summary) => self.send(PlaylistMessage::PlaylistCreated(summary)),
                    Err(err) => self.report_failure("create_playlist", err),
                }
            }
            PlaylistMessage::UpdatePlaylist { id, update } => {
                match self.store.update_playlist(&id, update) {
                    Ok(summary) => {
                        debug!("PlaylistManager: updated playlist '{}'", summary.name);
                        self.publish_refreshed(&id);
                    }
                    Err(err) => self.report_failure("update_playlist", err),
                }
            }
            PlaylistMessage::DeletePlaylist { id } => match self.store.delete_playlist(&id) {
                Ok(()) => self.send(PlaylistMessage::PlaylistDeleted { id }),
                Err(err) => self.report_failure("delete_playlist", err),
            },
            PlaylistMessage::AddTrack { playlist_id, track } => {
                self.add_track(&playlist_id, track);
            }
            PlaylistMessage::AddLocalFile { playlist_id, path } => {
                self.add_local_file(&playlist_id, &path);
            }
            PlaylistMessage::RemoveTrack {
                playlist_id,
                track_id,
            } => match self.store.remove_track(&playlist_id, &track_id) {
                Ok(()) => {
                    self.send(PlaylistMessage::TrackRemoved {
                        playlist_id: playlist_id.clone(),
                        track_id,
                    });
                    self.publish_refreshed(&playlist_id);
                }
                Err(err) => self.report_failure("remove_track", err),
            },
            PlaylistMessage::ReorderTracks { playlist_id, order } => {
                match self.store.reorder_tracks(&playlist_id, &order) {
                    Ok(()) => self.publish_refreshed(&playlist_id),
                    Err(err) => self.report_failure("reorder_tracks", err),
                }
            }
            PlaylistMessage::PlaylistsListed(_)
            | PlaylistMessage::PlaylistOpened(_)
            | PlaylistMessage::PlaylistRefreshed(_)
            | PlaylistMessage::PlaylistCreated(_)
            | PlaylistMessage::PlaylistDeleted { .. }
            | PlaylistMessage::TrackAdded { .. }
            | PlaylistMessage::TrackRemoved { .. }
            | PlaylistMessage::SyncFailed { .. } => {}
        }
    }

    pub fn run(&mut self) {
        info!("PlaylistManager: started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(protocol::Message::Playlist(message)) => self.handle_message(message),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("PlaylistManager: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
