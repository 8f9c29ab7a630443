use std::path::{Path, PathBuf};

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::playlist::{
    normalize_artist, NewTrack, PlaylistSnapshot, PlaylistSummary, PlaylistUpdate, Track,
};
use crate::playlist_store::{PlaylistStore, StoreError};

/// SQLite-backed [`PlaylistStore`].
pub struct SqlitePlaylistStore {
    conn: Connection,
}

impl SqlitePlaylistStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StoreError::Backend(format!(
                        "could not create data directory {}: {}",
                        parent.display(),
                        err
                    ))
                })?;
            }
        }
        info!("SqlitePlaylistStore: opening {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    pub fn default_database_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("nmplay").join("playlists.db"))
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS playlists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                revision INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS tracks (
                id TEXT PRIMARY KEY,
                playlist_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                title TEXT NOT NULL,
                artist TEXT NOT NULL,
                thumbnail TEXT,
                duration_secs REAL,
                FOREIGN KEY(playlist_id) REFERENCES playlists(id)
            )",
            [],
        )?;
        Ok(())
    }

    fn ensure_playlist(&self, id: &str) -> Result<(), StoreError> {
        let exists = self
            .conn
            .query_row("SELECT 1 FROM playlists WHERE id = ?1", params![id], |_| {
                Ok(())
            })
            .optional()?;
        match exists {
            Some(()) => Ok(()),
            None => Err(StoreError::NotFound {
                entity: "playlist",
                id: id.to_string(),
            }),
        }
    }

    fn summaries(&self, name_filter: Option<&str>) -> Result<Vec<PlaylistSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.name, p.description,
                    (SELECT COUNT(*) FROM tracks t WHERE t.playlist_id = p.id)
             FROM playlists p
             WHERE ?1 IS NULL OR instr(lower(p.name), lower(?1)) > 0
             ORDER BY p.revision DESC, p.name ASC",
        )?;
        let rows = stmt.query_map(params![name_filter], |row| {
            Ok(PlaylistSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                track_count: row.get::<_, i64>(3)?.max(0) as usize,
            })
        })?;

        let mut playlists = Vec::new();
        for playlist in rows {
            playlists.push(playlist?);
        }
        Ok(playlists)
    }

    fn track_ids(&self, playlist_id: &str) -> Result<Vec<String>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM tracks WHERE playlist_id = ?1 ORDER BY position ASC")?;
        let rows = stmt.query_map(params![playlist_id], |row| row.get::<_, String>(0))?;
        rows.collect()
    }
}

/// Marks a playlist as the most recently updated one.
fn bump_revision(conn: &Connection, playlist_id: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE playlists
         SET revision = (SELECT COALESCE(MAX(revision), 0) + 1 FROM playlists)
         WHERE id = ?1",
        params![playlist_id],
    )?;
    Ok(())
}

impl PlaylistStore for SqlitePlaylistStore {
    fn list_playlists(&self) -> Result<Vec<PlaylistSummary>, StoreError> {
        self.summaries(None)
    }

    fn search_playlists(&self, query: &str) -> Result<Vec<PlaylistSummary>, StoreError> {
        self.summaries(Some(query.trim()))
    }

    fn fetch_playlist(&self, id: &str) -> Result<PlaylistSnapshot, StoreError> {
        let name: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM playlists WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(name) = name else {
            return Err(StoreError::NotFound {
                entity: "playlist",
                id: id.to_string(),
            });
        };

        let mut stmt = self.conn.prepare(
            "SELECT id, source_id, title, artist, thumbnail, duration_secs
             FROM tracks WHERE playlist_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(Track {
                id: row.get(0)?,
                source_id: row.get(1)?,
                title: row.get(2)?,
                artist: row.get(3)?,
                thumbnail: row.get(4)?,
                duration_secs: row.get(5)?,
            })
        })?;

        let mut tracks = Vec::new();
        for track in rows {
            tracks.push(track?);
        }
        Ok(PlaylistSnapshot {
            id: id.to_string(),
            name,
            tracks,
        })
    }

    fn create_playlist(
        &mut self,
        name: &str,
        description: &str,
    ) -> Result<PlaylistSummary, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO playlists (id, name, description, revision)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(revision), 0) + 1 FROM playlists))",
            params![id, name, description.trim()],
        )?;
        debug!("SqlitePlaylistStore: created playlist {} ({})", name, id);
        Ok(PlaylistSummary {
            id,
            name: name.to_string(),
            description: description.trim().to_string(),
            track_count: 0,
        })
    }

    fn update_playlist(
        &mut self,
        id: &str,
        update: PlaylistUpdate,
    ) -> Result<PlaylistSummary, StoreError> {
        let name = match update.name.as_deref().map(str::trim) {
            Some("") => return Err(StoreError::InvalidName),
            name => name,
        };
        let description = update.description.as_deref().map(str::trim);

        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE playlists
             SET name = COALESCE(?2, name), description = COALESCE(?3, description)
             WHERE id = ?1",
            params![id, name, description],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "playlist",
                id: id.to_string(),
            });
        }
        bump_revision(&tx, id)?;
        tx.commit()?;
        debug!("SqlitePlaylistStore: updated playlist {}", id);

        self.summaries(None)?
            .into_iter()
            .find(|summary| summary.id == id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "playlist",
                id: id.to_string(),
            })
    }

    fn delete_playlist(&mut self, id: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tracks WHERE playlist_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM playlists WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                entity: "playlist",
                id: id.to_string(),
            });
        }
        tx.commit()?;
        Ok(())
    }

    fn add_track(&mut self, playlist_id: &str, track: NewTrack) -> Result<Track, StoreError> {
        self.ensure_playlist(playlist_id)?;
        let title = match track.title.trim() {
            "" => track.source_id.clone(),
            title => title.to_string(),
        };
        let stored = Track {
            id: Uuid::new_v4().to_string(),
            source_id: track.source_id,
            title,
            artist: normalize_artist(track.artist.as_deref()),
            thumbnail: track.thumbnail,
            duration_secs: track.duration_secs.filter(|secs| secs.is_finite() && *secs > 0.0),
        };

        let tx = self.conn.transaction()?;
        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM tracks WHERE playlist_id = ?1",
            params![playlist_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO tracks (id, playlist_id, source_id, position, title, artist, thumbnail, duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stored.id,
                playlist_id,
                stored.source_id,
                position,
                stored.title,
                stored.artist,
                stored.thumbnail,
                stored.duration_secs
            ],
        )?;
        bump_revision(&tx, playlist_id)?;
        tx.commit()?;
        Ok(stored)
    }

    fn remove_track(&mut self, playlist_id: &str, track_id: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let position: Option<i64> = tx
            .query_row(
                "SELECT position FROM tracks WHERE id = ?1 AND playlist_id = ?2",
                params![track_id, playlist_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(position) = position else {
            return Err(StoreError::NotFound {
                entity: "track",
                id: track_id.to_string(),
            });
        };

        tx.execute("DELETE FROM tracks WHERE id = ?1", params![track_id])?;
        tx.execute(
            "UPDATE tracks SET position = position - 1 WHERE playlist_id = ?1 AND position > ?2",
            params![playlist_id, position],
        )?;
        bump_revision(&tx, playlist_id)?;
        tx.commit()?;
        Ok(())
    }

    fn reorder_tracks(&mut self, playlist_id: &str, order: &[String]) -> Result<(), StoreError> {
        self.ensure_playlist(playlist_id)?;
        let mut current = self.track_ids(playlist_id)?;
        let mut requested = order.to_vec();
        current.sort();
        requested.sort();
        if current != requested {
            return Err(StoreError::InvalidOrder {
                playlist_id: playlist_id.to_string(),
            });
        }

        let tx = self.conn.transaction()?;
        for (position, track_id) in order.iter().enumerate() {
            tx.execute(
                "UPDATE tracks SET position = ?1 WHERE id = ?2",
                params![position as i64, track_id],
            )?;
        }
        bump_revision(&tx, playlist_id)?;
        tx.commit()?;
        Ok(())
    }
}
