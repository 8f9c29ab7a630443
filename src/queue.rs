//! Ordered playback queue with a current-position pointer.
//!
//! Pure data-structure logic: no I/O, never blocks. `current_index` is
//! `None` exactly when the queue is empty and always a valid position
//! otherwise.

use thiserror::Error;

use crate::playlist::Track;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Effect of [`QueueController::remove_by_id`] on the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotFound,
    /// A track other than the current one was removed.
    RemovedOther,
    /// The current track was removed; its successor (if any) is now current.
    RemovedCurrent { now_empty: bool },
}

#[derive(Debug, Clone, Default)]
pub struct QueueController {
    tracks: Vec<Track>,
    current_index: Option<usize>,
}

impl QueueController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the queue wholesale and points at the first track.
    pub fn load(&mut self, tracks: Vec<Track>) {
        self.current_index = if tracks.is_empty() { None } else { Some(0) };
        self.tracks = tracks;
    }

    pub fn clear(&mut self) {
        self.load(Vec::new());
    }

    pub fn set_current(&mut self, index: usize) -> Result<&Track, QueueError> {
        if index >= self.tracks.len() {
            return Err(QueueError::IndexOutOfRange {
                index,
                len: self.tracks.len(),
            });
        }
        self.current_index = Some(index);
        Ok(&self.tracks[index])
    }

    /// Advances by one. Returns `None` at the last track (no wraparound).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&Track> {
        let index = self.current_index?;
        if index + 1 >= self.tracks.len() {
            return None;
        }
        self.current_index = Some(index + 1);
        self.tracks.get(index + 1)
    }

    /// Steps back by one. Returns `None` at the first track (no wraparound).
    pub fn previous(&mut self) -> Option<&Track> {
        let index = self.current_index?;
        if index == 0 {
            return None;
        }
        self.current_index = Some(index - 1);
        self.tracks.get(index - 1)
    }

    pub fn remove_by_id(&mut self, id: &str) -> RemoveOutcome {
        let Some(position) = self.tracks.iter().position(|track| track.id == id) else {
            return RemoveOutcome::NotFound;
        };
        self.tracks.remove(position);

        let Some(current) = self.current_index else {
            return RemoveOutcome::RemovedOther;
        };

        if self.tracks.is_empty() {
            self.current_index = None;
            return RemoveOutcome::RemovedCurrent { now_empty: true };
        }

        if position < current {
            self.current_index = Some(current - 1);
            RemoveOutcome::RemovedOther
        } else if position == current {
            // The successor slides into the current slot; clamp when the
            // removed track was the last one.
            self.current_index = Some(current.min(self.tracks.len() - 1));
            RemoveOutcome::RemovedCurrent { now_empty: false }
        } else {
            RemoveOutcome::RemovedOther
        }
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.tracks.iter().position(|track| track.id == id)
    }

    pub fn current(&self) -> Option<&Track> {
        self.current_index.and_then(|index| self.tracks.get(index))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
