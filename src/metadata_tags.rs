//! Tag readers backed by `lofty`, used when adding local files to a playlist.

use std::path::Path;

use lofty::file::{AudioFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::read_from_path;
use lofty::tag::Tag;
use log::debug;

use crate::playlist::NewTrack;

fn first_non_empty_value<F>(primary_tag: Option<&Tag>, tags: &[Tag], mut extractor: F) -> String
where
    F: FnMut(&Tag) -> Option<String>,
{
    primary_tag
        .into_iter()
        .chain(tags.iter())
        .filter_map(|tag| extractor(tag))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

fn file_stem_title(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Builds a playlist entry for a local audio file. Unreadable tags fall
/// back to the file stem as title, no artist and an unknown duration.
pub fn new_track_from_file(path: &Path) -> NewTrack {
    let fallback = NewTrack {
        source_id: path.to_string_lossy().into_owned(),
        title: file_stem_title(path),
        artist: None,
        thumbnail: None,
        duration_secs: None,
    };

    let tagged_file = match read_from_path(path) {
        Ok(file) => file,
        Err(err) => {
            debug!("metadata_tags: no tags for {}: {}", path.display(), err);
            return fallback;
        }
    };
    let primary_tag = tagged_file.primary_tag();
    let tags = tagged_file.tags();

    let title = first_non_empty_value(primary_tag, tags, |tag| {
        tag.title().map(|value| value.into_owned())
    });
    let artist = first_non_empty_value(primary_tag, tags, |tag| {
        tag.artist().map(|value| value.into_owned())
    });
    let duration = tagged_file.properties().duration().as_secs_f64();

    NewTrack {
        title: non_empty(title).unwrap_or(fallback.title),
        artist: non_empty(artist),
        duration_secs: (duration > 0.0).then_some(duration),
        ..fallback
    }
}
