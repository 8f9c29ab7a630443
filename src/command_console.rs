//! Line-oriented host console: parses user commands into bus messages and
//! prints session and playlist notifications.

use std::io::BufRead;
use std::path::PathBuf;

use log::{info, warn};
use thiserror::Error;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::playlist::PlaylistUpdate;
use crate::protocol::{Message, PlaylistMessage, SessionCommand, SessionNotification};

pub const HELP_TEXT: &str = "\
playlists                       list playlists
search <text>                   search playlists by name
open <playlist>                 show a playlist's tracks
play [<playlist> [index]]       play a playlist, or resume/restart
jump <index>                    play a queue position
pause | resume | toggle         transport
next | prev                     skip
seek <secs> | seek <pct>%       seek within the current track
volume <0-100>                  set volume
stop | retry | logout           stop, retry after an error, reset
show | hide                     page visibility (wake lock)
new <name> [-- description]     create a playlist
rename <playlist> <name>        rename a playlist
describe <playlist> <text>      set a playlist's description
delete <playlist>               delete a playlist
add <playlist> <file>           add a local audio file
remove <playlist> <track>       remove a track
reorder <playlist> <track>...   set the full track order
status                          print the session snapshot
quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleAction {
    Send(Message),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    #[error("unknown command '{0}' (try 'help')")]
    UnknownCommand(String),
    #[error("{command}: missing {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("{command}: invalid value '{value}'")]
    InvalidArgument {
        command: &'static str,
        value: String,
    },
}

fn session(command: SessionCommand) -> ConsoleAction {
    ConsoleAction::Send(Message::Session(command))
}

fn playlist(message: PlaylistMessage) -> ConsoleAction {
    ConsoleAction::Send(Message::Playlist(message))
}

fn required<'a>(
    value: Option<&'a str>,
    command: &'static str,
    argument: &'static str,
) -> Result<&'a str, ConsoleError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or(ConsoleError::MissingArgument { command, argument })
}

fn parse_number<T: std::str::FromStr>(command: &'static str, value: &str) -> Result<T, ConsoleError> {
    value.parse().map_err(|_| ConsoleError::InvalidArgument {
        command,
        value: value.to_string(),
    })
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleAction>, ConsoleError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let mut args = rest.split_whitespace();

    let action = match verb.to_ascii_lowercase().as_str() {
        "help" | "?" => ConsoleAction::Help,
        "quit" | "exit" => ConsoleAction::Quit,
        "playlists" => playlist(PlaylistMessage::ListPlaylists),
        "search" => playlist(PlaylistMessage::SearchPlaylists(rest.to_string())),
        "open" => playlist(PlaylistMessage::OpenPlaylist {
            id: required(args.next(), "open", "playlist id")?.to_string(),
        }),
        "play" => match args.next() {
            None => session(SessionCommand::Play),
            Some(id) => {
                let start_index = match args.next() {
                    Some(index) => parse_number("play", index)?,
                    None => 0,
                };
                playlist(PlaylistMessage::PlayPlaylist {
                    id: id.to_string(),
                    start_index,
                })
            }
        },
        "jump" => {
            let index = required(args.next(), "jump", "queue index")?;
            session(SessionCommand::PlayIndex(parse_number("jump", index)?))
        }
        "pause" => session(SessionCommand::Pause),
        "resume" => session(SessionCommand::Resume),
        "toggle" => session(SessionCommand::TogglePlayPause),
        "next" => session(SessionCommand::Next),
        "prev" | "previous" => session(SessionCommand::Previous),
        "seek" => {
            let target = required(args.next(), "seek", "position")?;
            match target.strip_suffix('%') {
                Some(percent) => {
                    let percent: f64 = parse_number("seek", percent)?;
                    session(SessionCommand::SeekToFraction(percent / 100.0))
                }
                None => session(SessionCommand::SeekTo(parse_number("seek", target)?)),
            }
        }
        "volume" => {
            let value = required(args.next(), "volume", "level")?;
            let volume: u8 = parse_number("volume", value)?;
            if volume > 100 {
                return Err(ConsoleError::InvalidArgument {
                    command: "volume",
                    value: value.to_string(),
                });
            }
            session(SessionCommand::SetVolume(volume))
        }
        "stop" => session(SessionCommand::Stop),
        "retry" => session(SessionCommand::Retry),
        "logout" => session(SessionCommand::Reset),
        "show" => session(SessionCommand::SetVisibility(true)),
        "hide" => session(SessionCommand::SetVisibility(false)),
        "status" => session(SessionCommand::PublishSnapshot),
        "new" => {
            let (name, description) = match rest.split_once("--") {
                Some((name, description)) => (name.trim(), description.trim()),
                None => (rest, ""),
            };
            playlist(PlaylistMessage::CreatePlaylist {
                name: required(Some(name), "new", "playlist name")?.to_string(),
                description: description.to_string(),
            })
        }
        "rename" => {
            let id = required(args.next(), "rename", "playlist id")?;
            let name = required(Some(rest[id.len()..].trim()), "rename", "playlist name")?;
            playlist(PlaylistMessage::UpdatePlaylist {
                id: id.to_string(),
                update: PlaylistUpdate {
                    name: Some(name.to_string()),
                    description: None,
                },
            })
        }
        "describe" => {
            let id = required(args.next(), "describe", "playlist id")?;
            playlist(PlaylistMessage::UpdatePlaylist {
                id: id.to_string(),
                update: PlaylistUpdate {
                    name: None,
                    description: Some(rest[id.len()..].trim().to_string()),
                },
            })
        }
        "delete" => playlist(PlaylistMessage::DeletePlaylist {
            id: required(args.next(), "delete", "playlist id")?.to_string(),
        }),
        "add" => {
            let playlist_id = required(args.next(), "add", "playlist id")?;
            let path = rest[playlist_id.len()..].trim();
            playlist(PlaylistMessage::AddLocalFile {
                playlist_id: playlist_id.to_string(),
                path: PathBuf::from(required(Some(path), "add", "file path")?),
            })
        }
        "remove" => {
            let playlist_id = required(args.next(), "remove", "playlist id")?;
            let track_id = required(args.next(), "remove", "track id")?;
            playlist(PlaylistMessage::RemoveTrack {
                playlist_id: playlist_id.to_string(),
                track_id: track_id.to_string(),
            })
        }
        "reorder" => {
            let playlist_id = required(args.next(), "reorder", "playlist id")?;
            let order: Vec<String> = args.map(ToString::to_string).collect();
            if order.is_empty() {
                return Err(ConsoleError::MissingArgument {
                    command: "reorder",
                    argument: "track ids",
                });
            }
            playlist(PlaylistMessage::ReorderTracks {
                playlist_id: playlist_id.to_string(),
                order,
            })
        }
        other => return Err(ConsoleError::UnknownCommand(other.to_string())),
    };
    Ok(Some(action))
}

/// Renders a bus message for the console, or `None` for traffic the user
/// does not need to see.
pub fn format_message(message: &Message) -> Option<String> {
    match message {
        Message::Notify(notification) => format_notification(notification),
        Message::Playlist(PlaylistMessage::PlaylistsListed(playlists)) => {
            if playlists.is_empty() {
                return Some("no playlists".to_string());
            }
            let lines: Vec<String> = playlists
                .iter()
                .map(|p| format!("{}  {} ({} tracks)", p.id, p.name, p.track_count))
                .collect();
            Some(lines.join("\n"))
        }
        Message::Playlist(PlaylistMessage::PlaylistOpened(snapshot)) => {
            let mut lines = vec![format!("{} ({} tracks)", snapshot.name, snapshot.tracks.len())];
            lines.extend(snapshot.tracks.iter().enumerate().map(|(index, track)| {
                format!("{:>3}. {}  {} - {}", index, track.id, track.artist, track.title)
            }));
            Some(lines.join("\n"))
        }
        Message::Playlist(PlaylistMessage::PlaylistCreated(summary)) => {
            Some(format!("created playlist {} ({})", summary.name, summary.id))
        }
        Message::Playlist(PlaylistMessage::PlaylistDeleted { id }) => {
            Some(format!("deleted playlist {}", id))
        }
        Message::Playlist(PlaylistMessage::TrackAdded { track, .. }) => {
            Some(format!("added {} ({})", track.title, track.id))
        }
        Message::Playlist(PlaylistMessage::SyncFailed { operation, message }) => {
            Some(format!("sync error during {}: {}", operation, message))
        }
        _ => None,
    }
}

fn format_notification(notification: &SessionNotification) -> Option<String> {
    match notification {
        SessionNotification::StateChanged { state, .. } => Some(format!("state: {:?}", state)),
        SessionNotification::TrackChanged {
            index,
            track,
            playlist_name,
        } => Some(format!(
            "now playing [{}] {} - {}{}",
            index,
            track.artist,
            track.title,
            playlist_name
                .as_deref()
                .map(|name| format!(" ({})", name))
                .unwrap_or_default()
        )),
        SessionNotification::VolumeChanged(volume) => Some(format!("volume: {}", volume)),
        SessionNotification::TrackFailed { index, error, .. } => {
            Some(format!("track [{}] failed: {}", index, error))
        }
        SessionNotification::CommandFailed { command, error } => {
            Some(format!("{} failed: {}", command, error))
        }
        SessionNotification::Halted { error } => Some(format!("playback halted: {}", error)),
        SessionNotification::Snapshot(snapshot) => match serde_json::to_string_pretty(snapshot) {
            Ok(json) => Some(json),
            Err(err) => Some(format!("failed to render status: {}", err)),
        },
        SessionNotification::Progress { .. } | SessionNotification::QueueChanged { .. } => None,
    }
}

/// Reads commands from `input` until EOF or `quit`.
pub struct CommandConsole {
    bus_producer: Sender<Message>,
}

impl CommandConsole {
    pub fn new(bus_producer: Sender<Message>) -> Self {
        Self { bus_producer }
    }

    pub fn run<R: BufRead>(&self, input: R) {
        println!("{}", HELP_TEXT);
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("CommandConsole: failed to read input: {}", err);
                    break;
                }
            };
            match parse_command(&line) {
                Ok(Some(ConsoleAction::Send(message))) => {
                    if self.bus_producer.send(message).is_err() {
                        warn!("CommandConsole: no listeners on the bus");
                    }
                }
                Ok(Some(ConsoleAction::Help)) => println!("{}", HELP_TEXT),
                Ok(Some(ConsoleAction::Quit)) => break,
                Ok(None) => {}
                Err(err) => println!("{}", err),
            }
        }
        info!("CommandConsole: input closed");
    }
}

/// Prints notifications until the bus closes.
pub fn run_reporter(mut bus_consumer: Receiver<Message>) {
    loop {
        match bus_consumer.blocking_recv() {
            Ok(message) => {
                if let Some(text) = format_message(&message) {
                    println!("{}", text);
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("CommandConsole: reporter lagged by {} messages", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
