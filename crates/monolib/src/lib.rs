//! Streaming client engine for lonelyradio servers.
//!
//! [`Player`] connects to a server, decodes the track stream and plays it on an output
//! backend. The [`c`] module exposes the same engine to native hosts.

pub mod c;
pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod metadata;
pub mod output;
pub mod player;
pub mod queue;
pub mod reader;
pub mod resample;
pub mod settings;
pub mod state;

mod buffer;
mod playback;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, load_xor_key};
pub use error::{EngineError, EngineResult};
pub use metadata::TrackMetadata;
pub use output::{CpalOutput, NullOutput, OutputBackend, PlaybackControl};
pub use player::Player;
pub use reader::{DownloadedTrack, format_playlist_listing, get_track, list_playlists, parse_playlist_listing};
pub use resample::OutputFormat;
pub use settings::{CoverMode, Encoder, Settings};
pub use state::PlaybackState;
