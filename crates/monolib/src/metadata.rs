//! Current-track metadata shared between the stream reader and the control API.

use std::sync::{Arc, RwLock};

use lonelyradio_types as wire;

use crate::settings::{CoverMode, Encoder};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Metadata of the track currently being streamed.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackMetadata {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    /// `None` for live sources.
    pub length_seconds: Option<f32>,
    /// JPEG bytes, shared with every reader that asked for them.
    pub cover: Option<Arc<[u8]>>,
    pub sample_rate: u32,
    pub channels: u16,
    pub encoder: Encoder,
}

impl TrackMetadata {
    /// Build from a track announcement, keeping the cover only when covers were requested
    /// and the bytes look like a JPEG.
    pub fn from_wire(md: wire::TrackMetadata, cover_mode: CoverMode) -> Self {
        let length_seconds = md.length_seconds();
        let cover = match md.cover {
            Some(bytes) if cover_mode.is_enabled() && bytes.starts_with(&JPEG_SOI) => {
                Some(Arc::from(bytes))
            }
            Some(bytes) if cover_mode.is_enabled() => {
                tracing::debug!(len = bytes.len(), "dropping cover without JPEG signature");
                None
            }
            _ => None,
        };
        Self {
            artist: non_empty(md.artist),
            album: non_empty(md.album),
            title: non_empty(md.title),
            length_seconds,
            cover,
            sample_rate: md.sample_rate,
            channels: md.channels,
            encoder: md.encoder,
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Holder of the current [`TrackMetadata`]; always replaced as a whole.
#[derive(Default)]
pub struct MetadataStore {
    current: RwLock<Option<Arc<TrackMetadata>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current track. Fields read from one snapshot always belong together.
    pub fn current(&self) -> Option<Arc<TrackMetadata>> {
        self.current.read().unwrap().clone()
    }

    pub fn replace(&self, md: TrackMetadata) {
        *self.current.write().unwrap() = Some(Arc::new(md));
    }

    pub fn clear(&self) {
        *self.current.write().unwrap() = None;
    }
}
