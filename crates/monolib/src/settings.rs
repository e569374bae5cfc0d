//! Per-session playback settings.
//!
//! Every ABI revision funnels into one [`Settings`] value; older call shapes simply leave
//! fields at their defaults.

use lonelyradio_types as wire;
pub use lonelyradio_types::Encoder;

use crate::error::{EngineError, EngineResult};

/// Largest cover edge (pixels) a client may request.
pub const MAX_COVER_SIZE: i32 = 4096;

const MAX_PLAYLIST_LEN: usize = 1024;

/// How cover art is requested and kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CoverMode {
    /// No cover is requested; any cover the server sends anyway is dropped.
    #[default]
    Disabled,
    /// Cover at its original size.
    Original,
    /// Cover scaled by the server so that its longest edge is at most this many pixels.
    MaxSize(u32),
}

impl CoverMode {
    /// Negative codes disable covers, `0` keeps the original, positive codes are a size.
    pub fn from_code(code: i32) -> EngineResult<Self> {
        match code {
            c if c < 0 => Ok(CoverMode::Disabled),
            0 => Ok(CoverMode::Original),
            c if c <= MAX_COVER_SIZE => Ok(CoverMode::MaxSize(c as u32)),
            c => Err(EngineError::InvalidSettings(format!(
                "cover size {c} exceeds {MAX_COVER_SIZE}"
            ))),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            CoverMode::Disabled => -1,
            CoverMode::Original => 0,
            CoverMode::MaxSize(px) => px as i32,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != CoverMode::Disabled
    }
}

/// Immutable configuration of one playback session.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub encoder: Encoder,
    pub cover: CoverMode,
    /// `None` plays every track the server has.
    pub playlist: Option<String>,
}

impl Default for Settings {
    /// What the oldest ABI revision (server address only) plays with.
    fn default() -> Self {
        Self {
            encoder: Encoder::Pcm16,
            cover: CoverMode::Disabled,
            playlist: None,
        }
    }
}

impl Settings {
    /// Validate raw codes coming across the C ABI.
    pub fn from_codes(encoder: u8, cover: i32, playlist: Option<&str>) -> EngineResult<Self> {
        let encoder = Encoder::from_u8(encoder)
            .map_err(|e| EngineError::InvalidSettings(e.to_string()))?;
        if !is_decodable(encoder) {
            return Err(EngineError::InvalidSettings(format!(
                "encoder {encoder} is not supported by this client"
            )));
        }
        Ok(Self {
            encoder,
            cover: CoverMode::from_code(cover)?,
            playlist: normalize_playlist(playlist)?,
        })
    }

    /// Settings as sent on the wire, with the encoder possibly replaced after negotiation.
    pub fn to_wire(&self, encoder: Encoder) -> wire::Settings {
        wire::Settings {
            encoder,
            cover: self.cover.code(),
        }
    }

    /// The playback request for this session.
    pub fn request(&self, encoder: Encoder) -> wire::Request {
        match &self.playlist {
            Some(name) => wire::Request::PlayPlaylist(name.clone(), self.to_wire(encoder)),
            None => wire::Request::Play(self.to_wire(encoder)),
        }
    }

    /// Pick the encoder to ask for given what the server offers.
    ///
    /// Falls back to `Pcm16`, which every server supports.
    pub fn negotiate_encoder(&self, offered: &[Encoder]) -> Encoder {
        if offered.contains(&self.encoder) {
            self.encoder
        } else {
            tracing::warn!(
                requested = %self.encoder,
                offered = ?offered,
                "server does not offer requested encoder; falling back to PCM16"
            );
            Encoder::Pcm16
        }
    }
}

/// Encoders the fragment decoder can handle.
pub fn is_decodable(encoder: Encoder) -> bool {
    matches!(
        encoder,
        Encoder::Pcm16 | Encoder::PcmFloat | Encoder::Flac | Encoder::Alac | Encoder::Vorbis
    )
}

fn normalize_playlist(playlist: Option<&str>) -> EngineResult<Option<String>> {
    let Some(name) = playlist else {
        return Ok(None);
    };
    if name.is_empty() {
        return Ok(None);
    }
    if name.len() > MAX_PLAYLIST_LEN {
        return Err(EngineError::InvalidSettings("playlist name too long".to_string()));
    }
    if name.contains(['\n', '\r', '\0']) {
        return Err(EngineError::InvalidSettings(format!(
            "playlist name {name:?} contains a line break"
        )));
    }
    Ok(Some(name.to_string()))
}
