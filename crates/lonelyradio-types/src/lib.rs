//! Wire types of the lonelyradio streaming protocol.
//!
//! Connection flow (client view):
//! - write `HELLO_MAGIC` as u64 LE
//! - read [`ServerCapabilities`]
//! - write one [`Request`], read one [`RequestResult`]
//! - for playback requests, then read repeated [`Message`]s:
//!   - `T`: a new track begins ([`TrackMetadata`])
//!   - `F`: a fragment header ([`FragmentMetadata`]) followed by `length` payload bytes
//!
//! Structured values are MessagePack (named fields) via `rmp-serde`.

use std::fmt;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const HELLO_MAGIC: u64 = 0x104e1374d10;

/// Upper bound for a single fragment payload. Anything larger is treated as a corrupt stream.
pub const MAX_FRAGMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Audio encoders a server may offer. The discriminants are the codes shared with clients.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Encoder {
    Pcm16 = 0,
    PcmFloat = 1,
    Flac = 2,
    Alac = 3,
    WavPack = 4,
    Opus = 5,
    Aac = 6,
    Vorbis = 7,
    Sea = 8,
}

impl Encoder {
    pub fn from_u8(b: u8) -> io::Result<Self> {
        let e = match b {
            0 => Encoder::Pcm16,
            1 => Encoder::PcmFloat,
            2 => Encoder::Flac,
            3 => Encoder::Alac,
            4 => Encoder::WavPack,
            5 => Encoder::Opus,
            6 => Encoder::Aac,
            7 => Encoder::Vorbis,
            8 => Encoder::Sea,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown encoder code {b}"),
                ));
            }
        };
        Ok(e)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// `true` for uncompressed encoders whose payload is raw little-endian samples.
    pub fn is_pcm(self) -> bool {
        matches!(self, Encoder::Pcm16 | Encoder::PcmFloat)
    }
}

impl fmt::Display for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoder::Pcm16 => "PCM16",
            Encoder::PcmFloat => "PCM_F32",
            Encoder::Flac => "FLAC",
            Encoder::Alac => "ALAC",
            Encoder::WavPack => "WAVPACK",
            Encoder::Opus => "OPUS",
            Encoder::Aac => "AAC",
            Encoder::Vorbis => "VORBIS",
            Encoder::Sea => "SEA",
        };
        f.write_str(name)
    }
}

/// Per-connection playback settings sent by the client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(rename = "e")]
    pub encoder: Encoder,
    /// Cover size in pixels; `0` keeps the original, negative disables covers.
    #[serde(rename = "co")]
    pub cover: i32,
}

/// Server reply to the hello magic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServerCapabilities {
    pub encoders: Vec<Encoder>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Request {
    Play(Settings),
    ListPlaylist,
    PlayPlaylist(String, Settings),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RequestResult {
    Ok,
    Playlist(PlaylistResponse),
    Error(RequestError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlaylistResponse {
    pub lists: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestError {
    NoSuchPlaylist,
    WrongCoverSize,
    UnsupportedEncoder,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RequestError::NoSuchPlaylist => "no such playlist",
            RequestError::WrongCoverSize => "wrong cover size",
            RequestError::UnsupportedEncoder => "unsupported encoder",
        };
        f.write_str(msg)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Message {
    T(TrackMetadata),
    F(FragmentMetadata),
}

/// Track boundary announcement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackMetadata {
    pub track_length_secs: u64,
    pub track_length_frac: f32,
    pub channels: u16,
    pub sample_rate: u32,
    pub encoder: Encoder,
    /// JPEG bytes when the client asked for covers and the track has one.
    pub cover: Option<Vec<u8>>,
    pub title: String,
    pub album: String,
    pub artist: String,
}

impl TrackMetadata {
    /// Total track length in seconds, `None` for live sources that announce zero.
    pub fn length_seconds(&self) -> Option<f32> {
        let total = self.track_length_secs as f32 + self.track_length_frac;
        if total > 0.0 { Some(total) } else { None }
    }
}

/// Header of one audio fragment; `length` payload bytes follow it on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FragmentMetadata {
    pub length: u64,
    /// Decoder configuration for codecs that need one (ALAC).
    pub magic_cookie: Option<Vec<u8>>,
}

/// Client side of the connection prelude.
pub fn write_hello(mut w: impl Write) -> io::Result<()> {
    w.write_all(&HELLO_MAGIC.to_le_bytes())?;
    w.flush()
}

/// Server side of the connection prelude.
pub fn read_hello(mut r: impl Read) -> io::Result<()> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if u64::from_le_bytes(magic) != HELLO_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad hello magic"));
    }
    Ok(())
}

/// Encode a value into a single MessagePack buffer.
pub fn encode_message<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Write one MessagePack value.
pub fn write_message<T: Serialize>(mut w: impl Write, value: &T) -> io::Result<()> {
    let buf = encode_message(value)?;
    w.write_all(&buf)?;
    w.flush()
}

/// Read one MessagePack value.
///
/// Transport failures keep their original [`io::ErrorKind`] (EOF stays `UnexpectedEof`);
/// malformed data is reported as `InvalidData`.
pub fn read_message<T: DeserializeOwned>(mut r: impl Read) -> io::Result<T> {
    rmp_serde::from_read(&mut r).map_err(|e| match e {
        rmp_serde::decode::Error::InvalidMarkerRead(io) | rmp_serde::decode::Error::InvalidDataRead(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    })
}

/// Read the payload that follows a fragment header.
pub fn read_fragment_payload(mut r: impl Read, header: &FragmentMetadata) -> io::Result<Vec<u8>> {
    if header.length > MAX_FRAGMENT_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("fragment of {} bytes exceeds limit", header.length),
        ));
    }
    let mut payload = vec![0u8; header.length as usize];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

/// Write a fragment header followed by its payload.
pub fn write_fragment(mut w: impl Write, payload: &[u8], magic_cookie: Option<Vec<u8>>) -> io::Result<()> {
    let header = Message::F(FragmentMetadata {
        length: payload.len() as u64,
        magic_cookie,
    });
    let mut buf = encode_message(&header)?;
    buf.extend_from_slice(payload);
    w.write_all(&buf)?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn track() -> TrackMetadata {
        TrackMetadata {
            track_length_secs: 215,
            track_length_frac: 0.5,
            channels: 2,
            sample_rate: 44_100,
            encoder: Encoder::Flac,
            cover: None,
            title: "So What".to_string(),
            album: "Kind of Blue".to_string(),
            artist: "Miles Davis".to_string(),
        }
    }

    #[test]
    fn hello_accepts_magic() {
        let mut buf = Vec::new();
        write_hello(&mut buf).unwrap();
        assert_eq!(buf.len(), 8);
        read_hello(Cursor::new(buf)).unwrap();
    }

    #[test]
    fn hello_rejects_bad_magic() {
        let err = read_hello(Cursor::new(vec![0u8; 8])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn encoder_codes_match_shared_enumeration() {
        for code in 0..=8u8 {
            assert_eq!(Encoder::from_u8(code).unwrap().code(), code);
        }
        assert_eq!(Encoder::from_u8(7).unwrap(), Encoder::Vorbis);
        let err = Encoder::from_u8(9).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn stream_of_track_and_fragment_reads_back_in_order() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::T(track())).unwrap();
        write_fragment(&mut wire, &[1, 2, 3, 4], None).unwrap();

        let mut cur = Cursor::new(wire);
        let first: Message = read_message(&mut cur).unwrap();
        assert_eq!(first, Message::T(track()));

        let Message::F(header) = read_message::<Message>(&mut cur).unwrap() else {
            panic!("expected fragment header");
        };
        assert_eq!(header.length, 4);
        assert_eq!(read_fragment_payload(&mut cur, &header).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn read_message_reports_eof_as_unexpected_eof() {
        let err = read_message::<Message>(Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_message_rejects_garbage() {
        let err = read_message::<ServerCapabilities>(Cursor::new(vec![0xc1, 0xc1])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn fragment_payload_rejects_oversized_header() {
        let header = FragmentMetadata {
            length: MAX_FRAGMENT_BYTES + 1,
            magic_cookie: None,
        };
        let err = read_fragment_payload(Cursor::new(Vec::new()), &header).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn length_seconds_is_none_for_live_sources() {
        let mut md = track();
        assert_eq!(md.length_seconds(), Some(215.5));
        md.track_length_secs = 0;
        md.track_length_frac = 0.0;
        assert_eq!(md.length_seconds(), None);
    }
}
