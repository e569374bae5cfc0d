//! Stream reader: connection setup, negotiation and the stream loop.
//!
//! The handshake runs on the caller's thread with a read timeout so `start` can report
//! connection problems synchronously. After that the reader worker owns the socket,
//! decodes every fragment, converts it to the output format and pushes it into the
//! bounded queue. Backpressure comes from the queue: a full queue blocks the reader,
//! which in turn stops reading from the socket.
//!
//! Servers configured with an XOR key scramble everything they send after accepting a
//! play request; [`XorReader`] undoes that before any message is parsed.

use std::io::{self, BufReader, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lonelyradio_types::{self as wire, Message, Request, RequestResult, ServerCapabilities};

use crate::config::EngineConfig;
use crate::decode::{TrackFormat, decode_fragment};
use crate::error::{EngineError, EngineResult};
use crate::metadata::{MetadataStore, TrackMetadata};
use crate::queue::SharedAudio;
use crate::resample::{OutputFormat, TrackConverter};
use crate::settings::{CoverMode, Encoder, Settings};
use crate::state::SessionId;

/// Open a TCP connection to `server` (`host:port`).
pub fn connect(server: &str, timeout: Duration) -> EngineResult<TcpStream> {
    let addrs = server
        .to_socket_addrs()
        .map_err(|e| EngineError::ConnectionFailure(format!("resolve {server}: {e}")))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::debug!(server, %addr, "connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(server, %addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(EngineError::ConnectionFailure(match last_err {
        Some(e) => format!("connect {server}: {e}"),
        None => format!("{server} resolved to no addresses"),
    }))
}

/// Hello and capability exchange. Returns the encoders the server offers.
fn hello(stream: &mut TcpStream) -> EngineResult<Vec<Encoder>> {
    wire::write_hello(&mut *stream)?;
    let caps: ServerCapabilities = wire::read_message(&mut *stream)?;
    tracing::debug!(encoders = ?caps.encoders, "server capabilities");
    Ok(caps.encoders)
}

fn request(stream: &mut TcpStream, req: &Request) -> EngineResult<RequestResult> {
    wire::write_message(&mut *stream, req)?;
    Ok(wire::read_message(&mut *stream)?)
}

/// The server refuses requests it considers invalid for its library.
fn rejected(err: wire::RequestError) -> EngineError {
    EngineError::InvalidSettings(format!("server rejected request: {err}"))
}

/// Negotiate a playback session on a fresh connection.
///
/// Returns the encoder the stream will use.
pub fn negotiate(stream: &mut TcpStream, settings: &Settings, timeout: Duration) -> EngineResult<Encoder> {
    stream.set_read_timeout(Some(timeout))?;

    let offered = hello(stream)?;
    let encoder = settings.negotiate_encoder(&offered);
    match request(stream, &settings.request(encoder))? {
        RequestResult::Ok => {}
        RequestResult::Error(e) => return Err(rejected(e)),
        RequestResult::Playlist(_) => {
            return Err(EngineError::DecodeFailure(
                "unexpected playlist listing in reply to play request".to_string(),
            ));
        }
    }

    stream.set_read_timeout(None)?;
    tracing::info!(
        %encoder,
        playlist = settings.playlist.as_deref().unwrap_or("<all>"),
        cover = settings.cover.code(),
        "stream negotiated"
    );
    Ok(encoder)
}

/// Ask `server` for its playlists on a dedicated connection.
pub fn list_playlists(server: &str, config: &EngineConfig) -> EngineResult<Vec<String>> {
    let mut stream = connect(server, config.connect_timeout)?;
    stream.set_read_timeout(Some(config.handshake_timeout))?;
    hello(&mut stream)?;
    match request(&mut stream, &Request::ListPlaylist)? {
        RequestResult::Playlist(listing) => Ok(listing.lists),
        RequestResult::Ok => Ok(Vec::new()),
        RequestResult::Error(e) => Err(rejected(e)),
    }
}

/// One track decoded at its source rate and channel count.
#[derive(Clone, Debug)]
pub struct DownloadedTrack {
    pub metadata: TrackMetadata,
    /// Interleaved samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DownloadedTrack {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Download the first track `server` plays for `settings`, decoded but not resampled.
///
/// Ends at the next track boundary or when the server closes the stream. Every read is
/// bounded by `handshake_timeout`.
pub fn get_track(server: &str, settings: &Settings, config: &EngineConfig) -> EngineResult<DownloadedTrack> {
    let mut stream = connect(server, config.connect_timeout)?;
    negotiate(&mut stream, settings, config.handshake_timeout)?;
    stream.set_read_timeout(Some(config.handshake_timeout))?;

    let mut r = BufReader::new(XorReader::new(&stream, config.xor_key.clone()));
    let mut track: Option<(TrackFormat, DownloadedTrack)> = None;
    loop {
        let msg: Message = match wire::read_message(&mut r) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && track.is_some() => break,
            Err(e) => return Err(e.into()),
        };
        match msg {
            Message::T(md) => {
                if track.is_some() {
                    break;
                }
                let format = TrackFormat {
                    encoder: md.encoder,
                    sample_rate: md.sample_rate,
                    channels: md.channels as usize,
                };
                let out = DownloadedTrack {
                    metadata: TrackMetadata::from_wire(md, settings.cover),
                    samples: Vec::new(),
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                };
                track = Some((format, out));
            }
            Message::F(header) => {
                let payload = wire::read_fragment_payload(&mut r, &header)?;
                let Some((format, out)) = track.as_mut() else {
                    return Err(EngineError::DecodeFailure(
                        "audio fragment before any track metadata".to_string(),
                    ));
                };
                let decoded = decode_fragment(*format, &payload, header.magic_cookie.as_deref())?;
                if decoded.channels != out.channels || decoded.sample_rate != out.sample_rate {
                    if !out.samples.is_empty() {
                        return Err(EngineError::DecodeFailure(
                            "fragment format changed within a track".to_string(),
                        ));
                    }
                    out.channels = decoded.channels;
                    out.sample_rate = decoded.sample_rate;
                }
                out.samples.extend_from_slice(&decoded.samples);
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Both);

    let Some((_, out)) = track else {
        return Err(EngineError::DecodeFailure("stream ended before any track".to_string()));
    };
    tracing::info!(
        server,
        title = out.metadata.title.as_deref().unwrap_or(""),
        frames = out.frames(),
        rate = out.sample_rate,
        "track downloaded"
    );
    Ok(out)
}

/// Removes a repeating-key XOR from everything read. Without a key bytes pass through.
pub(crate) struct XorReader<R> {
    inner: R,
    key: Option<Arc<[u8]>>,
    pos: usize,
}

impl<R: Read> XorReader<R> {
    pub fn new(inner: R, key: Option<Arc<[u8]>>) -> Self {
        Self {
            inner,
            key: key.filter(|k| !k.is_empty()),
            pos: 0,
        }
    }
}

impl<R: Read> Read for XorReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(key) = &self.key {
            for b in &mut buf[..n] {
                *b ^= key[self.pos];
                self.pos = (self.pos + 1) % key.len();
            }
        }
        Ok(n)
    }
}

/// Newline-separated form used across the C ABI.
pub fn format_playlist_listing(names: &[String]) -> String {
    names.join("\n")
}

/// Inverse of [`format_playlist_listing`]; blank lines are skipped.
pub fn parse_playlist_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Everything the reader worker needs for one session.
pub(crate) struct ReaderContext {
    pub id: SessionId,
    pub stream: TcpStream,
    pub cover: CoverMode,
    pub output: OutputFormat,
    pub chunk_frames: usize,
    pub xor_key: Option<Arc<[u8]>>,
    pub queue: Arc<SharedAudio>,
    pub metadata: Arc<MetadataStore>,
    pub cancel: Arc<AtomicBool>,
}

/// Read the stream until the session is cancelled or fails.
///
/// Returns `Ok(())` only when cancelled; end of stream is a connection failure.
pub(crate) fn run(ctx: ReaderContext) -> EngineResult<()> {
    let cancelled = || ctx.cancel.load(Ordering::SeqCst);
    let mut r = BufReader::new(XorReader::new(&ctx.stream, ctx.xor_key.clone()));
    let mut current: Option<(TrackFormat, TrackConverter)> = None;

    loop {
        let msg: Message = match wire::read_message(&mut r) {
            Ok(m) => m,
            Err(_) if cancelled() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match msg {
            Message::T(md) => {
                if let Some((_, mut old)) = current.take() {
                    let tail = old.flush()?;
                    if !ctx.queue.push_interleaved_blocking(&tail) {
                        return Ok(());
                    }
                }

                let format = TrackFormat {
                    encoder: md.encoder,
                    sample_rate: md.sample_rate,
                    channels: md.channels as usize,
                };
                let converter = TrackConverter::new(md.sample_rate, md.channels as usize, ctx.output, ctx.chunk_frames)?;
                let track = TrackMetadata::from_wire(md, ctx.cover);
                tracing::info!(
                    session = ctx.id,
                    artist = track.artist.as_deref().unwrap_or(""),
                    album = track.album.as_deref().unwrap_or(""),
                    title = track.title.as_deref().unwrap_or(""),
                    rate = format.sample_rate,
                    channels = format.channels,
                    encoder = %format.encoder,
                    "track started"
                );
                ctx.metadata.replace(track);
                current = Some((format, converter));
            }
            Message::F(header) => {
                let payload = match wire::read_fragment_payload(&mut r, &header) {
                    Ok(p) => p,
                    Err(_) if cancelled() => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                let Some((format, converter)) = current.as_mut() else {
                    return Err(EngineError::DecodeFailure(
                        "audio fragment before any track metadata".to_string(),
                    ));
                };

                let decoded = decode_fragment(*format, &payload, header.magic_cookie.as_deref())?;
                let converted = converter.convert(&decoded.samples, decoded.sample_rate, decoded.channels)?;
                if !ctx.queue.push_interleaved_blocking(&converted) {
                    return Ok(());
                }
            }
        }

        if cancelled() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeServer, pcm16_payload, serve_handshake, track, xor_with};
    use std::io::{Cursor, Write};

    fn config() -> EngineConfig {
        EngineConfig {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn playlist_listing_keeps_server_order() {
        let server = FakeServer::start(|mut conn| {
            let req = serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            assert_eq!(req, Request::ListPlaylist);
            wire::write_message(
                &mut conn,
                &RequestResult::Playlist(wire::PlaylistResponse {
                    lists: vec!["Jazz".into(), "Rock".into(), "Classical".into()],
                }),
            )
        });

        let lists = list_playlists(&server.addr, &config()).unwrap();
        assert_eq!(lists, vec!["Jazz", "Rock", "Classical"]);

        let serialized = format_playlist_listing(&lists);
        assert_eq!(serialized, "Jazz\nRock\nClassical");
        assert_eq!(parse_playlist_listing(&serialized), lists);
    }

    #[test]
    fn empty_listing_parses_to_nothing() {
        assert!(parse_playlist_listing("").is_empty());
        assert_eq!(format_playlist_listing(&[]), "");
    }

    #[test]
    fn connect_to_closed_port_is_connection_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = connect(&addr, Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailure(_)));
    }

    #[test]
    fn unresolvable_address_is_connection_failure() {
        let err = connect("not an address", Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailure(_)));
    }

    #[test]
    fn negotiate_falls_back_to_pcm16_when_encoder_not_offered() {
        let server = FakeServer::start(|mut conn| {
            let req = serve_handshake(&mut conn, &[Encoder::Pcm16, Encoder::PcmFloat])?;
            let Request::PlayPlaylist(name, settings) = req else {
                panic!("expected playlist request, got {req:?}");
            };
            assert_eq!(name, "Jazz");
            assert_eq!(settings.encoder, Encoder::Pcm16);
            wire::write_message(&mut conn, &RequestResult::Ok)
        });

        let settings = Settings::from_codes(Encoder::Flac.code(), -1, Some("Jazz")).unwrap();
        let mut stream = connect(&server.addr, Duration::from_secs(2)).unwrap();
        let encoder = negotiate(&mut stream, &settings, Duration::from_secs(2)).unwrap();
        assert_eq!(encoder, Encoder::Pcm16);
    }

    #[test]
    fn server_rejection_is_reported() {
        let server = FakeServer::start(|mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Error(wire::RequestError::NoSuchPlaylist))
        });

        let settings = Settings::from_codes(0, -1, Some("Polka")).unwrap();
        let mut stream = connect(&server.addr, Duration::from_secs(2)).unwrap();
        let err = negotiate(&mut stream, &settings, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSettings(_)));
    }

    #[test]
    fn silent_server_times_out_during_handshake() {
        let server = FakeServer::start(|conn| {
            std::thread::sleep(Duration::from_millis(500));
            drop(conn);
            Ok(())
        });

        let mut stream = connect(&server.addr, Duration::from_secs(2)).unwrap();
        let err = negotiate(&mut stream, &Settings::default(), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailure(_)));
    }

    fn reader_ctx(stream: TcpStream, queue: Arc<SharedAudio>, metadata: Arc<MetadataStore>) -> ReaderContext {
        ReaderContext {
            id: 1,
            stream,
            cover: CoverMode::Original,
            output: OutputFormat {
                sample_rate: 44_100,
                channels: 2,
            },
            chunk_frames: 256,
            xor_key: None,
            queue,
            metadata,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn stream_updates_metadata_and_fills_queue() {
        let server = FakeServer::start(|mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Ok)?;
            let mut md = track("So What", 44_100, 1);
            md.cover = Some(vec![0xFF, 0xD8, 0xFF, 0xD9]);
            wire::write_message(&mut conn, &Message::T(md))?;
            wire::write_fragment(&mut conn, &pcm16_payload(100, 1), None)?;
            conn.flush()?;
            conn.shutdown(Shutdown::Write)
        });

        let mut stream = connect(&server.addr, Duration::from_secs(2)).unwrap();
        negotiate(&mut stream, &Settings::default(), Duration::from_secs(2)).unwrap();

        let queue = Arc::new(SharedAudio::new(2, 44_100 * 2));
        let metadata = Arc::new(MetadataStore::new());
        let err = run(reader_ctx(stream, queue.clone(), metadata.clone())).unwrap_err();

        // The server hung up after one fragment.
        assert!(matches!(err, EngineError::ConnectionFailure(_)));
        let md = metadata.current().unwrap();
        assert_eq!(md.title.as_deref(), Some("So What"));
        assert_eq!(md.cover.as_deref(), Some(&[0xFF, 0xD8, 0xFF, 0xD9][..]));
        // Mono was widened to the stereo output.
        assert_eq!(queue.len_frames(), 100);
    }

    #[test]
    fn fragment_before_track_is_decode_failure() {
        let server = FakeServer::start(|mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Ok)?;
            wire::write_fragment(&mut conn, &pcm16_payload(10, 2), None)?;
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });

        let mut stream = connect(&server.addr, Duration::from_secs(2)).unwrap();
        negotiate(&mut stream, &Settings::default(), Duration::from_secs(2)).unwrap();

        let queue = Arc::new(SharedAudio::new(2, 1_024));
        let err = run(reader_ctx(stream, queue, Arc::new(MetadataStore::new()))).unwrap_err();
        assert!(matches!(err, EngineError::DecodeFailure(_)));
    }

    #[test]
    fn malformed_message_is_decode_failure() {
        let server = FakeServer::start(|mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Ok)?;
            conn.write_all(&[0xc1, 0xc1, 0xc1, 0xc1])?;
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });

        let mut stream = connect(&server.addr, Duration::from_secs(2)).unwrap();
        negotiate(&mut stream, &Settings::default(), Duration::from_secs(2)).unwrap();

        let queue = Arc::new(SharedAudio::new(2, 1_024));
        let err = run(reader_ctx(stream, queue, Arc::new(MetadataStore::new()))).unwrap_err();
        assert!(matches!(err, EngineError::DecodeFailure(_)));
    }

    #[test]
    fn xor_reader_keeps_key_position_across_reads() {
        let key: Arc<[u8]> = Arc::from(&[0x11u8, 0x22, 0x33][..]);
        let plain: Vec<u8> = (0..20u8).collect();
        let scrambled = xor_with(&plain, &key);
        assert_ne!(scrambled, plain);

        let mut r = XorReader::new(Cursor::new(scrambled), Some(key));
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = r.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, plain);
    }

    #[test]
    fn empty_xor_key_passes_bytes_through() {
        let mut r = XorReader::new(Cursor::new(vec![1u8, 2, 3]), Some(Arc::<[u8]>::from(Vec::new())));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn xor_scrambled_stream_is_read_with_key() {
        let key: Arc<[u8]> = Arc::from(&b"lonely"[..]);
        let server_key = key.clone();
        let server = FakeServer::start(move |mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Ok)?;
            let mut body = Vec::new();
            wire::write_message(&mut body, &Message::T(track("Scrambled", 44_100, 2)))?;
            wire::write_fragment(&mut body, &pcm16_payload(64, 2), None)?;
            conn.write_all(&xor_with(&body, &server_key))?;
            conn.shutdown(Shutdown::Write)
        });

        let mut stream = connect(&server.addr, Duration::from_secs(2)).unwrap();
        negotiate(&mut stream, &Settings::default(), Duration::from_secs(2)).unwrap();

        let queue = Arc::new(SharedAudio::new(2, 44_100 * 2));
        let metadata = Arc::new(MetadataStore::new());
        let ctx = ReaderContext {
            xor_key: Some(key),
            ..reader_ctx(stream, queue.clone(), metadata.clone())
        };
        let err = run(ctx).unwrap_err();

        assert!(matches!(err, EngineError::ConnectionFailure(_)));
        assert_eq!(metadata.current().unwrap().title.as_deref(), Some("Scrambled"));
        assert_eq!(queue.len_frames(), 64);
    }

    #[test]
    fn get_track_stops_at_next_track() {
        let server = FakeServer::start(|mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Ok)?;
            wire::write_message(&mut conn, &Message::T(track("First", 22_050, 1)))?;
            wire::write_fragment(&mut conn, &pcm16_payload(300, 1), None)?;
            wire::write_fragment(&mut conn, &pcm16_payload(200, 1), None)?;
            wire::write_message(&mut conn, &Message::T(track("Second", 22_050, 1)))?;
            wire::write_fragment(&mut conn, &pcm16_payload(999, 1), None)?;
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });

        let downloaded = get_track(&server.addr, &Settings::default(), &config()).unwrap();
        assert_eq!(downloaded.metadata.title.as_deref(), Some("First"));
        assert_eq!(downloaded.channels, 1);
        assert_eq!(downloaded.sample_rate, 22_050);
        assert_eq!(downloaded.frames(), 500);
    }

    #[test]
    fn get_track_ends_at_end_of_stream() {
        let key: Arc<[u8]> = Arc::from(&[0xA5u8][..]);
        let server_key = key.clone();
        let server = FakeServer::start(move |mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Ok)?;
            let mut body = Vec::new();
            wire::write_message(&mut body, &Message::T(track("Only", 8_000, 2)))?;
            wire::write_fragment(&mut body, &pcm16_payload(80, 2), None)?;
            conn.write_all(&xor_with(&body, &server_key))?;
            conn.shutdown(Shutdown::Write)
        });

        let cfg = EngineConfig {
            xor_key: Some(key),
            ..config()
        };
        let downloaded = get_track(&server.addr, &Settings::default(), &cfg).unwrap();
        assert_eq!(downloaded.metadata.title.as_deref(), Some("Only"));
        assert_eq!(downloaded.frames(), 80);
    }

    #[test]
    fn get_track_without_any_track_fails() {
        let server = FakeServer::start(|mut conn| {
            serve_handshake(&mut conn, &[Encoder::Pcm16])?;
            wire::write_message(&mut conn, &RequestResult::Ok)?;
            conn.shutdown(Shutdown::Write)
        });
        let err = get_track(&server.addr, &Settings::default(), &config()).unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailure(_)));
    }
}
