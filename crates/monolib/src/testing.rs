//! Loopback lonelyradio server and helpers shared by the unit tests.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lonelyradio_types::{self as wire, Encoder, Message, Request, RequestResult, ServerCapabilities};

use crate::config::EngineConfig;
use crate::output::NullOutput;
use crate::player::Player;
use crate::resample::OutputFormat;

/// Accepts connections on `127.0.0.1` and runs `handler` for each one on its own thread.
pub(crate) struct FakeServer {
    pub addr: String,
}

impl FakeServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(TcpStream) -> io::Result<()> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handler = Arc::new(handler);
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { break };
                let handler = handler.clone();
                thread::spawn(move || {
                    let _ = handler(conn);
                });
            }
        });
        Self { addr }
    }
}

/// Server side of hello and capabilities; returns the client's request.
pub(crate) fn serve_handshake(conn: &mut TcpStream, encoders: &[Encoder]) -> io::Result<Request> {
    wire::read_hello(&mut *conn)?;
    wire::write_message(
        &mut *conn,
        &ServerCapabilities {
            encoders: encoders.to_vec(),
        },
    )?;
    wire::read_message(&mut *conn)
}

pub(crate) fn track(title: &str, sample_rate: u32, channels: u16) -> wire::TrackMetadata {
    wire::TrackMetadata {
        track_length_secs: 180,
        track_length_frac: 0.0,
        channels,
        sample_rate,
        encoder: Encoder::Pcm16,
        cover: None,
        title: title.to_string(),
        album: "Loopback Sessions".to_string(),
        artist: "The Test Band".to_string(),
    }
}

/// A quiet ramp in 16-bit little-endian PCM.
pub(crate) fn pcm16_payload(frames: usize, channels: usize) -> Vec<u8> {
    (0..frames * channels)
        .flat_map(|i| ((i % 64) as i16 * 16).to_le_bytes())
        .collect()
}

/// Negotiate, announce `md`, then send PCM16 fragments until the client goes away.
pub(crate) fn stream_forever(mut conn: TcpStream, md: wire::TrackMetadata) -> io::Result<()> {
    serve_handshake(&mut conn, &[Encoder::Pcm16, Encoder::PcmFloat])?;
    wire::write_message(&mut conn, &RequestResult::Ok)?;
    let frames = (md.sample_rate / 20) as usize;
    let payload = pcm16_payload(frames, md.channels as usize);
    wire::write_message(&mut conn, &Message::T(md))?;
    loop {
        wire::write_fragment(&mut conn, &payload, None)?;
    }
}

/// A player whose output never touches a device.
pub(crate) fn null_player() -> Player {
    let config = EngineConfig {
        buffer_seconds: 0.5,
        prebuffer_seconds: 0.1,
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    };
    let backend = NullOutput::new(OutputFormat {
        sample_rate: 8_000,
        channels: 2,
    });
    Player::new(Arc::new(backend), config)
}

/// Poll `cond` until it holds or `timeout` expires.
pub(crate) fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Apply a repeating-key XOR from the start of `bytes`.
pub(crate) fn xor_with(bytes: &[u8], key: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .zip(key.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}
