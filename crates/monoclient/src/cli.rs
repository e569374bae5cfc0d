//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use monolib::Encoder;

#[derive(Parser, Debug)]
#[command(name = "monoclient", version)]
pub struct Args {
    /// Server address, e.g. 127.0.0.1:5894
    #[arg(required_unless_present = "list_devices")]
    pub address: Option<String>,

    /// Play only tracks of this playlist
    #[arg(long, short)]
    pub playlist: Option<String>,

    /// List the server's playlists and exit
    #[arg(long)]
    pub list: bool,

    /// Stream encoding requested from the server (falls back to pcm16 if not offered)
    #[arg(long, short, value_enum, default_value_t = EncoderArg::Pcm16)]
    pub encoder: EncoderArg,

    /// Cover size in pixels: 0 for original size, negative to disable
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub cover: i32,

    /// Output volume (0-255)
    #[arg(long, default_value_t = 255)]
    pub volume: u8,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Preferred output sample rate in Hz
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Queue buffer target in seconds
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// Consume audio at real-time pace without opening a device
    #[arg(long)]
    pub null_output: bool,

    /// Key file the server scrambles the stream with
    #[arg(long)]
    pub xor_key_file: Option<PathBuf>,

    /// Download one track as raw interleaved f32 little-endian samples instead of playing
    #[arg(long, value_name = "FILE")]
    pub download: Option<PathBuf>,
}

/// Encoders this client can decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EncoderArg {
    Pcm16,
    PcmFloat,
    Flac,
    Alac,
    Vorbis,
}

impl From<EncoderArg> for Encoder {
    fn from(arg: EncoderArg) -> Self {
        match arg {
            EncoderArg::Pcm16 => Encoder::Pcm16,
            EncoderArg::PcmFloat => Encoder::PcmFloat,
            EncoderArg::Flac => Encoder::Flac,
            EncoderArg::Alac => Encoder::Alac,
            EncoderArg::Vorbis => Encoder::Vorbis,
        }
    }
}
