//! Fragment decoding.
//!
//! Each `F` message carries a self-contained piece of audio: raw little-endian PCM, a
//! complete FLAC or Ogg/Vorbis stream, or one ALAC packet whose decoder configuration
//! (the "magic cookie") travels with the fragment. Everything is decoded to interleaved
//! `f32` with Symphonia.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_ALAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{EngineError, EngineResult};
use crate::settings::Encoder;

/// Interleaved samples decoded from one fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFragment {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl DecodedFragment {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Stream format announced by the current track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackFormat {
    pub encoder: Encoder,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Decode one fragment payload.
///
/// Compressed fragments report the format found in the payload, which wins over the
/// track announcement when they disagree.
pub fn decode_fragment(
    format: TrackFormat,
    payload: &[u8],
    magic_cookie: Option<&[u8]>,
) -> EngineResult<DecodedFragment> {
    match format.encoder {
        Encoder::Pcm16 => Ok(DecodedFragment {
            samples: decode_pcm16(payload),
            channels: format.channels,
            sample_rate: format.sample_rate,
        }),
        Encoder::PcmFloat => Ok(DecodedFragment {
            samples: decode_pcm_f32(payload),
            channels: format.channels,
            sample_rate: format.sample_rate,
        }),
        Encoder::Flac => decode_container(payload, "flac", format),
        Encoder::Vorbis => decode_container(payload, "ogg", format),
        Encoder::Alac => {
            let cookie = magic_cookie.ok_or_else(|| {
                EngineError::DecodeFailure("ALAC fragment without magic cookie".to_string())
            })?;
            decode_alac(payload, cookie, format)
        }
        other => Err(EngineError::DecodeFailure(format!(
            "no decoder for {other} fragments"
        ))),
    }
}

fn decode_pcm16(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32767.0)
        .collect()
}

fn decode_pcm_f32(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Probe and decode a complete in-memory container.
fn decode_container(payload: &[u8], extension: &str, format: TrackFormat) -> EngineResult<DecodedFragment> {
    let source = Cursor::new(payload.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(extension);

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut reader = probed.format;

    let track = reader
        .default_track()
        .ok_or_else(|| EngineError::DecodeFailure(format!("{extension} fragment has no audio track")))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    let mut out = DecodedFragment {
        samples: Vec::new(),
        channels: codec_params.channels.map(|c| c.count()).unwrap_or(format.channels),
        sample_rate: codec_params.sample_rate.unwrap_or(format.sample_rate),
    };

    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        append_decoded(decoder.as_mut(), &packet, &mut out)?;
    }

    Ok(out)
}

/// Decode one ALAC packet configured by `cookie`.
fn decode_alac(payload: &[u8], cookie: &[u8], format: TrackFormat) -> EngineResult<DecodedFragment> {
    let mut params = CodecParameters::new();
    params
        .for_codec(CODEC_TYPE_ALAC)
        .with_extra_data(cookie.to_vec().into_boxed_slice());

    let mut decoder = symphonia::default::get_codecs().make(&params, &DecoderOptions::default())?;
    let packet = Packet::new_from_slice(0, 0, 0, payload);

    let mut out = DecodedFragment {
        samples: Vec::new(),
        channels: format.channels,
        sample_rate: format.sample_rate,
    };
    append_decoded(decoder.as_mut(), &packet, &mut out)?;
    Ok(out)
}

fn append_decoded(decoder: &mut dyn Decoder, packet: &Packet, out: &mut DecodedFragment) -> EngineResult<()> {
    let decoded = match decoder.decode(packet) {
        Ok(d) => d,
        Err(SymphoniaError::DecodeError(e)) => {
            tracing::warn!(error = e, "skipping corrupt packet");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let spec = *decoded.spec();
    out.channels = spec.channels.count();
    out.sample_rate = spec.rate;

    let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
    sample_buf.copy_interleaved_ref(decoded);
    out.samples.extend_from_slice(sample_buf.samples());
    Ok(())
}
