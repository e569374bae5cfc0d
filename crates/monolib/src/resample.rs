//! Conversion from a track's format to the output format.
//!
//! Channels are remapped first, then Rubato converts the sample rate when the track and
//! the device disagree. The converter lives for one track; the reader builds a new one on
//! every track boundary and flushes the old one.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{EngineError, EngineResult};

/// Output format negotiated with the audio backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: usize,
}

/// Map interleaved `src_channels` audio onto `dst_channels`.
///
/// - mono -> N: duplicate channel 0
/// - stereo -> mono: average L/R
/// - otherwise: each output channel reads the same input channel, clamped to the last one
pub fn remap_channels(samples: &[f32], src_channels: usize, dst_channels: usize) -> Vec<f32> {
    let src_channels = src_channels.max(1);
    let dst_channels = dst_channels.max(1);
    let frames = samples.len() / src_channels;
    if src_channels == dst_channels {
        return samples[..frames * src_channels].to_vec();
    }

    let mut out = Vec::with_capacity(frames * dst_channels);
    for frame in samples.chunks_exact(src_channels) {
        match (src_channels, dst_channels) {
            (2, 1) => out.push(0.5 * (frame[0] + frame[1])),
            _ => {
                for ch in 0..dst_channels {
                    out.push(frame[ch.min(src_channels - 1)]);
                }
            }
        }
    }
    out
}

/// Streaming sinc resampler fed with arbitrary-length interleaved input.
struct ChunkResampler {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl ChunkResampler {
    fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> EngineResult<Self> {
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(f_ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)
            .map_err(|e| EngineError::DecodeFailure(format!("resampler init: {e}")))?;

        let out_frames = (chunk_frames as f64 * f_ratio * 1.1).ceil() as usize + 64;
        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels),
            out: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Resample every complete chunk available; the remainder waits for more input.
    fn push(&mut self, samples: &[f32], out: &mut Vec<f32>) -> EngineResult<()> {
        self.pending.extend_from_slice(samples);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = self.pending[consumed..consumed + chunk_samples].to_vec();
            self.process(&chunk, None, out)?;
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Resample the buffered tail as a final partial chunk.
    fn flush(&mut self, out: &mut Vec<f32>) -> EngineResult<()> {
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames == 0 {
            self.pending.clear();
            return Ok(());
        }
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.truncate(tail_frames * self.channels);
        chunk.resize(self.chunk_frames * self.channels, 0.0);
        self.process(&chunk, Some(tail_frames), out)
    }

    fn process(&mut self, chunk: &[f32], partial_len: Option<usize>, out: &mut Vec<f32>) -> EngineResult<()> {
        let input_adapter = InterleavedSlice::new(chunk, self.channels, self.chunk_frames)
            .map_err(|e| EngineError::DecodeFailure(format!("resampler input: {e}")))?;

        let out_capacity_frames = self.out.len() / self.channels;
        let mut output_adapter = InterleavedSlice::new_mut(&mut self.out, self.channels, out_capacity_frames)
            .map_err(|e| EngineError::DecodeFailure(format!("resampler output: {e}")))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| EngineError::DecodeFailure(format!("resampler: {e}")))?;

        out.extend_from_slice(&self.out[..nbr_out * self.channels]);
        Ok(())
    }
}

/// Converts one track's decoded audio into the output format.
pub struct TrackConverter {
    src_rate: u32,
    src_channels: usize,
    dst: OutputFormat,
    chunk_frames: usize,
    resampler: Option<ChunkResampler>,
}

impl TrackConverter {
    pub fn new(src_rate: u32, src_channels: usize, dst: OutputFormat, chunk_frames: usize) -> EngineResult<Self> {
        if src_rate == 0 || src_channels == 0 {
            return Err(EngineError::DecodeFailure(format!(
                "invalid track format: {src_rate} Hz, {src_channels} channels"
            )));
        }
        let mut converter = Self {
            src_rate,
            src_channels,
            dst,
            chunk_frames,
            resampler: None,
        };
        converter.configure_resampler()?;
        Ok(converter)
    }

    pub fn needs_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    /// Convert decoded audio. Fragments whose format differs from the announced one
    /// reconfigure the converter first.
    pub fn convert(&mut self, samples: &[f32], src_rate: u32, src_channels: usize) -> EngineResult<Vec<f32>> {
        if src_rate != self.src_rate || src_channels != self.src_channels {
            tracing::debug!(
                from_rate = self.src_rate,
                to_rate = src_rate,
                from_channels = self.src_channels,
                to_channels = src_channels,
                "fragment format changed mid-track"
            );
            let mut tail = self.flush()?;
            self.src_rate = src_rate;
            self.src_channels = src_channels.max(1);
            self.configure_resampler()?;
            tail.extend(self.convert(samples, src_rate, src_channels)?);
            return Ok(tail);
        }

        let remapped = remap_channels(samples, self.src_channels, self.dst.channels);
        match &mut self.resampler {
            None => Ok(remapped),
            Some(r) => {
                let mut out = Vec::with_capacity(remapped.len() * 2);
                r.push(&remapped, &mut out)?;
                Ok(out)
            }
        }
    }

    /// Drain the resampler at a track boundary.
    pub fn flush(&mut self) -> EngineResult<Vec<f32>> {
        let mut out = Vec::new();
        if let Some(r) = &mut self.resampler {
            r.flush(&mut out)?;
        }
        Ok(out)
    }

    fn configure_resampler(&mut self) -> EngineResult<()> {
        self.resampler = if self.src_rate == self.dst.sample_rate {
            None
        } else {
            tracing::debug!(src_rate = self.src_rate, dst_rate = self.dst.sample_rate, "resampling track");
            Some(ChunkResampler::new(
                self.src_rate,
                self.dst.sample_rate,
                self.dst.channels,
                self.chunk_frames,
            )?)
        };
        Ok(())
    }
}
