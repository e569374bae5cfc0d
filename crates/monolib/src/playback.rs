//! Real-time output callback (CPAL).
//!
//! The callback refills a small local buffer from the shared queue without blocking,
//! applies the volume and converts `f32` samples to the device sample format. The queue
//! already carries audio in the device's rate and channel layout.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::queue::{PopStrategy, SharedAudio};

/// Shared handles the callback reads and updates.
#[derive(Clone, Debug)]
pub struct CallbackConfig {
    /// Maximum number of frames to pull from the queue per refill.
    pub refill_max_frames: usize,
    /// When `true`, the callback outputs silence and does not drain the queue.
    pub paused: Arc<AtomicBool>,
    /// Linear gain, `0..=255` mapped onto `0.0..=1.0`.
    pub volume: Arc<AtomicU8>,
    /// Incremented by the number of frames taken from the queue.
    pub played_frames: Arc<AtomicU64>,
    /// Set when the driver reports a stream error.
    pub stream_failed: Arc<AtomicBool>,
}

pub fn gain(volume: u8) -> f32 {
    volume as f32 / 255.0
}

/// Build a CPAL output stream that plays audio from `queue`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SharedAudio>,
    cfg: CallbackConfig,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, cfg),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SharedAudio>,
    cfg: CallbackConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    if channels != queue.channels() {
        return Err(anyhow!(
            "queue carries {} channels but the stream has {channels}",
            queue.channels()
        ));
    }

    let refill_max_frames = cfg.refill_max_frames.max(1);
    let queue_cb = queue.clone();
    let mut local = LocalBuffer::default();

    let stream_failed = cfg.stream_failed.clone();
    let err_fn = move |err| {
        tracing::warn!("stream error: {err}");
        stream_failed.store(true, Ordering::Relaxed);
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if cfg.paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }

            let gain = gain(cfg.volume.load(Ordering::Relaxed));
            let mut written = 0usize;
            while written < data.len() {
                if local.pos >= local.samples.len() {
                    match queue_cb.pop(PopStrategy::NonBlocking { max_frames: refill_max_frames }) {
                        Some(v) => local.refill(v),
                        None => {
                            // Underrun; pad with silence.
                            data[written..].fill(silence);
                            break;
                        }
                    }
                }
                let n = (local.samples.len() - local.pos).min(data.len() - written);
                for (dst, src) in data[written..written + n]
                    .iter_mut()
                    .zip(&local.samples[local.pos..local.pos + n])
                {
                    *dst = <T as cpal::Sample>::from_sample::<f32>(src * gain);
                }
                local.pos += n;
                written += n;
            }

            let frames = (written / channels) as u64;
            if frames > 0 {
                cfg.played_frames.fetch_add(frames, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Samples fetched from the queue but not yet written to the device.
#[derive(Default)]
struct LocalBuffer {
    pos: usize,
    samples: Vec<f32>,
}

impl LocalBuffer {
    fn refill(&mut self, samples: Vec<f32>) {
        self.samples = samples;
        self.pos = 0;
    }
}
