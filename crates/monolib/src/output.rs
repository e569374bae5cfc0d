//! Output backends.
//!
//! The player talks to audio hardware only through [`OutputBackend`]. [`CpalOutput`] drives
//! a real device; [`NullOutput`] drains the queue at real-time pace without one, which is
//! what tests and headless runs use.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::device::{pick_buffer_size, pick_device, pick_output_config};
use crate::error::{EngineError, EngineResult};
use crate::playback::{CallbackConfig, build_output_stream};
use crate::queue::{PopStrategy, SharedAudio};
use crate::resample::OutputFormat;

/// Per-session handles shared between the player and the output worker.
#[derive(Clone, Debug)]
pub struct PlaybackControl {
    /// Set when the session is torn down.
    pub cancel: Arc<AtomicBool>,
    pub paused: Arc<AtomicBool>,
    pub volume: Arc<AtomicU8>,
    pub played_frames: Arc<AtomicU64>,
}

impl PlaybackControl {
    pub fn new(volume: Arc<AtomicU8>) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            volume,
            played_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Something that can play interleaved `f32` audio from a [`SharedAudio`] queue.
pub trait OutputBackend: Send + Sync {
    /// Format the queue must carry. Called once per session before connecting.
    fn output_format(&self) -> EngineResult<OutputFormat>;

    /// Play until `control.cancel` is set, or until the queue is closed and drained.
    ///
    /// Runs on the session's output worker thread.
    fn run(&self, format: OutputFormat, queue: Arc<SharedAudio>, control: &PlaybackControl) -> EngineResult<()>;
}

/// Output through the host's audio device.
#[derive(Clone, Debug)]
pub struct CpalOutput {
    /// Case-insensitive device name substring; `None` is the default device.
    pub device: Option<String>,
    /// Preferred sample rate; `None` takes the highest supported.
    pub sample_rate: Option<u32>,
    pub refill_max_frames: usize,
}

impl CpalOutput {
    pub fn new(device: Option<String>, sample_rate: Option<u32>, refill_max_frames: usize) -> Self {
        Self {
            device,
            sample_rate,
            refill_max_frames,
        }
    }

    fn open(&self) -> anyhow::Result<(cpal::Device, cpal::SupportedStreamConfig)> {
        let host = cpal::default_host();
        let device = pick_device(&host, self.device.as_deref())?;
        let config = pick_output_config(&device, self.sample_rate)
            .with_context(|| format!("choose output config for {}", device_name(&device)))?;
        Ok((device, config))
    }
}

impl OutputBackend for CpalOutput {
    fn output_format(&self) -> EngineResult<OutputFormat> {
        let (_device, config) = self.open()?;
        Ok(OutputFormat {
            sample_rate: config.sample_rate(),
            channels: config.channels() as usize,
        })
    }

    fn run(&self, format: OutputFormat, queue: Arc<SharedAudio>, control: &PlaybackControl) -> EngineResult<()> {
        // cpal::Stream is not Send, so the device is opened on this thread.
        let (device, supported) = self.open()?;
        if supported.sample_rate() != format.sample_rate || supported.channels() as usize != format.channels {
            return Err(EngineError::DeviceFailure(format!(
                "device format changed to {} Hz / {} ch",
                supported.sample_rate(),
                supported.channels()
            )));
        }

        let mut stream_config: cpal::StreamConfig = supported.config();
        if let Some(buffer_size) = pick_buffer_size(&supported) {
            stream_config.buffer_size = buffer_size;
        }

        let stream_failed = Arc::new(AtomicBool::new(false));
        let stream = build_output_stream(
            &device,
            &stream_config,
            supported.sample_format(),
            &queue,
            CallbackConfig {
                refill_max_frames: self.refill_max_frames,
                paused: control.paused.clone(),
                volume: control.volume.clone(),
                played_frames: control.played_frames.clone(),
                stream_failed: stream_failed.clone(),
            },
        )?;
        stream.play().context("start output stream")?;

        tracing::info!(
            device = %device_name(&device),
            rate = format.sample_rate,
            channels = format.channels,
            sample_format = ?supported.sample_format(),
            "output started"
        );

        loop {
            if control.is_cancelled() {
                break;
            }
            if stream_failed.load(Ordering::Relaxed) {
                return Err(EngineError::DeviceFailure("output stream error".to_string()));
            }
            if queue.is_done() && queue.len_frames() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        drop(stream);
        Ok(())
    }
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

/// Deviceless backend that consumes audio in real time.
#[derive(Clone, Debug)]
pub struct NullOutput {
    pub format: OutputFormat,
    /// Frames consumed per step.
    pub period_frames: usize,
}

impl Default for NullOutput {
    fn default() -> Self {
        Self {
            format: OutputFormat {
                sample_rate: 48_000,
                channels: 2,
            },
            period_frames: 480,
        }
    }
}

impl NullOutput {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            period_frames: (format.sample_rate as usize / 100).max(1),
        }
    }
}

impl OutputBackend for NullOutput {
    fn output_format(&self) -> EngineResult<OutputFormat> {
        Ok(self.format)
    }

    fn run(&self, format: OutputFormat, queue: Arc<SharedAudio>, control: &PlaybackControl) -> EngineResult<()> {
        let mut started = Instant::now();
        let mut consumed: u64 = 0;
        let rate = format.sample_rate.max(1) as u64;

        while !control.is_cancelled() {
            if control.paused.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
                started = Instant::now();
                consumed = 0;
                continue;
            }

            let Some(block) = queue.pop(PopStrategy::BlockingUpTo {
                max_frames: self.period_frames,
            }) else {
                break;
            };
            let frames = (block.len() / format.channels.max(1)) as u64;
            consumed += frames;
            control.played_frames.fetch_add(frames, Ordering::Relaxed);

            // Stay at real-time pace so backpressure behaves like a device.
            let due = Duration::from_micros(consumed * 1_000_000 / rate);
            if let Some(ahead) = due.checked_sub(started.elapsed()) {
                thread::sleep(ahead);
            }
        }
        Ok(())
    }
}
