//! Bounded hand-off queue between the stream reader and the output stage.
//!
//! The reader pushes converted interleaved `f32` samples and blocks when the queue is full;
//! the output callback drains it without blocking. Shutdown is deterministic: `close()`
//! wakes every waiter, and a closed queue accepts no further samples.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// A single [`Condvar`] signals every state change; the `done` flag lives under the same
/// mutex as the samples so close and push cannot race.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Strategy for popping interleaved frames from the queue.
pub enum PopStrategy {
    /// Block until at least one frame is available, then return up to `max_frames`.
    BlockingUpTo { max_frames: usize },
    /// Return immediately with up to `max_frames`, or `None` if currently empty.
    NonBlocking { max_frames: usize },
}

/// Queue capacity in **samples** for `buffer_seconds` of audio at `(rate_hz, channels)`.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.max(1).saturating_mul(channels)
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Currently buffered frames (snapshot).
    pub fn len_frames(&self) -> usize {
        let g = self.inner.lock().unwrap();
        g.queue.len() / self.channels
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Mark the queue as finished and wake all waiters. Idempotent.
    ///
    /// Pending and future pushes return early; pops drain what is left and then see `None`.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before every sample was accepted.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();

            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.cv.wait(g).unwrap();
            }
            if g.done {
                return false;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Pop interleaved frames using the requested strategy.
    ///
    /// Returns `None` when nothing can satisfy the request.
    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let max_frames = match strategy {
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.queue.len() < self.channels && !g.done {
                    g = self.cv.wait(g).unwrap();
                }
                max_frames
            }
            PopStrategy::NonBlocking { max_frames } => max_frames,
        };

        let available_frames = g.queue.len() / self.channels;
        let take_samples = available_frames.min(max_frames) * self.channels;
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Wait until at least `frames` are buffered, the queue is closed, or `cancel` is set.
    ///
    /// Returns `true` unless cancelled. `frames` is capped at the queue capacity.
    pub fn wait_for_frames(&self, frames: usize, cancel: &AtomicBool) -> bool {
        let want = frames.min(self.max_frames()) * self.channels;
        let mut g = self.inner.lock().unwrap();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            if g.done || g.queue.len() >= want {
                return true;
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, Duration::from_millis(50))
                .unwrap();
            g = ng;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::INFINITY), 192_000);
    }

    #[test]
    fn pop_nonblocking_empty() {
        let q = SharedAudio::new(2, 16);
        assert!(q.pop(PopStrategy::NonBlocking { max_frames: 4 }).is_none());
    }

    #[test]
    fn pop_nonblocking_returns_whole_frames() {
        let q = SharedAudio::new(2, 64);
        assert!(q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));

        let out = q.pop(PopStrategy::NonBlocking { max_frames: 2 }).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn pop_blocking_up_to_drains_tail_and_respects_close() {
        let q = Arc::new(SharedAudio::new(2, 64));
        let q_pop = q.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();

        let handle = thread::spawn(move || {
            start.wait();
            let out = q_pop.pop(PopStrategy::BlockingUpTo { max_frames: 8 }).unwrap();
            assert_eq!(out.len(), 4);
            assert!(q_pop.pop(PopStrategy::BlockingUpTo { max_frames: 8 }).is_none());
        });

        barrier.wait();
        q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0]);
        q.close();

        handle.join().unwrap();
    }

    #[test]
    fn push_blocks_at_capacity_until_drained() {
        let q = Arc::new(SharedAudio::new(2, 8));
        let producer = q.clone();
        let handle = thread::spawn(move || producer.push_interleaved_blocking(&[0.5; 32]));

        let mut drained = 0;
        while drained < 32 {
            assert!(q.len_frames() <= q.max_frames());
            if let Some(v) = q.pop(PopStrategy::NonBlocking { max_frames: 2 }) {
                drained += v.len();
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert!(handle.join().unwrap());
    }

    #[test]
    fn close_releases_blocked_producer() {
        let q = Arc::new(SharedAudio::new(1, 4));
        let producer = q.clone();
        let handle = thread::spawn(move || producer.push_interleaved_blocking(&[0.0; 16]));
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(!handle.join().unwrap());
        assert!(!q.push_interleaved_blocking(&[1.0]));
    }

    #[test]
    fn wait_for_frames_caps_at_capacity() {
        let q = SharedAudio::new(1, 4);
        let cancel = AtomicBool::new(false);
        q.push_interleaved_blocking(&[0.0; 4]);
        assert!(q.wait_for_frames(1_000, &cancel));
    }

    #[test]
    fn wait_for_frames_respects_cancel_and_close() {
        let q = SharedAudio::new(2, 64);
        let cancel = AtomicBool::new(true);
        assert!(!q.wait_for_frames(4, &cancel));

        cancel.store(false, Ordering::Relaxed);
        q.close();
        assert!(q.wait_for_frames(4, &cancel));
    }
}
