//! Audio buffering between threads
//!
//! `SampleQueue` carries raw capture chunks from the device callback to the
//! capture loop without blocking the callback. `PlaybackBuffer` is the
//! receiver's ring-style sink: duration-bounded, discard-oldest on
//! overflow, drained by the output device callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

/// Lock-free chunk queue from the capture callback to the capture loop
pub struct SampleQueue {
    queue: ArrayQueue<Vec<i16>>,
    overflow_count: AtomicUsize,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a chunk; returns false when the queue is full (chunk dropped).
    pub fn push(&self, chunk: Vec<i16>) -> bool {
        match self.queue.push(chunk) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<Vec<i16>> {
        self.queue.pop()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a sample queue
pub type SharedSampleQueue = Arc<SampleQueue>;

/// Ring-style playback sink at the receiver's internal format
///
/// Capacity is duration-based. A push that would exceed capacity discards
/// the oldest samples and counts one overflow event; that is the expected
/// behavior under sustained loss or jitter, not an error.
pub struct PlaybackBuffer {
    samples: Mutex<VecDeque<f32>>,
    capacity_samples: usize,
    sample_rate: u32,
    channels: u16,
    overflow_count: AtomicU64,
    primed: AtomicBool,
}

impl PlaybackBuffer {
    pub fn new(sample_rate: u32, channels: u16, capacity_ms: u32) -> Self {
        let capacity_samples =
            (sample_rate as usize * channels as usize * capacity_ms as usize) / 1000;
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity_samples)),
            capacity_samples: capacity_samples.max(1),
            sample_rate,
            channels,
            overflow_count: AtomicU64::new(0),
            primed: AtomicBool::new(false),
        }
    }

    /// Append decoded samples, discarding the oldest on overflow.
    pub fn push_samples(&self, new_samples: &[f32]) {
        let mut queue = self.samples.lock();
        let incoming = new_samples.len().min(self.capacity_samples);
        let overflow = (queue.len() + incoming).saturating_sub(self.capacity_samples);
        if overflow > 0 {
            queue.drain(..overflow);
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
        // A frame larger than the whole buffer keeps only its tail
        queue.extend(new_samples[new_samples.len() - incoming..].iter().copied());
        self.primed.store(true, Ordering::Relaxed);
    }

    /// Drain into the output buffer, zero-filling whatever is not
    /// available. Returns how many samples were real audio.
    pub fn read_into(&self, out: &mut [f32]) -> usize {
        let mut queue = self.samples.lock();
        let available = queue.len().min(out.len());
        for slot in out.iter_mut().take(available) {
            // available <= len, pop cannot fail
            *slot = queue.pop_front().unwrap_or(0.0);
        }
        drop(queue);
        out[available..].fill(0.0);
        available
    }

    pub fn buffered_samples(&self) -> usize {
        self.samples.lock().len()
    }

    /// Currently queued audio in milliseconds
    pub fn buffered_ms(&self) -> f64 {
        let per_second = self.sample_rate as f64 * f64::from(self.channels);
        self.buffered_samples() as f64 * 1000.0 / per_second
    }

    pub fn capacity_samples(&self) -> usize {
        self.capacity_samples
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// True once any audio has ever been pushed this session
    pub fn primed(&self) -> bool {
        self.primed.load(Ordering::Relaxed)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_queue_overflow_counts() {
        let queue = SampleQueue::new(2);
        assert!(queue.push(vec![1]));
        assert!(queue.push(vec![2]));
        assert!(!queue.push(vec![3]));
        assert_eq!(queue.overflow_count(), 1);
        assert_eq!(queue.pop().unwrap(), vec![1]);
    }

    #[test]
    fn test_playback_buffer_push_and_read() {
        let buffer = PlaybackBuffer::new(48_000, 1, 100);
        assert!(!buffer.primed());

        buffer.push_samples(&[0.1, 0.2, 0.3]);
        assert!(buffer.primed());
        assert_eq!(buffer.buffered_samples(), 3);

        let mut out = [0.0f32; 5];
        let real = buffer.read_into(&mut out);
        assert_eq!(real, 3);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.0, 0.0]);
        assert_eq!(buffer.buffered_samples(), 0);
    }

    #[test]
    fn test_playback_buffer_discards_oldest_on_overflow() {
        // 1ms at 48kHz mono = 48 samples capacity
        let buffer = PlaybackBuffer::new(48_000, 1, 1);
        assert_eq!(buffer.capacity_samples(), 48);

        buffer.push_samples(&vec![1.0; 48]);
        assert_eq!(buffer.overflow_count(), 0);

        buffer.push_samples(&[2.0; 8]);
        assert_eq!(buffer.overflow_count(), 1);
        assert_eq!(buffer.buffered_samples(), 48);

        // The oldest 8 samples were discarded; tail holds the new audio
        let mut out = [0.0f32; 48];
        buffer.read_into(&mut out);
        assert_eq!(out[..40], [1.0; 40]);
        assert_eq!(out[40..], [2.0; 8]);
    }

    #[test]
    fn test_buffered_ms() {
        let buffer = PlaybackBuffer::new(48_000, 2, 500);
        buffer.push_samples(&vec![0.0; 96]); // 1ms of stereo at 48kHz
        assert!((buffer.buffered_ms() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_push_keeps_tail() {
        let buffer = PlaybackBuffer::new(48_000, 1, 1); // 48 samples
        let big: Vec<f32> = (0..100).map(|i| i as f32).collect();
        buffer.push_samples(&big);
        assert_eq!(buffer.buffered_samples(), 48);
        let mut out = [0.0f32; 48];
        buffer.read_into(&mut out);
        assert_eq!(out[0], 52.0);
        assert_eq!(out[47], 99.0);
    }
}
