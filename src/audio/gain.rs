//! Capture gain stage with clipping detection
//!
//! The gain factor is stored as f32 bits in an atomic so the control side
//! can change it while the capture loop is running, without a lock shared
//! with the hot path.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub const MIN_GAIN: f32 = 1.0;
pub const MAX_GAIN: f32 = 8.0;

/// Gain multiplier applied in the capture loop
pub struct GainStage {
    gain_bits: Arc<AtomicU32>,
    clipped_total: Arc<AtomicU64>,
}

impl GainStage {
    pub fn new(initial_gain: f32) -> Self {
        Self {
            gain_bits: Arc::new(AtomicU32::new(
                initial_gain.clamp(MIN_GAIN, MAX_GAIN).to_bits(),
            )),
            clipped_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Control-side handle for live gain changes and clip monitoring
    pub fn handle(&self) -> GainHandle {
        GainHandle {
            gain_bits: self.gain_bits.clone(),
            clipped_total: self.clipped_total.clone(),
        }
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    /// Multiply the frame in place, clamping to the i16 range.
    ///
    /// Returns the number of samples clamped in this frame. Unity gain
    /// leaves the buffer untouched.
    pub fn apply(&self, frame: &mut [i16]) -> u32 {
        let gain = self.gain();
        if gain <= MIN_GAIN {
            return 0;
        }

        let mut clipped = 0u32;
        for sample in frame.iter_mut() {
            let scaled = (f32::from(*sample) * gain).round();
            if scaled > f32::from(i16::MAX) {
                *sample = i16::MAX;
                clipped += 1;
            } else if scaled < f32::from(i16::MIN) {
                *sample = i16::MIN;
                clipped += 1;
            } else {
                *sample = scaled as i16;
            }
        }

        if clipped > 0 {
            self.clipped_total
                .fetch_add(u64::from(clipped), Ordering::Relaxed);
        }
        clipped
    }
}

/// Cloneable handle shared with the status loop and the control surface
#[derive(Clone)]
pub struct GainHandle {
    gain_bits: Arc<AtomicU32>,
    clipped_total: Arc<AtomicU64>,
}

impl GainHandle {
    pub fn set_gain(&self, gain: f32) {
        self.gain_bits
            .store(gain.clamp(MIN_GAIN, MAX_GAIN).to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    /// Monotonic count of clamped samples since the stage was created
    pub fn clipped_total(&self) -> u64 {
        self.clipped_total.load(Ordering::Relaxed)
    }
}
