//! Stream and receiver configuration
//!
//! `StreamingConfig` is immutable for the lifetime of a capture session: the
//! underlying Opus encoder cannot be reconfigured in place, so any change
//! while streaming is applied as a full pipeline restart.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PORT, SAMPLE_RATE};
use crate::error::Error;

/// Supported Opus frame durations at 48kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameDuration {
    Ms10,
    Ms20,
}

impl FrameDuration {
    pub fn from_millis(value: u32) -> Self {
        match value {
            10 => Self::Ms10,
            _ => Self::Ms20,
        }
    }

    pub fn millis(self) -> u32 {
        match self {
            Self::Ms10 => 10,
            Self::Ms20 => 20,
        }
    }

    /// Samples per channel for one frame at 48kHz
    pub fn samples_per_channel(self) -> usize {
        match self {
            Self::Ms10 => 480,
            Self::Ms20 => 960,
        }
    }
}

/// Sender-side codec and capture configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub channels: u16,
    pub bitrate_bps: u32,
    pub complexity: u8,
    pub frame_duration: FrameDuration,
    pub fec_enabled: bool,
    pub expected_loss_percent: u8,
}

impl StreamingConfig {
    pub const MIN_BITRATE_BPS: u32 = 32_000;
    pub const MAX_BITRATE_BPS: u32 = 128_000;
    /// Stereo needs headroom; below this it degrades worse than mono
    pub const STEREO_MIN_BITRATE_BPS: u32 = 96_000;
    pub const MAX_COMPLEXITY: u8 = 10;
    pub const MAX_EXPECTED_LOSS_PERCENT: u8 = 20;

    /// Clamp every field into its supported range.
    pub fn sanitize(
        channels: u16,
        bitrate_bps: u32,
        complexity: u8,
        frame_duration_ms: u32,
        fec_enabled: bool,
        expected_loss_percent: u8,
    ) -> Self {
        let channels = if channels == 2 { 2 } else { 1 };
        let bitrate_floor = if channels == 2 {
            Self::STEREO_MIN_BITRATE_BPS
        } else {
            Self::MIN_BITRATE_BPS
        };
        Self {
            channels,
            bitrate_bps: bitrate_bps.clamp(bitrate_floor, Self::MAX_BITRATE_BPS),
            complexity: complexity.min(Self::MAX_COMPLEXITY),
            frame_duration: FrameDuration::from_millis(frame_duration_ms),
            fec_enabled,
            expected_loss_percent: expected_loss_percent.min(Self::MAX_EXPECTED_LOSS_PERCENT),
        }
    }

    /// Balanced speech preset: the default
    pub fn voice_clean() -> Self {
        Self::sanitize(1, 48_000, 8, 20, true, 5)
    }

    /// Higher bitrate and complexity for cleaner speech
    pub fn high_quality_voice() -> Self {
        Self::sanitize(1, 96_000, 10, 20, true, 5)
    }

    /// 10ms frames, FEC off, for the lowest end-to-end delay
    pub fn low_latency() -> Self {
        Self::sanitize(1, 40_000, 6, 10, false, 0)
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    /// Total samples per frame across all channels
    pub fn samples_per_frame(&self) -> usize {
        self.frame_duration.samples_per_channel() * self.channels as usize
    }

    /// Size of one uncompressed 16-bit frame in bytes
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * 2
    }

    /// One-line human description
    pub fn summary(&self) -> String {
        format!(
            "Opus: {}kbps, complexity={}, frame={}ms, fec={}, loss={}%, channels={}",
            self.bitrate_bps / 1000,
            self.complexity,
            self.frame_duration.millis(),
            if self.fec_enabled { "on" } else { "off" },
            self.expected_loss_percent,
            self.channels,
        )
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::voice_clean()
    }
}

/// How the receiver picks its render endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// Match the device identifier exactly
    ExactId(String),
    /// Case-insensitive substring of the friendly name
    NameSubstring(String),
    /// The system default render device
    SystemDefault,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::SystemDefault
    }
}

/// Receiver-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub listen_port: u16,
    pub bind_address: IpAddr,
    pub channels: u16,
    pub output_latency_ms: u32,
    pub buffer_length_ms: u32,
    pub jitter_target_delay_ms: u32,
    pub test_tone_seconds: u32,
    pub lock_to_sender_ip: Option<IpAddr>,
    pub device: DeviceSelector,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            channels: 1,
            output_latency_ms: 50,
            buffer_length_ms: 500,
            jitter_target_delay_ms: 60,
            test_tone_seconds: 0,
            lock_to_sender_ip: None,
            device: DeviceSelector::SystemDefault,
        }
    }
}

impl ReceiverConfig {
    /// Reject invalid values before any resource is acquired.
    pub fn validate(&self) -> Result<(), Error> {
        if self.listen_port == 0 {
            return Err(Error::Config("listen port must be non-zero".into()));
        }
        if self.channels != 1 && self.channels != 2 {
            return Err(Error::Config(format!(
                "unsupported channel count: {} (expected 1 or 2)",
                self.channels
            )));
        }
        if self.buffer_length_ms == 0 {
            return Err(Error::Config("buffer length must be positive".into()));
        }
        if self.output_latency_ms == 0 {
            return Err(Error::Config("output latency must be positive".into()));
        }
        Ok(())
    }

    /// Jitter depth in packets, assuming 20ms frames on the wire.
    pub fn jitter_target_packets(&self) -> usize {
        ((self.jitter_target_delay_ms + 19) / 20).max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps_ranges() {
        let config = StreamingConfig::sanitize(1, 10_000, 42, 15, true, 99);
        assert_eq!(config.bitrate_bps, StreamingConfig::MIN_BITRATE_BPS);
        assert_eq!(config.complexity, StreamingConfig::MAX_COMPLEXITY);
        assert_eq!(config.frame_duration, FrameDuration::Ms20);
        assert_eq!(
            config.expected_loss_percent,
            StreamingConfig::MAX_EXPECTED_LOSS_PERCENT
        );
    }

    #[test]
    fn test_stereo_raises_bitrate_floor() {
        let config = StreamingConfig::sanitize(2, 48_000, 8, 20, true, 5);
        assert_eq!(config.bitrate_bps, StreamingConfig::STEREO_MIN_BITRATE_BPS);
    }

    #[test]
    fn test_frame_sizes() {
        let config = StreamingConfig::sanitize(2, 96_000, 8, 10, false, 0);
        assert_eq!(config.samples_per_frame(), 960);
        assert_eq!(config.frame_bytes(), 1920);

        let config = StreamingConfig::voice_clean();
        assert_eq!(config.samples_per_frame(), 960);
    }

    #[test]
    fn test_receiver_config_validation() {
        let mut config = ReceiverConfig::default();
        assert!(config.validate().is_ok());

        config.listen_port = 0;
        assert!(config.validate().is_err());

        config.listen_port = DEFAULT_PORT;
        config.channels = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_target_packets() {
        let mut config = ReceiverConfig::default();
        config.jitter_target_delay_ms = 60;
        assert_eq!(config.jitter_target_packets(), 3);

        config.jitter_target_delay_ms = 0;
        assert_eq!(config.jitter_target_packets(), 1);

        config.jitter_target_delay_ms = 21;
        assert_eq!(config.jitter_target_packets(), 2);
    }
}
