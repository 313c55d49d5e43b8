//! # mic-link
//!
//! Low-latency phone-microphone streaming to a desktop over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────── SENDER ─────────────────────────┐
//! │  ┌────────────┐    ┌──────┐    ┌─────────┐   ┌──────┐   │
//! │  │ Microphone │ ─▶ │ Gain │ ─▶ │  Opus   │ ─▶│ UDP  │   │
//! │  │  (capture  │    │stage │    │ Encoder │   │ send │   │
//! │  │   source)  │    └──────┘    └─────────┘   └──┬───┘   │
//! │  └────────────┘   Packets: [Seq|TimestampMs|Opus]       │
//! └───────────────────────────────────────────────────┼─────┘
//!                                                     │ UDP
//! ┌──────────────────────── RECEIVER ──────────────────┼─────┐
//! │  ┌──────┐   ┌─────────┐   ┌─────────┐   ┌──────────▼──┐  │
//! │  │Render│◀─ │Playback │◀─ │  Opus   │◀─ │   Jitter    │  │
//! │  │device│   │ buffer  │   │ Decoder │   │   buffer    │  │
//! │  └──────┘   │(+resamp)│   │(+remap) │   └─────────────┘  │
//! │             └─────────┘   └─────────┘                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The sender captures fixed-duration PCM frames, applies a gain stage,
//! compresses each frame with Opus, and ships it in a datagram carrying an
//! 8-byte sequence/timestamp header. The receiver reorders datagrams through
//! a sequence-based jitter buffer, decodes and channel-remaps, and feeds a
//! ring-style playback buffer that discards the oldest audio on overflow.

pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod protocol;
pub mod settings;
pub mod stats;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Stream sample rate; the codec and the wire format assume it
    pub const SAMPLE_RATE: u32 = 48_000;

    /// Default UDP port for the audio stream
    pub const DEFAULT_PORT: u16 = 5555;

    /// Maximum UDP payload (MTU minus IP/UDP headers)
    pub const MAX_PACKET_SIZE: usize = 1472;

    /// Capture queue capacity between the device callback and the capture loop
    pub const CAPTURE_QUEUE_CAPACITY: usize = 256;

    /// Interval for status and statistics publication
    pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

    /// Interval for the render-device liveness poll
    pub const DEVICE_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

    /// Bounded wait when joining capture/playback threads during stop
    pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

    /// Bounded wait for the receiver run task during stop
    pub const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(5);

    /// Clipped samples per second above which a clipping warning is raised
    pub const CLIP_WARNING_SAMPLES_PER_SEC: u64 = 50;

    /// Playback depth below which an underrun is counted, in milliseconds
    pub const UNDERRUN_LOW_WATER_MS: f64 = 10.0;

    /// Hard cap on buffered packets in the jitter buffer
    pub const MAX_BUFFERED_PACKETS: usize = 200;

    /// Test tone defaults
    pub const TEST_TONE_FREQUENCY_HZ: f32 = 440.0;
    pub const TEST_TONE_AMPLITUDE: f32 = 0.2;
}
