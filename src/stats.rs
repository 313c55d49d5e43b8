//! Session statistics and status records
//!
//! Counters are reset at session start, accumulate monotonically while the
//! session runs, and are published on a fixed interval plus once on stop.

use serde::Serialize;

/// Receiver-side counters, published each statistics tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceiverStats {
    pub packets_per_second: u64,
    pub packets_total: u64,
    pub decode_errors: u64,
    /// Audio currently queued for playback, in milliseconds
    pub buffered_ms: f64,
    pub overflows: u64,
    pub underruns: u64,
    pub malformed_packets: u64,
    pub reordered_packets: u64,
    pub late_packets_dropped: u64,
    pub missing_packets_skipped: u64,
}

impl ReceiverStats {
    pub fn summary(&self) -> String {
        format!(
            "packets/sec={}, packetsTotal={}, decodeErrors={}, malformed={}, reordered={}, \
             lateDrops={}, missingSkips={}, bufferedMs={:.1}, overflows={}, underruns={}",
            self.packets_per_second,
            self.packets_total,
            self.decode_errors,
            self.malformed_packets,
            self.reordered_packets,
            self.late_packets_dropped,
            self.missing_packets_skipped,
            self.buffered_ms,
            self.overflows,
            self.underruns,
        )
    }
}

/// Sender-side status snapshot, published on every status tick and on every
/// state change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SenderStatus {
    pub streaming: bool,
    pub packets_per_second: u64,
    pub dsp_summary: String,
    pub active_input: String,
    pub routing_warning: Option<String>,
    pub clipping_warning: bool,
    pub last_error: Option<String>,
}
