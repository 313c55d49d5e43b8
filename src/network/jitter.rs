//! Sequence-ordered jitter buffer
//!
//! Absorbs UDP reordering by holding packets until a target depth is
//! reached, then releases payloads in strictly increasing sequence order.
//! Gaps are skipped one sequence number at a time so a lost packet can
//! never stall playout; late arrivals behind the playout cursor are
//! dropped. The buffer operates purely on sequence numbers and opaque
//! payloads and is owned exclusively by the receive loop.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Result of inserting one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Stored, but arrived out of transmission order (statistic only)
    Reordered,
    /// Sequence is behind the playout cursor; payload was not stored
    LateDropped,
}

/// Wraparound-aware "a is before b" comparison.
///
/// Interprets the distance as a signed 32-bit value, so 0 is after
/// u32::MAX by one step rather than four billion steps before it.
#[inline]
fn sequence_less_than(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Reassembly buffer keyed by sequence number
pub struct SequenceJitterBuffer {
    buffer: BTreeMap<u32, Bytes>,
    /// Next sequence to release
    expected_sequence: Option<u32>,
    last_enqueued_sequence: Option<u32>,
    /// Minimum buffered depth before any release begins
    target_delay_packets: usize,
    /// Hard cap; always greater than the target
    max_buffered_packets: usize,
}

impl SequenceJitterBuffer {
    pub fn new(target_delay_packets: usize, max_buffered_packets: usize) -> Self {
        let target_delay_packets = target_delay_packets.max(1);
        Self {
            buffer: BTreeMap::new(),
            expected_sequence: None,
            last_enqueued_sequence: None,
            target_delay_packets,
            max_buffered_packets: max_buffered_packets.max(target_delay_packets + 1),
        }
    }

    /// Insert one packet. The first packet seeds the playout cursor.
    pub fn enqueue(&mut self, sequence: u32, _timestamp_ms: u32, payload: Bytes) -> EnqueueOutcome {
        let expected = *self.expected_sequence.get_or_insert(sequence);

        if sequence_less_than(sequence, expected) {
            return EnqueueOutcome::LateDropped;
        }

        let reordered = self
            .last_enqueued_sequence
            .is_some_and(|last| sequence_less_than(sequence, last));
        self.last_enqueued_sequence = Some(sequence);

        // Overwrite any duplicate; the old payload is released here
        self.buffer.insert(sequence, payload);

        while self.buffer.len() > self.max_buffered_packets {
            if let Some((oldest, _)) = self.buffer.pop_first() {
                // Never stall on a slot we just threw away
                if Some(oldest) == self.expected_sequence {
                    self.expected_sequence = Some(oldest.wrapping_add(1));
                }
            }
        }

        if reordered {
            EnqueueOutcome::Reordered
        } else {
            EnqueueOutcome::Accepted
        }
    }

    /// Release the next payload in sequence order, if the buffer is deep
    /// enough.
    ///
    /// `skipped` is the number of missing sequence numbers stepped over to
    /// reach the returned payload. Returns `None` while the buffered depth
    /// is below the target delay, which is the deliberate playout delay
    /// that absorbs jitter.
    pub fn try_dequeue(&mut self) -> Option<(Bytes, u32)> {
        let mut expected = self.expected_sequence?;
        if self.buffer.len() < self.target_delay_packets {
            return None;
        }

        let mut skipped = 0u32;
        loop {
            if let Some(payload) = self.buffer.remove(&expected) {
                self.expected_sequence = Some(expected.wrapping_add(1));
                return Some((payload, skipped));
            }

            let earliest = *self.buffer.keys().next()?;
            if !sequence_less_than(expected, earliest) {
                // The cursor is at or past everything buffered; step it
                // forward without charging a skip
                expected = expected.wrapping_add(1);
                self.expected_sequence = Some(expected);
                continue;
            }

            skipped += 1;
            expected = expected.wrapping_add(1);
            self.expected_sequence = Some(expected);

            if self.buffer.len() < self.target_delay_packets {
                return None;
            }
        }
    }

    /// Number of buffered packets
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear all state, e.g. when a session restarts.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_sequence = None;
        self.last_enqueued_sequence = None;
    }
}
