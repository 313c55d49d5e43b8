//! Property tests for the jitter buffer
//!
//! These hold for any insertion order: output sequences are strictly
//! increasing, late packets never surface, and the buffer never exceeds its
//! cap.

use bytes::Bytes;
use proptest::prelude::*;

use mic_link::network::jitter::{EnqueueOutcome, SequenceJitterBuffer};

fn payload_for(seq: u32) -> Bytes {
    Bytes::copy_from_slice(&seq.to_be_bytes())
}

fn seq_of(payload: &Bytes) -> u32 {
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
}

proptest! {
    /// Output is monotonic and bounded for arbitrary arrival orders.
    #[test]
    fn dequeue_order_is_strictly_increasing(
        base in any::<u32>(),
        offsets in proptest::collection::vec(0u32..64, 1..200),
        target in 1usize..8,
        max in 8usize..32,
    ) {
        let mut jb = SequenceJitterBuffer::new(target, max);
        let mut last_released: Option<u32> = None;

        for offset in offsets {
            let seq = base.wrapping_add(offset);
            jb.enqueue(seq, 0, payload_for(seq));
            prop_assert!(jb.len() <= max.max(target + 1));

            while let Some((payload, _skipped)) = jb.try_dequeue() {
                let released = seq_of(&payload);
                if let Some(last) = last_released {
                    // Wraparound-aware "strictly after" check
                    prop_assert!(
                        (released.wrapping_sub(last) as i32) > 0,
                        "released {released} after {last}"
                    );
                }
                last_released = Some(released);
            }
        }
    }

    /// A packet behind the playout cursor is reported late and never
    /// appears in any later dequeue.
    #[test]
    fn late_packets_never_surface(
        base in any::<u32>(),
        late_offset in 1u32..16,
        target in 1usize..4,
    ) {
        let mut jb = SequenceJitterBuffer::new(target, 64);

        // Fill past the target so the first packet releases, advancing the
        // cursor beyond `base`
        for offset in 0..(target as u32 + 1) {
            let seq = base.wrapping_add(offset);
            jb.enqueue(seq, 0, payload_for(seq));
        }
        let (first, _) = jb.try_dequeue().expect("target depth reached");
        prop_assert_eq!(seq_of(&first), base);

        let late_seq = base.wrapping_sub(late_offset);
        prop_assert_eq!(
            jb.enqueue(late_seq, 0, payload_for(late_seq)),
            EnqueueOutcome::LateDropped
        );

        // Drain everything; the late sequence must not appear
        loop {
            for offset in 0..8u32 {
                let seq = base.wrapping_add(target as u32 + 1 + offset);
                jb.enqueue(seq, 0, payload_for(seq));
            }
            let mut released_any = false;
            while let Some((payload, _)) = jb.try_dequeue() {
                released_any = true;
                prop_assert_ne!(seq_of(&payload), late_seq);
            }
            if !released_any {
                break;
            }
        }
    }

    /// Exactly `target` consecutive packets release the lowest with no
    /// skips.
    #[test]
    fn consecutive_fill_releases_lowest(
        base in any::<u32>(),
        target in 1usize..16,
    ) {
        let mut jb = SequenceJitterBuffer::new(target, 200);
        for offset in 0..target as u32 {
            let seq = base.wrapping_add(offset);
            jb.enqueue(seq, 0, payload_for(seq));
            if (offset as usize) < target - 1 {
                prop_assert!(jb.try_dequeue().is_none());
            }
        }
        let (payload, skipped) = jb.try_dequeue().expect("depth equals target");
        prop_assert_eq!(seq_of(&payload), base);
        prop_assert_eq!(skipped, 0);
    }

    /// A single missing packet is skipped exactly once.
    #[test]
    fn single_gap_counts_one_skip(
        base in any::<u32>(),
        target in 1usize..8,
    ) {
        let mut jb = SequenceJitterBuffer::new(target, 200);

        // base arrives, base+1 is lost, base+2..base+target+1 arrive
        jb.enqueue(base, 0, payload_for(base));
        for offset in 2..(2 + target as u32) {
            let seq = base.wrapping_add(offset);
            jb.enqueue(seq, 0, payload_for(seq));
        }

        let (first, first_skipped) = jb.try_dequeue().expect("depth above target");
        prop_assert_eq!(seq_of(&first), base);
        prop_assert_eq!(first_skipped, 0);

        let (second, second_skipped) = jb.try_dequeue().expect("gap is skippable at depth");
        prop_assert_eq!(seq_of(&second), base.wrapping_add(2));
        prop_assert_eq!(second_skipped, 1);
    }
}
