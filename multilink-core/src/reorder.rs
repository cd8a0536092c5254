//! Jitter buffer for the receive path.
//!
//! Packets of one session may travel different links with different
//! latencies, so they arrive out of order. The [`Reassembler`] orders them by
//! sequence number alone and releases them strictly in increasing order.
//!
//! Head-of-line blocking is bounded two ways: a gap is given up on once the
//! slots waiting behind it reach `max_gap_age`, and the number of buffered
//! slots never exceeds `max_slots`. Either way the missing packet is counted
//! as lost and delivery continues.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::ReorderConfig;

/// Result of admitting one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Delivered now or buffered for later
    Accepted,
    /// Same sequence already waiting in the buffer
    Duplicate,
    /// Sequence already delivered or skipped
    Stale,
}

/// Counters for one reassembler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub stale: u64,
    /// Gaps given up on, by age or by buffer pressure
    pub gaps_skipped: u64,
    /// Subset of `gaps_skipped` forced by a full buffer
    pub forced_skips: u64,
    /// Sequence numbers never received
    pub lost: u64,
}

/// Buffered packet with metadata
#[derive(Debug)]
struct ReorderSlot {
    /// Packet payload
    data: Vec<u8>,
    /// Time when packet was received
    received_at: Instant,
}

/// Sequence-ordered reassembly buffer for one session direction.
#[derive(Debug)]
pub struct Reassembler {
    /// Expected next sequence number; `None` once `u64::MAX` was released
    next_expected: Option<u64>,
    /// Packets that arrived ahead of `next_expected`
    slots: BTreeMap<u64, ReorderSlot>,
    /// In-order packets waiting for `drain`
    ready: VecDeque<(u64, Vec<u8>)>,
    max_slots: usize,
    max_gap_age: Duration,
    stats: ReassemblerStats,
}

impl Reassembler {
    pub fn new(initial_sequence: u64, config: &ReorderConfig) -> Self {
        Self {
            next_expected: Some(initial_sequence),
            slots: BTreeMap::new(),
            ready: VecDeque::new(),
            max_slots: config.max_slots.max(1),
            max_gap_age: config.max_gap_age,
            stats: ReassemblerStats::default(),
        }
    }

    /// Admit one decoded packet.
    pub fn admit(&mut self, sequence: u64, payload: Vec<u8>, now: Instant) -> Admission {
        let Some(next) = self.next_expected else {
            self.stats.stale += 1;
            return Admission::Stale;
        };
        if sequence < next {
            self.stats.stale += 1;
            return Admission::Stale;
        }
        if self.slots.contains_key(&sequence) {
            self.stats.duplicates += 1;
            return Admission::Duplicate;
        }

        self.slots.insert(
            sequence,
            ReorderSlot {
                data: payload,
                received_at: now,
            },
        );
        self.promote();

        while self.slots.len() > self.max_slots {
            self.stats.forced_skips += 1;
            self.skip_to_first_slot();
        }

        Admission::Accepted
    }

    /// Take every packet released so far, in sequence order.
    pub fn drain(&mut self) -> impl Iterator<Item = (u64, Vec<u8>)> + '_ {
        self.ready.drain(..)
    }

    /// Give up on gaps whose waiting slots have aged out.
    ///
    /// Returns the number of gaps skipped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut skipped = 0;
        while self.has_aged_slot(now) {
            self.skip_to_first_slot();
            skipped += 1;
        }
        skipped
    }

    fn has_aged_slot(&self, now: Instant) -> bool {
        self.slots
            .values()
            .any(|slot| now.saturating_duration_since(slot.received_at) >= self.max_gap_age)
    }

    /// Advance `next_expected` past the gap in front of the lowest slot.
    fn skip_to_first_slot(&mut self) {
        let (Some(next), Some(&first)) = (self.next_expected, self.slots.keys().next()) else {
            return;
        };
        let missing = first - next;
        tracing::debug!(from = next, to = first, missing, "reassembly gap skipped");
        self.stats.gaps_skipped += 1;
        self.stats.lost += missing;
        self.next_expected = Some(first);
        self.promote();
    }

    /// Move the contiguous run starting at `next_expected` to the ready queue
    fn promote(&mut self) {
        while let Some(next) = self.next_expected {
            let Some(slot) = self.slots.remove(&next) else {
                break;
            };
            self.ready.push_back((next, slot.data));
            self.stats.delivered += 1;
            self.next_expected = next.checked_add(1);
        }
    }

    /// Get the next expected sequence number
    pub fn next_expected(&self) -> Option<u64> {
        self.next_expected
    }

    /// Number of out-of-order slots currently held
    pub fn buffered(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(max_slots: usize, max_gap_age_ms: u64) -> ReorderConfig {
        ReorderConfig {
            max_slots,
            max_gap_age: Duration::from_millis(max_gap_age_ms),
            ..ReorderConfig::default()
        }
    }

    fn sequences(r: &mut Reassembler) -> Vec<u64> {
        r.drain().map(|(seq, _)| seq).collect()
    }

    #[test]
    fn test_in_order_packets() {
        let now = Instant::now();
        let mut r = Reassembler::new(0, &config(16, 50));

        for seq in 0..3 {
            assert_eq!(r.admit(seq, vec![seq as u8], now), Admission::Accepted);
        }

        let packets: Vec<_> = r.drain().collect();
        assert_eq!(packets, vec![(0, vec![0]), (1, vec![1]), (2, vec![2])]);
        assert_eq!(r.next_expected(), Some(3));
    }

    #[test]
    fn test_three_one_two_delivers_one_two_three() {
        let now = Instant::now();
        let mut r = Reassembler::new(1, &config(16, 50));

        r.admit(3, b"c".to_vec(), now);
        assert!(sequences(&mut r).is_empty());
        r.admit(1, b"a".to_vec(), now);
        assert_eq!(sequences(&mut r), vec![1]);
        r.admit(2, b"b".to_vec(), now);
        assert_eq!(sequences(&mut r), vec![2, 3]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_duplicate_and_stale_discarded() {
        let now = Instant::now();
        let mut r = Reassembler::new(10, &config(16, 50));

        assert_eq!(r.admit(12, vec![1], now), Admission::Accepted);
        assert_eq!(r.admit(12, vec![2], now), Admission::Duplicate);
        assert_eq!(r.admit(10, vec![3], now), Admission::Accepted);
        assert_eq!(r.admit(10, vec![4], now), Admission::Stale);
        assert_eq!(r.admit(9, vec![5], now), Admission::Stale);

        let packets: Vec<_> = r.drain().collect();
        assert_eq!(packets, vec![(10, vec![3])]);

        let stats = r.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.stale, 2);
    }

    #[test]
    fn test_gap_skipped_after_max_age() {
        let start = Instant::now();
        let mut r = Reassembler::new(0, &config(16, 50));

        r.admit(0, vec![0], start);
        r.admit(2, vec![2], start);
        r.admit(3, vec![3], start + Duration::from_millis(20));
        assert_eq!(sequences(&mut r), vec![0]);

        assert_eq!(r.expire(start + Duration::from_millis(49)), 0);
        assert!(sequences(&mut r).is_empty());

        assert_eq!(r.expire(start + Duration::from_millis(50)), 1);
        assert_eq!(sequences(&mut r), vec![2, 3]);
        assert_eq!(r.next_expected(), Some(4));

        // The lost packet turning up late is stale, never redelivered
        assert_eq!(r.admit(1, vec![1], start + Duration::from_millis(60)), Admission::Stale);
        assert_eq!(r.stats().lost, 1);
    }

    #[test]
    fn test_expire_skips_multiple_gaps() {
        let start = Instant::now();
        let mut r = Reassembler::new(0, &config(16, 10));

        r.admit(2, vec![], start);
        r.admit(5, vec![], start);
        r.admit(9, vec![], start + Duration::from_millis(100));

        assert_eq!(r.expire(start + Duration::from_millis(10)), 2);
        assert_eq!(sequences(&mut r), vec![2, 5]);
        assert_eq!(r.buffered(), 1);
        assert_eq!(r.stats().lost, 2 + 2);
    }

    #[test]
    fn test_buffer_full_forces_skip() {
        let now = Instant::now();
        let mut r = Reassembler::new(0, &config(3, 1_000));

        r.admit(1, vec![], now);
        r.admit(2, vec![], now);
        r.admit(3, vec![], now);
        assert!(sequences(&mut r).is_empty());

        assert_eq!(r.admit(5, vec![], now), Admission::Accepted);
        assert_eq!(sequences(&mut r), vec![1, 2, 3]);
        assert_eq!(r.buffered(), 1);
        assert_eq!(r.stats().forced_skips, 1);
    }

    #[test]
    fn test_buffer_full_with_new_lowest_sequence() {
        let now = Instant::now();
        let mut r = Reassembler::new(0, &config(2, 1_000));

        r.admit(5, vec![], now);
        r.admit(6, vec![], now);
        r.admit(2, vec![], now);

        assert_eq!(sequences(&mut r), vec![2]);
        assert_eq!(r.next_expected(), Some(3));
        assert_eq!(r.buffered(), 2);
    }

    #[test]
    fn test_sequence_space_end() {
        let now = Instant::now();
        let mut r = Reassembler::new(u64::MAX - 1, &config(16, 50));

        r.admit(u64::MAX, vec![], now);
        r.admit(u64::MAX - 1, vec![], now);
        assert_eq!(sequences(&mut r), vec![u64::MAX - 1, u64::MAX]);
        assert_eq!(r.next_expected(), None);
        assert_eq!(r.admit(u64::MAX, vec![], now), Admission::Stale);
    }

    proptest! {
        #[test]
        fn any_arrival_order_delivers_in_order(
            order in Just((0u64..64).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let now = Instant::now();
            let mut r = Reassembler::new(0, &config(128, 50));
            let mut delivered = Vec::new();

            for seq in order {
                prop_assert_eq!(r.admit(seq, seq.to_be_bytes().to_vec(), now), Admission::Accepted);
                delivered.extend(r.drain());
            }

            let expected: Vec<_> = (0u64..64).map(|s| (s, s.to_be_bytes().to_vec())).collect();
            prop_assert_eq!(delivered, expected);
        }

        #[test]
        fn output_strictly_increasing_under_pressure(
            arrivals in proptest::collection::vec((0u64..200, 0u64..100), 1..300),
            max_slots in 1usize..16,
        ) {
            let start = Instant::now();
            let mut r = Reassembler::new(0, &config(max_slots, 20));
            let mut last: Option<u64> = None;

            for (seq, at_ms) in arrivals {
                let now = start + Duration::from_millis(at_ms);
                r.admit(seq, Vec::new(), now);
                r.expire(now);
                for (delivered, _) in r.drain() {
                    prop_assert!(last.map_or(true, |l| delivered > l));
                    last = Some(delivered);
                }
                prop_assert!(r.buffered() <= max_slots);
            }
        }
    }
}
