//! Frame loss accounting from device sequence numbers
//!
//! A frame newer than expected counts every skipped number as lost. A frame
//! older than expected is taken to be a late arrival of one of those, and
//! takes one back off the count. This is exact for reordering by a single
//! position. Duplicates and deeper reordering are not told apart from late
//! arrivals, so they can drive the count below the true loss, even negative.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// What a single observation did to the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First frame of the session, nothing is counted
    First,
    /// Exactly the expected frame
    InOrder,
    /// `missing` frames between `expected` and this one are assumed lost
    Gap { expected: u64, missing: u64 },
    /// Older than `expected`: a frame previously counted as lost
    Late { expected: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    expected_next: u64,
    lost: i64,
    has_first_frame: bool,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sequence: u64) -> Observation {
        if !self.has_first_frame {
            self.has_first_frame = true;
            self.expected_next = sequence.saturating_add(1);
            self.lost = 0;
            return Observation::First;
        }

        let expected = self.expected_next;
        if sequence < expected {
            self.lost -= 1;
            return Observation::Late { expected };
        }

        let missing = sequence - expected;
        self.lost = self.lost.saturating_add_unsigned(missing);
        self.expected_next = sequence.saturating_add(1);
        if missing == 0 {
            Observation::InOrder
        } else {
            Observation::Gap { expected, missing }
        }
    }

    /// Running loss count
    pub fn lost(&self) -> i64 {
        self.lost
    }

    /// `None` until the first frame has been seen
    pub fn expected_next(&self) -> Option<u64> {
        self.has_first_frame.then_some(self.expected_next)
    }
}

/// A [`SequenceTracker`] shared between threads, plus a received-frame count.
///
/// Every update goes through one lock, so frames reported from several paths
/// (a polling loop and a driver callback, say) are accounted consistently.
#[derive(Debug, Default)]
pub struct LossCounter {
    tracker: Mutex<SequenceTracker>,
    received: AtomicU64,
}

impl LossCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sequence: u64) -> Observation {
        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        self.received.fetch_add(1, Ordering::Relaxed);
        tracker.observe(sequence)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> i64 {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lost()
    }

    pub fn tracker(&self) -> SequenceTracker {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn replay(sequence: &[u64]) -> SequenceTracker {
        let mut tracker = SequenceTracker::new();
        for &seq in sequence {
            tracker.observe(seq);
        }
        tracker
    }

    #[test]
    fn contiguous_sequence_loses_nothing() {
        let tracker = replay(&[1, 2, 3]);
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.expected_next(), Some(4));
    }

    #[test]
    fn gap_counts_missing_frames() {
        let tracker = replay(&[1, 3]);
        assert_eq!(tracker.lost(), 1);
        assert_eq!(tracker.expected_next(), Some(4));
    }

    #[test]
    fn late_arrival_corrects_the_count() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(1), Observation::First);
        assert_eq!(
            tracker.observe(3),
            Observation::Gap {
                expected: 2,
                missing: 1
            }
        );
        assert_eq!(tracker.lost(), 1);
        assert_eq!(tracker.observe(2), Observation::Late { expected: 4 });
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.expected_next(), Some(4));
    }

    #[test]
    fn first_frame_sets_the_baseline() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.expected_next(), None);
        tracker.observe(1000);
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.expected_next(), Some(1001));
    }

    // Known limitation: a duplicate is indistinguishable from a late arrival
    // and is taken as a correction.
    #[test]
    fn duplicate_is_counted_as_a_late_arrival() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(5);
        tracker.observe(6);
        assert_eq!(tracker.observe(6), Observation::Late { expected: 7 });
        assert_eq!(tracker.lost(), -1);
        assert_eq!(tracker.expected_next(), Some(7));

        tracker.observe(8);
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.expected_next(), Some(9));
    }

    // Known limitation: reordering deeper than one position over-corrects.
    #[test]
    fn deep_reorder_undercounts() {
        let tracker = replay(&[1, 4, 2, 3, 5]);
        // 2 and 3 were really late, so the true loss is 0; the count agrees
        assert_eq!(tracker.lost(), 0);

        let tracker = replay(&[1, 4, 3, 3]);
        // 2 is truly lost, but the repeated 3 cancels it
        assert_eq!(tracker.lost(), 0);
    }

    #[test]
    fn concurrent_paths_share_one_count() {
        let counter = Arc::new(LossCounter::new());
        counter.record(0);

        // Two notification paths delivering disjoint halves of 1..=2000, each in order
        let handles: Vec<_> = [0u64, 1]
            .into_iter()
            .map(|parity| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for seq in (1..=2000u64).filter(|s| s % 2 == parity) {
                        counter.record(seq);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.received(), 2001);
        assert_eq!(counter.tracker().expected_next(), Some(2001));
    }

    proptest! {
        #[test]
        fn in_order_stream_counts_exact_gaps(
            first in 0u64..1_000_000,
            steps in proptest::collection::vec(1u64..50, 0..200),
        ) {
            let mut seq = first;
            let mut numbers = vec![first];
            for step in &steps {
                seq += step;
                numbers.push(seq);
            }

            let tracker = replay(&numbers);
            let expected: u64 = steps.iter().map(|s| s - 1).sum();
            prop_assert_eq!(tracker.lost(), expected as i64);
            prop_assert_eq!(tracker.expected_next(), Some(seq + 1));
        }

        #[test]
        fn single_position_swaps_are_fully_corrected(
            len in 2u64..300,
            swaps in proptest::collection::btree_set(2u64..300, 0..40),
        ) {
            // Swap adjacent pairs (k, k+1) for non-overlapping k, without
            // touching the first frame
            let mut numbers: Vec<u64> = (1..=len).collect();
            let mut last_swapped = 0;
            for k in swaps {
                let i = (k - 1) as usize;
                if i + 1 < numbers.len() && (last_swapped == 0 || i > last_swapped + 1) {
                    numbers.swap(i, i + 1);
                    last_swapped = i;
                }
            }

            let tracker = replay(&numbers);
            prop_assert_eq!(tracker.lost(), 0);
            prop_assert_eq!(tracker.expected_next(), Some(len + 1));
        }
    }
}
