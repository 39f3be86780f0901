//! FIFO handoff of filled slots from the source to the sink

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::pipeline::pool::FrameSlot;

/// Flags the sink as overrun once queue depth reaches `capacity - margin`,
/// while `margin` slots are still free.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureMonitor {
    capacity: usize,
    margin: usize,
}

impl BackpressureMonitor {
    pub fn new(capacity: usize, margin: usize) -> Self {
        Self { capacity, margin }
    }

    pub fn threshold(&self) -> usize {
        self.capacity.saturating_sub(self.margin)
    }

    pub fn is_overrun(&self, queue_depth: usize) -> bool {
        queue_depth >= self.threshold()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Create a handoff queue that can hold every slot of a `capacity` pool
pub fn channel(capacity: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = flume::bounded(capacity);
    (HandoffSender { tx }, HandoffReceiver { rx })
}

pub struct HandoffSender {
    tx: Sender<FrameSlot>,
}

impl HandoffSender {
    /// Enqueue without blocking, returning the depth after the push.
    pub fn push(&self, slot: FrameSlot) -> Result<usize, TrySendError<FrameSlot>> {
        self.tx.try_send(slot)?;
        Ok(self.tx.len())
    }

    pub fn depth(&self) -> usize {
        self.tx.len()
    }
}

pub enum Popped {
    Slot(FrameSlot),
    Empty,
    /// The source is gone and nothing is left
    Closed,
}

pub struct HandoffReceiver {
    rx: Receiver<FrameSlot>,
}

impl HandoffReceiver {
    /// Wait up to `timeout` for the oldest slot
    pub fn pop(&self, timeout: Duration) -> Popped {
        match self.rx.recv_timeout(timeout) {
            Ok(slot) => Popped::Slot(slot),
            Err(RecvTimeoutError::Timeout) => Popped::Empty,
            Err(RecvTimeoutError::Disconnected) => Popped::Closed,
        }
    }

    pub fn depth(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameDescriptor;
    use crate::pipeline::pool::FramePool;
    use proptest::prelude::*;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(5);

    #[test]
    fn overrun_boundary() {
        let monitor = BackpressureMonitor::new(16, 3);
        assert_eq!(monitor.threshold(), 13);
        assert!(!monitor.is_overrun(0));
        assert!(!monitor.is_overrun(12));
        assert!(monitor.is_overrun(13));
        assert!(monitor.is_overrun(16));
    }

    #[test]
    fn pops_in_push_order() {
        let pool = FramePool::new(8, 4);
        let (tx, rx) = channel(8);
        for _ in 0..5 {
            let slot = pool.acquire_next_slot(WAIT).unwrap();
            tx.push(slot).unwrap();
        }
        assert_eq!(rx.depth(), 5);

        let order: Vec<usize> = std::iter::from_fn(|| match rx.pop(WAIT) {
            Popped::Slot(slot) => Some(slot.index()),
            _ => None,
        })
        .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reports_empty_then_closed() {
        let (tx, rx) = channel(4);
        assert!(matches!(rx.pop(WAIT), Popped::Empty));
        drop(tx);
        assert!(matches!(rx.pop(WAIT), Popped::Closed));
    }

    #[test]
    fn fifo_survives_concurrent_producer_and_consumer() {
        let pool = std::sync::Arc::new(FramePool::new(8, 8));
        let (tx, rx) = channel(8);

        let producer_pool = std::sync::Arc::clone(&pool);
        let producer = thread::spawn(move || {
            for sequence in 0..5_000u64 {
                let mut slot = loop {
                    if let Some(slot) = producer_pool.acquire_next_slot(WAIT) {
                        break slot;
                    }
                };
                slot.buffer_mut().copy_from_slice(&sequence.to_le_bytes());
                slot.commit(
                    FrameDescriptor {
                        sequence,
                        ..Default::default()
                    },
                    8,
                );
                tx.push(slot).unwrap();
            }
        });

        let mut seen = Vec::with_capacity(5_000);
        loop {
            match rx.pop(WAIT) {
                Popped::Slot(slot) => {
                    let bytes: [u8; 8] = slot.payload().try_into().unwrap();
                    assert_eq!(u64::from_le_bytes(bytes), slot.meta().sequence);
                    seen.push(slot.meta().sequence);
                    pool.release(slot);
                }
                Popped::Empty => continue,
                Popped::Closed => break,
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..5_000).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn any_interleaving_pops_in_push_order(
            ops in proptest::collection::vec(any::<bool>(), 1..200)
        ) {
            let pool = FramePool::new(8, 8);
            let (tx, rx) = channel(8);
            let mut pushed = 0u64;
            let mut popped = Vec::new();

            for push in ops {
                if push {
                    if let Some(mut slot) = pool.acquire_next_slot(Duration::ZERO) {
                        slot.buffer_mut().copy_from_slice(&pushed.to_le_bytes());
                        slot.commit(
                            FrameDescriptor {
                                sequence: pushed,
                                ..Default::default()
                            },
                            8,
                        );
                        prop_assert!(tx.push(slot).is_ok());
                        pushed += 1;
                    }
                } else if let Popped::Slot(slot) = rx.pop(Duration::ZERO) {
                    prop_assert_eq!(slot.payload(), &slot.meta().sequence.to_le_bytes()[..]);
                    popped.push(slot.meta().sequence);
                    pool.release(slot);
                }
                prop_assert!(rx.depth() <= 8);
                prop_assert_eq!(pool.in_flight(), rx.depth());
            }

            while let Popped::Slot(slot) = rx.pop(Duration::ZERO) {
                popped.push(slot.meta().sequence);
                pool.release(slot);
            }
            prop_assert_eq!(popped, (0..pushed).collect::<Vec<_>>());
        }
    }
}
