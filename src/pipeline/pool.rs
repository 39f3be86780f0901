//! Preallocated frame slots, recycled round-robin
//!
//! Slots are owned values. The source owns a slot while filling it, the
//! handoff queue owns it while it is in flight, and the sink owns it from
//! dequeue until [`FramePool::release`]. A slot that is still referenced by
//! the queue therefore cannot be handed out again: `acquire_next_slot` waits
//! instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

use crate::capture::frame::{Frame, FrameDescriptor};

/// One reusable payload buffer plus the metadata of the frame it holds
#[derive(Debug)]
pub struct FrameSlot {
    index: usize,
    buffer: Box<[u8]>,
    meta: FrameDescriptor,
    len: usize,
}

impl FrameSlot {
    fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            meta: FrameDescriptor::default(),
            len: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Whole buffer, for the device to fill
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Record what the device wrote. `len` is clamped to the buffer.
    pub fn commit(&mut self, meta: FrameDescriptor, len: usize) {
        self.meta = meta;
        self.len = len.min(self.buffer.len());
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn meta(&self) -> &FrameDescriptor {
        &self.meta
    }

    pub fn frame(&self) -> Frame<'_> {
        Frame {
            payload: self.payload(),
            meta: &self.meta,
        }
    }

    fn reset(&mut self) {
        // Payload bytes are left in place, the next fill overwrites them
        self.len = 0;
        self.meta = FrameDescriptor::default();
    }
}

/// Fixed set of `capacity` slots of `slot_bytes` each.
///
/// Free slots wait in a FIFO. Since the sink releases in the order the source
/// published, slots come back out in strict round-robin order.
pub struct FramePool {
    free_tx: Sender<FrameSlot>,
    free_rx: Receiver<FrameSlot>,
    capacity: usize,
    cursor: AtomicUsize,
}

impl FramePool {
    pub fn new(capacity: usize, slot_bytes: usize) -> Self {
        let (free_tx, free_rx) = flume::bounded(capacity);
        for index in 0..capacity {
            // Cannot fail: the channel has room for every slot and we hold the receiver
            let _ = free_tx.send(FrameSlot::new(index, slot_bytes));
        }
        Self {
            free_tx,
            free_rx,
            capacity,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the next slot in round-robin order, waiting up to `timeout` for
    /// the sink to release it. `None` means the slot is still in flight.
    pub fn acquire_next_slot(&self, timeout: Duration) -> Option<FrameSlot> {
        match self.free_rx.recv_timeout(timeout) {
            Ok(slot) => {
                let expected = self.cursor.load(Ordering::Relaxed);
                debug_assert_eq!(slot.index, expected, "slots must recycle round-robin");
                self.cursor
                    .store((slot.index + 1) & (self.capacity - 1), Ordering::Relaxed);
                Some(slot)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Return a slot whose content has been consumed
    pub fn release(&self, mut slot: FrameSlot) {
        slot.reset();
        let _ = self.free_tx.try_send(slot);
    }

    pub fn free_slots(&self) -> usize {
        self.free_rx.len()
    }

    /// Slots held by the source, the queue or the sink
    pub fn in_flight(&self) -> usize {
        self.capacity - self.free_slots()
    }
}
