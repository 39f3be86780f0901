//! Consumer: drains the handoff queue into persistence

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument};

use crate::capture::frame::Frame;
use crate::error::{PipelineError, StorageError};
use crate::pipeline::handoff::{HandoffReceiver, Popped};
use crate::pipeline::pool::FramePool;
use crate::pipeline::state::{PipelineContext, RunState};
use crate::storage::Persistence;

pub struct Sink<P: Persistence> {
    store: P,
    queue: HandoffReceiver,
    pool: Arc<FramePool>,
    ctx: Arc<PipelineContext>,
    max_images: u32,
    frames_in_file: u32,
    poll_interval: Duration,
}

impl<P: Persistence> Sink<P> {
    pub fn new(
        store: P,
        queue: HandoffReceiver,
        pool: Arc<FramePool>,
        ctx: Arc<PipelineContext>,
        max_images: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            pool,
            ctx,
            max_images: max_images.max(1),
            frames_in_file: 0,
            poll_interval,
        }
    }

    /// Run until the pipeline leaves `Running`, then hand the store back for closing.
    #[instrument(skip_all, name = "sink")]
    pub fn run(mut self) -> P {
        info!("Sink started");
        while self.ctx.is_running() {
            let slot = match self.queue.pop(self.poll_interval) {
                Popped::Slot(slot) => slot,
                Popped::Empty => continue,
                Popped::Closed => break,
            };

            let result = self.persist(slot.frame());
            self.pool.release(slot);

            if let Err(err) = result {
                error!("Could not write to the data file: {}", err);
                self.ctx.fail(RunState::Error, PipelineError::Persistence(err));
                break;
            }
        }
        info!("Sink exiting ({})", self.ctx.state());
        self.store
    }

    fn persist(&mut self, frame: Frame<'_>) -> Result<(), StorageError> {
        let payload = frame.payload;
        let written = self.store.write(payload)?;
        if written != payload.len() {
            return Err(StorageError::ShortWrite {
                written,
                expected: payload.len(),
            });
        }
        self.ctx.stats().record_written();

        // Keep the file bounded: start over once it holds max_images frames
        self.frames_in_file += 1;
        if self.frames_in_file >= self.max_images {
            self.store.reset_cursor()?;
            self.frames_in_file = 0;
            debug!(
                "Ring file full at {} frames, wrapping after frame {}",
                self.max_images, frame.meta.sequence
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameDescriptor;
    use crate::pipeline::handoff;
    use crate::storage::RingWriter;
    use std::io::Cursor;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(5);

    fn publish(pool: &FramePool, tx: &handoff::HandoffSender, value: u8, len: usize) {
        let mut slot = pool.acquire_next_slot(WAIT).unwrap();
        slot.buffer_mut().fill(value);
        slot.commit(
            FrameDescriptor {
                sequence: u64::from(value),
                ..Default::default()
            },
            len,
        );
        tx.push(slot).unwrap();
    }

    fn stop_after(ctx: &Arc<PipelineContext>, frames: u64) {
        while ctx.snapshot().frames_written < frames {
            thread::sleep(Duration::from_millis(1));
        }
        ctx.transition(RunState::UserStopped);
    }

    #[test]
    fn writes_actual_frame_size_and_wraps() {
        let pool = Arc::new(FramePool::new(8, 16));
        let ctx = Arc::new(PipelineContext::new());
        let (tx, rx) = handoff::channel(8);
        let store = RingWriter::new(Cursor::new(Vec::new()));
        let sink = Sink::new(store, rx, Arc::clone(&pool), Arc::clone(&ctx), 3, WAIT);
        let handle = thread::spawn(move || sink.run());

        // 3 * 1 + 2 frames of 4 bytes through a 3-frame ring
        for value in 1..=5 {
            while pool.free_slots() == 0 {
                thread::yield_now();
            }
            publish(&pool, &tx, value, 4);
        }
        stop_after(&ctx, 5);

        let bytes = handle.join().unwrap().into_inner().into_inner();
        assert_eq!(
            bytes,
            [[4u8; 4], [5; 4], [3; 4]].concat(),
            "last two frames at the start, leftover third frame after"
        );
        assert_eq!(pool.free_slots(), 8);
    }

    struct FullDisk;

    impl Persistence for FullDisk {
        fn write(&mut self, bytes: &[u8]) -> Result<usize, StorageError> {
            Ok(bytes.len() / 2)
        }

        fn reset_cursor(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        fn close(self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn short_write_is_fatal() {
        let pool = Arc::new(FramePool::new(4, 8));
        let ctx = Arc::new(PipelineContext::new());
        let (tx, rx) = handoff::channel(4);
        publish(&pool, &tx, 1, 8);

        let sink = Sink::new(FullDisk, rx, Arc::clone(&pool), Arc::clone(&ctx), 32, WAIT);
        sink.run();

        assert_eq!(ctx.state(), RunState::Error);
        assert!(matches!(
            ctx.take_failure(),
            Some(PipelineError::Persistence(StorageError::ShortWrite {
                written: 4,
                expected: 8
            }))
        ));
        assert_eq!(ctx.snapshot().frames_written, 0);
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn exits_when_source_disconnects() {
        let pool = Arc::new(FramePool::new(4, 8));
        let ctx = Arc::new(PipelineContext::new());
        let (tx, rx) = handoff::channel(4);
        drop(tx);
        let store = RingWriter::new(Cursor::new(Vec::new()));
        Sink::new(store, rx, pool, Arc::clone(&ctx), 32, WAIT).run();
        assert!(ctx.is_running());
    }
}
