//! Producer: pulls frames from the device into pool slots and publishes them

use std::sync::Arc;
use std::time::Duration;

use flume::TrySendError;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::Device;
use crate::capture::frame::FrameDescriptor;
use crate::error::{DeviceError, PipelineError, Result};
use crate::pipeline::handoff::{BackpressureMonitor, HandoffSender};
use crate::pipeline::pool::{FramePool, FrameSlot};
use crate::pipeline::sequence::Observation;
use crate::pipeline::state::{PipelineContext, RunState};
use crate::OverrunPolicy;

pub struct Source {
    device: Arc<dyn Device>,
    pool: Arc<FramePool>,
    queue: HandoffSender,
    monitor: BackpressureMonitor,
    policy: OverrunPolicy,
    ctx: Arc<PipelineContext>,
    poll_interval: Duration,
}

/// What to do after a frame has been handled
enum Flow {
    Continue,
    Halt,
}

impl Source {
    pub fn new(
        device: Arc<dyn Device>,
        pool: Arc<FramePool>,
        queue: HandoffSender,
        monitor: BackpressureMonitor,
        policy: OverrunPolicy,
        ctx: Arc<PipelineContext>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            device,
            pool,
            queue,
            monitor,
            policy,
            ctx,
            poll_interval,
        }
    }

    #[instrument(skip_all, name = "source")]
    pub fn run(self) {
        info!("Source started");
        if let Err(err) = self.acquire_loop() {
            error!("Source failed: {}", err);
            self.ctx.fail(RunState::Error, err);
        }
        info!("Source exiting ({})", self.ctx.state());
    }

    fn acquire_loop(&self) -> Result<()> {
        let mut primed = false;
        // A slot whose acquisition failed is reused for the next attempt
        let mut retry: Option<FrameSlot> = None;

        while self.ctx.is_running() {
            let mut slot = match retry.take() {
                Some(slot) => slot,
                None => match self.pool.acquire_next_slot(self.poll_interval) {
                    Some(slot) => slot,
                    // Every slot is still in flight
                    None => continue,
                },
            };

            // Blocking; stopping the stream unblocks it
            match self.device.next_frame(slot.buffer_mut()) {
                Ok(meta) => {
                    // The priming frame is published and persisted like any later frame
                    primed = true;
                    if let Flow::Halt = self.publish(slot, meta)? {
                        break;
                    }
                }
                Err(_) if !self.ctx.is_running() => {
                    self.pool.release(slot);
                    break;
                }
                Err(err) if !primed => {
                    self.pool.release(slot);
                    return Err(PipelineError::Initialization(format!(
                        "could not get initial frame: {err}"
                    )));
                }
                Err(err) if err.is_transient() => {
                    warn!("Could not get a frame: {}", err);
                    self.ctx.stats().record_transient_error();
                    retry = Some(slot);
                }
                Err(DeviceError::BufferTooSmall { needed, capacity }) => {
                    self.pool.release(slot);
                    return Err(PipelineError::FrameTooLarge {
                        size: needed,
                        capacity,
                    });
                }
                Err(err) => {
                    self.pool.release(slot);
                    return Err(err.into());
                }
            }
        }

        if let Some(slot) = retry {
            self.pool.release(slot);
        }
        Ok(())
    }

    fn publish(&self, mut slot: FrameSlot, meta: FrameDescriptor) -> Result<Flow> {
        let size = meta.frame_size();
        if size > slot.capacity() {
            let capacity = slot.capacity();
            self.pool.release(slot);
            return Err(PipelineError::FrameTooLarge { size, capacity });
        }
        slot.commit(meta, size);
        self.ctx.stats().record_received();

        match self.ctx.loss().record(meta.sequence) {
            Observation::First => debug!("First frame is {}", meta.sequence),
            Observation::InOrder => {}
            Observation::Gap { expected, .. } | Observation::Late { expected } => {
                warn!("Expected frame {}, but got frame {}", expected, meta.sequence);
                metrics::gauge!("shutter_frames_lost").set(self.ctx.loss().lost() as f64);
            }
        }

        if self.policy == OverrunPolicy::Abort {
            let depth = self.queue.depth();
            if self.monitor.is_overrun(depth) {
                error!("The sink cannot keep up with the source -- try slowing down the camera");
                self.pool.release(slot);
                self.ctx.fail(
                    RunState::Overrun,
                    PipelineError::Overrun {
                        depth,
                        capacity: self.monitor.capacity(),
                    },
                );
                return Ok(Flow::Halt);
            }
        }

        match self.queue.push(slot) {
            Ok(depth) => {
                self.ctx.stats().record_depth(depth);
                Ok(Flow::Continue)
            }
            Err(TrySendError::Full(slot)) => {
                self.pool.release(slot);
                let depth = self.queue.depth();
                self.ctx.fail(
                    RunState::Overrun,
                    PipelineError::Overrun {
                        depth,
                        capacity: self.monitor.capacity(),
                    },
                );
                Ok(Flow::Halt)
            }
            Err(TrySendError::Disconnected(slot)) => {
                self.pool.release(slot);
                if self.ctx.is_running() {
                    return Err(PipelineError::WorkerPanicked("sink"));
                }
                Ok(Flow::Halt)
            }
        }
    }
}
