//! Pipeline controller: startup, health check, cancellation and shutdown

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::capture::device::Device;
use crate::error::{PipelineError, Result};
use crate::pipeline::handoff::{self, BackpressureMonitor};
use crate::pipeline::pool::FramePool;
use crate::pipeline::sink::Sink;
use crate::pipeline::source::Source;
use crate::pipeline::state::{PipelineContext, RunState, StatsSnapshot};
use crate::storage::Persistence;
use crate::{utils, Config};

/// Outcome of a finished run
#[derive(Debug)]
pub struct PipelineReport {
    pub final_state: RunState,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    /// What ended the run, if it was not the operator
    pub error: Option<PipelineError>,
}

impl PipelineReport {
    pub fn exit_code(&self) -> i32 {
        match (&self.error, self.final_state) {
            (Some(_), RunState::UserStopped) => 1,
            (_, state) => state.exit_code(),
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Start the device stream and both workers, then give them `settle_ms`
    /// to fail fast. A run that is no longer `Running` after the settle delay
    /// is shut down and its failure returned.
    pub fn start<P: Persistence>(
        config: &Config,
        device: Arc<dyn Device>,
        store: P,
    ) -> Result<RunningPipeline<P>> {
        config.validate()?;
        let p = &config.pipeline;

        device
            .start_stream()
            .map_err(|e| PipelineError::Initialization(format!("could not start the stream: {e}")))?;

        let ctx = Arc::new(PipelineContext::new());
        let pool = Arc::new(FramePool::new(p.pool_capacity, p.slot_bytes));
        let (tx, rx) = handoff::channel(p.pool_capacity);
        let [source_core, sink_core] = match p.pin_cores {
            Some([a, b]) => [Some(a), Some(b)],
            None => [None, None],
        };

        let mut running = RunningPipeline {
            ctx: Arc::clone(&ctx),
            device: Arc::clone(&device),
            pool: Arc::clone(&pool),
            source: None,
            sink: None,
            grace: p.shutdown_grace(),
        };

        let sink = Sink::new(
            store,
            rx,
            Arc::clone(&pool),
            Arc::clone(&ctx),
            config.storage.max_images,
            p.poll_interval(),
        );
        match spawn("sink", sink_core, move || sink.run()) {
            Ok(handle) => running.sink = Some(handle),
            Err(err) => {
                running.shutdown();
                return Err(err);
            }
        }

        let source = Source::new(
            device,
            pool,
            tx,
            BackpressureMonitor::new(p.pool_capacity, p.overrun_margin),
            p.overrun_policy,
            Arc::clone(&ctx),
            p.poll_interval(),
        );
        match spawn("source", source_core, move || source.run()) {
            Ok(handle) => running.source = Some(handle),
            Err(err) => {
                running.shutdown();
                return Err(err);
            }
        }

        // Startup health check
        if ctx.wait(p.settle()) != RunState::Running {
            let report = running.shutdown();
            return Err(report.error.unwrap_or_else(|| {
                PipelineError::Initialization(format!(
                    "pipeline ended during startup ({})",
                    report.final_state
                ))
            }));
        }

        info!(
            "Pipeline running: {} slots of {} bytes, overrun at depth {}",
            p.pool_capacity,
            p.slot_bytes,
            p.pool_capacity - p.overrun_margin
        );
        Ok(running)
    }
}

fn spawn<T: Send + 'static>(
    name: &'static str,
    core: Option<usize>,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<JoinHandle<T>> {
    thread::Builder::new()
        .name(format!("shutter-{name}"))
        .spawn(move || {
            if let Some(core) = core {
                if utils::pin_current_thread(core) {
                    info!("Pinned {} worker to core {}", name, core);
                }
            }
            f()
        })
        .map_err(|source| PipelineError::Spawn { name, source })
}

/// Wait for `handle` until `deadline`. A worker still running then is detached.
fn join_by<T>(name: &'static str, handle: JoinHandle<T>, deadline: Instant) -> Result<Option<T>> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{} worker did not exit within the grace period, detaching", name);
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle
        .join()
        .map(Some)
        .map_err(|_| PipelineError::WorkerPanicked(name))
}

/// A started pipeline. Dropping it without [`RunningPipeline::shutdown`]
/// still stops the device stream.
pub struct RunningPipeline<P: Persistence> {
    ctx: Arc<PipelineContext>,
    device: Arc<dyn Device>,
    pool: Arc<FramePool>,
    source: Option<JoinHandle<()>>,
    sink: Option<JoinHandle<P>>,
    grace: Duration,
}

impl<P: Persistence> RunningPipeline<P> {
    pub fn state(&self) -> RunState {
        self.ctx.state()
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.ctx.snapshot()
    }

    /// Operator cancellation. No effect once the run has ended.
    pub fn stop(&self) -> bool {
        let stopped = self.ctx.transition(RunState::UserStopped);
        if stopped {
            info!("Stop requested by user");
        }
        stopped
    }

    /// Block until the run leaves `Running` or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> RunState {
        self.ctx.wait(timeout)
    }

    /// Stop the stream, reap both workers within the grace period, close the store.
    pub fn shutdown(mut self) -> PipelineReport {
        self.stop();
        let final_state = self.ctx.state();
        let mut failure = self.ctx.take_failure();

        // Unblocks a source parked in next_frame
        if let Err(err) = self.device.stop_stream() {
            warn!("Could not stop the stream: {}", err);
        }

        let deadline = Instant::now() + self.grace;
        if let Some(handle) = self.source.take() {
            if let Err(err) = join_by("source", handle, deadline) {
                error!("{}", err);
                failure.get_or_insert(err);
            }
        }
        if let Some(handle) = self.sink.take() {
            match join_by("sink", handle, deadline) {
                Ok(Some(store)) => {
                    if let Err(err) = store.close() {
                        error!("Could not close the data file: {}", err);
                        failure.get_or_insert(err.into());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!("{}", err);
                    failure.get_or_insert(err);
                }
            }
        }

        let in_flight = self.pool.in_flight();
        if in_flight > 0 {
            info!("Discarding {} unwritten frames", in_flight);
        }

        let report = PipelineReport {
            final_state,
            stats: self.ctx.snapshot(),
            elapsed: self.ctx.elapsed(),
            error: failure,
        };
        info!(
            "Pipeline finished ({}): {} frames received, {} written, {} lost",
            report.final_state,
            report.stats.frames_received,
            report.stats.frames_written,
            report.stats.frames_lost
        );
        report
    }
}

impl<P: Persistence> Drop for RunningPipeline<P> {
    fn drop(&mut self) {
        if self.source.is_some() || self.sink.is_some() {
            self.ctx.transition(RunState::UserStopped);
            let _ = self.device.stop_stream();
        }
    }
}
