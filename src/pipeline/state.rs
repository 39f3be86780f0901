//! Run state and counters shared by the controller and both workers

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use crate::error::PipelineError;
use crate::pipeline::sequence::LossCounter;

/// Lifecycle of a run. Leaves `Running` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Running = 0,
    UserStopped = 1,
    /// The sink could not keep up with the source
    Overrun = 2,
    Error = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::UserStopped,
            2 => Self::Overrun,
            _ => Self::Error,
        }
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Process exit code for a run that ended in this state
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Running | Self::UserStopped => 0,
            Self::Error => 1,
            Self::Overrun => 2,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::UserStopped => "stopped by user",
            Self::Overrun => "sink overrun",
            Self::Error => "error",
        })
    }
}

#[derive(Default)]
pub struct PipelineStats {
    frames_received: CachePadded<AtomicU64>,
    frames_written: CachePadded<AtomicU64>,
    transient_errors: CachePadded<AtomicU64>,
    peak_queue_depth: CachePadded<AtomicUsize>,
}

impl PipelineStats {
    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("shutter_frames_received").increment(1);
    }

    pub fn record_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("shutter_frames_written").increment(1);
    }

    pub fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("shutter_transient_errors").increment(1);
    }

    pub fn record_depth(&self, depth: usize) {
        self.peak_queue_depth.fetch_max(depth, Ordering::Relaxed);
        metrics::gauge!("shutter_queue_depth").set(depth as f64);
    }
}

/// Point-in-time copy of the run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_written: u64,
    pub frames_lost: i64,
    pub transient_errors: u64,
    pub peak_queue_depth: usize,
}

/// Controller-owned context handed to both workers
pub struct PipelineContext {
    state: AtomicU8,
    changed: Condvar,
    // Guards nothing but the condvar handshake
    gate: Mutex<()>,
    failure: Mutex<Option<PipelineError>>,
    stats: PipelineStats,
    loss: LossCounter,
    started: Instant,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Running as u8),
            changed: Condvar::new(),
            gate: Mutex::new(()),
            failure: Mutex::new(None),
            stats: PipelineStats::default(),
            loss: LossCounter::new(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Move out of `Running`. Only the first caller wins; later transitions
    /// are ignored and return false.
    pub fn transition(&self, to: RunState) -> bool {
        if to.is_running() {
            return false;
        }
        let won = self
            .state
            .compare_exchange(
                RunState::Running as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            self.changed.notify_all();
        }
        won
    }

    /// Transition and record the cause. The first failure is the one kept.
    pub fn fail(&self, to: RunState, error: PipelineError) -> bool {
        // Held across the transition so a woken waiter cannot miss the cause
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let won = self.transition(to);
        if won {
            *failure = Some(error);
        }
        won
    }

    pub fn take_failure(&self) -> Option<PipelineError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Block until the run leaves `Running` or `timeout` passes; returns the state then.
    pub fn wait(&self, timeout: Duration) -> RunState {
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .changed
            .wait_timeout_while(gate, timeout, |_| self.is_running())
            .unwrap_or_else(PoisonError::into_inner);
        self.state()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn loss(&self) -> &LossCounter {
        &self.loss
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_lost: self.loss.lost(),
            transient_errors: self.stats.transient_errors.load(Ordering::Relaxed),
            peak_queue_depth: self.stats.peak_queue_depth.load(Ordering::Relaxed),
        }
    }
}
