//! Source → handoff queue → sink, with the controller that owns them

pub mod controller;
pub mod handoff;
pub mod monitor;
pub mod pool;
pub mod sequence;
pub mod sink;
pub mod source;
pub mod state;

pub use controller::{Pipeline, PipelineReport, RunningPipeline};
pub use handoff::BackpressureMonitor;
pub use monitor::LossMonitor;
pub use pool::{FramePool, FrameSlot};
pub use sequence::{LossCounter, Observation, SequenceTracker};
pub use state::{PipelineContext, RunState, StatsSnapshot};
