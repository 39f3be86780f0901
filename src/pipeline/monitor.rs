//! Loss monitor: stream from the device without persisting, counting frames

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::capture::device::Device;
use crate::error::{PipelineError, Result};
use crate::pipeline::sequence::{LossCounter, Observation};

pub struct LossMonitor {
    device: Arc<dyn Device>,
    counter: Arc<LossCounter>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LossMonitor {
    /// Start the stream and a reader thread feeding `LossCounter`.
    /// `frame_bytes` sizes the scratch buffer frames are read into.
    pub fn start(device: Arc<dyn Device>, frame_bytes: usize) -> Result<Self> {
        device
            .start_stream()
            .map_err(|e| PipelineError::Initialization(format!("could not start the stream: {e}")))?;

        let counter = Arc::new(LossCounter::new());
        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let device = Arc::clone(&device);
            let counter = Arc::clone(&counter);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("shutter-monitor".into())
                .spawn(move || read_loop(device.as_ref(), &counter, &running, frame_bytes))
                .map_err(|source| PipelineError::Spawn {
                    name: "monitor",
                    source,
                })?
        };

        info!("Looking for lost frames");
        Ok(Self {
            device,
            counter,
            running,
            worker: Some(worker),
        })
    }

    pub fn counter(&self) -> &LossCounter {
        &self.counter
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the stream and the reader; returns `(received, lost)`
    pub fn stop(mut self) -> (u64, i64) {
        self.halt();
        (self.counter.received(), self.counter.lost())
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Err(err) = self.device.stop_stream() {
            warn!("Could not stop the stream: {}", err);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Monitor reader panicked");
            }
        }
    }
}

impl Drop for LossMonitor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.halt();
        }
    }
}

fn read_loop(device: &dyn Device, counter: &LossCounter, running: &AtomicBool, frame_bytes: usize) {
    let mut buf = vec![0u8; frame_bytes];
    while running.load(Ordering::Acquire) {
        match device.next_frame(&mut buf) {
            Ok(meta) => {
                if let Observation::Gap { expected, .. } | Observation::Late { expected } =
                    counter.record(meta.sequence)
                {
                    debug!("Expected frame {}, but got frame {}", expected, meta.sequence);
                }
            }
            Err(err) if err.is_transient() => debug!("Could not get a frame: {}", err),
            Err(err) => {
                if running.load(Ordering::Acquire) {
                    warn!("Monitor stopping: {}", err);
                    running.store(false, Ordering::Release);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{SimConfig, SimulatedDevice};
    use std::time::Duration;

    #[test]
    fn counts_received_and_lost_frames() {
        let sim = SimConfig {
            drop_every: Some(4),
            frame_limit: Some(20),
            timeout: Duration::from_millis(5),
            ..SimConfig::default()
        };
        let frame_bytes = sim.frame_size();
        let device = Arc::new(SimulatedDevice::new(sim));
        let monitor = LossMonitor::start(device.clone(), frame_bytes).unwrap();

        while monitor.counter().received() < 20 {
            thread::sleep(Duration::from_millis(1));
        }
        let (received, lost) = monitor.stop();

        // 20 frames delivered out of 1..=26, with 4, 8, .., 24 dropped
        assert_eq!(received, 20);
        assert_eq!(lost, 6);
    }

    #[test]
    fn late_frames_are_not_lost() {
        let sim = SimConfig {
            swap_every: Some(5),
            frame_limit: Some(19),
            timeout: Duration::from_millis(5),
            ..SimConfig::default()
        };
        let frame_bytes = sim.frame_size();
        let monitor =
            LossMonitor::start(Arc::new(SimulatedDevice::new(sim)), frame_bytes).unwrap();

        while monitor.counter().received() < 19 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(monitor.counter().tracker().expected_next(), Some(20));
        assert_eq!(monitor.stop(), (19, 0));
    }

    #[test]
    fn device_failure_stops_the_reader() {
        let sim = SimConfig::default();
        // Buffer too small for the frames: a non-transient error
        let monitor = LossMonitor::start(Arc::new(SimulatedDevice::new(sim)), 8).unwrap();
        while monitor.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(monitor.stop(), (0, 0));
    }
}
