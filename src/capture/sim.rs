//! Deterministic in-process camera
//!
//! Every payload is stamped with its own sequence number, so a consumer can
//! verify both order and integrity of what reached storage. Drops, late-by-one
//! reorders and transient failures can be injected at fixed intervals.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::device::Device;
use crate::capture::frame::{FrameDescriptor, PixelFormat};
use crate::error::DeviceError;

const STAMP_LEN: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// 0 delivers frames as fast as they are requested
    pub fps: u32,
    /// First sequence number the device assigns
    pub first_sequence: u64,
    /// Skip every sequence number divisible by this
    pub drop_every: Option<u64>,
    /// Deliver every sequence number divisible by this one position late
    pub swap_every: Option<u64>,
    /// Stop producing after this many frames (requests then time out)
    pub frame_limit: Option<u64>,
    /// Fail the first `fail_first` requests
    pub fail_first: u64,
    /// Fail every request whose attempt number is divisible by this
    pub fail_every: Option<u64>,
    pub timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            format: PixelFormat::Mono8,
            fps: 0,
            first_sequence: 1,
            drop_every: None,
            swap_every: None,
            frame_limit: None,
            fail_first: 0,
            fail_every: None,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SimConfig {
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Idle,
    Streaming,
    Stopped,
}

#[derive(Debug)]
struct SimState {
    stream: Stream,
    next_sequence: u64,
    held: Option<u64>,
    emitted: u64,
    attempts: u64,
    next_due: Option<Instant>,
}

pub struct SimulatedDevice {
    config: SimConfig,
    state: Mutex<SimState>,
    wake: Condvar,
}

impl SimulatedDevice {
    pub fn new(config: SimConfig) -> Self {
        let next_sequence = config.first_sequence;
        Self {
            config,
            state: Mutex::new(SimState {
                stream: Stream::Idle,
                next_sequence,
                held: None,
                emitted: 0,
                attempts: 0,
                next_due: None,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Frames delivered so far
    pub fn emitted(&self) -> u64 {
        self.lock().map(|s| s.emitted).unwrap_or(0)
    }

    /// Sequence number stamped into a payload by this device
    pub fn sequence_of(payload: &[u8]) -> Option<u64> {
        let stamp = payload.get(..STAMP_LEN)?;
        Some(u64::from_le_bytes(stamp.try_into().ok()?))
    }

    /// True when every byte after the stamp still carries the stamp's fill value
    pub fn is_intact(payload: &[u8]) -> bool {
        match Self::sequence_of(payload) {
            Some(seq) => payload[STAMP_LEN..].iter().all(|&b| b == seq as u8),
            None => false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, DeviceError> {
        self.state.lock().map_err(|_| poisoned())
    }

    fn stamp(buf: &mut [u8], sequence: u64) {
        buf.fill(sequence as u8);
        let n = buf.len().min(STAMP_LEN);
        buf[..n].copy_from_slice(&sequence.to_le_bytes()[..n]);
    }

    /// Park until the stream is stopped or the device timeout elapses.
    fn idle<'a>(
        &self,
        state: MutexGuard<'a, SimState>,
    ) -> Result<MutexGuard<'a, SimState>, DeviceError> {
        let (state, _) = self
            .wake
            .wait_timeout_while(state, self.config.timeout, |s| s.stream == Stream::Streaming)
            .map_err(|_| poisoned())?;
        Ok(state)
    }

    /// Hold the caller until the next frame period, skipping sequence numbers
    /// for periods that passed with nobody reading.
    fn pace<'a>(
        &self,
        mut state: MutexGuard<'a, SimState>,
    ) -> Result<MutexGuard<'a, SimState>, DeviceError> {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.fps));
        let due = *state.next_due.get_or_insert_with(Instant::now);

        loop {
            let now = Instant::now();
            if now >= due {
                let late = now - due;
                let missed = (late.as_nanos() / period.as_nanos().max(1)) as u64;
                if missed > 0 {
                    debug!("Simulated device overflowed, {} frames never read", missed);
                    state.next_sequence += missed;
                }
                state.next_due = Some(due + period * (missed as u32 + 1));
                return Ok(state);
            }
            let (guard, _) = self
                .wake
                .wait_timeout(state, due - now)
                .map_err(|_| poisoned())?;
            state = guard;
            if state.stream != Stream::Streaming {
                return Ok(state);
            }
        }
    }

    fn advance(&self, state: &mut SimState) -> u64 {
        loop {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let dropped = self
                .config
                .drop_every
                .is_some_and(|n| n > 0 && sequence % n == 0);
            if !dropped {
                return sequence;
            }
        }
    }

    fn pick_sequence(&self, state: &mut SimState) -> u64 {
        if let Some(held) = state.held.take() {
            return held;
        }
        let sequence = self.advance(state);
        if self
            .config
            .swap_every
            .is_some_and(|n| n > 0 && sequence % n == 0)
        {
            let later = self.advance(state);
            state.held = Some(sequence);
            return later;
        }
        sequence
    }
}

impl Device for SimulatedDevice {
    fn start_stream(&self) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        state.stream = Stream::Streaming;
        state.next_due = None;
        info!("Simulated stream started");
        Ok(())
    }

    fn stop_stream(&self) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        state.stream = Stream::Stopped;
        self.wake.notify_all();
        info!("Simulated stream stopped after {} frames", state.emitted);
        Ok(())
    }

    fn next_frame(&self, buf: &mut [u8]) -> Result<FrameDescriptor, DeviceError> {
        let mut state = self.lock()?;
        match state.stream {
            Stream::Idle => return Err(DeviceError::NotStreaming),
            Stream::Stopped => return Err(DeviceError::Stopped),
            Stream::Streaming => {}
        }

        state.attempts += 1;
        let attempt = state.attempts;
        if attempt <= self.config.fail_first
            || self
                .config
                .fail_every
                .is_some_and(|n| n > 0 && attempt % n == 0)
        {
            return Err(DeviceError::Failure(format!(
                "injected failure on request {attempt}"
            )));
        }

        let needed = self.config.frame_size();
        if buf.len() < needed {
            return Err(DeviceError::BufferTooSmall {
                needed,
                capacity: buf.len(),
            });
        }

        if self
            .config
            .frame_limit
            .is_some_and(|limit| state.emitted >= limit)
        {
            let state = self.idle(state)?;
            return Err(match state.stream {
                Stream::Streaming => DeviceError::Timeout,
                _ => DeviceError::Stopped,
            });
        }

        if self.config.fps > 0 {
            state = self.pace(state)?;
            if state.stream != Stream::Streaming {
                return Err(DeviceError::Stopped);
            }
        }

        let sequence = self.pick_sequence(&mut state);
        state.emitted += 1;
        drop(state);

        Self::stamp(&mut buf[..needed], sequence);
        Ok(FrameDescriptor {
            sequence,
            width: self.config.width,
            height: self.config.height,
            format: self.config.format,
            device_timestamp: None,
        })
    }
}

fn poisoned() -> DeviceError {
    DeviceError::Failure("simulated device state poisoned".into())
}
