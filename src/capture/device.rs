//! The device seam: anything that can stream fixed-size frames into caller buffers

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::capture::frame::FrameDescriptor;
use crate::capture::sim::{SimConfig, SimulatedDevice};
use crate::capture::v4l2::V4l2Device;
use crate::error::DeviceError;
use crate::{utils, CaptureConfig, SourceKind};

/// A streaming frame source.
///
/// All methods take `&self`: the controller stops the stream from its own
/// thread while the source worker may be parked inside [`Device::next_frame`].
/// Stopping the stream must unblock that call, either immediately or within
/// the device's own timeout.
pub trait Device: Send + Sync {
    fn start_stream(&self) -> Result<(), DeviceError>;

    fn stop_stream(&self) -> Result<(), DeviceError>;

    /// Block until the next frame has been copied into `buf`.
    fn next_frame(&self, buf: &mut [u8]) -> Result<FrameDescriptor, DeviceError>;
}

/// Build the configured device. The stream is not started.
pub fn open_device(config: &CaptureConfig) -> Result<Arc<dyn Device>, DeviceError> {
    match config.source {
        SourceKind::Simulated => {
            let sim = SimConfig {
                width: config.width,
                height: config.height,
                format: config.format,
                fps: config.fps,
                drop_every: config.drop_every,
                swap_every: config.swap_every,
                frame_limit: config.frame_limit,
                timeout: Duration::from_millis(config.timeout_ms),
                ..SimConfig::default()
            };
            info!("Using simulated device: {}x{} @ {} fps", sim.width, sim.height, sim.fps);
            Ok(Arc::new(SimulatedDevice::new(sim)))
        }
        SourceKind::V4l2 => {
            let mut config = config.clone();
            if config.device_path.is_empty() {
                config.device_path = utils::auto_detect_device(config.format)?;
            }
            Ok(Arc::new(V4l2Device::new(config)?))
        }
    }
}
