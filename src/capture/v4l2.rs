//! V4L2 capture into caller-owned buffers

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

use crate::capture::device::Device;
use crate::capture::frame::FrameDescriptor;
use crate::error::DeviceError;
use crate::CaptureConfig;

/// Memory-mapped V4L2 capture.
///
/// The driver's own `sequence` field feeds loss accounting, so dropped frames
/// show up as gaps. Dequeues are bounded by `timeout_ms`, which is how
/// [`Device::stop_stream`] unblocks a waiting source.
pub struct V4l2Device {
    device: v4l::Device,
    config: CaptureConfig,
    stream: Mutex<Option<MmapStream<'static>>>,
    streaming: AtomicBool,
}

impl V4l2Device {
    pub fn new(mut config: CaptureConfig) -> Result<Self, DeviceError> {
        info!("Initializing V4L2 capture: {}", config.device_path);

        let device = v4l::Device::with_path(&config.device_path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::Failure(
                "device doesn't support video capture".into(),
            ));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(&config.format.fourcc());
        let fmt = device.set_format(&fmt)?;

        if fmt.fourcc != FourCC::new(&config.format.fourcc()) {
            return Err(DeviceError::Failure(format!(
                "device refused {:?}, offered {}",
                config.format, fmt.fourcc
            )));
        }
        if fmt.width != config.width || fmt.height != config.height {
            warn!(
                "Requested {}x{}, driver chose {}x{}",
                config.width, config.height, fmt.width, fmt.height
            );
            config.width = fmt.width;
            config.height = fmt.height;
        }

        Ok(Self {
            device,
            config,
            stream: Mutex::new(None),
            streaming: AtomicBool::new(false),
        })
    }

    fn stream(&self) -> Result<std::sync::MutexGuard<'_, Option<MmapStream<'static>>>, DeviceError> {
        self.stream
            .lock()
            .map_err(|_| DeviceError::Failure("capture stream lock poisoned".into()))
    }
}

impl Device for V4l2Device {
    fn start_stream(&self) -> Result<(), DeviceError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)?;
        stream.set_timeout(Duration::from_millis(self.config.timeout_ms));

        *self.stream()? = Some(stream);
        self.streaming.store(true, Ordering::Release);
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }

    fn stop_stream(&self) -> Result<(), DeviceError> {
        self.streaming.store(false, Ordering::Release);
        // Waits out at most one in-flight dequeue; dropping the stream issues STREAMOFF.
        let stream = self.stream()?.take();
        drop(stream);
        info!("Capture stream stopped");
        Ok(())
    }

    #[instrument(skip_all, level = "trace")]
    fn next_frame(&self, buf: &mut [u8]) -> Result<FrameDescriptor, DeviceError> {
        if !self.streaming.load(Ordering::Acquire) {
            return Err(DeviceError::Stopped);
        }

        let mut guard = self.stream()?;
        let stream = guard.as_mut().ok_or(DeviceError::Stopped)?;

        let (data, meta) = stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => DeviceError::Timeout,
            _ => DeviceError::Io(e),
        })?;

        let desc = FrameDescriptor {
            sequence: u64::from(meta.sequence),
            width: self.config.width,
            height: self.config.height,
            format: self.config.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        };
        copy_payload(data, meta.bytesused, desc.frame_size(), buf)?;
        Ok(desc)
    }
}

/// Copy exactly `frame_size` bytes of a dequeued buffer into `buf`.
///
/// A buffer with fewer than `frame_size` bytes used is rejected, so a slot
/// never carries bytes left over from its previous frame. Driver padding past
/// `frame_size` is dropped.
fn copy_payload(
    data: &[u8],
    bytes_used: u32,
    frame_size: usize,
    buf: &mut [u8],
) -> Result<(), DeviceError> {
    if frame_size > buf.len() {
        return Err(DeviceError::BufferTooSmall {
            needed: frame_size,
            capacity: buf.len(),
        });
    }
    let used = (bytes_used as usize).min(data.len());
    if used < frame_size {
        return Err(DeviceError::Failure(format!(
            "short frame: {used} of {frame_size} bytes"
        )));
    }
    buf[..frame_size].copy_from_slice(&data[..frame_size]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_exactly_one_frame() {
        let data = [7u8; 12];
        let mut buf = [0u8; 16];
        copy_payload(&data, 12, 8, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[7; 8]);
        assert_eq!(&buf[8..], &[0; 8]);
    }

    #[test]
    fn short_buffer_is_a_transient_failure() {
        let data = [7u8; 12];
        let mut buf = [1u8; 16];
        let err = copy_payload(&data, 6, 8, &mut buf).unwrap_err();
        assert!(matches!(err, DeviceError::Failure(_)));
        assert!(err.is_transient());
        assert_eq!(buf, [1; 16]);

        // bytesused beyond the mapping is clamped to it
        assert!(copy_payload(&data[..4], 100, 8, &mut buf).is_err());
    }

    #[test]
    fn frame_larger_than_slot() {
        let data = [7u8; 12];
        let mut buf = [0u8; 4];
        assert!(matches!(
            copy_payload(&data, 12, 8, &mut buf),
            Err(DeviceError::BufferTooSmall {
                needed: 8,
                capacity: 4
            })
        ));
    }
}
