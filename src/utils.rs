use std::path::Path;

use tracing::{info, warn};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::error::DeviceError;

/// Find the first capture device that offers `format`
pub fn auto_detect_device(format: PixelFormat) -> Result<String, DeviceError> {
    info!("Auto-detecting capture devices...");
    let wanted = FourCC::new(&format.fourcc());

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            if formats.iter().any(|fmt| fmt.fourcc == wanted) {
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                return Ok(path);
            }
        }
    }

    Err(DeviceError::Failure(format!(
        "no capture device offering {:?} found",
        format
    )))
}

/// Pin the calling thread to `core`. Returns false if the core does not exist
/// or the OS refused.
pub fn pin_current_thread(core: usize) -> bool {
    let available = core_affinity::get_core_ids().unwrap_or_default();
    match available.into_iter().find(|id| id.id == core) {
        Some(id) => core_affinity::set_for_current(id),
        None => {
            warn!("Core {} not available for pinning", core);
            false
        }
    }
}
