use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Frame view handed to persistence: the filled part of a slot plus its metadata
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub payload: &'a [u8],
    pub meta: &'a FrameDescriptor,
}

/// Metadata the device reports alongside each frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Device-assigned counter, used for loss detection
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl FrameDescriptor {
    /// Bytes of payload this frame occupies
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Pixel formats we persist. Only single-byte formats are supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Mono8,
    Bayer8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        1
    }

    /// V4L2 fourcc for this format
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Mono8 => *b"GREY",
            Self::Bayer8 => *b"BA81",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_is_one_byte_per_pixel() {
        let desc = FrameDescriptor {
            sequence: 7,
            width: 640,
            height: 480,
            ..Default::default()
        };
        assert_eq!(desc.frame_size(), 640 * 480);
    }
}
