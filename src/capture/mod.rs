pub mod device;
pub mod frame;
pub mod sim;
pub mod v4l2;

pub use device::{open_device, Device};
pub use frame::{Frame, FrameDescriptor, PixelFormat};
pub use sim::{SimConfig, SimulatedDevice};
pub use v4l2::V4l2Device;
