//! Camera frame source.
//!
//! V4L2 capture with grayscale conversion and dark-frame detection, behind
//! the [`FrameSource`] trait so scan sessions can run against scripted
//! sources in tests.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::FrameSource;
