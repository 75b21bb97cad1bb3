//! V4L2 camera capture via the `v4l` crate.
//!
//! A [`Camera`] owns the device and one memory-mapped stream for its whole
//! lifetime. Dropping it stops streaming and closes the device, so holding a
//! `Camera` is holding the camera.

use crate::frame::{self, Frame, FrameError};
use crate::source::FrameSource;
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

pub const IDEAL_WIDTH: u32 = 640;
pub const IDEAL_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("camera busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture streaming")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

impl CameraError {
    /// Whether the camera could not be acquired at all, as opposed to a
    /// failure while streaming.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, CameraError::CaptureFailed(_))
    }

    fn from_open(path: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => CameraError::DeviceNotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(path.to_string()),
            _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy(path.to_string()),
            _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
        }
    }
}

impl From<FrameError> for CameraError {
    fn from(e: FrameError) -> Self {
        CameraError::CaptureFailed(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2, luma extracted.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    fn to_gray(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, width, height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// A discovered capture device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// An open, streaming V4L2 camera.
pub struct Camera {
    // Declared before `device` so streaming stops before the handle closes.
    stream: MmapStream<'static>,
    #[allow(dead_code)]
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path`, negotiate 640×480, and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| CameraError::from_open(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = IDEAL_WIDTH;
        fmt.height = IDEAL_HEIGHT;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS).map_err(|e| {
            if e.raw_os_error() == Some(EBUSY) {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::CaptureFailed(format!("mmap stream: {e}"))
            }
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "camera acquired"
        );

        Ok(Self {
            stream,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Enumerate `/dev/video0..15` devices that can capture.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        let gray = self.pixel_format.to_gray(buf, self.width, self.height)?;
        Ok(Frame::from_gray(gray, self.width, self.height, meta.sequence))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}
