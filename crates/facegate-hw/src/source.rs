use crate::camera::CameraError;
use crate::frame::Frame;

/// Anything that yields grayscale frames on demand.
///
/// A source holds its device exclusively from construction until drop;
/// implementations release the hardware in `Drop`.
pub trait FrameSource {
    /// Block until the next frame is available.
    fn grab(&mut self) -> Result<Frame, CameraError>;

    /// Negotiated frame size.
    fn resolution(&self) -> (u32, u32);
}
