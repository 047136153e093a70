pub mod decoder;
pub mod driver;
pub mod frame;
pub mod session;
pub mod size;
pub mod still;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use driver::{Capabilities, DeviceConfig, DeviceDriver, DeviceEvent, DeviceInfo, FocusMode, FrameSink, WhiteBalance};
pub use frame::{CaptureKind, Facing, PixelFormat, PreviewFrame, Size, StillImage};
pub use session::{AbortReason, CaptureListener, CaptureRequest, CaptureSession, SessionState};
pub use still::StillPipeline;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Driver;
