//! Device driver seam
//!
//! The session calls into a [`DeviceDriver`] synchronously. Everything the
//! driver produces asynchronously (frames, focus results, compressed stills)
//! comes back through the [`FrameSink`] handed over at `start_streaming`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::frame::{Facing, PixelFormat, Size, StillImage};
use crate::error::{DecodeError, DriverError};
use crate::pipeline::pool::FrameBuffer;

/// One enumerated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: usize,
    pub facing: Facing,
}

/// Autofocus behaviours a device may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FocusMode {
    Auto,
    ContinuousPicture,
    ContinuousVideo,
    Macro,
    Infinity,
    Fixed,
}

impl FocusMode {
    /// Fallback order when no preferred mode is configured or supported.
    pub const PRIORITY: [FocusMode; 3] = [
        FocusMode::ContinuousVideo,
        FocusMode::ContinuousPicture,
        FocusMode::Auto,
    ];

    /// Preferred mode if the device offers it, else the first supported mode
    /// in [`FocusMode::PRIORITY`], else none.
    pub fn negotiate(preferred: Option<FocusMode>, supported: &[FocusMode]) -> Option<FocusMode> {
        preferred
            .filter(|mode| supported.contains(mode))
            .or_else(|| Self::PRIORITY.into_iter().find(|mode| supported.contains(mode)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WhiteBalance {
    #[default]
    Auto,
    Daylight,
    Cloudy,
    Incandescent,
    Fluorescent,
}

/// What a device reports it can do.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub preview_sizes: Vec<Size>,
    pub still_sizes: Vec<Size>,
    pub focus_modes: Vec<FocusMode>,
    pub preview_format: PixelFormat,
    pub bits_per_pixel: u32,
}

/// Parameters applied to an open device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConfig {
    pub preview_size: Size,
    pub still_size: Size,
    pub format: PixelFormat,
    pub focus_mode: Option<FocusMode>,
    pub white_balance: WhiteBalance,
}

/// Asynchronous results produced by a driver.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A lent buffer came back holding `len` bytes of frame data.
    Frame { buffer: FrameBuffer, len: usize },
    FocusResult { success: bool },
    /// Compressed (JPEG) still image.
    ImageReady { data: Bytes },
    /// The device stopped producing events and will not recover without a
    /// reopen.
    Failed { message: String },
}

/// Everything the session's event channel carries.
#[derive(Debug)]
pub(crate) enum Inbound {
    Device(DeviceEvent),
    Decoded {
        capture_id: u64,
        result: Result<StillImage, DecodeError>,
    },
}

/// Driver-side end of the session's event channel.
///
/// Cheap to clone. Sends fail once the session stops streaming, which is
/// how callbacks are unregistered.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: flume::Sender<Inbound>,
}

impl FrameSink {
    pub(crate) fn channel() -> (Self, flume::Receiver<Inbound>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    /// Returns `false` when the session no longer listens; the buffer is
    /// dropped in that case.
    pub fn on_frame(&self, buffer: FrameBuffer, len: usize) -> bool {
        self.send(DeviceEvent::Frame { buffer, len })
    }

    pub fn focus_result(&self, success: bool) -> bool {
        self.send(DeviceEvent::FocusResult { success })
    }

    pub fn image_ready(&self, data: Bytes) -> bool {
        self.send(DeviceEvent::ImageReady { data })
    }

    pub fn failed(&self, message: impl Into<String>) -> bool {
        self.send(DeviceEvent::Failed {
            message: message.into(),
        })
    }

    pub fn send(&self, event: DeviceEvent) -> bool {
        self.tx.send(Inbound::Device(event)).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_disconnected()
    }

    /// A handle that does not keep the channel open. Once the driver drops
    /// every sink the session sees the channel disconnect.
    pub(crate) fn downgrade(&self) -> flume::WeakSender<Inbound> {
        self.tx.downgrade()
    }

    pub(crate) fn upgrade(weak: &flume::WeakSender<Inbound>) -> Option<Self> {
        weak.upgrade().map(|tx| Self { tx })
    }

    pub(crate) fn decoded(&self, capture_id: u64, result: Result<StillImage, DecodeError>) -> bool {
        self.tx.send(Inbound::Decoded { capture_id, result }).is_ok()
    }
}

/// Platform camera driver.
///
/// Callbacks for one device are delivered serially; implementations must not
/// emit events for a device from more than one thread at a time.
pub trait DeviceDriver {
    type Handle;

    fn enumerate(&mut self) -> Vec<DeviceInfo>;

    fn open(&mut self, index: usize) -> Result<Self::Handle, DriverError>;

    fn capabilities(&mut self, handle: &Self::Handle) -> Result<Capabilities, DriverError>;

    fn configure(&mut self, handle: &mut Self::Handle, config: &DeviceConfig) -> Result<(), DriverError>;

    /// The driver keeps `sink` alive for as long as the device streams.
    /// Dropping every clone is treated as a device failure.
    fn start_streaming(&mut self, handle: &mut Self::Handle, sink: FrameSink) -> Result<(), DriverError>;

    /// Hand a buffer to the driver for the next frame.
    fn queue_buffer(&mut self, handle: &mut Self::Handle, buffer: FrameBuffer);

    /// Resume preview after a still capture.
    fn restart_preview(&mut self, handle: &mut Self::Handle) -> Result<(), DriverError>;

    /// Stop streaming and drop any queued buffers.
    fn stop_streaming(&mut self, handle: &mut Self::Handle);

    fn release(&mut self, handle: Self::Handle);

    /// Answered with [`DeviceEvent::FocusResult`].
    fn request_focus(&mut self, handle: &mut Self::Handle) -> Result<(), DriverError>;

    /// Answered with [`DeviceEvent::ImageReady`].
    fn request_capture(&mut self, handle: &mut Self::Handle) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_mode_prefers_configured_mode() {
        let supported = [FocusMode::Auto, FocusMode::Macro, FocusMode::ContinuousPicture];
        assert_eq!(FocusMode::negotiate(Some(FocusMode::Macro), &supported), Some(FocusMode::Macro));
    }

    #[test]
    fn focus_mode_falls_back_in_priority_order() {
        let supported = [FocusMode::Auto, FocusMode::ContinuousPicture, FocusMode::ContinuousVideo];
        assert_eq!(
            FocusMode::negotiate(Some(FocusMode::Infinity), &supported),
            Some(FocusMode::ContinuousVideo)
        );
        assert_eq!(
            FocusMode::negotiate(None, &[FocusMode::Auto, FocusMode::ContinuousPicture]),
            Some(FocusMode::ContinuousPicture)
        );
        assert_eq!(FocusMode::negotiate(None, &[FocusMode::Auto]), Some(FocusMode::Auto));
        assert_eq!(FocusMode::negotiate(None, &[FocusMode::Fixed]), None);
    }

    #[test]
    fn sink_reports_disconnect() {
        let (sink, rx) = FrameSink::channel();
        assert!(sink.focus_result(true));
        drop(rx);
        assert!(!sink.is_connected());
        assert!(!sink.focus_result(true));
    }

    #[test]
    fn weak_handle_does_not_keep_channel_open() {
        let (sink, rx) = FrameSink::channel();
        let weak = sink.downgrade();
        assert!(FrameSink::upgrade(&weak).is_some());
        assert!(sink.failed("stream died"));
        drop(sink);

        assert!(rx.is_disconnected());
        assert!(FrameSink::upgrade(&weak).is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(Inbound::Device(DeviceEvent::Failed { message })) if message == "stream died"
        ));
    }
}
