//! Capture session state machine
//!
//! A [`CaptureSession`] owns one open device, its frame pool and the two
//! still pipelines. Consumer calls (`resume`, `pause`, `capture`) are
//! non-blocking triggers; results arrive through [`CaptureListener`] while
//! the session dispatches driver events with [`CaptureSession::dispatch_pending`]
//! or [`CaptureSession::wait_event`].
//!
//! ```text
//! Closed -> Opening -> Previewing -> Focusing -> ShutterPending -> Decoding
//!                          ^             |                            |
//!                          +-------------+ (focus failed)             |
//!                          +------------------------------------------+
//! ```
//!
//! Any state returns to `Closed` on `pause`, and on a driver failure.

use std::io;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, trace, warn};

use super::driver::{Capabilities, DeviceConfig, DeviceDriver, DeviceEvent, DeviceInfo, FocusMode, FrameSink, Inbound};
use super::frame::{CaptureKind, Facing, PreviewFrame, Size, StillImage};
use super::size::select_closest_by_ratio_then_height;
use super::still::StillPipeline;
use crate::error::{DecodeError, SessionError};
use crate::pipeline::pool::{FrameBuffer, FramePool};
use crate::{Config, SessionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Opening,
    Previewing,
    Focusing,
    ShutterPending,
    Decoding,
}

impl SessionState {
    /// States in which the device is streaming preview frames.
    pub fn is_streaming(&self) -> bool {
        !matches!(self, SessionState::Closed | SessionState::Opening)
    }
}

/// Why a pending capture ended without a still.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    FocusFailed,
    DecodeFailed,
    DriverFailed,
    SessionPaused,
}

impl AbortReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AbortReason::FocusFailed => "focus_failed",
            AbortReason::DecodeFailed => "decode_failed",
            AbortReason::DriverFailed => "driver_failed",
            AbortReason::SessionPaused => "session_paused",
        }
    }
}

/// Application side of the session.
pub trait CaptureListener {
    /// The frame borrows a pool slot that is recycled when this returns.
    fn on_preview_frame(&mut self, frame: PreviewFrame<'_>);

    fn on_still_captured(&mut self, still: StillImage);

    /// A capture ended without a still. Not called for rejected requests.
    fn on_capture_aborted(&mut self, _kind: CaptureKind, _reason: AbortReason) {}
}

/// The one capture allowed in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub id: u64,
    pub kind: CaptureKind,
    pub aspect_ratio: f64,
    pub still_size: Size,
}

/// Everything that only exists while a device is open.
struct OpenDevice<H> {
    handle: H,
    info: DeviceInfo,
    capabilities: Capabilities,
    config: DeviceConfig,
    /// Expected bytes per preview frame; 0 for compressed formats.
    frame_len: usize,
    /// Weak so that the channel disconnects when the driver lets go.
    sink: flume::WeakSender<Inbound>,
    events: flume::Receiver<Inbound>,
}

/// Device parameters settled while opening.
struct Negotiated {
    capabilities: Capabilities,
    config: DeviceConfig,
    frame_len: usize,
    sink: FrameSink,
    events: flume::Receiver<Inbound>,
}

pub struct CaptureSession<D: DeviceDriver, L: CaptureListener> {
    driver: D,
    listener: L,
    config: SessionConfig,
    facing: Facing,
    state: SessionState,
    device: Option<OpenDevice<D::Handle>>,
    pool: FramePool,
    photo: StillPipeline,
    marker: StillPipeline,
    pending: Option<CaptureRequest>,
    next_capture_id: u64,
}

impl<D: DeviceDriver, L: CaptureListener> CaptureSession<D, L> {
    pub fn new(driver: D, listener: L, config: &Config) -> Self {
        Self {
            driver,
            listener,
            config: config.session.clone(),
            facing: Facing::default(),
            state: SessionState::Closed,
            device: None,
            pool: FramePool::new(),
            photo: StillPipeline::new(CaptureKind::Photo, &config.photo),
            marker: StillPipeline::new(CaptureKind::Marker, &config.marker),
            pending: None,
            next_capture_id: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Facing of the open device, or the last requested one when closed.
    pub fn facing(&self) -> Facing {
        self.device.as_ref().map_or(self.facing, |d| d.info.facing)
    }

    pub fn preview_size(&self) -> Option<Size> {
        self.device.as_ref().map(|d| d.config.preview_size)
    }

    pub fn device_config(&self) -> Option<&DeviceConfig> {
        self.device.as_ref().map(|d| &d.config)
    }

    pub fn pending_request(&self) -> Option<&CaptureRequest> {
        self.pending.as_ref()
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn pipeline(&self, kind: CaptureKind) -> &StillPipeline {
        match kind {
            CaptureKind::Photo => &self.photo,
            CaptureKind::Marker => &self.marker,
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Keep photo stills consistent with a changed preview ratio.
    pub fn set_photo_aspect_ratio(&mut self, ratio: f64) -> Result<(), SessionError> {
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(SessionError::InvalidAspectRatio(ratio));
        }
        self.photo.set_aspect_ratio(ratio);
        Ok(())
    }

    /// Open a device for `facing` and start preview.
    ///
    /// Falls back to any device that opens when none with the requested
    /// facing does. Returns the negotiated preview size.
    #[instrument(skip(self))]
    pub fn resume(&mut self, facing: Facing) -> Result<Size, SessionError> {
        if self.state != SessionState::Closed {
            debug!(state = ?self.state, "Resume on open session, reopening");
            self.pause();
        }

        self.facing = facing;
        self.state = SessionState::Opening;

        let devices = self.driver.enumerate();
        let Some((handle, info)) = self.open_device(facing, &devices) else {
            error!(%facing, count = devices.len(), "Failed to open camera");
            self.state = SessionState::Closed;
            return Err(SessionError::DeviceUnavailable);
        };

        match self.start_preview(handle, info) {
            Ok(size) => {
                self.state = SessionState::Previewing;
                info!(facing = %info.facing, index = info.index, %size, "Camera preview started");
                Ok(size)
            }
            Err(err) => {
                error!("Camera configuration failed: {err}");
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    /// Stop preview and release the device.
    ///
    /// A pending capture is abandoned; its listener gets
    /// [`AbortReason::SessionPaused`] before this returns and nothing else
    /// afterwards.
    #[instrument(skip(self))]
    pub fn pause(&mut self) {
        self.close(AbortReason::SessionPaused);
    }

    /// Release the device and abandon any pending capture with `reason`.
    fn close(&mut self, reason: AbortReason) {
        if let Some(mut device) = self.device.take() {
            // Dropping the receiver unregisters the sink.
            drop(device.events);
            self.driver.stop_streaming(&mut device.handle);
            self.driver.release(device.handle);
            info!(facing = %device.info.facing, "Camera released");
        }
        self.pool.release();
        self.state = SessionState::Closed;

        if let Some(request) = self.pending.take() {
            debug!(kind = %request.kind, id = request.id, ?reason, "Pending capture abandoned");
            self.abort(request.kind, reason);
        }
    }

    /// Pause, then resume with the other facing. A no-op when only one
    /// device exists.
    pub fn switch_camera(&mut self) -> Result<Size, SessionError> {
        let Some(current) = self.device.as_ref().map(|d| d.config.preview_size) else {
            return Err(SessionError::NotReady { state: self.state });
        };
        if self.driver.enumerate().len() < 2 {
            debug!("Single camera, switch ignored");
            return Ok(current);
        }
        let next = self.facing().opposite();
        self.pause();
        self.resume(next)
    }

    /// Start a still capture of `kind`.
    #[instrument(skip(self))]
    pub fn capture(&mut self, kind: CaptureKind) -> Result<(), SessionError> {
        self.begin_capture(kind, None)
    }

    /// Start a marker capture targeting `aspect_ratio` (width / height).
    #[instrument(skip(self))]
    pub fn capture_marker(&mut self, aspect_ratio: f64) -> Result<(), SessionError> {
        if !(aspect_ratio.is_finite() && aspect_ratio > 0.0) {
            return Err(SessionError::InvalidAspectRatio(aspect_ratio));
        }
        self.begin_capture(CaptureKind::Marker, Some(aspect_ratio))
    }

    /// Still size `kind` would use, negotiating against the open device or,
    /// when closed, by briefly opening the first device.
    pub fn init_still_size(&mut self, kind: CaptureKind) -> Result<Size, SessionError> {
        let sizes = match &self.device {
            Some(device) => device.capabilities.still_sizes.clone(),
            None => {
                let index = self
                    .driver
                    .enumerate()
                    .first()
                    .map(|d| d.index)
                    .ok_or(SessionError::DeviceUnavailable)?;
                let handle = self.driver.open(index).map_err(|_| SessionError::DeviceUnavailable)?;
                let caps = self.driver.capabilities(&handle);
                self.driver.release(handle);
                caps?.still_sizes
            }
        };
        Ok(self.pipeline_mut(kind).negotiate_size(&sizes))
    }

    /// Handle the events queued at the time of the call. Events posted while
    /// these are handled, such as a decode result, wait for the next call.
    /// Returns how many were handled.
    pub fn dispatch_pending(&mut self) -> usize {
        let Some(events) = self.device.as_ref().map(|d| d.events.clone()) else {
            return 0;
        };
        let queued = events.len();
        let mut handled = 0;
        while handled < queued {
            match events.try_recv() {
                Ok(event) => {
                    self.handle(event);
                    handled += 1;
                }
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => {
                    drop(events);
                    self.on_driver_failed("event channel closed");
                    return handled;
                }
            }
            if self.device.is_none() {
                return handled;
            }
        }
        if queued == 0 && events.is_disconnected() {
            drop(events);
            self.on_driver_failed("event channel closed");
        }
        handled
    }

    /// Block up to `timeout` for one event, then handle whatever else was
    /// queued with it. Returns `false` on timeout or when no device is open.
    pub fn wait_event(&mut self, timeout: Duration) -> bool {
        let Some(rx) = self.device.as_ref().map(|d| d.events.clone()) else {
            return false;
        };
        let received = rx.recv_timeout(timeout);
        drop(rx);
        match received {
            Ok(event) => {
                self.handle(event);
                self.dispatch_pending();
                true
            }
            Err(flume::RecvTimeoutError::Disconnected) => {
                self.on_driver_failed("event channel closed");
                true
            }
            Err(flume::RecvTimeoutError::Timeout) => false,
        }
    }

    fn pipeline_mut(&mut self, kind: CaptureKind) -> &mut StillPipeline {
        match kind {
            CaptureKind::Photo => &mut self.photo,
            CaptureKind::Marker => &mut self.marker,
        }
    }

    fn open_device(&mut self, facing: Facing, devices: &[DeviceInfo]) -> Option<(D::Handle, DeviceInfo)> {
        let preferred = devices.iter().filter(|d| d.facing == facing);
        for info in preferred {
            match self.driver.open(info.index) {
                Ok(handle) => return Some((handle, *info)),
                Err(err) => warn!(index = info.index, "Camera failed to open: {err}"),
            }
        }

        warn!(%facing, count = devices.len(), "Requested camera unavailable, probing all cameras");
        for info in devices.iter().filter(|d| d.facing != facing) {
            match self.driver.open(info.index) {
                Ok(handle) => {
                    debug!(index = info.index, facing = %info.facing, "Camera opened");
                    return Some((handle, *info));
                }
                Err(err) => warn!(index = info.index, "Camera failed to open: {err}"),
            }
        }
        None
    }

    /// Opening -> Previewing. Releases the handle on failure.
    fn start_preview(&mut self, mut handle: D::Handle, info: DeviceInfo) -> Result<Size, SessionError> {
        match self.configure_device(&mut handle) {
            Ok(negotiated) => {
                let size = negotiated.config.preview_size;
                self.device = Some(OpenDevice {
                    handle,
                    info,
                    capabilities: negotiated.capabilities,
                    config: negotiated.config,
                    frame_len: negotiated.frame_len,
                    sink: negotiated.sink.downgrade(),
                    events: negotiated.events,
                });
                Ok(size)
            }
            Err(err) => {
                self.driver.stop_streaming(&mut handle);
                self.driver.release(handle);
                self.pool.release();
                Err(err)
            }
        }
    }

    fn configure_device(&mut self, handle: &mut D::Handle) -> Result<Negotiated, SessionError> {
        let capabilities = self.driver.capabilities(handle)?;

        let target = self.config.preview_target.landscape();
        let preview_size = select_closest_by_ratio_then_height(&capabilities.preview_sizes, target)
            .unwrap_or_else(|err| {
                warn!(fallback = %self.config.fallback_preview_size, "Preview size negotiation failed: {err}");
                self.config.fallback_preview_size
            });
        let still_size = self.photo.negotiate_size(&capabilities.still_sizes);
        let focus_mode = FocusMode::negotiate(self.config.focus_mode, &capabilities.focus_modes);
        if focus_mode.is_none() {
            debug!(supported = ?capabilities.focus_modes, "No usable focus mode");
        }

        let config = DeviceConfig {
            preview_size,
            still_size,
            format: capabilities.preview_format,
            focus_mode,
            white_balance: self.config.white_balance,
        };
        self.driver.configure(handle, &config)?;
        debug!(?config, "Camera parameters applied");

        let bits_per_pixel = match capabilities.bits_per_pixel {
            0 => capabilities.preview_format.bits_per_pixel().unwrap_or(16),
            bpp => bpp,
        };
        let frame_len = if capabilities.preview_format.is_compressed() {
            0
        } else {
            preview_size.frame_len(bits_per_pixel)
        };
        let buffer_size = preview_size.frame_len(bits_per_pixel) + self.config.buffer_margin;
        self.pool.configure(buffer_size, self.config.buffer_count)?;

        let (sink, events) = FrameSink::channel();
        self.driver.start_streaming(handle, sink.clone())?;
        let first = self.pool.acquire_for_driver()?;
        self.driver.queue_buffer(handle, first);

        Ok(Negotiated {
            capabilities,
            config,
            frame_len,
            sink,
            events,
        })
    }

    fn begin_capture(&mut self, kind: CaptureKind, aspect_ratio: Option<f64>) -> Result<(), SessionError> {
        if self.state != SessionState::Previewing || self.pending.is_some() {
            warn!(%kind, state = ?self.state, "Can not take a photo now");
            return Err(SessionError::NotReady { state: self.state });
        }
        let Some(device) = self.device.as_mut() else {
            return Err(SessionError::NotReady { state: self.state });
        };

        let pipeline = match kind {
            CaptureKind::Photo => &mut self.photo,
            CaptureKind::Marker => &mut self.marker,
        };
        if let Some(ratio) = aspect_ratio {
            pipeline.set_aspect_ratio(ratio);
        }
        let still_size = pipeline.negotiate_size(&device.capabilities.still_sizes);

        if still_size != device.config.still_size {
            let mut config = device.config;
            config.still_size = still_size;
            self.driver.configure(&mut device.handle, &config)?;
            device.config = config;
        }

        self.driver.request_focus(&mut device.handle)?;

        let request = CaptureRequest {
            id: self.next_capture_id,
            kind,
            aspect_ratio: pipeline.aspect_ratio(),
            still_size,
        };
        self.next_capture_id += 1;
        self.pending = Some(request);
        self.state = SessionState::Focusing;

        metrics::counter!("duocam_captures_total", "kind" => kind.as_str()).increment(1);
        debug!(%kind, id = request.id, %still_size, "Capture started, focusing");
        Ok(())
    }

    fn handle(&mut self, event: Inbound) {
        match event {
            Inbound::Device(DeviceEvent::Frame { buffer, len }) => self.on_frame(buffer, len),
            Inbound::Device(DeviceEvent::FocusResult { success }) => self.on_focus_result(success),
            Inbound::Device(DeviceEvent::ImageReady { data }) => self.on_image_ready(data),
            Inbound::Device(DeviceEvent::Failed { message }) => self.on_driver_failed(&message),
            Inbound::Decoded { capture_id, result } => self.on_decoded(capture_id, result),
        }
    }

    fn on_frame(&mut self, buffer: FrameBuffer, len: usize) {
        if !self.pool.owns(&buffer) {
            trace!(slot = buffer.slot(), "Dropping buffer from retired pool");
            return;
        }
        let Some(device) = self.device.as_mut() else {
            return;
        };

        // Resubmit before the consumer sees this frame so the stream never
        // waits on downstream processing.
        match self.pool.rotate() {
            Ok(next) => self.driver.queue_buffer(&mut device.handle, next),
            Err(err) => warn!("No buffer to resubmit: {err}"),
        }

        let sequence = self.pool.counter() - 1;
        let valid = if device.frame_len == 0 {
            len > 0 && len <= buffer.capacity()
        } else {
            len == device.frame_len
        };

        if valid {
            self.listener.on_preview_frame(PreviewFrame {
                data: &buffer.as_slice()[..len],
                size: device.config.preview_size,
                format: device.config.format,
                facing: device.info.facing,
                sequence,
            });
            metrics::counter!("duocam_frames_delivered_total").increment(1);
        } else {
            warn!(
                len,
                expected = device.frame_len,
                slot = buffer.slot(),
                "Unexpected frame size, dropping frame"
            );
            metrics::counter!("duocam_frames_dropped_total").increment(1);
        }

        if let Err(err) = self.pool.submit(buffer) {
            debug!("Frame buffer not returned to pool: {err}");
        }
    }

    fn on_focus_result(&mut self, success: bool) {
        if self.state != SessionState::Focusing {
            trace!(success, state = ?self.state, "Ignoring unsolicited focus result");
            return;
        }
        let (Some(device), Some(request)) = (self.device.as_mut(), self.pending) else {
            return;
        };
        debug!(success, kind = %request.kind, "Camera focused");

        if !success {
            self.pending = None;
            self.state = SessionState::Previewing;
            self.abort(request.kind, AbortReason::FocusFailed);
            return;
        }

        match self.driver.request_capture(&mut device.handle) {
            Ok(()) => self.state = SessionState::ShutterPending,
            Err(err) => {
                error!("Shutter request failed: {err}");
                self.pending = None;
                self.state = SessionState::Previewing;
                self.abort(request.kind, AbortReason::DriverFailed);
            }
        }
    }

    fn on_image_ready(&mut self, data: bytes::Bytes) {
        if self.state != SessionState::ShutterPending {
            trace!(state = ?self.state, "Ignoring unsolicited image");
            return;
        }
        let (Some(device), Some(request)) = (self.device.as_mut(), self.pending) else {
            return;
        };
        self.state = SessionState::Decoding;

        // Preview comes back first; decode must not hold up the stream.
        if let Err(err) = self.driver.restart_preview(&mut device.handle) {
            warn!("Failed to restart preview: {err}");
        }
        debug!(bytes = data.len(), kind = %request.kind, "Picture taken, restarting preview");

        let sink = FrameSink::upgrade(&device.sink);
        let decoder = self.pipeline(request.kind).decoder_for(request.still_size);
        let spawned = match sink {
            Some(sink) => {
                let job = data.clone();
                thread::Builder::new()
                    .name("duocam-decode".into())
                    .spawn(move || {
                        let result = decoder.decode(&job);
                        sink.decoded(request.id, result);
                    })
                    .map(drop)
            }
            // Driver already gone; the disconnect is picked up after this.
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "event channel closed")),
        };

        if let Err(err) = spawned {
            warn!("Decode thread unavailable, decoding inline: {err}");
            let result = decoder.decode(&data);
            self.on_decoded(request.id, result);
        }
    }

    fn on_decoded(&mut self, capture_id: u64, result: Result<StillImage, DecodeError>) {
        if self.state != SessionState::Decoding || self.pending.map(|r| r.id) != Some(capture_id) {
            trace!(capture_id, "Ignoring stale decode result");
            return;
        }
        let Some(request) = self.pending.take() else {
            return;
        };
        self.state = SessionState::Previewing;

        match result {
            Ok(still) => {
                info!(kind = %still.kind, size = %still.size, bytes = still.data.len(), "Still captured");
                self.listener.on_still_captured(still);
            }
            Err(err) => {
                error!(kind = %request.kind, "Still decode failed: {err}");
                self.abort(request.kind, AbortReason::DecodeFailed);
            }
        }
    }

    /// The device can no longer stream. Closes the session; the consumer
    /// has to `resume` again.
    fn on_driver_failed(&mut self, message: &str) {
        error!(state = ?self.state, "Camera driver failed: {message}");
        self.close(AbortReason::DriverFailed);
    }

    fn abort(&mut self, kind: CaptureKind, reason: AbortReason) {
        metrics::counter!("duocam_captures_aborted_total", "reason" => reason.as_str()).increment(1);
        self.listener.on_capture_aborted(kind, reason);
    }
}

impl<D: DeviceDriver, L: CaptureListener> Drop for CaptureSession<D, L> {
    fn drop(&mut self) {
        if self.device.is_some() {
            self.pause();
        }
    }
}

