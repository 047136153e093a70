//! Scripted driver and recording listener shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use duocam::capture::driver::{Capabilities, DeviceConfig, DeviceDriver, DeviceInfo, FocusMode, FrameSink};
use duocam::error::DriverError;
use duocam::pipeline::FrameBuffer;
use duocam::{
    AbortReason, CaptureKind, CaptureListener, CaptureSession, Config, Facing, PixelFormat, PreviewFrame, Size,
    StillImage,
};

pub const PREVIEW_FRAME_LEN: usize = 640 * 480 * 12 / 8;

pub fn capabilities() -> Capabilities {
    Capabilities {
        preview_sizes: vec![
            Size::new(1920, 1080),
            Size::new(1280, 720),
            Size::new(640, 480),
            Size::new(320, 240),
        ],
        still_sizes: vec![
            Size::new(2592, 1944),
            Size::new(2048, 1536),
            Size::new(1600, 1200),
            Size::new(1280, 960),
            Size::new(640, 480),
        ],
        focus_modes: vec![FocusMode::Auto, FocusMode::ContinuousPicture],
        preview_format: PixelFormat::Nv21,
        bits_per_pixel: 12,
    }
}

#[derive(Debug)]
pub struct MockState {
    pub devices: Vec<DeviceInfo>,
    pub failing: HashSet<usize>,
    pub capabilities: Capabilities,
    pub opened: Vec<usize>,
    pub released: Vec<usize>,
    pub configs: Vec<DeviceConfig>,
    pub queued: VecDeque<FrameBuffer>,
    pub sink: Option<FrameSink>,
    pub streaming: bool,
    pub focus_requests: usize,
    pub capture_requests: usize,
    pub preview_restarts: usize,
}

/// Driver whose asynchronous side is driven by the test.
#[derive(Debug, Clone)]
pub struct MockDriver(Arc<Mutex<MockState>>);

#[derive(Debug)]
pub struct MockHandle {
    pub index: usize,
}

impl MockDriver {
    pub fn new(devices: &[Facing]) -> Self {
        Self::with_capabilities(devices, capabilities())
    }

    pub fn with_capabilities(devices: &[Facing], capabilities: Capabilities) -> Self {
        Self(Arc::new(Mutex::new(MockState {
            devices: devices
                .iter()
                .enumerate()
                .map(|(index, &facing)| DeviceInfo { index, facing })
                .collect(),
            failing: HashSet::new(),
            capabilities,
            opened: Vec::new(),
            released: Vec::new(),
            configs: Vec::new(),
            queued: VecDeque::new(),
            sink: None,
            streaming: false,
            focus_requests: 0,
            capture_requests: 0,
            preview_restarts: 0,
        })))
    }

    pub fn fail_open(self, index: usize) -> Self {
        self.state().failing.insert(index);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    /// Fill the oldest queued buffer and hand it back. Returns the slot, or
    /// `None` when nothing was queued or the session stopped listening.
    pub fn deliver_frame(&self, len: usize) -> Option<usize> {
        let (mut buffer, sink) = {
            let mut state = self.state();
            let buffer = state.queued.pop_front()?;
            (buffer, state.sink.clone()?)
        };
        let slot = buffer.slot();
        let fill = len.min(buffer.capacity());
        buffer.as_mut_slice()[..fill].fill(slot as u8 + 1);
        sink.on_frame(buffer, len).then_some(slot)
    }

    pub fn focus(&self, success: bool) -> bool {
        let sink = self.state().sink.clone();
        sink.is_some_and(|s| s.focus_result(success))
    }

    pub fn shutter(&self, data: Bytes) -> bool {
        let sink = self.state().sink.clone();
        sink.is_some_and(|s| s.image_ready(data))
    }

    /// Report that the device stopped streaming.
    pub fn fail(&self, message: &str) -> bool {
        let sink = self.state().sink.clone();
        sink.is_some_and(|s| s.failed(message))
    }

    /// Let go of the sink without a word, as a crashed worker would.
    pub fn drop_sink(&self) {
        self.state().sink = None;
    }
}

impl DeviceDriver for MockDriver {
    type Handle = MockHandle;

    fn enumerate(&mut self) -> Vec<DeviceInfo> {
        self.state().devices.clone()
    }

    fn open(&mut self, index: usize) -> Result<MockHandle, DriverError> {
        let mut state = self.state();
        if state.failing.contains(&index) || index >= state.devices.len() {
            return Err(DriverError::DeviceUnavailable(index));
        }
        state.opened.push(index);
        Ok(MockHandle { index })
    }

    fn capabilities(&mut self, _handle: &MockHandle) -> Result<Capabilities, DriverError> {
        Ok(self.state().capabilities.clone())
    }

    fn configure(&mut self, _handle: &mut MockHandle, config: &DeviceConfig) -> Result<(), DriverError> {
        self.state().configs.push(*config);
        Ok(())
    }

    fn start_streaming(&mut self, _handle: &mut MockHandle, sink: FrameSink) -> Result<(), DriverError> {
        let mut state = self.state();
        state.sink = Some(sink);
        state.streaming = true;
        Ok(())
    }

    fn queue_buffer(&mut self, _handle: &mut MockHandle, buffer: FrameBuffer) {
        self.state().queued.push_back(buffer);
    }

    fn restart_preview(&mut self, _handle: &mut MockHandle) -> Result<(), DriverError> {
        self.state().preview_restarts += 1;
        Ok(())
    }

    fn stop_streaming(&mut self, _handle: &mut MockHandle) {
        let mut state = self.state();
        state.streaming = false;
        state.queued.clear();
    }

    fn release(&mut self, handle: MockHandle) {
        self.state().released.push(handle.index);
    }

    fn request_focus(&mut self, _handle: &mut MockHandle) -> Result<(), DriverError> {
        self.state().focus_requests += 1;
        Ok(())
    }

    fn request_capture(&mut self, _handle: &mut MockHandle) -> Result<(), DriverError> {
        self.state().capture_requests += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeenFrame {
    pub sequence: u64,
    pub size: Size,
    pub facing: Facing,
    pub len: usize,
    pub marker: u8,
}

#[derive(Debug, Default)]
pub struct Recorder {
    pub frames: Vec<SeenFrame>,
    pub stills: Vec<StillImage>,
    pub aborted: Vec<(CaptureKind, AbortReason)>,
}

impl CaptureListener for Recorder {
    fn on_preview_frame(&mut self, frame: PreviewFrame<'_>) {
        self.frames.push(SeenFrame {
            sequence: frame.sequence,
            size: frame.size,
            facing: frame.facing,
            len: frame.data.len(),
            marker: frame.data[0],
        });
    }

    fn on_still_captured(&mut self, still: StillImage) {
        self.stills.push(still);
    }

    fn on_capture_aborted(&mut self, kind: CaptureKind, reason: AbortReason) {
        self.aborted.push((kind, reason));
    }
}

pub type TestSession = CaptureSession<MockDriver, Recorder>;

pub fn session(driver: &MockDriver) -> TestSession {
    CaptureSession::new(driver.clone(), Recorder::default(), &Config::default())
}

pub fn jpeg(width: u32, height: u32) -> Bytes {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 120, 200]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    Bytes::from(out.into_inner())
}

/// Wait for the decode worker to report back.
pub fn settle(session: &mut TestSession) {
    for _ in 0..50 {
        if session.wait_event(Duration::from_millis(100)) && session.pending_request().is_none() {
            return;
        }
    }
    panic!("decode did not finish, state {:?}", session.state());
}
