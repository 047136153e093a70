//! V4L2 reference driver
//!
//! Streams from a memory-mapped V4L2 queue on a worker thread and copies
//! each frame into the pool buffer the session lent. Stills are taken by
//! briefly re-formatting the device to MJPEG at the negotiated still size.

use std::io;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::{debug, error, info, instrument, trace, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::driver::{Capabilities, DeviceConfig, DeviceDriver, DeviceInfo, FocusMode, FrameSink};
use super::frame::{Facing, PixelFormat, Size};
use crate::error::DriverError;
use crate::pipeline::pool::FrameBuffer;

/// V4L2_CID_FOCUS_AUTO
const CID_FOCUS_AUTO: u32 = 0x009a_090c;
const MAX_NODES: usize = 64;
const STREAM_BUFFERS: u32 = 4;

#[derive(Debug, Clone)]
struct Node {
    path: PathBuf,
    facing: Facing,
}

/// Driver over `/dev/video*` capture nodes.
#[derive(Debug, Default)]
pub struct V4l2Driver {
    nodes: Vec<Node>,
}

pub struct V4l2Handle {
    index: usize,
    path: PathBuf,
    device: Device,
    fourcc: FourCC,
    has_autofocus: bool,
    config: Option<DeviceConfig>,
    worker: Option<Worker>,
}

struct Worker {
    commands: flume::Sender<Command>,
    buffers: flume::Sender<FrameBuffer>,
    join: JoinHandle<()>,
}

enum Command {
    Focus,
    Still(Size),
    Stop,
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit nodes instead of scanning.
    pub fn with_devices(devices: impl IntoIterator<Item = (PathBuf, Facing)>) -> Self {
        Self {
            nodes: devices.into_iter().map(|(path, facing)| Node { path, facing }).collect(),
        }
    }

    fn scan() -> Vec<Node> {
        info!("Auto-detecting capture devices...");

        let mut nodes = Vec::new();
        for i in 0..MAX_NODES {
            let path = PathBuf::from(format!("/dev/video{i}"));
            if !path.exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }
            let card = caps.card.to_lowercase();
            let facing = if card.contains("front") || card.contains("user") {
                Facing::Front
            } else {
                Facing::Back
            };
            info!("Found capture device: {} - {} ({facing})", path.display(), caps.card);
            nodes.push(Node { path, facing });
        }
        nodes
    }
}

fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"NV12" => Some(PixelFormat::Nv12),
        b"NV21" => Some(PixelFormat::Nv21),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"RGBP" => Some(PixelFormat::Rgb565),
        _ => None,
    }
}

fn frame_sizes(device: &Device, fourcc: FourCC) -> io::Result<Vec<Size>> {
    let mut sizes = Vec::new();
    for framesize in device.enum_framesizes(fourcc)? {
        let (width, height) = match framesize.size {
            FrameSizeEnum::Discrete(d) => (d.width, d.height),
            FrameSizeEnum::Stepwise(s) => (s.max_width, s.max_height),
        };
        if let Ok(size) = Size::try_new(width, height) {
            sizes.push(size);
        }
    }
    Ok(sizes)
}

fn set_format(device: &Device, size: Size, fourcc: FourCC) -> io::Result<()> {
    let mut fmt = device.format()?;
    fmt.width = size.width();
    fmt.height = size.height();
    fmt.fourcc = fourcc;
    let applied = device.set_format(&fmt)?;
    if applied.width != size.width() || applied.height != size.height() || applied.fourcc != fourcc {
        let adjusted = format!("{}x{} {}", applied.width, applied.height, applied.fourcc);
        warn!(requested = %size, applied = %adjusted, "Device adjusted format");
    }
    Ok(())
}

impl DeviceDriver for V4l2Driver {
    type Handle = V4l2Handle;

    fn enumerate(&mut self) -> Vec<DeviceInfo> {
        if self.nodes.is_empty() {
            self.nodes = Self::scan();
        }
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| DeviceInfo {
                index,
                facing: node.facing,
            })
            .collect()
    }

    #[instrument(skip(self))]
    fn open(&mut self, index: usize) -> Result<V4l2Handle, DriverError> {
        let node = self.nodes.get(index).ok_or(DriverError::DeviceUnavailable(index))?;
        let device = Device::with_path(&node.path).map_err(|_| DriverError::DeviceUnavailable(index))?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        let formats = device.enum_formats()?;
        let has = |code: &[u8; 4]| formats.iter().any(|f| f.fourcc == FourCC::new(code));
        // Prefer an uncompressed stream so preview frames have a fixed length.
        let fourcc = if has(b"YUYV") {
            FourCC::new(b"YUYV")
        } else if has(b"MJPG") {
            FourCC::new(b"MJPG")
        } else {
            return Err(DriverError::Rejected("no YUYV or MJPG stream".into()));
        };

        let has_autofocus = device
            .query_controls()
            .map(|controls| controls.iter().any(|c| c.id == CID_FOCUS_AUTO))
            .unwrap_or(false);

        Ok(V4l2Handle {
            index,
            path: node.path.clone(),
            device,
            fourcc,
            has_autofocus,
            config: None,
            worker: None,
        })
    }

    fn capabilities(&mut self, handle: &V4l2Handle) -> Result<Capabilities, DriverError> {
        let preview_format = pixel_format(handle.fourcc)
            .ok_or_else(|| DriverError::Rejected(format!("unsupported fourcc {}", handle.fourcc)))?;
        let preview_sizes = frame_sizes(&handle.device, handle.fourcc)?;
        let mjpeg = FourCC::new(b"MJPG");
        let still_sizes = match frame_sizes(&handle.device, mjpeg) {
            Ok(sizes) if !sizes.is_empty() => sizes,
            _ => preview_sizes.clone(),
        };
        let focus_modes = if handle.has_autofocus {
            vec![FocusMode::ContinuousVideo, FocusMode::Fixed]
        } else {
            vec![FocusMode::Fixed]
        };

        Ok(Capabilities {
            preview_sizes,
            still_sizes,
            focus_modes,
            preview_format,
            bits_per_pixel: preview_format.bits_per_pixel().unwrap_or(0),
        })
    }

    fn configure(&mut self, handle: &mut V4l2Handle, config: &DeviceConfig) -> Result<(), DriverError> {
        if handle.worker.is_none() {
            set_format(&handle.device, config.preview_size, handle.fourcc)?;
        }
        if handle.has_autofocus {
            let continuous = config.focus_mode == Some(FocusMode::ContinuousVideo);
            if let Err(err) = handle.device.set_control(Control {
                id: CID_FOCUS_AUTO,
                value: Value::Boolean(continuous),
            }) {
                warn!("Failed to set focus mode: {err}");
            }
        }
        handle.config = Some(*config);
        Ok(())
    }

    fn start_streaming(&mut self, handle: &mut V4l2Handle, sink: FrameSink) -> Result<(), DriverError> {
        let config = handle
            .config
            .ok_or_else(|| DriverError::Rejected("start_streaming before configure".into()))?;
        if handle.worker.is_some() {
            return Err(DriverError::Rejected("already streaming".into()));
        }

        let (commands, command_rx) = flume::unbounded();
        let (buffers, buffer_rx) = flume::unbounded();
        let stream = StreamContext {
            path: handle.path.clone(),
            preview: config.preview_size,
            fourcc: handle.fourcc,
            sink,
            commands: command_rx,
            buffers: buffer_rx,
        };
        let join = thread::Builder::new()
            .name(format!("duocam-v4l2-{}", handle.index))
            .spawn(move || {
                if let Err(err) = stream.run() {
                    error!("Capture stream stopped: {err}");
                    stream.sink.failed(err.to_string());
                }
            })?;

        handle.worker = Some(Worker { commands, buffers, join });
        info!("Capture stream started with {} buffers", STREAM_BUFFERS);
        Ok(())
    }

    fn queue_buffer(&mut self, handle: &mut V4l2Handle, buffer: FrameBuffer) {
        if let Some(worker) = &handle.worker {
            let _ = worker.buffers.send(buffer);
        }
    }

    fn restart_preview(&mut self, _handle: &mut V4l2Handle) -> Result<(), DriverError> {
        // The worker resumes the preview stream itself after a still.
        Ok(())
    }

    fn stop_streaming(&mut self, handle: &mut V4l2Handle) {
        if let Some(worker) = handle.worker.take() {
            let _ = worker.commands.send(Command::Stop);
            drop(worker.buffers);
            if worker.join.join().is_err() {
                error!("Capture thread panicked");
            }
            debug!("Capture stream stopped");
        }
    }

    fn release(&mut self, mut handle: V4l2Handle) {
        self.stop_streaming(&mut handle);
        debug!(index = handle.index, "Device released");
    }

    fn request_focus(&mut self, handle: &mut V4l2Handle) -> Result<(), DriverError> {
        self.send(handle, Command::Focus)
    }

    fn request_capture(&mut self, handle: &mut V4l2Handle) -> Result<(), DriverError> {
        let still = handle
            .config
            .map(|c| c.still_size)
            .ok_or_else(|| DriverError::Rejected("capture before configure".into()))?;
        self.send(handle, Command::Still(still))
    }
}

impl V4l2Driver {
    fn send(&self, handle: &V4l2Handle, command: Command) -> Result<(), DriverError> {
        handle
            .worker
            .as_ref()
            .ok_or_else(|| DriverError::Rejected("not streaming".into()))?
            .commands
            .send(command)
            .map_err(|_| DriverError::Rejected("capture thread gone".into()))
    }
}

/// State owned by the streaming thread.
struct StreamContext {
    path: PathBuf,
    preview: Size,
    fourcc: FourCC,
    sink: FrameSink,
    commands: flume::Receiver<Command>,
    buffers: flume::Receiver<FrameBuffer>,
}

impl StreamContext {
    fn run(&self) -> io::Result<()> {
        let device = Device::with_path(&self.path)?;
        loop {
            let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)?;
            let still = loop {
                match self.commands.try_recv() {
                    Ok(Command::Focus) => {
                        // Fixed-focus or continuous: nothing to wait for.
                        self.sink.focus_result(true);
                    }
                    Ok(Command::Still(size)) => break size,
                    Ok(Command::Stop) | Err(flume::TryRecvError::Disconnected) => return Ok(()),
                    Err(flume::TryRecvError::Empty) => {}
                }

                let (data, meta) = stream.next()?;
                let len = (meta.bytesused as usize).min(data.len());
                match self.buffers.try_recv() {
                    Ok(mut buffer) => {
                        let copied = len.min(buffer.capacity());
                        buffer.as_mut_slice()[..copied].copy_from_slice(&data[..copied]);
                        if !self.sink.on_frame(buffer, len) {
                            return Ok(());
                        }
                    }
                    Err(_) => trace!(sequence = meta.sequence, "No buffer queued, frame skipped"),
                }
            };

            drop(stream);
            let image = self.grab_still(&device, still);
            set_format(&device, self.preview, self.fourcc)?;
            match image {
                Ok(data) => {
                    self.sink.image_ready(data);
                }
                Err(err) => {
                    error!("Still capture failed: {err}");
                    // Empty image fails decode and aborts the pending request.
                    self.sink.image_ready(Bytes::new());
                }
            }
        }
    }

    fn grab_still(&self, device: &Device, size: Size) -> io::Result<Bytes> {
        set_format(device, size, FourCC::new(b"MJPG"))?;
        let mut stream = MmapStream::with_buffers(device, Type::VideoCapture, 2)?;
        // First frame after a format switch is often underexposed.
        stream.next()?;
        let (data, meta) = stream.next()?;
        let len = (meta.bytesused as usize).min(data.len());
        debug!(%size, bytes = len, "Still frame grabbed");
        Ok(Bytes::copy_from_slice(&data[..len]))
    }
}

impl Drop for V4l2Handle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.commands.send(Command::Stop);
        }
    }
}
