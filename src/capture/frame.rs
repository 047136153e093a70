use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::SizeError;

/// Discrete frame dimensions offered by a device.
///
/// Both sides are always non-zero, so ratios computed from a `Size` never
/// divide by zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSize", into = "RawSize")]
pub struct Size {
    width: u32,
    height: u32,
}

#[derive(Serialize, Deserialize)]
struct RawSize {
    width: u32,
    height: u32,
}

impl Size {
    /// # Panics
    ///
    /// Panics if either side is zero. Use [`Size::try_new`] for untrusted input.
    pub const fn new(width: u32, height: u32) -> Self {
        assert!(width > 0 && height > 0, "frame dimensions must be non-zero");
        Self { width, height }
    }

    pub fn try_new(width: u32, height: u32) -> Result<Self, SizeError> {
        if width == 0 || height == 0 {
            return Err(SizeError::InvalidSize { width, height });
        }
        Ok(Self { width, height })
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub const fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// width / height
    pub fn aspect_ratio(&self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }

    /// height / width, the ratio preview negotiation compares on
    pub fn inverse_aspect_ratio(&self) -> f64 {
        f64::from(self.height) / f64::from(self.width)
    }

    /// Same size with the long side as width (sensor orientation).
    pub fn landscape(&self) -> Self {
        if self.height > self.width {
            Self {
                width: self.height,
                height: self.width,
            }
        } else {
            *self
        }
    }

    /// Bytes needed for one uncompressed frame at `bits_per_pixel`.
    pub fn frame_len(&self, bits_per_pixel: u32) -> usize {
        (self.pixels() * u64::from(bits_per_pixel) / 8) as usize
    }
}

impl TryFrom<RawSize> for Size {
    type Error = SizeError;

    fn try_from(raw: RawSize) -> Result<Self, Self::Error> {
        Size::try_new(raw.width, raw.height)
    }
}

impl From<Size> for RawSize {
    fn from(size: Size) -> Self {
        RawSize {
            width: size.width,
            height: size.height,
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgb565,
    Yuyv4,
    Mjpeg,
    Nv12,
    Nv21,
}

impl PixelFormat {
    /// Bits per pixel for uncompressed layouts, `None` for compressed ones.
    pub const fn bits_per_pixel(&self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(24),
            PixelFormat::Rgb565 | PixelFormat::Yuyv4 => Some(16),
            PixelFormat::Nv12 | PixelFormat::Nv21 => Some(12),
            PixelFormat::Mjpeg => None,
        }
    }

    pub const fn is_compressed(&self) -> bool {
        self.bits_per_pixel().is_none()
    }
}

/// Which physical device is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Facing {
    Front,
    #[default]
    Back,
}

impl Facing {
    pub const fn opposite(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Front => write!(f, "front"),
            Facing::Back => write!(f, "back"),
        }
    }
}

/// Still capture flavour; each kind has its own pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureKind {
    Photo,
    Marker,
}

impl CaptureKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Photo => "photo",
            CaptureKind::Marker => "marker",
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preview frame lent to the consumer for the duration of one callback.
///
/// The bytes live in a pool slot that is recycled right after the callback
/// returns; consumers that need the data later must copy it.
#[derive(Debug, Clone, Copy)]
pub struct PreviewFrame<'a> {
    pub data: &'a [u8],
    pub size: Size,
    pub format: PixelFormat,
    pub facing: Facing,
    /// Number of frames delivered before this one in the current preview.
    pub sequence: u64,
}

/// Decoded still image in RGB565 (little-endian, stride `width * 2`).
#[derive(Debug, Clone)]
pub struct StillImage {
    pub data: Bytes,
    /// Dimensions of the decoded image.
    pub size: Size,
    /// Still size negotiated for the request. Differs from `size` only when
    /// the device ignored it.
    pub negotiated: Size,
    pub kind: CaptureKind,
    /// Requested aspect ratio, reported for marker captures only.
    pub aspect_ratio: Option<f64>,
}
