//! Error taxonomy for the capture core

use thiserror::Error;

use crate::capture::session::SessionState;

/// Size negotiation failures. Callers resolve these to a fallback size.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizeError {
    #[error("device reported no supported sizes")]
    NoSupportedSizes,
    #[error("no size within {tolerance} of aspect ratio {target} under {max_pixels} pixels")]
    NoMatch {
        target: f64,
        tolerance: f64,
        max_pixels: u64,
    },
    #[error("invalid frame size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("frame pool is not configured")]
    NotConfigured,
    #[error("frame pool needs at least {minimum} slots, got {requested}")]
    TooFewSlots { requested: usize, minimum: usize },
    #[error("buffer for slot {slot} belongs to a retired pool generation")]
    StaleBuffer { slot: usize },
    #[error("slot {slot} is still lent to the driver")]
    SlotInFlight { slot: usize },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
    #[error("unsupported source layout: {0}")]
    UnsupportedLayout(String),
    #[error("decoded image has invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device {0} could not be opened")]
    DeviceUnavailable(usize),
    #[error("driver rejected request: {0}")]
    Rejected(String),
    #[error("driver i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced synchronously by the consumer-facing session API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no camera device could be opened")]
    DeviceUnavailable,
    #[error("capture not possible in state {state:?}")]
    NotReady { state: SessionState },
    #[error("invalid aspect ratio {0}")]
    InvalidAspectRatio(f64),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
