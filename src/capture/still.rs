//! Per-kind still capture policy: size negotiation and decode

use bytes::Bytes;
use tracing::{debug, warn};

use super::decoder;
use super::frame::{CaptureKind, PixelFormat, Size, StillImage};
use super::size::{select_best_size, SizeConstraint};
use crate::error::DecodeError;
use crate::StillConfig;

/// Still pipeline for one capture kind.
///
/// Photo and marker captures each own an instance; they share the selection
/// algorithm but nothing else.
#[derive(Debug, Clone)]
pub struct StillPipeline {
    kind: CaptureKind,
    constraint: SizeConstraint,
    fallback: Size,
    last_size: Option<Size>,
}

impl StillPipeline {
    pub fn new(kind: CaptureKind, config: &StillConfig) -> Self {
        Self {
            kind,
            constraint: config.constraint(),
            fallback: config.fallback_size,
            last_size: None,
        }
    }

    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    pub fn constraint(&self) -> &SizeConstraint {
        &self.constraint
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.constraint.target_aspect_ratio
    }

    pub fn set_aspect_ratio(&mut self, ratio: f64) {
        self.constraint.target_aspect_ratio = ratio;
    }

    /// Size picked by the most recent negotiation.
    pub fn last_size(&self) -> Option<Size> {
        self.last_size
    }

    /// Pick the still size for this kind from `candidates`, falling back to
    /// the configured default when nothing qualifies.
    pub fn negotiate_size(&mut self, candidates: &[Size]) -> Size {
        let size = select_best_size(candidates, &self.constraint).unwrap_or_else(|err| {
            warn!(kind = %self.kind, fallback = %self.fallback, "Still size negotiation failed: {err}");
            self.fallback
        });
        debug!(kind = %self.kind, %size, "Still size negotiated");
        self.last_size = Some(size);
        size
    }

    /// Snapshot of the decode parameters for the last negotiated size.
    pub fn decoder(&self) -> StillDecoder {
        self.decoder_for(self.last_size.unwrap_or(self.fallback))
    }

    /// Snapshot of the decode parameters for a request negotiated at
    /// `negotiated`, for running the decode off the callback thread.
    pub fn decoder_for(&self, negotiated: Size) -> StillDecoder {
        StillDecoder {
            kind: self.kind,
            negotiated,
            aspect_ratio: match self.kind {
                CaptureKind::Marker => Some(self.constraint.target_aspect_ratio),
                CaptureKind::Photo => None,
            },
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<StillImage, DecodeError> {
        self.decoder().decode(data)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StillDecoder {
    kind: CaptureKind,
    negotiated: Size,
    aspect_ratio: Option<f64>,
}

impl StillDecoder {
    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    pub fn negotiated_size(&self) -> Size {
        self.negotiated
    }

    /// Decode a compressed still into RGB565.
    pub fn decode(&self, data: &[u8]) -> Result<StillImage, DecodeError> {
        let decoded = decoder::decode_frame(data, PixelFormat::Mjpeg, None)?;
        if decoded.size != self.negotiated {
            warn!(
                kind = %self.kind,
                negotiated = %self.negotiated,
                actual = %decoded.size,
                "Decoded still differs from negotiated size"
            );
        }
        Ok(StillImage {
            data: Bytes::from(decoded.pixels),
            size: decoded.size,
            negotiated: self.negotiated,
            kind: self.kind,
            aspect_ratio: self.aspect_ratio,
        })
    }
}
