pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

use capture::driver::{FocusMode, WhiteBalance};
use capture::size::SizeConstraint;
use error::ConfigError;
use pipeline::pool::MIN_SLOTS;

pub use capture::frame::{CaptureKind, Facing, PixelFormat, PreviewFrame, Size, StillImage};
pub use capture::session::{AbortReason, CaptureListener, CaptureSession, SessionState};
pub use error::SessionError;

/// Environment variable prefix, e.g. `DUOCAM__PHOTO__TOLERANCE=0.02`.
pub const ENV_PREFIX: &str = "DUOCAM";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub photo: StillConfig,
    pub marker: StillConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Preview size to approach; orientation is normalised to landscape.
    pub preview_target: Size,
    /// Used when the device reports no preview sizes.
    pub fallback_preview_size: Size,
    pub buffer_count: usize,
    /// Extra bytes per pool buffer beyond one frame.
    pub buffer_margin: usize,
    /// Used when supported, otherwise the built-in priority order applies.
    pub focus_mode: Option<FocusMode>,
    pub white_balance: WhiteBalance,
}

/// Parameters for one still pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StillConfig {
    /// width / height
    pub aspect_ratio: f64,
    pub tolerance: f64,
    pub max_pixels: u64,
    pub fallback_size: Size,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins if set.
    pub filter: String,
}

impl StillConfig {
    pub const fn photo() -> Self {
        Self {
            aspect_ratio: 1.3333,
            tolerance: 0.01,
            max_pixels: 2048 * 1600,
            fallback_size: Size::new(640, 480),
        }
    }

    pub const fn marker() -> Self {
        Self {
            aspect_ratio: 1.3333,
            tolerance: 0.1,
            max_pixels: 1280 * 960,
            fallback_size: Size::new(640, 480),
        }
    }

    pub fn constraint(&self) -> SizeConstraint {
        SizeConstraint {
            target_aspect_ratio: self.aspect_ratio,
            tolerance: self.tolerance,
            max_pixels: self.max_pixels,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if !(self.aspect_ratio.is_finite() && self.aspect_ratio > 0.0) {
            return Err(ConfigError::Invalid(format!("{name}.aspect_ratio must be positive")));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(ConfigError::Invalid(format!("{name}.tolerance must not be negative")));
        }
        if self.max_pixels == 0 {
            return Err(ConfigError::Invalid(format!("{name}.max_pixels must be non-zero")));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preview_target: Size::new(640, 480),
            fallback_preview_size: Size::new(640, 480),
            buffer_count: MIN_SLOTS,
            buffer_margin: 4096,
            focus_mode: None,
            white_balance: WhiteBalance::Auto,
        }
    }
}

impl Default for StillConfig {
    fn default() -> Self {
        Self::photo()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "duocam=info".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            photo: StillConfig::photo(),
            marker: StillConfig::marker(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `DUOCAM__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Config::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.buffer_count < MIN_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "session.buffer_count must be at least {MIN_SLOTS}"
            )));
        }
        self.photo.validate("photo")?;
        self.marker.validate("marker")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_constants() {
        let config = Config::default();
        assert_eq!(config.photo.max_pixels, 3_276_800);
        assert_eq!(config.marker.max_pixels, 1_228_800);
        assert_eq!(config.marker.tolerance, 0.1);
        assert_eq!(config.session.buffer_count, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.session.buffer_count = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.marker.tolerance = -0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.photo.aspect_ratio = 0.0;
        assert!(config.validate().is_err());
    }
}
