//! Pipeline configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{DeviceChoice, WeightsLayout};

/// Default location of the trained generator weights.
pub const DEFAULT_WEIGHTS_PATH: &str = "model_weights/model.pt";

/// Default location of the exported ONNX graph.
pub const DEFAULT_ONNX_PATH: &str = "model_weights/thermal_gan.onnx";

/// Inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Generator built from the weight file and run with candle.
    #[default]
    Native,
    /// Exported graph run with ONNX Runtime.
    Onnx,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Onnx => write!(f, "onnx"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" | "candle" => Ok(Self::Native),
            "onnx" | "ort" => Ok(Self::Onnx),
            other => Err(format!("unknown backend '{other}', expected native or onnx")),
        }
    }
}

/// Configuration for the thermal-to-RGB pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which backend runs the generator.
    pub backend: Backend,

    /// Generator weights (`.pt`/`.pth` pickle or `.safetensors`) for the native backend.
    pub weights_path: PathBuf,

    /// Exported graph for the ONNX backend.
    pub onnx_path: PathBuf,

    /// Arrangement of the weights inside `weights_path`.
    pub weights_layout: WeightsLayout,

    /// Compute device for the native backend.
    pub device: DeviceChoice,

    /// Width of the first encoder stage the weights were trained with.
    pub base_channels: usize,

    /// JPEG quality (1-100) for file output.
    pub output_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Native,
            weights_path: PathBuf::from(DEFAULT_WEIGHTS_PATH),
            onnx_path: PathBuf::from(DEFAULT_ONNX_PATH),
            weights_layout: WeightsLayout::Auto,
            device: DeviceChoice::Auto,
            base_channels: 32,
            output_quality: 95,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.base_channels == 0 {
            return Err(Error::InvalidParameter {
                name: "base_channels".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.output_quality) {
            return Err(Error::InvalidParameter {
                name: "output_quality".to_string(),
                reason: "must be between 1 and 100".to_string(),
            });
        }

        Ok(())
    }

    /// The file the configured backend loads.
    #[must_use]
    pub fn model_path(&self) -> &Path {
        match self.backend {
            Backend::Native => &self.weights_path,
            Backend::Onnx => &self.onnx_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_base() {
        let config = Config {
            base_channels: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidParameter { name, .. }) if name == "base_channels"
        ));
    }

    #[test]
    fn test_rejects_quality_out_of_range() {
        let config = Config {
            output_quality: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_path_follows_backend() {
        let mut config = Config::default();
        assert_eq!(config.model_path(), Path::new(DEFAULT_WEIGHTS_PATH));

        config.backend = Backend::Onnx;
        assert_eq!(config.model_path(), Path::new(DEFAULT_ONNX_PATH));
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!("native".parse(), Ok(Backend::Native));
        assert_eq!("ONNX".parse(), Ok(Backend::Onnx));
        assert!("tensorrt".parse::<Backend>().is_err());
    }
}
