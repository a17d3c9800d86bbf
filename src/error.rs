//! Custom error types for thermal-gan.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the thermal-gan library.
#[derive(Error, Debug)]
pub enum Error {
    /// Uploaded or on-disk bytes are not a decodable image.
    #[error("failed to decode image: {source}")]
    Decode {
        #[source]
        source: image::ImageError,
    },

    /// Failed to encode the generated image.
    #[error("failed to encode output image: {source}")]
    Encode {
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to read the generator weight file.
    #[error("failed to load weights from {path}: {source}")]
    WeightsLoad {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    /// Weight file does not match the generator architecture.
    #[error("weights in {path} do not match the generator: {}", .report)]
    WeightMismatch { path: PathBuf, report: String },

    /// Failed to load an ONNX model.
    #[error("failed to load ONNX model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// ONNX inference failed.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Native tensor operation failed.
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// The generator produced NaN or infinite values.
    #[error("generator produced {count} non-finite output values")]
    NonFiniteOutput { count: usize },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error was caused by the caller's input rather than the server.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::InvalidParameter { .. })
    }
}

/// Result type alias for thermal-gan operations.
pub type Result<T> = std::result::Result<T, Error>;
