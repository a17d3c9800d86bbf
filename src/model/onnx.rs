//! ONNX Runtime backend for the exported generator.
//!
//! The exported graph takes `input` of shape `(batch, 1, 256, 256)` and
//! returns `output` of shape `(batch, 3, 256, 256)`, with the same
//! normalization as the native generator.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::image::{ImageTensor, OUTPUT_CHANNELS};

use super::Translator;

/// Generator running the exported ONNX graph.
pub struct OnnxGenerator {
    name: String,
    // `Session::run` needs `&mut`, requests share one session.
    session: Mutex<Session>,
}

impl OnnxGenerator {
    /// Load an ONNX session from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded.
    pub fn load(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        tracing::info!("Loading ONNX generator from {name}...");

        let session = Session::builder()
            .map_err(|source| Error::ModelLoad {
                name: name.clone(),
                source,
            })?
            .commit_from_file(path)
            .map_err(|source| Error::ModelLoad {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            session: Mutex::new(session),
        })
    }

    /// Path the session was loaded from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.name
    }
}

impl Translator for OnnxGenerator {
    fn translate(&self, input: &ImageTensor) -> Result<ImageTensor> {
        let input_value =
            Tensor::from_array(input.clone()).map_err(|source| Error::Inference { source })?;

        // Poisoning is ignored: the session keeps no per-run state.
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "generator output".to_string(),
                actual: "no output".to_string(),
            })?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|source| Error::Inference { source })?;

        rgb_from_raw(shape, data, input.dim())
    }

    fn name(&self) -> &'static str {
        "onnx"
    }
}

/// Rebuild the generator output from the raw ONNX shape and buffer.
///
/// The output must be `(N, 3, H, W)` with the batch and spatial size of
/// `input_dim`.
fn rgb_from_raw(
    shape: &[i64],
    data: &[f32],
    input_dim: (usize, usize, usize, usize),
) -> Result<ImageTensor> {
    let (batch, _, height, width) = input_dim;
    let expected = (batch, OUTPUT_CHANNELS, height, width);
    let mismatch = || Error::ShapeMismatch {
        expected: format!("{expected:?}"),
        actual: format!("{shape:?}"),
    };

    let dims = shape
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| mismatch()))
        .collect::<Result<Vec<_>>>()?;
    if dims != [expected.0, expected.1, expected.2, expected.3] {
        return Err(mismatch());
    }

    Array4::from_shape_vec(expected, data.to_vec()).map_err(|_| mismatch())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_file() {
        let result = OnnxGenerator::load(Path::new("does/not/exist.onnx"));
        assert!(matches!(result, Err(Error::ModelLoad { .. })));
    }

    #[test]
    fn test_rgb_from_raw_keeps_nchw_order() {
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..2 * 3 * 2 * 2).map(|i| i as f32).collect();

        let rgb = rgb_from_raw(&[2, 3, 2, 2], &data, (2, 1, 2, 2)).unwrap();

        assert_eq!(rgb.dim(), (2, 3, 2, 2));
        assert!((rgb[[0, 1, 0, 0]] - 4.0).abs() < f32::EPSILON);
        assert!((rgb[[1, 2, 1, 1]] - 23.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rgb_from_raw_rejects_wrong_shapes() {
        let data = vec![0.0; 3 * 4 * 4];

        // Single channel output
        assert!(matches!(
            rgb_from_raw(&[1, 1, 4, 4], &data[..16], (1, 1, 4, 4)),
            Err(Error::ShapeMismatch { .. })
        ));
        // Missing batch axis
        assert!(matches!(
            rgb_from_raw(&[3, 4, 4], &data, (1, 1, 4, 4)),
            Err(Error::ShapeMismatch { .. })
        ));
        // Spatial size differs from the input
        assert!(matches!(
            rgb_from_raw(&[1, 3, 4, 4], &data, (1, 1, 8, 8)),
            Err(Error::ShapeMismatch { .. })
        ));
        // Dynamic axis left unresolved
        assert!(matches!(
            rgb_from_raw(&[-1, 3, 4, 4], &data, (1, 1, 4, 4)),
            Err(Error::ShapeMismatch { .. })
        ));
        // Buffer shorter than the shape
        assert!(matches!(
            rgb_from_raw(&[1, 3, 4, 4], &data[..10], (1, 1, 4, 4)),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
