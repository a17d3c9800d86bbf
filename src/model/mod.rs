//! Generator network, weight loading and inference backends.

mod arch;
mod device;
mod generator;
pub mod loader;
mod onnx;

pub use arch::{
    GeneratorConfig, GeneratorSpec, LayerSpec, Norm, ParamSpec, StageSpec, SPATIAL_MULTIPLE,
};
pub use device::{device_label, DeviceChoice};
pub use generator::Generator;
pub use loader::{load_generator, LoadedWeights, WeightFormat, WeightReport, WeightsLayout};
pub use onnx::OnnxGenerator;

#[cfg(test)]
pub(crate) use generator::tests::random_generator;

use crate::error::Result;
use crate::image::ImageTensor;

/// Maps a normalized thermal tensor `(N, 1, H, W)` to a normalized RGB tensor `(N, 3, H, W)`.
pub trait Translator: Send + Sync {
    /// Run one inference pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the input or fails during execution.
    fn translate(&self, input: &ImageTensor) -> Result<ImageTensor>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
