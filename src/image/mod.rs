//! Conversion between encoded images and generator tensors.

mod postprocess;
mod prepare;

pub use postprocess::{encode_png, postprocess, save_image};
pub use prepare::{prepare, prepare_file};

use ndarray::Array4;

/// Image tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [-1, 1], the range of the generator's tanh output.
pub type ImageTensor = Array4<f32>;

/// Side length the generator consumes and produces.
pub const IMAGE_SIZE: u32 = 256;

/// Channels of the thermal input.
pub const INPUT_CHANNELS: usize = 1;

/// Channels of the generated image.
pub const OUTPUT_CHANNELS: usize = 3;

/// Per-channel mean used for normalization.
pub const NORM_MEAN: f32 = 0.5;

/// Per-channel standard deviation used for normalization.
pub const NORM_STD: f32 = 0.5;
