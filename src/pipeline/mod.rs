//! Thermal-to-RGB generation pipeline.

mod config;
mod generate;

pub use config::{Backend, Config, DEFAULT_ONNX_PATH, DEFAULT_WEIGHTS_PATH};
pub use generate::Pipeline;
