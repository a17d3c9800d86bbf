//! # `thermal-gan`
//!
//! Turns grayscale thermal images into RGB-like images with a U-Net style
//! generator and serves it over HTTP.
//!
//! The generator is built from an explicit layer description
//! ([`model::GeneratorSpec`]) and trained weights, and always runs in
//! inference mode. Requests go through [`Pipeline`]: the upload is decoded,
//! reduced to one channel, resized to 256x256 and normalized to [-1, 1];
//! the generator output is mapped back to 8-bit RGB and encoded as PNG.
//!
//! ## Example
//!
//! ```no_run
//! use thermal_gan::{Config, Pipeline};
//!
//! # fn main() -> thermal_gan::Result<()> {
//! let pipeline = Pipeline::new(Config::default())?;
//!
//! let thermal = std::fs::read("thermal.png")?;
//! let rgb_png = pipeline.generate(&thermal)?;
//! std::fs::write("rgb.png", rgb_png)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;
pub mod server;

pub use error::{Error, Result};
pub use pipeline::{Backend, Config, Pipeline};
