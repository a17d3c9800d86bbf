//! Thermal-to-RGB generation pipeline.

use std::path::Path;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::image::{self, ImageTensor};
use crate::model::{
    device_label, load_generator, GeneratorConfig, GeneratorSpec, OnnxGenerator, Translator,
};

use super::config::{Backend, Config};

/// Main pipeline turning thermal images into RGB-like images.
///
/// Holds the loaded generator for the lifetime of the process. All methods
/// take `&self`, so one instance can be shared behind an `Arc`.
pub struct Pipeline {
    config: Config,
    translator: Box<dyn Translator>,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration.
    ///
    /// Loads the generator for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the model cannot be loaded.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing pipeline with config: {config:?}");

        let translator: Box<dyn Translator> = match config.backend {
            Backend::Native => {
                let device = config.device.resolve()?;
                tracing::info!("Using device: {}", device_label(&device));

                let spec = GeneratorSpec::new(GeneratorConfig {
                    base: config.base_channels,
                    ..GeneratorConfig::default()
                });
                Box::new(load_generator(
                    &config.weights_path,
                    config.weights_layout,
                    spec,
                    &device,
                )?)
            }
            Backend::Onnx => {
                let generator = OnnxGenerator::load(&config.onnx_path)?;
                tracing::info!("ONNX session ready from {}", generator.source());
                Box::new(generator)
            }
        };

        tracing::info!("Pipeline initialized successfully");

        Ok(Self { config, translator })
    }

    /// Create a pipeline around an already constructed translator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_translator<T: Translator + 'static>(config: Config, translator: T) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            translator: Box::new(translator),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Name of the backend serving requests.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.translator.name()
    }

    /// Generate an RGB PNG from encoded thermal image bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input cannot be decoded, inference fails, or the
    /// output cannot be encoded.
    pub fn generate(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let input = image::prepare(bytes)?;
        let output = self.run(&input)?;
        image::postprocess(&output)
    }

    /// Process an image file and save the result.
    ///
    /// # Arguments
    ///
    /// * `input_path` - Path to the thermal image
    /// * `output_path` - Path to save the generated image (format from extension)
    ///
    /// # Errors
    ///
    /// Returns an error if processing fails.
    pub fn generate_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input_path: P,
        output_path: Q,
    ) -> Result<()> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        tracing::info!("Processing image: {}", input_path.display());
        let input = image::prepare_file(input_path)?;

        let output = self.run(&input)?;

        tracing::info!("Saving output to: {}", output_path.display());
        image::save_image(&output, output_path, self.config.output_quality)?;

        tracing::info!("Processing complete");
        Ok(())
    }

    /// Run the generator on a prepared tensor and check its output.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails or produces non-finite values.
    pub fn run(&self, input: &ImageTensor) -> Result<ImageTensor> {
        let start = Instant::now();
        let output = self.translator.translate(input)?;

        tracing::debug!(
            backend = self.translator.name(),
            elapsed_ms = start.elapsed().as_millis(),
            "forward pass complete"
        );

        ensure_finite(&output)?;
        Ok(output)
    }
}

/// Reject outputs containing NaN or infinity instead of encoding them as black.
fn ensure_finite(output: &ImageTensor) -> Result<()> {
    let count = output.iter().filter(|v| !v.is_finite()).count();
    if count > 0 {
        tracing::warn!("generator output contains {count} non-finite values");
        return Err(Error::NonFiniteOutput { count });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::random_generator;
    use ::image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use ndarray::Array4;
    use std::io::Cursor;

    /// Returns a constant RGB tensor of the input's spatial size.
    struct Constant(f32);

    impl Translator for Constant {
        fn translate(&self, input: &ImageTensor) -> Result<ImageTensor> {
            let (n, _, h, w) = input.dim();
            Ok(Array4::from_elem((n, 3, h, w), self.0))
        }

        fn name(&self) -> &'static str {
            "constant"
        }
    }

    fn thermal_png(width: u32, height: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(width, height, |x, y| {
            Luma([u8::try_from((x * 7 + y * 3) % 256).unwrap()])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_generate_with_stub_translator() {
        let pipeline = Pipeline::from_translator(Config::default(), Constant(0.0)).unwrap();
        let png = pipeline.generate(&thermal_png(64, 48)).unwrap();

        let img = ::image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (256, 256));
        assert!(img.pixels().all(|p| p.0 == [127, 127, 127]));
        assert_eq!(pipeline.backend_name(), "constant");
        assert_eq!(pipeline.config().backend, Backend::Native);
    }

    #[test]
    fn test_non_finite_output_is_rejected() {
        let pipeline = Pipeline::from_translator(Config::default(), Constant(f32::NAN)).unwrap();
        let result = pipeline.generate(&thermal_png(16, 16));

        assert!(matches!(result, Err(Error::NonFiniteOutput { count }) if count == 3 * 256 * 256));
    }

    #[test]
    fn test_generate_with_native_generator() {
        let (generator, _) = random_generator(2);
        let pipeline = Pipeline::from_translator(Config::default(), generator).unwrap();

        let png = pipeline.generate(&thermal_png(320, 240)).unwrap();
        let img = ::image::load_from_memory(&png).unwrap();

        assert_eq!(img.color(), ::image::ColorType::Rgb8);
        assert_eq!((img.width(), img.height()), (256, 256));
    }

    #[test]
    fn test_generate_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("thermal.png");
        let output = dir.path().join("rgb.jpg");
        std::fs::write(&input, thermal_png(100, 100)).unwrap();

        let pipeline = Pipeline::from_translator(Config::default(), Constant(0.5)).unwrap();
        pipeline.generate_file(&input, &output).unwrap();

        let img = ::image::open(&output).unwrap();
        assert_eq!((img.width(), img.height()), (256, 256));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            base_channels: 0,
            ..Config::default()
        };
        assert!(Pipeline::from_translator(config, Constant(0.0)).is_err());
    }

    #[test]
    fn test_missing_weights_fail_at_startup() {
        let config = Config {
            weights_path: "does/not/exist.pt".into(),
            device: crate::model::DeviceChoice::Cpu,
            ..Config::default()
        };
        assert!(matches!(
            Pipeline::new(config),
            Err(Error::WeightsLoad { .. })
        ));
    }
}
