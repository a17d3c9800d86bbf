//! Native generator executed with candle.

use candle_core::{Device, Module, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, conv_transpose2d_no_bias, BatchNorm, Conv2d, Conv2dConfig,
    ConvTranspose2d, ConvTranspose2dConfig, ModuleT, VarBuilder,
};
use ndarray::Array4;

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::arch::{GeneratorSpec, LayerSpec, Norm, StageSpec, BATCH_NORM_EPS, SPATIAL_MULTIPLE};
use super::Translator;

/// Residual refinement block.
struct ResidualBlock {
    proj: Option<Conv2d>,
    conv1: Conv2d,
    bn1: Option<BatchNorm>,
    conv2: Conv2d,
    bn2: Option<BatchNorm>,
}

impl ResidualBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        norm: Norm,
        vb: &VarBuilder,
    ) -> candle_core::Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let proj = if in_channels == out_channels {
            None
        } else {
            Some(conv2d_no_bias(
                in_channels,
                out_channels,
                1,
                Conv2dConfig::default(),
                vb.pp("proj"),
            )?)
        };

        let bn = |name: &str| -> candle_core::Result<Option<BatchNorm>> {
            match norm {
                Norm::Batch => Ok(Some(batch_norm(out_channels, BATCH_NORM_EPS, vb.pp(name))?)),
                Norm::Identity => Ok(None),
            }
        };

        Ok(Self {
            proj,
            conv1: conv2d_no_bias(in_channels, out_channels, 3, same, vb.pp("conv1"))?,
            bn1: bn("bn1")?,
            conv2: conv2d_no_bias(out_channels, out_channels, 3, same, vb.pp("conv2"))?,
            bn2: bn("bn2")?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let identity = match &self.proj {
            Some(proj) => proj.forward(x)?,
            None => x.clone(),
        };

        let out = self.conv1.forward(x)?;
        let out = normalize(self.bn1.as_ref(), &out)?.gelu_erf()?;
        let out = self.conv2.forward(&out)?;
        let out = normalize(self.bn2.as_ref(), &out)?;

        (out + identity)?.gelu_erf()
    }
}

/// Batch normalization with running statistics, or pass-through.
fn normalize(bn: Option<&BatchNorm>, x: &Tensor) -> candle_core::Result<Tensor> {
    match bn {
        Some(bn) => bn.forward_t(x, false),
        None => Ok(x.clone()),
    }
}

/// A layer instantiated from its [`LayerSpec`].
enum Layer {
    Conv(Conv2d),
    ConvTranspose(ConvTranspose2d),
    BatchNorm(BatchNorm),
    Residual(ResidualBlock),
    Gelu,
    Tanh,
    /// Identity slots and dropout, both no-ops in inference mode.
    PassThrough,
}

impl Layer {
    fn new(spec: &LayerSpec, vb: &VarBuilder) -> candle_core::Result<Self> {
        let layer = match *spec {
            LayerSpec::Conv {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
            } => {
                let cfg = Conv2dConfig {
                    padding,
                    stride,
                    ..Default::default()
                };
                Self::Conv(conv2d_no_bias(in_channels, out_channels, kernel, cfg, vb.clone())?)
            }
            LayerSpec::ConvTranspose {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
            } => {
                let cfg = ConvTranspose2dConfig {
                    padding,
                    stride,
                    ..Default::default()
                };
                Self::ConvTranspose(conv_transpose2d_no_bias(
                    in_channels,
                    out_channels,
                    kernel,
                    cfg,
                    vb.clone(),
                )?)
            }
            LayerSpec::BatchNorm { channels } => {
                Self::BatchNorm(batch_norm(channels, BATCH_NORM_EPS, vb.clone())?)
            }
            LayerSpec::Residual {
                in_channels,
                out_channels,
                norm,
            } => Self::Residual(ResidualBlock::new(in_channels, out_channels, norm, vb)?),
            LayerSpec::Gelu => Self::Gelu,
            LayerSpec::Tanh => Self::Tanh,
            LayerSpec::Identity | LayerSpec::Dropout { .. } => Self::PassThrough,
        };
        Ok(layer)
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Conv(conv) => conv.forward(x),
            Self::ConvTranspose(conv) => conv.forward(x),
            Self::BatchNorm(bn) => bn.forward_t(x, false),
            Self::Residual(block) => block.forward(x),
            Self::Gelu => x.gelu_erf(),
            Self::Tanh => x.tanh(),
            Self::PassThrough => Ok(x.clone()),
        }
    }
}

struct Stage {
    layers: Vec<Layer>,
    skip: Option<usize>,
}

impl Stage {
    fn new(spec: &StageSpec, vb: &VarBuilder) -> candle_core::Result<Self> {
        let vb = vb.pp(&spec.name);
        let layers = spec
            .layers
            .iter()
            .enumerate()
            .map(|(index, layer)| Layer::new(layer, &vb.pp(index.to_string())))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            skip: spec.skip,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.layers
            .iter()
            .try_fold(x.clone(), |x, layer| layer.forward(&x))
    }
}

/// The thermal-to-RGB generator in inference mode.
///
/// Batch normalization always uses the stored running statistics and dropout
/// is skipped, so the output is a pure function of weights and input.
pub struct Generator {
    spec: GeneratorSpec,
    encoder: Vec<Stage>,
    decoder: Vec<Stage>,
    head: Stage,
    device: Device,
}

impl Generator {
    /// Instantiate every layer of `spec` from `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is missing from `vb` or has the wrong shape.
    pub fn new(spec: GeneratorSpec, vb: &VarBuilder) -> Result<Self> {
        let build = |stages: &[StageSpec]| {
            stages
                .iter()
                .map(|stage| Stage::new(stage, vb))
                .collect::<candle_core::Result<Vec<_>>>()
        };

        let encoder = build(&spec.encoder)?;
        let decoder = build(&spec.decoder)?;
        let head = Stage::new(&spec.head, vb)?;

        Ok(Self {
            device: vb.device().clone(),
            spec,
            encoder,
            decoder,
            head,
        })
    }

    #[must_use]
    pub const fn spec(&self) -> &GeneratorSpec {
        &self.spec
    }

    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Run the network on an `(N, in_channels, H, W)` tensor.
    ///
    /// `H` and `W` must be multiples of 256.
    ///
    /// # Errors
    ///
    /// Returns an error on a malformed input shape or a failed tensor operation.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, channels, height, width) = x.dims4()?;
        if channels != self.spec.config.in_channels
            || height % SPATIAL_MULTIPLE != 0
            || width % SPATIAL_MULTIPLE != 0
            || height == 0
            || width == 0
        {
            return Err(Error::ShapeMismatch {
                expected: format!(
                    "[N, {}, H, W] with H, W multiples of {SPATIAL_MULTIPLE}",
                    self.spec.config.in_channels
                ),
                actual: format!("{:?}", x.dims()),
            });
        }

        let mut skips = Vec::with_capacity(self.encoder.len());
        let mut x = x.clone();
        for stage in &self.encoder {
            x = stage.forward(&x)?;
            skips.push(x.clone());
        }

        for stage in &self.decoder {
            x = stage.forward(&x)?;
            if let Some(skip) = stage.skip {
                x = Tensor::cat(&[&x, &skips[skip]], 1)?;
            }
        }

        Ok(self.head.forward(&x)?)
    }
}

impl Translator for Generator {
    fn translate(&self, input: &ImageTensor) -> Result<ImageTensor> {
        let dims = input.dim();
        let data: Vec<f32> = input.iter().copied().collect();
        let x = Tensor::from_vec(data, dims, &self.device)?;

        let y = self.forward(&x)?;

        let dims = y.dims4()?;
        let data = y.flatten_all()?.to_vec1::<f32>()?;
        Array4::from_shape_vec(dims, data).map_err(|err| Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: err.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::arch::GeneratorConfig;
    use candle_core::DType;
    use candle_nn::VarMap;

    /// A generator with randomly initialized weights.
    pub(crate) fn random_generator(base: usize) -> (Generator, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let spec = GeneratorSpec::new(GeneratorConfig {
            base,
            ..GeneratorConfig::default()
        });
        let generator = Generator::new(spec, &vb).unwrap();
        (generator, varmap)
    }

    fn ramp_input(batch: usize) -> Tensor {
        let n = batch * 256 * 256;
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..n).map(|i| (i % 509) as f32 / 254.0 - 1.0).collect();
        Tensor::from_vec(data, (batch, 1, 256, 256), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_shape_and_range() {
        let (generator, _) = random_generator(2);
        let y = generator.forward(&ramp_input(1)).unwrap();

        assert_eq!(y.dims(), &[1, 3, 256, 256]);
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_forward_is_deterministic() {
        let (generator, _) = random_generator(2);
        let x = ramp_input(1);

        let a = generator.forward(&x).unwrap();
        let b = generator.forward(&x).unwrap();

        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff <= 1e-6, "max difference {diff}");
    }

    #[test]
    fn test_accepts_batches() {
        let (generator, _) = random_generator(2);
        let y = generator.forward(&ramp_input(2)).unwrap();

        assert_eq!(y.dims(), &[2, 3, 256, 256]);
    }

    #[test]
    fn test_rejects_bad_spatial_size() {
        let (generator, _) = random_generator(2);
        let x = Tensor::zeros((1, 1, 100, 100), DType::F32, &Device::Cpu).unwrap();

        assert!(matches!(
            generator.forward(&x),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let (generator, _) = random_generator(2);
        let x = Tensor::zeros((1, 3, 256, 256), DType::F32, &Device::Cpu).unwrap();

        assert!(matches!(
            generator.forward(&x),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_translate_matches_forward() {
        let (generator, _) = random_generator(2);
        let input = Array4::from_shape_fn((1, 1, 256, 256), |(_, _, y, x)| {
            if (x + y) % 2 == 0 {
                0.5
            } else {
                -0.5
            }
        });

        let output = generator.translate(&input).unwrap();
        assert_eq!(output.dim(), (1, 3, 256, 256));

        let data: Vec<f32> = input.iter().copied().collect();
        let x = Tensor::from_vec(data, (1, 1, 256, 256), &Device::Cpu).unwrap();
        let direct = generator
            .forward(&x)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(output.iter().zip(&direct).all(|(a, b)| a == b));
    }
}
