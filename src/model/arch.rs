//! Declarative description of the generator network.
//!
//! The network is a U-Net: eight strided encoder stages take a 256x256 input
//! down to 1x1, seven transposed-convolution decoder stages bring it back to
//! 128x128, and a final transposed convolution produces the full-resolution
//! output. Every decoder stage's output is concatenated with the encoder
//! output of the same resolution before entering the next stage.
//!
//! A layer's position inside its stage is also its weight-name index, so
//! `down2.1.running_mean` is the running mean of the second layer of the
//! second encoder stage.

use std::fmt;

/// Spatial size the encoder reduces to 1x1; inputs must be a multiple of it.
pub const SPATIAL_MULTIPLE: usize = 256;

/// Epsilon of every batch normalization layer.
pub const BATCH_NORM_EPS: f64 = 1e-5;

/// Dropout probability of the first three decoder stages (inactive at inference).
pub const DROPOUT_P: f32 = 0.5;

const KERNEL: usize = 4;
const STRIDE: usize = 2;
const PADDING: usize = 1;

/// Channel configuration of the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Channels of the input image.
    pub in_channels: usize,
    /// Channels of the generated image.
    pub out_channels: usize,
    /// Width of the first encoder stage; deeper stages use up to 8x this.
    pub base: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 3,
            base: 32,
        }
    }
}

/// Whether a stage normalizes its activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    /// Batch normalization with stored running statistics.
    Batch,
    /// No normalization; the layer slot is kept so weight indices line up.
    Identity,
}

/// A single layer of a stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerSpec {
    /// Bias-free 2D convolution.
    Conv {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    /// Bias-free 2D transposed convolution.
    ConvTranspose {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    BatchNorm {
        channels: usize,
    },
    Identity,
    /// Exact (erf) GELU.
    Gelu,
    /// Residual refinement block, see [`residual_parameters`].
    Residual {
        in_channels: usize,
        out_channels: usize,
        norm: Norm,
    },
    Dropout {
        p: f32,
    },
    Tanh,
}

/// Name and shape of one parameter tensor the network expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

/// An ordered group of layers sharing a weight-name prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub layers: Vec<LayerSpec>,
    /// Index of the encoder stage whose output is concatenated after this stage.
    pub skip: Option<usize>,
}

impl StageSpec {
    fn down(index: usize, in_channels: usize, out_channels: usize, norm: Norm) -> Self {
        let norm_layer = match norm {
            Norm::Batch => LayerSpec::BatchNorm {
                channels: out_channels,
            },
            Norm::Identity => LayerSpec::Identity,
        };

        Self {
            name: format!("down{index}"),
            layers: vec![
                LayerSpec::Conv {
                    in_channels,
                    out_channels,
                    kernel: KERNEL,
                    stride: STRIDE,
                    padding: PADDING,
                },
                norm_layer,
                LayerSpec::Gelu,
                LayerSpec::Residual {
                    in_channels: out_channels,
                    out_channels,
                    norm,
                },
            ],
            skip: None,
        }
    }

    fn up(
        index: usize,
        in_channels: usize,
        out_channels: usize,
        dropout: bool,
        skip: usize,
    ) -> Self {
        let mut layers = vec![
            LayerSpec::ConvTranspose {
                in_channels,
                out_channels,
                kernel: KERNEL,
                stride: STRIDE,
                padding: PADDING,
            },
            LayerSpec::BatchNorm {
                channels: out_channels,
            },
            LayerSpec::Gelu,
            LayerSpec::Residual {
                in_channels: out_channels,
                out_channels,
                norm: Norm::Batch,
            },
        ];
        if dropout {
            layers.push(LayerSpec::Dropout { p: DROPOUT_P });
        }

        Self {
            name: format!("up{index}"),
            layers,
            skip: Some(skip),
        }
    }

    /// Parameters of this stage in layer order.
    #[must_use]
    pub fn parameters(&self) -> Vec<ParamSpec> {
        let mut params = Vec::new();
        for (index, layer) in self.layers.iter().enumerate() {
            layer_parameters(&format!("{}.{index}", self.name), layer, &mut params);
        }
        params
    }
}

/// Full layer graph of the generator, built once from a [`GeneratorConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSpec {
    pub config: GeneratorConfig,
    pub encoder: Vec<StageSpec>,
    pub decoder: Vec<StageSpec>,
    pub head: StageSpec,
}

impl GeneratorSpec {
    #[must_use]
    pub fn new(config: GeneratorConfig) -> Self {
        let b = config.base;

        let encoder_widths = [
            (config.in_channels, b, Norm::Identity),
            (b, b * 2, Norm::Batch),
            (b * 2, b * 4, Norm::Batch),
            (b * 4, b * 8, Norm::Batch),
            (b * 8, b * 8, Norm::Batch),
            (b * 8, b * 8, Norm::Batch),
            (b * 8, b * 8, Norm::Batch),
            (b * 8, b * 8, Norm::Identity),
        ];
        let encoder: Vec<StageSpec> = encoder_widths
            .iter()
            .enumerate()
            .map(|(i, &(cin, cout, norm))| StageSpec::down(i + 1, cin, cout, norm))
            .collect();

        // Input widths after the first stage include the concatenated skip.
        let decoder_widths = [
            (b * 8, b * 8, true),
            (b * 16, b * 8, true),
            (b * 16, b * 8, true),
            (b * 16, b * 8, false),
            (b * 16, b * 4, false),
            (b * 8, b * 2, false),
            (b * 4, b, false),
        ];
        let decoder = decoder_widths
            .iter()
            .enumerate()
            .map(|(i, &(cin, cout, dropout))| {
                // up1 pairs with down7, up7 with down1.
                let skip = encoder.len() - 2 - i;
                StageSpec::up(i + 1, cin, cout, dropout, skip)
            })
            .collect();

        let head = StageSpec {
            name: "final".to_string(),
            layers: vec![
                LayerSpec::ConvTranspose {
                    in_channels: b * 2,
                    out_channels: config.out_channels,
                    kernel: KERNEL,
                    stride: STRIDE,
                    padding: PADDING,
                },
                LayerSpec::Tanh,
            ],
            skip: None,
        };

        Self {
            config,
            encoder,
            decoder,
            head,
        }
    }

    /// All stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.encoder
            .iter()
            .chain(self.decoder.iter())
            .chain(std::iter::once(&self.head))
    }

    /// Every parameter tensor the network needs, in execution order.
    #[must_use]
    pub fn parameters(&self) -> Vec<ParamSpec> {
        self.stages().flat_map(StageSpec::parameters).collect()
    }

    /// Total number of scalar parameters, running statistics included.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|p| p.shape.iter().product::<usize>())
            .sum()
    }
}

impl fmt::Display for GeneratorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in self.stages() {
            write!(f, "{}:", stage.name)?;
            for layer in &stage.layers {
                write!(f, " {layer}")?;
            }
            if let Some(skip) = stage.skip {
                write!(f, " ++ {}", self.encoder[skip].name)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv {
                in_channels,
                out_channels,
                kernel,
                stride,
                ..
            } => write!(f, "conv{kernel}x{kernel}/{stride}({in_channels}->{out_channels})"),
            Self::ConvTranspose {
                in_channels,
                out_channels,
                kernel,
                stride,
                ..
            } => write!(f, "deconv{kernel}x{kernel}/{stride}({in_channels}->{out_channels})"),
            Self::BatchNorm { channels } => write!(f, "bn({channels})"),
            Self::Identity => write!(f, "id"),
            Self::Gelu => write!(f, "gelu"),
            Self::Residual {
                in_channels,
                out_channels,
                norm,
            } => {
                let suffix = if *norm == Norm::Batch { "" } else { ",no-norm" };
                write!(f, "res({in_channels}->{out_channels}{suffix})")
            }
            Self::Dropout { p } => write!(f, "dropout({p})"),
            Self::Tanh => write!(f, "tanh"),
        }
    }
}

fn layer_parameters(prefix: &str, layer: &LayerSpec, out: &mut Vec<ParamSpec>) {
    match *layer {
        LayerSpec::Conv {
            in_channels,
            out_channels,
            kernel,
            ..
        } => out.push(param(prefix, "weight", &[out_channels, in_channels, kernel, kernel])),
        LayerSpec::ConvTranspose {
            in_channels,
            out_channels,
            kernel,
            ..
        } => out.push(param(prefix, "weight", &[in_channels, out_channels, kernel, kernel])),
        LayerSpec::BatchNorm { channels } => batch_norm_parameters(prefix, channels, out),
        LayerSpec::Residual {
            in_channels,
            out_channels,
            norm,
        } => residual_parameters(prefix, in_channels, out_channels, norm, out),
        LayerSpec::Identity | LayerSpec::Gelu | LayerSpec::Dropout { .. } | LayerSpec::Tanh => {}
    }
}

/// Parameters of a residual block.
///
/// The block computes `gelu(bn2(conv2(gelu(bn1(conv1(x))))) + shortcut(x))`
/// with 3x3 convolutions. `shortcut` is a 1x1 projection named `proj` when the
/// channel count changes, the identity otherwise.
pub fn residual_parameters(
    prefix: &str,
    in_channels: usize,
    out_channels: usize,
    norm: Norm,
    out: &mut Vec<ParamSpec>,
) {
    if in_channels != out_channels {
        out.push(param(prefix, "proj.weight", &[out_channels, in_channels, 1, 1]));
    }
    out.push(param(prefix, "conv1.weight", &[out_channels, in_channels, 3, 3]));
    if norm == Norm::Batch {
        batch_norm_parameters(&format!("{prefix}.bn1"), out_channels, out);
    }
    out.push(param(prefix, "conv2.weight", &[out_channels, out_channels, 3, 3]));
    if norm == Norm::Batch {
        batch_norm_parameters(&format!("{prefix}.bn2"), out_channels, out);
    }
}

fn batch_norm_parameters(prefix: &str, channels: usize, out: &mut Vec<ParamSpec>) {
    for name in ["weight", "bias", "running_mean", "running_var"] {
        out.push(param(prefix, name, &[channels]));
    }
}

fn param(prefix: &str, name: &str, shape: &[usize]) -> ParamSpec {
    ParamSpec {
        name: format!("{prefix}.{name}"),
        shape: shape.to_vec(),
    }
}
