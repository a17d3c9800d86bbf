//! Weight file reading, validation and generator construction.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::error::{Error, Result};

use super::arch::GeneratorSpec;
use super::device::device_label;
use super::generator::Generator;

/// Entry of a training checkpoint that holds the generator weights.
pub const CHECKPOINT_KEY: &str = "gen_state_dict";

/// Training bookkeeping stored next to batch norm statistics; never read.
const IGNORED_SUFFIX: &str = "num_batches_tracked";

/// How the generator weights are arranged inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightsLayout {
    /// Try [`WeightsLayout::Checkpoint`], fall back to [`WeightsLayout::Bare`].
    #[default]
    Auto,
    /// The file is the parameter mapping itself.
    Bare,
    /// The mapping sits under [`CHECKPOINT_KEY`] (pickle) or its key prefix (safetensors).
    Checkpoint,
}

impl fmt::Display for WeightsLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Bare => write!(f, "bare"),
            Self::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

impl FromStr for WeightsLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "bare" | "state-dict" => Ok(Self::Bare),
            "checkpoint" => Ok(Self::Checkpoint),
            other => Err(format!(
                "unknown weights layout '{other}', expected auto, bare or checkpoint"
            )),
        }
    }
}

/// Serialization format of a weight file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// PyTorch zip/pickle (`.pt`, `.pth`, `.bin`).
    Pickle,
    SafeTensors,
}

impl WeightFormat {
    /// Guess the format from the file extension; anything but `.safetensors` is pickle.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("safetensors") => Self::SafeTensors,
            _ => Self::Pickle,
        }
    }
}

/// Parameter tensors read from a weight file, still on the CPU.
#[derive(Debug)]
pub struct LoadedWeights {
    pub path: PathBuf,
    pub format: WeightFormat,
    /// Layout actually found in the file; never [`WeightsLayout::Auto`].
    pub layout: WeightsLayout,
    pub tensors: HashMap<String, Tensor>,
}

/// Read every tensor of the generator mapping from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not have the requested layout.
pub fn read_weights(path: &Path, layout: WeightsLayout) -> Result<LoadedWeights> {
    let format = WeightFormat::from_path(path);
    let load_err = |source| Error::WeightsLoad {
        path: path.to_path_buf(),
        source,
    };

    let (tensors, layout) = match format {
        WeightFormat::Pickle => read_pickle(path, layout).map_err(load_err)?,
        WeightFormat::SafeTensors => {
            let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(load_err)?;
            unwrap_prefixed(tensors, layout).map_err(load_err)?
        }
    };

    tracing::info!(
        "Read {} tensors from {} ({format:?}, {layout} layout)",
        tensors.len(),
        path.display()
    );

    Ok(LoadedWeights {
        path: path.to_path_buf(),
        format,
        layout,
        tensors,
    })
}

fn read_pickle(
    path: &Path,
    layout: WeightsLayout,
) -> candle_core::Result<(HashMap<String, Tensor>, WeightsLayout)> {
    let read = |key: Option<&str>| {
        candle_core::pickle::read_all_with_key(path, key)
            .map(|tensors| tensors.into_iter().collect::<HashMap<_, _>>())
    };

    match layout {
        WeightsLayout::Bare => Ok((read(None)?, WeightsLayout::Bare)),
        WeightsLayout::Checkpoint => Ok((read(Some(CHECKPOINT_KEY))?, WeightsLayout::Checkpoint)),
        WeightsLayout::Auto => match read(Some(CHECKPOINT_KEY)) {
            Ok(tensors) if !tensors.is_empty() => Ok((tensors, WeightsLayout::Checkpoint)),
            Ok(_) => Ok((read(None)?, WeightsLayout::Bare)),
            Err(err) => {
                tracing::debug!("no '{CHECKPOINT_KEY}' entry ({err}), reading bare mapping");
                Ok((read(None)?, WeightsLayout::Bare))
            }
        },
    }
}

/// Safetensors files are flat, so a checkpoint stores its mapping under
/// `gen_state_dict.`-prefixed names.
fn unwrap_prefixed(
    tensors: HashMap<String, Tensor>,
    layout: WeightsLayout,
) -> candle_core::Result<(HashMap<String, Tensor>, WeightsLayout)> {
    let prefix = format!("{CHECKPOINT_KEY}.");
    let has_prefix = tensors.keys().any(|name| name.starts_with(&prefix));

    let layout = match (layout, has_prefix) {
        (WeightsLayout::Bare, _) | (WeightsLayout::Auto, false) => {
            return Ok((tensors, WeightsLayout::Bare));
        }
        (WeightsLayout::Checkpoint | WeightsLayout::Auto, true) => WeightsLayout::Checkpoint,
        (WeightsLayout::Checkpoint, false) => {
            return Err(candle_core::Error::Msg(format!(
                "no tensors under '{prefix}' in checkpoint"
            )));
        }
    };

    let unwrapped = tensors
        .into_iter()
        .filter_map(|(name, tensor)| {
            name.strip_prefix(&prefix)
                .map(|stripped| (stripped.to_string(), tensor))
        })
        .collect();
    Ok((unwrapped, layout))
}

/// Differences between a weight mapping and what the generator expects.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WeightReport {
    pub missing: Vec<String>,
    /// `(name, expected shape, found shape)`.
    pub mismatched: Vec<(String, Vec<usize>, Vec<usize>)>,
    pub unexpected: Vec<String>,
}

impl WeightReport {
    /// Compare `tensors` against every parameter of `spec`.
    #[must_use]
    pub fn check(tensors: &HashMap<String, Tensor>, spec: &GeneratorSpec) -> Self {
        let mut report = Self::default();
        let params = spec.parameters();

        for param in &params {
            match tensors.get(&param.name) {
                None => report.missing.push(param.name.clone()),
                Some(tensor) if tensor.dims() != param.shape.as_slice() => report.mismatched.push((
                    param.name.clone(),
                    param.shape.clone(),
                    tensor.dims().to_vec(),
                )),
                Some(_) => {}
            }
        }

        let expected: BTreeSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
        let mut unexpected: Vec<String> = tensors
            .keys()
            .filter(|name| !expected.contains(name.as_str()) && !name.ends_with(IGNORED_SUFFIX))
            .cloned()
            .collect();
        unexpected.sort();
        report.unexpected = unexpected;

        report
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for WeightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing [{}]", self.missing.join(", ")));
        }
        if !self.mismatched.is_empty() {
            let shapes: Vec<String> = self
                .mismatched
                .iter()
                .map(|(name, expected, found)| {
                    format!("{name}: expected {expected:?}, found {found:?}")
                })
                .collect();
            parts.push(format!("wrong shape [{}]", shapes.join("; ")));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected [{}]", self.unexpected.join(", ")));
        }
        write!(f, "{}", parts.join(", "))
    }
}

impl LoadedWeights {
    /// Fail unless the mapping matches `spec` exactly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WeightMismatch`] listing every offending name.
    pub fn validate(&self, spec: &GeneratorSpec) -> Result<()> {
        if let Some(hint) = self.layout_hint() {
            return Err(Error::WeightMismatch {
                path: self.path.clone(),
                report: hint,
            });
        }

        let report = WeightReport::check(&self.tensors, spec);
        if report.is_clean() {
            return Ok(());
        }
        Err(Error::WeightMismatch {
            path: self.path.clone(),
            report: report.to_string(),
        })
    }

    /// Explain a bare read of a wrapped checkpoint instead of listing every name.
    fn layout_hint(&self) -> Option<String> {
        if self.layout != WeightsLayout::Bare {
            return None;
        }

        let prefix = format!("{CHECKPOINT_KEY}.");
        if self.tensors.is_empty() {
            Some(format!(
                "no parameter tensors at the top level; if this is a training checkpoint, \
                 use the {} layout",
                WeightsLayout::Checkpoint
            ))
        } else if self.tensors.keys().all(|name| name.starts_with(&prefix)) {
            Some(format!(
                "every tensor is under '{prefix}'; use the {} layout",
                WeightsLayout::Checkpoint
            ))
        } else {
            None
        }
    }

    /// Validate and build the generator on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or a tensor cannot be moved to `device`.
    pub fn into_generator(self, spec: GeneratorSpec, device: &Device) -> Result<Generator> {
        self.validate(&spec)?;
        let vb = VarBuilder::from_tensors(self.tensors, DType::F32, device);
        Generator::new(spec, &vb)
    }
}

/// Read, validate and instantiate the generator in one step.
///
/// # Errors
///
/// Returns an error if the file is unreadable or does not match `spec`.
pub fn load_generator(
    path: &Path,
    layout: WeightsLayout,
    spec: GeneratorSpec,
    device: &Device,
) -> Result<Generator> {
    tracing::info!("Loading generator weights from {}...", path.display());
    tracing::debug!("Generator layout:\n{spec}");

    let weights = read_weights(path, layout)?;
    let generator = weights.into_generator(spec, device)?;

    tracing::info!(
        "Generator ready on {} ({} parameters)",
        device_label(generator.device()),
        generator.spec().parameter_count()
    );
    Ok(generator)
}

/// Convert a weight file to a bare f32 safetensors mapping.
///
/// Only parameters the generator uses are written. Returns the tensor count.
///
/// # Errors
///
/// Returns an error if the input does not match `spec` or the output cannot be written.
pub fn export_safetensors(
    input: &Path,
    layout: WeightsLayout,
    spec: &GeneratorSpec,
    output: &Path,
) -> Result<usize> {
    let weights = read_weights(input, layout)?;
    weights.validate(spec)?;

    let mut tensors = weights.tensors;
    let exported = spec
        .parameters()
        .into_iter()
        .map(|param| {
            let tensor = tensors
                .remove(&param.name)
                .ok_or_else(|| Error::WeightMismatch {
                    path: input.to_path_buf(),
                    report: format!("missing [{}]", param.name),
                })?;
            Ok((param.name, tensor.to_dtype(DType::F32)?))
        })
        .collect::<Result<HashMap<String, Tensor>>>()?;

    candle_core::safetensors::save(&exported, output).map_err(|source| Error::WeightsLoad {
        path: output.to_path_buf(),
        source,
    })?;

    tracing::info!("Wrote {} tensors to {}", exported.len(), output.display());
    Ok(exported.len())
}
