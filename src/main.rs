//! `thermal-gan` CLI - serve or run the thermal-to-RGB generator.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thermal_gan::model::{loader, DeviceChoice, GeneratorConfig, GeneratorSpec, WeightsLayout};
use thermal_gan::pipeline::{DEFAULT_ONNX_PATH, DEFAULT_WEIGHTS_PATH};
use thermal_gan::{server, Backend, Config, Pipeline};

/// Translate grayscale thermal images into RGB-like images.
#[derive(Parser, Debug)]
#[command(name = "thermal-gan")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the generator over HTTP.
    Serve {
        /// Address to bind.
        #[arg(long, env = "THERMAL_GAN_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on.
        #[arg(short, long, env = "THERMAL_GAN_PORT", default_value = "8000")]
        port: u16,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Generate a single image from a file.
    Generate {
        /// Thermal input image.
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output image path; format follows the extension.
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Output JPEG quality (1-100).
        #[arg(short, long, default_value = "95", value_name = "INT")]
        quality: u8,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Validate the weight file and write it as an f32 safetensors mapping.
    Export {
        /// Destination `.safetensors` file.
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Inference backend: native or onnx.
    #[arg(long, env = "THERMAL_GAN_BACKEND", default_value = "native")]
    backend: Backend,

    /// Generator weights (.pt, .pth or .safetensors).
    #[arg(long, env = "THERMAL_GAN_WEIGHTS", default_value = DEFAULT_WEIGHTS_PATH)]
    weights: PathBuf,

    /// Exported ONNX graph for the onnx backend.
    #[arg(long, env = "THERMAL_GAN_ONNX", default_value = DEFAULT_ONNX_PATH)]
    onnx: PathBuf,

    /// Weight file layout: auto, bare or checkpoint.
    #[arg(long, env = "THERMAL_GAN_LAYOUT", default_value = "auto")]
    layout: WeightsLayout,

    /// Compute device: auto, cpu, cuda[:N] or metal[:N].
    #[arg(long, env = "THERMAL_GAN_DEVICE", default_value = "auto")]
    device: DeviceChoice,

    /// Base channel width the weights were trained with.
    #[arg(long, env = "THERMAL_GAN_BASE", default_value = "32", value_name = "INT")]
    base: usize,
}

impl ModelArgs {
    fn config(&self) -> Config {
        Config {
            backend: self.backend,
            weights_path: self.weights.clone(),
            onnx_path: self.onnx.clone(),
            weights_layout: self.layout,
            device: self.device,
            base_channels: self.base,
            ..Config::default()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("thermal_gan={log_level},tower_http={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(&cli) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Serve { host, port, model } => serve(host, *port, model),
        Command::Generate {
            input,
            output,
            quality,
            model,
        } => generate(input, output, *quality, model),
        Command::Export { output, model } => export(output, model),
    }
}

fn load_pipeline(config: Config) -> Result<Pipeline> {
    let model_path = config.model_path().to_path_buf();
    Pipeline::new(config).with_context(|| {
        format!(
            "Failed to load model; ensure the weight file is present at {}",
            model_path.display()
        )
    })
}

fn serve(host: &str, port: u16, model: &ModelArgs) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;

    // The model must be resident before the first request is accepted.
    let pipeline = Arc::new(load_pipeline(model.config())?);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime
        .block_on(server::serve(pipeline, addr))
        .context("Server failed")
}

fn generate(input: &Path, output: &Path, quality: u8, model: &ModelArgs) -> Result<()> {
    // Validate input file exists
    if !input.exists() {
        anyhow::bail!("Input file does not exist: {}", input.display());
    }

    let config = Config {
        output_quality: quality,
        ..model.config()
    };
    let pipeline = load_pipeline(config)?;

    pipeline
        .generate_file(input, output)
        .context("Failed to process image")?;

    println!(
        "Successfully processed {} -> {}",
        input.display(),
        output.display()
    );

    Ok(())
}

fn export(output: &Path, model: &ModelArgs) -> Result<()> {
    let spec = GeneratorSpec::new(GeneratorConfig {
        base: model.base,
        ..GeneratorConfig::default()
    });

    let count = loader::export_safetensors(&model.weights, model.layout, &spec, output)
        .with_context(|| format!("Failed to export {}", model.weights.display()))?;

    println!(
        "Exported {count} tensors from {} -> {}",
        model.weights.display(),
        output.display()
    );

    Ok(())
}
