//! ORT Predictor - Command Line Driver
//!
//! Usage: `predict-cli <config> <input.bin> [dim ...]`
//!
//! The input file holds little-endian `f32` values. Without explicit dims the
//! tensor is shaped `[batch_size, len / batch_size]`.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use ndarray::{ArrayD, IxDyn};
use ort_predictor::{Predictor, PredictorOptions, Tensor};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging, `RUST_LOG` filters and `LOG_FORMAT=json` switches to JSON lines
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };

    if let Err(e) = installed {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run one prediction on a raw tensor file
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Predictor options file (toml, yaml or json)
    config: PathBuf,
    /// Little-endian f32 input tensor
    input: PathBuf,
    /// Input shape, defaults to `[batch_size, len / batch_size]`
    dims: Vec<usize>,
}

fn read_input(path: &Path, batch_size: usize, dims: &[usize]) -> Result<Tensor> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ensure!(
        bytes.len() % 4 == 0,
        "input size {} is not a whole number of f32 values",
        bytes.len()
    );

    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    let shape = if dims.is_empty() {
        ensure!(
            batch_size > 0 && values.len() % batch_size == 0,
            "{} values do not split into batches of {}",
            values.len(),
            batch_size
        );
        vec![batch_size, values.len() / batch_size]
    } else {
        dims.to_vec()
    };

    let array = ArrayD::from_shape_vec(IxDyn(&shape), values)
        .with_context(|| format!("input does not fit shape {:?}", shape))?;
    Ok(Tensor::from(array))
}

fn main() -> Result<()> {
    init_logging();

    info!("=== ORT Predictor v{} ===", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let options = PredictorOptions::load(Some(&args.config))
        .with_context(|| format!("loading options from {}", args.config.display()))?;
    let input = read_input(&args.input, options.batch_size, &args.dims)?;

    let mut predictor = Predictor::new(options).context("creating predictor")?;
    predictor.predict(&[input]).context("running prediction")?;

    for (index, output) in predictor.read_prediction_output()?.iter().enumerate() {
        info!(
            "Output {}: {} {:?} ({} elements)",
            index,
            output.element_type().as_str(),
            output.shape(),
            output.len()
        );
    }

    predictor.close();
    Ok(())
}
