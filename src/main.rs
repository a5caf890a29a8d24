//! Runs one posterior-sampling experiment and prints its evaluation as JSON.

use std::error::Error;
use std::fs;
use std::path::PathBuf;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mini_bnn::config::RunConfig;
use mini_bnn::data::ToyDatasets;
use mini_bnn::experiment::Experiment;

type Backend = Autodiff<NdArray>;

#[derive(Parser)]
#[command(name = "mini-bnn")]
#[command(about = "Sample from the posterior of a Bayesian neural network")]
#[command(version)]
struct Cli {
    /// YAML run configuration; defaults are used for missing keys
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override a config key, e.g. `--set inference=VerletSGLD` (repeatable)
    #[arg(long = "set")]
    set: Vec<String>,

    /// Run identifier, also the name of the output directory
    #[arg(long)]
    run_id: Option<String>,

    /// Disable the progress bar
    #[arg(long)]
    no_progressbar: bool,

    /// Log verbosity level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let text = cli.config.as_ref().map(fs::read_to_string).transpose()?;
    let mut config = RunConfig::from_yaml(text.as_deref(), &cli.set)?;
    if let Some(run_id) = cli.run_id {
        config.run_id = Some(run_id);
    }
    if cli.no_progressbar {
        config.progressbar = false;
    }

    let provider = ToyDatasets::default();
    let report = Experiment::<Backend>::new(config, &provider, NdArrayDevice::Cpu).run()?;
    println!("{}", serde_json::to_string_pretty(&report.evaluation)?);
    Ok(())
}
