//! CLI entry point for wavernn-train.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use wavernn_train::checkpoint::CheckpointId;
use wavernn_train::config::TrainConfig;
use wavernn_train::data::get_vocoder_datasets;
use wavernn_train::device::{resolve_device, ForwardPlan};
use wavernn_train::error::{TrainError, TrainResult};
use wavernn_train::logging::init_console_logging;
use wavernn_train::paths::Paths;
use wavernn_train::train::Trainer;

/// Step target used by --force-train to push a run past its configured end.
const FORCE_TRAIN_STEPS: usize = 10_000_000;

#[derive(Parser)]
#[command(name = "wavernn-train", about = "Train a WaveRNN vocoder")]
struct Cli {
    /// Override the configured learning rate
    #[arg(long, short = 'l')]
    lr: Option<f64>,

    /// Override the configured batch size
    #[arg(long, short = 'b')]
    batch_size: Option<usize>,

    /// Keep training past the configured total step count
    #[arg(long, short = 'f')]
    force_train: bool,

    /// Train on ground-truth-aligned features
    #[arg(long, short = 'g')]
    gta: bool,

    /// Force CPU-only training, even in a CUDA-capable environment
    #[arg(long, short = 'c')]
    force_cpu: bool,

    /// JSON hyperparameter file (default: built-in preset)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in preset when no config file is given
    #[arg(long, default_value = "ljspeech")]
    preset: String,

    /// Preprocessed dataset directory
    #[arg(long, default_value = "data")]
    data_path: PathBuf,

    /// Run directory for checkpoints, generated audio and logs
    #[arg(long, default_value = "checkpoints/wavernn")]
    model_dir: PathBuf,

    /// Shard each batch across this many parallel devices
    #[arg(long, default_value = "1")]
    data_parallel: usize,
}

fn resolve_config(cli: &Cli) -> TrainResult<TrainConfig> {
    let mut config = match &cli.config {
        Some(path) => TrainConfig::from_file(path)?,
        None => match cli.preset.as_str() {
            "ljspeech" => TrainConfig::ljspeech(),
            "mol" => TrainConfig::mol(),
            "test" => TrainConfig::test(),
            other => {
                return Err(TrainError::Config(format!(
                    "unknown preset: {other}. Use 'ljspeech', 'mol' or 'test'."
                )))
            }
        },
    };

    if let Some(lr) = cli.lr {
        config.lr = lr;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }

    config
        .validate()
        .map_err(|errors| TrainError::Config(errors.join("; ")))?;
    Ok(config)
}

fn run(cli: Cli) -> TrainResult<()> {
    let config = resolve_config(&cli)?;
    let paths = Paths::new(&cli.model_dir);

    let device = resolve_device(cli.force_cpu)?;
    // Fails fast on a batch size the shard count cannot divide.
    let plan = ForwardPlan::new(device.clone(), cli.data_parallel, config.batch_size)?;
    info!(?device, devices = plan.device_count(), "using device");

    info!("initialising model");
    let mut trainer = Trainer::new(config.clone(), paths, plan)?;
    trainer.restore(&CheckpointId::Latest, true)?;

    let (train_set, test_set) = get_vocoder_datasets(&cli.data_path, &config, cli.gta)?;

    let total_steps = if cli.force_train {
        FORCE_TRAIN_STEPS
    } else {
        config.total_steps
    };

    info!(
        remaining_steps = format!(
            "{}k",
            total_steps.saturating_sub(trainer.global_step) / 1000
        )
        .as_str(),
        batch_size = config.batch_size,
        lr = config.lr,
        seq_len = config.seq_len,
        gta = cli.gta,
        "starting training"
    );

    trainer.train_loop(&train_set, &test_set, total_steps)?;

    info!("training complete; raise total_steps in the config or pass --force-train to continue");
    Ok(())
}

fn main() {
    init_console_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
