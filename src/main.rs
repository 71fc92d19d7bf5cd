//! CLI entry point for pissm-rs.

use std::path::PathBuf;

use candle_core::Device;
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pissm_rs::dataset::DataSplits;
use pissm_rs::{PissmConfig, PissmModel, Result, Trainer};

#[derive(Parser)]
#[command(name = "pissm")]
#[command(about = "Latent state-space models with a REINFORCE-trained transition cell")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Simulate train/validation/test trajectories
    Simulate {
        /// Path to configuration file
        config: String,
        /// Output safetensors file
        #[arg(long)]
        output: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Pre-simulated data (simulates from the config when omitted)
        #[arg(long)]
        data: Option<String>,
        /// Resume from checkpoint (continues at the saved epoch)
        #[arg(long)]
        resume: Option<String>,
    },
    /// Evaluate a checkpoint on the test split
    Test {
        /// Path to configuration file
        config: String,
        /// Checkpoint directory
        #[arg(long)]
        checkpoint: String,
        /// Pre-simulated data (simulates from the config when omitted)
        #[arg(long)]
        data: Option<String>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (nclt-odometry, toy-linear)
        #[arg(long, default_value = "nclt-odometry")]
        preset: String,
    },
}

fn select_device() -> Result<Device> {
    if cfg!(feature = "cuda") {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            tracing::warn!("CUDA not available; falling back to CPU");
        }
        Ok(device)
    } else {
        Ok(Device::Cpu)
    }
}

fn load_splits(config: &PissmConfig, data: Option<&str>, device: &Device) -> Result<DataSplits> {
    let splits = match data {
        Some(path) => {
            tracing::info!("Loading data from {}", path);
            DataSplits::load(path, &Device::Cpu)?
        }
        None => {
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
            DataSplits::simulate(config, &mut rng)?
        }
    };
    Ok(DataSplits {
        train: splits.train.to_device(device)?,
        validation: splits.validation.to_device(device)?,
        test: splits.test.to_device(device)?,
    })
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = PissmConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  System: m={}, n={}, horizon {}",
                config.system.state_dim, config.system.obs_dim, config.system.horizon
            );
            println!("  Cell: {}", config.model.cell_type()?);
            println!(
                "  Data: {} train / {} valid / {} test",
                config.data.train_size, config.data.valid_size, config.data.test_size
            );
        }
        Commands::Simulate { config, output } => {
            let config = PissmConfig::from_file(&config)?;
            config.validate()?;
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
            let splits = DataSplits::simulate(&config, &mut rng)?;
            splits.save(&output)?;
            println!("✓ Simulated data written to: {output}");
        }
        Commands::Train {
            config,
            data,
            resume,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let config = PissmConfig::from_file(&config)?;
            config.validate()?;

            let device = select_device()?;
            let splits = load_splits(&config, data.as_deref(), &device)?;
            let mut model = PissmModel::dense(&config.model, &device, config.seed)?;
            let mut trainer = Trainer::from_config(&config, &model)?;
            if let Some(checkpoint) = resume {
                trainer.load_checkpoint(&mut model, &checkpoint)?;
            }

            let history = trainer.train(&mut model, &splits.train, Some(&splits.validation))?;

            let output_dir = PathBuf::from(&config.output_dir);
            trainer.save_checkpoint(&model, output_dir.join("checkpoint-final"))?;
            let history_path = output_dir.join("loss_history.json");
            std::fs::write(&history_path, serde_json::to_string_pretty(&history)?)?;
            println!("✓ Training complete ({} steps)", trainer.step());
            println!("  Loss history: {}", history_path.display());
        }
        Commands::Test {
            config,
            checkpoint,
            data,
        } => {
            let config = PissmConfig::from_file(&config)?;
            config.validate()?;

            let device = select_device()?;
            let splits = load_splits(&config, data.as_deref(), &device)?;
            let mut model = PissmModel::dense(&config.model, &device, config.seed)?;
            model.load_weights(&checkpoint)?;

            let mut trainer = Trainer::from_config(&config, &model)?;
            let rmses = trainer.test(&mut model, &splits.test)?;
            let mean = if rmses.is_empty() {
                f64::NAN
            } else {
                rmses.iter().sum::<f64>() / rmses.len() as f64
            };
            println!("✓ Test RMSE: {mean:.4} over {} sequences", rmses.len());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = PissmConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
