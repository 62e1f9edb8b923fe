//! HOI Transformer for 2.5D visual relationships with Candle
//!
//! This binary trains the model, writes evaluation outputs of a checkpoint and
//! scores prediction tables against ground truth.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod box_ops;
mod checkpoint;
mod cmd_evaluate;
mod cmd_test;
mod cmd_train;
mod config;
mod criterion;
mod data;
mod dist;
mod engine;
mod matcher;
mod metrics;
mod model;
mod optim;
mod optimal_transport;
mod postprocess;
mod relation;

use std::sync::Arc;

use candle_core::{Device, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::dist::ProcessGroup;

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on the train split, validating every epoch.
    Train(cmd_train::TrainArgs),
    /// Write evaluation outputs of a checkpoint for the valid and test splits.
    Test(cmd_test::TestArgs),
    /// Relation recall of a predictions CSV.
    Evaluate(cmd_evaluate::EvaluateArgs),
}

impl Command {
    /// Only training runs distributed; `test` writes every prediction from
    /// one process.
    fn dist_url(&self) -> Option<&str> {
        match self {
            Command::Train(args) => Some(&args.model.dist_url),
            Command::Test(_) | Command::Evaluate(_) => None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    command: Command,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let group: Arc<dyn ProcessGroup> = match args.command.dist_url() {
        Some(url) => dist::init_distributed_mode(url)?,
        None => Arc::new(dist::SingleProcess),
    };
    let default_level = if group.is_main_process() { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
    tracing::info!(rank = group.rank(), world_size = group.world_size(), "process group ready");

    match args.command {
        Command::Train(train) => cmd_train::run(train, group),
        Command::Test(test) => cmd_test::run(test, group),
        Command::Evaluate(evaluate) => cmd_evaluate::run(&evaluate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_train_joins_process_group() {
        let args = Args::parse_from([
            "hoitr",
            "train",
            "--dataset-file",
            "two-point-five-vrd",
            "--dist-url",
            "tcp://127.0.0.1:29500",
        ]);
        assert_eq!(args.command.dist_url(), Some("tcp://127.0.0.1:29500"));

        let args = Args::parse_from([
            "hoitr",
            "test",
            "--dataset-file",
            "two-point-five-vrd",
            "--dist-url",
            "tcp://127.0.0.1:29500",
            "--resume",
            "checkpoint0099.safetensors",
        ]);
        assert_eq!(args.command.dist_url(), None);

        let args = Args::parse_from([
            "hoitr",
            "evaluate",
            "--predictions",
            "predictions_valid_0.csv",
            "--annotations",
            "valid.json",
        ]);
        assert_eq!(args.command.dist_url(), None);
    }
}
