//! Test subcommand: evaluation outputs of a trained checkpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Args;

use crate::checkpoint;
use crate::cmd_train::{build_components, build_loader, init_from_detr, ModelArgs};
use crate::dist::ProcessGroup;
use crate::engine::{self, EngineContext};

/// Arguments for the test subcommand
#[derive(Args, Debug, Clone)]
pub struct TestArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Checkpoint to evaluate.
    #[arg(long)]
    pub resume: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
}

pub fn run(args: TestArgs, group: Arc<dyn ProcessGroup>) -> anyhow::Result<()> {
    tracing::info!(?args, "test");
    let device = crate::device(args.model.cpu)?;
    let flags = args.model.run_flags()?;
    let components = build_components(&args.model, &flags, group.clone(), &device)?;

    let mut loaders = Vec::new();
    for image_set in ["valid", "test"] {
        let loader = build_loader(
            &args.model,
            &components.config,
            image_set,
            group.as_ref(),
            args.batch_size,
            args.model.num_workers,
            true,
            args.model.seed,
        )?;
        loaders.push((image_set, loader));
    }

    init_from_detr(&components)?;
    let meta = checkpoint::load_model(&args.resume, &components.varmap)?;
    let epoch = meta.map_or(0, |m| m.epoch + 1);

    let ctx = EngineContext {
        model: &components.model,
        criterion: &components.criterion,
        optimal_transport: &components.optimal_transport,
        group: group.as_ref(),
        flags: &flags,
        classes: &components.classes,
        device: &device,
    };

    tracing::info!("Start Testing");
    let start_time = Instant::now();
    for (image_set, loader) in loaders.iter_mut() {
        engine::generate_evaluation_outputs(&ctx, image_set, loader, epoch, &args.model.output_dir)?;
    }
    let total = start_time.elapsed().as_secs();
    println!(
        "Test time {}:{:02}:{:02}",
        total / 3600,
        (total / 60) % 60,
        total % 60
    );
    Ok(())
}
