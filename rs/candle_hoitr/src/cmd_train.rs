//! Train subcommand.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use serde::Serialize;
use vrdtools::RelationClasses;

use crate::checkpoint::{self, ManualLr, TrainState};
use crate::config::{
    BackboneKind, DatasetKind, HoiTrConfig, LossConfig, MatcherConfig, PositionEmbeddingKind,
    RunFlags,
};
use crate::criterion::SetCriterion;
use crate::data::{BatchSampler, DataLoader, Sampler, VrdDataset};
use crate::dist::{broadcast_parameters, ProcessGroup};
use crate::engine::{self, EngineContext};
use crate::matcher::HungarianMatcher;
use crate::metrics::ScalarWriter;
use crate::model::{param_groups, HoiTr};
use crate::optim::{AdamW, AdamWParams, LrScheduler, ParamGroup};
use crate::optimal_transport::OptimalTransport;

/// Model, data and run arguments shared by the train and test subcommands
#[derive(Args, Debug, Clone, Serialize)]
pub struct ModelArgs {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    pub cpu: bool,

    /// Dataset family, fixes the class counts of the heads.
    #[arg(long, value_enum)]
    pub dataset_file: DatasetKind,

    /// Dataset root with `annotations/` and `images/`.
    #[arg(long, default_value = "data/2.5vrd")]
    pub data_path: PathBuf,

    /// JSON file with the entity and relation names.
    #[arg(long)]
    pub classes: Option<PathBuf>,

    /// JSON file with the experimental run flags.
    #[arg(long)]
    pub flags: Option<PathBuf>,

    /// Name of the convolutional backbone to use.
    #[arg(long, value_enum, default_value_t = BackboneKind::Resnet50)]
    pub backbone: BackboneKind,

    /// Type of positional embedding to use on top of the image features.
    #[arg(long, value_enum, default_value_t = PositionEmbeddingKind::Sine)]
    pub position_embedding: PositionEmbeddingKind,

    #[arg(long, default_value_t = 1e-5)]
    pub lr_backbone: f64,

    /// Number of encoding layers in the transformer.
    #[arg(long, default_value_t = 6)]
    pub enc_layers: usize,

    /// Number of decoding layers in the transformer.
    #[arg(long, default_value_t = 6)]
    pub dec_layers: usize,

    #[arg(long, default_value_t = 6)]
    pub dec_layers_distance: usize,

    #[arg(long, default_value_t = 6)]
    pub dec_layers_occlusion: usize,

    /// Intermediate size of the feedforward layers in the transformer blocks.
    #[arg(long, default_value_t = 2048)]
    pub dim_feedforward: usize,

    /// Size of the embeddings (dimension of the transformer).
    #[arg(long, default_value_t = 256)]
    pub hidden_dim: usize,

    /// Dropout applied in the transformer.
    #[arg(long, default_value_t = 0.1)]
    pub dropout: f32,

    /// Number of attention heads inside the transformer's attentions.
    #[arg(long, default_value_t = 8)]
    pub nheads: usize,

    /// Number of query slots.
    #[arg(long, default_value_t = 100)]
    pub num_queries: usize,

    #[arg(long)]
    pub pre_norm: bool,

    /// Disables auxiliary decoding losses (loss at each layer).
    #[arg(long)]
    pub no_aux_loss: bool,

    /// Class coefficient in the matching cost.
    #[arg(long, default_value_t = 1.0)]
    pub set_cost_class: f32,

    /// L1 box coefficient in the matching cost.
    #[arg(long, default_value_t = 5.0)]
    pub set_cost_bbox: f32,

    /// GIoU box coefficient in the matching cost.
    #[arg(long, default_value_t = 2.0)]
    pub set_cost_giou: f32,

    #[arg(long, default_value_t = 1.0)]
    pub dice_loss_coef: f64,

    #[arg(long, default_value_t = 1.0)]
    pub relation_loss_coef: f64,

    #[arg(long, default_value_t = 5.0)]
    pub bbox_loss_coef: f64,

    #[arg(long, default_value_t = 2.0)]
    pub giou_loss_coef: f64,

    /// Relative classification weight of the no-object class.
    #[arg(long, default_value_t = 0.02)]
    pub eos_coef: f64,

    /// Shortest side of the validation and test images.
    #[arg(long, default_value_t = 800)]
    pub test_scale: usize,

    /// Path where to save checkpoints, logs and predictions.
    #[arg(long, default_value = "checkpoint")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 0)]
    pub num_workers: usize,

    /// Url used to set up distributed training.
    #[arg(long, default_value = "env://")]
    pub dist_url: String,
}

impl ModelArgs {
    pub fn run_flags(&self) -> anyhow::Result<RunFlags> {
        match &self.flags {
            Some(path) => RunFlags::load(path),
            None => Ok(RunFlags::default()),
        }
    }

    pub fn model_config(&self, flags: &RunFlags) -> HoiTrConfig {
        HoiTrConfig {
            hidden_dim: self.hidden_dim,
            nheads: self.nheads,
            enc_layers: self.enc_layers,
            dec_layers: self.dec_layers,
            dec_layers_distance: self.dec_layers_distance,
            dec_layers_occlusion: self.dec_layers_occlusion,
            dim_feedforward: self.dim_feedforward,
            dropout: self.dropout,
            num_queries: self.num_queries,
            pre_norm: self.pre_norm,
            aux_loss: !self.no_aux_loss,
            cascade: flags.cascade,
            backbone: self.backbone,
            position_embedding: self.position_embedding,
            lr_backbone: self.lr_backbone,
            ..HoiTrConfig::for_dataset(self.dataset_file)
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            set_cost_class: self.set_cost_class,
            set_cost_bbox: self.set_cost_bbox,
            set_cost_giou: self.set_cost_giou,
        }
    }

    pub fn loss_config(&self) -> LossConfig {
        LossConfig {
            dice_loss_coef: self.dice_loss_coef,
            relation_loss_coef: self.relation_loss_coef,
            bbox_loss_coef: self.bbox_loss_coef,
            giou_loss_coef: self.giou_loss_coef,
            eos_coef: self.eos_coef,
        }
    }

    pub fn relation_classes(&self, config: &HoiTrConfig) -> anyhow::Result<RelationClasses> {
        match &self.classes {
            Some(path) => Ok(RelationClasses::load(path)?),
            None => Ok(RelationClasses::numbered(config.num_entity_classes)),
        }
    }
}

/// Arguments for the train subcommand
#[derive(Args, Debug, Clone, Serialize)]
pub struct TrainArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 250)]
    pub epochs: usize,

    #[arg(long, default_value_t = 200)]
    pub lr_drop: usize,

    /// Gradient clipping max norm, 0 disables clipping.
    #[arg(long, default_value_t = 0.1)]
    pub clip_max_norm: f64,

    /// Resume from checkpoint.
    #[arg(long)]
    pub resume: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub start_epoch: usize,

    /// Learning rate of the main group after resuming.
    #[arg(long)]
    pub manual_lr_change: Option<f64>,

    /// Learning rate of the backbone group after resuming.
    #[arg(long)]
    pub manual_lr_backbone_change: Option<f64>,

    /// Scalar logs go to `<output-dir>/runs/<experiment-name>`.
    #[arg(long, default_value = "")]
    pub experiment_name: String,
}

/// Model with its losses, built on `device`
pub struct Components {
    pub config: HoiTrConfig,
    pub varmap: VarMap,
    pub model: HoiTr,
    pub criterion: SetCriterion,
    pub optimal_transport: OptimalTransport,
    pub classes: RelationClasses,
}

/// Build the model, the Hungarian criterion and the optimal transport loss
pub fn build_components(
    args: &ModelArgs,
    flags: &RunFlags,
    group: Arc<dyn ProcessGroup>,
    device: &Device,
) -> anyhow::Result<Components> {
    let config = args.model_config(flags);
    if flags.cascade {
        tracing::info!(
            dec_layers = config.dec_layers,
            dec_layers_distance = config.dec_layers_distance,
            dec_layers_occlusion = config.dec_layers_occlusion,
            "cascade decoders"
        );
    }
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = HoiTr::load(vb, &config)?;
    let criterion = SetCriterion::new(
        &config,
        HungarianMatcher::new(args.matcher_config()),
        &args.loss_config(),
        group.clone(),
    );
    let optimal_transport =
        OptimalTransport::new(&config, args.matcher_config(), &args.loss_config(), flags, group);
    let classes = args.relation_classes(&config)?;
    Ok(Components {
        config,
        varmap,
        model,
        criterion,
        optimal_transport,
        classes,
    })
}

/// Initialize from the DETR COCO weights under `data/detr_coco` when the
/// layout matches
pub fn init_from_detr(components: &Components) -> anyhow::Result<()> {
    if !components.config.matches_detr_layout() {
        return Ok(());
    }
    match components.config.backbone.detr_weights() {
        Some(name) => {
            let path = Path::new("data").join("detr_coco").join(name);
            checkpoint::load_pretrained(&components.varmap, &path)?;
        }
        None => tracing::warn!(
            backbone = ?components.config.backbone,
            "no pretrained DETR weights for this backbone"
        ),
    }
    Ok(())
}

/// AdamW over the trainable variables: group 0 at `lr`, group 1 (backbone)
/// at `lr_backbone`. Returns the optimizer and the trainable parameter count.
pub fn build_optimizer(
    varmap: &VarMap,
    config: &HoiTrConfig,
    lr: f64,
    weight_decay: f64,
) -> anyhow::Result<(AdamW, usize)> {
    let groups = param_groups(varmap, config.lr_backbone > 0.0);
    let n_parameters = groups.num_parameters();
    let optimizer = AdamW::new(
        vec![
            ParamGroup {
                lr,
                vars: groups.main,
            },
            ParamGroup {
                lr: config.lr_backbone,
                vars: groups.backbone,
            },
        ],
        AdamWParams {
            weight_decay,
            ..AdamWParams::default()
        },
    )?;
    Ok((optimizer, n_parameters))
}

/// Sampler over `len` samples: sharded across ranks when distributed
fn sampler(len: usize, group: &dyn ProcessGroup, sequential: bool, seed: u64) -> Sampler {
    if group.world_size() > 1 {
        Sampler::distributed(len, group.rank(), group.world_size(), seed)
    } else if sequential {
        Sampler::sequential(len)
    } else {
        Sampler::random(len, seed)
    }
}

/// Loader over split `image_set`
#[allow(clippy::too_many_arguments)]
pub fn build_loader(
    args: &ModelArgs,
    config: &HoiTrConfig,
    image_set: &str,
    group: &dyn ProcessGroup,
    batch_size: usize,
    num_workers: usize,
    sequential: bool,
    seed: u64,
) -> anyhow::Result<DataLoader> {
    let dataset = Arc::new(VrdDataset::build(
        image_set,
        &args.data_path,
        args.test_scale,
        config,
    )?);
    let drop_last = image_set == "train" && !sequential;
    let sampler = sampler(dataset.len(), group, sequential, seed);
    let batch_sampler = BatchSampler::new(sampler, batch_size, drop_last);
    DataLoader::new(dataset, batch_sampler, num_workers, seed)
}

pub fn run(args: TrainArgs, group: Arc<dyn ProcessGroup>) -> anyhow::Result<()> {
    let mut args = args;
    tracing::info!(?args, "train");
    let device = crate::device(args.model.cpu)?;
    let flags = args.model.run_flags()?;
    if group.is_main_process() {
        flags.print();
        println!("eos_coef: {}", args.model.eos_coef);
    }
    if flags.train_on_one_image {
        args.batch_size = 1;
    }

    let seed = args.model.seed + group.rank() as u64;
    if !device.is_cpu() {
        device.set_seed(seed)?;
    }

    let components = build_components(&args.model, &flags, group.clone(), &device)?;
    let (mut optimizer, n_parameters) =
        build_optimizer(&components.varmap, &components.config, args.lr, args.weight_decay)?;
    println!("number of params: {n_parameters}");
    let mut lr_scheduler = if flags.cyclic_scheduler {
        LrScheduler::cyclic(
            flags.cyclic_base_lr,
            flags.cyclic_max_lr,
            flags.cyclic_step_size_up,
            flags.cyclic_step_size_down,
            &mut optimizer,
        )
    } else {
        LrScheduler::step_lr(args.lr_drop, 0.1)
    };

    let mut train_loader = build_loader(
        &args.model,
        &components.config,
        "train",
        group.as_ref(),
        args.batch_size,
        args.model.num_workers,
        flags.use_sequential_loader,
        seed,
    )?;
    let mut valid_loader = build_loader(
        &args.model,
        &components.config,
        "valid",
        group.as_ref(),
        flags.batch_size_validation,
        flags.num_workers_validation,
        false,
        seed,
    )?;

    init_from_detr(&components)?;
    if let Some(path) = &args.resume {
        let manual = ManualLr {
            lr: args.manual_lr_change,
            lr_backbone: args.manual_lr_backbone_change,
        };
        if let Some(start_epoch) = checkpoint::resume(
            path,
            &components.varmap,
            &mut optimizer,
            &mut lr_scheduler,
            manual,
        )? {
            args.start_epoch = start_epoch;
        }
    }
    broadcast_parameters(group.as_ref(), &optimizer.vars())?;

    let output_dir = args.model.output_dir.clone();
    let mut writer = ScalarWriter::create(
        &output_dir.join("runs").join(&args.experiment_name),
        group.is_main_process(),
    )?;
    let ctx = EngineContext {
        model: &components.model,
        criterion: &components.criterion,
        optimal_transport: &components.optimal_transport,
        group: group.as_ref(),
        flags: &flags,
        classes: &components.classes,
        device: &device,
    };
    let args_json = serde_json::to_value(&args)?;

    tracing::info!("Start training");
    let start_time = Instant::now();
    for epoch in args.start_epoch..args.epochs {
        train_loader.set_epoch(epoch);
        if epoch == 0 && flags.validate_before_training {
            tracing::info!("Validate before training");
            engine::validate(&ctx, &mut writer, "valid", &mut valid_loader, -1)?;
        }

        let train_stats = engine::train_one_epoch(
            &ctx,
            &mut writer,
            &mut train_loader,
            &mut optimizer,
            epoch,
            args.clip_max_norm,
        )?;
        lr_scheduler.step(&mut optimizer);

        engine::validate(&ctx, &mut writer, "valid", &mut valid_loader, epoch as i64)?;

        let state = TrainState {
            varmap: &components.varmap,
            optimizer: &optimizer,
            lr_scheduler: &lr_scheduler,
            epoch,
            args: args_json.clone(),
        };
        for name in checkpoint::checkpoint_names(epoch, args.lr_drop) {
            checkpoint::save_on_master(group.as_ref(), &output_dir, &name, &state)?;
        }

        if group.is_main_process() {
            let mut log_stats = serde_json::Map::new();
            for (k, v) in &train_stats {
                log_stats.insert(format!("train_{k}"), serde_json::json!(v));
            }
            log_stats.insert("epoch".into(), serde_json::json!(epoch));
            log_stats.insert("n_parameters".into(), serde_json::json!(n_parameters));
            std::fs::create_dir_all(&output_dir)?;
            let mut log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(output_dir.join("log.txt"))?;
            writeln!(log, "{}", serde_json::Value::Object(log_stats))?;
        }
    }

    let total = start_time.elapsed().as_secs();
    println!(
        "Training time {}:{:02}:{:02}",
        total / 3600,
        (total / 60) % 60,
        total % 60
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        train: TrainArgs,
    }

    #[test]
    fn test_defaults_follow_detr() {
        let cli = Cli::parse_from(["hoitr", "--dataset-file", "two-point-five-vrd"]);
        let args = cli.train;
        assert_eq!(args.lr_drop, 200);
        assert_eq!(args.batch_size, 2);
        assert_eq!(args.model.backbone, BackboneKind::Resnet50);

        let config = args.model.model_config(&RunFlags::default());
        assert!(config.aux_loss);
        assert!(!config.cascade);
        assert!(config.matches_detr_layout());
        assert_eq!(config.num_distance_classes, 3);
        assert_eq!(args.model.loss_config().eos_coef, 0.02);
    }

    #[test]
    fn test_flags_drive_cascade_and_aux() {
        let cli = Cli::parse_from([
            "hoitr",
            "--dataset-file",
            "hoia",
            "--no-aux-loss",
            "--backbone",
            "resnet18",
            "--manual-lr-change",
            "0.001",
        ]);
        let flags = RunFlags {
            cascade: true,
            ..RunFlags::default()
        };
        let config = cli.train.model.model_config(&flags);
        assert!(!config.aux_loss);
        assert!(config.cascade);
        assert_eq!(config.num_entity_classes, 12);
        assert_eq!(cli.train.manual_lr_change, Some(0.001));
        let classes = cli.train.model.relation_classes(&config).unwrap();
        assert_eq!(classes.entity_name(11), "entity_11");
    }

    #[test]
    fn test_args_serialize_for_checkpoints() {
        let cli = Cli::parse_from(["hoitr", "--dataset-file", "hico", "--epochs", "3"]);
        let value = serde_json::to_value(&cli.train).unwrap();
        assert_eq!(value["epochs"], 3);
        assert_eq!(value["model"]["dataset_file"], "hico");
    }

    #[test]
    fn test_build_optimizer_groups() {
        let cli = Cli::parse_from([
            "hoitr",
            "--dataset-file",
            "hoia",
            "--backbone",
            "resnet18",
            "--hidden-dim",
            "16",
            "--nheads",
            "2",
            "--enc-layers",
            "1",
            "--dec-layers",
            "1",
            "--dim-feedforward",
            "32",
            "--num-queries",
            "3",
            "--position-embedding",
            "learned",
        ]);
        let flags = RunFlags::default();
        let components = build_components(
            &cli.train.model,
            &flags,
            Arc::new(crate::dist::SingleProcess),
            &Device::Cpu,
        )
        .unwrap();
        let (optimizer, n) =
            build_optimizer(&components.varmap, &components.config, 1e-4, 1e-4).unwrap();
        assert_eq!(optimizer.learning_rates(), vec![1e-4, 1e-5]);
        assert!(n > 0);
        // No DETR weights for resnet18, nothing to load
        init_from_detr(&components).unwrap();
    }
}
