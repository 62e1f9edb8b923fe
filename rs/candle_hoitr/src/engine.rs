//! Training, validation and evaluation-output passes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use vrdtools::{PredictionTable, RelationClasses};

use crate::config::RunFlags;
use crate::criterion::{loss_values, weighted_total, LossDict, SetCriterion};
use crate::data::{loader::Batch, targets_to_device, DataLoader, Target};
use crate::dist::{average_gradients, reduce_dict, ProcessGroup};
use crate::metrics::{MeterFormat, MetricLogger, ScalarWriter, SmoothedValue};
use crate::model::{HoiOutputs, HoiTr};
use crate::optim::{clip_grad_norm, AdamW};
use crate::optimal_transport::OptimalTransport;
use crate::postprocess::{construct_evaluation_output, generate_hoi_list};

/// Everything a pass needs besides the data and the optimizer
pub struct EngineContext<'a> {
    pub model: &'a HoiTr,
    pub criterion: &'a SetCriterion,
    pub optimal_transport: &'a OptimalTransport,
    pub group: &'a dyn ProcessGroup,
    pub flags: &'a RunFlags,
    pub classes: &'a RelationClasses,
    pub device: &'a Device,
}

const BAR_SIZE: usize = 60;

/// One progress bar line, without the carriage return
pub fn render_progress_bar(i: usize, max: usize, text: &str) -> String {
    let j = if max == 0 { 1.0 } else { i as f64 / max as f64 };
    let filled = "=".repeat((BAR_SIZE as f64 * j) as usize);
    format!(
        "[{:<width$}] {}%  {}",
        filled,
        (100.0 * j) as usize,
        text,
        width = BAR_SIZE
    )
}

/// Redraw the progress bar on stderr
pub fn progress_bar(flags: &RunFlags, i: usize, max: usize, text: &str) {
    if flags.train_on_one_image {
        return;
    }
    let mut err = std::io::stderr().lock();
    let _ = write!(err, "\r{}", render_progress_bar(i, max, text));
    let _ = err.flush();
}

/// Reduced loss dict split into weighted and raw terms
struct ReducedLosses {
    scaled: BTreeMap<String, f32>,
    unscaled: BTreeMap<String, f32>,
    class_errors: Option<(f32, f32)>,
}

impl ReducedLosses {
    fn new(
        group: &dyn ProcessGroup,
        losses: &LossDict,
        weight_dict: &BTreeMap<String, f64>,
    ) -> anyhow::Result<Self> {
        let reduced = reduce_dict(group, &loss_values(losses)?, true)?;
        let scaled = reduced
            .iter()
            .filter_map(|(k, v)| weight_dict.get(k).map(|w| (k.clone(), v * *w as f32)))
            .collect();
        let unscaled = reduced
            .iter()
            .map(|(k, v)| (format!("{k}_unscaled"), *v))
            .collect();
        let class_errors = match (
            reduced.get("class_error_action"),
            reduced.get("class_error_occlusion"),
        ) {
            (Some(a), Some(o)) => Some((*a, *o)),
            _ => None,
        };
        Ok(Self {
            scaled,
            unscaled,
            class_errors,
        })
    }

    fn total(&self) -> f32 {
        self.scaled.values().sum()
    }

    fn scaled(&self, key: &str) -> f32 {
        self.scaled.get(key).copied().unwrap_or(0.0)
    }
}

fn scalar(t: &Tensor) -> candle_core::Result<f32> {
    t.to_dtype(DType::F32)?.to_scalar::<f32>()
}

/// Backward, average across ranks, clip and step
fn optimize(
    ctx: &EngineContext,
    optimizer: &mut AdamW,
    loss: &Tensor,
    max_norm: f64,
) -> anyhow::Result<()> {
    let vars = optimizer.vars();
    let mut grads = loss.backward()?;
    average_gradients(ctx.group, &mut grads, &vars)?;
    if max_norm > 0.0 {
        clip_grad_norm(&mut grads, &vars, max_norm)?;
    }
    optimizer.step(&grads)?;
    Ok(())
}

fn print_targets(targets: &[Target], classes: &RelationClasses) {
    let Some(t) = targets.first() else {
        return;
    };
    let names = |labels: &[u32]| -> Vec<String> {
        labels.iter().map(|l| classes.entity_name(*l as usize)).collect()
    };
    println!("targets:");
    println!("Object A: {:?}", names(&t.sub_labels));
    println!(
        "relation: {:?}",
        t.distance_labels
            .iter()
            .map(|l| classes.distance_name(*l as usize))
            .collect::<Vec<_>>()
    );
    println!("Object B: {:?}", names(&t.obj_labels));
}

fn print_top_relations(
    ctx: &EngineContext,
    outputs: &HoiOutputs,
    targets: &[Target],
) -> anyhow::Result<()> {
    let hoi_list = generate_hoi_list(outputs, targets, ctx.flags.top_k)?;
    match hoi_list.first() {
        Some(relations) if !relations.is_empty() => {
            for relation in relations.iter().take(ctx.flags.top_k_predictions_to_print) {
                println!("{}", relation.describe(ctx.classes));
            }
        }
        _ => println!("empty hoi_list"),
    }
    println!();
    Ok(())
}

/// Back-propagate the Sinkhorn transport cost directly
fn train_sinkhorn_cost(
    ctx: &EngineContext,
    writer: &mut ScalarWriter,
    loader: &mut DataLoader,
    optimizer: &mut AdamW,
    epoch: usize,
    max_norm: f64,
) -> anyhow::Result<BTreeMap<String, f64>> {
    let len = loader.len();
    tracing::info!(epoch, "training on the transport cost");
    let mut epoch_loss = 0f64;
    let mut count = 0usize;
    for batch in loader.iter() {
        let (images, targets) = batch?;
        let images = images.to_device(ctx.device)?;
        let device_targets = targets_to_device(&targets, ctx.device)?;

        let outputs = ctx.model.forward(&images, true)?;
        let cost = ctx.optimal_transport.forward_cost(&outputs, &device_targets)?;
        let mut value = [scalar(&cost)?];
        ctx.group.reduce_sum_to_main(&mut value)?;

        optimize(ctx, optimizer, &cost, max_norm)?;

        epoch_loss += value[0] as f64;
        writer.add_scalar("Loss/train", value[0] as f64, (count + epoch * len) as i64)?;
        count += 1;
        if ctx.group.is_main_process() {
            progress_bar(ctx.flags, count, len, "Training");
        }
    }
    eprintln!();

    let mut stats = BTreeMap::new();
    stats.insert("loss".to_string(), epoch_loss / count.max(1) as f64);
    Ok(stats)
}

/// Train for one epoch and return the global average of every meter
pub fn train_one_epoch(
    ctx: &EngineContext,
    writer: &mut ScalarWriter,
    loader: &mut DataLoader,
    optimizer: &mut AdamW,
    epoch: usize,
    max_norm: f64,
) -> anyhow::Result<BTreeMap<String, f64>> {
    let use_optimal_transport = ctx.flags.use_optimal_transport;
    if use_optimal_transport && ctx.flags.backprop_sinkhorn_cost {
        return train_sinkhorn_cost(ctx, writer, loader, optimizer, epoch, max_norm);
    }

    let len = loader.len();
    let fixed: Option<Batch> = if ctx.flags.train_on_one_image {
        let index = ctx.flags.train_on_one_image_index;
        let batch = loader
            .iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("no batch at index {index} to train on"))??;
        if let Some(t) = batch.1.first() {
            println!("{}", t.image_id);
        }
        Some(batch)
    } else {
        None
    };
    let batches: Box<dyn Iterator<Item = anyhow::Result<Batch>> + '_> = match fixed {
        Some(batch) => Box::new((0..len).map(move |_| Ok(batch.clone()))),
        None => Box::new(loader.iter()),
    };
    let weight_dict = if use_optimal_transport {
        &ctx.optimal_transport.weight_dict
    } else {
        &ctx.criterion.weight_dict
    };

    let mut logger = MetricLogger::new("  ", 10);
    logger.add_meter("lr", SmoothedValue::new(1, MeterFormat::Value(10)));
    logger.add_meter("class_error_action", SmoothedValue::new(1, MeterFormat::Value(2)));
    logger.add_meter("class_error_occlusion", SmoothedValue::new(1, MeterFormat::Value(2)));
    let header = format!("Epoch: [{epoch}]");
    logger.start();

    for (i, batch) in batches.enumerate() {
        let (images, targets) = batch?;
        logger.data_loaded();
        if ctx.flags.train_on_one_image && ctx.flags.debug_outputs {
            println!();
            print_targets(&targets, ctx.classes);
        }

        let images = images.to_device(ctx.device)?;
        let device_targets = targets_to_device(&targets, ctx.device)?;
        let outputs = ctx.model.forward(&images, true)?;

        let losses = if use_optimal_transport {
            ctx.optimal_transport.forward(&outputs, &device_targets)?
        } else {
            ctx.criterion.forward(&outputs, &device_targets)?
        };
        let total = weighted_total(&losses, weight_dict)?;

        let reduced = ReducedLosses::new(ctx.group, &losses, weight_dict)?;
        let loss_value = reduced.total();
        if !loss_value.is_finite() {
            tracing::error!(loss = loss_value, "Loss is {}, stopping training", loss_value);
            tracing::error!(scaled = ?reduced.scaled, "reduced losses");
            anyhow::bail!("loss is {loss_value} at epoch {epoch} iteration {i}");
        }

        optimize(ctx, optimizer, &total, max_norm)?;

        logger.update([("loss", loss_value as f64)]);
        logger.update(reduced.scaled.iter().map(|(k, v)| (k.as_str(), *v as f64)));
        logger.update(reduced.unscaled.iter().map(|(k, v)| (k.as_str(), *v as f64)));
        let (action, occlusion) = reduced.class_errors.unwrap_or((-1.0, -1.0));
        logger.update([
            ("class_error_action", action as f64),
            ("class_error_occlusion", occlusion as f64),
            ("lr", optimizer.learning_rate(0)),
        ]);

        if ctx.flags.train_on_one_image && ctx.flags.debug_outputs {
            print_top_relations(ctx, &outputs, &targets)?;
        }
        logger.log_every(i, len, &header);
    }
    logger.finish(len, &header);

    logger.synchronize_between_processes(ctx.group)?;
    tracing::info!("Averaged stats: {}", logger);
    let stats = logger.global_averages();

    let step = epoch as i64;
    let stat = |name: &str| stats.get(name).copied().unwrap_or(0.0);
    writer.add_scalar("Loss/train", stat("loss"), step)?;
    writer.add_scalar("loss_ce/train", stat("loss_ce"), step)?;
    writer.add_scalar("loss_bbox/train", stat("loss_bbox"), step)?;
    writer.add_scalar("loss_giou/train", stat("loss_giou"), step)?;
    writer.add_scalar("lr", stat("lr"), step)?;
    writer.add_scalar("Class Error/train/distance", stat("class_error_action"), step)?;
    writer.add_scalar("Class Error/train/occlusion", stat("class_error_occlusion"), step)?;
    writer.flush()?;
    Ok(stats)
}

/// Averaged validation losses
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidationLosses {
    pub loss: f64,
    pub loss_ce: f64,
    pub loss_bbox: f64,
    pub loss_giou: f64,
}

/// Hungarian losses on `valid_or_test`, written at step `epoch` (-1 before
/// training)
pub fn validate(
    ctx: &EngineContext,
    writer: &mut ScalarWriter,
    valid_or_test: &str,
    loader: &mut DataLoader,
    epoch: i64,
) -> anyhow::Result<ValidationLosses> {
    let len = loader.len();
    let mut sums = ValidationLosses::default();
    let mut count = 0usize;
    let text = format!("{valid_or_test} progress    ");
    for batch in loader.iter() {
        let (images, targets) = batch?;
        let images = images.to_device(ctx.device)?;
        let device_targets = targets_to_device(&targets, ctx.device)?;
        let outputs = ctx.model.forward(&images, false)?.detach();

        let losses = ctx.criterion.forward(&outputs, &device_targets)?;
        let reduced = ReducedLosses::new(ctx.group, &losses, &ctx.criterion.weight_dict)?;
        sums.loss += reduced.total() as f64;
        sums.loss_ce += reduced.scaled("loss_ce") as f64;
        sums.loss_bbox += reduced.scaled("loss_bbox") as f64;
        sums.loss_giou += reduced.scaled("loss_giou") as f64;

        count += 1;
        if ctx.group.is_main_process() {
            progress_bar(ctx.flags, count, len, &text);
        }
    }
    eprintln!();
    if count == 0 {
        tracing::warn!(valid_or_test, "no batches to validate on");
        return Ok(sums);
    }

    let n = count as f64;
    let avg = ValidationLosses {
        loss: sums.loss / n,
        loss_ce: sums.loss_ce / n,
        loss_bbox: sums.loss_bbox / n,
        loss_giou: sums.loss_giou / n,
    };
    writer.add_scalar(&format!("Loss/{valid_or_test}"), avg.loss, epoch)?;
    writer.add_scalar(&format!("loss_ce/{valid_or_test}"), avg.loss_ce, epoch)?;
    writer.add_scalar(&format!("loss_bbox/{valid_or_test}"), avg.loss_bbox, epoch)?;
    writer.add_scalar(&format!("loss_giou/{valid_or_test}"), avg.loss_giou, epoch)?;
    writer.flush()?;
    tracing::info!(
        valid_or_test,
        epoch,
        loss = avg.loss,
        loss_ce = avg.loss_ce,
        loss_bbox = avg.loss_bbox,
        loss_giou = avg.loss_giou,
        "validation"
    );
    Ok(avg)
}

/// File name of the evaluation output for `epoch`
pub fn predictions_file_name(valid_or_test: &str, epoch: usize) -> String {
    format!("predictions_{}_{}.csv", valid_or_test, epoch as i64 - 1)
}

/// Write the ranked relations of every image of `valid_or_test` to
/// `predictions_{valid_or_test}_{epoch - 1}.csv` in `output_dir`
pub fn generate_evaluation_outputs(
    ctx: &EngineContext,
    valid_or_test: &str,
    loader: &mut DataLoader,
    epoch: usize,
    output_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let len = loader.len();
    let text = format!("{valid_or_test} progress    ");
    let mut table = PredictionTable::new();
    for (i, batch) in loader.iter().enumerate() {
        let (images, targets) = batch?;
        let images = images.to_device(ctx.device)?;
        let outputs = ctx.model.forward(&images, false)?;
        let hoi_list = generate_hoi_list(&outputs, &targets, ctx.flags.top_k)?;
        construct_evaluation_output(&hoi_list, &targets, ctx.classes, &mut table);
        progress_bar(ctx.flags, i + 1, len, &text);
    }
    eprintln!();

    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join(predictions_file_name(valid_or_test, epoch));
    table.write_csv(&path)?;
    tracing::info!(path = %path.display(), rows = table.len(), "wrote evaluation outputs");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackboneKind, DatasetKind, HoiTrConfig, LossConfig, MatcherConfig, PositionEmbeddingKind,
    };
    use crate::data::{transforms::Transforms, BatchSampler, Sampler, VrdDataset};
    use crate::dist::SingleProcess;
    use crate::matcher::HungarianMatcher;
    use crate::model::param_groups;
    use crate::optim::{AdamWParams, ParamGroup};
    use candle_nn::{VarBuilder, VarMap};
    use std::sync::Arc;
    use vrdtools::{EntityAnnotation, ImageAnnotation, RelationAnnotation};

    fn config() -> HoiTrConfig {
        HoiTrConfig {
            hidden_dim: 16,
            nheads: 2,
            enc_layers: 1,
            dec_layers: 2,
            dec_layers_distance: 1,
            dec_layers_occlusion: 1,
            dim_feedforward: 32,
            dropout: 0.0,
            num_queries: 4,
            backbone: BackboneKind::Resnet18,
            position_embedding: PositionEmbeddingKind::Sine,
            num_entity_classes: 3,
            ..HoiTrConfig::for_dataset(DatasetKind::TwoPointFiveVrd)
        }
    }

    fn dataset(dir: &Path, n: usize) -> Arc<VrdDataset> {
        let mut images = Vec::new();
        for i in 0..n {
            let name = format!("{i}.png");
            image::RgbImage::from_fn(40, 32, |x, y| image::Rgb([(x * 6) as u8, (y * 7) as u8, 90]))
                .save(dir.join(&name))
                .unwrap();
            images.push(ImageAnnotation {
                file_name: name,
                image_id: format!("img{i}"),
                width: 40,
                height: 32,
                annotations: vec![
                    EntityAnnotation {
                        bbox: [2.0, 2.0, 20.0, 30.0],
                        category_id: 1,
                    },
                    EntityAnnotation {
                        bbox: [15.0, 5.0, 38.0, 25.0],
                        category_id: 2,
                    },
                ],
                hoi_annotation: vec![RelationAnnotation {
                    subject_id: 0,
                    object_id: 1,
                    distance: 1,
                    occlusion: 2,
                }],
            });
        }
        Arc::new(VrdDataset::from_parts(
            "valid",
            dir.to_path_buf(),
            images,
            Transforms::eval(32),
        ))
    }

    struct Fixture {
        varmap: VarMap,
        model: HoiTr,
        criterion: SetCriterion,
        optimal_transport: OptimalTransport,
        flags: RunFlags,
        classes: RelationClasses,
        device: Device,
    }

    fn fixture(flags: RunFlags) -> Fixture {
        fixture_with_loss(flags, LossConfig::default())
    }

    fn fixture_with_loss(flags: RunFlags, loss: LossConfig) -> Fixture {
        let cfg = config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = HoiTr::load(vb, &cfg).unwrap();
        let group: Arc<dyn ProcessGroup> = Arc::new(SingleProcess);
        let criterion = SetCriterion::new(
            &cfg,
            HungarianMatcher::new(MatcherConfig::default()),
            &loss,
            group.clone(),
        );
        let optimal_transport =
            OptimalTransport::new(&cfg, MatcherConfig::default(), &loss, &flags, group);
        Fixture {
            varmap,
            model,
            criterion,
            optimal_transport,
            flags,
            classes: RelationClasses::numbered(3),
            device: Device::Cpu,
        }
    }

    impl Fixture {
        fn model_snapshot(&self) -> Vec<f32> {
            let data = self.varmap.data().lock().unwrap();
            let mut names: Vec<&String> = data.keys().collect();
            names.sort();
            let values: Vec<f32> = names
                .into_iter()
                .flat_map(|n| data[n].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect();
            values
        }
    }

    fn context(f: &Fixture) -> EngineContext<'_> {
        EngineContext {
            model: &f.model,
            criterion: &f.criterion,
            optimal_transport: &f.optimal_transport,
            group: &SingleProcess,
            flags: &f.flags,
            classes: &f.classes,
            device: &f.device,
        }
    }

    fn optimizer(varmap: &VarMap) -> AdamW {
        let groups = param_groups(varmap, false);
        AdamW::new(
            vec![
                ParamGroup {
                    lr: 1e-4,
                    vars: groups.main,
                },
                ParamGroup {
                    lr: 0.0,
                    vars: groups.backbone,
                },
            ],
            AdamWParams::default(),
        )
        .unwrap()
    }

    fn loader(ds: Arc<VrdDataset>, batch_size: usize) -> DataLoader {
        let n = ds.len();
        DataLoader::new(ds, BatchSampler::new(Sampler::sequential(n), batch_size, false), 0, 0).unwrap()
    }

    #[test]
    fn test_progress_bar_render() {
        let line = render_progress_bar(1, 4, "Training");
        assert!(line.starts_with(&format!("[{}{}]", "=".repeat(15), " ".repeat(45))));
        assert!(line.ends_with("] 25%  Training"));
        assert!(render_progress_bar(3, 3, "x").contains("100%"));
    }

    #[test]
    fn test_predictions_file_name() {
        assert_eq!(predictions_file_name("valid", 5), "predictions_valid_4.csv");
        assert_eq!(predictions_file_name("test", 0), "predictions_test_-1.csv");
    }

    #[test]
    fn test_train_one_epoch_writes_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(RunFlags::default());
        let ctx = context(&f);
        let mut opt = optimizer(&f.varmap);
        let mut data = loader(dataset(dir.path(), 2), 2);
        let mut writer = ScalarWriter::create(&dir.path().join("runs"), true).unwrap();

        let stats = train_one_epoch(&ctx, &mut writer, &mut data, &mut opt, 3, 0.1).unwrap();
        assert!(stats["loss"].is_finite());
        assert!(stats.contains_key("loss_ce_unscaled"));
        assert!(stats.contains_key("loss_giou_0"));
        assert_eq!(stats["lr"], 1e-4);
        assert_eq!(opt.step_count(), 1);

        drop(writer);
        let text = std::fs::read_to_string(dir.path().join("runs/scalars.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 7);
        assert!(text.contains("\"Class Error/train/occlusion\""));
        assert!(text.lines().all(|l| l.contains("\"step\":3")));
    }

    #[test]
    fn test_non_finite_loss_stops_training() {
        let dir = tempfile::tempdir().unwrap();
        let loss = LossConfig {
            bbox_loss_coef: f64::INFINITY,
            ..LossConfig::default()
        };
        let f = fixture_with_loss(RunFlags::default(), loss);
        let ctx = context(&f);
        let mut opt = optimizer(&f.varmap);
        let mut data = loader(dataset(dir.path(), 2), 1);
        let before = f.model_snapshot();

        let result = train_one_epoch(&ctx, &mut ScalarWriter::disabled(), &mut data, &mut opt, 0, 0.1);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("iteration 0"));
        assert_eq!(opt.step_count(), 0);
        assert_eq!(f.model_snapshot(), before);
    }

    #[test]
    fn test_sinkhorn_cost_mode() {
        let dir = tempfile::tempdir().unwrap();
        let flags = RunFlags {
            use_optimal_transport: true,
            backprop_sinkhorn_cost: true,
            sinkhorn_iterations: 5,
            ..RunFlags::default()
        };
        let f = fixture(flags);
        let ctx = context(&f);
        let mut opt = optimizer(&f.varmap);
        let mut data = loader(dataset(dir.path(), 2), 1);
        let mut writer = ScalarWriter::create(dir.path(), true).unwrap();

        let stats = train_one_epoch(&ctx, &mut writer, &mut data, &mut opt, 1, 0.0).unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats["loss"].is_finite());
        assert_eq!(opt.step_count(), 2);

        drop(writer);
        let text = std::fs::read_to_string(dir.path().join("scalars.jsonl")).unwrap();
        let steps: Vec<i64> = text
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["step"].as_i64().unwrap())
            .collect();
        assert_eq!(steps, vec![2, 3]);
    }

    #[test]
    fn test_train_on_one_image_repeats_batch() {
        let dir = tempfile::tempdir().unwrap();
        let flags = RunFlags {
            train_on_one_image: true,
            train_on_one_image_index: 1,
            ..RunFlags::default()
        };
        let f = fixture(flags);
        let ctx = context(&f);
        let mut opt = optimizer(&f.varmap);
        let mut data = loader(dataset(dir.path(), 3), 1);
        let stats =
            train_one_epoch(&ctx, &mut ScalarWriter::disabled(), &mut data, &mut opt, 0, 0.1).unwrap();
        assert!(stats["loss"].is_finite());
        assert_eq!(opt.step_count(), 3);
    }

    #[test]
    fn test_validate_and_evaluation_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(RunFlags {
            top_k: 2,
            ..RunFlags::default()
        });
        let ctx = context(&f);
        let mut data = loader(dataset(dir.path(), 3), 2);
        let mut writer = ScalarWriter::create(&dir.path().join("runs"), true).unwrap();

        let losses = validate(&ctx, &mut writer, "valid", &mut data, -1).unwrap();
        assert!(losses.loss.is_finite());
        assert!(losses.loss >= losses.loss_ce);

        let path =
            generate_evaluation_outputs(&ctx, "valid", &mut data, 1, &dir.path().join("out")).unwrap();
        assert!(path.ends_with("predictions_valid_0.csv"));
        let table = vrdtools::read_predictions(&path).unwrap();
        assert_eq!(table.len(), 6);
        assert!(table.rows.iter().all(|r| r.image_id_1.starts_with("img")));
    }
}
