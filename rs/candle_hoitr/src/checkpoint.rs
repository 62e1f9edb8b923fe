//! Checkpoint save / resume and pretrained DETR initialization.
//!
//! A checkpoint `name` is three files in the output directory:
//!
//! ```text
//! {name}.safetensors        model variables
//! {name}.optim.safetensors  AdamW moments
//! {name}.json               epoch, scheduler, learning rates, run arguments
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::dist::ProcessGroup;
use crate::model::named_vars;
use crate::optim::{AdamW, LrScheduler};

/// Metadata stored next to the weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub lr_scheduler: LrScheduler,
    /// Learning rate of each optimizer group
    pub lrs: Vec<f64>,
    /// Optimizer step count
    pub step: usize,
    pub args: serde_json::Value,
}

/// Everything written to a checkpoint
pub struct TrainState<'a> {
    pub varmap: &'a VarMap,
    pub optimizer: &'a AdamW,
    pub lr_scheduler: &'a LrScheduler,
    pub epoch: usize,
    pub args: serde_json::Value,
}

/// Checkpoint names written after `epoch`
pub fn checkpoint_names(epoch: usize, lr_drop: usize) -> Vec<String> {
    let mut names = vec![format!("checkpoint_epoch_{epoch}")];
    let next = epoch + 1;
    let before_drop = lr_drop > 0 && next % lr_drop == 0;
    let after_drop = next > lr_drop && next % 10 == 0;
    if before_drop || next % 100 == 0 || after_drop {
        names.push(format!("checkpoint{epoch:04}"));
    }
    names
}

/// Strip a known checkpoint suffix, so both `dir/name` and
/// `dir/name.safetensors` designate the same checkpoint
pub fn checkpoint_prefix(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    for suffix in [".optim.safetensors", ".safetensors", ".json"] {
        if let Some(prefix) = text.strip_suffix(suffix) {
            return PathBuf::from(prefix);
        }
    }
    path.to_path_buf()
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write checkpoint `name` into `dir`. Only the main process writes.
pub fn save_on_master(
    group: &dyn ProcessGroup,
    dir: &Path,
    name: &str,
    state: &TrainState,
) -> anyhow::Result<()> {
    if !group.is_main_process() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    let prefix = dir.join(name);
    state.varmap.save(with_suffix(&prefix, ".safetensors"))?;
    candle_core::safetensors::save(
        &state.optimizer.state_tensors(),
        with_suffix(&prefix, ".optim.safetensors"),
    )?;
    let meta = CheckpointMeta {
        epoch: state.epoch,
        lr_scheduler: state.lr_scheduler.clone(),
        lrs: state.optimizer.learning_rates(),
        step: state.optimizer.step_count(),
        args: state.args.clone(),
    };
    let file = std::fs::File::create(with_suffix(&prefix, ".json"))?;
    serde_json::to_writer_pretty(file, &meta)?;
    tracing::info!(checkpoint = %prefix.display(), epoch = state.epoch, "saved checkpoint");
    Ok(())
}

/// Copy tensors into the variables of the same name and shape.
///
/// Returns the names of the variables that were left untouched.
pub fn copy_matching(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> anyhow::Result<Vec<String>> {
    let mut untouched = Vec::new();
    for (name, var) in named_vars(varmap) {
        match tensors.get(&name) {
            Some(t) if t.shape() == var.shape() => {
                let t = t.to_device(var.device())?.to_dtype(var.dtype())?;
                var.set(&t)?;
            }
            _ => untouched.push(name),
        }
    }
    Ok(untouched)
}

/// Initialize from DETR COCO weights, keeping the keys both models share.
///
/// Returns false when the weights file does not exist.
pub fn load_pretrained(varmap: &VarMap, path: &Path) -> anyhow::Result<bool> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "pretrained DETR weights not found, training from scratch");
        return Ok(false);
    }
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let untouched = copy_matching(varmap, &tensors)?;
    let total = named_vars(varmap).len();
    tracing::info!(
        path = %path.display(),
        loaded = total - untouched.len(),
        total,
        "initialized from pretrained DETR"
    );
    Ok(true)
}

/// Learning rates forced on resume
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualLr {
    /// Group 0
    pub lr: Option<f64>,
    /// Group 1
    pub lr_backbone: Option<f64>,
}

impl ManualLr {
    pub fn is_set(&self) -> bool {
        self.lr.is_some() || self.lr_backbone.is_some()
    }
}

/// Load the model variables of a checkpoint; the model must match exactly.
///
/// Returns the checkpoint metadata when present.
pub fn load_model(path: &Path, varmap: &VarMap) -> anyhow::Result<Option<CheckpointMeta>> {
    let prefix = checkpoint_prefix(path);
    let weights = with_suffix(&prefix, ".safetensors");
    if !weights.exists() {
        anyhow::bail!("checkpoint weights {:?} not found", weights);
    }
    let tensors = candle_core::safetensors::load(&weights, &Device::Cpu)?;
    let untouched = copy_matching(varmap, &tensors)?;
    if !untouched.is_empty() {
        anyhow::bail!(
            "checkpoint {:?} does not match the model, {} variables missing or mis-shaped (first: {})",
            weights,
            untouched.len(),
            untouched[0]
        );
    }
    tracing::info!(checkpoint = %prefix.display(), "loaded model");

    let meta_path = with_suffix(&prefix, ".json");
    if !meta_path.exists() {
        return Ok(None);
    }
    let meta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
    Ok(Some(meta))
}

/// Restore a checkpoint written by [`save_on_master`].
///
/// Optimizer, scheduler and epoch are restored when the metadata and the
/// optimizer state are present; returns the epoch to start from.
pub fn resume(
    path: &Path,
    varmap: &VarMap,
    optimizer: &mut AdamW,
    lr_scheduler: &mut LrScheduler,
    manual: ManualLr,
) -> anyhow::Result<Option<usize>> {
    let meta = load_model(path, varmap)?;
    let optim_path = with_suffix(&checkpoint_prefix(path), ".optim.safetensors");
    let mut start_epoch = None;
    if let Some(meta) = meta.filter(|_| optim_path.exists()) {
        let state = candle_core::safetensors::load(&optim_path, &Device::Cpu)?;
        let restored = optimizer.load_state_tensors(&state)?;
        optimizer.set_step_count(meta.step);
        for (group, lr) in meta.lrs.iter().enumerate().take(optimizer.num_groups()) {
            optimizer.set_learning_rate(group, *lr);
        }
        if !manual.is_set() {
            *lr_scheduler = meta.lr_scheduler;
        }
        tracing::info!(epoch = meta.epoch, restored, "restored optimizer state");
        start_epoch = Some(meta.epoch + 1);
    }
    if let Some(lr) = manual.lr {
        optimizer.set_learning_rate(0, lr);
        tracing::info!(lr, "changed lr");
    }
    if let Some(lr) = manual.lr_backbone {
        optimizer.set_learning_rate(1, lr);
        tracing::info!(lr, "changed lr_backbone");
    }
    Ok(start_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::SingleProcess;
    use crate::optim::{AdamWParams, ParamGroup};
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn varmap(fill: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 3), "input_proj.weight", Init::Const(fill))
            .unwrap();
        vb.get_with_hints(3, "backbone.1.row_embed.weight", Init::Const(fill))
            .unwrap();
        varmap
    }

    fn optimizer(varmap: &VarMap) -> AdamW {
        let vars = named_vars(varmap);
        let (backbone, main): (Vec<_>, Vec<_>) =
            vars.into_iter().partition(|(n, _)| n.starts_with("backbone."));
        AdamW::new(
            vec![
                ParamGroup { lr: 1e-4, vars: main },
                ParamGroup { lr: 1e-5, vars: backbone },
            ],
            AdamWParams::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_checkpoint_names() {
        assert_eq!(checkpoint_names(3, 200), vec!["checkpoint_epoch_3"]);
        assert_eq!(checkpoint_names(199, 200), vec!["checkpoint_epoch_199", "checkpoint0199"]);
        assert_eq!(checkpoint_names(99, 200).len(), 2);
        assert_eq!(checkpoint_names(209, 200)[1], "checkpoint0209");
        assert_eq!(checkpoint_names(204, 200).len(), 1);
        // Both conditions hold at once but the name is written once
        assert_eq!(checkpoint_names(399, 200).len(), 2);
    }

    #[test]
    fn test_checkpoint_prefix() {
        assert_eq!(checkpoint_prefix(Path::new("out/ck.safetensors")), PathBuf::from("out/ck"));
        assert_eq!(checkpoint_prefix(Path::new("out/ck.optim.safetensors")), PathBuf::from("out/ck"));
        assert_eq!(checkpoint_prefix(Path::new("out/ck")), PathBuf::from("out/ck"));
    }

    #[test]
    fn test_save_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let source = varmap(2.0);
        let mut opt = optimizer(&source);
        opt.set_learning_rate(0, 3e-4);
        opt.set_step_count(12);
        let scheduler = LrScheduler::step_lr(200, 0.1);
        let state = TrainState {
            varmap: &source,
            optimizer: &opt,
            lr_scheduler: &scheduler,
            epoch: 4,
            args: serde_json::json!({"lr": 1e-4}),
        };
        save_on_master(&SingleProcess, dir.path(), "checkpoint_epoch_4", &state).unwrap();

        let target = varmap(0.0);
        let mut opt2 = optimizer(&target);
        let mut sched2 = LrScheduler::step_lr(1, 0.5);
        let start = resume(
            &dir.path().join("checkpoint_epoch_4.safetensors"),
            &target,
            &mut opt2,
            &mut sched2,
            ManualLr::default(),
        )
        .unwrap();
        assert_eq!(start, Some(5));
        assert_eq!(opt2.learning_rate(0), 3e-4);
        assert_eq!(opt2.step_count(), 12);
        assert_eq!(sched2, scheduler);
        let values = named_vars(&target)[1].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == 2.0));
    }

    #[test]
    fn test_manual_lr_keeps_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let source = varmap(1.0);
        let opt = optimizer(&source);
        let scheduler = LrScheduler::step_lr(200, 0.1);
        let state = TrainState {
            varmap: &source,
            optimizer: &opt,
            lr_scheduler: &scheduler,
            epoch: 0,
            args: serde_json::Value::Null,
        };
        save_on_master(&SingleProcess, dir.path(), "ck", &state).unwrap();

        let mut opt2 = optimizer(&source);
        let mut sched2 = LrScheduler::step_lr(7, 0.5);
        let manual = ManualLr {
            lr: Some(1e-3),
            lr_backbone: Some(1e-6),
        };
        resume(&dir.path().join("ck"), &source, &mut opt2, &mut sched2, manual).unwrap();
        assert_eq!(sched2, LrScheduler::step_lr(7, 0.5));
        assert_eq!(opt2.learning_rates(), vec![1e-3, 1e-6]);
    }

    #[test]
    fn test_pretrained_partial_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detr.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "input_proj.weight".to_string(),
            Tensor::full(5f32, (2, 3), &Device::Cpu).unwrap(),
        );
        // Shape mismatch is skipped
        tensors.insert(
            "backbone.1.row_embed.weight".to_string(),
            Tensor::full(5f32, 4, &Device::Cpu).unwrap(),
        );
        tensors.insert("class_embed.weight".to_string(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let model = varmap(0.0);
        assert!(load_pretrained(&model, &path).unwrap());
        let vars = named_vars(&model);
        let get = |i: usize| vars[i].1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // Sorted: backbone.1.row_embed.weight, input_proj.weight
        assert!(get(0).iter().all(|v| *v == 0.0));
        assert!(get(1).iter().all(|v| *v == 5.0));

        assert!(!load_pretrained(&model, &dir.path().join("missing.safetensors")).unwrap());
    }

    #[test]
    fn test_non_main_rank_does_not_write() {
        struct Worker;
        impl ProcessGroup for Worker {
            fn rank(&self) -> usize {
                1
            }
            fn world_size(&self) -> usize {
                2
            }
            fn all_reduce_sum(&self, _: &mut [f32]) -> crate::dist::Result<()> {
                Ok(())
            }
            fn reduce_sum_to_main(&self, _: &mut [f32]) -> crate::dist::Result<()> {
                Ok(())
            }
            fn barrier(&self) -> crate::dist::Result<()> {
                Ok(())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let model = varmap(1.0);
        let opt = optimizer(&model);
        let scheduler = LrScheduler::step_lr(1, 0.1);
        let state = TrainState {
            varmap: &model,
            optimizer: &opt,
            lr_scheduler: &scheduler,
            epoch: 0,
            args: serde_json::Value::Null,
        };
        save_on_master(&Worker, &dir.path().join("out"), "ck", &state).unwrap();
        assert!(!dir.path().join("out").exists());
    }
}
