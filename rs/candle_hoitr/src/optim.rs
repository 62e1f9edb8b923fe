//! AdamW with parameter groups, gradient clipping and epoch schedulers.

use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

/// Variables sharing a learning rate
pub struct ParamGroup {
    pub lr: f64,
    pub vars: Vec<(String, Var)>,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamWParams {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-4,
        }
    }
}

struct Moments {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// AdamW with decoupled weight decay
pub struct AdamW {
    groups: Vec<ParamGroup>,
    moments: HashMap<String, Moments>,
    params: AdamWParams,
    step_t: usize,
}

impl AdamW {
    pub fn new(groups: Vec<ParamGroup>, params: AdamWParams) -> Result<Self> {
        let mut moments = HashMap::new();
        for (name, var) in groups.iter().flat_map(|g| &g.vars) {
            moments.insert(
                name.clone(),
                Moments {
                    exp_avg: var.zeros_like()?,
                    exp_avg_sq: var.zeros_like()?,
                },
            );
        }
        Ok(Self {
            groups,
            moments,
            params,
            step_t: 0,
        })
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn learning_rate(&self, group: usize) -> f64 {
        self.groups.get(group).map_or(0.0, |g| g.lr)
    }

    pub fn set_learning_rate(&mut self, group: usize, lr: f64) {
        if let Some(g) = self.groups.get_mut(group) {
            g.lr = lr;
        }
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.lr).collect()
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn set_step_count(&mut self, step: usize) {
        self.step_t = step;
    }

    /// Every optimized variable
    pub fn vars(&self) -> Vec<Var> {
        self.groups
            .iter()
            .flat_map(|g| g.vars.iter().map(|(_, v)| v.clone()))
            .collect()
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let AdamWParams {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));

        for group in &self.groups {
            let lr = group.lr;
            if lr == 0.0 {
                continue;
            }
            for (name, var) in &group.vars {
                let (Some(g), Some(m)) = (grads.get(var.as_tensor()), self.moments.get_mut(name))
                else {
                    continue;
                };
                let next_m = ((&m.exp_avg * beta1)? + (g * (1.0 - beta1))?)?;
                let next_v = ((&m.exp_avg_sq * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let decayed = (var.as_tensor() * (1f64 - lr * weight_decay))?;
                let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
                var.set(&(decayed - (update * lr)?)?)?;
                m.exp_avg = next_m;
                m.exp_avg_sq = next_v;
            }
        }
        Ok(())
    }

    /// Moment tensors keyed `{name}.exp_avg` and `{name}.exp_avg_sq`
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::with_capacity(2 * self.moments.len());
        for (name, m) in &self.moments {
            state.insert(format!("{name}.exp_avg"), m.exp_avg.clone());
            state.insert(format!("{name}.exp_avg_sq"), m.exp_avg_sq.clone());
        }
        state
    }

    /// Restore moments saved by [`AdamW::state_tensors`]. Unknown or
    /// mis-shaped entries are skipped; returns the number of restored moments.
    pub fn load_state_tensors(&mut self, state: &HashMap<String, Tensor>) -> Result<usize> {
        let mut restored = 0;
        for (name, m) in self.moments.iter_mut() {
            let (Some(avg), Some(avg_sq)) = (
                state.get(&format!("{name}.exp_avg")),
                state.get(&format!("{name}.exp_avg_sq")),
            ) else {
                continue;
            };
            if avg.shape() != m.exp_avg.shape() || avg_sq.shape() != m.exp_avg_sq.shape() {
                tracing::warn!(name, "skipping optimizer state with a different shape");
                continue;
            }
            let device = m.exp_avg.device().clone();
            let dtype = m.exp_avg.dtype();
            m.exp_avg = avg.to_device(&device)?.to_dtype(dtype)?;
            m.exp_avg_sq = avg_sq.to_device(&device)?.to_dtype(dtype)?;
            restored += 1;
        }
        Ok(restored)
    }
}

/// Scale gradients so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum_sq += g
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let total_norm = sum_sq.sqrt();
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * clip_coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(total_norm)
}

/// Learning rate schedule stepped once per epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrScheduler {
    /// Multiply every group's lr by `gamma` each `step_size` epochs. The
    /// update is relative to the current lr, so manual changes persist.
    StepLr {
        step_size: usize,
        gamma: f64,
        last_epoch: usize,
    },
    /// Triangular cycle between `base_lr` and `max_lr`, amplitude halved
    /// every cycle. Sets the lr of every group.
    CyclicLr {
        base_lr: f64,
        max_lr: f64,
        step_size_up: usize,
        step_size_down: usize,
        last_epoch: usize,
    },
}

impl LrScheduler {
    pub fn step_lr(step_size: usize, gamma: f64) -> Self {
        LrScheduler::StepLr {
            step_size,
            gamma,
            last_epoch: 0,
        }
    }

    /// Cyclic schedule; sets the starting lr of every group to `base_lr`
    pub fn cyclic(
        base_lr: f64,
        max_lr: f64,
        step_size_up: usize,
        step_size_down: usize,
        optimizer: &mut AdamW,
    ) -> Self {
        for group in 0..optimizer.num_groups() {
            optimizer.set_learning_rate(group, base_lr);
        }
        LrScheduler::CyclicLr {
            base_lr,
            max_lr,
            step_size_up,
            step_size_down,
            last_epoch: 0,
        }
    }

    pub fn step(&mut self, optimizer: &mut AdamW) {
        match self {
            LrScheduler::StepLr {
                step_size,
                gamma,
                last_epoch,
            } => {
                *last_epoch += 1;
                if *step_size > 0 && *last_epoch % *step_size == 0 {
                    for group in 0..optimizer.num_groups() {
                        let lr = optimizer.learning_rate(group) * *gamma;
                        optimizer.set_learning_rate(group, lr);
                    }
                }
            }
            LrScheduler::CyclicLr { last_epoch, .. } => {
                *last_epoch += 1;
                let lr = self.cyclic_lr();
                for group in 0..optimizer.num_groups() {
                    optimizer.set_learning_rate(group, lr);
                }
            }
        }
    }

    /// Lr of a cyclic schedule at its current epoch
    fn cyclic_lr(&self) -> f64 {
        let LrScheduler::CyclicLr {
            base_lr,
            max_lr,
            step_size_up,
            step_size_down,
            last_epoch,
        } = *self
        else {
            return 0.0;
        };
        let total = (step_size_up + step_size_down).max(1) as f64;
        let step_ratio = step_size_up as f64 / total;
        let cycle = (1.0 + last_epoch as f64 / total).floor();
        let x = 1.0 + last_epoch as f64 / total - cycle;
        let scale = if x <= step_ratio {
            x / step_ratio
        } else {
            (x - 1.0) / (step_ratio - 1.0)
        };
        let amplitude = 1.0 / 2f64.powf(cycle - 1.0);
        base_lr + (max_lr - base_lr) * scale * amplitude
    }
}
