//! Entropic optimal transport between queries and target relations.
//!
//! Instead of a hard one-to-one matching, every query spreads a mass of 1/Q
//! over the targets and a "no-object" dustbin column. Each target receives
//! 1/Q and the dustbin takes what is left.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{DType, Result, Tensor, D};

use crate::box_ops::{box_cxcywh_to_xyxy, cdist_l1, generalized_box_iou};
use crate::config::{HoiTrConfig, LossConfig, MatcherConfig, RunFlags};
use crate::criterion::{build_weight_dict, class_error, num_boxes, HostLabels, LossDict};
use crate::data::DeviceTarget;
use crate::dist::ProcessGroup;
use crate::matcher::{pairwise_costs, ImageMatch};
use crate::model::HoiOutputs;

fn log_sum_exp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Log-domain Sinkhorn iterations on a row-major `rows x cols` cost.
///
/// Returns the transport plan with row marginals `mu` and column marginals
/// `nu`. Zero-mass columns receive nothing.
pub fn sinkhorn_log(
    cost: &[f32],
    rows: usize,
    cols: usize,
    mu: &[f32],
    nu: &[f32],
    epsilon: f32,
    iterations: usize,
) -> Vec<f32> {
    const LARGE: f64 = 1e6;
    let eps = epsilon as f64;
    let c: Vec<f64> = cost
        .iter()
        .map(|&v| if v.is_finite() { v as f64 } else { LARGE })
        .collect();
    let log_mu: Vec<f64> = mu.iter().map(|&m| (m as f64).ln()).collect();
    let log_nu: Vec<f64> = nu.iter().map(|&n| (n as f64).ln()).collect();

    let mut f = vec![0f64; rows];
    let mut g = vec![0f64; cols];
    for _ in 0..iterations {
        for i in 0..rows {
            let row = &c[i * cols..(i + 1) * cols];
            f[i] = eps * log_mu[i] - eps * log_sum_exp((0..cols).map(|j| (g[j] - row[j]) / eps));
        }
        for j in 0..cols {
            g[j] = eps * log_nu[j] - eps * log_sum_exp((0..rows).map(|i| (f[i] - c[i * cols + j]) / eps));
        }
    }

    let mut plan = vec![0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            let v = ((f[i] + g[j] - c[i * cols + j]) / eps).exp();
            plan[i * cols + j] = if v.is_finite() { v as f32 } else { 0.0 };
        }
    }
    plan
}

/// Probability of the no-object class, summed over the four heads: [Q, 1]
fn no_object_probability(outputs: &HoiOutputs) -> Result<Tensor> {
    let last = |logits: &Tensor| -> Result<Tensor> {
        let c = logits.dim(D::Minus1)?;
        candle_nn::ops::softmax_last_dim(logits)?.narrow(D::Minus1, c - 1, 1)
    };
    last(&outputs.pred_sub_logits)?
        + last(&outputs.pred_obj_logits)?
        + last(&outputs.pred_distance_logits)?
        + last(&outputs.pred_occlusion_logits)?
}

/// Negative log-likelihood of every (query, target) pair plus the dustbin: [Q, T + 1]
fn pair_nll(logits: &Tensor, labels: &Tensor, num_relations: usize) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let c = log_probs.dim(D::Minus1)?;
    let dustbin = log_probs.narrow(D::Minus1, c - 1, 1)?;
    let nll = if num_relations == 0 {
        dustbin
    } else {
        Tensor::cat(&[&log_probs.index_select(labels, 1)?, &dustbin], 1)?
    };
    nll.neg()
}

/// Running weighted mean of a class loss over the batch
struct WeightedMean {
    numerator: Option<Tensor>,
    denominator: f64,
}

impl WeightedMean {
    fn new() -> Self {
        Self {
            numerator: None,
            denominator: 0.0,
        }
    }

    fn add(&mut self, term: Tensor, weight: f64) -> Result<()> {
        self.numerator = Some(match self.numerator.take() {
            Some(n) => (n + term)?,
            None => term,
        });
        self.denominator += weight;
        Ok(())
    }

    fn value(self) -> Result<Tensor> {
        match self.numerator {
            Some(n) => n / self.denominator.max(f64::EPSILON),
            None => candle_core::bail!("empty batch"),
        }
    }
}

fn accumulate(total: Option<Tensor>, term: Tensor) -> Result<Option<Tensor>> {
    Ok(Some(match total {
        Some(t) => (t + term)?,
        None => term,
    }))
}

/// Transport plan of one image with its cost, both [Q, T + 1]
pub struct ImageTransport {
    /// Detached plan
    pub plan: Tensor,
    /// Differentiable cost
    pub cost: Tensor,
    plan_host: Vec<f32>,
    num_relations: usize,
}

impl ImageTransport {
    /// Query carrying the most mass for every target
    pub fn assignment(&self) -> ImageMatch {
        let cols = self.num_relations + 1;
        let rows = self.plan_host.len() / cols;
        let mut m = ImageMatch::default();
        for t in 0..self.num_relations {
            let best = (0..rows)
                .max_by(|&a, &b| {
                    self.plan_host[a * cols + t].total_cmp(&self.plan_host[b * cols + t])
                })
                .unwrap_or(0);
            m.queries.push(best as u32);
            m.targets.push(t as u32);
        }
        m
    }
}

pub struct OptimalTransport {
    cost_weights: MatcherConfig,
    epsilon: f32,
    iterations: usize,
    pub eos_coef: f64,
    pub weight_dict: BTreeMap<String, f64>,
    group: Arc<dyn ProcessGroup>,
}

impl OptimalTransport {
    pub fn new(
        model: &HoiTrConfig,
        cost_weights: MatcherConfig,
        loss: &LossConfig,
        flags: &RunFlags,
        group: Arc<dyn ProcessGroup>,
    ) -> Self {
        let num_aux = if model.aux_loss {
            model.dec_layers.saturating_sub(1)
        } else {
            0
        };
        Self {
            cost_weights,
            epsilon: flags.sinkhorn_epsilon,
            iterations: flags.sinkhorn_iterations,
            eos_coef: loss.eos_coef,
            weight_dict: build_weight_dict(loss, num_aux),
            group,
        }
    }

    /// Transport problem of image `outputs` ([Q, ·] predictions)
    pub fn transport(&self, outputs: &HoiOutputs, target: &DeviceTarget) -> Result<ImageTransport> {
        let num_queries = outputs.pred_sub_logits.dim(0)?;
        let t = target.num_relations;
        let w = &self.cost_weights;

        let dustbin = (no_object_probability(outputs)?.neg()? * w.set_cost_class as f64)?;
        let cost = if t == 0 {
            dustbin
        } else {
            let costs = pairwise_costs(outputs, target)?;
            let pairs = ((costs.class * w.set_cost_class as f64)?
                + (costs.bbox * w.set_cost_bbox as f64)?
                + (costs.giou * w.set_cost_giou as f64)?)?;
            Tensor::cat(&[&pairs, &dustbin], 1)?
        };

        let cols = t + 1;
        let mass = 1.0 / num_queries.max(t) as f32;
        let mu = vec![1.0 / num_queries as f32; num_queries];
        let mut nu = vec![mass; cols];
        nu[t] = (1.0 - mass * t as f32).max(0.0);

        let host = cost.detach().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let plan_host = sinkhorn_log(&host, num_queries, cols, &mu, &nu, self.epsilon, self.iterations);
        let plan = Tensor::from_slice(&plan_host, (num_queries, cols), cost.device())?
            .to_dtype(cost.dtype())?;
        Ok(ImageTransport {
            plan,
            cost,
            plan_host,
            num_relations: t,
        })
    }

    /// Scalar transport cost `Q * sum(P * C)` summed over the batch and the
    /// auxiliary outputs. Gradients flow through the cost only.
    pub fn forward_cost(&self, outputs: &HoiOutputs, targets: &[DeviceTarget]) -> Result<Tensor> {
        let mut total = None;
        for layer in std::iter::once(outputs).chain(&outputs.aux_outputs) {
            for (b, target) in targets.iter().enumerate() {
                let image = layer.image(b)?;
                let q = image.pred_sub_logits.dim(0)? as f64;
                let ot = self.transport(&image, target)?;
                let term = ((&ot.plan * &ot.cost)?.sum_all()? * q)?;
                total = accumulate(total, term)?;
            }
        }
        match total {
            Some(t) => Ok(t),
            None => candle_core::bail!("empty batch"),
        }
    }

    /// Loss dict with the same keys as the Hungarian criterion, every pair
    /// loss weighted by the transport plan
    pub fn forward(&self, outputs: &HoiOutputs, targets: &[DeviceTarget]) -> Result<LossDict> {
        let num_boxes = num_boxes(self.group.as_ref(), targets)?;
        let labels = HostLabels::new(targets)?;
        let mut losses = LossDict::new();
        self.layer_losses(outputs, targets, &labels, num_boxes, "", &mut losses)?;
        for (i, aux) in outputs.aux_outputs.iter().enumerate() {
            self.layer_losses(aux, targets, &labels, num_boxes, &format!("_{i}"), &mut losses)?;
        }
        Ok(losses)
    }

    fn layer_losses(
        &self,
        outputs: &HoiOutputs,
        targets: &[DeviceTarget],
        labels: &HostLabels,
        num_boxes: f64,
        suffix: &str,
        losses: &mut LossDict,
    ) -> Result<()> {
        let device = outputs.pred_sub_logits.device().clone();
        let mut ce = WeightedMean::new();
        let mut distance_ce = WeightedMean::new();
        let mut occlusion_ce = WeightedMean::new();
        let mut bbox = None;
        let mut giou = None;
        let mut assignments = Vec::with_capacity(targets.len());

        for (b, target) in targets.iter().enumerate() {
            let image = outputs.image(b)?;
            let q = image.pred_sub_logits.dim(0)? as f64;
            let t = target.num_relations;
            let ot = self.transport(&image, target)?;
            assignments.push(ot.assignment());

            // Column weights: targets 1, dustbin eos_coef
            let mut column_weights = vec![1f32; t + 1];
            column_weights[t] = self.eos_coef as f32;
            let column_weights = Tensor::from_vec(column_weights, (1, t + 1), &device)?
                .to_dtype(ot.plan.dtype())?;
            let weighted_plan = ot.plan.broadcast_mul(&column_weights)?;
            let weight = weighted_plan
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?
                * q;

            let plan_loss =
                |nll: Tensor| -> Result<Tensor> { (nll * &weighted_plan)?.sum_all()? * q };
            let sub = pair_nll(&image.pred_sub_logits, &target.sub_labels, t)?;
            let obj = pair_nll(&image.pred_obj_logits, &target.obj_labels, t)?;
            ce.add(plan_loss((sub + obj)?)?, weight)?;
            distance_ce.add(
                plan_loss(pair_nll(&image.pred_distance_logits, &target.distance_labels, t)?)?,
                weight,
            )?;
            occlusion_ce.add(
                plan_loss(pair_nll(&image.pred_occlusion_logits, &target.occlusion_labels, t)?)?,
                weight,
            )?;

            let target_plan = if t == 0 {
                None
            } else {
                Some(ot.plan.narrow(1, 0, t)?)
            };
            let (l1, g) = match target_plan {
                Some(p) => {
                    let l1 = (cdist_l1(&image.pred_sub_boxes, &target.sub_boxes)?
                        + cdist_l1(&image.pred_obj_boxes, &target.obj_boxes)?)?;
                    let g = (generalized_box_iou(
                        &box_cxcywh_to_xyxy(&image.pred_sub_boxes)?,
                        &box_cxcywh_to_xyxy(&target.sub_boxes)?,
                    )? + generalized_box_iou(
                        &box_cxcywh_to_xyxy(&image.pred_obj_boxes)?,
                        &box_cxcywh_to_xyxy(&target.obj_boxes)?,
                    )?)?;
                    let g = (2.0 - g)?;
                    (
                        ((l1 * &p)?.sum_all()? * q)?,
                        ((g * &p)?.sum_all()? * q)?,
                    )
                }
                None => {
                    let zero = (image.pred_sub_boxes.sum_all()? * 0.0)?;
                    (zero.clone(), zero)
                }
            };
            bbox = accumulate(bbox, l1)?;
            giou = accumulate(giou, g)?;
        }

        losses.insert(format!("loss_ce{suffix}"), ce.value()?);
        losses.insert(format!("loss_distance_ce{suffix}"), distance_ce.value()?);
        losses.insert(format!("loss_occlusion_ce{suffix}"), occlusion_ce.value()?);
        let empty = || candle_core::Error::Msg("empty batch".into());
        losses.insert(format!("loss_bbox{suffix}"), (bbox.ok_or_else(empty)? / num_boxes)?);
        losses.insert(format!("loss_giou{suffix}"), (giou.ok_or_else(empty)? / num_boxes)?);

        if suffix.is_empty() {
            let distance_error =
                class_error(&outputs.pred_distance_logits, &assignments, &labels.distance)?;
            let occlusion_error =
                class_error(&outputs.pred_occlusion_logits, &assignments, &labels.occlusion)?;
            losses.insert("class_error_action".into(), Tensor::new(distance_error, &device)?);
            losses.insert("class_error_occlusion".into(), Tensor::new(occlusion_error, &device)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetKind;
    use crate::criterion::loss_values;
    use crate::data::Target;
    use crate::dist::SingleProcess;
    use candle_core::{Device, Var};

    #[test]
    fn test_sinkhorn_marginals() {
        let cost = [0.0f32, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0];
        let mu = [1.0 / 3.0; 3];
        let nu = [0.2f32, 0.3, 0.5];
        let plan = sinkhorn_log(&cost, 3, 3, &mu, &nu, 0.1, 200);
        for i in 0..3 {
            let row: f32 = plan[i * 3..(i + 1) * 3].iter().sum();
            assert!((row - mu[i]).abs() < 1e-3);
        }
        for j in 0..3 {
            let col: f32 = (0..3).map(|i| plan[i * 3 + j]).sum();
            assert!((col - nu[j]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_sinkhorn_low_epsilon_is_a_matching() {
        let cost = [5.0f32, 0.0, 0.0, 5.0];
        let plan = sinkhorn_log(&cost, 2, 2, &[0.5, 0.5], &[0.5, 0.5], 0.01, 100);
        assert!(plan[1] > 0.49 && plan[2] > 0.49);
        assert!(plan[0] < 1e-3 && plan[3] < 1e-3);
    }

    #[test]
    fn test_sinkhorn_zero_mass_column() {
        let plan = sinkhorn_log(&[1.0, 2.0, 3.0, 4.0], 2, 2, &[0.5, 0.5], &[1.0, 0.0], 0.1, 20);
        assert_eq!(plan[1], 0.0);
        assert_eq!(plan[3], 0.0);
        assert!((plan[0] + plan[2] - 1.0).abs() < 1e-4);
    }

    fn ot(aux_loss: bool) -> OptimalTransport {
        let model = HoiTrConfig {
            aux_loss,
            dec_layers: 2,
            ..HoiTrConfig::for_dataset(DatasetKind::TwoPointFiveVrd)
        };
        OptimalTransport::new(
            &model,
            MatcherConfig::default(),
            &LossConfig::default(),
            &RunFlags {
                sinkhorn_epsilon: 0.05,
                sinkhorn_iterations: 100,
                ..RunFlags::default()
            },
            Arc::new(SingleProcess),
        )
    }

    fn target(n: usize) -> DeviceTarget {
        Target {
            sub_labels: vec![1; n],
            obj_labels: vec![0; n],
            sub_boxes: vec![[0.3, 0.3, 0.2, 0.2]; n],
            obj_boxes: vec![[0.3, 0.3, 0.2, 0.2]; n],
            distance_labels: vec![2; n],
            occlusion_labels: vec![1; n],
            image_id: "x".into(),
            orig_size: (10, 10),
            size: (10, 10),
            num_bounding_boxes_in_ground_truth: 2,
        }
        .to_device(&Device::Cpu)
        .unwrap()
    }

    fn outputs(device: &Device) -> (HoiOutputs, Var) {
        // Query 1 is on the target box, query 0 elsewhere; flat logits
        let boxes = Var::new(&[[[0.8f32, 0.8, 0.1, 0.1], [0.3, 0.3, 0.2, 0.2]]], device).unwrap();
        let logits = |n: usize| Tensor::zeros((1, 2, n), DType::F32, device).unwrap();
        let out = HoiOutputs {
            pred_sub_logits: logits(4),
            pred_sub_boxes: boxes.as_tensor().clone(),
            pred_obj_logits: logits(4),
            pred_obj_boxes: boxes.as_tensor().clone(),
            pred_distance_logits: logits(4),
            pred_occlusion_logits: logits(5),
            aux_outputs: Vec::new(),
        };
        (out, boxes)
    }

    #[test]
    fn test_transport_marginals_and_assignment() {
        let device = Device::Cpu;
        let (out, _) = outputs(&device);
        let transport = ot(false).transport(&out.image(0).unwrap(), &target(1)).unwrap();
        let plan = transport.plan.to_vec2::<f32>().unwrap();
        // Target column gets 1/Q, dustbin (Q - T)/Q
        assert!((plan[0][0] + plan[1][0] - 0.5).abs() < 1e-3);
        assert!((plan[0][1] + plan[1][1] - 0.5).abs() < 1e-3);
        assert!(plan[1][0] > plan[0][0]);
        assert_eq!(transport.assignment().queries, vec![1]);
    }

    #[test]
    fn test_loss_dict_keys_and_values() {
        let device = Device::Cpu;
        let (mut out, _) = outputs(&device);
        out.aux_outputs = vec![outputs(&device).0];
        let losses = ot(true).forward(&out, &[target(1)]).unwrap();
        let v = loss_values(&losses).unwrap();
        for key in ["loss_ce", "loss_distance_ce", "loss_bbox", "loss_giou_0", "class_error_occlusion"] {
            assert!(v.contains_key(key), "missing {key}");
        }
        assert!(v["loss_bbox"] >= 0.0 && v["loss_bbox"].is_finite());
        // Flat logits: every pair costs log(C)
        assert!((v["loss_distance_ce"] - 4f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_cost_backpropagates_to_boxes() {
        let device = Device::Cpu;
        let (out, boxes) = outputs(&device);
        let cost = ot(false).forward_cost(&out, &[target(1)]).unwrap();
        let grads = cost.backward().unwrap();
        assert!(grads.get(boxes.as_tensor()).is_some());
    }

    #[test]
    fn test_no_targets_send_everything_to_the_dustbin() {
        let device = Device::Cpu;
        let (out, _) = outputs(&device);
        let losses = ot(false).forward(&out, &[target(0)]).unwrap();
        let v = loss_values(&losses).unwrap();
        assert_eq!(v["loss_bbox"], 0.0);
        assert_eq!(v["class_error_action"], 100.0);
    }
}
