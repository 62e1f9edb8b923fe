//! Set-based training losses.
//!
//! Predictions are matched one-to-one with target relations, then:
//! - entity, distance and occlusion heads get a cross-entropy where unmatched
//!   queries must predict the no-object class (down-weighted by `eos_coef`)
//! - matched subject / object boxes get L1 and GIoU losses

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor, D};

use crate::box_ops::{box_cxcywh_to_xyxy, generalized_box_iou_broadcast};
use crate::config::{HoiTrConfig, LossConfig};
use crate::data::DeviceTarget;
use crate::dist::ProcessGroup;
use crate::matcher::{argmax_last, HungarianMatcher, ImageMatch};
use crate::model::HoiOutputs;

pub type LossDict = BTreeMap<String, Tensor>;

/// Loss terms scaled by the weight dict, also carried by every auxiliary output
pub const WEIGHTED_LOSSES: [&str; 5] = [
    "loss_ce",
    "loss_distance_ce",
    "loss_occlusion_ce",
    "loss_bbox",
    "loss_giou",
];

/// Loss weights, replicated with a `_{i}` suffix for each auxiliary output
pub fn build_weight_dict(loss: &LossConfig, num_aux: usize) -> BTreeMap<String, f64> {
    let base = [
        ("loss_ce", 1.0),
        ("loss_distance_ce", loss.relation_loss_coef),
        ("loss_occlusion_ce", loss.relation_loss_coef),
        ("loss_bbox", loss.bbox_loss_coef),
        ("loss_giou", loss.giou_loss_coef),
    ];
    let mut weights = BTreeMap::new();
    for (name, w) in base {
        weights.insert(name.to_string(), w);
        for i in 0..num_aux {
            weights.insert(format!("{name}_{i}"), w);
        }
    }
    weights
}

/// Weighted sum of the losses present in `weight_dict`
pub fn weighted_total(losses: &LossDict, weight_dict: &BTreeMap<String, f64>) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (name, loss) in losses {
        let Some(&w) = weight_dict.get(name) else {
            continue;
        };
        let term = (loss * w)?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    match total {
        Some(t) => Ok(t),
        None => candle_core::bail!("no weighted loss in the loss dict"),
    }
}

/// Number of target relations averaged over ranks, at least one
pub fn num_boxes(group: &dyn ProcessGroup, targets: &[DeviceTarget]) -> Result<f64> {
    let mut n = [targets.iter().map(|t| t.num_relations).sum::<usize>() as f32];
    group
        .all_reduce_sum(&mut n)
        .map_err(candle_core::Error::wrap)?;
    Ok((n[0] as f64 / group.world_size() as f64).max(1.0))
}

/// Class weights with the last (no-object) class scaled by `eos_coef`
pub fn class_weights(num_classes: usize, eos_coef: f64, device: &Device) -> Result<Tensor> {
    let mut w = vec![1f32; num_classes + 1];
    w[num_classes] = eos_coef as f32;
    Tensor::from_vec(w, num_classes + 1, device)
}

/// Cross-entropy weighted per target class, normalized by the total weight
///
/// `logits` is [N, C], `targets` holds N class indices.
pub fn weighted_cross_entropy(logits: &Tensor, targets: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;
    let w = weights.index_select(targets, 0)?;
    let weighted = (picked * &w)?.sum_all()?;
    weighted.neg()?.div(&w.sum_all()?)
}

/// Class of every query: the matched label, or `no_object` when unmatched
pub fn target_classes(
    matches: &[ImageMatch],
    labels: &[Vec<u32>],
    num_queries: usize,
    no_object: u32,
) -> Vec<u32> {
    let mut classes = vec![no_object; matches.len() * num_queries];
    for (b, (m, l)) in matches.iter().zip(labels).enumerate() {
        for (&q, &t) in m.queries.iter().zip(&m.targets) {
            classes[b * num_queries + q as usize] = l[t as usize];
        }
    }
    classes
}

/// Rows of `per_image[b]` picked by `index(b)`, concatenated over the batch
pub fn gather_matched(
    per_image: &Tensor,
    matches: &[ImageMatch],
    index: impl Fn(&ImageMatch) -> &[u32],
) -> Result<Option<Tensor>> {
    let device = per_image.device();
    let mut parts = Vec::new();
    for (b, m) in matches.iter().enumerate() {
        if m.is_empty() {
            continue;
        }
        let idx = Tensor::new(index(m), device)?;
        parts.push(per_image.get(b)?.index_select(&idx, 0)?);
    }
    if parts.is_empty() {
        Ok(None)
    } else {
        Tensor::cat(&parts, 0).map(Some)
    }
}

/// Top-1 error in percent of the matched predictions; 100 without matches
pub fn class_error(
    logits: &Tensor,
    matches: &[ImageMatch],
    labels: &[Vec<u32>],
) -> Result<f32> {
    let Some(matched) = gather_matched(&logits.detach(), matches, |m| &m.queries)? else {
        return Ok(100.0);
    };
    let predicted = argmax_last(&matched)?;
    let expected = matches
        .iter()
        .zip(labels)
        .flat_map(|(m, l)| m.targets.iter().map(move |&t| l[t as usize]));
    let correct = predicted.iter().zip(expected).filter(|(p, e)| **p == *e).count();
    Ok(100.0 - 100.0 * correct as f32 / predicted.len() as f32)
}

/// Host copies of the target labels
pub struct HostLabels {
    pub sub: Vec<Vec<u32>>,
    pub obj: Vec<Vec<u32>>,
    pub distance: Vec<Vec<u32>>,
    pub occlusion: Vec<Vec<u32>>,
}

impl HostLabels {
    pub fn new(targets: &[DeviceTarget]) -> Result<Self> {
        let collect = |f: fn(&DeviceTarget) -> &Tensor| {
            targets
                .iter()
                .map(|t| f(t).to_vec1::<u32>())
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            sub: collect(|t| &t.sub_labels)?,
            obj: collect(|t| &t.obj_labels)?,
            distance: collect(|t| &t.distance_labels)?,
            occlusion: collect(|t| &t.occlusion_labels)?,
        })
    }
}

/// Hungarian set criterion
pub struct SetCriterion {
    pub num_entity_classes: usize,
    pub num_distance_classes: usize,
    pub num_occlusion_classes: usize,
    pub matcher: HungarianMatcher,
    pub weight_dict: BTreeMap<String, f64>,
    pub eos_coef: f64,
    group: Arc<dyn ProcessGroup>,
}

impl SetCriterion {
    pub fn new(
        model: &HoiTrConfig,
        matcher: HungarianMatcher,
        loss: &LossConfig,
        group: Arc<dyn ProcessGroup>,
    ) -> Self {
        let num_aux = if model.aux_loss {
            model.dec_layers.saturating_sub(1)
        } else {
            0
        };
        Self {
            num_entity_classes: model.num_entity_classes,
            num_distance_classes: model.num_distance_classes,
            num_occlusion_classes: model.num_occlusion_classes,
            matcher,
            weight_dict: build_weight_dict(loss, num_aux),
            eos_coef: loss.eos_coef,
            group,
        }
    }

    /// Losses of the final layer and of every auxiliary output
    pub fn forward(&self, outputs: &HoiOutputs, targets: &[DeviceTarget]) -> Result<LossDict> {
        let num_boxes = num_boxes(self.group.as_ref(), targets)?;
        let labels = HostLabels::new(targets)?;

        let mut losses = LossDict::new();
        let matches = self.matcher.forward(outputs, targets)?;
        self.layer_losses(outputs, targets, &labels, &matches, num_boxes, "", &mut losses)?;

        for (i, aux) in outputs.aux_outputs.iter().enumerate() {
            let matches = self.matcher.forward(aux, targets)?;
            let suffix = format!("_{i}");
            self.layer_losses(aux, targets, &labels, &matches, num_boxes, &suffix, &mut losses)?;
        }
        Ok(losses)
    }

    #[allow(clippy::too_many_arguments)]
    fn layer_losses(
        &self,
        outputs: &HoiOutputs,
        targets: &[DeviceTarget],
        labels: &HostLabels,
        matches: &[ImageMatch],
        num_boxes: f64,
        suffix: &str,
        losses: &mut LossDict,
    ) -> Result<()> {
        let device = outputs.pred_sub_logits.device();
        let num_queries = outputs.num_queries()?;

        let ce = |logits: &Tensor, labels: &[Vec<u32>], num_classes: usize| -> Result<Tensor> {
            let classes = target_classes(matches, labels, num_queries, num_classes as u32);
            let n = classes.len();
            let classes = Tensor::from_vec(classes, n, device)?;
            let weights = class_weights(num_classes, self.eos_coef, device)?;
            weighted_cross_entropy(&logits.flatten_to(1)?, &classes, &weights)
        };

        let loss_ce = (ce(&outputs.pred_sub_logits, &labels.sub, self.num_entity_classes)?
            + ce(&outputs.pred_obj_logits, &labels.obj, self.num_entity_classes)?)?;
        losses.insert(format!("loss_ce{suffix}"), loss_ce);
        losses.insert(
            format!("loss_distance_ce{suffix}"),
            ce(&outputs.pred_distance_logits, &labels.distance, self.num_distance_classes)?,
        );
        losses.insert(
            format!("loss_occlusion_ce{suffix}"),
            ce(&outputs.pred_occlusion_logits, &labels.occlusion, self.num_occlusion_classes)?,
        );

        if suffix.is_empty() {
            let distance_error = class_error(&outputs.pred_distance_logits, matches, &labels.distance)?;
            let occlusion_error =
                class_error(&outputs.pred_occlusion_logits, matches, &labels.occlusion)?;
            losses.insert("class_error_action".into(), Tensor::new(distance_error, device)?);
            losses.insert("class_error_occlusion".into(), Tensor::new(occlusion_error, device)?);
        }

        let (loss_bbox, loss_giou) = box_losses(outputs, targets, matches, num_boxes)?;
        losses.insert(format!("loss_bbox{suffix}"), loss_bbox);
        losses.insert(format!("loss_giou{suffix}"), loss_giou);
        Ok(())
    }

    pub fn weighted_total(&self, losses: &LossDict) -> Result<Tensor> {
        weighted_total(losses, &self.weight_dict)
    }
}

/// Matched target boxes of every image, concatenated: [N, 4]
fn matched_target_boxes(
    targets: &[DeviceTarget],
    matches: &[ImageMatch],
    field: impl Fn(&DeviceTarget) -> &Tensor,
) -> Result<Tensor> {
    let mut parts = Vec::new();
    for (t, m) in targets.iter().zip(matches) {
        if m.is_empty() {
            continue;
        }
        let boxes = field(t);
        let idx = Tensor::new(m.targets.as_slice(), boxes.device())?;
        parts.push(boxes.index_select(&idx, 0)?);
    }
    Tensor::cat(&parts, 0)
}

/// L1 and (1 - GIoU) of the matched subject and object boxes, summed and
/// divided by `num_boxes`
pub fn box_losses(
    outputs: &HoiOutputs,
    targets: &[DeviceTarget],
    matches: &[ImageMatch],
    num_boxes: f64,
) -> Result<(Tensor, Tensor)> {
    let Some(src_sub) = gather_matched(&outputs.pred_sub_boxes, matches, |m| &m.queries)? else {
        // Keep the graph connected so every rank runs the same backward
        let zero = (outputs.pred_sub_boxes.sum_all()? * 0.0)?;
        return Ok((zero.clone(), zero));
    };
    let src_obj = gather_matched(&outputs.pred_obj_boxes, matches, |m| &m.queries)?
        .ok_or_else(|| candle_core::Error::Msg("object boxes without subject boxes".into()))?;
    let tgt_sub = matched_target_boxes(targets, matches, |t| &t.sub_boxes)?;
    let tgt_obj = matched_target_boxes(targets, matches, |t| &t.obj_boxes)?;

    let l1 = ((&src_sub - &tgt_sub)?.abs()?.sum_all()? + (&src_obj - &tgt_obj)?.abs()?.sum_all()?)?;

    let giou = |src: &Tensor, tgt: &Tensor| -> Result<Tensor> {
        let g = generalized_box_iou_broadcast(&box_cxcywh_to_xyxy(src)?, &box_cxcywh_to_xyxy(tgt)?)?;
        (1.0 - g)?.sum_all()
    };
    let loss_giou = (giou(&src_sub, &tgt_sub)? + giou(&src_obj, &tgt_obj)?)?;

    Ok(((l1 / num_boxes)?, (loss_giou / num_boxes)?))
}

/// Scalar values of a loss dict
pub fn loss_values(losses: &LossDict) -> Result<BTreeMap<String, f32>> {
    losses
        .iter()
        .map(|(k, v)| Ok((k.clone(), v.to_dtype(DType::F32)?.to_scalar::<f32>()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetKind, MatcherConfig};
    use crate::data::Target;
    use crate::dist::SingleProcess;

    fn criterion(aux_loss: bool) -> SetCriterion {
        let model = HoiTrConfig {
            num_entity_classes: 3,
            num_distance_classes: 3,
            num_occlusion_classes: 4,
            dec_layers: 3,
            aux_loss,
            ..HoiTrConfig::for_dataset(DatasetKind::TwoPointFiveVrd)
        };
        SetCriterion::new(
            &model,
            HungarianMatcher::new(MatcherConfig::default()),
            &LossConfig::default(),
            Arc::new(SingleProcess),
        )
    }

    fn outputs(device: &Device, correct: bool) -> HoiOutputs {
        // Two queries; query 1 is confident in the target, query 0 in no-object
        let logits = |label: usize, n: usize| {
            let mut v = vec![0f32; 2 * (n + 1)];
            v[n] = 20.0;
            v[(n + 1) + if correct { label } else { (label + 1) % n }] = 20.0;
            Tensor::from_vec(v, (1, 2, n + 1), device).unwrap()
        };
        let boxes = Tensor::new(&[[[0.8f32, 0.8, 0.1, 0.1], [0.3, 0.3, 0.2, 0.2]]], device).unwrap();
        HoiOutputs {
            pred_sub_logits: logits(1, 3),
            pred_sub_boxes: boxes.clone(),
            pred_obj_logits: logits(0, 3),
            pred_obj_boxes: boxes,
            pred_distance_logits: logits(2, 3),
            pred_occlusion_logits: logits(1, 4),
            aux_outputs: Vec::new(),
        }
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

    #[test]
    fn test_weight_dict() {
        let w = build_weight_dict(&LossConfig::default(), 2);
        assert_eq!(w.len(), WEIGHTED_LOSSES.len() * 3);
        assert_eq!(w["loss_bbox_1"], 5.0);
        assert_eq!(w["loss_giou"], 2.0);
        assert!(!w.contains_key("class_error_action"));
    }

    #[test]
    fn test_weighted_cross_entropy_matches_manual() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0f32, 0.0], [0.0, 0.0]], &device).unwrap();
        let targets = Tensor::new(&[0u32, 1], &device).unwrap();
        let weights = Tensor::new(&[1f32, 0.5], &device).unwrap();
        let loss = weighted_cross_entropy(&logits, &targets, &weights).unwrap();
        // Uniform predictions: -log(0.5) whatever the weights
        let v = loss.to_scalar::<f32>().unwrap();
        assert!((v - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_perfect_prediction_has_small_losses() {
        let device = Device::Cpu;
        let losses = criterion(false)
            .forward(&outputs(&device, true), &[target(1)])
            .unwrap();
        let v = loss_values(&losses).unwrap();
        assert!(v["loss_bbox"] < 1e-6);
        assert!(v["loss_giou"] < 1e-5);
        assert!(v["loss_ce"] < 1e-3);
        assert_eq!(v["class_error_action"], 0.0);
        assert_eq!(v["class_error_occlusion"], 0.0);
    }

    #[test]
    fn test_wrong_labels_raise_class_error() {
        let device = Device::Cpu;
        let losses = criterion(false)
            .forward(&outputs(&device, false), &[target(1)])
            .unwrap();
        let v = loss_values(&losses).unwrap();
        assert_eq!(v["class_error_action"], 100.0);
        assert!(v["loss_distance_ce"] > 1.0);
    }

    #[test]
    fn test_no_targets() {
        let device = Device::Cpu;
        let c = criterion(false);
        let losses = c.forward(&outputs(&device, true), &[target(0)]).unwrap();
        let v = loss_values(&losses).unwrap();
        assert_eq!(v["loss_bbox"], 0.0);
        assert_eq!(v["class_error_action"], 100.0);
        assert!(c.weighted_total(&losses).unwrap().to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_aux_outputs_add_suffixed_losses() {
        let device = Device::Cpu;
        let mut out = outputs(&device, true);
        out.aux_outputs = vec![outputs(&device, true), outputs(&device, false)];
        let losses = criterion(true).forward(&out, &[target(1)]).unwrap();
        assert!(losses.contains_key("loss_giou_1"));
        assert!(losses.contains_key("loss_ce_0"));
        assert!(!losses.contains_key("class_error_action_0"));
    }

    #[test]
    fn test_target_classes() {
        let m = vec![ImageMatch {
            queries: vec![2],
            targets: vec![0],
        }];
        assert_eq!(target_classes(&m, &[vec![7]], 3, 9), vec![9, 9, 7]);
    }
}
