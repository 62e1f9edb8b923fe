//! Raw model outputs to ranked relation lists.

use candle_core::{Result, Tensor, D};
use vrdtools::{PredictionTable, RelationClasses};

use crate::data::Target;
use crate::model::HoiOutputs;
use crate::relation::RelationPrediction;

/// Best class and its probability per query, the no-object class excluded.
///
/// Returns two [B][Q] tables (scores, labels).
fn best_class(logits: &Tensor) -> Result<(Vec<Vec<f32>>, Vec<Vec<u32>>)> {
    let c = logits.dim(D::Minus1)?;
    let probs = candle_nn::ops::softmax_last_dim(logits)?.narrow(D::Minus1, 0, c - 1)?;
    Ok((
        probs.max(D::Minus1)?.to_vec2::<f32>()?,
        probs.argmax(D::Minus1)?.to_vec2::<u32>()?,
    ))
}

/// Relations of every image sorted by score, at most `top_k` each
pub fn generate_hoi_list(
    outputs: &HoiOutputs,
    targets: &[Target],
    top_k: usize,
) -> Result<Vec<Vec<RelationPrediction>>> {
    let outputs = outputs.detach();
    let (sub_scores, sub_labels) = best_class(&outputs.pred_sub_logits)?;
    let (obj_scores, obj_labels) = best_class(&outputs.pred_obj_logits)?;
    let (distance_scores, distance_labels) = best_class(&outputs.pred_distance_logits)?;
    let (_, occlusion_labels) = best_class(&outputs.pred_occlusion_logits)?;
    let sub_boxes = outputs.pred_sub_boxes.to_vec3::<f32>()?;
    let obj_boxes = outputs.pred_obj_boxes.to_vec3::<f32>()?;

    let mut lists = Vec::with_capacity(targets.len());
    for (b, target) in targets.iter().enumerate() {
        let to_array = |v: &[f32]| [v[0], v[1], v[2], v[3]];
        let mut relations: Vec<RelationPrediction> = (0..sub_scores[b].len())
            .map(|q| RelationPrediction {
                sub_bbox: RelationPrediction::denormalize(to_array(&sub_boxes[b][q]), target.orig_size),
                obj_bbox: RelationPrediction::denormalize(to_array(&obj_boxes[b][q]), target.orig_size),
                sub_class: sub_labels[b][q] as usize,
                obj_class: obj_labels[b][q] as usize,
                distance: distance_labels[b][q] as usize,
                occlusion: occlusion_labels[b][q] as usize,
                score: sub_scores[b][q] * obj_scores[b][q] * distance_scores[b][q],
            })
            .collect();
        relations.sort_by(|a, b| b.score.total_cmp(&a.score));
        relations.truncate(top_k);
        lists.push(relations);
    }
    Ok(lists)
}

/// Append one evaluation row per relation
pub fn construct_evaluation_output(
    hoi_list: &[Vec<RelationPrediction>],
    targets: &[Target],
    classes: &RelationClasses,
    table: &mut PredictionTable,
) {
    for (relations, target) in hoi_list.iter().zip(targets) {
        for relation in relations {
            table.push(relation.to_row(&target.image_id, classes));
        }
    }
}
