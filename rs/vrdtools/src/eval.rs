//! Relation recall for prediction tables.
//!
//! A prediction hits a ground-truth relation when both entity names agree,
//! both boxes overlap with IoU >= 0.5, and the relation label agrees.
//! Each prediction can be used for at most one ground-truth relation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{box_iou, ImageAnnotation, PredictionRow, PredictionTable, RelationClasses};

#[derive(Debug, Clone)]
struct GroundTruthRelation {
    subject: String,
    object: String,
    subject_box: [f32; 4],
    object_box: [f32; 4],
    distance: i64,
    occlusion: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelationLabel {
    Distance,
    Occlusion,
    Both,
}

impl RelationLabel {
    fn agrees(self, pred: &PredictionRow, gt: &GroundTruthRelation) -> bool {
        match self {
            Self::Distance => pred.distance == gt.distance,
            Self::Occlusion => pred.occlusion == gt.occlusion,
            Self::Both => pred.distance == gt.distance && pred.occlusion == gt.occlusion,
        }
    }
}

/// Recall numbers for one prediction table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationMetrics {
    pub distance_recall: f32,
    pub occlusion_recall: f32,
    pub joint_recall: f32,
    /// Pairs localized with correct entity names, ignoring relation labels.
    pub pair_recall: f32,
    pub num_gt: usize,
    pub num_predictions: usize,
}

pub struct RelationEvaluator {
    gt_by_image: HashMap<String, Vec<GroundTruthRelation>>,
    iou_threshold: f32,
}

impl RelationEvaluator {
    pub fn new(images: &[ImageAnnotation], classes: &RelationClasses) -> Self {
        let mut gt_by_image: HashMap<String, Vec<GroundTruthRelation>> = HashMap::new();
        for image in images {
            let entry = gt_by_image.entry(image.image_id.clone()).or_default();
            for (sub, obj, rel) in image.relations() {
                entry.push(GroundTruthRelation {
                    subject: classes.entity_name(sub.category_id),
                    object: classes.entity_name(obj.category_id),
                    subject_box: sub.bbox,
                    object_box: obj.bbox,
                    distance: rel.distance as i64,
                    occlusion: rel.occlusion as i64,
                });
            }
        }
        Self {
            gt_by_image,
            iou_threshold: 0.5,
        }
    }

    pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    pub fn num_gt(&self) -> usize {
        self.gt_by_image.values().map(Vec::len).sum()
    }

    fn localized(&self, pred: &PredictionRow, gt: &GroundTruthRelation) -> bool {
        pred.entity_1 == gt.subject
            && pred.entity_2 == gt.object
            && box_iou(pred.box_1(), gt.subject_box) >= self.iou_threshold
            && box_iou(pred.box_2(), gt.object_box) >= self.iou_threshold
    }

    fn hits(
        &self,
        preds_by_image: &HashMap<&str, Vec<&PredictionRow>>,
        label: Option<RelationLabel>,
    ) -> usize {
        let mut hits = 0;
        for (image_id, gts) in &self.gt_by_image {
            let Some(preds) = preds_by_image.get(image_id.as_str()) else {
                continue;
            };
            let mut used = vec![false; preds.len()];
            for gt in gts {
                let found = preds.iter().enumerate().position(|(i, pred)| {
                    !used[i]
                        && self.localized(pred, gt)
                        && label.is_none_or(|label| label.agrees(pred, gt))
                });
                if let Some(i) = found {
                    used[i] = true;
                    hits += 1;
                }
            }
        }
        hits
    }

    pub fn evaluate(&self, predictions: &PredictionTable) -> RelationMetrics {
        let num_gt = self.num_gt();
        tracing::info!(
            images = self.gt_by_image.len(),
            relations = num_gt,
            predictions = predictions.len(),
            "running relation evaluation"
        );

        // Relations are stored per image in the subject's image id column.
        let mut preds_by_image: HashMap<&str, Vec<&PredictionRow>> = HashMap::new();
        for row in &predictions.rows {
            preds_by_image
                .entry(row.image_id_1.as_str())
                .or_default()
                .push(row);
        }

        let recall = |hits: usize| {
            if num_gt == 0 {
                0.0
            } else {
                hits as f32 / num_gt as f32
            }
        };

        RelationMetrics {
            distance_recall: recall(self.hits(&preds_by_image, Some(RelationLabel::Distance))),
            occlusion_recall: recall(self.hits(&preds_by_image, Some(RelationLabel::Occlusion))),
            joint_recall: recall(self.hits(&preds_by_image, Some(RelationLabel::Both))),
            pair_recall: recall(self.hits(&preds_by_image, None)),
            num_gt,
            num_predictions: predictions.len(),
        }
    }

    pub fn print_summary(metrics: &RelationMetrics) {
        println!();
        println!(
            " Relation Recall @[ IoU=0.50 | label=  distance ] = {:.3}",
            metrics.distance_recall
        );
        println!(
            " Relation Recall @[ IoU=0.50 | label= occlusion ] = {:.3}",
            metrics.occlusion_recall
        );
        println!(
            " Relation Recall @[ IoU=0.50 | label=      both ] = {:.3}",
            metrics.joint_recall
        );
        println!(
            " Pair Recall     @[ IoU=0.50 | label=      none ] = {:.3}",
            metrics.pair_recall
        );
        println!(
            " ({} ground-truth relations, {} predictions)",
            metrics.num_gt, metrics.num_predictions
        );
    }
}
