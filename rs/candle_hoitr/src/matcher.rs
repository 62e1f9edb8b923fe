//! Bipartite matching between queries and target relations.

use candle_core::{DType, Result, Tensor, D};

use crate::box_ops::{box_cxcywh_to_xyxy, cdist_l1, generalized_box_iou};
use crate::config::MatcherConfig;
use crate::data::DeviceTarget;
use crate::model::HoiOutputs;

/// Matched (query, target) index pairs of one image, sorted by query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMatch {
    pub queries: Vec<u32>,
    pub targets: Vec<u32>,
}

impl ImageMatch {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Minimum cost assignment on a row-major `rows x cols` cost matrix.
///
/// Returns `min(rows, cols)` (row, col) pairs sorted by row. Non-finite
/// costs are treated as a very large cost.
pub fn linear_sum_assignment(cost: &[f32], rows: usize, cols: usize) -> Vec<(usize, usize)> {
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    const LARGE: f64 = 1e12;
    let at = |r: usize, c: usize| {
        let v = cost[r * cols + c] as f64;
        if v.is_finite() {
            v
        } else {
            LARGE
        }
    };

    // Shortest augmenting paths with potentials, with n <= m
    let transposed = rows > cols;
    let (n, m) = if transposed { (cols, rows) } else { (rows, cols) };
    let a = |i: usize, j: usize| if transposed { at(j, i) } else { at(i, j) };

    let mut u = vec![0f64; n + 1];
    let mut v = vec![0f64; m + 1];
    // p[j]: row (1-based) assigned to column j, 0 when free
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];
    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = a(i0 - 1, j - 1) - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| p[j] != 0)
        .map(|j| {
            if transposed {
                (j - 1, p[j] - 1)
            } else {
                (p[j] - 1, j - 1)
            }
        })
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Per-image pairwise cost terms between queries and targets, each [Q, T]
pub struct PairwiseCosts {
    /// -(p_sub + p_obj + p_distance + p_occlusion) at the target labels
    pub class: Tensor,
    /// L1 distance of subject boxes plus L1 distance of object boxes
    pub bbox: Tensor,
    /// -(GIoU_sub + GIoU_obj)
    pub giou: Tensor,
}

fn label_probabilities(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    candle_nn::ops::softmax_last_dim(logits)?.index_select(labels, 1)
}

/// Cost terms of one image, `outputs` holding the [Q, ·] predictions of that image
pub fn pairwise_costs(outputs: &HoiOutputs, target: &DeviceTarget) -> Result<PairwiseCosts> {
    let class = (label_probabilities(&outputs.pred_sub_logits, &target.sub_labels)?
        + label_probabilities(&outputs.pred_obj_logits, &target.obj_labels)?
        + label_probabilities(&outputs.pred_distance_logits, &target.distance_labels)?
        + label_probabilities(&outputs.pred_occlusion_logits, &target.occlusion_labels)?)?
    .neg()?;

    let bbox = (cdist_l1(&outputs.pred_sub_boxes, &target.sub_boxes)?
        + cdist_l1(&outputs.pred_obj_boxes, &target.obj_boxes)?)?;

    let giou = (generalized_box_iou(
        &box_cxcywh_to_xyxy(&outputs.pred_sub_boxes)?,
        &box_cxcywh_to_xyxy(&target.sub_boxes)?,
    )? + generalized_box_iou(
        &box_cxcywh_to_xyxy(&outputs.pred_obj_boxes)?,
        &box_cxcywh_to_xyxy(&target.obj_boxes)?,
    )?)?
    .neg()?;

    Ok(PairwiseCosts { class, bbox, giou })
}

/// Hungarian matcher between predicted and ground-truth relations
#[derive(Debug, Clone, Copy)]
pub struct HungarianMatcher {
    config: MatcherConfig,
}

impl HungarianMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Weighted total cost [Q, T] of one image
    pub fn cost_matrix(&self, outputs: &HoiOutputs, target: &DeviceTarget) -> Result<Tensor> {
        let costs = pairwise_costs(outputs, target)?;
        (costs.class * self.config.set_cost_class as f64)?
            + (costs.bbox * self.config.set_cost_bbox as f64)?
            + (costs.giou * self.config.set_cost_giou as f64)?
    }

    /// Match every image of the batch. No gradient flows through the matching.
    pub fn forward(&self, outputs: &HoiOutputs, targets: &[DeviceTarget]) -> Result<Vec<ImageMatch>> {
        let outputs = outputs.detach();
        let num_queries = outputs.num_queries()?;
        let mut matches = Vec::with_capacity(targets.len());
        for (b, target) in targets.iter().enumerate() {
            if target.num_relations == 0 {
                matches.push(ImageMatch::default());
                continue;
            }
            let cost = self
                .cost_matrix(&outputs.image(b)?, target)?
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            let pairs = linear_sum_assignment(&cost, num_queries, target.num_relations);
            matches.push(ImageMatch {
                queries: pairs.iter().map(|&(q, _)| q as u32).collect(),
                targets: pairs.iter().map(|&(_, t)| t as u32).collect(),
            });
        }
        Ok(matches)
    }
}

/// Argmax over the last dimension as host indices
pub fn argmax_last(t: &Tensor) -> Result<Vec<u32>> {
    t.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()
}
