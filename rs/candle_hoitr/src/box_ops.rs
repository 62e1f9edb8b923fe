//! Box utilities on tensors.
//!
//! Boxes are stored along the last dimension, either as normalized
//! [cx, cy, w, h] or as [x1, y1, x2, y2].

use candle_core::{Result, Tensor, D};

/// Convert [.., 4] boxes from (cx, cy, w, h) to (x1, y1, x2, y2)
pub fn box_cxcywh_to_xyxy(boxes: &Tensor) -> Result<Tensor> {
    let cx = boxes.narrow(D::Minus1, 0, 1)?;
    let cy = boxes.narrow(D::Minus1, 1, 1)?;
    let w = boxes.narrow(D::Minus1, 2, 1)?;
    let h = boxes.narrow(D::Minus1, 3, 1)?;
    let half_w = (w * 0.5)?;
    let half_h = (h * 0.5)?;
    Tensor::cat(
        &[
            (&cx - &half_w)?,
            (&cy - &half_h)?,
            (&cx + &half_w)?,
            (&cy + &half_h)?,
        ],
        D::Minus1,
    )
}

fn area(boxes: &Tensor) -> Result<Tensor> {
    let w = (boxes.narrow(D::Minus1, 2, 1)? - boxes.narrow(D::Minus1, 0, 1)?)?;
    let h = (boxes.narrow(D::Minus1, 3, 1)? - boxes.narrow(D::Minus1, 1, 1)?)?;
    w.mul(&h)?.squeeze(D::Minus1)
}

/// Generalized IoU between broadcast-compatible [.., 4] xyxy boxes
///
/// Returns a tensor with the last dimension removed.
pub fn generalized_box_iou_broadcast(boxes1: &Tensor, boxes2: &Tensor) -> Result<Tensor> {
    let area1 = area(boxes1)?;
    let area2 = area(boxes2)?;

    let lt = boxes1
        .narrow(D::Minus1, 0, 2)?
        .broadcast_maximum(&boxes2.narrow(D::Minus1, 0, 2)?)?;
    let rb = boxes1
        .narrow(D::Minus1, 2, 2)?
        .broadcast_minimum(&boxes2.narrow(D::Minus1, 2, 2)?)?;
    let wh = (rb - lt)?.relu()?;
    let inter = wh
        .narrow(D::Minus1, 0, 1)?
        .mul(&wh.narrow(D::Minus1, 1, 1)?)?
        .squeeze(D::Minus1)?;
    let union = (area1.broadcast_add(&area2)? - &inter)?;
    let iou = inter.div(&union)?;

    // Smallest enclosing box
    let lt = boxes1
        .narrow(D::Minus1, 0, 2)?
        .broadcast_minimum(&boxes2.narrow(D::Minus1, 0, 2)?)?;
    let rb = boxes1
        .narrow(D::Minus1, 2, 2)?
        .broadcast_maximum(&boxes2.narrow(D::Minus1, 2, 2)?)?;
    let wh = (rb - lt)?.relu()?;
    let enclosing = wh
        .narrow(D::Minus1, 0, 1)?
        .mul(&wh.narrow(D::Minus1, 1, 1)?)?
        .squeeze(D::Minus1)?;

    iou - ((&enclosing - &union)? / enclosing)?
}

/// Pairwise generalized IoU: [N, 4] x [M, 4] -> [N, M]
pub fn generalized_box_iou(boxes1: &Tensor, boxes2: &Tensor) -> Result<Tensor> {
    generalized_box_iou_broadcast(&boxes1.unsqueeze(1)?, &boxes2.unsqueeze(0)?)
}

/// Pairwise L1 distance: [N, 4] x [M, 4] -> [N, M]
pub fn cdist_l1(boxes1: &Tensor, boxes2: &Tensor) -> Result<Tensor> {
    boxes1
        .unsqueeze(1)?
        .broadcast_sub(&boxes2.unsqueeze(0)?)?
        .abs()?
        .sum(D::Minus1)
}
