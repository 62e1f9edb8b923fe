//! Relation output structure
//!
//! This module defines the RelationPrediction struct that represents a single
//! predicted subject / object pair with its distance and occlusion relation.

use vrdtools::{PredictionRow, RelationClasses};

/// A single relation prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationPrediction {
    /// Subject box in [x1, y1, x2, y2] format, in pixels of the original image
    pub sub_bbox: [f32; 4],
    /// Object box in [x1, y1, x2, y2] format
    pub obj_bbox: [f32; 4],
    pub sub_class: usize,
    pub obj_class: usize,
    pub distance: usize,
    pub occlusion: usize,
    /// p_sub * p_obj * p_distance
    pub score: f32,
}

impl RelationPrediction {
    /// Pixel [x1, y1, x2, y2] box from a normalized [cx, cy, w, h] box
    ///
    /// # Arguments
    /// * `cxcywh` - Normalized box
    /// * `size` - (height, width) of the original image
    pub fn denormalize(cxcywh: [f32; 4], size: (usize, usize)) -> [f32; 4] {
        let (h, w) = (size.0 as f32, size.1 as f32);
        let [x1, y1, x2, y2] = vrdtools::cxcywh_to_xyxy(cxcywh);
        [x1 * w, y1 * h, x2 * w, y2 * h]
    }

    /// Row of the evaluation table; both entities belong to `image_id`
    pub fn to_row(&self, image_id: &str, classes: &RelationClasses) -> PredictionRow {
        PredictionRow {
            image_id_1: image_id.to_string(),
            entity_1: classes.entity_name(self.sub_class),
            xmin_1: self.sub_bbox[0],
            xmax_1: self.sub_bbox[2],
            ymin_1: self.sub_bbox[1],
            ymax_1: self.sub_bbox[3],
            image_id_2: image_id.to_string(),
            entity_2: classes.entity_name(self.obj_class),
            xmin_2: self.obj_bbox[0],
            xmax_2: self.obj_bbox[2],
            ymin_2: self.obj_bbox[1],
            ymax_2: self.obj_bbox[3],
            occlusion: self.occlusion as i64,
            distance: self.distance as i64,
        }
    }

    /// Display with class names
    pub fn describe(&self, classes: &RelationClasses) -> String {
        format!(
            "{} --[{}, {}]--> {} ({:.3})",
            classes.entity_name(self.sub_class),
            classes.distance_name(self.distance),
            classes.occlusion_name(self.occlusion),
            classes.entity_name(self.obj_class),
            self.score
        )
    }
}
