//! 2.5D visual relationship tooling.
//!
//! This crate provides functionality to:
//! - Load relation annotations (entity boxes plus subject/object relation pairs)
//! - Name entity, distance and occlusion classes
//! - Write/read relation prediction tables in CSV form
//! - Score prediction tables against ground truth (relation recall)

pub mod annotations;
pub mod classes;
pub mod eval;
pub mod predictions;

pub use annotations::{load_annotations, EntityAnnotation, ImageAnnotation, RelationAnnotation};
pub use classes::RelationClasses;
pub use eval::{RelationEvaluator, RelationMetrics};
pub use predictions::{read_predictions, PredictionRow, PredictionTable};

/// Errors raised while reading or writing relation data.
#[derive(Debug, thiserror::Error)]
pub enum VrdError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid annotation json in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}:{line}: {message}")]
    Csv {
        path: String,
        line: usize,
        message: String,
    },
    #[error("relation {relation} of image {image_id} references missing entity {entity}")]
    MissingEntity {
        image_id: String,
        relation: usize,
        entity: usize,
    },
}

pub type Result<T> = std::result::Result<T, VrdError>;

/// Convert box from [cx, cy, w, h] to [x1, y1, x2, y2].
pub fn cxcywh_to_xyxy(b: [f32; 4]) -> [f32; 4] {
    let [cx, cy, w, h] = b;
    [cx - 0.5 * w, cy - 0.5 * h, cx + 0.5 * w, cy + 0.5 * h]
}

/// Convert box from [x1, y1, x2, y2] to [cx, cy, w, h].
pub fn xyxy_to_cxcywh(b: [f32; 4]) -> [f32; 4] {
    let [x1, y1, x2, y2] = b;
    [(x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1]
}

/// Area of an xyxy box, zero for degenerate boxes.
pub fn box_area(b: [f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

/// Compute IoU between two boxes in xyxy format.
pub fn box_iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    let union = box_area(a) + box_area(b) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
