//! Evaluate subcommand: relation recall of a predictions CSV.

use std::path::PathBuf;

use clap::Args;
use vrdtools::{load_annotations, read_predictions, RelationClasses, RelationEvaluator, RelationMetrics};

/// Arguments for the evaluate subcommand
#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// Predictions written by `train` or `test`.
    #[arg(long)]
    pub predictions: PathBuf,

    /// Ground-truth annotation JSON of the same split.
    #[arg(long)]
    pub annotations: PathBuf,

    /// JSON file with the entity and relation names used in the predictions.
    #[arg(long)]
    pub classes: Option<PathBuf>,

    /// Number of entity classes when no names file is given.
    #[arg(long, default_value_t = 602)]
    pub num_entity_classes: usize,

    /// Minimum IoU of both boxes with the ground truth.
    #[arg(long, default_value_t = 0.5)]
    pub iou_threshold: f32,

    /// Also write the metrics as JSON to this file.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

pub fn evaluate(args: &EvaluateArgs) -> anyhow::Result<RelationMetrics> {
    let classes = match &args.classes {
        Some(path) => RelationClasses::load(path)?,
        None => RelationClasses::numbered(args.num_entity_classes),
    };
    let images = load_annotations(&args.annotations)?;
    let predictions = read_predictions(&args.predictions)?;
    let evaluator =
        RelationEvaluator::new(&images, &classes).with_iou_threshold(args.iou_threshold);
    Ok(evaluator.evaluate(&predictions))
}

pub fn run(args: &EvaluateArgs) -> anyhow::Result<()> {
    println!("Predictions: {:?}", args.predictions);
    println!("Annotations: {:?}", args.annotations);
    let metrics = evaluate(args)?;
    RelationEvaluator::print_summary(&metrics);
    if let Some(path) = &args.output {
        std::fs::write(path, serde_json::to_string_pretty(&metrics)?)?;
        println!("Metrics saved to: {:?}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrdtools::{EntityAnnotation, ImageAnnotation, PredictionRow, PredictionTable, RelationAnnotation};

    #[test]
    fn test_evaluate_files() {
        let dir = tempfile::tempdir().unwrap();
        let images = vec![ImageAnnotation {
            file_name: "a.jpg".into(),
            image_id: "a".into(),
            width: 100,
            height: 100,
            annotations: vec![
                EntityAnnotation {
                    bbox: [0.0, 0.0, 10.0, 10.0],
                    category_id: 0,
                },
                EntityAnnotation {
                    bbox: [50.0, 50.0, 90.0, 90.0],
                    category_id: 1,
                },
            ],
            hoi_annotation: vec![RelationAnnotation {
                subject_id: 0,
                object_id: 1,
                distance: 2,
                occlusion: 0,
            }],
        }];
        let annotations = dir.path().join("valid.json");
        std::fs::write(&annotations, serde_json::to_string(&images).unwrap()).unwrap();

        let mut table = PredictionTable::new();
        table.push(PredictionRow {
            image_id_1: "a".into(),
            entity_1: "entity_0".into(),
            xmin_1: 0.0,
            xmax_1: 10.0,
            ymin_1: 0.0,
            ymax_1: 10.0,
            image_id_2: "a".into(),
            entity_2: "entity_1".into(),
            xmin_2: 50.0,
            xmax_2: 90.0,
            ymin_2: 50.0,
            ymax_2: 90.0,
            occlusion: 1,
            distance: 2,
        });
        let predictions = dir.path().join("predictions_valid_0.csv");
        table.write_csv(&predictions).unwrap();

        let args = EvaluateArgs {
            predictions,
            annotations,
            classes: None,
            num_entity_classes: 2,
            iou_threshold: 0.5,
            output: Some(dir.path().join("metrics.json")),
        };
        let metrics = evaluate(&args).unwrap();
        assert_eq!(metrics.distance_recall, 1.0);
        assert_eq!(metrics.occlusion_recall, 0.0);
        assert_eq!(metrics.joint_recall, 0.0);

        run(&args).unwrap();
        let saved: RelationMetrics =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("metrics.json")).unwrap())
                .unwrap();
        assert_eq!(saved, metrics);
    }
}
