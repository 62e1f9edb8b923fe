//! 2.5D relation dataset
//!
//! Expected layout under the data root:
//!
//! ```text
//! annotations/{train,valid,test}.json
//! images/{train,valid,test}/<file_name>
//! ```

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, SeedableRng};
use vrdtools::{load_annotations, xyxy_to_cxcywh, ImageAnnotation};

use crate::config::HoiTrConfig;

use super::transforms::{image_to_tensor, Transforms};
use super::Target;

#[derive(Debug)]
pub struct VrdDataset {
    pub image_set: String,
    image_dir: PathBuf,
    images: Vec<ImageAnnotation>,
    transforms: Transforms,
}

impl VrdDataset {
    /// Load the annotations of `image_set` (`train`, `valid` or `test`).
    ///
    /// Training uses random flip and multi-scale resize, the other splits
    /// resize to `test_scale`.
    pub fn build(
        image_set: &str,
        data_path: &Path,
        test_scale: usize,
        config: &HoiTrConfig,
    ) -> anyhow::Result<Self> {
        let ann_file = data_path.join("annotations").join(format!("{image_set}.json"));
        if !ann_file.exists() {
            anyhow::bail!(
                "annotation file {:?} not found, expected <data-path>/annotations/{}.json",
                ann_file,
                image_set
            );
        }
        let images = load_annotations(&ann_file)?;
        check_labels(&images, config)?;
        let transforms = if image_set == "train" {
            Transforms::train()
        } else {
            Transforms::eval(test_scale)
        };
        tracing::info!(
            image_set,
            images = images.len(),
            relations = images.iter().map(|i| i.hoi_annotation.len()).sum::<usize>(),
            "built dataset"
        );
        Ok(Self {
            image_set: image_set.to_string(),
            image_dir: data_path.join("images").join(image_set),
            images,
            transforms,
        })
    }

    /// Dataset over in-memory annotations, used by tests
    pub fn from_parts(
        image_set: &str,
        image_dir: PathBuf,
        images: Vec<ImageAnnotation>,
        transforms: Transforms,
    ) -> Self {
        Self {
            image_set: image_set.to_string(),
            image_dir,
            images,
            transforms,
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn annotation(&self, index: usize) -> Option<&ImageAnnotation> {
        self.images.get(index)
    }

    /// Load and transform one sample on the CPU.
    ///
    /// `seed` drives the random augmentations of this sample.
    pub fn get(&self, index: usize, seed: u64) -> anyhow::Result<(Tensor, Target)> {
        let ann = self
            .images
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("index {index} out of range for {}", self.image_set))?;
        let path = self.image_dir.join(&ann.file_name);
        let img = image::open(&path)
            .map_err(|e| anyhow::anyhow!("failed to open {:?}: {e}", path))?;
        let image = image_to_tensor(&img, &Device::Cpu)?;
        let (_, orig_h, orig_w) = image.dims3()?;

        let mut boxes: Vec<[f32; 4]> = ann.annotations.iter().map(|a| a.bbox).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        let image = self.transforms.apply(&image, &mut boxes, &mut rng)?;
        let (_, h, w) = image.dims3()?;

        let target = build_target(ann, &boxes, (orig_h, orig_w), (h, w));
        Ok((image, target))
    }
}

/// Reject labels the heads of `config` cannot represent
fn check_labels(images: &[ImageAnnotation], config: &HoiTrConfig) -> anyhow::Result<()> {
    for image in images {
        if let Some(ann) = image
            .annotations
            .iter()
            .find(|a| a.category_id >= config.num_entity_classes)
        {
            anyhow::bail!(
                "image {} has entity class {} but the model has {} classes",
                image.image_id,
                ann.category_id,
                config.num_entity_classes
            );
        }
        for rel in &image.hoi_annotation {
            if rel.distance >= config.num_distance_classes {
                anyhow::bail!(
                    "image {} has distance label {} but the model has {} distance classes",
                    image.image_id,
                    rel.distance,
                    config.num_distance_classes
                );
            }
            if rel.occlusion >= config.num_occlusion_classes {
                anyhow::bail!(
                    "image {} has occlusion label {} but the model has {} occlusion classes",
                    image.image_id,
                    rel.occlusion,
                    config.num_occlusion_classes
                );
            }
        }
    }
    Ok(())
}

/// Turn transformed pixel boxes into a relation target with normalized boxes
pub fn build_target(
    ann: &ImageAnnotation,
    boxes: &[[f32; 4]],
    orig_size: (usize, usize),
    size: (usize, usize),
) -> Target {
    let (h, w) = (size.0 as f32, size.1 as f32);
    let normalized = |b: [f32; 4]| {
        let clamped = [
            b[0].clamp(0.0, w),
            b[1].clamp(0.0, h),
            b[2].clamp(0.0, w),
            b[3].clamp(0.0, h),
        ];
        let [cx, cy, bw, bh] = xyxy_to_cxcywh(clamped);
        [cx / w, cy / h, bw / w, bh / h]
    };

    let mut target = Target {
        sub_labels: Vec::new(),
        obj_labels: Vec::new(),
        sub_boxes: Vec::new(),
        obj_boxes: Vec::new(),
        distance_labels: Vec::new(),
        occlusion_labels: Vec::new(),
        image_id: ann.image_id.clone(),
        orig_size,
        size,
        num_bounding_boxes_in_ground_truth: ann.annotations.len(),
    };
    for rel in &ann.hoi_annotation {
        let (Some(sub), Some(obj)) = (
            ann.annotations.get(rel.subject_id),
            ann.annotations.get(rel.object_id),
        ) else {
            continue;
        };
        target.sub_labels.push(sub.category_id as u32);
        target.obj_labels.push(obj.category_id as u32);
        target.sub_boxes.push(normalized(boxes[rel.subject_id]));
        target.obj_boxes.push(normalized(boxes[rel.object_id]));
        target.distance_labels.push(rel.distance as u32);
        target.occlusion_labels.push(rel.occlusion as u32);
    }
    target
}
