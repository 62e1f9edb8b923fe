//! Relation datasets, sampling and batching.

pub mod dataset;
pub mod loader;
pub mod sampler;
pub mod transforms;

use candle_core::{DType, Device, Result, Tensor};

pub use dataset::VrdDataset;
pub use loader::DataLoader;
pub use sampler::{BatchSampler, Sampler};

/// Ground truth for one image, one entry per relation.
///
/// Boxes are normalized [cx, cy, w, h] relative to the transformed image size.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub sub_labels: Vec<u32>,
    pub obj_labels: Vec<u32>,
    pub sub_boxes: Vec<[f32; 4]>,
    pub obj_boxes: Vec<[f32; 4]>,
    pub distance_labels: Vec<u32>,
    pub occlusion_labels: Vec<u32>,
    pub image_id: String,
    /// (height, width) of the image on disk
    pub orig_size: (usize, usize),
    /// (height, width) after the transforms
    pub size: (usize, usize),
    pub num_bounding_boxes_in_ground_truth: usize,
}

impl Target {
    pub fn num_relations(&self) -> usize {
        self.sub_labels.len()
    }

    /// Move the tensor fields to the device. Bookkeeping fields stay on the host.
    pub fn to_device(&self, device: &Device) -> Result<DeviceTarget> {
        let n = self.num_relations();
        let labels = |v: &[u32]| Tensor::from_slice(v, n, device);
        let boxes = |v: &[[f32; 4]]| {
            let flat: Vec<f32> = v.iter().flatten().copied().collect();
            Tensor::from_vec(flat, (n, 4), device)
        };
        Ok(DeviceTarget {
            sub_labels: labels(&self.sub_labels)?,
            obj_labels: labels(&self.obj_labels)?,
            distance_labels: labels(&self.distance_labels)?,
            occlusion_labels: labels(&self.occlusion_labels)?,
            sub_boxes: boxes(&self.sub_boxes)?,
            obj_boxes: boxes(&self.obj_boxes)?,
            num_relations: n,
        })
    }
}

/// Target tensors consumed by the losses
#[derive(Debug, Clone)]
pub struct DeviceTarget {
    /// [T] u32
    pub sub_labels: Tensor,
    pub obj_labels: Tensor,
    pub distance_labels: Tensor,
    pub occlusion_labels: Tensor,
    /// [T, 4] normalized cxcywh
    pub sub_boxes: Tensor,
    pub obj_boxes: Tensor,
    pub num_relations: usize,
}

pub fn targets_to_device(targets: &[Target], device: &Device) -> Result<Vec<DeviceTarget>> {
    targets.iter().map(|t| t.to_device(device)).collect()
}

/// Padded image batch
#[derive(Debug, Clone)]
pub struct ImageBatch {
    /// [B, 3, H, W]
    pub tensor: Tensor,
    /// [B, H, W] u8, 1 on padding
    pub mask: Tensor,
}

impl ImageBatch {
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            tensor: self.tensor.to_device(device)?,
            mask: self.mask.to_device(device)?,
        })
    }
}

/// Pad images to the largest height and width of the batch and build the mask
pub fn collate(images: &[Tensor]) -> Result<ImageBatch> {
    if images.is_empty() {
        candle_core::bail!("cannot collate an empty batch");
    }
    let device = images[0].device();
    let mut max_h = 0;
    let mut max_w = 0;
    for img in images {
        let (_, h, w) = img.dims3()?;
        max_h = max_h.max(h);
        max_w = max_w.max(w);
    }

    let mut padded = Vec::with_capacity(images.len());
    let mut mask = vec![1u8; images.len() * max_h * max_w];
    for (b, img) in images.iter().enumerate() {
        let (_, h, w) = img.dims3()?;
        padded.push(img.pad_with_zeros(1, 0, max_h - h)?.pad_with_zeros(2, 0, max_w - w)?);
        for y in 0..h {
            let row = b * max_h * max_w + y * max_w;
            mask[row..row + w].fill(0);
        }
    }

    Ok(ImageBatch {
        tensor: Tensor::stack(&padded, 0)?.to_dtype(DType::F32)?,
        mask: Tensor::from_vec(mask, (images.len(), max_h, max_w), device)?,
    })
}
