//! Image transforms for training and evaluation
//!
//! Images are handled as CHW tensors with values in [0, 1]. Entity boxes are
//! pixel [x1, y1, x2, y2] and follow every geometric transform.

use candle_core::{Device, Result, Tensor};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng};

/// ImageNet normalization mean values (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Shortest-side sizes sampled during training
pub const TRAIN_SCALES: [usize; 11] = [480, 512, 544, 576, 608, 640, 672, 704, 736, 768, 800];

/// Upper bound on the longest side
pub const MAX_SIZE: usize = 1333;

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let (h, w) = (height as usize, width as usize);
    let data: Vec<f32> = img.into_raw().iter().map(|&x| x as f32 / 255.0).collect();
    // HWC -> CHW
    Tensor::from_vec(data, (h, w, 3), device)?.permute((2, 0, 1))?.contiguous()
}

/// Normalize a [3, H, W] tensor with ImageNet mean and std
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?;
    tensor.broadcast_sub(&mean)?.broadcast_div(&std)
}

/// Bilinear resize of a [3, H, W] tensor to (height, width)
pub fn resize(tensor: &Tensor, target_size: (usize, usize)) -> Result<Tensor> {
    let (target_h, target_w) = target_size;
    tensor
        .unsqueeze(0)?
        .upsample_bilinear2d(target_h, target_w, false)?
        .squeeze(0)
}

/// Output (height, width) so that the shortest side is `size` while the
/// longest side stays within `max_size`.
pub fn get_size(height: usize, width: usize, size: usize, max_size: usize) -> (usize, usize) {
    let (h, w) = (height as f64, width as f64);
    let min_side = h.min(w);
    let max_side = h.max(w);
    let mut size = size as f64;
    if max_side / min_side * size > max_size as f64 {
        size = (max_size as f64 * min_side / max_side).round();
    }
    let size_u = size as usize;
    if (width <= height && width == size_u) || (height <= width && height == size_u) {
        return (height, width);
    }
    if width < height {
        ((size * h / w) as usize, size_u)
    } else {
        (size_u, (size * w / h) as usize)
    }
}

/// Mirror the image left-right
pub fn hflip(image: &Tensor, boxes: &mut [[f32; 4]]) -> Result<Tensor> {
    let (_, _, w) = image.dims3()?;
    let reversed: Vec<u32> = (0..w as u32).rev().collect();
    let reversed = Tensor::from_vec(reversed, w, image.device())?;
    for b in boxes.iter_mut() {
        let [x1, y1, x2, y2] = *b;
        *b = [w as f32 - x2, y1, w as f32 - x1, y2];
    }
    image.index_select(&reversed, 2)
}

/// Resize so the shortest side equals `size`, scaling the boxes along
pub fn resize_with_boxes(
    image: &Tensor,
    boxes: &mut [[f32; 4]],
    size: usize,
    max_size: usize,
) -> Result<Tensor> {
    let (_, h, w) = image.dims3()?;
    let (oh, ow) = get_size(h, w, size, max_size);
    if (oh, ow) == (h, w) {
        return Ok(image.clone());
    }
    let ratio_w = ow as f32 / w as f32;
    let ratio_h = oh as f32 / h as f32;
    for b in boxes.iter_mut() {
        *b = [b[0] * ratio_w, b[1] * ratio_h, b[2] * ratio_w, b[3] * ratio_h];
    }
    resize(image, (oh, ow))
}

/// Transform pipeline for a split
#[derive(Debug, Clone)]
pub enum Transforms {
    /// Random horizontal flip then random multi-scale resize
    Train { scales: Vec<usize>, max_size: usize },
    /// Fixed shortest-side resize
    Eval { scale: usize, max_size: usize },
}

impl Transforms {
    pub fn train() -> Self {
        Transforms::Train {
            scales: TRAIN_SCALES.to_vec(),
            max_size: MAX_SIZE,
        }
    }

    pub fn eval(scale: usize) -> Self {
        Transforms::Eval {
            scale,
            max_size: MAX_SIZE,
        }
    }

    /// Apply to a [3, H, W] image in [0, 1]; returns the normalized image.
    pub fn apply(&self, image: &Tensor, boxes: &mut [[f32; 4]], rng: &mut StdRng) -> Result<Tensor> {
        let image = match self {
            Transforms::Train { scales, max_size } => {
                let image = if rng.random_bool(0.5) {
                    hflip(image, boxes)?
                } else {
                    image.clone()
                };
                let size = scales[rng.random_range(0..scales.len())];
                resize_with_boxes(&image, boxes, size, *max_size)?
            }
            Transforms::Eval { scale, max_size } => {
                resize_with_boxes(image, boxes, *scale, *max_size)?
            }
        };
        normalize(&image)
    }
}
