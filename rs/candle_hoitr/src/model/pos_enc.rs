//! Position embeddings for the image features
//!
//! Two variants are available:
//! - sine: the DETR formula. Positions are cumulative counts of valid
//!   (non-padding) pixels, normalized to [0, 2π] per image.
//! - learned: row and column embedding tables of 50 entries each.
//!
//! Output shape: [batch_size, hidden_dim, height, width]

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, Init, VarBuilder};

use crate::config::PositionEmbeddingKind;

/// Configuration for sinusoidal position embedding
#[derive(Debug, Clone)]
pub struct PositionEmbeddingSineConfig {
    /// Number of position features per axis (hidden_dim / 2)
    pub num_pos_feats: usize,
    /// Temperature for the frequency scaling
    pub temperature: f64,
    /// Whether to normalize positions to [0, scale] range
    pub normalize: bool,
    /// Scale factor for normalization
    pub scale: f64,
}

impl PositionEmbeddingSineConfig {
    pub fn new(hidden_dim: usize) -> Self {
        Self {
            num_pos_feats: hidden_dim / 2,
            temperature: 10000.0,
            normalize: true,
            scale: 2.0 * std::f64::consts::PI,
        }
    }
}

pub struct PositionEmbeddingSine {
    config: PositionEmbeddingSineConfig,
}

impl PositionEmbeddingSine {
    pub fn new(config: PositionEmbeddingSineConfig) -> Self {
        Self { config }
    }

    /// Compute the embedding from a [B, H, W] u8 padding mask (1 on padding)
    pub fn forward(&self, mask: &Tensor) -> Result<Tensor> {
        let (_, height, width) = mask.dims3()?;
        let not_mask = (1.0 - mask.to_dtype(DType::F32)?)?;
        let y_embed = not_mask.cumsum(1)?;
        let x_embed = not_mask.cumsum(2)?;

        let (y_embed, x_embed) = if self.config.normalize {
            let eps = 1e-6;
            let y_max = y_embed.narrow(1, height - 1, 1)?;
            let x_max = x_embed.narrow(2, width - 1, 1)?;
            (
                (y_embed.broadcast_div(&(y_max + eps)?)? * self.config.scale)?,
                (x_embed.broadcast_div(&(x_max + eps)?)? * self.config.scale)?,
            )
        } else {
            (y_embed, x_embed)
        };

        let dim_t = self.create_dim_tensor(mask.device())?;

        // [B, H, W, 1] / [F] -> [B, H, W, F]
        let pos_y = interleave_sin_cos(&y_embed.unsqueeze(3)?.broadcast_div(&dim_t)?)?;
        let pos_x = interleave_sin_cos(&x_embed.unsqueeze(3)?.broadcast_div(&dim_t)?)?;

        Tensor::cat(&[&pos_y, &pos_x], 3)?.permute((0, 3, 1, 2))
    }

    /// dim_t[i] = temperature ** (2 * (i // 2) / num_pos_feats)
    fn create_dim_tensor(&self, device: &Device) -> Result<Tensor> {
        let n = self.config.num_pos_feats;
        let values: Vec<f32> = (0..n)
            .map(|i| {
                let exponent = 2.0 * ((i / 2) as f64) / (n as f64);
                self.config.temperature.powf(exponent) as f32
            })
            .collect();
        Tensor::from_vec(values, n, device)
    }
}

/// sin on even features, cos on odd features, keeping the interleaved order
fn interleave_sin_cos(pos: &Tensor) -> Result<Tensor> {
    let dims = pos.dims().to_vec();
    let last = dims[dims.len() - 1];
    let mut pairs = dims.clone();
    pairs.pop();
    pairs.extend([last / 2, 2]);
    let pos = pos.reshape(pairs)?;
    let sin = pos.narrow(D::Minus1, 0, 1)?.sin()?;
    let cos = pos.narrow(D::Minus1, 1, 1)?.cos()?;
    Tensor::cat(&[sin, cos], D::Minus1)?.reshape(dims)
}

/// Absolute learned position embedding
pub struct PositionEmbeddingLearned {
    row_embed: Embedding,
    col_embed: Embedding,
}

impl PositionEmbeddingLearned {
    pub fn load(num_pos_feats: usize, vb: VarBuilder) -> Result<Self> {
        let init = Init::Uniform { lo: 0.0, up: 1.0 };
        let row = vb.get_with_hints((50, num_pos_feats), "row_embed.weight", init)?;
        let col = vb.get_with_hints((50, num_pos_feats), "col_embed.weight", init)?;
        Ok(Self {
            row_embed: Embedding::new(row, num_pos_feats),
            col_embed: Embedding::new(col, num_pos_feats),
        })
    }

    pub fn forward(&self, mask: &Tensor) -> Result<Tensor> {
        let (b, h, w) = mask.dims3()?;
        let device = mask.device();
        let x_emb = self.col_embed.forward(&Tensor::arange(0u32, w as u32, device)?)?;
        let y_emb = self.row_embed.forward(&Tensor::arange(0u32, h as u32, device)?)?;
        let f = x_emb.dim(1)?;
        let x_emb = x_emb.unsqueeze(0)?.broadcast_as((h, w, f))?;
        let y_emb = y_emb.unsqueeze(1)?.broadcast_as((h, w, f))?;
        Tensor::cat(&[x_emb, y_emb], D::Minus1)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .broadcast_as((b, 2 * f, h, w))?
            .contiguous()
    }
}

pub enum PositionEmbedding {
    Sine(PositionEmbeddingSine),
    Learned(PositionEmbeddingLearned),
}

impl PositionEmbedding {
    pub fn load(kind: PositionEmbeddingKind, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            PositionEmbeddingKind::Sine => PositionEmbedding::Sine(PositionEmbeddingSine::new(
                PositionEmbeddingSineConfig::new(hidden_dim),
            )),
            PositionEmbeddingKind::Learned => PositionEmbedding::Learned(
                PositionEmbeddingLearned::load(hidden_dim / 2, vb)?,
            ),
        })
    }

    pub fn forward(&self, mask: &Tensor) -> Result<Tensor> {
        match self {
            PositionEmbedding::Sine(p) => p.forward(mask),
            PositionEmbedding::Learned(p) => p.forward(mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn sine() -> PositionEmbeddingSine {
        PositionEmbeddingSine::new(PositionEmbeddingSineConfig::new(16))
    }

    #[test]
    fn test_sine_shape_and_range() {
        let device = Device::Cpu;
        let mask = Tensor::zeros((2, 4, 5), DType::U8, &device).unwrap();
        let pos = sine().forward(&mask).unwrap();
        assert_eq!(pos.dims(), &[2, 16, 4, 5]);
        let max = pos.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0 + 1e-6);
    }

    #[test]
    fn test_sine_first_feature_is_normalized_row() {
        let device = Device::Cpu;
        let mask = Tensor::zeros((1, 2, 1), DType::U8, &device).unwrap();
        // [F, H, W]; features 0 and 1 are sin(y) and cos(y), y = (row + 1) / H * 2π
        let pos = sine()
            .forward(&mask)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec3::<f32>()
            .unwrap();
        assert!(pos[0][0][0].abs() < 1e-4);
        assert!((pos[1][0][0] + 1.0).abs() < 1e-4);
        assert!((pos[1][1][0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_sine_ignores_padding() {
        let device = Device::Cpu;
        // Second image is padded on its last column
        let mask = Tensor::new(&[[[0u8, 0, 0]], [[0, 0, 1]]], &device).unwrap();
        let pos = sine().forward(&mask).unwrap();
        // x feature 0 at the last valid column is sin(2π) for both images
        let x0 = pos.narrow(1, 8, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((x0[2] - 0.0).abs() < 1e-4);
        assert!((x0[4] - 0.0).abs() < 1e-4);
    }

    #[test]
    fn test_learned_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pos = PositionEmbedding::load(PositionEmbeddingKind::Learned, 8, vb).unwrap();
        let mask = Tensor::zeros((2, 3, 4), DType::U8, &device).unwrap();
        assert_eq!(pos.forward(&mask).unwrap().dims(), &[2, 8, 3, 4]);
    }
}
