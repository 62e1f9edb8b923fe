//! ResNet backbone with frozen batch norm
//!
//! Weight names follow torchvision (`conv1`, `bn1`, `layer{1..4}.{i}`,
//! `downsample.{0,1}`) so DETR checkpoints converted to safetensors load as is.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig, Init, VarBuilder};

use crate::config::BackboneKind;

/// Batch norm with fixed statistics and affine parameters
pub struct FrozenBatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
}

impl FrozenBatchNorm2d {
    pub fn load(num_features: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(num_features, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(num_features, "bias", Init::Const(0.0))?,
            running_mean: vb.get_with_hints(num_features, "running_mean", Init::Const(0.0))?,
            running_var: vb.get_with_hints(num_features, "running_var", Init::Const(1.0))?,
        })
    }
}

impl Module for FrozenBatchNorm2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let eps = 1e-5;
        let scale = self
            .weight
            .detach()
            .mul(&(self.running_var.detach() + eps)?.sqrt()?.recip()?)?;
        let bias = (self.bias.detach() - self.running_mean.detach().mul(&scale)?)?;
        let c = scale.dim(0)?;
        x.broadcast_mul(&scale.reshape((1, c, 1, 1))?)?
            .broadcast_add(&bias.reshape((1, c, 1, 1))?)
    }
}

/// Whether a backbone weight is never updated.
///
/// `name` is relative to the backbone body. Only layer2-4 convolutions train,
/// and only when the backbone learning rate is positive.
pub fn is_frozen(name: &str, train_backbone: bool) -> bool {
    let in_trained_stage = ["layer2", "layer3", "layer4"]
        .iter()
        .any(|stage| name.contains(stage));
    let is_norm = name.contains(".bn") || name.starts_with("bn") || name.contains("downsample.1");
    !train_backbone || !in_trained_stage || is_norm
}

struct ResidualBlock {
    convs: Vec<Conv2d>,
    norms: Vec<FrozenBatchNorm2d>,
    downsample: Option<(Conv2d, FrozenBatchNorm2d)>,
}

impl ResidualBlock {
    fn load(
        in_channels: usize,
        planes: usize,
        stride: usize,
        bottleneck: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let expansion = if bottleneck { 4 } else { 1 };
        let out_channels = planes * expansion;
        let conv = |k: usize, s: usize| Conv2dConfig {
            padding: k / 2,
            stride: s,
            ..Default::default()
        };

        // (in, out, kernel, stride) per conv; the stride sits on the 3x3 conv
        let layout = if bottleneck {
            vec![
                (in_channels, planes, 1, 1),
                (planes, planes, 3, stride),
                (planes, out_channels, 1, 1),
            ]
        } else {
            vec![(in_channels, planes, 3, stride), (planes, planes, 3, 1)]
        };

        let mut convs = Vec::with_capacity(layout.len());
        let mut norms = Vec::with_capacity(layout.len());
        for (i, (cin, cout, k, s)) in layout.into_iter().enumerate() {
            convs.push(conv2d_no_bias(cin, cout, k, conv(k, s), vb.pp(format!("conv{}", i + 1)))?);
            norms.push(FrozenBatchNorm2d::load(cout, vb.pp(format!("bn{}", i + 1)))?);
        }

        let downsample = if stride != 1 || in_channels != out_channels {
            Some((
                conv2d_no_bias(in_channels, out_channels, 1, conv(1, stride), vb.pp("downsample.0"))?,
                FrozenBatchNorm2d::load(out_channels, vb.pp("downsample.1"))?,
            ))
        } else {
            None
        };

        Ok(Self {
            convs,
            norms,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.clone();
        let last = self.convs.len() - 1;
        for (i, (conv, norm)) in self.convs.iter().zip(&self.norms).enumerate() {
            out = norm.forward(&conv.forward(&out)?)?;
            if i < last {
                out = out.relu()?;
            }
        }
        let identity = match &self.downsample {
            Some((conv, norm)) => norm.forward(&conv.forward(x)?)?,
            None => x.clone(),
        };
        (out + identity)?.relu()
    }
}

/// ResNet body returning the stride-32 feature map
pub struct Backbone {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    stages: Vec<Vec<ResidualBlock>>,
    pub num_channels: usize,
}

impl Backbone {
    pub fn load(kind: BackboneKind, vb: VarBuilder) -> Result<Self> {
        let body = vb.pp("body");
        let stem_cfg = Conv2dConfig {
            padding: 3,
            stride: 2,
            ..Default::default()
        };
        let conv1 = conv2d_no_bias(3, 64, 7, stem_cfg, body.pp("conv1"))?;
        let bn1 = FrozenBatchNorm2d::load(64, body.pp("bn1"))?;

        let bottleneck = kind.bottleneck();
        let expansion = if bottleneck { 4 } else { 1 };
        let mut in_channels = 64;
        let mut stages = Vec::with_capacity(4);
        for (stage, &num_blocks) in kind.stage_blocks().iter().enumerate() {
            let planes = 64 << stage;
            let stage_vb = body.pp(format!("layer{}", stage + 1));
            let mut blocks = Vec::with_capacity(num_blocks);
            for i in 0..num_blocks {
                let stride = if i == 0 && stage > 0 { 2 } else { 1 };
                blocks.push(ResidualBlock::load(
                    in_channels,
                    planes,
                    stride,
                    bottleneck,
                    stage_vb.pp(i.to_string()),
                )?);
                in_channels = planes * expansion;
            }
            stages.push(blocks);
        }

        Ok(Self {
            conv1,
            bn1,
            stages,
            num_channels: kind.num_channels(),
        })
    }

    /// Returns the feature map [B, C, H/32, W/32] and the padding mask
    /// [B, H/32, W/32] (u8, 1 on padding) resized with nearest neighbour.
    pub fn forward(&self, images: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let x = self.bn1.forward(&self.conv1.forward(images)?)?.relu()?;
        // Inputs are non-negative after relu, so zero padding matches -inf padding
        let mut x = x
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for blocks in &self.stages {
            for block in blocks {
                x = block.forward(&x)?;
            }
        }
        let (_, _, h, w) = x.dims4()?;
        let mask = resize_mask(mask, h, w)?;
        Ok((x, mask))
    }
}

/// Nearest-neighbour resize of a [B, H, W] u8 mask
pub fn resize_mask(mask: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    mask.to_dtype(candle_core::DType::F32)?
        .unsqueeze(1)?
        .upsample_nearest2d(h, w)?
        .squeeze(1)?
        .to_dtype(candle_core::DType::U8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_frozen_batch_norm_identity_at_init() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bn = FrozenBatchNorm2d::load(2, vb).unwrap();
        let x = Tensor::arange(0f32, 8., &device).unwrap().reshape((1, 2, 2, 2)).unwrap();
        let y = bn.forward(&x).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-4);
    }

    #[test]
    fn test_resnet18_output_stride() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let backbone = Backbone::load(BackboneKind::Resnet18, vb).unwrap();
        let images = Tensor::zeros((1, 3, 64, 96), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 64, 96), DType::U8, &device).unwrap();
        let (features, mask) = backbone.forward(&images, &mask).unwrap();
        assert_eq!(features.dims(), &[1, 512, 2, 3]);
        assert_eq!(mask.dims(), &[1, 2, 3]);
        assert!(varmap
            .data()
            .lock()
            .unwrap()
            .contains_key("body.layer4.0.downsample.0.weight"));
    }

    #[test]
    fn test_resize_mask_nearest() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[[0u8, 0, 1, 1], [0, 0, 1, 1]]], &device).unwrap();
        let small = resize_mask(&mask, 1, 2).unwrap();
        assert_eq!(small.to_vec3::<u8>().unwrap(), vec![vec![vec![0, 1]]]);
    }

    #[test]
    fn test_frozen_names() {
        assert!(is_frozen("body.conv1.weight", true));
        assert!(is_frozen("body.layer1.0.conv1.weight", true));
        assert!(is_frozen("body.layer2.0.bn1.weight", true));
        assert!(is_frozen("body.layer2.0.downsample.1.running_var", true));
        assert!(!is_frozen("body.layer2.0.conv1.weight", true));
        assert!(!is_frozen("body.layer4.0.downsample.0.weight", true));
        assert!(is_frozen("body.layer4.0.conv1.weight", false));
    }
}
