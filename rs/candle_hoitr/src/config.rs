//! HOI-TR Model Configuration
//!
//! This module defines the model, matcher and loss configuration, plus the
//! run flags that toggle experimental training behaviour.

use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Convolutional backbone variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
}

impl BackboneKind {
    /// Number of blocks in each of the four residual stages
    pub fn stage_blocks(&self) -> [usize; 4] {
        match self {
            BackboneKind::Resnet18 => [2, 2, 2, 2],
            BackboneKind::Resnet34 => [3, 4, 6, 3],
            BackboneKind::Resnet50 => [3, 4, 6, 3],
            BackboneKind::Resnet101 => [3, 4, 23, 3],
        }
    }

    /// Whether the stages use bottleneck blocks (expansion 4)
    pub fn bottleneck(&self) -> bool {
        matches!(self, BackboneKind::Resnet50 | BackboneKind::Resnet101)
    }

    /// Channel count of the last feature map
    pub fn num_channels(&self) -> usize {
        if self.bottleneck() {
            2048
        } else {
            512
        }
    }

    /// File name of the DETR COCO weights matching this backbone, if any
    pub fn detr_weights(&self) -> Option<&'static str> {
        match self {
            BackboneKind::Resnet50 => Some("detr-r50.safetensors"),
            BackboneKind::Resnet101 => Some("detr-r101.safetensors"),
            _ => None,
        }
    }
}

/// Position embedding added to the image features
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingKind {
    Sine,
    Learned,
}

/// Dataset family, which fixes the class counts of the heads
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Hico,
    Vcoco,
    Hoia,
    TwoPointFiveVrd,
}

impl DatasetKind {
    /// Number of entity classes (without the no-object class)
    pub fn num_entity_classes(&self) -> usize {
        match self {
            DatasetKind::Hico | DatasetKind::Vcoco => 91,
            DatasetKind::Hoia => 12,
            DatasetKind::TwoPointFiveVrd => 602,
        }
    }

    /// Number of classes of the first relation head (without no-relation).
    ///
    /// For the HOI datasets this head carries the action classes.
    pub fn num_distance_classes(&self) -> usize {
        match self {
            DatasetKind::Hico => 117,
            DatasetKind::Vcoco => 29,
            DatasetKind::Hoia => 11,
            DatasetKind::TwoPointFiveVrd => vrdtools::classes::DEFAULT_DISTANCE_NAMES.len(),
        }
    }

    /// Number of occlusion classes (without no-relation)
    pub fn num_occlusion_classes(&self) -> usize {
        vrdtools::classes::DEFAULT_OCCLUSION_NAMES.len()
    }
}

/// Configuration for the HOI transformer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoiTrConfig {
    /// Size of the embeddings (dimension of the transformer)
    pub hidden_dim: usize,
    /// Number of attention heads inside the transformer's attentions
    pub nheads: usize,
    /// Number of encoder layers
    pub enc_layers: usize,
    /// Number of decoder layers for entities
    pub dec_layers: usize,
    /// Number of layers of the cascaded distance decoder
    pub dec_layers_distance: usize,
    /// Number of layers of the cascaded occlusion decoder
    pub dec_layers_occlusion: usize,
    /// Intermediate size of the feedforward layers
    pub dim_feedforward: usize,
    /// Dropout applied in the transformer
    pub dropout: f32,
    /// Number of query slots
    pub num_queries: usize,
    /// Normalize before attention / feedforward instead of after
    pub pre_norm: bool,
    /// Return intermediate decoder outputs for auxiliary losses
    pub aux_loss: bool,
    /// Predict relations with dedicated decoders stacked on the entity decoder
    pub cascade: bool,
    pub backbone: BackboneKind,
    pub position_embedding: PositionEmbeddingKind,
    /// The backbone body is trained only when this is positive
    pub lr_backbone: f64,
    pub num_entity_classes: usize,
    pub num_distance_classes: usize,
    pub num_occlusion_classes: usize,
}

impl HoiTrConfig {
    /// DETR-R50 sized model for the given dataset
    pub fn for_dataset(dataset: DatasetKind) -> Self {
        Self {
            hidden_dim: 256,
            nheads: 8,
            enc_layers: 6,
            dec_layers: 6,
            dec_layers_distance: 6,
            dec_layers_occlusion: 6,
            dim_feedforward: 2048,
            dropout: 0.1,
            num_queries: 100,
            pre_norm: false,
            aux_loss: true,
            cascade: false,
            backbone: BackboneKind::Resnet50,
            position_embedding: PositionEmbeddingKind::Sine,
            lr_backbone: 1e-5,
            num_entity_classes: dataset.num_entity_classes(),
            num_distance_classes: dataset.num_distance_classes(),
            num_occlusion_classes: dataset.num_occlusion_classes(),
        }
    }

    /// Whether the pretrained DETR COCO weights fit this configuration
    pub fn matches_detr_layout(&self) -> bool {
        self.num_queries == 100 && self.enc_layers == 6 && self.dec_layers == 6
    }
}

/// Weights of the terms of the matching cost
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub set_cost_class: f32,
    pub set_cost_bbox: f32,
    pub set_cost_giou: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            set_cost_class: 1.0,
            set_cost_bbox: 5.0,
            set_cost_giou: 2.0,
        }
    }
}

/// Loss coefficients
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LossConfig {
    pub dice_loss_coef: f64,
    pub relation_loss_coef: f64,
    pub bbox_loss_coef: f64,
    pub giou_loss_coef: f64,
    /// Relative classification weight of the no-object class
    pub eos_coef: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            dice_loss_coef: 1.0,
            relation_loss_coef: 1.0,
            bbox_loss_coef: 5.0,
            giou_loss_coef: 2.0,
            eos_coef: 0.02,
        }
    }
}

/// Experimental switches, loaded from a JSON file.
///
/// Missing keys take their default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFlags {
    /// Replace the Hungarian matcher with entropic optimal transport
    pub use_optimal_transport: bool,
    /// Back-propagate the Sinkhorn transport cost instead of the loss dict
    pub backprop_sinkhorn_cost: bool,
    /// Stack distance and occlusion decoders on the entity decoder
    pub cascade: bool,
    pub cyclic_scheduler: bool,
    pub cyclic_base_lr: f64,
    pub cyclic_max_lr: f64,
    pub cyclic_step_size_up: usize,
    pub cyclic_step_size_down: usize,
    /// Repeatedly train on a single batch (batch size forced to 1)
    pub train_on_one_image: bool,
    /// Batch index of the image used by `train_on_one_image`
    pub train_on_one_image_index: usize,
    pub use_sequential_loader: bool,
    pub debug_outputs: bool,
    pub top_k_predictions_to_print: usize,
    pub validate_before_training: bool,
    pub batch_size_validation: usize,
    pub num_workers_validation: usize,
    /// Accepted for compatibility; workers are always kept alive
    pub persistent_workers: bool,
    pub sinkhorn_epsilon: f32,
    pub sinkhorn_iterations: usize,
    /// Number of relations kept per image in the evaluation output
    pub top_k: usize,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            use_optimal_transport: false,
            backprop_sinkhorn_cost: false,
            cascade: false,
            cyclic_scheduler: false,
            cyclic_base_lr: 1e-5,
            cyclic_max_lr: 1e-4,
            cyclic_step_size_up: 10,
            cyclic_step_size_down: 10,
            train_on_one_image: false,
            train_on_one_image_index: 0,
            use_sequential_loader: false,
            debug_outputs: false,
            top_k_predictions_to_print: 5,
            validate_before_training: true,
            batch_size_validation: 2,
            num_workers_validation: 0,
            persistent_workers: false,
            sinkhorn_epsilon: 0.1,
            sinkhorn_iterations: 50,
            top_k: 100,
        }
    }
}

impl RunFlags {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let flags = serde_json::from_str(&text)?;
        Ok(flags)
    }

    /// Print the flags at start-up
    pub fn print(&self) {
        println!();
        println!("USE_OPTIMAL_TRANSPORT:       {}", self.use_optimal_transport);
        println!("BACK_PROP_SINKHORN_COST:     {}", self.backprop_sinkhorn_cost);
        println!("CYCLIC_SCHEDULER:            {}", self.cyclic_scheduler);
        println!("TRAIN_ON_ONE_IMAGE:          {}", self.train_on_one_image);
        println!("USE_SEQUENTIAL_LOADER:       {}", self.use_sequential_loader);
        println!("DEBUG_OUTPUTS:               {}", self.debug_outputs);
        println!("CASCADE:                     {}", self.cascade);
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backbone_layout() {
        assert_eq!(BackboneKind::Resnet50.num_channels(), 2048);
        assert_eq!(BackboneKind::Resnet18.num_channels(), 512);
        assert_eq!(BackboneKind::Resnet101.stage_blocks()[2], 23);
        assert_eq!(BackboneKind::Resnet34.detr_weights(), None);
    }

    #[test]
    fn test_vrd_class_counts() {
        let cfg = HoiTrConfig::for_dataset(DatasetKind::TwoPointFiveVrd);
        assert_eq!(cfg.num_distance_classes, 3);
        assert_eq!(cfg.num_occlusion_classes, 4);
        assert!(cfg.matches_detr_layout());
    }

    #[test]
    fn test_run_flags_partial_json() {
        let flags: RunFlags =
            serde_json::from_str(r#"{"use_optimal_transport": true, "top_k": 10}"#).unwrap();
        assert!(flags.use_optimal_transport);
        assert_eq!(flags.top_k, 10);
        assert_eq!(flags.sinkhorn_iterations, 50);
        assert!(flags.validate_before_training);
    }
}
