pub mod backbone;
pub mod pos_enc;
pub mod transformer;

use candle_core::{IndexOp, Module, Result, Tensor, Var};
use candle_nn::{conv2d, linear, Conv2d, Embedding, Linear, VarBuilder, VarMap};

use crate::config::HoiTrConfig;
use crate::data::ImageBatch;
use crate::model::backbone::{is_frozen, Backbone};
use crate::model::pos_enc::PositionEmbedding;
use crate::model::transformer::{Mlp, Transformer, TransformerConfig, TransformerDecoder};

/// Predictions of one decoder layer, every tensor shaped [batch_size, num_queries, ·].
///
/// Boxes are normalized (cx, cy, w, h). The last class of every logit tensor
/// is the no-object / no-relation class.
#[derive(Debug, Clone)]
pub struct HoiOutputs {
    pub pred_sub_logits: Tensor,
    pub pred_sub_boxes: Tensor,
    pub pred_obj_logits: Tensor,
    pub pred_obj_boxes: Tensor,
    pub pred_distance_logits: Tensor,
    pub pred_occlusion_logits: Tensor,
    /// Outputs of the intermediate decoder layers, empty without aux loss
    pub aux_outputs: Vec<HoiOutputs>,
}

impl HoiOutputs {
    /// Copy with every tensor cut from the graph
    pub fn detach(&self) -> Self {
        Self {
            pred_sub_logits: self.pred_sub_logits.detach(),
            pred_sub_boxes: self.pred_sub_boxes.detach(),
            pred_obj_logits: self.pred_obj_logits.detach(),
            pred_obj_boxes: self.pred_obj_boxes.detach(),
            pred_distance_logits: self.pred_distance_logits.detach(),
            pred_occlusion_logits: self.pred_occlusion_logits.detach(),
            aux_outputs: self.aux_outputs.iter().map(|o| o.detach()).collect(),
        }
    }

    pub fn num_queries(&self) -> Result<usize> {
        self.pred_sub_logits.dim(1)
    }

    /// Predictions of image `b`, without aux outputs
    pub fn image(&self, b: usize) -> Result<HoiOutputs> {
        Ok(Self {
            pred_sub_logits: self.pred_sub_logits.i(b)?,
            pred_sub_boxes: self.pred_sub_boxes.i(b)?,
            pred_obj_logits: self.pred_obj_logits.i(b)?,
            pred_obj_boxes: self.pred_obj_boxes.i(b)?,
            pred_distance_logits: self.pred_distance_logits.i(b)?,
            pred_occlusion_logits: self.pred_occlusion_logits.i(b)?,
            aux_outputs: Vec::new(),
        })
    }
}

/// Transformer for human-object interaction and 2.5D relation detection
///
/// Every query predicts a subject, an object and the distance / occlusion
/// relation between them.
pub struct HoiTr {
    pub config: HoiTrConfig,
    backbone: Backbone,
    position_embedding: PositionEmbedding,
    input_proj: Conv2d,
    query_embed: Embedding,
    transformer: Transformer,
    /// Cascaded relation decoders
    distance_decoder: Option<TransformerDecoder>,
    occlusion_decoder: Option<TransformerDecoder>,
    sub_class_embed: Linear,
    obj_class_embed: Linear,
    sub_bbox_embed: Mlp,
    obj_bbox_embed: Mlp,
    distance_class_embed: Linear,
    occlusion_class_embed: Linear,
}

impl HoiTr {
    pub fn load(vb: VarBuilder, config: &HoiTrConfig) -> Result<Self> {
        let hidden_dim = config.hidden_dim;

        // Weight path: backbone.0.body.*
        let backbone = Backbone::load(config.backbone, vb.pp("backbone.0"))?;
        // Weight path: backbone.1.* (learned embedding only)
        let position_embedding =
            PositionEmbedding::load(config.position_embedding, hidden_dim, vb.pp("backbone.1"))?;

        let input_proj = conv2d(
            backbone.num_channels,
            hidden_dim,
            1,
            Default::default(),
            vb.pp("input_proj"),
        )?;
        let query_embed = candle_nn::embedding(config.num_queries, hidden_dim, vb.pp("query_embed"))?;

        let transformer_config = TransformerConfig {
            d_model: hidden_dim,
            nhead: config.nheads,
            num_encoder_layers: config.enc_layers,
            num_decoder_layers: config.dec_layers,
            dim_feedforward: config.dim_feedforward,
            dropout: config.dropout,
            normalize_before: config.pre_norm,
            return_intermediate_dec: config.aux_loss,
        };
        let transformer = Transformer::load(&transformer_config, vb.pp("transformer"))?;

        let (distance_decoder, occlusion_decoder) = if config.cascade {
            (
                Some(TransformerDecoder::load(
                    &transformer_config,
                    config.dec_layers_distance,
                    vb.pp("transformer.distance_decoder"),
                )?),
                Some(TransformerDecoder::load(
                    &transformer_config,
                    config.dec_layers_occlusion,
                    vb.pp("transformer.occlusion_decoder"),
                )?),
            )
        } else {
            (None, None)
        };

        let entity_classes = config.num_entity_classes + 1;
        Ok(Self {
            config: config.clone(),
            backbone,
            position_embedding,
            input_proj,
            query_embed,
            transformer,
            distance_decoder,
            occlusion_decoder,
            sub_class_embed: linear(hidden_dim, entity_classes, vb.pp("sub_class_embed"))?,
            obj_class_embed: linear(hidden_dim, entity_classes, vb.pp("obj_class_embed"))?,
            sub_bbox_embed: Mlp::load(hidden_dim, hidden_dim, 4, 3, vb.pp("sub_bbox_embed"))?,
            obj_bbox_embed: Mlp::load(hidden_dim, hidden_dim, 4, 3, vb.pp("obj_bbox_embed"))?,
            distance_class_embed: linear(
                hidden_dim,
                config.num_distance_classes + 1,
                vb.pp("distance_class_embed"),
            )?,
            occlusion_class_embed: linear(
                hidden_dim,
                config.num_occlusion_classes + 1,
                vb.pp("occlusion_class_embed"),
            )?,
        })
    }

    /// Run the model on a padded image batch
    ///
    /// `train` enables dropout.
    pub fn forward(&self, images: &ImageBatch, train: bool) -> Result<HoiOutputs> {
        let (features, mask) = self.backbone.forward(&images.tensor, &images.mask)?;
        let pos = self.position_embedding.forward(&mask)?;
        let src = self.input_proj.forward(&features)?;

        // hs: [num_layers, batch_size, num_queries, hidden_dim]
        let (hs, encoded) =
            self.transformer
                .forward(&src, &mask, self.query_embed.embeddings(), &pos, train)?;
        let num_layers = hs.dim(0)?;

        let sub_logits = self.sub_class_embed.forward(&hs)?;
        let obj_logits = self.obj_class_embed.forward(&hs)?;
        let sub_boxes = candle_nn::ops::sigmoid(&self.sub_bbox_embed.forward(&hs)?)?;
        let obj_boxes = candle_nn::ops::sigmoid(&self.obj_bbox_embed.forward(&hs)?)?;

        let (distance_logits, occlusion_logits) =
            match (&self.distance_decoder, &self.occlusion_decoder) {
                (Some(distance_decoder), Some(occlusion_decoder)) => {
                    // Each stage queries with the last output of the previous one
                    let hs_distance =
                        Transformer::decode(distance_decoder, &encoded, &hs.i(num_layers - 1)?, train)?;
                    let last = hs_distance.dim(0)? - 1;
                    let hs_occlusion =
                        Transformer::decode(occlusion_decoder, &encoded, &hs_distance.i(last)?, train)?;
                    (
                        self.distance_class_embed.forward(&hs_distance)?,
                        self.occlusion_class_embed.forward(&hs_occlusion)?,
                    )
                }
                _ => (
                    self.distance_class_embed.forward(&hs)?,
                    self.occlusion_class_embed.forward(&hs)?,
                ),
            };
        let distance_layers = distance_logits.dim(0)?;
        let occlusion_layers = occlusion_logits.dim(0)?;

        let layer = |i: usize| -> Result<HoiOutputs> {
            Ok(HoiOutputs {
                pred_sub_logits: sub_logits.i(i)?,
                pred_sub_boxes: sub_boxes.i(i)?,
                pred_obj_logits: obj_logits.i(i)?,
                pred_obj_boxes: obj_boxes.i(i)?,
                pred_distance_logits: distance_logits
                    .i(aligned_layer(i, num_layers, distance_layers))?,
                pred_occlusion_logits: occlusion_logits
                    .i(aligned_layer(i, num_layers, occlusion_layers))?,
                aux_outputs: Vec::new(),
            })
        };

        let mut outputs = layer(num_layers - 1)?;
        if self.config.aux_loss {
            outputs.aux_outputs = (0..num_layers - 1).map(layer).collect::<Result<Vec<_>>>()?;
        }
        Ok(outputs)
    }
}

/// Index of the relation decoder layer paired with entity layer `i`.
///
/// Both stacks are aligned on their last layer.
fn aligned_layer(i: usize, entity_layers: usize, relation_layers: usize) -> usize {
    (i + relation_layers)
        .saturating_sub(entity_layers)
        .min(relation_layers - 1)
}

/// Trainable variables split into the two optimizer groups
pub struct ParamGroups {
    /// Everything outside the backbone
    pub main: Vec<(String, Var)>,
    /// Backbone variables updated at the backbone learning rate
    pub backbone: Vec<(String, Var)>,
}

impl ParamGroups {
    pub fn num_parameters(&self) -> usize {
        self.main
            .iter()
            .chain(&self.backbone)
            .map(|(_, v)| v.elem_count())
            .sum()
    }
}

/// Variables of a var map sorted by name
pub fn named_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = match varmap.data().lock() {
        Ok(data) => data,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Split the model variables into optimizer groups, leaving out frozen ones
pub fn param_groups(varmap: &VarMap, train_backbone: bool) -> ParamGroups {
    let mut groups = ParamGroups {
        main: Vec::new(),
        backbone: Vec::new(),
    };
    for (name, var) in named_vars(varmap) {
        if let Some(body) = name.strip_prefix("backbone.0.") {
            if !is_frozen(body, train_backbone) {
                groups.backbone.push((name, var));
            }
        } else if name.starts_with("backbone.") {
            groups.backbone.push((name, var));
        } else {
            groups.main.push((name, var));
        }
    }
    groups
}
