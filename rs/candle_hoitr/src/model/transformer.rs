//! DETR Transformer Implementation
//!
//! Encoder/decoder stack used by HOI-TR:
//! - Multi-head attention with key padding masks
//! - Encoder layers (self-attention over image features)
//! - Decoder layers (query self-attention, cross-attention to the encoder memory)
//! - Post-norm (default) or pre-norm layer ordering
//!
//! Tensors are batch-first: [batch_size, seq_len, d_model]. Parameter names
//! match DETR so its weights can be reused.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{layer_norm, linear, Dropout, Init, LayerNorm, Linear, Module, VarBuilder};

/// Multi-Layer Perceptron (MLP / FFN)
///
/// A simple feed-forward network with ReLU activations between layers.
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn load(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            let out_dim = if i == num_layers - 1 {
                output_dim
            } else {
                hidden_dim
            };
            layers.push(linear(in_dim, out_dim, vb.pp(format!("layers.{}", i)))?);
        }
        Ok(Self { layers })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut output = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output)?;
            if i < self.layers.len() - 1 {
                output = output.relu()?;
            }
        }
        Ok(output)
    }
}

/// Turn a [B, S] u8 padding mask into an additive attention bias [B, 1, 1, S]
pub fn padding_bias(key_padding_mask: &Tensor) -> Result<Tensor> {
    let (b, s) = key_padding_mask.dims2()?;
    (key_padding_mask.to_dtype(DType::F32)? * -1e9)?.reshape((b, 1, 1, s))
}

/// Multi-head attention with a packed input projection
pub struct MultiheadAttention {
    num_heads: usize,
    head_dim: usize,
    /// Combined QKV projection
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    out_proj: Linear,
    dropout: Dropout,
}

impl MultiheadAttention {
    pub fn load(embed_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let bound = (6.0 / (4 * embed_dim) as f64).sqrt();
        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.0))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim: embed_dim / num_heads,
            in_proj_weight,
            in_proj_bias,
            out_proj,
            dropout: Dropout::new(dropout),
        })
    }

    fn project(&self, x: &Tensor, chunk: usize) -> Result<Tensor> {
        let embed_dim = self.num_heads * self.head_dim;
        let (b, len, _) = x.dims3()?;
        x.broadcast_matmul(&self.in_proj_weight.narrow(0, chunk * embed_dim, embed_dim)?.t()?)?
            .broadcast_add(&self.in_proj_bias.narrow(0, chunk * embed_dim, embed_dim)?)?
            // [batch, seq, embed] -> [batch, heads, seq, head_dim]
            .reshape((b, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// # Arguments
    /// * `query` - [batch_size, len_q, embed_dim]
    /// * `key`, `value` - [batch_size, len_k, embed_dim]
    /// * `key_bias` - additive bias from [`padding_bias`], [batch_size, 1, 1, len_k]
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, len_q, embed_dim) = query.dims3()?;
        let q = self.project(query, 0)?;
        let k = self.project(key, 1)?;
        let v = self.project(value, 2)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let mut attn_weights = (q.matmul(&k_t)? / scale)?;
        if let Some(bias) = key_bias {
            attn_weights = attn_weights.broadcast_add(bias)?;
        }
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;
        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, len_q, embed_dim))?;

        self.out_proj.forward(&attn_output)
    }
}

fn with_pos(x: &Tensor, pos: Option<&Tensor>) -> Result<Tensor> {
    match pos {
        Some(pos) => x + pos,
        None => Ok(x.clone()),
    }
}

/// Feed-forward block shared by encoder and decoder layers
struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    fn load(d_model: usize, dim_feedforward: usize, dropout: f32, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            linear1: linear(d_model, dim_feedforward, vb.pp("linear1"))?,
            linear2: linear(dim_feedforward, d_model, vb.pp("linear2"))?,
            dropout: Dropout::new(dropout),
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.linear1.forward(x)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        self.linear2.forward(&x)
    }
}

pub struct TransformerEncoderLayer {
    self_attn: MultiheadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout: Dropout,
    normalize_before: bool,
}

impl TransformerEncoderLayer {
    pub fn load(
        d_model: usize,
        nhead: usize,
        dim_feedforward: usize,
        dropout: f32,
        normalize_before: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::load(d_model, nhead, dropout, vb.pp("self_attn"))?,
            ffn: FeedForward::load(d_model, dim_feedforward, dropout, &vb)?,
            norm1: layer_norm(d_model, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(d_model, 1e-5, vb.pp("norm2"))?,
            dropout: Dropout::new(dropout),
            normalize_before,
        })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        key_bias: Option<&Tensor>,
        pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        if self.normalize_before {
            let src2 = self.norm1.forward(src)?;
            let q = with_pos(&src2, pos)?;
            let src2 = self.self_attn.forward(&q, &q, &src2, key_bias, train)?;
            let src = (src + self.dropout.forward(&src2, train)?)?;
            let src2 = self.ffn.forward(&self.norm2.forward(&src)?, train)?;
            &src + self.dropout.forward(&src2, train)?
        } else {
            let q = with_pos(src, pos)?;
            let src2 = self.self_attn.forward(&q, &q, src, key_bias, train)?;
            let src = self.norm1.forward(&(src + self.dropout.forward(&src2, train)?)?)?;
            let src2 = self.ffn.forward(&src, train)?;
            self.norm2.forward(&(&src + self.dropout.forward(&src2, train)?)?)
        }
    }
}

pub struct TransformerEncoder {
    layers: Vec<TransformerEncoderLayer>,
    /// Present only with pre-norm
    norm: Option<LayerNorm>,
}

impl TransformerEncoder {
    pub fn load(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_encoder_layers)
            .map(|i| {
                TransformerEncoderLayer::load(
                    config.d_model,
                    config.nhead,
                    config.dim_feedforward,
                    config.dropout,
                    config.normalize_before,
                    vb.pp(format!("layers.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = if config.normalize_before {
            Some(layer_norm(config.d_model, 1e-5, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self { layers, norm })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        key_bias: Option<&Tensor>,
        pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut output = src.clone();
        for layer in &self.layers {
            output = layer.forward(&output, key_bias, pos, train)?;
        }
        match &self.norm {
            Some(norm) => norm.forward(&output),
            None => Ok(output),
        }
    }
}

/// Transformer Decoder Layer
///
/// Each layer contains:
/// 1. Self-attention between queries
/// 2. Cross-attention to the encoder memory
/// 3. Feed-forward network
pub struct TransformerDecoderLayer {
    self_attn: MultiheadAttention,
    multihead_attn: MultiheadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    dropout: Dropout,
    normalize_before: bool,
}

impl TransformerDecoderLayer {
    pub fn load(
        d_model: usize,
        nhead: usize,
        dim_feedforward: usize,
        dropout: f32,
        normalize_before: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::load(d_model, nhead, dropout, vb.pp("self_attn"))?,
            multihead_attn: MultiheadAttention::load(
                d_model,
                nhead,
                dropout,
                vb.pp("multihead_attn"),
            )?,
            ffn: FeedForward::load(d_model, dim_feedforward, dropout, &vb)?,
            norm1: layer_norm(d_model, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(d_model, 1e-5, vb.pp("norm2"))?,
            norm3: layer_norm(d_model, 1e-5, vb.pp("norm3"))?,
            dropout: Dropout::new(dropout),
            normalize_before,
        })
    }

    /// # Arguments
    /// * `tgt` - Query features [batch_size, num_queries, d_model]
    /// * `memory` - Encoder memory [batch_size, H*W, d_model]
    /// * `memory_bias` - Padding bias of the memory
    /// * `pos` - Memory position encoding [batch_size, H*W, d_model]
    /// * `query_pos` - Query position encoding [batch_size, num_queries, d_model]
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        memory_bias: Option<&Tensor>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let key = with_pos(memory, pos)?;
        if self.normalize_before {
            let tgt2 = self.norm1.forward(tgt)?;
            let q = with_pos(&tgt2, query_pos)?;
            let tgt2 = self.self_attn.forward(&q, &q, &tgt2, None, train)?;
            let tgt = (tgt + self.dropout.forward(&tgt2, train)?)?;

            let tgt2 = self.norm2.forward(&tgt)?;
            let q = with_pos(&tgt2, query_pos)?;
            let tgt2 = self
                .multihead_attn
                .forward(&q, &key, memory, memory_bias, train)?;
            let tgt = (&tgt + self.dropout.forward(&tgt2, train)?)?;

            let tgt2 = self.ffn.forward(&self.norm3.forward(&tgt)?, train)?;
            &tgt + self.dropout.forward(&tgt2, train)?
        } else {
            let q = with_pos(tgt, query_pos)?;
            let tgt2 = self.self_attn.forward(&q, &q, tgt, None, train)?;
            let tgt = self.norm1.forward(&(tgt + self.dropout.forward(&tgt2, train)?)?)?;

            let q = with_pos(&tgt, query_pos)?;
            let tgt2 = self
                .multihead_attn
                .forward(&q, &key, memory, memory_bias, train)?;
            let tgt = self.norm2.forward(&(&tgt + self.dropout.forward(&tgt2, train)?)?)?;

            let tgt2 = self.ffn.forward(&tgt, train)?;
            self.norm3.forward(&(&tgt + self.dropout.forward(&tgt2, train)?)?)
        }
    }
}

/// Transformer Decoder
///
/// Returns the normalized output of every layer, stacked as
/// [num_layers, batch_size, num_queries, d_model]. Without intermediate
/// outputs only the last layer is returned (leading dimension 1).
pub struct TransformerDecoder {
    layers: Vec<TransformerDecoderLayer>,
    norm: LayerNorm,
    return_intermediate: bool,
}

impl TransformerDecoder {
    pub fn load(config: &TransformerConfig, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|i| {
                TransformerDecoderLayer::load(
                    config.d_model,
                    config.nhead,
                    config.dim_feedforward,
                    config.dropout,
                    config.normalize_before,
                    vb.pp(format!("layers.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            norm: layer_norm(config.d_model, 1e-5, vb.pp("norm"))?,
            return_intermediate: config.return_intermediate_dec,
        })
    }

    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        memory_bias: Option<&Tensor>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut output = tgt.clone();
        let mut intermediate = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            output = layer.forward(&output, memory, memory_bias, pos, query_pos, train)?;
            if self.return_intermediate {
                intermediate.push(self.norm.forward(&output)?);
            }
        }
        if self.return_intermediate {
            Tensor::stack(&intermediate, 0)
        } else {
            self.norm.forward(&output)?.unsqueeze(0)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformerConfig {
    pub d_model: usize,
    pub nhead: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub dim_feedforward: usize,
    pub dropout: f32,
    pub normalize_before: bool,
    pub return_intermediate_dec: bool,
}

/// Encoder output flattened for the decoders
pub struct EncodedFeatures {
    /// [batch_size, H*W, d_model]
    pub memory: Tensor,
    /// [batch_size, H*W, d_model]
    pub pos: Tensor,
    /// [batch_size, 1, 1, H*W]
    pub memory_bias: Tensor,
}

pub struct Transformer {
    encoder: TransformerEncoder,
    decoder: TransformerDecoder,
    d_model: usize,
}

impl Transformer {
    pub fn load(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: TransformerEncoder::load(config, vb.pp("encoder"))?,
            decoder: TransformerDecoder::load(config, config.num_decoder_layers, vb.pp("decoder"))?,
            d_model: config.d_model,
        })
    }

    /// Flatten [B, C, H, W] features and run the encoder
    pub fn encode(&self, src: &Tensor, mask: &Tensor, pos: &Tensor, train: bool) -> Result<EncodedFeatures> {
        let (b, c, h, w) = src.dims4()?;
        let flatten = |x: &Tensor| x.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous();
        let src = flatten(src)?;
        let pos = flatten(pos)?;
        let memory_bias = padding_bias(&mask.reshape((b, h * w))?)?;
        let memory = self.encoder.forward(&src, Some(&memory_bias), Some(&pos), train)?;
        Ok(EncodedFeatures {
            memory,
            pos,
            memory_bias,
        })
    }

    /// Run a decoder with zero-initialized targets over encoded features
    pub fn decode(
        decoder: &TransformerDecoder,
        encoded: &EncodedFeatures,
        query_pos: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let tgt = query_pos.zeros_like()?;
        decoder.forward(
            &tgt,
            &encoded.memory,
            Some(&encoded.memory_bias),
            Some(&encoded.pos),
            Some(query_pos),
            train,
        )
    }

    /// # Arguments
    /// * `src` - Projected features [batch_size, d_model, H, W]
    /// * `mask` - Padding mask [batch_size, H, W]
    /// * `query_embed` - Query embeddings [num_queries, d_model]
    /// * `pos` - Position encoding [batch_size, d_model, H, W]
    ///
    /// # Returns
    /// (hs [num_layers, batch_size, num_queries, d_model], encoded features)
    pub fn forward(
        &self,
        src: &Tensor,
        mask: &Tensor,
        query_embed: &Tensor,
        pos: &Tensor,
        train: bool,
    ) -> Result<(Tensor, EncodedFeatures)> {
        let b = src.dim(0)?;
        let num_queries = query_embed.dim(0)?;
        let encoded = self.encode(src, mask, pos, train)?;
        let query_pos = query_embed
            .unsqueeze(0)?
            .broadcast_as((b, num_queries, self.d_model))?
            .contiguous()?;
        let hs = Self::decode(&self.decoder, &encoded, &query_pos, train)?;
        Ok((hs, encoded))
    }
}
