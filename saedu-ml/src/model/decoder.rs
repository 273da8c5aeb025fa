//! Decoder-only causal language model with adapter injection points.
//!
//! Norms, rotary embedding, attention softmax and activations are written
//! with elementary tensor ops so gradients flow back to the adapters.
//! Hidden states stay in the base dtype; normalization statistics,
//! attention scores and logits are computed in F32.

use super::config::{Architecture, ModelConfig};
use super::lora::{AdaptedLinear, LoraAdapter};
use super::weights::WeightStore;
use crate::error::MlError;
use candle_core::{D, DType, Device, Tensor};
use candle_nn::VarMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use saedu_core::LoraSettings;

const MASKED: f32 = -1e9;

#[derive(Debug, Clone)]
enum Norm {
    Rms { weight: Tensor, eps: f64 },
    /// LayerNorm without bias.
    Layer { weight: Tensor, eps: f64 },
}

impl Norm {
    fn load(store: &WeightStore, name: &str, config: &ModelConfig) -> Result<Self, MlError> {
        let weight = store.get(name)?;
        let eps = config.norm_eps;
        Ok(match config.architecture {
            Architecture::Llama => Self::Rms { weight, eps },
            Architecture::Cohere => Self::Layer { weight, eps },
        })
    }

    fn weight(&self) -> &Tensor {
        match self {
            Self::Rms { weight, .. } | Self::Layer { weight, .. } => weight,
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor, MlError> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let (normed, weight) = match self {
            Self::Rms { weight, eps } => {
                let ms = x.sqr()?.mean_keepdim(D::Minus1)?;
                (x.broadcast_div(&ms.affine(1.0, *eps)?.sqrt()?)?, weight)
            }
            Self::Layer { weight, eps } => {
                let mean = x.mean_keepdim(D::Minus1)?;
                let centered = x.broadcast_sub(&mean)?;
                let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
                (
                    centered.broadcast_div(&var.affine(1.0, *eps)?.sqrt()?)?,
                    weight,
                )
            }
        };
        Ok(normed.to_dtype(dtype)?.broadcast_mul(weight)?)
    }
}

/// Precomputed rotary tables, `[max_positions, head_dim / 2]` in F32.
#[derive(Debug, Clone)]
struct Rotary {
    cos: Tensor,
    sin: Tensor,
    interleaved: bool,
}

impl Rotary {
    fn new(config: &ModelConfig, max_positions: usize, device: &Device) -> Result<Self, MlError> {
        let half = config.head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / config.rope_theta.powf(2.0 * i as f64 / config.head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
            interleaved: config.architecture == Architecture::Cohere,
        })
    }

    /// Rotate `x: [batch, heads, seq, head_dim]`.
    fn apply(&self, x: &Tensor) -> Result<Tensor, MlError> {
        let (b, h, t, d) = x.dims4()?;
        if t > self.cos.dim(0)? {
            return Err(MlError::model(format!(
                "sequence length {t} exceeds rotary table of {} positions",
                self.cos.dim(0)?
            )));
        }
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let cos = self.cos.narrow(0, 0, t)?;
        let sin = self.sin.narrow(0, 0, t)?;

        let rotated = if self.interleaved {
            let pairs = x.reshape((b, h, t, d / 2, 2))?;
            let even = pairs.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
            let odd = pairs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;
            let out_even = (even.broadcast_mul(&cos)? - odd.broadcast_mul(&sin)?)?;
            let out_odd = (even.broadcast_mul(&sin)? + odd.broadcast_mul(&cos)?)?;
            Tensor::stack(&[out_even, out_odd], D::Minus1)?.reshape((b, h, t, d))?
        } else {
            let first = x.narrow(D::Minus1, 0, d / 2)?;
            let second = x.narrow(D::Minus1, d / 2, d / 2)?;
            let cos = Tensor::cat(&[&cos, &cos], D::Minus1)?;
            let sin = Tensor::cat(&[&sin, &sin], D::Minus1)?;
            let rotate_half = Tensor::cat(&[&second.neg()?, &first], D::Minus1)?;
            (x.broadcast_mul(&cos)? + rotate_half.broadcast_mul(&sin)?)?
        };
        Ok(rotated.to_dtype(dtype)?)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: AdaptedLinear,
    k_proj: AdaptedLinear,
    v_proj: AdaptedLinear,
    o_proj: AdaptedLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(store: &WeightStore, prefix: &str, config: &ModelConfig) -> Result<Self, MlError> {
        let proj = |name: &str, bias: bool| -> Result<AdaptedLinear, MlError> {
            let weight = store.get(&format!("{prefix}.{name}.weight"))?;
            let bias = if bias {
                store.get_opt(&format!("{prefix}.{name}.bias"))?
            } else {
                None
            };
            Ok(AdaptedLinear::new(weight, bias))
        };
        Ok(Self {
            q_proj: proj("q_proj", config.qkv_bias)?,
            k_proj: proj("k_proj", config.qkv_bias)?,
            v_proj: proj("v_proj", config.qkv_bias)?,
            o_proj: proj("o_proj", config.o_bias)?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim,
        })
    }

    fn split_heads(&self, x: Tensor, heads: usize) -> Result<Tensor, MlError> {
        let (b, t, _) = x.dims3()?;
        Ok(x.reshape((b, t, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn repeat_kv(&self, x: Tensor) -> Result<Tensor, MlError> {
        let groups = self.num_heads / self.num_kv_heads;
        if groups == 1 {
            return Ok(x);
        }
        let (b, kv, t, d) = x.dims4()?;
        Ok(x.unsqueeze(2)?
            .broadcast_as((b, kv, groups, t, d))?
            .contiguous()?
            .reshape((b, kv * groups, t, d))?)
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &Rotary,
        mask: &Tensor,
        train: bool,
    ) -> Result<Tensor, MlError> {
        let (b, t, _) = x.dims3()?;
        let dtype = x.dtype();

        let q = self.split_heads(self.q_proj.forward(x, train)?, self.num_heads)?;
        let k = self.split_heads(self.k_proj.forward(x, train)?, self.num_kv_heads)?;
        let v = self.split_heads(self.v_proj.forward(x, train)?, self.num_kv_heads)?;

        let q = rotary.apply(&q)?.to_dtype(DType::F32)?;
        let k = self.repeat_kv(rotary.apply(&k)?)?.to_dtype(DType::F32)?;
        let v = self.repeat_kv(v)?.to_dtype(DType::F32)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?)?.affine(scale, 0.0)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = probs
            .matmul(&v)?
            .to_dtype(dtype)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out, train)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: AdaptedLinear,
    up_proj: AdaptedLinear,
    down_proj: AdaptedLinear,
}

impl Mlp {
    fn load(store: &WeightStore, prefix: &str) -> Result<Self, MlError> {
        let proj = |name: &str| -> Result<AdaptedLinear, MlError> {
            Ok(AdaptedLinear::new(
                store.get(&format!("{prefix}.{name}.weight"))?,
                None,
            ))
        };
        Ok(Self {
            gate_proj: proj("gate_proj")?,
            up_proj: proj("up_proj")?,
            down_proj: proj("down_proj")?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor, MlError> {
        let gate = self.gate_proj.forward(x, train)?;
        // silu(x) = x / (1 + e^-x)
        let activated = (&gate / gate.neg()?.exp()?.affine(1.0, 1.0)?)?;
        let hidden = (activated * self.up_proj.forward(x, train)?)?;
        self.down_proj.forward(&hidden, train)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    attn: Attention,
    mlp: Mlp,
    input_norm: Norm,
    /// Absent for parallel-residual blocks.
    post_attention_norm: Option<Norm>,
}

impl DecoderLayer {
    fn load(store: &WeightStore, index: usize, config: &ModelConfig) -> Result<Self, MlError> {
        let prefix = format!("model.layers.{index}");
        let post_attention_norm = match config.architecture {
            Architecture::Llama => Some(Norm::load(
                store,
                &format!("{prefix}.post_attention_layernorm.weight"),
                config,
            )?),
            Architecture::Cohere => None,
        };
        Ok(Self {
            attn: Attention::load(store, &format!("{prefix}.self_attn"), config)?,
            mlp: Mlp::load(store, &format!("{prefix}.mlp"))?,
            input_norm: Norm::load(store, &format!("{prefix}.input_layernorm.weight"), config)?,
            post_attention_norm,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &Rotary,
        mask: &Tensor,
        train: bool,
    ) -> Result<Tensor, MlError> {
        let normed = self.input_norm.forward(x)?;
        let attn = self.attn.forward(&normed, rotary, mask, train)?;
        match &self.post_attention_norm {
            None => {
                let mlp = self.mlp.forward(&normed, train)?;
                Ok(((x + attn)? + mlp)?)
            }
            Some(norm) => {
                let h = (x + attn)?;
                let mlp = self.mlp.forward(&norm.forward(&h)?, train)?;
                Ok((h + mlp)?)
            }
        }
    }

    fn projection_mut(&mut self, module: &str) -> Option<(&'static str, &mut AdaptedLinear)> {
        match module {
            "q_proj" => Some(("self_attn", &mut self.attn.q_proj)),
            "k_proj" => Some(("self_attn", &mut self.attn.k_proj)),
            "v_proj" => Some(("self_attn", &mut self.attn.v_proj)),
            "o_proj" => Some(("self_attn", &mut self.attn.o_proj)),
            "gate_proj" => Some(("mlp", &mut self.mlp.gate_proj)),
            "up_proj" => Some(("mlp", &mut self.mlp.up_proj)),
            "down_proj" => Some(("mlp", &mut self.mlp.down_proj)),
            _ => None,
        }
    }

    fn projections(&self) -> [(&'static str, &'static str, &AdaptedLinear); 7] {
        [
            ("self_attn", "q_proj", &self.attn.q_proj),
            ("self_attn", "k_proj", &self.attn.k_proj),
            ("self_attn", "v_proj", &self.attn.v_proj),
            ("self_attn", "o_proj", &self.attn.o_proj),
            ("mlp", "gate_proj", &self.mlp.gate_proj),
            ("mlp", "up_proj", &self.mlp.up_proj),
            ("mlp", "down_proj", &self.mlp.down_proj),
        ]
    }
}

/// Trainable versus frozen parameter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSummary {
    pub trainable: u64,
    pub total: u64,
}

impl ParameterSummary {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for ParameterSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

/// A causal LM over a frozen base.
#[derive(Debug, Clone)]
pub struct CausalLm {
    config: ModelConfig,
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm: Norm,
    lm_head: Tensor,
    rotary: Rotary,
    base_parameters: u64,
    adapter_parameters: u64,
    device: Device,
}

impl CausalLm {
    /// Load the base model. `max_positions` bounds the rotary table.
    pub fn load(
        store: &WeightStore,
        config: &ModelConfig,
        max_positions: usize,
    ) -> Result<Self, MlError> {
        let device = store.device().clone();
        let embed_tokens = store.get("model.embed_tokens.weight")?;
        let lm_head = match store.get_opt("lm_head.weight")? {
            Some(head) if !config.tie_word_embeddings => head,
            _ => embed_tokens.clone(),
        };
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::load(store, i, config))
            .collect::<Result<Vec<_>, _>>()?;
        let norm = Norm::load(store, "model.norm.weight", config)?;
        let rotary = Rotary::new(config, max_positions.max(1), &device)?;
        let base_parameters = store.parameter_count()?;

        tracing::info!(
            model_type = %config.model_type,
            layers = layers.len(),
            dtype = ?store.dtype(),
            quantized = store.is_quantized(),
            "base model loaded"
        );
        Ok(Self {
            config: config.clone(),
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            base_parameters,
            adapter_parameters: 0,
            device,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Attach adapters to every `settings.target_modules` projection of every
    /// layer and register their weights in `varmap`.
    pub fn attach_lora(
        &mut self,
        settings: &LoraSettings,
        varmap: &VarMap,
        seed: u64,
    ) -> Result<ParameterSummary, MlError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = settings.scaling();
        let mut added = 0u64;
        for (index, layer) in self.layers.iter_mut().enumerate() {
            for module in &settings.target_modules {
                let (block, proj) = layer.projection_mut(module).ok_or_else(|| {
                    MlError::model(format!("unknown LoRA target module `{module}`"))
                })?;
                let path = format!("model.layers.{index}.{block}.{module}");
                let adapter = LoraAdapter::init(
                    varmap,
                    &path,
                    proj.dims()?,
                    settings.r,
                    scale,
                    settings.dropout as f32,
                    &mut rng,
                    &self.device,
                )?;
                added += adapter.num_parameters() as u64;
                proj.attach(adapter);
            }
        }
        self.adapter_parameters += added;
        Ok(self.parameter_summary())
    }

    pub fn parameter_summary(&self) -> ParameterSummary {
        ParameterSummary {
            trainable: self.adapter_parameters,
            total: self.base_parameters + self.adapter_parameters,
        }
    }

    /// Additive attention mask `[batch, 1, seq, seq]` combining causality
    /// with key padding.
    fn attention_mask(&self, attention_mask: &Tensor) -> Result<Tensor, MlError> {
        let (b, t) = attention_mask.dims2()?;
        let causal: Vec<f32> = (0..t)
            .flat_map(|i| (0..t).map(move |j| if j > i { MASKED } else { 0.0 }))
            .collect();
        let causal = Tensor::from_vec(causal, (1, 1, t, t), &self.device)?;
        let padding = attention_mask
            .to_dtype(DType::F32)?
            .affine(-(MASKED as f64), MASKED as f64)?
            .reshape((b, 1, 1, t))?;
        Ok(causal.broadcast_add(&padding)?)
    }

    /// F32 logits `[batch, seq, vocab]`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor, MlError> {
        let (b, t) = input_ids.dims2()?;
        let mask = self.attention_mask(attention_mask)?;

        let mut hidden = self
            .embed_tokens
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b, t, self.config.hidden_size))?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rotary, &mask, train)?;
        }
        let hidden = self.norm.forward(&hidden)?;
        let logits = hidden
            .broadcast_matmul(&self.lm_head.t()?)?
            .to_dtype(DType::F32)?;
        if self.config.architecture == Architecture::Cohere {
            Ok(logits.affine(self.config.logit_scale, 0.0)?)
        } else {
            Ok(logits)
        }
    }

    /// Base tensors with adapters folded into their projections, each cast
    /// to `dtype` as it is produced.
    pub fn merged_tensors(&self, dtype: DType) -> Result<Vec<(String, Tensor)>, MlError> {
        let mut out = vec![(
            "model.embed_tokens.weight".to_string(),
            self.embed_tokens.to_dtype(dtype)?,
        )];
        if !self.config.tie_word_embeddings {
            out.push(("lm_head.weight".into(), self.lm_head.to_dtype(dtype)?));
        }
        out.push(("model.norm.weight".into(), self.norm.weight().to_dtype(dtype)?));

        for (index, layer) in self.layers.iter().enumerate() {
            let prefix = format!("model.layers.{index}");
            for (block, module, proj) in layer.projections() {
                let path = format!("{prefix}.{block}.{module}");
                out.push((format!("{path}.weight"), proj.merged_weight(dtype)?));
                if let Some(bias) = proj.bias() {
                    out.push((format!("{path}.bias"), bias.to_dtype(dtype)?));
                }
            }
            out.push((
                format!("{prefix}.input_layernorm.weight"),
                layer.input_norm.weight().to_dtype(dtype)?,
            ));
            if let Some(norm) = &layer.post_attention_norm {
                out.push((
                    format!("{prefix}.post_attention_layernorm.weight"),
                    norm.weight().to_dtype(dtype)?,
                ));
            }
        }
        Ok(out)
    }
}

/// Mean next-token cross entropy over positions where `loss_mask` is 1.
///
/// `logits: [batch, seq, vocab]`, `targets` and `loss_mask: [batch, seq - 1]`.
/// Returns the scalar loss and the number of counted tokens.
pub fn causal_lm_loss(
    logits: &Tensor,
    targets: &Tensor,
    loss_mask: &Tensor,
) -> Result<(Tensor, f32), MlError> {
    let (b, t, vocab) = logits.dims3()?;
    let n = b * (t - 1);
    let shifted = logits.narrow(1, 0, t - 1)?.reshape((n, vocab))?;
    let log_probs = candle_nn::ops::log_softmax(&shifted, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.reshape((n, 1))?, 1)?
        .reshape(n)?;
    let mask = loss_mask.reshape(n)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    let total = (picked * &mask)?.sum_all()?.neg()?;
    let loss = total.affine(1.0 / f64::from(count.max(1.0)), 0.0)?;
    Ok((loss, count))
}
