#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};
use candle_transformers::models::with_tracing::{linear_no_bias as linear, Linear};

use super::CausalLm;
use crate::kv_cache::{GenerationContext, KvPolicy};

/// `config.json` of a HF Llama checkpoint. The aliases accept the key names
/// of model-center checkpoints.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    #[serde(alias = "dim_model")]
    pub hidden_size: usize,
    #[serde(alias = "dim_ff")]
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(alias = "num_layers")]
    pub num_hidden_layers: usize,
    #[serde(alias = "num_heads")]
    pub num_attention_heads: usize,
    #[serde(alias = "num_heads_kv")]
    pub num_key_value_heads: Option<usize>,
    #[serde(alias = "eps", alias = "norm_eps", default = "default_eps")]
    pub rms_norm_eps: f64,
    #[serde(alias = "base", default = "default_rope")]
    pub rope_theta: f32,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope() -> f32 {
    10_000.0
}

fn default_eps() -> f64 {
    1e-5
}

impl LlamaConfig {
    /// `rope_base` overrides the checkpoint's rope theta.
    pub fn into_config(self, rope_base: Option<f32>) -> Config {
        Config {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            vocab_size: self.vocab_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads: self.num_key_value_heads.unwrap_or(self.num_attention_heads),
            rms_norm_eps: self.rms_norm_eps,
            rope_theta: rope_base.unwrap_or(self.rope_theta),
            tie_word_embeddings: self.tie_word_embeddings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
    pub tie_word_embeddings: bool,
}

impl Config {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Rotary embedding evaluated at absolute positions, so sequences of any
/// length can be rotated without a precomputed table.
#[derive(Debug, Clone)]
struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    fn new(base: f32, head_dim: usize, device: &Device) -> Result<Self> {
        let inv_freq: Vec<_> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / base.powf(i as f32 / head_dim as f32))
            .collect();
        let len = inv_freq.len();
        Ok(Self {
            inv_freq: Tensor::from_vec(inv_freq, (1, len), device)?,
        })
    }

    fn forward(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let positions: Vec<f32> = (offset..offset + seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), q.device())?;
        let freqs = positions.matmul(&self.inv_freq)?;
        let cos = freqs.cos()?.to_dtype(q.dtype())?;
        let sin = freqs.sin()?.to_dtype(q.dtype())?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

#[derive(Debug, Clone)]
struct RmsNorm {
    inner: candle_nn::RmsNorm,
    span: tracing::Span,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "rms-norm");
        let inner = candle_nn::rms_norm(size, eps, vb)?;
        Ok(Self { inner, span })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.inner.forward(x)
    }
}

#[derive(Debug, Clone)]
struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_attention_heads: usize,
    num_key_value_heads: usize,
    head_dim: usize,
    rotary_emb: RotaryEmbedding,
    span: tracing::Span,
}

impl CausalSelfAttention {
    fn forward(
        &self,
        x: &Tensor,
        seqlen_offset: usize,
        policy: &mut dyn KvPolicy,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, seq_len, hidden_size) = x.dims3()?;
        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((b_sz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b_sz, seq_len, self.num_key_value_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = self.rotary_emb.forward(&q, &k, seqlen_offset)?;
        let y = policy.attend(&q, &k, &v, ctx)?;

        let y = y.transpose(1, 2)?.reshape(&[b_sz, seq_len, hidden_size])?;
        self.o_proj.forward(&y)
    }

    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "attn");
        let size_in = cfg.hidden_size;
        let size_q = cfg.head_dim() * cfg.num_attention_heads;
        let size_kv = cfg.head_dim() * cfg.num_key_value_heads;
        let q_proj = linear(size_in, size_q, vb.pp("q_proj"))?;
        let k_proj = linear(size_in, size_kv, vb.pp("k_proj"))?;
        let v_proj = linear(size_in, size_kv, vb.pp("v_proj"))?;
        let o_proj = linear(size_q, size_in, vb.pp("o_proj"))?;
        let rotary_emb = RotaryEmbedding::new(cfg.rope_theta, cfg.head_dim(), vb.device())?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_attention_heads: cfg.num_attention_heads,
            num_key_value_heads: cfg.num_key_value_heads,
            head_dim: cfg.head_dim(),
            rotary_emb,
            span,
        })
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    c_fc1: Linear,
    c_fc2: Linear,
    c_proj: Linear,
    span: tracing::Span,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = (candle_nn::ops::silu(&self.c_fc1.forward(x)?)? * self.c_fc2.forward(x)?)?;
        self.c_proj.forward(&x)
    }

    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "mlp");
        let h_size = cfg.hidden_size;
        let i_size = cfg.intermediate_size;
        let c_fc1 = linear(h_size, i_size, vb.pp("gate_proj"))?;
        let c_fc2 = linear(h_size, i_size, vb.pp("up_proj"))?;
        let c_proj = linear(i_size, h_size, vb.pp("down_proj"))?;
        Ok(Self {
            c_fc1,
            c_fc2,
            c_proj,
            span,
        })
    }
}

#[derive(Debug, Clone)]
struct Block {
    rms_1: RmsNorm,
    attn: CausalSelfAttention,
    rms_2: RmsNorm,
    mlp: Mlp,
    span: tracing::Span,
}

impl Block {
    fn forward(
        &self,
        x: &Tensor,
        seqlen_offset: usize,
        policy: &mut dyn KvPolicy,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let residual = x;
        let x = self.rms_1.forward(x)?;
        let x = (self.attn.forward(&x, seqlen_offset, policy, ctx)? + residual)?;
        let residual = &x;
        let x = (self.mlp.forward(&self.rms_2.forward(&x)?)? + residual)?;
        Ok(x)
    }

    fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "block");
        let attn = CausalSelfAttention::load(vb.pp("self_attn"), cfg)?;
        let mlp = Mlp::load(vb.pp("mlp"), cfg)?;
        let rms_1 = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let rms_2 = RmsNorm::load(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            rms_1,
            attn,
            rms_2,
            mlp,
            span,
        })
    }
}

#[derive(Debug)]
pub struct Llama {
    wte: Embedding,
    blocks: Vec<Block>,
    ln_f: RmsNorm,
    lm_head: Linear,
    /// One cache policy per block.
    policies: Vec<Box<dyn KvPolicy>>,
    device: Device,
}

impl Llama {
    pub fn load(vb: VarBuilder, cfg: &Config, policies: Vec<Box<dyn KvPolicy>>) -> Result<Self> {
        if policies.len() != cfg.num_hidden_layers {
            candle_core::bail!(
                "expected {} cache policies, got {}",
                cfg.num_hidden_layers,
                policies.len()
            )
        }
        let wte = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("model.embed_tokens"))?;
        let lm_head = if cfg.tie_word_embeddings || !vb.contains_tensor("lm_head.weight") {
            Linear::from_weights(wte.embeddings().clone(), None)
        } else {
            linear(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };
        let ln_f = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;
        let blocks = (0..cfg.num_hidden_layers)
            .map(|i| Block::load(vb.pp(format!("model.layers.{i}")), cfg))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            wte,
            blocks,
            ln_f,
            lm_head,
            policies,
            device: vb.device().clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl CausalLm for Llama {
    fn forward(
        &mut self,
        input_ids: &[u32],
        seqlen_offset: usize,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor> {
        let seq_len = input_ids.len();
        let x = Tensor::from_slice(input_ids, (1, seq_len), &self.device)?;
        let mut x = self.wte.forward(&x)?;
        for (block, policy) in self.blocks.iter().zip(self.policies.iter_mut()) {
            x = block.forward(&x, seqlen_offset, policy.as_mut(), ctx)?;
        }
        let x = self.ln_f.forward(&x)?;
        let x = x.i((0, seq_len - 1))?.unsqueeze(0)?;
        let logits = self.lm_head.forward(&x)?.squeeze(0)?;
        logits.to_dtype(DType::F32)
    }

    fn reset(&mut self) {
        for policy in self.policies.iter_mut() {
            policy.reset();
        }
    }

    fn num_layers(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        config::RetrievalParams,
        kv_cache::{Baseline, ChannelConfig, PolicySettings},
        stats::ExperimentStats,
    };

    fn tiny_config() -> Config {
        serde_json::from_str::<LlamaConfig>(
            r#"{"dim_model": 16, "dim_ff": 32, "vocab_size": 40, "num_layers": 2,
                "num_heads": 4, "num_heads_kv": 2, "eps": 1e-6}"#,
        )
        .unwrap()
        .into_config(None)
    }

    fn tiny_model(baseline: Baseline) -> Llama {
        let cfg = tiny_config();
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        let mut add = |name: String, shape: (usize, usize)| {
            let t = Tensor::randn(0f32, 0.2, shape, &device).unwrap();
            tensors.insert(name, t);
        };
        add("model.embed_tokens.weight".into(), (40, 16));
        for i in 0..2 {
            let p = format!("model.layers.{i}");
            add(format!("{p}.self_attn.q_proj.weight"), (16, 16));
            add(format!("{p}.self_attn.k_proj.weight"), (8, 16));
            add(format!("{p}.self_attn.v_proj.weight"), (8, 16));
            add(format!("{p}.self_attn.o_proj.weight"), (16, 16));
            add(format!("{p}.mlp.gate_proj.weight"), (32, 16));
            add(format!("{p}.mlp.up_proj.weight"), (32, 16));
            add(format!("{p}.mlp.down_proj.weight"), (16, 32));
        }
        for name in [
            "model.norm.weight".to_string(),
            "model.layers.0.input_layernorm.weight".to_string(),
            "model.layers.0.post_attention_layernorm.weight".to_string(),
            "model.layers.1.input_layernorm.weight".to_string(),
            "model.layers.1.post_attention_layernorm.weight".to_string(),
        ] {
            tensors.insert(name, Tensor::ones(16, DType::F32, &device).unwrap());
        }
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let settings = PolicySettings {
            baseline,
            token_budget: 4,
            retrieval: RetrievalParams {
                n_init: 2,
                n_local: 4,
                block_size: 2,
                topk: 1,
                repr_topk: 1,
                max_cached_block: 2,
            },
            // Layer 1 is absent and falls back to the leading channels.
            channels: Some(ChannelConfig::from_map(HashMap::from([(
                "model.layers.0.self_attn.q_proj".to_string(),
                vec![vec![3, 0], vec![2, 1], vec![1, 2], vec![0, 3]],
            )]))),
            num_attention_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        };
        let policies = (0..2).map(|i| settings.build(i).unwrap()).collect();
        Llama::load(vb, &cfg, policies).unwrap()
    }

    #[test]
    fn test_config_aliases() {
        let cfg = tiny_config();
        assert_eq!(cfg.hidden_size, 16);
        assert_eq!(cfg.num_key_value_heads, 2);
        assert_eq!(cfg.rope_theta, 10_000.0);
        assert_eq!(cfg.head_dim(), 4);
    }

    #[test]
    fn test_chunked_prefill_matches_single_pass() {
        let ids = [3u32, 7, 9, 12, 1, 5];
        let mut model = tiny_model(Baseline::Full);
        let mut stats = ExperimentStats::new(2);
        let mut ctx = GenerationContext {
            stats: &mut stats,
            prefetch_offset: 1,
        };
        let whole = model.forward(&ids, 0, &mut ctx).unwrap();
        model.reset();
        model.forward(&ids[..4], 0, &mut ctx).unwrap();
        let chunked = model.forward(&ids[4..], 4, &mut ctx).unwrap();
        assert_eq!(whole.dims(), &[40]);
        let diff = (whole - chunked).unwrap().abs().unwrap().max(0).unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-4);
    }

    #[test]
    fn test_every_baseline_decodes() {
        for baseline in [
            Baseline::Full,
            Baseline::Streaming,
            Baseline::HeavyHitter,
            Baseline::DoubleSparse,
            Baseline::Retrieval,
        ] {
            let mut model = tiny_model(baseline);
            let mut stats = ExperimentStats::new(2);
            let mut ctx = GenerationContext {
                stats: &mut stats,
                prefetch_offset: 1,
            };
            let prompt = (0..12u32).collect::<Vec<_>>();
            let mut offset = 0;
            for chunk in prompt.chunks(5) {
                model.forward(chunk, offset, &mut ctx).unwrap();
                offset += chunk.len();
            }
            for step in 0..3u32 {
                let logits = model.forward(&[step + 20], offset, &mut ctx).unwrap();
                offset += 1;
                let values = logits.to_vec1::<f32>().unwrap();
                assert!(values.iter().all(|v| v.is_finite()), "{baseline:?}");
            }
        }
    }
}
