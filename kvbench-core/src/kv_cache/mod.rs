//! Per-layer KV-cache policies. Each attention layer hands its rotated
//! queries, keys and values to a [`KvPolicy`], which owns the cached state,
//! decides what is attended, and computes the attention output.

use std::{collections::HashMap, fs, path::Path, str::FromStr};

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor};

use crate::{config::RetrievalParams, stats::ExperimentStats, KvBenchError};

mod double_sparse;
mod full;
mod heavy_hitter;
mod retrieval;
mod streaming;

pub use double_sparse::DoubleSparseCache;
pub use full::FullCache;
pub use heavy_hitter::HeavyHitterCache;
pub use retrieval::RetrievalCache;
pub use streaming::StreamingCache;

/// Tokens kept at the head of the sequence by the h2o and streaming baselines.
pub const INIT_BUDGET: usize = 128;
/// Most recent tokens always kept by the h2o baseline.
pub const RECENT_BUDGET: usize = 128;

/// Per-call state threaded from the generation loop down to every layer.
pub struct GenerationContext<'a> {
    pub stats: &'a mut ExperimentStats,
    /// Retrieval uses the query from this many steps earlier.
    pub prefetch_offset: usize,
}

pub trait KvPolicy: Send + std::fmt::Debug {
    /// `q` is `(b, n_heads, q_len, head_dim)`, `k` and `v` are
    /// `(b, n_kv_heads, q_len, head_dim)`, all rotated. The new tokens follow
    /// everything already cached. Returns `(b, n_heads, q_len, head_dim)`.
    fn attend(
        &mut self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor>;

    fn reset(&mut self);

    /// Number of cached tokens.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The cache strategy under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    /// Unmodified attention over the whole cache.
    Full,
    /// `h2o`: init + heavy hitters + recent window.
    HeavyHitter,
    /// `ds`: sparse decode attention selected through label channels.
    DoubleSparse,
    /// `streaming`: attention sinks + sliding window.
    Streaming,
    /// `inf-llm`: init + retrieved memory blocks + local window.
    Retrieval,
}

impl FromStr for Baseline {
    type Err = KvBenchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "h2o" => Ok(Self::HeavyHitter),
            "ds" => Ok(Self::DoubleSparse),
            "inf-llm" => Ok(Self::Retrieval),
            "streaming" => Ok(Self::Streaming),
            other => Err(KvBenchError::UnknownBaseline(other.to_string())),
        }
    }
}

impl Baseline {
    /// Cache type names used by model-center configs.
    pub fn from_model_type(kind: &str) -> std::result::Result<Self, KvBenchError> {
        match kind {
            "inf-llm" => Ok(Self::Retrieval),
            "stream-llm" => Ok(Self::Streaming),
            "origin" => Ok(Self::Full),
            other => Err(KvBenchError::UnknownBaseline(other.to_string())),
        }
    }

    /// Pick the strategy: an attention-config file selects retrieval, then
    /// the `--baseline` flag, then the model-center `type`, then full attention.
    pub fn resolve(
        baseline: Option<&str>,
        model_center: bool,
        model_type: Option<&str>,
        has_attention_config: bool,
    ) -> std::result::Result<Self, KvBenchError> {
        match (baseline, has_attention_config) {
            (Some(name), true) => Err(KvBenchError::AttentionConfigConflict(name.to_string())),
            (None, true) => Ok(Self::Retrieval),
            (Some(name), false) => name.parse(),
            (None, false) => match model_type {
                Some(kind) if model_center => Self::from_model_type(kind),
                _ => Ok(Self::Full),
            },
        }
    }
}

/// Outlier channels per query head, keyed like
/// `model.layers.{i}.self_attn.q_proj`.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig(HashMap<String, Vec<Vec<usize>>>);

impl ChannelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("reading channel config `{}`", path.display()))?;
        Ok(Self(serde_json::from_slice(&raw)?))
    }

    pub fn from_map(map: HashMap<String, Vec<Vec<usize>>>) -> Self {
        Self(map)
    }

    pub fn for_layer(&self, layer: usize) -> Option<&Vec<Vec<usize>>> {
        self.0.get(&format!("model.layers.{layer}.self_attn.q_proj"))
    }
}

/// Everything needed to instantiate the per-layer policies.
#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub baseline: Baseline,
    pub token_budget: usize,
    pub retrieval: RetrievalParams,
    pub channels: Option<ChannelConfig>,
    pub num_attention_heads: usize,
    pub head_dim: usize,
}

impl PolicySettings {
    /// The first `head_dim / 8` outlier channels of every query head of
    /// `layer`. Layers missing from the channel config use the leading channels.
    pub fn label_channels(&self, layer: usize) -> anyhow::Result<Vec<Vec<usize>>> {
        let Some(channels) = self.channels.as_ref() else {
            anyhow::bail!(KvBenchError::MissingConfigKey("ds", "model.channel_config"))
        };
        let n = (self.head_dim / 8).max(1);
        Ok(match channels.for_layer(layer) {
            Some(heads) => heads
                .iter()
                .map(|chans| chans.iter().copied().take(n).collect())
                .collect(),
            None => vec![(0..n).collect(); self.num_attention_heads],
        })
    }

    pub fn build(&self, layer: usize) -> anyhow::Result<Box<dyn KvPolicy>> {
        let policy: Box<dyn KvPolicy> = match self.baseline {
            Baseline::Full => Box::new(FullCache::new(layer)),
            Baseline::Streaming => Box::new(StreamingCache::new(
                layer,
                INIT_BUDGET,
                self.token_budget + INIT_BUDGET,
            )),
            Baseline::HeavyHitter => Box::new(HeavyHitterCache::new(
                layer,
                INIT_BUDGET,
                self.token_budget,
                RECENT_BUDGET,
            )),
            Baseline::DoubleSparse => Box::new(DoubleSparseCache::new(
                layer,
                self.token_budget,
                self.label_channels(layer)?,
            )),
            Baseline::Retrieval => Box::new(RetrievalCache::new(layer, self.retrieval)),
        };
        Ok(policy)
    }
}

pub(crate) fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        Ok(x)
    } else {
        let (b_sz, n_kv_head, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)?
            .expand((b_sz, n_kv_head, n_rep, seq_len, head_dim))?
            .reshape((b_sz, n_kv_head * n_rep, seq_len, head_dim))
    }
}

/// `1` where query `i` (the last `q_len` keys are the queries themselves)
/// may not look at key `j`.
pub(crate) fn causal_mask(q_len: usize, kv_len: usize, device: &Device) -> Result<Tensor> {
    let offset = kv_len - q_len;
    let mask: Vec<u8> = (0..q_len)
        .flat_map(|i| (0..kv_len).map(move |j| u8::from(j > offset + i)))
        .collect();
    Tensor::from_slice(&mask, (q_len, kv_len), device)
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// Softmax attention of `q` over `k`/`v` (GQA heads are repeated). The last
/// `q_len` keys are the queries' own tokens and are causally masked. Returns
/// the output in the input dtype and the F32 attention probabilities.
pub(crate) fn scaled_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
    let in_dtype = q.dtype();
    let (_, n_heads, q_len, head_dim) = q.dims4()?;
    let n_rep = n_heads / k.dim(1)?;
    let kv_len = k.dim(2)?;

    let q = q.to_dtype(DType::F32)?.contiguous()?;
    let k = repeat_kv(k.to_dtype(DType::F32)?, n_rep)?.contiguous()?;
    let v = repeat_kv(v.to_dtype(DType::F32)?, n_rep)?.contiguous()?;

    let att = (q.matmul(&k.t()?)? / (head_dim as f64).sqrt())?;
    let att = if q_len > 1 {
        let mask = causal_mask(q_len, kv_len, att.device())?.broadcast_as(att.shape())?;
        masked_fill(&att, &mask, f32::NEG_INFINITY)?
    } else {
        att
    };
    let probs = candle_nn::ops::softmax_last_dim(&att)?;
    let out = probs.matmul(&v)?.to_dtype(in_dtype)?;
    Ok((out, probs))
}

/// Length along the sequence dimension of an optional cache tensor.
pub(crate) fn seq_len(t: &Option<Tensor>) -> usize {
    t.as_ref().and_then(|t| t.dim(2).ok()).unwrap_or(0)
}

/// Append `new` to an optional cache tensor along the sequence dimension.
pub(crate) fn append(cache: &Option<Tensor>, new: &Tensor) -> Result<Tensor> {
    match cache {
        Some(prev) => Tensor::cat(&[prev, new], 2)?.contiguous(),
        None => new.contiguous(),
    }
}

/// Keep only the given sequence positions.
pub(crate) fn select_positions(t: &Tensor, keep: &[u32]) -> Result<Tensor> {
    let idx = Tensor::from_slice(keep, keep.len(), t.device())?;
    t.index_select(&idx, 2)?.contiguous()
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_baseline_names() {
        assert_eq!("h2o".parse::<Baseline>().unwrap(), Baseline::HeavyHitter);
        assert_eq!("inf-llm".parse::<Baseline>().unwrap(), Baseline::Retrieval);
        assert!(matches!(
            "quest".parse::<Baseline>(),
            Err(KvBenchError::UnknownBaseline(_))
        ));
    }

    #[test]
    fn test_resolve() {
        assert_eq!(Baseline::resolve(None, false, Some("inf-llm"), false).unwrap(), Baseline::Full);
        assert_eq!(
            Baseline::resolve(None, true, Some("stream-llm"), false).unwrap(),
            Baseline::Streaming
        );
        assert_eq!(Baseline::resolve(Some("ds"), false, None, false).unwrap(), Baseline::DoubleSparse);
        assert_eq!(Baseline::resolve(None, false, None, true).unwrap(), Baseline::Retrieval);
        assert!(matches!(
            Baseline::resolve(Some("h2o"), false, None, true),
            Err(KvBenchError::AttentionConfigConflict(_))
        ));
    }

    #[test]
    fn test_causal_mask_offset() {
        let mask = causal_mask(2, 4, &Device::Cpu).unwrap().to_vec2::<u8>().unwrap();
        assert_eq!(mask, vec![vec![0, 0, 0, 1], vec![0, 0, 0, 0]]);
    }

    #[test]
    fn test_single_key_attention_returns_value() {
        let (q, k, v) = qkv(1).unwrap();
        let (out, probs) = scaled_attention(&q, &k, &v).unwrap();
        assert_eq!(out.dims4().unwrap(), (1, HEADS, 1, DIM));
        let probs = probs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(probs.iter().all(|p| (p - 1.0).abs() < 1e-6));
        // Query heads 0 and 1 share kv head 0.
        let expected = v.get(0).unwrap().get(0).unwrap();
        let got = out.get(0).unwrap().get(1).unwrap();
        let diff = (expected - got).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn test_ds_requires_channels() {
        let settings = PolicySettings {
            baseline: Baseline::DoubleSparse,
            token_budget: 16,
            retrieval: RetrievalParams::default(),
            channels: None,
            num_attention_heads: HEADS,
            head_dim: DIM,
        };
        assert!(settings.build(0).is_err());
        let settings = PolicySettings {
            channels: Some(ChannelConfig::default()),
            ..settings
        };
        assert!(settings.build(0).is_ok());
    }

    #[test]
    fn test_label_channels_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        let heads = (0..HEADS)
            .map(|h| (0..DIM).rev().map(|c| (c + h) % DIM).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        fs::write(
            &path,
            serde_json::json!({ "model.layers.1.self_attn.q_proj": heads }).to_string(),
        )
        .unwrap();
        let settings = PolicySettings {
            baseline: Baseline::DoubleSparse,
            token_budget: 16,
            retrieval: RetrievalParams::default(),
            channels: Some(ChannelConfig::from_file(&path).unwrap()),
            num_attention_heads: HEADS,
            head_dim: 16,
        };
        // head_dim 16 gives two label channels per head.
        assert_eq!(
            settings.label_channels(1).unwrap(),
            vec![vec![7, 6], vec![0, 7], vec![1, 0], vec![2, 1]]
        );
        assert_eq!(settings.label_channels(0).unwrap(), vec![vec![0, 1]; HEADS]);
        assert!(ChannelConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
