//! Locating, downloading and loading the evaluated model and its tokenizer.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use candle_core::Device;
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use crate::{
    chat::TokenizerConfig,
    config::{ModelSection, RetrievalParams},
    kv_cache::{Baseline, ChannelConfig, PolicySettings},
    models::{
        llama::{Config, Llama, LlamaConfig},
        model_center,
    },
    tokenizer::load_tokenizer_dir,
};

mod weights;

pub use weights::{default_dtype, from_mmaped_safetensors, parse_dtype};

/// Where the files of a checkpoint live on disk.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

fn hub_repo(model_id: &str) -> Result<ApiRepo> {
    let token = env::var("HF_TOKEN")
        .ok()
        .or_else(|| env::var("HF_HUB_TOKEN").ok());
    if token.is_none() {
        info!("No HF token found in HF_TOKEN or HF_HUB_TOKEN, using no token.");
    }
    let api = ApiBuilder::new()
        .with_progress(true)
        .with_token(token)
        .build()?;
    Ok(api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        "main".to_string(),
    )))
}

/// Shard file names listed by a `model.safetensors.index.json`, deduplicated
/// and sorted.
fn index_shards(index: &Path) -> Result<Vec<String>> {
    let index: SafetensorsIndex = serde_json::from_slice(&fs::read(index)?)?;
    let mut shards = index.weight_map.into_values().collect::<Vec<_>>();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

/// Resolve a local checkpoint directory or a Hugging Face model id.
pub fn resolve_model_paths(section: &ModelSection) -> Result<ModelPaths> {
    let local = Path::new(&section.path);
    if section.model_center {
        if !local.is_dir() {
            anyhow::bail!(
                "model-center checkpoints must be local directories, `{}` is not",
                section.path
            );
        }
        return Ok(ModelPaths {
            config: local.join("config.json"),
            weights: vec![local.join(model_center::WEIGHTS_FILE)],
        });
    }

    if local.is_dir() {
        let mut weights = fs::read_dir(local)
            .with_context(|| format!("listing `{}`", local.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect::<Vec<_>>();
        weights.sort();
        if weights.is_empty() {
            anyhow::bail!("no `.safetensors` files in `{}`", local.display());
        }
        return Ok(ModelPaths {
            config: local.join("config.json"),
            weights,
        });
    }

    let api = hub_repo(&section.path)?;
    let config = api.get("config.json")?;
    let weights = match api.get("model.safetensors.index.json") {
        Ok(index) => index_shards(&index)?
            .iter()
            .map(|shard| api.get(shard))
            .collect::<std::result::Result<Vec<_>, _>>()?,
        Err(_) => vec![api.get("model.safetensors")?],
    };
    Ok(ModelPaths { config, weights })
}

/// Directory holding `tokenizer.json` (and maybe `tokenizer_config.json`),
/// downloading both from the Hub if `id` is not a local directory.
pub fn resolve_tokenizer_dir(id: &str) -> Result<PathBuf> {
    let local = Path::new(id);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }
    let api = hub_repo(id)?;
    let tokenizer = api.get("tokenizer.json")?;
    if api.get("tokenizer_config.json").is_err() {
        info!("`{id}` has no tokenizer_config.json.");
    }
    tokenizer
        .parent()
        .map(Path::to_path_buf)
        .context("tokenizer file has no parent directory")
}

/// Cache-related knobs of the model being loaded.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub baseline: Baseline,
    pub token_budget: usize,
    pub retrieval: RetrievalParams,
}

pub struct LoadedModel {
    pub model: Llama,
    pub config: Config,
    pub tokenizer: Tokenizer,
    pub tokenizer_config: Option<TokenizerConfig>,
}

pub fn load_model(section: &ModelSection, cache: &CacheOptions, device: &Device) -> Result<LoadedModel> {
    let paths = resolve_model_paths(section)?;
    let raw_config = fs::read(&paths.config)
        .with_context(|| format!("reading `{}`", paths.config.display()))?;
    let config = serde_json::from_slice::<LlamaConfig>(&raw_config)?.into_config(section.base);

    let dtype = match section.dtype.as_deref() {
        Some(name) => parse_dtype(name)?,
        None => default_dtype(device),
    };
    info!(
        "Loading model `{}` ({} layers) with dtype {dtype:?} on {device:?}.",
        section.path, config.num_hidden_layers
    );

    let channels = section
        .channel_config
        .as_deref()
        .map(ChannelConfig::from_file)
        .transpose()?;
    let settings = PolicySettings {
        baseline: cache.baseline,
        token_budget: cache.token_budget,
        retrieval: cache.retrieval,
        channels,
        num_attention_heads: config.num_attention_heads,
        head_dim: config.head_dim(),
    };
    let policies = (0..config.num_hidden_layers)
        .map(|layer| settings.build(layer))
        .collect::<Result<Vec<_>>>()?;

    let vb = if section.model_center {
        let dir = paths.config.parent().unwrap_or(Path::new("."));
        model_center::var_builder(dir, dtype, device)?
    } else {
        from_mmaped_safetensors(paths.weights, dtype, device, false)?
    };
    let model = Llama::load(vb, &config, policies)?;
    info!("Model loaded with the {:?} cache.", cache.baseline);

    let tokenizer_dir = resolve_tokenizer_dir(section.tokenizer_path())?;
    let (tokenizer, tokenizer_config) = load_tokenizer_dir(&tokenizer_dir)?;
    Ok(LoadedModel {
        model,
        config,
        tokenizer,
        tokenizer_config,
    })
}
