//! Experiment configuration: a YAML file, merged with `key=value` overrides
//! from the command line, with every CLI-derived field copied on top.

use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::{truncation::Truncation, KvBenchError};

/// Parameters of the retrieval-augmented (inf-llm) cache. They live in the
/// `model` section of the config, next to the model path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalParams {
    /// Tokens at the start of the sequence that are always attended.
    pub n_init: usize,
    /// Size of the sliding local window.
    pub n_local: usize,
    /// Tokens per memory block.
    pub block_size: usize,
    /// Memory blocks retrieved per step.
    pub topk: usize,
    /// Representative keys kept per memory block.
    pub repr_topk: usize,
    /// Blocks that stay resident before a retrieval counts as a miss.
    pub max_cached_block: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            n_init: 128,
            n_local: 4096,
            block_size: 128,
            topk: 16,
            repr_topk: 4,
            max_cached_block: 32,
        }
    }
}

impl RetrievalParams {
    /// Overlay the fields of a YAML document onto these parameters. Fields the
    /// document leaves out keep their current value.
    pub fn merged_with(&self, raw: &str) -> Result<Self> {
        let mut value = serde_yaml::to_value(self)?;
        match serde_yaml::from_str::<Value>(raw)? {
            Value::Null => {}
            Value::Mapping(overlay) => {
                if let Value::Mapping(base) = &mut value {
                    base.extend(overlay);
                }
            }
            other => anyhow::bail!("attention config must be a mapping, got `{other:?}`"),
        }
        Ok(serde_yaml::from_value(value)?)
    }

    /// Apply the attention-config file named by `ATT_CONFIG`.
    pub fn with_attention_config(&self, path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading attention config `{}`", path.display()))?;
        self.merged_with(&raw)
            .with_context(|| format!("parsing attention config `{}`", path.display()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub path: String,
    #[serde(default)]
    pub tokenizer_path: Option<String>,
    /// Cache type for model-center checkpoints (`inf-llm`, `stream-llm`, `origin`).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub model_center: bool,
    /// Label-channel file for the `ds` baseline.
    #[serde(default)]
    pub channel_config: Option<PathBuf>,
    /// Overrides the rope base of the checkpoint.
    #[serde(default)]
    pub base: Option<f32>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(flatten)]
    pub retrieval: RetrievalParams,
}

impl ModelSection {
    pub fn tokenizer_path(&self) -> &str {
        self.tokenizer_path.as_deref().unwrap_or(&self.path)
    }
}

/// Fields that come from the command line and are copied onto the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunArgs {
    pub output_dir_path: PathBuf,
    pub datasets: Vec<String>,
    pub model_center: bool,
    pub rank: Option<usize>,
    pub world_size: Option<usize>,
    pub chunk_size: usize,
    pub verbose: bool,
    pub limit: Option<usize>,
    pub truncate_len: Option<usize>,
    pub runs: usize,
    pub save_state: Option<PathBuf>,
    pub load_state: Option<PathBuf>,
    pub skip_first_examples: i64,
    pub max_prompt_len: usize,
    pub samples: Option<usize>,
    pub prefetch_offset: usize,
    pub token_budget: usize,
    pub baseline: Option<String>,
    pub data_dir: PathBuf,
    pub prompt_config_dir: PathBuf,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            output_dir_path: PathBuf::new(),
            datasets: Vec::new(),
            model_center: false,
            rank: None,
            world_size: None,
            chunk_size: 128,
            verbose: false,
            limit: None,
            truncate_len: None,
            runs: 1,
            save_state: None,
            load_state: None,
            skip_first_examples: -1,
            max_prompt_len: 1_000_000,
            samples: None,
            prefetch_offset: 1,
            token_budget: 4096,
            baseline: None,
            data_dir: PathBuf::from("benchmark/data"),
            prompt_config_dir: PathBuf::from("benchmark/config"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub model: ModelSection,
    pub max_len: usize,
    pub conv_type: String,
    #[serde(default)]
    pub truncation: Option<String>,
    #[serde(flatten)]
    pub run: RunArgs,
}

impl EvalConfig {
    /// Load the YAML file at `path` and apply dot-list `overrides`
    /// (`model.path=/models/llama`, `max_len=32000`).
    pub fn load<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config `{}`", path.display()))?;
        Self::from_yaml_str(&raw, overrides)
    }

    pub fn from_yaml_str(raw: &str, overrides: &[String]) -> Result<Self> {
        let mut value: Value = serde_yaml::from_str(raw)?;
        if value.is_null() {
            value = Value::Mapping(Mapping::new());
        }
        for item in overrides {
            apply_override(&mut value, item)?;
        }
        Ok(serde_yaml::from_value(value)?)
    }

    /// Copy the command-line fields onto the config.
    pub fn apply_args(&mut self, args: RunArgs) {
        self.model.model_center = args.model_center;
        self.run = args;
    }

    pub fn truncation(&self) -> Result<Truncation> {
        Ok(Truncation::from_name(self.truncation.as_deref())?)
    }

    /// `world_size > 1`: this process owns one shard and names its output by rank.
    pub fn is_multiprocess(&self) -> bool {
        self.run.world_size.is_some_and(|w| w > 1)
    }

    pub fn validate_shard(&self) -> Result<()> {
        if let Some(world_size) = self.run.world_size {
            let rank = self.run.rank.unwrap_or(0);
            if rank >= world_size.max(1) {
                anyhow::bail!(KvBenchError::InvalidRank { rank, world_size });
            }
        }
        Ok(())
    }
}

fn apply_override(root: &mut Value, item: &str) -> Result<()> {
    let Some((key, raw)) = item.split_once('=') else {
        anyhow::bail!(KvBenchError::MalformedOverride(item.to_string()))
    };
    let key = key.trim().trim_start_matches("--");
    if key.is_empty() {
        anyhow::bail!(KvBenchError::MalformedOverride(item.to_string()));
    }
    let parsed = serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.into()));
    let parts = key.split('.').collect::<Vec<_>>();
    set_path(root, &parts, parsed);
    Ok(())
}

fn set_path(node: &mut Value, parts: &[&str], value: Value) {
    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = node else {
        return;
    };
    let key = Value::String(parts[0].to_string());
    if parts.len() == 1 {
        map.insert(key, value);
        return;
    }
    if !map.contains_key(&key) {
        map.insert(key.clone(), Value::Null);
    }
    if let Some(child) = map.get_mut(&key) {
        set_path(child, &parts[1..], value);
    }
}

/// Split a comma-separated dataset list, tolerating whitespace and trailing commas.
pub fn parse_datasets(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_matches(',')
        .split(',')
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect()
}
