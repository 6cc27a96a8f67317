//! Statistics gathered by the cache policies over an experiment. Threaded
//! explicitly through the generation call and persisted across runs.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Steps that performed a block retrieval.
    pub retrievals: u64,
    /// Memory blocks attended, summed over retrievals.
    pub blocks_retrieved: u64,
    /// Retrieved blocks that were already resident.
    pub cache_hits: u64,
    /// Retrieved blocks that had to be brought in.
    pub cache_misses: u64,
    /// Tokens dropped or moved out of the attended window.
    pub evicted_tokens: u64,
    /// Decode steps that attended over a sparse subset of the cache.
    pub sparse_steps: u64,
    /// Cache entries attended, summed over steps.
    pub attended_tokens: u64,
}

impl LayerStats {
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        (total > 0).then(|| self.cache_hits as f64 / total as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStats {
    pub layers: Vec<LayerStats>,
    pub examples: u64,
    pub generated_tokens: u64,
}

impl ExperimentStats {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![LayerStats::default(); num_layers],
            ..Default::default()
        }
    }

    /// Stats of `layer`, growing the table when a model has more layers
    /// than the loaded state.
    pub fn layer_mut(&mut self, layer: usize) -> &mut LayerStats {
        if self.layers.len() <= layer {
            self.layers.resize(layer + 1, LayerStats::default());
        }
        &mut self.layers[layer]
    }

    pub fn total(&self) -> LayerStats {
        self.layers.iter().fold(LayerStats::default(), |mut acc, l| {
            acc.retrievals += l.retrievals;
            acc.blocks_retrieved += l.blocks_retrieved;
            acc.cache_hits += l.cache_hits;
            acc.cache_misses += l.cache_misses;
            acc.evicted_tokens += l.evicted_tokens;
            acc.sparse_steps += l.sparse_steps;
            acc.attended_tokens += l.attended_tokens;
            acc
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("reading state `{}`", path.display()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing state `{}`", path.display()))
    }
}

/// `./logs/stats-<stem>.json` for an attention-config path.
pub fn stats_dump_path(att_config: &Path) -> std::path::PathBuf {
    let stem = att_config
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attention".to_string());
    Path::new("./logs").join(format!("stats-{stem}.json"))
}
