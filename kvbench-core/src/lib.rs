//! Long-context evaluation of KV-cache compression strategies: load a
//! Llama-family model with one cache policy per layer, run it over
//! LongBench and InfiniteBench tasks, and write the predictions.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub mod chat;
pub mod config;
pub mod dataset;
mod error;
pub mod kv_cache;
pub mod models;
pub mod pipeline;
pub mod predict;
pub mod prompt;
pub mod search;
pub mod shard;
pub mod stats;
pub mod tokenizer;
pub mod truncation;

#[doc(hidden)]
pub mod testing;

pub use chat::{ChatFormatter, ConvType, TokenizerConfig};
pub use config::{EvalConfig, RetrievalParams, RunArgs};
pub use error::KvBenchError;
pub use kv_cache::{Baseline, GenerationContext, KvPolicy};
pub use models::CausalLm;
pub use pipeline::{load_model, CacheOptions, LoadedModel};
pub use predict::{get_pred, predict_dataset, write_predictions, Prediction, PredictOptions};
pub use prompt::PromptTables;
pub use search::GreedySearch;
pub use stats::ExperimentStats;
pub use tokenizer::TextTokenizer;
pub use truncation::Truncation;

/// Install the global `tracing` subscriber. `RUST_LOG` takes precedence;
/// otherwise `info`, or `debug` when `KVBENCH_DEBUG=1`.
pub fn initialize_logging() {
    let is_debug = std::env::var("KVBENCH_DEBUG")
        .unwrap_or_default()
        .contains('1');
    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
