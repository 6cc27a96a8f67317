use std::{env, fs, path::PathBuf};

use candle_core::Device;
use clap::Parser;
use kvbench_core::{
    config::parse_datasets, initialize_logging, load_model, predict_dataset,
    stats::stats_dump_path, tokenizer::eos_token_ids, Baseline, CacheOptions, ChatFormatter,
    ConvType, EvalConfig, ExperimentStats, GreedySearch, LoadedModel, PromptTables, RunArgs,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// YAML experiment config.
    #[arg(long, alias = "config_path")]
    config_path: PathBuf,

    /// Directory the `<dataset>.jsonl` files are written to.
    #[arg(long, alias = "output_dir_path")]
    output_dir_path: PathBuf,

    /// Comma-separated dataset names.
    #[arg(long)]
    datasets: String,

    /// Load a model-center checkpoint (`pytorch_model.pt`).
    #[arg(long, alias = "model_center")]
    model_center: bool,

    /// This process's shard index.
    #[arg(long)]
    rank: Option<usize>,

    /// Number of shards the data is split into.
    #[arg(long, alias = "world_size")]
    world_size: Option<usize>,

    /// Prompt tokens fed to the model per prefill step.
    #[arg(long, alias = "chunk_size", default_value_t = 128)]
    chunk_size: usize,

    #[arg(long)]
    verbose: bool,

    /// Stop after this many examples of each dataset.
    #[arg(long)]
    limit: Option<usize>,

    /// Cut every prompt to this many tokens.
    #[arg(long, alias = "truncate_len")]
    truncate_len: Option<usize>,

    /// Passes over all datasets.
    #[arg(long, default_value_t = 1)]
    runs: usize,

    /// Persist the experiment statistics here before and after every example.
    #[arg(long, alias = "save_usa")]
    save_state: Option<PathBuf>,

    /// Resume the experiment statistics from this file.
    #[arg(long, alias = "load_usa")]
    load_state: Option<PathBuf>,

    /// Skip examples with an index below this.
    #[arg(long, alias = "skip_first_examples", default_value_t = -1, allow_hyphen_values = true)]
    skip_first_examples: i64,

    /// Skip prompts longer than this many tokens after truncation.
    #[arg(long, alias = "max_prompt_len", default_value_t = 1_000_000)]
    max_prompt_len: usize,

    /// Only evaluate the example at this index.
    #[arg(long)]
    samples: Option<usize>,

    /// How many steps old the retrieval query is.
    #[arg(long, alias = "prefetch_offset", default_value_t = 1)]
    prefetch_offset: usize,

    /// Cache budget of the h2o, ds and streaming baselines.
    #[arg(long, alias = "token_budget", default_value_t = 4096)]
    token_budget: usize,

    /// One of `h2o`, `ds`, `inf-llm`, `streaming`.
    #[arg(long)]
    baseline: Option<String>,

    /// Root of `infinite-bench/` and `longbench/`.
    #[arg(long, default_value = "benchmark/data")]
    data_dir: PathBuf,

    /// Directory holding `dataset2prompt.json` and `dataset2maxlen.json`.
    #[arg(long, default_value = "benchmark/config")]
    prompt_config_dir: PathBuf,

    /// `key.path=value` config overrides.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    overrides: Vec<String>,
}

impl Args {
    fn run_args(&self) -> RunArgs {
        RunArgs {
            output_dir_path: self.output_dir_path.clone(),
            datasets: parse_datasets(&self.datasets),
            model_center: self.model_center,
            rank: self.rank,
            world_size: self.world_size,
            chunk_size: self.chunk_size,
            verbose: self.verbose,
            limit: self.limit,
            truncate_len: self.truncate_len,
            runs: self.runs,
            save_state: self.save_state.clone(),
            load_state: self.load_state.clone(),
            skip_first_examples: self.skip_first_examples,
            max_prompt_len: self.max_prompt_len,
            samples: self.samples,
            prefetch_offset: self.prefetch_offset,
            token_budget: self.token_budget,
            baseline: self.baseline.clone(),
            data_dir: self.data_dir.clone(),
            prompt_config_dir: self.prompt_config_dir.clone(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    let mut cfg = EvalConfig::load(&args.config_path, &args.overrides)?;
    cfg.apply_args(args.run_args());
    info!("Config:\n{}", serde_yaml::to_string(&cfg)?);

    let att_config = env::var_os("ATT_CONFIG").map(PathBuf::from);
    let baseline = Baseline::resolve(
        cfg.run.baseline.as_deref(),
        cfg.model.model_center,
        cfg.model.kind.as_deref(),
        att_config.is_some(),
    )?;
    let retrieval = match &att_config {
        Some(path) => cfg.model.retrieval.with_attention_config(path)?,
        None => cfg.model.retrieval,
    };
    let conv_type: ConvType = cfg.conv_type.parse()?;
    cfg.truncation()?;
    cfg.validate_shard()?;

    let device = Device::cuda_if_available(0)?;
    let cache = CacheOptions {
        baseline,
        token_budget: cfg.run.token_budget,
        retrieval,
    };
    let LoadedModel {
        model,
        config,
        tokenizer,
        tokenizer_config,
    } = load_model(&cfg.model, &cache, &device)?;

    let mut stats = match &cfg.run.load_state {
        Some(path) => {
            info!("Loading experiment state from `{}`.", path.display());
            ExperimentStats::load(path)?
        }
        None => ExperimentStats::new(config.num_hidden_layers),
    };

    let tables = PromptTables::load(&cfg.run.prompt_config_dir)?;
    let eos = eos_token_ids(&tokenizer, tokenizer_config.as_ref());
    let chat = ChatFormatter::new(conv_type, tokenizer_config);
    let mut search = GreedySearch::new(model, tokenizer, eos);
    fs::create_dir_all(&cfg.run.output_dir_path)?;

    for run in 0..cfg.run.runs {
        info!("Run {}/{}.", run + 1, cfg.run.runs);
        for dataset in &cfg.run.datasets {
            predict_dataset(&cfg, &tables, &mut search, &chat, dataset, &mut stats)?;
        }
    }

    let total = stats.total();
    info!(
        "{} examples, {} generated tokens, {} retrievals, block hit rate {:?}.",
        stats.examples,
        stats.generated_tokens,
        total.retrievals,
        total.hit_rate()
    );
    if let Some(path) = att_config {
        let out = stats_dump_path(&path);
        stats.save(&out)?;
        info!("Dumped statistics to `{}`.", out.display());
    }
    Ok(())
}
