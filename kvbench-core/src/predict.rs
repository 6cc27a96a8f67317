//! The per-example prediction loop and its JSON-lines output.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tqdm::Iter;
use tracing::{debug, info, warn};

use crate::{
    chat::{extra_end_token_ids, ChatFormatter},
    config::EvalConfig,
    dataset::{load_dataset, Example},
    models::CausalLm,
    prompt::{format_prompt, post_process, uses_chat, PromptTables},
    search::GreedySearch,
    shard::select_examples,
    stats::ExperimentStats,
    tokenizer::TextTokenizer,
    truncation::{apply_truncation, Truncation, TruncationOutcome},
    KvBenchError,
};

/// One line of the output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub pred: String,
    pub answers: Vec<Value>,
    pub all_classes: Value,
    pub length: usize,
    /// Prompt tokens plus the generation budget.
    pub token_length: usize,
}

/// Everything the loop needs to know about one dataset pass.
#[derive(Debug, Clone)]
pub struct PredictOptions<'a> {
    pub dataset: &'a str,
    pub prompt_format: &'a str,
    pub max_length: usize,
    pub max_gen: usize,
    pub chunk_size: usize,
    pub truncation: Truncation,
    pub rank: Option<usize>,
    pub world_size: Option<usize>,
    pub verbose: bool,
    pub limit: Option<usize>,
    pub truncate_len: Option<usize>,
    pub save_state: Option<&'a Path>,
    pub skip_first_examples: i64,
    pub max_prompt_len: usize,
    pub samples: Option<usize>,
    pub prefetch_offset: usize,
}

impl<'a> PredictOptions<'a> {
    pub fn from_config(
        cfg: &'a EvalConfig,
        dataset: &'a str,
        prompt_format: &'a str,
        max_gen: usize,
    ) -> Result<Self> {
        let run = &cfg.run;
        Ok(Self {
            dataset,
            prompt_format,
            max_length: cfg.max_len,
            max_gen,
            chunk_size: run.chunk_size,
            truncation: cfg.truncation()?,
            rank: run.rank,
            world_size: run.world_size,
            verbose: run.verbose,
            limit: run.limit,
            truncate_len: run.truncate_len,
            save_state: run.save_state.as_deref(),
            skip_first_examples: run.skip_first_examples,
            max_prompt_len: run.max_prompt_len,
            samples: run.samples,
            prefetch_offset: run.prefetch_offset,
        })
    }
}

/// The last `n` characters of `text`.
fn tail_chars(text: &str, n: usize) -> &str {
    match text.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((start, _)) if n > 0 => &text[start..],
        _ if n == 0 => "",
        _ => text,
    }
}

/// Generate a prediction for every selected example of one dataset.
/// Over-long prompts are skipped and never recorded.
pub fn get_pred<M: CausalLm, T: TextTokenizer>(
    search: &mut GreedySearch<M, T>,
    chat: &ChatFormatter,
    data: Vec<Example>,
    opts: &PredictOptions<'_>,
    stats: &mut ExperimentStats,
) -> Result<Vec<Prediction>> {
    if opts.truncation == Truncation::Suffix && opts.max_length <= opts.max_gen {
        anyhow::bail!(KvBenchError::NoPromptBudget {
            dataset: opts.dataset.to_string(),
            max_length: opts.max_length,
            max_gen: opts.max_gen,
        });
    }
    if let Some(path) = opts.save_state {
        stats.save(path)?;
    }

    let data = select_examples(data, opts.samples, opts.rank, opts.world_size)?;
    let total = data.len();
    let conv_type = chat.conv_type();
    let mut preds = Vec::new();

    for (i, example) in data.into_iter().enumerate().tqdm() {
        if (i as i64) < opts.skip_first_examples {
            info!("Skipping example {i} (skip_first_examples).");
            continue;
        }
        search.clear();
        if opts.limit.is_some_and(|limit| i >= limit) {
            break;
        }

        let prompt = format_prompt(opts.prompt_format, &example.fields)?;
        let extra_end = extra_end_token_ids(search.tokenizer(), conv_type, opts.dataset)?;
        let (prompt, add_special_tokens) = if uses_chat(opts.dataset) {
            (chat.build_chat(&prompt)?, conv_type.adds_special_tokens())
        } else {
            (prompt, true)
        };
        let ids = search.tokenizer().encode(&prompt, add_special_tokens)?;

        let (prompt, mut ids) = match apply_truncation(
            opts.truncation,
            search.tokenizer(),
            prompt,
            ids,
            opts.max_length,
            opts.max_gen,
            add_special_tokens,
        )? {
            TruncationOutcome::Skip { len } => {
                if opts.verbose {
                    info!("Length {len}. Skipped.");
                }
                continue;
            }
            TruncationOutcome::Keep {
                prompt,
                ids,
                truncated,
            } => {
                if truncated && opts.verbose {
                    info!("Example {i} is over length, truncated to {} tokens.", ids.len());
                }
                (prompt, ids)
            }
        };

        debug!("Example {i}: {} prompt tokens.", ids.len());
        if ids.len() > opts.max_prompt_len {
            warn!("Prompt of {} tokens is too long, skipping.", ids.len());
            continue;
        }
        if let Some(truncate_len) = opts.truncate_len {
            ids.truncate(truncate_len);
        }

        let output = search.generate(
            &ids,
            opts.max_gen,
            opts.chunk_size,
            &extra_end,
            opts.prefetch_offset,
            stats,
        )?;
        let pred = post_process(&output.text, conv_type, opts.dataset);
        search.clear();
        stats.examples += 1;

        if opts.verbose {
            info!("----------{}/{total}----------", preds.len() + 1);
            info!("Length: {}", ids.len());
            info!("Question: {}", tail_chars(&prompt, 100));
            info!("Pred: {pred}");
            info!("Answer: {:?}", example.answers);
        }
        preds.push(Prediction {
            pred,
            answers: example.answers,
            all_classes: example.all_classes,
            length: example.length,
            token_length: ids.len() + opts.max_gen,
        });

        if let Some(path) = opts.save_state {
            stats.save(path)?;
        }
    }
    Ok(preds)
}

/// `<dir>/<dataset>.jsonl`, suffixed with `_<rank>` when several processes
/// share the work.
pub fn output_path(dir: &Path, dataset: &str, rank: Option<usize>, multiprocess: bool) -> PathBuf {
    let mut name = format!("{dataset}.jsonl");
    if multiprocess {
        name.push_str(&format!("_{}", rank.unwrap_or(0)));
    }
    dir.join(name)
}

/// One JSON object per line; non-ASCII text is written as UTF-8.
pub fn write_predictions(path: &Path, preds: &[Prediction]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("creating `{}`", path.display()))?;
    let mut out = BufWriter::new(file);
    for pred in preds {
        serde_json::to_writer(&mut out, pred)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Load `dataset`, predict on it and write the output file. Returns the
/// path written.
pub fn predict_dataset<M: CausalLm, T: TextTokenizer>(
    cfg: &EvalConfig,
    tables: &PromptTables,
    search: &mut GreedySearch<M, T>,
    chat: &ChatFormatter,
    dataset: &str,
    stats: &mut ExperimentStats,
) -> Result<PathBuf> {
    let data = load_dataset(&cfg.run.data_dir, dataset)?;
    let prompt_format = tables.prompt_format(dataset)?;
    let max_gen = tables.max_gen(dataset)?;
    info!("Pred {dataset}");

    let opts = PredictOptions::from_config(cfg, dataset, prompt_format, max_gen)?;
    let preds = get_pred(search, chat, data, &opts, stats)?;

    let path = output_path(
        &cfg.run.output_dir_path,
        dataset,
        cfg.run.rank,
        cfg.is_multiprocess(),
    );
    write_predictions(&path, &preds)?;
    info!("Wrote {} predictions to `{}`.", preds.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::json;

    use super::*;
    use crate::{
        chat::ConvType,
        testing::{CharTokenizer, SuccessorLm},
    };

    fn example(context: &str, answer: &str) -> Example {
        let mut fields = IndexMap::new();
        fields.insert("context".to_string(), json!(context));
        Example {
            fields,
            answers: vec![json!(answer)],
            all_classes: Value::Null,
            length: 1,
        }
    }

    fn opts(dataset: &str) -> PredictOptions<'_> {
        PredictOptions {
            dataset,
            prompt_format: "{context}",
            max_length: 40,
            max_gen: 4,
            chunk_size: 8,
            truncation: Truncation::None,
            rank: None,
            world_size: None,
            verbose: true,
            limit: None,
            truncate_len: None,
            save_state: None,
            skip_first_examples: -1,
            max_prompt_len: 1_000_000,
            samples: None,
            prefetch_offset: 1,
        }
    }

    fn search() -> GreedySearch<SuccessorLm, CharTokenizer> {
        GreedySearch::new(SuccessorLm::new(300), CharTokenizer, vec![2])
    }

    #[test]
    fn test_skips_over_length_and_counts_tokens() {
        let chat = ChatFormatter::new(ConvType::Vicuna, None);
        let data = vec![example("abc", "x"), example(&"z".repeat(50), "y"), example("hello", "z")];
        let mut stats = ExperimentStats::new(1);
        let preds = get_pred(&mut search(), &chat, data, &opts("trec"), &mut stats).unwrap();
        assert_eq!(preds.len(), 2);
        // `<s>` plus three characters, then the generation budget.
        assert_eq!(preds[0].token_length, 4 + 4);
        assert_eq!(preds[0].pred, "defg");
        assert_eq!(preds[1].answers, vec![json!("z")]);
        assert_eq!(stats.examples, 2);
    }

    #[test]
    fn test_skip_then_limit() {
        let chat = ChatFormatter::new(ConvType::Vicuna, None);
        let data = (0..6).map(|i| example("ab", &i.to_string())).collect();
        let mut o = opts("lcc");
        o.skip_first_examples = 2;
        o.limit = Some(4);
        let mut stats = ExperimentStats::new(1);
        let preds = get_pred(&mut search(), &chat, data, &o, &mut stats).unwrap();
        let answers = preds.iter().map(|p| p.answers[0].clone()).collect::<Vec<_>>();
        assert_eq!(answers, vec![json!("2"), json!("3")]);
    }

    #[test]
    fn test_suffix_truncation_and_hard_cut() {
        let chat = ChatFormatter::new(ConvType::Vicuna, None);
        let mut o = opts("samsum");
        o.max_length = 300;
        o.max_gen = 10;
        o.truncation = Truncation::Suffix;
        o.truncate_len = Some(200);
        let mut stats = ExperimentStats::new(1);
        let data = vec![example(&"q".repeat(1000), "a")];
        let preds = get_pred(&mut search(), &chat, data, &o, &mut stats).unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].token_length, 200 + 10);
    }

    #[test]
    fn test_suffix_without_prompt_budget_is_rejected() {
        let chat = ChatFormatter::new(ConvType::Vicuna, None);
        let mut o = opts("samsum");
        o.max_length = 4;
        o.max_gen = 4;
        o.truncation = Truncation::Suffix;
        let mut stats = ExperimentStats::new(1);
        let err = get_pred(&mut search(), &chat, vec![example("abc", "a")], &o, &mut stats)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KvBenchError>(),
            Some(KvBenchError::NoPromptBudget { max_gen: 4, .. })
        ));

        // Without truncation the same settings just skip every prompt.
        o.truncation = Truncation::None;
        let preds = get_pred(&mut search(), &chat, vec![example("abc", "a")], &o, &mut stats).unwrap();
        assert!(preds.is_empty());
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
        assert_eq!(tail_chars("ab", 100), "ab");
        assert_eq!(tail_chars("ab", 0), "");
    }

    #[test]
    fn test_output_path() {
        let dir = Path::new("out");
        assert_eq!(output_path(dir, "qasper", Some(3), false), Path::new("out/qasper.jsonl"));
        assert_eq!(output_path(dir, "qasper", Some(3), true), Path::new("out/qasper.jsonl_3"));
    }

    #[test]
    fn test_writes_utf8_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preds/lsht.jsonl");
        let pred = Prediction {
            pred: "北京".to_string(),
            answers: vec![json!("北京")],
            all_classes: json!(["北京", "上海"]),
            length: 12,
            token_length: 40,
        };
        write_predictions(&path, &[pred.clone(), pred]).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("北京"));
        let first: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        for key in ["pred", "answers", "all_classes", "length", "token_length"] {
            assert!(first.get(key).is_some(), "missing {key}");
        }
    }
}
