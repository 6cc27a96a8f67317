//! Benchmark records and the two on-disk dataset conventions.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::info;

mod infinite_bench;
mod longbench;

pub use infinite_bench::{build_instance, get_answer, load_infinite_bench, INFINITE_BENCH_TASKS};
pub use longbench::{example_from_record, load_longbench};

/// One benchmark example, ready for prompt construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// Values substituted into the dataset's prompt format.
    pub fields: IndexMap<String, Value>,
    pub answers: Vec<Value>,
    /// `null` or the list of label classes (classification tasks).
    pub all_classes: Value,
    pub length: usize,
}

impl Example {
    pub fn context(&self) -> Option<&str> {
        self.fields.get("context").and_then(Value::as_str)
    }
}

pub fn is_infinite_bench(name: &str) -> bool {
    INFINITE_BENCH_TASKS.contains(&name)
}

/// Load `name` from `data_dir`: InfiniteBench tasks from
/// `data_dir/infinite-bench/<name>.jsonl`, everything else from
/// `data_dir/longbench/<name>`.
pub fn load_dataset(data_dir: &Path, name: &str) -> Result<Vec<Example>> {
    let data = if is_infinite_bench(name) {
        load_infinite_bench(&data_dir.join("infinite-bench"), name)?
    } else {
        load_longbench(&data_dir.join("longbench"), name)?
    };
    info!("Loaded {} examples for `{name}`.", data.len());
    Ok(data)
}

/// Number of whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub(crate) fn read_jsonl(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let file = File::open(path).with_context(|| format!("opening `{}`", path.display()))?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("parsing line {} of `{}`", i + 1, path.display()))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("  a quick\n brown\tfox "), 4);
        assert_eq!(word_count(""), 0);
    }

    #[test]
    fn test_task_routing() {
        assert!(is_infinite_bench("kv_retrieval"));
        assert!(is_infinite_bench("math_calc"));
        assert!(!is_infinite_bench("narrativeqa"));
    }
}
