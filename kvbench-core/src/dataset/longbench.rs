use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::{read_jsonl, word_count, Example};
use crate::KvBenchError;

/// Read a LongBench task: either the directory `dir/<task>/` holding
/// JSON-lines shards (read in file-name order), or the file `dir/<task>.jsonl`.
pub fn load_longbench(dir: &Path, task: &str) -> Result<Vec<Example>> {
    let task_dir = dir.join(task);
    let shards = if task_dir.is_dir() {
        let mut shards = fs::read_dir(&task_dir)
            .with_context(|| format!("listing `{}`", task_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect::<Vec<_>>();
        shards.sort();
        if shards.is_empty() {
            anyhow::bail!("no `.jsonl` shards in `{}`", task_dir.display());
        }
        shards
    } else {
        vec![dir.join(format!("{task}.jsonl"))]
    };

    let mut data = Vec::new();
    for shard in shards {
        for record in read_jsonl(&shard)? {
            data.push(example_from_record(task, record)?);
        }
    }
    Ok(data)
}

/// Keep every field of a LongBench record for prompt substitution.
pub fn example_from_record(task: &str, record: Map<String, Value>) -> Result<Example, KvBenchError> {
    let answers = match record.get("answers") {
        Some(Value::Array(list)) => list.clone(),
        Some(other) => vec![other.clone()],
        None => {
            return Err(KvBenchError::MissingField {
                task: task.to_string(),
                field: "answers".to_string(),
            })
        }
    };
    let all_classes = record.get("all_classes").cloned().unwrap_or(Value::Null);
    let length = match record.get("length").and_then(Value::as_u64) {
        Some(len) => len as usize,
        None => record
            .get("context")
            .and_then(Value::as_str)
            .map(word_count)
            .unwrap_or_default(),
    };
    Ok(Example {
        fields: record.into_iter().collect(),
        answers,
        all_classes,
        length,
    })
}
