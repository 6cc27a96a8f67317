use std::path::Path;

use anyhow::Result;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::info;

use super::{read_jsonl, word_count, Example};
use crate::KvBenchError;

pub const INFINITE_BENCH_TASKS: [&str; 12] = [
    "kv_retrieval",
    "passkey",
    "number_string",
    "code_run",
    "code_debug",
    "longdialogue_qa_eng",
    "longbook_qa_eng",
    "longbook_sum_eng",
    "longbook_choice_eng",
    "longbook_qa_chn",
    "math_find",
    "math_calc",
];

const OPTIONS: [&str; 4] = ["A", "B", "C", "D"];

static FUNC_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"func_[0-9]+\(-?[0-9]+\)").expect("valid regex"));
static TARGET_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"The .+ of").expect("valid regex"));

pub fn load_infinite_bench(dir: &Path, task: &str) -> Result<Vec<Example>> {
    let path = dir.join(format!("{task}.jsonl"));
    info!("read {task}.jsonl");
    read_jsonl(&path)?
        .iter()
        .map(|eg| build_instance(task, eg))
        .collect()
}

fn field<'a>(eg: &'a Map<String, Value>, task: &str, name: &str) -> Result<&'a Value, KvBenchError> {
    eg.get(name).ok_or_else(|| KvBenchError::MissingField {
        task: task.to_string(),
        field: name.to_string(),
    })
}

fn str_field<'a>(eg: &'a Map<String, Value>, task: &str, name: &str) -> Result<&'a str, KvBenchError> {
    field(eg, task, name)?
        .as_str()
        .ok_or_else(|| KvBenchError::MissingField {
            task: task.to_string(),
            field: format!("{name} (as string)"),
        })
}

/// `content` when the record has it, `context` otherwise.
fn content_or_context<'a>(eg: &'a Map<String, Value>, task: &str) -> Result<&'a str, KvBenchError> {
    if eg.contains_key("content") {
        str_field(eg, task, "content")
    } else {
        str_field(eg, task, "context")
    }
}

fn option_fields(
    instance: &mut IndexMap<String, Value>,
    eg: &Map<String, Value>,
    task: &str,
) -> Result<(), KvBenchError> {
    let options = field(eg, task, "options")?
        .as_array()
        .filter(|o| o.len() >= 4)
        .ok_or_else(|| KvBenchError::MissingField {
            task: task.to_string(),
            field: "options (four entries)".to_string(),
        })?;
    for (letter, option) in OPTIONS.iter().zip(options) {
        instance.insert(format!("OPTION_{letter}"), option.clone());
    }
    Ok(())
}

/// Build the prompt fields of one InfiniteBench record.
pub fn build_instance(task: &str, eg: &Map<String, Value>) -> Result<Example> {
    let mut instance = IndexMap::new();
    let text = |s: &str| Value::String(s.to_string());

    match task {
        "code_run" => {
            let input = str_field(eg, task, "input")?;
            let Some(found) = FUNC_CALL.find(input) else {
                anyhow::bail!(KvBenchError::MalformedInput {
                    task: task.to_string(),
                    reason: "no `func_N(M)` call in input".to_string(),
                })
            };
            let func_call = found.as_str();
            let func = func_call.split('(').next().unwrap_or(func_call);
            instance.insert("func".to_string(), text(func));
            instance.insert("func_call".to_string(), text(func_call));
            instance.insert("context".to_string(), text(str_field(eg, task, "context")?));
        }
        "code_debug" | "code_debug_qa" => {
            instance.insert("context".to_string(), text(str_field(eg, task, "context")?));
            if task == "code_debug" {
                option_fields(&mut instance, eg, task)?;
            }
        }
        "longdialogue_qa_eng" | "longbook_sum_eng" | "math_calc" => {
            instance.insert("context".to_string(), text(str_field(eg, task, "context")?));
        }
        "longbook_choice_eng" => {
            instance.insert("context".to_string(), text(str_field(eg, task, "context")?));
            instance.insert("question".to_string(), field(eg, task, "input")?.clone());
            option_fields(&mut instance, eg, task)?;
        }
        "longbook_qa_eng" | "longbook_qa_chn" => {
            instance.insert("context".to_string(), text(str_field(eg, task, "context")?));
            instance.insert("question".to_string(), field(eg, task, "input")?.clone());
        }
        "math_find" => {
            let input = str_field(eg, task, "input")?;
            let Some(found) = TARGET_NUMBER.find(input) else {
                anyhow::bail!(KvBenchError::MalformedInput {
                    task: task.to_string(),
                    reason: format!("cannot find the target number in {input}"),
                })
            };
            let lowered = found.as_str().to_lowercase();
            let keep = lowered.chars().count().saturating_sub(3);
            let target_number = lowered.chars().take(keep).collect::<String>();
            instance.insert(
                "prefix".to_string(),
                text(&format!("What is {target_number} in the following list?")),
            );
            instance.insert("context".to_string(), text(str_field(eg, task, "context")?));
            instance.insert("input".to_string(), text(input));
        }
        "kv_retrieval" => {
            let input = str_field(eg, task, "input")?;
            let chars = input.chars().collect::<Vec<_>>();
            if chars.len() < 44 || chars[6] != '"' || chars[43] != '"' {
                anyhow::bail!(KvBenchError::MalformedInput {
                    task: task.to_string(),
                    reason: "expected a quoted key at characters 6..44".to_string(),
                });
            }
            let key = chars[6..44].iter().collect::<String>();
            instance.insert("context".to_string(), text(content_or_context(eg, task)?));
            instance.insert("input".to_string(), text(input));
            instance.insert("key".to_string(), Value::String(key));
        }
        _ => {
            instance.insert("context".to_string(), text(content_or_context(eg, task)?));
            instance.insert("input".to_string(), field(eg, task, "input")?.clone());
        }
    }

    let answers = match get_answer(task, eg)? {
        Value::Array(list) => list,
        other => vec![other],
    };
    let length = instance
        .get("context")
        .and_then(Value::as_str)
        .map(word_count)
        .unwrap_or_default();
    Ok(Example {
        fields: instance,
        answers,
        all_classes: Value::Null,
        length,
    })
}

/// Reference answers. Multiple-choice tasks carry the option text and its letter.
pub fn get_answer(task: &str, eg: &Map<String, Value>) -> Result<Value, KvBenchError> {
    let answer = field(eg, task, "answer")?;
    if !matches!(task, "code_debug" | "longbook_choice_eng") {
        return Ok(answer.clone());
    }

    let malformed = |reason: &str| KvBenchError::MalformedAnswer {
        task: task.to_string(),
        reason: reason.to_string(),
    };
    let with_letter = |text: &Value| -> Result<Value, KvBenchError> {
        let options = field(eg, task, "options")?
            .as_array()
            .ok_or_else(|| malformed("`options` is not a list"))?;
        let letter = options
            .iter()
            .position(|o| o == text)
            .and_then(|i| OPTIONS.get(i))
            .ok_or_else(|| malformed("answer is not one of the options"))?;
        Ok(Value::Array(vec![text.clone(), Value::String(letter.to_string())]))
    };

    match answer {
        Value::String(_) => with_letter(answer),
        Value::Array(list) if list.len() == 1 => with_letter(&list[0]),
        Value::Array(list)
            if list.len() == 2
                && list[1].as_str().is_some_and(|l| OPTIONS.contains(&l)) =>
        {
            Ok(answer.clone())
        }
        Value::Array(_) => Err(malformed("unexpected answer list shape")),
        _ => Err(malformed("answer must be a string or a list")),
    }
}
