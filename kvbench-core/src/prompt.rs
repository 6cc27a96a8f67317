//! Dataset-specific prompt construction and answer post-processing.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::Value;

use crate::{chat::ConvType, KvBenchError};

/// Datasets whose prompts are fed raw; chat wrapping hurts these tasks.
pub const NO_CHAT_DATASETS: [&str; 6] = ["trec", "triviaqa", "samsum", "lsht", "lcc", "repobench-p"];

pub fn uses_chat(dataset: &str) -> bool {
    !NO_CHAT_DATASETS.contains(&dataset)
}

/// The two side tables: prompt format and generation length per dataset.
#[derive(Debug, Clone, Default)]
pub struct PromptTables {
    prompts: HashMap<String, String>,
    max_gen: HashMap<String, usize>,
}

impl PromptTables {
    /// Read `dataset2prompt.json` and `dataset2maxlen.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<Vec<u8>> {
            let path = dir.join(name);
            fs::read(&path).with_context(|| format!("reading `{}`", path.display()))
        };
        Ok(Self {
            prompts: serde_json::from_slice(&read("dataset2prompt.json")?)?,
            max_gen: serde_json::from_slice(&read("dataset2maxlen.json")?)?,
        })
    }

    pub fn new(prompts: HashMap<String, String>, max_gen: HashMap<String, usize>) -> Self {
        Self { prompts, max_gen }
    }

    pub fn prompt_format(&self, dataset: &str) -> Result<&str, KvBenchError> {
        self.prompts
            .get(dataset)
            .map(String::as_str)
            .ok_or_else(|| KvBenchError::UnknownDataset(dataset.to_string(), "dataset2prompt.json"))
    }

    pub fn max_gen(&self, dataset: &str) -> Result<usize, KvBenchError> {
        self.max_gen
            .get(dataset)
            .copied()
            .ok_or_else(|| KvBenchError::UnknownDataset(dataset.to_string(), "dataset2maxlen.json"))
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

/// Substitute `{field}` placeholders; `{{` and `}}` produce literal braces.
pub fn format_prompt(format: &str, fields: &IndexMap<String, Value>) -> Result<String, KvBenchError> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(KvBenchError::MalformedPromptFormat(
                                "unterminated `{`".to_string(),
                            ))
                        }
                    }
                }
                let key = name.split([':', '!']).next().unwrap_or_default();
                let value = fields
                    .get(key)
                    .ok_or_else(|| KvBenchError::MissingPromptField(key.to_string()))?;
                out.push_str(&display_value(value));
            }
            '}' => {
                return Err(KvBenchError::MalformedPromptFormat(
                    "single `}` encountered".to_string(),
                ))
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Trim a raw generation into the answer that gets scored.
pub fn post_process(pred: &str, conv_type: ConvType, dataset: &str) -> String {
    let mut pred = pred;
    if conv_type == ConvType::Qwen {
        pred = pred.split("<|im_end|>").next().unwrap_or_default();
    }
    if dataset == "samsum" {
        return pred.split('\n').next().unwrap_or_default().trim().to_string();
    }
    pred.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_format_substitutes_fields() {
        let f = fields(&[("context", json!("CTX")), ("input", json!("Q")), ("n", json!(3))]);
        let out = format_prompt("Read {context}\n\nQuestion: {input} ({n}) {{json}}", &f).unwrap();
        assert_eq!(out, "Read CTX\n\nQuestion: Q (3) {json}");
    }

    #[test]
    fn test_format_missing_field() {
        let f = fields(&[("context", json!("CTX"))]);
        assert!(matches!(
            format_prompt("{context} {question}", &f),
            Err(KvBenchError::MissingPromptField(name)) if name == "question"
        ));
        assert!(matches!(
            format_prompt("{context", &f),
            Err(KvBenchError::MalformedPromptFormat(_))
        ));
    }

    #[test]
    fn test_post_process() {
        assert_eq!(post_process("Paris<|im_end|>junk", ConvType::Qwen, "hotpotqa"), "Paris");
        assert_eq!(post_process("  one line \nsecond", ConvType::MistralInst, "samsum"), "one line");
        assert_eq!(post_process("a<|im_end|>b", ConvType::MistralInst, "qasper"), "a<|im_end|>b");
    }

    #[test]
    fn test_chat_exemptions() {
        assert!(!uses_chat("samsum"));
        assert!(!uses_chat("repobench-p"));
        assert!(uses_chat("kv_retrieval"));
    }

    #[test]
    fn test_tables_lookup() {
        let tables = PromptTables::new(
            HashMap::from([("qasper".to_string(), "{context}".to_string())]),
            HashMap::from([("qasper".to_string(), 128)]),
        );
        assert_eq!(tables.prompt_format("qasper").unwrap(), "{context}");
        assert_eq!(tables.max_gen("qasper").unwrap(), 128);
        assert!(tables.max_gen("gov_report").is_err());
    }
}
