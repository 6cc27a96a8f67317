use std::{fs, path::Path, str::FromStr};

use anyhow::Result;
use either::Either;
use indexmap::IndexMap;
use minijinja::{context, Environment, ErrorKind};
use serde::Deserialize;
use tracing::info;

use crate::{tokenizer::TextTokenizer, KvBenchError};

const VICUNA_SYSTEM: &str = "A chat between a curious user and an artificial intelligence assistant. \
The assistant gives helpful, detailed, and polite answers to the user's questions.";

#[derive(Debug, Clone, Deserialize)]
pub struct AddedTokensDecoder {
    pub content: String,
    #[serde(default)]
    pub special: Option<bool>,
}

fn raise_exception(msg: String) -> Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
}

/// The parts of `tokenizer_config.json` needed to render chat prompts.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default, with = "either::serde_untagged_optional")]
    pub bos_token: Option<Either<String, AddedTokensDecoder>>,
    #[serde(default, with = "either::serde_untagged_optional")]
    pub eos_token: Option<Either<String, AddedTokensDecoder>>,
    #[serde(default, with = "either::serde_untagged_optional")]
    pub unk_token: Option<Either<String, AddedTokensDecoder>>,
    pub chat_template: Option<String>,
}

fn token_content(tok: &Option<Either<String, AddedTokensDecoder>>) -> Option<String> {
    match tok.as_ref()? {
        Either::Left(lit) => Some(lit.clone()),
        Either::Right(added) => Some(added.content.clone()),
    }
}

impl TokenizerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    pub fn has_chat_template(&self) -> bool {
        self.chat_template.is_some()
    }

    pub fn bos_tok(&self) -> Option<String> {
        token_content(&self.bos_token)
    }

    pub fn eos_tok(&self) -> Option<String> {
        token_content(&self.eos_token)
    }

    pub fn unk_tok(&self) -> Option<String> {
        token_content(&self.unk_token)
    }
}

/// Render a Hugging Face Jinja chat template.
pub fn apply_chat_template_to(
    messages: Vec<IndexMap<String, String>>,
    add_generation_prompt: bool,
    template: &str,
    bos_tok: Option<String>,
    eos_tok: Option<String>,
    unk_tok: Option<String>,
) -> Result<String> {
    let template = template.replace(".strip()", "|trim");
    let mut env = Environment::new();
    // https://github.com/huggingface/transformers/blob/76a33a10923ccc1074917f6b6a1e719e626b7dc9/src/transformers/tokenization_utils_base.py#L1842
    env.set_lstrip_blocks(true);
    env.set_trim_blocks(true);
    env.add_template("chat_template", template.as_str())?;
    env.add_function("raise_exception", raise_exception);
    let tmpl = env.get_template("chat_template")?;
    Ok(tmpl.render(context! {
        messages => messages,
        add_generation_prompt => add_generation_prompt,
        bos_token => bos_tok,
        eos_token => eos_tok,
        unk_token => unk_tok,
    })?)
}

/// Chat conventions of the evaluated models, selected by `conv_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvType {
    Vicuna,
    MistralInst,
    Qwen,
    MiniCpm,
    Llama3Inst,
}

impl FromStr for ConvType {
    type Err = KvBenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vicuna" => Ok(Self::Vicuna),
            "mistral-inst" => Ok(Self::MistralInst),
            "qwen" => Ok(Self::Qwen),
            "minicpm" => Ok(Self::MiniCpm),
            "llama-3-inst" => Ok(Self::Llama3Inst),
            other => Err(KvBenchError::UnknownConvType(other.to_string())),
        }
    }
}

impl ConvType {
    /// Whether a chat-wrapped prompt is tokenized with special tokens. The
    /// Mistral template already carries its BOS.
    pub fn adds_special_tokens(&self) -> bool {
        !matches!(self, Self::MistralInst)
    }

    /// End-of-turn token that stops generation for this conversation format.
    pub fn end_marker(&self) -> Option<&'static str> {
        match self {
            Self::Qwen => Some("<|im_end|>"),
            Self::Llama3Inst => Some("<|eot_id|>"),
            _ => None,
        }
    }
}

/// Wraps raw prompts into a single user turn of the model's conversation format.
pub struct ChatFormatter {
    conv_type: ConvType,
    config: Option<TokenizerConfig>,
}

impl ChatFormatter {
    pub fn new(conv_type: ConvType, config: Option<TokenizerConfig>) -> Self {
        if let Some(cfg) = &config {
            info!(
                "bos_tok = {:?}, eos_tok = {:?}, chat template present: {}",
                cfg.bos_tok(),
                cfg.eos_tok(),
                cfg.has_chat_template()
            );
        }
        Self { conv_type, config }
    }

    pub fn conv_type(&self) -> ConvType {
        self.conv_type
    }

    pub fn build_chat(&self, prompt: &str) -> Result<String> {
        match self.conv_type {
            ConvType::Vicuna => Ok(vicuna_prompt(prompt)),
            ConvType::MistralInst | ConvType::Qwen | ConvType::MiniCpm | ConvType::Llama3Inst => {
                let Some(cfg) = self.config.as_ref() else {
                    anyhow::bail!("`{:?}` prompts need a tokenizer_config.json", self.conv_type)
                };
                let Some(template) = cfg.chat_template.as_deref() else {
                    anyhow::bail!("tokenizer config has no `chat_template`")
                };
                let mut message = IndexMap::new();
                message.insert("role".to_string(), "user".to_string());
                message.insert("content".to_string(), prompt.to_string());
                apply_chat_template_to(
                    vec![message],
                    true,
                    template,
                    cfg.bos_tok(),
                    cfg.eos_tok(),
                    cfg.unk_tok(),
                )
            }
        }
    }
}

/// Vicuna v1.1: system prompt, then `USER: ... ASSISTANT:`.
fn vicuna_prompt(prompt: &str) -> String {
    format!("{VICUNA_SYSTEM} USER: {prompt} ASSISTANT:")
}

/// Token ids that end generation in addition to the tokenizer's EOS.
pub fn extra_end_token_ids<T: TextTokenizer>(
    tokenizer: &T,
    conv_type: ConvType,
    dataset: &str,
) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    if let Some(marker) = conv_type.end_marker() {
        if let Some(id) = tokenizer.encode(marker, false)?.first() {
            ids.push(*id);
        }
    }
    if dataset == "samsum" {
        if let Some(id) = tokenizer.encode("\n", false)?.last() {
            ids.push(*id);
        }
    }
    Ok(ids)
}
