use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer;

use crate::chat::TokenizerConfig;

/// The tokenizer surface the harness needs. Implemented for the HF
/// `tokenizers::Tokenizer`; tests substitute a lightweight tokenizer.
pub trait TextTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
    fn token_to_id(&self, token: &str) -> Option<u32>;
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, add_special_tokens)
            .map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        (**self)
            .decode(ids, skip_special_tokens)
            .map_err(anyhow::Error::msg)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }
}

/// Load `tokenizer.json` and, when present, `tokenizer_config.json` from a
/// local tokenizer directory.
pub fn load_tokenizer_dir(dir: &Path) -> Result<(Tokenizer, Option<TokenizerConfig>)> {
    let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json"))
        .map_err(|e| anyhow::Error::msg(format!("loading tokenizer from {}: {e}", dir.display())))?;
    let config_path = dir.join("tokenizer_config.json");
    let config = if config_path.exists() {
        Some(TokenizerConfig::from_file(&config_path)?)
    } else {
        None
    };
    Ok((tokenizer, config))
}

/// Ids of the stop tokens: the configured EOS token plus the alternate
/// end-of-turn tokens the vocabulary knows about.
pub fn eos_token_ids<T: TextTokenizer>(tokenizer: &T, config: Option<&TokenizerConfig>) -> Vec<u32> {
    let mut names = Vec::new();
    if let Some(eos) = config.and_then(|c| c.eos_tok()) {
        names.push(eos);
    }
    names.extend(["</s>", "<|endoftext|>"].map(String::from));

    let mut ids = Vec::new();
    for name in names {
        if let Some(id) = tokenizer.token_to_id(&name) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokenizers::{models::wordlevel::WordLevel, pre_tokenizers::whitespace::WhitespaceSplit, AddedToken};

    use super::*;

    fn word_level() -> Tokenizer {
        let vocab = ["<unk>", "</s>", "hello", "world"]
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect::<HashMap<_, _>>();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(WhitespaceSplit);
        tokenizer.add_special_tokens(&[AddedToken::from("</s>", true)]);
        tokenizer
    }

    #[test]
    fn test_hf_tokenizer_through_trait() {
        let tok = word_level();
        assert_eq!(TextTokenizer::token_to_id(&tok, "</s>"), Some(1));
        assert_eq!(TextTokenizer::token_to_id(&tok, "missing"), None);

        let ids = TextTokenizer::encode(&tok, "hello world again", false).unwrap();
        assert_eq!(ids, vec![2, 3, 0]);
        let text = TextTokenizer::decode(&tok, &[2, 3, 1], true).unwrap();
        assert_eq!(text, "hello world");
        let text = TextTokenizer::decode(&tok, &[2, 1], false).unwrap();
        assert_eq!(text, "hello </s>");
    }

    #[test]
    fn test_eos_ids_from_hf_vocab() {
        let tok = word_level();
        assert_eq!(eos_token_ids(&tok, None), vec![1]);
    }
}
