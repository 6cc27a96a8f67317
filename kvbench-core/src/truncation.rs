use anyhow::Result;

use crate::{tokenizer::TextTokenizer, KvBenchError};

/// Prompt tokens always kept from the head of an over-long prompt.
pub const INIT_TOKEN_NUM: usize = 128;

/// What to do with a prompt that does not fit `max_length - max_gen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// Skip the example.
    None,
    /// Keep the head and the tail of the prompt, drop the middle.
    Suffix,
}

impl Truncation {
    pub fn from_name(name: Option<&str>) -> std::result::Result<Self, KvBenchError> {
        match name.map(str::trim) {
            None | Some("") | Some("none") => Ok(Self::None),
            Some("suffix") => Ok(Self::Suffix),
            Some(other) => Err(KvBenchError::UnknownTruncation(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TruncationOutcome {
    Keep {
        prompt: String,
        ids: Vec<u32>,
        truncated: bool,
    },
    Skip {
        len: usize,
    },
}

/// Keep the first `INIT_TOKEN_NUM` and the last `budget - INIT_TOKEN_NUM` ids.
pub fn splice_ids(ids: &[u32], budget: usize) -> Vec<u32> {
    if ids.len() <= budget {
        return ids.to_vec();
    }
    let head = INIT_TOKEN_NUM.min(budget);
    let tail = budget - head;
    let mut out = Vec::with_capacity(budget);
    out.extend_from_slice(&ids[..head]);
    out.extend_from_slice(&ids[ids.len() - tail..]);
    out
}

/// Apply `policy` to a tokenized prompt. The kept prompt never exceeds
/// `max_length - max_gen` tokens.
pub fn apply_truncation<T: TextTokenizer>(
    policy: Truncation,
    tokenizer: &T,
    prompt: String,
    ids: Vec<u32>,
    max_length: usize,
    max_gen: usize,
    add_special_tokens: bool,
) -> Result<TruncationOutcome> {
    let budget = max_length.saturating_sub(max_gen);
    if ids.len() <= budget {
        return Ok(TruncationOutcome::Keep {
            prompt,
            ids,
            truncated: false,
        });
    }
    match policy {
        Truncation::None => Ok(TruncationOutcome::Skip { len: ids.len() }),
        Truncation::Suffix => {
            let spliced = splice_ids(&ids, budget);
            let prompt = tokenizer.decode(&spliced, false)?;
            let retokenized = tokenizer.encode(&prompt, add_special_tokens)?;
            // Decoding and re-encoding can merge or split tokens at the seam.
            let ids = if retokenized.len() <= budget {
                retokenized
            } else {
                spliced
            };
            Ok(TruncationOutcome::Keep {
                prompt,
                ids,
                truncated: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CharTokenizer;

    #[test]
    fn test_from_name() {
        assert_eq!(Truncation::from_name(None).unwrap(), Truncation::None);
        assert_eq!(Truncation::from_name(Some("suffix")).unwrap(), Truncation::Suffix);
        assert!(matches!(
            Truncation::from_name(Some("middle")),
            Err(KvBenchError::UnknownTruncation(_))
        ));
    }

    #[test]
    fn test_splice_keeps_head_and_tail() {
        let ids = (0..1000u32).collect::<Vec<_>>();
        let out = splice_ids(&ids, 200);
        assert_eq!(out.len(), 200);
        assert_eq!(&out[..128], &ids[..128]);
        assert_eq!(&out[128..], &ids[928..]);
    }

    #[test]
    fn test_splice_budget_below_head() {
        let ids = (0..300u32).collect::<Vec<_>>();
        assert_eq!(splice_ids(&ids, 50), (0..50u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_policy_skips() {
        let tok = CharTokenizer;
        let prompt = "a".repeat(600);
        let ids = tok.encode(&prompt, false).unwrap();
        let out = apply_truncation(Truncation::None, &tok, prompt, ids, 500, 100, false).unwrap();
        assert_eq!(out, TruncationOutcome::Skip { len: 600 });
    }

    #[test]
    fn test_suffix_respects_budget() {
        let tok = CharTokenizer;
        for (len, max_length, max_gen) in [(600, 500, 100), (5000, 1024, 64), (130, 129, 0)] {
            let prompt = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect::<String>();
            let ids = tok.encode(&prompt, true).unwrap();
            let out =
                apply_truncation(Truncation::Suffix, &tok, prompt.clone(), ids, max_length, max_gen, true)
                    .unwrap();
            let TruncationOutcome::Keep { prompt: kept, ids, truncated } = out else {
                panic!("suffix truncation never skips");
            };
            assert!(truncated);
            assert!(ids.len() <= max_length - max_gen);
            assert!(kept.ends_with(&prompt[prompt.len() - 1..]));
        }
    }

    #[test]
    fn test_short_prompt_untouched() {
        let tok = CharTokenizer;
        let ids = tok.encode("hello", false).unwrap();
        let out =
            apply_truncation(Truncation::Suffix, &tok, "hello".into(), ids.clone(), 100, 10, false)
                .unwrap();
        assert_eq!(
            out,
            TruncationOutcome::Keep {
                prompt: "hello".into(),
                ids,
                truncated: false
            }
        );
    }
}
