//! Model-free stand-ins for the prediction loop, shared by the unit and
//! integration tests.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::{kv_cache::GenerationContext, models::CausalLm, tokenizer::TextTokenizer};

const SPECIALS: [(&str, u32); 4] = [("<s>", 1), ("</s>", 2), ("<|im_end|>", 3), ("<|eot_id|>", 4)];
const CHAR_OFFSET: u32 = 16;

/// One token per character; special tokens are matched as whole strings.
pub struct CharTokenizer;

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.push(1);
        }
        let mut rest = text;
        'outer: while let Some(c) = rest.chars().next() {
            for (tok, id) in SPECIALS {
                if let Some(stripped) = rest.strip_prefix(tok) {
                    ids.push(id);
                    rest = stripped;
                    continue 'outer;
                }
            }
            ids.push(c as u32 + CHAR_OFFSET);
            rest = &rest[c.len_utf8()..];
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut out = String::new();
        for id in ids {
            if let Some((tok, _)) = SPECIALS.iter().find(|(_, s)| s == id) {
                if !skip_special_tokens {
                    out.push_str(tok);
                }
            } else if let Some(c) = id.checked_sub(CHAR_OFFSET).and_then(char::from_u32) {
                out.push(c);
            }
        }
        Ok(out)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        SPECIALS.iter().find(|(t, _)| *t == token).map(|(_, id)| *id)
    }
}

/// Predicts the successor of the last input token, so a prompt ending in
/// `c` continues with `d`, `e`, ... Records every `(len, offset)` call.
pub struct SuccessorLm {
    pub vocab: usize,
    pub calls: Vec<(usize, usize)>,
    pub resets: usize,
}

impl SuccessorLm {
    pub fn new(vocab: usize) -> Self {
        Self {
            vocab,
            calls: Vec::new(),
            resets: 0,
        }
    }
}

impl CausalLm for SuccessorLm {
    fn forward(
        &mut self,
        input_ids: &[u32],
        seqlen_offset: usize,
        ctx: &mut GenerationContext<'_>,
    ) -> candle_core::Result<Tensor> {
        let Some(&last) = input_ids.last() else {
            candle_core::bail!("empty input")
        };
        self.calls.push((input_ids.len(), seqlen_offset));
        ctx.stats.layer_mut(0).attended_tokens += (seqlen_offset + input_ids.len()) as u64;
        let mut logits = vec![0f32; self.vocab];
        logits[(last as usize + 1) % self.vocab] = 1.;
        Tensor::from_vec(logits, self.vocab, &Device::Cpu)
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn num_layers(&self) -> usize {
        1
    }
}
