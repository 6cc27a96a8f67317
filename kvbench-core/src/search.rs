//! Greedy decoding with chunked prefill.

use anyhow::Result;
use candle_core::D;
use tracing::debug;

use crate::{
    kv_cache::GenerationContext, models::CausalLm, stats::ExperimentStats,
    tokenizer::TextTokenizer,
};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub tokens: Vec<u32>,
}

/// Wraps a model and its tokenizer; every call to [`GreedySearch::generate`]
/// should be followed by [`GreedySearch::clear`] before the next prompt.
pub struct GreedySearch<M, T> {
    model: M,
    tokenizer: T,
    eos_token_ids: Vec<u32>,
}

impl<M: CausalLm, T: TextTokenizer> GreedySearch<M, T> {
    pub fn new(model: M, tokenizer: T, eos_token_ids: Vec<u32>) -> Self {
        Self {
            model,
            tokenizer,
            eos_token_ids,
        }
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Feed the prompt `chunk_size` tokens at a time, then emit the argmax
    /// token until an end token is produced or `max_length` tokens exist.
    /// End tokens are not part of the output.
    pub fn generate(
        &mut self,
        input_ids: &[u32],
        max_length: usize,
        chunk_size: usize,
        extra_end_token_ids: &[u32],
        prefetch_offset: usize,
        stats: &mut ExperimentStats,
    ) -> Result<GenerationOutput> {
        if input_ids.is_empty() {
            anyhow::bail!("cannot generate from an empty prompt");
        }
        let mut ctx = GenerationContext {
            stats,
            prefetch_offset,
        };

        let mut offset = 0;
        let mut logits = None;
        for chunk in input_ids.chunks(chunk_size.max(1)) {
            logits = Some(self.model.forward(chunk, offset, &mut ctx)?);
            offset += chunk.len();
        }
        debug!("Prefilled {offset} tokens.");

        let mut tokens = Vec::new();
        while let Some(current) = logits.take() {
            if tokens.len() >= max_length {
                break;
            }
            let next = current.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if self.eos_token_ids.contains(&next) || extra_end_token_ids.contains(&next) {
                break;
            }
            tokens.push(next);
            if tokens.len() < max_length {
                logits = Some(self.model.forward(&[next], offset, &mut ctx)?);
                offset += 1;
            }
        }

        ctx.stats.generated_tokens += tokens.len() as u64;
        let text = self.tokenizer.decode(&tokens, true)?;
        Ok(GenerationOutput { text, tokens })
    }

    /// Drop the cached state of the last prompt.
    pub fn clear(&mut self) {
        self.model.reset();
    }
}
