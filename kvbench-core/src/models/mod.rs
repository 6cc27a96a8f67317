use candle_core::{Result, Tensor};

use crate::kv_cache::GenerationContext;

pub mod llama;
pub mod model_center;

/// A decoder that consumes token ids chunk by chunk and returns the
/// next-token logits of the last position.
pub trait CausalLm {
    /// `seqlen_offset` is the number of tokens already fed since the last
    /// [`CausalLm::reset`]. Returns F32 logits of shape `(vocab_size,)`.
    fn forward(
        &mut self,
        input_ids: &[u32],
        seqlen_offset: usize,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor>;

    /// Drop every cached key and value.
    fn reset(&mut self);

    fn num_layers(&self) -> usize;
}
