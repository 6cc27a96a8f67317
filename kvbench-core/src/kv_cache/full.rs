use candle_core::{Result, Tensor};

use super::{append, scaled_attention, seq_len, GenerationContext, KvPolicy};

/// Attends over every cached token.
#[derive(Debug)]
pub struct FullCache {
    layer: usize,
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl FullCache {
    pub fn new(layer: usize) -> Self {
        Self {
            layer,
            k: None,
            v: None,
        }
    }
}

impl KvPolicy for FullCache {
    fn attend(
        &mut self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor> {
        let k = append(&self.k, k)?;
        let v = append(&self.v, v)?;
        let (out, _) = scaled_attention(q, &k, &v)?;
        ctx.stats.layer_mut(self.layer).attended_tokens += k.dim(2)? as u64;
        self.k = Some(k);
        self.v = Some(v);
        Ok(out)
    }

    fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }

    fn len(&self) -> usize {
        seq_len(&self.k)
    }
}
