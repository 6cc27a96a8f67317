use candle_core::{Result, Tensor};

use super::{append, scaled_attention, seq_len, GenerationContext, KvPolicy};

/// Attention sinks plus a sliding window. Whatever falls between the sinks
/// and the window is dropped after each step.
#[derive(Debug)]
pub struct StreamingCache {
    layer: usize,
    n_sink: usize,
    window: usize,
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl StreamingCache {
    pub fn new(layer: usize, n_sink: usize, window: usize) -> Self {
        Self {
            layer,
            n_sink,
            window,
            k: None,
            v: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.n_sink + self.window
    }

    fn evict(&self, t: &Tensor) -> Result<Tensor> {
        let len = t.dim(2)?;
        let sinks = t.narrow(2, 0, self.n_sink)?;
        let recent = t.narrow(2, len - self.window, self.window)?;
        Tensor::cat(&[&sinks, &recent], 2)?.contiguous()
    }
}

impl KvPolicy for StreamingCache {
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

        let len = k.dim(2)?;
        let stats = ctx.stats.layer_mut(self.layer);
        stats.attended_tokens += len as u64;
        if len > self.capacity() {
            stats.evicted_tokens += (len - self.capacity()) as u64;
            self.k = Some(self.evict(&k)?);
            self.v = Some(self.evict(&v)?);
        } else {
            self.k = Some(k);
            self.v = Some(v);
        }
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

#[cfg(test)]
mod tests {
    use candle_core::IndexOp;

    use super::super::test_utils::*;
    use super::*;

    #[test]
    fn test_keeps_sinks_and_window() {
        let mut stats = stats();
        let mut ctx = GenerationContext {
            stats: &mut stats,
            prefetch_offset: 1,
        };
        let mut cache = StreamingCache::new(0, 2, 4);
        let (q, k, v) = qkv(10).unwrap();
        cache.attend(&q, &k, &v, &mut ctx).unwrap();
        assert_eq!(cache.len(), 6);

        let cached = cache.k.as_ref().unwrap().i((0, 0)).unwrap();
        let expected = Tensor::cat(
            &[
                &k.i((0, 0, 0..2)).unwrap(),
                &k.i((0, 0, 6..10)).unwrap(),
            ],
            0,
        )
        .unwrap();
        let diff = (cached - expected).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

        for _ in 0..3 {
            let (q, k, v) = qkv(1).unwrap();
            let out = cache.attend(&q, &k, &v, &mut ctx).unwrap();
            assert_finite(&out);
            assert_eq!(cache.len(), 6);
        }
        assert_eq!(stats.layers[0].evicted_tokens, 7);
    }
}
