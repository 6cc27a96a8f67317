use candle_core::{DType, IndexOp, Result, Tensor};

use super::{append, scaled_attention, seq_len, GenerationContext, KvPolicy};

/// Double sparsity: the whole cache is kept, but each decode step only
/// attends, per head, to the `budget` tokens whose keys score highest against
/// the query on a handful of outlier (label) channels.
#[derive(Debug)]
pub struct DoubleSparseCache {
    layer: usize,
    budget: usize,
    /// Label channels for every query head.
    channels: Vec<Vec<u32>>,
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl DoubleSparseCache {
    pub fn new(layer: usize, budget: usize, channels: Vec<Vec<usize>>) -> Self {
        Self {
            layer,
            budget,
            channels: channels
                .into_iter()
                .map(|c| c.into_iter().map(|c| c as u32).collect())
                .collect(),
            k: None,
            v: None,
        }
    }

    /// Token positions head `head` attends to, ascending. The newest token
    /// is always included.
    fn select(&self, q: &Tensor, k: &Tensor, head: usize, n_rep: usize) -> Result<Vec<u32>> {
        let channels = &self.channels[head % self.channels.len()];
        let idx = Tensor::from_slice(channels, channels.len(), q.device())?;
        let q_label = q.i((0, head))?.contiguous()?.index_select(&idx, 1)?;
        let k_label = k.i((0, head / n_rep))?.contiguous()?.index_select(&idx, 1)?;
        let scores = q_label.matmul(&k_label.t()?)?.squeeze(0)?.to_vec1::<f32>()?;

        let newest = scores.len() - 1;
        let mut order = (0..newest).collect::<Vec<_>>();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        order.truncate(self.budget.saturating_sub(1));
        order.push(newest);
        order.sort_unstable();
        Ok(order.into_iter().map(|p| p as u32).collect())
    }

    fn sparse_attention(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let n_heads = q.dim(1)?;
        let n_rep = n_heads / k.dim(1)?;
        let q32 = q.to_dtype(DType::F32)?;
        let k32 = k.to_dtype(DType::F32)?;

        let mut ks = Vec::with_capacity(n_heads);
        let mut vs = Vec::with_capacity(n_heads);
        for head in 0..n_heads {
            let keep = self.select(&q32, &k32, head, n_rep)?;
            let idx = Tensor::from_slice(&keep, keep.len(), q.device())?;
            ks.push(k.i((0, head / n_rep))?.contiguous()?.index_select(&idx, 0)?);
            vs.push(v.i((0, head / n_rep))?.contiguous()?.index_select(&idx, 0)?);
        }
        let k_sel = Tensor::stack(&ks, 0)?.unsqueeze(0)?;
        let v_sel = Tensor::stack(&vs, 0)?.unsqueeze(0)?;
        let (out, _) = scaled_attention(q, &k_sel, &v_sel)?;
        Ok(out)
    }
}

impl KvPolicy for DoubleSparseCache {
    fn attend(
        &mut self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor> {
        let q_len = q.dim(2)?;
        let k = append(&self.k, k)?;
        let v = append(&self.v, v)?;
        let len = k.dim(2)?;

        let stats = ctx.stats.layer_mut(self.layer);
        let out = if q_len == 1 && len > self.budget && !self.channels.is_empty() {
            stats.sparse_steps += 1;
            stats.attended_tokens += self.budget as u64;
            self.sparse_attention(q, &k, &v)?
        } else {
            stats.attended_tokens += len as u64;
            scaled_attention(q, &k, &v)?.0
        };
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

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::super::test_utils::*;
    use super::*;

    #[test]
    fn test_decode_is_sparse_prefill_is_dense() {
        let mut stats = stats();
        let mut ctx = GenerationContext {
            stats: &mut stats,
            prefetch_offset: 1,
        };
        let channels = vec![vec![0, 3]; HEADS];
        let mut cache = DoubleSparseCache::new(0, 4, channels);
        let (q, k, v) = qkv(10).unwrap();
        cache.attend(&q, &k, &v, &mut ctx).unwrap();
        let (q, k, v) = qkv(1).unwrap();
        let out = cache.attend(&q, &k, &v, &mut ctx).unwrap();
        assert_eq!(out.dims4().unwrap(), (1, HEADS, 1, DIM));
        assert_finite(&out);
        assert_eq!(cache.len(), 11);
        assert_eq!(stats.layers[0].sparse_steps, 1);
        assert_eq!(stats.layers[0].attended_tokens, 14);
    }

    #[test]
    fn test_selects_matching_keys() {
        let cache = DoubleSparseCache::new(0, 2, vec![vec![0]]);
        let dev = Device::Cpu;
        let q = Tensor::new(&[1f32, 0.], &dev).unwrap().reshape((1, 1, 1, 2)).unwrap();
        let k = Tensor::new(&[[0f32, 5.], [3., 0.], [-1., 0.], [1., 0.]], &dev)
            .unwrap()
            .reshape((1, 1, 4, 2))
            .unwrap();
        assert_eq!(cache.select(&q, &k, 0, 1).unwrap(), vec![1, 3]);
    }
}
