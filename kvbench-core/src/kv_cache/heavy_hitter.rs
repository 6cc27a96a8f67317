use candle_core::{DType, Result, Tensor};

use super::{append, scaled_attention, select_positions, seq_len, GenerationContext, KvPolicy};

/// Heavy-hitter oracle: keeps the first `n_init` tokens, the `n_recent`
/// newest tokens and the `n_heavy` tokens in between with the largest
/// accumulated attention mass.
#[derive(Debug)]
pub struct HeavyHitterCache {
    layer: usize,
    n_init: usize,
    n_heavy: usize,
    n_recent: usize,
    k: Option<Tensor>,
    v: Option<Tensor>,
    /// Accumulated attention received by each cached token, summed over heads.
    scores: Vec<f32>,
}

impl HeavyHitterCache {
    pub fn new(layer: usize, n_init: usize, n_heavy: usize, n_recent: usize) -> Self {
        Self {
            layer,
            n_init,
            n_heavy,
            n_recent,
            k: None,
            v: None,
            scores: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.n_init + self.n_heavy + self.n_recent
    }

    /// Positions that survive eviction, ascending.
    fn keep_positions(&self) -> Vec<u32> {
        let len = self.scores.len();
        let recent_start = len - self.n_recent;
        let mut middle = (self.n_init..recent_start).collect::<Vec<_>>();
        middle.sort_by(|&a, &b| self.scores[b].total_cmp(&self.scores[a]).then(a.cmp(&b)));
        middle.truncate(self.n_heavy);
        middle.sort_unstable();

        (0..self.n_init)
            .chain(middle)
            .chain(recent_start..len)
            .map(|p| p as u32)
            .collect()
    }
}

impl KvPolicy for HeavyHitterCache {
    fn attend(
        &mut self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor> {
        let k = append(&self.k, k)?;
        let v = append(&self.v, v)?;
        let (out, probs) = scaled_attention(q, &k, &v)?;

        let received = probs
            .sum(2)?
            .sum(1)?
            .sum(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        self.scores.resize(received.len(), 0.);
        for (score, r) in self.scores.iter_mut().zip(received) {
            *score += r;
        }

        let len = k.dim(2)?;
        let stats = ctx.stats.layer_mut(self.layer);
        stats.attended_tokens += len as u64;
        if len > self.capacity() {
            let keep = self.keep_positions();
            stats.evicted_tokens += (len - keep.len()) as u64;
            self.scores = keep.iter().map(|&p| self.scores[p as usize]).collect();
            self.k = Some(select_positions(&k, &keep)?);
            self.v = Some(select_positions(&v, &keep)?);
        } else {
            self.k = Some(k);
            self.v = Some(v);
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.k = None;
        self.v = None;
        self.scores.clear();
    }

    fn len(&self) -> usize {
        seq_len(&self.k)
    }
}
