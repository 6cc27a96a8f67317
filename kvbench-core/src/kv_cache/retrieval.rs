use std::collections::VecDeque;

use candle_core::{DType, Result, Tensor};

use super::{append, scaled_attention, seq_len, GenerationContext, KvPolicy};
use crate::{config::RetrievalParams, stats::LayerStats};

/// Split `t` along the sequence dimension after `n` positions.
fn split_front(t: &Tensor, n: usize) -> Result<(Tensor, Option<Tensor>)> {
    let len = t.dim(2)?;
    let front = t.narrow(2, 0, n)?.contiguous()?;
    let rest = if len > n {
        Some(t.narrow(2, n, len - n)?.contiguous()?)
    } else {
        None
    };
    Ok((front, rest))
}

#[derive(Debug)]
struct MemoryBlock {
    k: Tensor,
    v: Tensor,
}

/// Block-retrieval memory: initial tokens and a local window are always
/// attended; tokens leaving the window are grouped into fixed-size blocks,
/// each summarized by a few representative keys. Every step attends to the
/// `topk` blocks whose representatives best match the (possibly delayed)
/// mean query. A bounded LRU models which blocks would be resident on the
/// device.
#[derive(Debug)]
pub struct RetrievalCache {
    layer: usize,
    params: RetrievalParams,
    init_k: Option<Tensor>,
    init_v: Option<Tensor>,
    local_k: Option<Tensor>,
    local_v: Option<Tensor>,
    /// Evicted from the local window, not yet a full block.
    pending_k: Option<Tensor>,
    pending_v: Option<Tensor>,
    blocks: Vec<MemoryBlock>,
    /// `(n_blocks, n_kv_heads, repr_topk, head_dim)`, F32.
    reprs: Option<Tensor>,
    /// Resident block ids, most recently used first.
    resident: VecDeque<usize>,
    /// Mean queries `(n_kv_heads, head_dim)` of the latest steps, oldest first.
    queries: VecDeque<Tensor>,
    /// Blocks attended by the latest step.
    retrieved: Vec<usize>,
}

impl RetrievalCache {
    pub fn new(layer: usize, params: RetrievalParams) -> Self {
        Self {
            layer,
            params: RetrievalParams {
                block_size: params.block_size.max(1),
                ..params
            },
            init_k: None,
            init_v: None,
            local_k: None,
            local_v: None,
            pending_k: None,
            pending_v: None,
            blocks: Vec::new(),
            reprs: None,
            resident: VecDeque::new(),
            queries: VecDeque::new(),
            retrieved: Vec::new(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Ids of the memory blocks the latest step attended to, ascending.
    pub fn retrieved_blocks(&self) -> &[usize] {
        &self.retrieved
    }

    /// Mean over the query tokens and the query heads sharing a kv head.
    fn mean_query(q: &Tensor, n_kv_heads: usize) -> Result<Tensor> {
        let (_, n_heads, _, head_dim) = q.dims4()?;
        q.to_dtype(DType::F32)?
            .mean(2)?
            .squeeze(0)?
            .reshape((n_kv_heads, n_heads / n_kv_heads, head_dim))?
            .mean(1)
    }

    /// Ids of the blocks to attend, ascending.
    fn retrieve(&mut self, query: &Tensor, stats: &mut LayerStats) -> Result<Vec<usize>> {
        let Some(reprs) = self.reprs.as_ref() else {
            return Ok(Vec::new());
        };
        let scores = reprs
            .broadcast_matmul(&query.unsqueeze(0)?.unsqueeze(3)?)?
            .flatten_from(1)?
            .mean(1)?
            .to_vec1::<f32>()?;

        let mut selected = (0..scores.len()).collect::<Vec<_>>();
        selected.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        selected.truncate(self.params.topk);
        selected.sort_unstable();

        stats.retrievals += 1;
        stats.blocks_retrieved += selected.len() as u64;
        for &id in &selected {
            if let Some(pos) = self.resident.iter().position(|&r| r == id) {
                stats.cache_hits += 1;
                self.resident.remove(pos);
            } else {
                stats.cache_misses += 1;
            }
            self.resident.push_front(id);
        }
        self.resident.truncate(self.params.max_cached_block);
        Ok(selected)
    }

    /// Turn `(1, n_kv_heads, block_size, head_dim)` keys into a memory block,
    /// keeping per head the `repr_topk` keys closest to `query`.
    fn push_block(&mut self, k: Tensor, v: Tensor, query: &Tensor) -> Result<()> {
        let (_, n_kv_heads, block_size, head_dim) = k.dims4()?;
        let keys = k.squeeze(0)?.to_dtype(DType::F32)?.contiguous()?;
        let scores = keys
            .matmul(&query.unsqueeze(2)?.contiguous()?)?
            .squeeze(2)?
            .to_vec2::<f32>()?;

        let n_repr = self.params.repr_topk.clamp(1, block_size);
        let mut idx = Vec::with_capacity(n_kv_heads * n_repr);
        for head in scores {
            let mut order = (0..block_size).collect::<Vec<_>>();
            order.sort_by(|&a, &b| head[b].total_cmp(&head[a]).then(a.cmp(&b)));
            idx.extend(order.into_iter().take(n_repr).map(|p| p as u32));
        }
        let idx = Tensor::from_vec(idx, (n_kv_heads, n_repr, 1), keys.device())?
            .broadcast_as((n_kv_heads, n_repr, head_dim))?
            .contiguous()?;
        let reprs = keys.gather(&idx, 1)?.unsqueeze(0)?;

        self.reprs = Some(match self.reprs.take() {
            Some(prev) => Tensor::cat(&[&prev, &reprs], 0)?,
            None => reprs,
        });
        self.blocks.push(MemoryBlock { k, v });
        Ok(())
    }

    /// Route the step's new tokens: fill the initial segment first, then the
    /// local window; overflow becomes pending and full blocks are sealed.
    fn absorb(&mut self, k: &Tensor, v: &Tensor, query: &Tensor, stats: &mut LayerStats) -> Result<()> {
        let q_len = k.dim(2)?;
        let take = q_len.min(self.params.n_init.saturating_sub(seq_len(&self.init_k)));
        if take > 0 {
            self.init_k = Some(append(&self.init_k, &k.narrow(2, 0, take)?)?);
            self.init_v = Some(append(&self.init_v, &v.narrow(2, 0, take)?)?);
        }
        if q_len > take {
            self.local_k = Some(append(&self.local_k, &k.narrow(2, take, q_len - take)?)?);
            self.local_v = Some(append(&self.local_v, &v.narrow(2, take, q_len - take)?)?);
        }

        let local_len = seq_len(&self.local_k);
        if local_len > self.params.n_local {
            let overflow = local_len - self.params.n_local;
            stats.evicted_tokens += overflow as u64;
            if let (Some(local_k), Some(local_v)) = (self.local_k.take(), self.local_v.take()) {
                let (moved_k, kept_k) = split_front(&local_k, overflow)?;
                let (moved_v, kept_v) = split_front(&local_v, overflow)?;
                self.local_k = kept_k;
                self.local_v = kept_v;
                self.pending_k = Some(append(&self.pending_k, &moved_k)?);
                self.pending_v = Some(append(&self.pending_v, &moved_v)?);
            }
        }

        let block_size = self.params.block_size;
        while seq_len(&self.pending_k) >= block_size {
            let (Some(pending_k), Some(pending_v)) = (self.pending_k.take(), self.pending_v.take())
            else {
                break;
            };
            let (block_k, rest_k) = split_front(&pending_k, block_size)?;
            let (block_v, rest_v) = split_front(&pending_v, block_size)?;
            self.pending_k = rest_k;
            self.pending_v = rest_v;
            self.push_block(block_k, block_v, query)?;
        }
        Ok(())
    }
}

impl KvPolicy for RetrievalCache {
    fn attend(
        &mut self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<Tensor> {
        let query = Self::mean_query(q, k.dim(1)?)?;
        self.queries.push_back(query.clone());
        while self.queries.len() > ctx.prefetch_offset + 1 {
            self.queries.pop_front();
        }
        let stats = ctx.stats.layer_mut(self.layer);
        let selected = match self.queries.front().cloned() {
            Some(lookup) if !self.blocks.is_empty() => self.retrieve(&lookup, stats)?,
            _ => Vec::new(),
        };

        let mut ks = Vec::new();
        let mut vs = Vec::new();
        ks.extend(self.init_k.iter());
        vs.extend(self.init_v.iter());
        for &id in &selected {
            ks.push(&self.blocks[id].k);
            vs.push(&self.blocks[id].v);
        }
        ks.extend(self.pending_k.iter().chain(self.local_k.iter()));
        vs.extend(self.pending_v.iter().chain(self.local_v.iter()));
        ks.push(k);
        vs.push(v);
        let ctx_k = Tensor::cat(&ks, 2)?.contiguous()?;
        let ctx_v = Tensor::cat(&vs, 2)?.contiguous()?;

        let (out, _) = scaled_attention(q, &ctx_k, &ctx_v)?;
        stats.attended_tokens += ctx_k.dim(2)? as u64;
        self.retrieved = selected;
        self.absorb(k, v, &query, stats)?;
        Ok(out)
    }

    fn reset(&mut self) {
        self.init_k = None;
        self.init_v = None;
        self.local_k = None;
        self.local_v = None;
        self.pending_k = None;
        self.pending_v = None;
        self.blocks.clear();
        self.reprs = None;
        self.resident.clear();
        self.queries.clear();
        self.retrieved.clear();
    }

    fn len(&self) -> usize {
        seq_len(&self.init_k)
            + seq_len(&self.local_k)
            + seq_len(&self.pending_k)
            + self.blocks.len() * self.params.block_size
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::super::test_utils::*;
    use super::*;

    fn params() -> RetrievalParams {
        RetrievalParams {
            n_init: 2,
            n_local: 4,
            block_size: 3,
            topk: 1,
            repr_topk: 2,
            max_cached_block: 1,
        }
    }

    #[test]
    fn test_tokens_flow_into_blocks() {
        let mut stats = stats();
        let mut ctx = GenerationContext {
            stats: &mut stats,
            prefetch_offset: 1,
        };
        let mut cache = RetrievalCache::new(0, params());
        let (q, k, v) = qkv(12).unwrap();
        cache.attend(&q, &k, &v, &mut ctx).unwrap();
        assert_eq!(cache.num_blocks(), 2);
        assert_eq!(cache.len(), 12);
        assert_eq!(cache.reprs.as_ref().unwrap().dims4().unwrap(), (2, KV_HEADS, 2, DIM));

        for _ in 0..3 {
            let (q, k, v) = qkv(1).unwrap();
            let out = cache.attend(&q, &k, &v, &mut ctx).unwrap();
            assert_eq!(out.dims4().unwrap(), (1, HEADS, 1, DIM));
            assert_finite(&out);
            assert!(cache.queries.len() <= 2);
        }
        assert_eq!(cache.len(), 15);
        assert_eq!(cache.num_blocks(), 3);

        let layer = &stats.layers[0];
        assert_eq!(layer.retrievals, 3);
        assert_eq!(layer.cache_hits + layer.cache_misses, 3);
        assert!(layer.cache_misses >= 1);
        // Prefill saw 12 tokens; each decode step saw init + one block + pending + local + itself.
        assert_eq!(layer.attended_tokens, 12 + 10 + 11 + 12);
    }

    #[test]
    fn test_reset_clears_memory() {
        let mut stats = stats();
        let mut ctx = GenerationContext {
            stats: &mut stats,
            prefetch_offset: 0,
        };
        let mut cache = RetrievalCache::new(0, params());
        let (q, k, v) = qkv(9).unwrap();
        cache.attend(&q, &k, &v, &mut ctx).unwrap();
        assert_eq!(cache.num_blocks(), 1);
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.num_blocks(), 0);
    }

    /// `(1, heads, dirs.len(), DIM)` with a unit vector along `dirs[i]` at
    /// position `i`, or zeros for `None`.
    fn directions(heads: usize, dirs: &[Option<usize>]) -> Tensor {
        let mut data = vec![0f32; heads * dirs.len() * DIM];
        for h in 0..heads {
            for (i, dir) in dirs.iter().enumerate() {
                if let Some(d) = dir {
                    data[(h * dirs.len() + i) * DIM + d] = 1.;
                }
            }
        }
        Tensor::from_vec(data, (1, heads, dirs.len(), DIM), &Device::Cpu).unwrap()
    }

    /// Two single-token blocks keyed along channels 0 and 1. The prefill
    /// query points at block 1, the first decode query at block 0.
    fn retrieved_after_two_steps(prefetch_offset: usize) -> (Vec<usize>, Vec<usize>) {
        let mut stats = stats();
        let mut ctx = GenerationContext {
            stats: &mut stats,
            prefetch_offset,
        };
        let mut cache = RetrievalCache::new(
            0,
            RetrievalParams {
                n_init: 0,
                n_local: 0,
                block_size: 1,
                topk: 1,
                repr_topk: 1,
                max_cached_block: 4,
            },
        );
        let (_, _, v) = qkv(2).unwrap();
        let q = directions(HEADS, &[Some(1), Some(1)]);
        let k = directions(KV_HEADS, &[Some(0), Some(1)]);
        cache.attend(&q, &k, &v, &mut ctx).unwrap();
        assert_eq!(cache.num_blocks(), 2);
        assert!(cache.retrieved_blocks().is_empty());

        let mut steps = Vec::new();
        for _ in 0..2 {
            let (_, _, v) = qkv(1).unwrap();
            let q = directions(HEADS, &[Some(0)]);
            // Zero keys never outscore the channel-0 block.
            let k = directions(KV_HEADS, &[None]);
            cache.attend(&q, &k, &v, &mut ctx).unwrap();
            steps.push(cache.retrieved_blocks().to_vec());
        }
        (steps[0].clone(), steps[1].clone())
    }

    #[test]
    fn test_retrieval_uses_delayed_query() {
        // One step late: the first decode step still looks up with the prefill query.
        assert_eq!(retrieved_after_two_steps(1), (vec![1], vec![0]));
        assert_eq!(retrieved_after_two_steps(0), (vec![0], vec![0]));
    }
}
