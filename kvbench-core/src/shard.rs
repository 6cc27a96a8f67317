use crate::KvBenchError;

/// The strided shard `data[rank::world_size]`.
pub fn shard<T>(data: Vec<T>, rank: usize, world_size: usize) -> Vec<T> {
    data.into_iter()
        .skip(rank)
        .step_by(world_size.max(1))
        .collect()
}

/// Narrow the dataset to a single sample and/or this process's shard.
pub fn select_examples<T>(
    mut data: Vec<T>,
    samples: Option<usize>,
    rank: Option<usize>,
    world_size: Option<usize>,
) -> Result<Vec<T>, KvBenchError> {
    if let Some(index) = samples {
        let len = data.len();
        if index >= len {
            return Err(KvBenchError::SampleOutOfRange { index, len });
        }
        data = vec![data.swap_remove(index)];
    }
    if let Some(world_size) = world_size {
        let rank = rank.unwrap_or(0);
        if rank >= world_size.max(1) {
            return Err(KvBenchError::InvalidRank { rank, world_size });
        }
        data = shard(data, rank, world_size);
    }
    Ok(data)
}
