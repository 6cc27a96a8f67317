//! Weight loading into a `VarBuilder`.

use std::{collections::HashMap, path::PathBuf, thread};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use tqdm::Iter;

use crate::KvBenchError;

/// Load every tensor of the given safetensors shards, one thread per shard,
/// converted to `dtype` on `device`.
pub fn from_mmaped_safetensors(
    paths: Vec<PathBuf>,
    dtype: DType,
    device: &Device,
    silent: bool,
) -> Result<VarBuilder<'static>> {
    fn load(path: PathBuf, silent: bool, device: Device, dtype: DType) -> Result<HashMap<String, Tensor>> {
        let mut accum = HashMap::new();
        let tensors = unsafe { candle_core::safetensors::MmapedSafetensors::new(path)? };
        let names = tensors.tensors().into_iter().map(|(name, _)| name);
        let names: Box<dyn Iterator<Item = String> + '_> = if silent {
            Box::new(names)
        } else {
            Box::new(names.tqdm())
        };
        for name in names {
            let tensor = tensors.load(&name, &device)?.to_dtype(dtype)?;
            accum.insert(name, tensor);
        }
        Ok(accum)
    }

    let handles = paths
        .into_iter()
        .map(|path| {
            let device = device.clone();
            thread::spawn(move || load(path, silent, device, dtype))
        })
        .collect::<Vec<_>>();
    let mut ws = HashMap::new();
    for h in handles {
        let shard = h
            .join()
            .map_err(|_| candle_core::Error::Msg("weight loading thread panicked".to_string()))??;
        ws.extend(shard);
    }
    Ok(VarBuilder::from_tensors(ws, dtype, device))
}

/// Parse a dtype name as written in configs (`bf16`) or in HF `torch_dtype` (`bfloat16`).
pub fn parse_dtype(name: &str) -> std::result::Result<DType, KvBenchError> {
    Ok(match name {
        "float32" | "float" | "f32" => DType::F32,
        "float16" | "half" | "f16" => DType::F16,
        "bfloat16" | "bf16" => DType::BF16,
        other => return Err(KvBenchError::UnsupportedDtype(other.to_string())),
    })
}

/// BF16 on accelerators, F32 on the CPU.
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::BF16
    }
}
