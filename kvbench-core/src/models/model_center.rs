//! Checkpoints in the model-center layout: a single `pytorch_model.pt` whose
//! parameter names differ from the HF Llama ones.

use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use tqdm::Iter;
use tracing::warn;

/// Weight file name inside a model-center checkpoint directory.
pub const WEIGHTS_FILE: &str = "pytorch_model.pt";

const LAYER_RENAMES: [(&str, &str); 9] = [
    ("self_att.layernorm_before_attention", "input_layernorm"),
    ("self_att.self_attention.project_q", "self_attn.q_proj"),
    ("self_att.self_attention.project_k", "self_attn.k_proj"),
    ("self_att.self_attention.project_v", "self_attn.v_proj"),
    ("self_att.self_attention.attention_out", "self_attn.o_proj"),
    ("ffn.layernorm_before_ffn", "post_attention_layernorm"),
    ("ffn.ffn.w_in.w_0", "mlp.gate_proj"),
    ("ffn.ffn.w_in.w_1", "mlp.up_proj"),
    ("ffn.ffn.w_out", "mlp.down_proj"),
];

/// HF name of a model-center parameter, or `None` if it has no counterpart.
pub fn hf_name(name: &str) -> Option<String> {
    let name = name.strip_prefix("module.").unwrap_or(name);
    let (stem, suffix) = name.rsplit_once('.')?;
    let stem = match stem {
        "input_embedding" => "model.embed_tokens".to_string(),
        "encoder.output_layernorm" => "model.norm".to_string(),
        "output_projection" | "lm_head" => "lm_head".to_string(),
        _ => {
            let rest = stem.strip_prefix("encoder.layers.")?;
            let (layer, module) = rest.split_once('.')?;
            let layer: usize = layer.parse().ok()?;
            let (_, renamed) = LAYER_RENAMES.iter().find(|(from, _)| *from == module)?;
            format!("model.layers.{layer}.{renamed}")
        }
    };
    Some(format!("{stem}.{suffix}"))
}

/// Rename raw model-center tensors to HF names, dropping the unknown ones.
pub fn rename_tensors(tensors: Vec<(String, Tensor)>) -> HashMap<String, Tensor> {
    let mut out = HashMap::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        match hf_name(&name) {
            Some(hf) => {
                out.insert(hf, tensor);
            }
            None => warn!("Ignoring model-center tensor `{name}`."),
        }
    }
    out
}

/// Read `pytorch_model.pt` from `dir` into a HF-named VarBuilder.
pub fn var_builder(dir: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let raw = candle_core::pickle::read_all(dir.join(WEIGHTS_FILE))?;
    let mut tensors = HashMap::with_capacity(raw.len());
    for (name, tensor) in rename_tensors(raw).into_iter().tqdm() {
        tensors.insert(name, tensor.to_device(device)?.to_dtype(dtype)?);
    }
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_names() {
        assert_eq!(
            hf_name("encoder.layers.3.self_att.self_attention.project_q.weight").as_deref(),
            Some("model.layers.3.self_attn.q_proj.weight")
        );
        assert_eq!(
            hf_name("encoder.layers.0.ffn.ffn.w_in.w_1.weight").as_deref(),
            Some("model.layers.0.mlp.up_proj.weight")
        );
        assert_eq!(
            hf_name("encoder.layers.11.ffn.layernorm_before_ffn.weight").as_deref(),
            Some("model.layers.11.post_attention_layernorm.weight")
        );
    }

    #[test]
    fn test_top_level_names() {
        assert_eq!(
            hf_name("input_embedding.weight").as_deref(),
            Some("model.embed_tokens.weight")
        );
        assert_eq!(
            hf_name("encoder.output_layernorm.weight").as_deref(),
            Some("model.norm.weight")
        );
        assert_eq!(hf_name("output_projection.weight").as_deref(), Some("lm_head.weight"));
        assert_eq!(hf_name("position_bias.relative_attention_bias"), None);
        assert_eq!(hf_name("encoder.layers.x.ffn.ffn.w_out.weight"), None);
    }
}
