//! Deterministic model builders for tests and examples
//!
//! Builds small, fully valid model files entirely in memory. Weights are
//! generated from a hash of the tensor name, so every build of the same
//! model is byte-identical and generation from it is reproducible.

use super::{fnv1a_64, ModelDescriptor, Tensor};
use crate::moe::MoeNormalization;
use crate::quantize::QuantKind;
use crate::tokenizer::Vocabulary;

/// Hidden dimension of the toy model
pub const TOY_HIDDEN_DIM: usize = 8;
/// Attention heads of the toy model
pub const TOY_NUM_HEADS: usize = 2;
/// FFN intermediate width of the toy model
pub const TOY_INTERMEDIATE_DIM: usize = 16;
/// Experts per layer of the toy model
pub const TOY_NUM_EXPERTS: usize = 4;
/// Experts routed per token
pub const TOY_EXPERTS_PER_TOKEN: usize = 2;
/// Transformer layers
pub const TOY_NUM_LAYERS: usize = 2;
/// Default context window
pub const TOY_CONTEXT_WINDOW: usize = 16;

/// Descriptor for the 2-layer toy MoE model
///
/// Vocabulary: `<bos>`=0, `hi`=1, ` there`=2, `<eos>`=3.
#[must_use]
pub fn toy_descriptor(context_window: usize) -> ModelDescriptor {
    let vocab = Vocabulary::from_fragments(vec![
        "<bos>".to_string(),
        "hi".to_string(),
        " there".to_string(),
        "<eos>".to_string(),
    ])
    .expect("toy vocabulary is valid");

    let merges = vec![
        ("h".to_string(), "i".to_string()),
        (" ".to_string(), "t".to_string()),
        (" t".to_string(), "h".to_string()),
        (" th".to_string(), "e".to_string()),
        (" the".to_string(), "r".to_string()),
        (" ther".to_string(), "e".to_string()),
    ];

    ModelDescriptor {
        architecture: "olmoe".to_string(),
        num_layers: TOY_NUM_LAYERS,
        hidden_dim: TOY_HIDDEN_DIM,
        num_heads: TOY_NUM_HEADS,
        intermediate_dim: TOY_INTERMEDIATE_DIM,
        num_experts: TOY_NUM_EXPERTS,
        experts_per_token: TOY_EXPERTS_PER_TOKEN,
        moe_norm: MoeNormalization::SoftmaxTopK,
        context_window,
        rope_theta: 10000.0,
        norm_eps: 1e-5,
        vocab,
        merges,
        bos_token_id: 0,
        eos_token_id: 3,
    }
}

/// Build the toy model: descriptor plus all tensors, default context window
#[must_use]
pub fn toy_model() -> (ModelDescriptor, Vec<(String, Tensor)>) {
    toy_model_with_context(TOY_CONTEXT_WINDOW)
}

/// Build the toy model with a chosen context window
///
/// A small window makes context-overflow behavior cheap to exercise.
#[must_use]
pub fn toy_model_with_context(
    context_window: usize,
) -> (ModelDescriptor, Vec<(String, Tensor)>) {
    let descriptor = toy_descriptor(context_window);
    let vocab_size = descriptor.vocab.size();
    let h = descriptor.hidden_dim;
    let inter = descriptor.intermediate_dim;

    let mut tensors = Vec::new();

    tensors.push((
        "token_embd.weight".to_string(),
        hashed_tensor("token_embd.weight", vec![vocab_size, h]),
    ));

    for layer in 0..descriptor.num_layers {
        let name = |suffix: &str| format!("blk.{layer}.{suffix}");

        tensors.push((name("attn_norm.weight"), ones_tensor(vec![h])));
        for proj in ["attn_q.weight", "attn_k.weight", "attn_v.weight", "attn_output.weight"] {
            let full = name(proj);
            tensors.push((full.clone(), hashed_tensor(&full, vec![h, h])));
        }
        tensors.push((name("ffn_norm.weight"), ones_tensor(vec![h])));

        let router = name("ffn_gate_inp.weight");
        tensors.push((
            router.clone(),
            hashed_tensor(&router, vec![descriptor.num_experts, h]),
        ));

        for expert in 0..descriptor.num_experts {
            let gate = name(&format!("ffn_gate.{expert}.weight"));
            tensors.push((gate.clone(), hashed_tensor(&gate, vec![inter, h])));
            let up = name(&format!("ffn_up.{expert}.weight"));
            tensors.push((up.clone(), hashed_tensor(&up, vec![inter, h])));
            let down = name(&format!("ffn_down.{expert}.weight"));
            tensors.push((down.clone(), hashed_tensor(&down, vec![h, inter])));
        }
    }

    tensors.push(("output_norm.weight".to_string(), ones_tensor(vec![h])));
    tensors.push((
        "output.weight".to_string(),
        hashed_tensor("output.weight", vec![vocab_size, h]),
    ));

    (descriptor, tensors)
}

/// F32 tensor with values derived from the tensor name
///
/// Values lie in [-0.25, 0.25], small enough that a few layers of the toy
/// model stay numerically tame.
fn hashed_tensor(name: &str, dims: Vec<usize>) -> Tensor {
    let num_elements: usize = dims.iter().product();
    let mut state = fnv1a_64(name.as_bytes());
    let mut values = Vec::with_capacity(num_elements);
    for _ in 0..num_elements {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        // Top 24 bits, mapped to [-0.25, 0.25]
        #[allow(clippy::cast_precision_loss)]
        let unit = (state >> 40) as f32 / (1u32 << 24) as f32;
        values.push((unit - 0.5) * 0.5);
    }
    f32_tensor(dims, &values)
}

fn ones_tensor(dims: Vec<usize>) -> Tensor {
    let num_elements: usize = dims.iter().product();
    f32_tensor(dims, &vec![1.0; num_elements])
}

/// Pack f32 values into an F32 tensor
#[must_use]
pub fn f32_tensor(dims: Vec<usize>, values: &[f32]) -> Tensor {
    let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Tensor {
        dims,
        kind: QuantKind::F32,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toy_model_is_reproducible() {
        let (_, a) = toy_model();
        let (_, b) = toy_model();
        assert_eq!(a.len(), b.len());
        for ((name_a, t_a), (name_b, t_b)) in a.iter().zip(&b) {
            assert_eq!(name_a, name_b);
            assert_eq!(t_a.data, t_b.data);
        }
    }

    #[test]
    fn test_toy_model_tensor_count() {
        let (descriptor, tensors) = toy_model();
        // embed + output_norm + output, plus per layer:
        // 2 norms + 4 attn projections + router + 3 per expert
        let per_layer = 2 + 4 + 1 + 3 * descriptor.num_experts;
        assert_eq!(tensors.len(), 3 + descriptor.num_layers * per_layer);
    }

    #[test]
    fn test_weights_are_bounded() {
        let (_, tensors) = toy_model();
        for (name, tensor) in &tensors {
            for chunk in tensor.data.chunks_exact(4) {
                let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                assert!(v.abs() <= 1.0, "{name} has out-of-range weight {v}");
            }
        }
    }

    #[test]
    fn test_toy_descriptor_validates() {
        assert!(toy_descriptor(TOY_CONTEXT_WINDOW).validate().is_ok());
    }
}
