//! Execution graph: the transformer forward pass
//!
//! Llama-style pre-norm decoder with a mixture-of-experts FFN. Two entry
//! points share every compute primitive:
//!
//! - [`Model::forward_step`] - one token at a position, reading and
//!   extending the KV cache; this is the decode path
//! - [`Model::forward_batch`] - a whole prompt with causal attention and
//!   no cache; this is the reference path, and its final-position logits
//!   match `forward_step` fed the same tokens one at a time
//!
//! Layer shape, per token:
//! RMSNorm, QKV projections, RoPE, causal attention, output projection,
//! residual add, RMSNorm, routed expert SwiGLU FFN, residual add.
//! Dense models are the single-expert degenerate case.

use crate::compute::{
    add_assign, apply_rope, attention_with_cache, matvec, mul_assign, rms_norm, silu,
    ScratchBuffer,
};
use crate::error::{InferirError, Result};
use crate::format::{ModelDescriptor, ModelFile, Tensor};
use crate::kv_cache::KvCache;
use crate::moe::select_experts;
use crate::quantize::dequantize;

/// One expert's SwiGLU weights
struct Expert {
    gate: Tensor,
    up: Tensor,
    down: Tensor,
}

/// Weights for one transformer layer
struct Layer {
    attn_norm: Vec<f32>,
    attn_q: Tensor,
    attn_k: Tensor,
    attn_v: Tensor,
    attn_output: Tensor,
    ffn_norm: Vec<f32>,
    router: Tensor,
    experts: Vec<Expert>,
}

/// A loaded model ready for inference
pub struct Model {
    descriptor: ModelDescriptor,
    /// Embedding table dequantized to `[vocab_size * hidden_dim]`
    embedding: Vec<f32>,
    layers: Vec<Layer>,
    output_norm: Vec<f32>,
    lm_head: Tensor,
}

impl Model {
    /// Assemble the execution graph from a validated model file
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` when a required tensor is missing or has the
    /// wrong dimensions for the descriptor.
    pub fn from_file(mut file: ModelFile) -> Result<Self> {
        let descriptor = file.descriptor.clone();
        let h = descriptor.hidden_dim;
        let vocab_size = descriptor.vocab.size();

        let embedding = dequantize_named(&mut file, "token_embd.weight", &[vocab_size, h])?;

        let mut layers = Vec::with_capacity(descriptor.num_layers);
        for i in 0..descriptor.num_layers {
            let name = |suffix: &str| format!("blk.{i}.{suffix}");

            let mut experts = Vec::with_capacity(descriptor.num_experts);
            for e in 0..descriptor.num_experts {
                experts.push(Expert {
                    gate: take_shaped(
                        &mut file,
                        &name(&format!("ffn_gate.{e}.weight")),
                        &[descriptor.intermediate_dim, h],
                    )?,
                    up: take_shaped(
                        &mut file,
                        &name(&format!("ffn_up.{e}.weight")),
                        &[descriptor.intermediate_dim, h],
                    )?,
                    down: take_shaped(
                        &mut file,
                        &name(&format!("ffn_down.{e}.weight")),
                        &[h, descriptor.intermediate_dim],
                    )?,
                });
            }

            layers.push(Layer {
                attn_norm: dequantize_named(&mut file, &name("attn_norm.weight"), &[h])?,
                attn_q: take_shaped(&mut file, &name("attn_q.weight"), &[h, h])?,
                attn_k: take_shaped(&mut file, &name("attn_k.weight"), &[h, h])?,
                attn_v: take_shaped(&mut file, &name("attn_v.weight"), &[h, h])?,
                attn_output: take_shaped(&mut file, &name("attn_output.weight"), &[h, h])?,
                ffn_norm: dequantize_named(&mut file, &name("ffn_norm.weight"), &[h])?,
                router: take_shaped(
                    &mut file,
                    &name("ffn_gate_inp.weight"),
                    &[descriptor.num_experts, h],
                )?,
                experts,
            });
        }

        let output_norm = dequantize_named(&mut file, "output_norm.weight", &[h])?;
        let lm_head = take_shaped(&mut file, "output.weight", &[vocab_size, h])?;

        Ok(Self {
            descriptor,
            embedding,
            layers,
            output_norm,
            lm_head,
        })
    }

    /// The model's descriptor
    #[must_use]
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    /// Allocate a scratch buffer matching this model's dimensions
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when allocation fails.
    pub fn scratch(&self) -> Result<ScratchBuffer> {
        ScratchBuffer::new(
            self.descriptor.hidden_dim,
            self.descriptor.intermediate_dim,
            self.descriptor.num_experts,
            self.descriptor.vocab.size(),
            self.descriptor.context_window,
        )
    }

    /// Allocate a KV cache sized for this model's context window
    #[must_use]
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(
            self.descriptor.num_layers,
            self.descriptor.hidden_dim,
            self.descriptor.context_window,
        )
    }

    /// Process one token at `position`, extending the cache
    ///
    /// Logits for the next token are left in `scratch.logits`. The cursor
    /// advances only after every layer stored its K/V, so a failed step
    /// leaves the cache unchanged.
    ///
    /// # Errors
    ///
    /// `ContextOverflow` when the cache is full (checked before any write),
    /// `UnknownToken` for an out-of-vocabulary id, `InvalidInput` when
    /// `position` does not match the cache cursor.
    pub fn forward_step(
        &self,
        token: u32,
        position: usize,
        cache: &mut KvCache,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        if position != cache.len() {
            return Err(InferirError::InvalidInput {
                reason: format!(
                    "position {position} does not match cache cursor {}",
                    cache.len()
                ),
            });
        }
        if cache.remaining() == 0 {
            return Err(InferirError::ContextOverflow {
                position,
                capacity: cache.capacity(),
            });
        }

        self.embed(token, &mut scratch.hidden)?;

        let h = self.descriptor.hidden_dim;
        let num_heads = self.descriptor.num_heads;
        let head_dim = self.descriptor.head_dim();
        let theta = self.descriptor.rope_theta;
        let eps = self.descriptor.norm_eps;

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            rms_norm(&scratch.hidden, &layer.attn_norm, eps, &mut scratch.normed);

            matvec(
                &scratch.normed,
                &layer.attn_q.data,
                layer.attn_q.kind,
                h,
                h,
                &mut scratch.q,
            )?;
            matvec(
                &scratch.normed,
                &layer.attn_k.data,
                layer.attn_k.kind,
                h,
                h,
                &mut scratch.k,
            )?;
            matvec(
                &scratch.normed,
                &layer.attn_v.data,
                layer.attn_v.kind,
                h,
                h,
                &mut scratch.v,
            )?;

            apply_rope(&mut scratch.q, position, num_heads, head_dim, theta);
            apply_rope(&mut scratch.k, position, num_heads, head_dim, theta);

            attention_with_cache(
                &scratch.q,
                cache.keys(layer_idx),
                cache.values(layer_idx),
                &scratch.k,
                &scratch.v,
                num_heads,
                &mut scratch.attn_scores,
                &mut scratch.attn_out,
            );
            cache.store(layer_idx, &scratch.k, &scratch.v)?;

            matvec(
                &scratch.attn_out,
                &layer.attn_output.data,
                layer.attn_output.kind,
                h,
                h,
                &mut scratch.proj,
            )?;
            add_assign(&mut scratch.hidden, &scratch.proj);

            rms_norm(&scratch.hidden, &layer.ffn_norm, eps, &mut scratch.normed);
            // Combined expert output lands in scratch.ffn_out
            self.moe_ffn(layer, scratch)?;
            add_assign(&mut scratch.hidden, &scratch.ffn_out);
        }

        cache.advance()?;

        rms_norm(&scratch.hidden, &self.output_norm, eps, &mut scratch.normed);
        matvec(
            &scratch.normed,
            &self.lm_head.data,
            self.lm_head.kind,
            h,
            self.descriptor.vocab.size(),
            &mut scratch.logits,
        )?;

        Ok(())
    }

    /// Process a whole prompt without a cache
    ///
    /// Returns logits for every position, row-major
    /// `[tokens.len() * vocab_size]`. Attention at position `p` sees
    /// positions `0..=p` only.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty prompt, `ContextOverflow` for one longer
    /// than the context window, `UnknownToken` for out-of-vocabulary ids.
    pub fn forward_batch(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(InferirError::InvalidInput {
                reason: "cannot run forward pass on empty prompt".to_string(),
            });
        }
        if tokens.len() > self.descriptor.context_window {
            return Err(InferirError::ContextOverflow {
                position: tokens.len() - 1,
                capacity: self.descriptor.context_window,
            });
        }

        let seq = tokens.len();
        let h = self.descriptor.hidden_dim;
        let num_heads = self.descriptor.num_heads;
        let head_dim = self.descriptor.head_dim();
        let theta = self.descriptor.rope_theta;
        let eps = self.descriptor.norm_eps;
        let vocab_size = self.descriptor.vocab.size();

        // Residual stream for every position
        let mut hidden = vec![0.0f32; seq * h];
        for (p, &token) in tokens.iter().enumerate() {
            self.embed(token, &mut hidden[p * h..(p + 1) * h])?;
        }

        let mut scratch = self.scratch()?;
        let mut keys = vec![0.0f32; seq * h];
        let mut values = vec![0.0f32; seq * h];
        let mut queries = vec![0.0f32; seq * h];

        for layer in &self.layers {
            // Projections and RoPE for all positions first
            for p in 0..seq {
                rms_norm(&hidden[p * h..(p + 1) * h], &layer.attn_norm, eps, &mut scratch.normed);

                matvec(
                    &scratch.normed,
                    &layer.attn_q.data,
                    layer.attn_q.kind,
                    h,
                    h,
                    &mut queries[p * h..(p + 1) * h],
                )?;
                matvec(
                    &scratch.normed,
                    &layer.attn_k.data,
                    layer.attn_k.kind,
                    h,
                    h,
                    &mut keys[p * h..(p + 1) * h],
                )?;
                matvec(
                    &scratch.normed,
                    &layer.attn_v.data,
                    layer.attn_v.kind,
                    h,
                    h,
                    &mut values[p * h..(p + 1) * h],
                )?;

                apply_rope(&mut queries[p * h..(p + 1) * h], p, num_heads, head_dim, theta);
                apply_rope(&mut keys[p * h..(p + 1) * h], p, num_heads, head_dim, theta);
            }

            // Causal attention per position: prefix keys/values plus own
            for p in 0..seq {
                attention_with_cache(
                    &queries[p * h..(p + 1) * h],
                    &keys[..p * h],
                    &values[..p * h],
                    &keys[p * h..(p + 1) * h],
                    &values[p * h..(p + 1) * h],
                    num_heads,
                    &mut scratch.attn_scores,
                    &mut scratch.attn_out,
                );
                matvec(
                    &scratch.attn_out,
                    &layer.attn_output.data,
                    layer.attn_output.kind,
                    h,
                    h,
                    &mut scratch.proj,
                )?;
                add_assign(&mut hidden[p * h..(p + 1) * h], &scratch.proj);
            }

            // FFN per position
            for p in 0..seq {
                rms_norm(&hidden[p * h..(p + 1) * h], &layer.ffn_norm, eps, &mut scratch.normed);
                self.moe_ffn(layer, &mut scratch)?;
                add_assign(&mut hidden[p * h..(p + 1) * h], &scratch.ffn_out);
            }
        }

        let mut logits = vec![0.0f32; seq * vocab_size];
        for p in 0..seq {
            rms_norm(&hidden[p * h..(p + 1) * h], &self.output_norm, eps, &mut scratch.normed);
            matvec(
                &scratch.normed,
                &self.lm_head.data,
                self.lm_head.kind,
                h,
                vocab_size,
                &mut logits[p * vocab_size..(p + 1) * vocab_size],
            )?;
        }

        Ok(logits)
    }

    /// Routed expert FFN over `scratch.normed`, result in `scratch.ffn_out`
    fn moe_ffn(&self, layer: &Layer, scratch: &mut ScratchBuffer) -> Result<()> {
        let h = self.descriptor.hidden_dim;
        let inter = self.descriptor.intermediate_dim;

        matvec(
            &scratch.normed,
            &layer.router.data,
            layer.router.kind,
            h,
            self.descriptor.num_experts,
            &mut scratch.router,
        )?;

        let choices = select_experts(
            &scratch.router,
            self.descriptor.experts_per_token,
            self.descriptor.moe_norm,
        )?;

        scratch.ffn_out.fill(0.0);
        for choice in choices {
            let expert = &layer.experts[choice.index];

            matvec(
                &scratch.normed,
                &expert.gate.data,
                expert.gate.kind,
                h,
                inter,
                &mut scratch.gate,
            )?;
            matvec(
                &scratch.normed,
                &expert.up.data,
                expert.up.kind,
                h,
                inter,
                &mut scratch.up,
            )?;

            silu(&mut scratch.gate);
            mul_assign(&mut scratch.gate, &scratch.up);

            matvec(
                &scratch.gate,
                &expert.down.data,
                expert.down.kind,
                inter,
                h,
                &mut scratch.down,
            )?;

            crate::compute::axpy(&mut scratch.ffn_out, choice.weight, &scratch.down);
        }

        Ok(())
    }

    /// Copy a token's embedding row into `out`
    fn embed(&self, token: u32, out: &mut [f32]) -> Result<()> {
        let vocab_size = self.descriptor.vocab.size();
        if token as usize >= vocab_size {
            return Err(InferirError::UnknownToken {
                id: token,
                vocab_size,
            });
        }
        let h = self.descriptor.hidden_dim;
        let start = token as usize * h;
        out.copy_from_slice(&self.embedding[start..start + h]);
        Ok(())
    }
}

/// Take a tensor and check its declared shape
fn take_shaped(file: &mut ModelFile, name: &str, dims: &[usize]) -> Result<Tensor> {
    let tensor = file.take_tensor(name)?;
    if tensor.dims != dims {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "tensor '{name}' has shape {:?}, descriptor requires {dims:?}",
                tensor.dims
            ),
        });
    }
    Ok(tensor)
}

/// Take a tensor, check its shape, and dequantize it to f32
fn dequantize_named(file: &mut ModelFile, name: &str, dims: &[usize]) -> Result<Vec<f32>> {
    let tensor = take_shaped(file, name, dims)?;
    dequantize(tensor.kind, &tensor.data)
}
