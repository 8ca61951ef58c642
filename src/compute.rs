//! CPU compute backend: SIMD primitives for the forward pass
//!
//! All transformer math bottoms out in a handful of primitives defined here.
//! The same functions serve both the batched prefill path and the cached
//! single-token decode path, so logits cannot diverge between routes.
//!
//! ## Operations
//!
//! - [`dot`] - dot product (AVX2 fast path, scalar fallback)
//! - [`matvec`] - matrix-vector product over any [`QuantKind`] weight
//! - [`rms_norm`] - root-mean-square normalization
//! - [`softmax`] - numerically stable softmax (max subtraction)
//! - [`silu`] / [`add_assign`] / [`mul_assign`] - element-wise ops
//! - [`apply_rope`] - rotary position embedding (adjacent-pair rotation)
//! - [`attention_with_cache`] - causal attention over cached K/V
//! - [`argmax`] - greedy token selection

use crate::error::{InferirError, Result};
use crate::quantize::{QuantKind, BLOCK_SIZE, Q4_0_BLOCK_BYTES, Q8_0_BLOCK_BYTES};

/// Dot product with runtime AVX2 dispatch
///
/// Lengths must match; the shorter slice bounds the scalar fallback, and
/// callers are expected to pass equal-length slices.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2")
            && is_x86_feature_detected!("fma")
            && a.len() == b.len()
        {
            // SAFETY: AVX2 support verified at runtime above
            return unsafe { dot_avx2(a, b) };
        }
    }
    dot_scalar(a, b)
}

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::{
        _mm256_castps256_ps128, _mm256_extractf128_ps, _mm256_fmadd_ps, _mm256_loadu_ps,
        _mm256_setzero_ps, _mm_add_ps, _mm_add_ss, _mm_cvtss_f32, _mm_movehl_ps, _mm_shuffle_ps,
    };

    let n = a.len();
    let chunks = n / 8;
    let mut acc = _mm256_setzero_ps();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    // Horizontal sum of the 8 accumulator lanes
    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum4 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehl_ps(sum4, sum4);
    let sum2 = _mm_add_ps(sum4, shuf);
    let shuf2 = _mm_shuffle_ps(sum2, sum2, 0x1);
    let sum1 = _mm_add_ss(sum2, shuf2);
    let mut total = _mm_cvtss_f32(sum1);

    for i in (chunks * 8)..n {
        total += a[i] * b[i];
    }

    total
}

/// Matrix-vector product: `output[row] = weight_row(row) . input`
///
/// The weight matrix is row-major `[out_dim, in_dim]` stored in `kind`.
/// Quantized and half-precision rows are widened inside the dot loop, so
/// no path through here allocates.
///
/// # Errors
///
/// Returns `InvalidShape` when the weight byte length disagrees with the
/// given dimensions.
pub fn matvec(
    input: &[f32],
    weight: &[u8],
    kind: QuantKind,
    in_dim: usize,
    out_dim: usize,
    output: &mut [f32],
) -> Result<()> {
    if matches!(kind, QuantKind::Q4_0 | QuantKind::Q8_0) && in_dim % BLOCK_SIZE != 0 {
        return Err(InferirError::UnsupportedOperation {
            operation: "matvec".to_string(),
            reason: format!(
                "{kind:?} rows require in_dim divisible by {BLOCK_SIZE}, got {in_dim}"
            ),
        });
    }

    let expected = kind.byte_len(in_dim * out_dim)?;
    if weight.len() != expected {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "matvec weight has {} bytes, expected {} for [{out_dim}, {in_dim}] {kind:?}",
                weight.len(),
                expected
            ),
        });
    }
    if input.len() != in_dim || output.len() != out_dim {
        return Err(InferirError::InvalidShape {
            reason: format!(
                "matvec buffers: input {} (want {in_dim}), output {} (want {out_dim})",
                input.len(),
                output.len()
            ),
        });
    }

    match kind {
        QuantKind::F32 => {
            for (row, out) in output.iter_mut().enumerate() {
                let start = row * in_dim * 4;
                let row_bytes = &weight[start..start + in_dim * 4];
                *out = dot_f32_bytes(input, row_bytes);
            }
        }
        QuantKind::F16 => {
            for (row, out) in output.iter_mut().enumerate() {
                let start = row * in_dim * 2;
                *out = dot_f16_row(input, &weight[start..start + in_dim * 2]);
            }
        }
        QuantKind::Q4_0 => {
            let row_bytes_len = (in_dim / BLOCK_SIZE) * Q4_0_BLOCK_BYTES;
            for (row, out) in output.iter_mut().enumerate() {
                let start = row * row_bytes_len;
                *out = dot_q4_0_row(input, &weight[start..start + row_bytes_len]);
            }
        }
        QuantKind::Q8_0 => {
            let row_bytes_len = (in_dim / BLOCK_SIZE) * Q8_0_BLOCK_BYTES;
            for (row, out) in output.iter_mut().enumerate() {
                let start = row * row_bytes_len;
                *out = dot_q8_0_row(input, &weight[start..start + row_bytes_len]);
            }
        }
    }

    Ok(())
}

#[inline]
fn dot_f32_bytes(input: &[f32], row_bytes: &[u8]) -> f32 {
    let mut sum = 0.0f32;
    for (x, b) in input.iter().zip(row_bytes.chunks_exact(4)) {
        sum += x * f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
    sum
}

/// Fused widen-and-dot over one half-precision row
#[inline]
fn dot_f16_row(input: &[f32], row_bytes: &[u8]) -> f32 {
    let mut sum = 0.0f32;
    for (x, pair) in input.iter().zip(row_bytes.chunks_exact(2)) {
        sum += x * half::f16::from_le_bytes([pair[0], pair[1]]).to_f32();
    }
    sum
}

/// Fused dequantize-and-dot over one `Q4_0` row
#[inline]
fn dot_q4_0_row(input: &[f32], row: &[u8]) -> f32 {
    let mut sum = 0.0f32;
    for (block_idx, block) in row.chunks_exact(Q4_0_BLOCK_BYTES).enumerate() {
        let scale = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let base = block_idx * BLOCK_SIZE;
        let mut block_sum = 0.0f32;
        for (i, &byte) in block[4..].iter().enumerate() {
            #[allow(clippy::cast_possible_wrap)]
            let low = (byte & 0x0F) as i8 - 8;
            #[allow(clippy::cast_possible_wrap)]
            let high = ((byte >> 4) & 0x0F) as i8 - 8;
            block_sum += input[base + i * 2] * f32::from(low);
            block_sum += input[base + i * 2 + 1] * f32::from(high);
        }
        sum += scale * block_sum;
    }
    sum
}

/// Fused dequantize-and-dot over one `Q8_0` row
#[inline]
fn dot_q8_0_row(input: &[f32], row: &[u8]) -> f32 {
    let mut sum = 0.0f32;
    for (block_idx, block) in row.chunks_exact(Q8_0_BLOCK_BYTES).enumerate() {
        let scale = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let base = block_idx * BLOCK_SIZE;
        let mut block_sum = 0.0f32;
        for (i, &byte) in block[4..].iter().enumerate() {
            block_sum += input[base + i] * f32::from(i8::from_le_bytes([byte]));
        }
        sum += scale * block_sum;
    }
    sum
}

/// Root-mean-square normalization: `out = x / rms(x) * weight`
pub fn rms_norm(x: &[f32], weight: &[f32], eps: f32, output: &mut [f32]) {
    let sum_sq: f32 = x.iter().map(|v| v * v).sum();
    #[allow(clippy::cast_precision_loss)]
    let rms = (sum_sq / x.len() as f32 + eps).sqrt();
    let inv = 1.0 / rms;
    for ((out, &v), &w) in output.iter_mut().zip(x.iter()).zip(weight.iter()) {
        *out = v * inv * w;
    }
}

/// Numerically stable in-place softmax (max subtraction)
pub fn softmax(data: &mut [f32]) {
    if data.is_empty() {
        return;
    }
    let max = data.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let mut sum = 0.0f32;
    for v in data.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for v in data.iter_mut() {
            *v *= inv;
        }
    }
}

/// In-place SiLU activation: `x = x * sigmoid(x)`
#[inline]
pub fn silu(data: &mut [f32]) {
    for x in data.iter_mut() {
        *x = *x / (1.0 + (-*x).exp());
    }
}

/// Element-wise in-place addition: `a += b`
#[inline]
pub fn add_assign(a: &mut [f32], b: &[f32]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
}

/// Element-wise in-place multiplication: `a *= b`
#[inline]
pub fn mul_assign(a: &mut [f32], b: &[f32]) {
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x *= y;
    }
}

/// Scaled accumulate: `out += scale * v`
#[inline]
pub fn axpy(out: &mut [f32], scale: f32, v: &[f32]) {
    for (o, &x) in out.iter_mut().zip(v.iter()) {
        *o += scale * x;
    }
}

/// Apply rotary position embedding in place
///
/// Rotates adjacent pairs within each head: for pair index `i`,
/// `freq = theta^(-2i / head_dim)`, angle = `position * freq`.
/// `x` holds `num_heads` concatenated head vectors of `head_dim` each.
pub fn apply_rope(x: &mut [f32], position: usize, num_heads: usize, head_dim: usize, theta: f32) {
    #[allow(clippy::cast_precision_loss)]
    let pos = position as f32;
    for h in 0..num_heads {
        let head = &mut x[h * head_dim..(h + 1) * head_dim];
        for i in 0..head_dim / 2 {
            #[allow(clippy::cast_precision_loss)]
            let freq = theta.powf(-2.0 * i as f32 / head_dim as f32);
            let angle = pos * freq;
            let (sin, cos) = angle.sin_cos();
            let x0 = head[2 * i];
            let x1 = head[2 * i + 1];
            head[2 * i] = x0 * cos - x1 * sin;
            head[2 * i + 1] = x0 * sin + x1 * cos;
        }
    }
}

/// Causal multi-head attention over cached K/V plus the current position
///
/// `k_cache`/`v_cache` hold `cache_len` past positions row-major
/// `[cache_len, hidden_dim]`; `current_k`/`current_v` are the vectors for
/// the position being processed. Writes `softmax(q.K^T / sqrt(d)) V` into
/// `output`. `scores` is a reusable buffer (see [`ScratchBuffer`]) so the
/// decode loop stays allocation-free.
#[allow(clippy::too_many_arguments)]
pub fn attention_with_cache(
    q: &[f32],
    k_cache: &[f32],
    v_cache: &[f32],
    current_k: &[f32],
    current_v: &[f32],
    num_heads: usize,
    scores: &mut Vec<f32>,
    output: &mut [f32],
) {
    let hidden_dim = q.len();
    let head_dim = hidden_dim / num_heads;
    let cache_len = if hidden_dim > 0 {
        k_cache.len() / hidden_dim
    } else {
        0
    };
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / (head_dim as f32).sqrt();

    output.fill(0.0);

    for h in 0..num_heads {
        let head_offset = h * head_dim;
        let q_head = &q[head_offset..head_offset + head_dim];

        scores.clear();
        for pos in 0..cache_len {
            let k_start = pos * hidden_dim + head_offset;
            scores.push(dot(q_head, &k_cache[k_start..k_start + head_dim]) * scale);
        }
        scores.push(dot(q_head, &current_k[head_offset..head_offset + head_dim]) * scale);

        softmax(scores);

        let out_head = &mut output[head_offset..head_offset + head_dim];
        for (pos, &weight) in scores.iter().enumerate().take(cache_len) {
            let v_start = pos * hidden_dim + head_offset;
            axpy(out_head, weight, &v_cache[v_start..v_start + head_dim]);
        }
        axpy(
            out_head,
            scores[cache_len],
            &current_v[head_offset..head_offset + head_dim],
        );
    }
}

/// Index of the largest value, ties broken by lowest index
#[must_use]
pub fn argmax(data: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in data.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// Pre-allocated activation buffers for one forward position
///
/// Created once per session so the decode loop performs no steady-state
/// allocation. Buffer sizes come from the model descriptor.
pub struct ScratchBuffer {
    /// Residual stream
    pub hidden: Vec<f32>,
    /// Post-normalization activations
    pub normed: Vec<f32>,
    /// Query projection
    pub q: Vec<f32>,
    /// Key projection
    pub k: Vec<f32>,
    /// Value projection
    pub v: Vec<f32>,
    /// Attention output before the output projection
    pub attn_out: Vec<f32>,
    /// Output projection result
    pub proj: Vec<f32>,
    /// FFN gate activations
    pub gate: Vec<f32>,
    /// FFN up activations
    pub up: Vec<f32>,
    /// FFN down-projection result
    pub down: Vec<f32>,
    /// Combined expert output
    pub ffn_out: Vec<f32>,
    /// Router logits, one per expert
    pub router: Vec<f32>,
    /// Attention score buffer, sized for a full context window
    pub attn_scores: Vec<f32>,
    /// Final logits over the vocabulary
    pub logits: Vec<f32>,
}

impl ScratchBuffer {
    /// Allocate all activation buffers for the given model dimensions
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when a buffer reservation fails.
    pub fn new(
        hidden_dim: usize,
        intermediate_dim: usize,
        num_experts: usize,
        vocab_size: usize,
        context_window: usize,
    ) -> Result<Self> {
        Ok(Self {
            hidden: try_buffer(hidden_dim, "hidden")?,
            normed: try_buffer(hidden_dim, "normed")?,
            q: try_buffer(hidden_dim, "q")?,
            k: try_buffer(hidden_dim, "k")?,
            v: try_buffer(hidden_dim, "v")?,
            attn_out: try_buffer(hidden_dim, "attn_out")?,
            proj: try_buffer(hidden_dim, "proj")?,
            gate: try_buffer(intermediate_dim, "gate")?,
            up: try_buffer(intermediate_dim, "up")?,
            down: try_buffer(hidden_dim, "down")?,
            ffn_out: try_buffer(hidden_dim, "ffn_out")?,
            router: try_buffer(num_experts, "router")?,
            attn_scores: try_buffer(context_window, "attn_scores")?,
            logits: try_buffer(vocab_size, "logits")?,
        })
    }
}

fn try_buffer(len: usize, name: &str) -> Result<Vec<f32>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| InferirError::OutOfMemory {
            reason: format!("scratch buffer '{name}' of {len} floats"),
        })?;
    buf.resize(len, 0.0);
    Ok(buf)
}
