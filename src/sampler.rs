//! Token sampling: temperature, top-k, top-p
//!
//! One pipeline, applied in order: temperature scaling, top-k restriction,
//! softmax, top-p nucleus truncation, renormalization, draw. The sampled
//! token always comes from the filtered candidate set, and a fixed RNG
//! seed reproduces the same choice for the same logits.
//!
//! Greedy decoding does not go through this pipeline; the session uses
//! [`crate::compute::argmax`] directly when temperature is zero or top-k
//! is one.

use rand::Rng;

use crate::compute::softmax;
use crate::error::{InferirError, Result};

/// Stochastic sampling parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Logit divisor; must be positive here (zero means greedy upstream)
    pub temperature: f32,
    /// Keep only the k highest logits; 0 disables the restriction
    pub top_k: usize,
    /// Nucleus mass; keep the smallest prefix of candidates whose
    /// cumulative probability reaches this value. 1.0 disables it.
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
        }
    }
}

/// Sample a token id from logits
///
/// # Errors
///
/// Returns `InvalidInput` when temperature is not positive, `top_p` is
/// outside `(0, 1]`, or `logits` is empty.
pub fn sample<R: Rng>(logits: &[f32], params: &SamplingParams, rng: &mut R) -> Result<u32> {
    if logits.is_empty() {
        return Err(InferirError::InvalidInput {
            reason: "cannot sample from empty logits".to_string(),
        });
    }
    if params.temperature <= 0.0 || !params.temperature.is_finite() {
        return Err(InferirError::InvalidInput {
            reason: format!(
                "temperature must be positive for stochastic sampling, got {}",
                params.temperature
            ),
        });
    }
    if params.top_p <= 0.0 || params.top_p > 1.0 {
        return Err(InferirError::InvalidInput {
            reason: format!("top_p must be in (0, 1], got {}", params.top_p),
        });
    }

    // Temperature scale, then order candidates by descending logit.
    // Stable sort keeps lowest ids first on ties.
    let mut candidates: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i as u32, l / params.temperature))
        .collect();
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if params.top_k > 0 && params.top_k < candidates.len() {
        candidates.truncate(params.top_k);
    }

    let mut probs: Vec<f32> = candidates.iter().map(|&(_, l)| l).collect();
    softmax(&mut probs);

    // Nucleus truncation: smallest prefix reaching top_p
    if params.top_p < 1.0 {
        let mut cumulative = 0.0f32;
        let mut cutoff = probs.len();
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= params.top_p {
                cutoff = i + 1;
                break;
            }
        }
        candidates.truncate(cutoff);
        probs.truncate(cutoff);

        let mass: f32 = probs.iter().sum();
        if mass > 0.0 {
            for p in &mut probs {
                *p /= mass;
            }
        }
    }

    // Draw from the renormalized distribution
    let draw: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    for (&(id, _), &p) in candidates.iter().zip(&probs) {
        cumulative += p;
        if draw < cumulative {
            return Ok(id);
        }
    }

    // Rounding can leave the draw past the last boundary
    Ok(candidates[candidates.len() - 1].0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn test_top_k_one_is_argmax() {
        let logits = vec![0.1, 2.0, 0.3, 1.5];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
        };
        for seed in 0..20 {
            assert_eq!(sample(&logits, &params, &mut rng(seed)).unwrap(), 1);
        }
    }

    #[test]
    fn test_sample_stays_in_top_k() {
        let logits = vec![5.0, 4.0, 3.0, -10.0, -20.0];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 3,
            top_p: 1.0,
        };
        for seed in 0..50 {
            let id = sample(&logits, &params, &mut rng(seed)).unwrap();
            assert!(id <= 2, "sampled {id} outside top-3");
        }
    }

    #[test]
    fn test_top_p_prunes_tail() {
        // One dominant candidate holds nearly all the mass
        let logits = vec![20.0, 0.0, 0.0, 0.0];
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.9,
        };
        for seed in 0..50 {
            assert_eq!(sample(&logits, &params, &mut rng(seed)).unwrap(), 0);
        }
    }

    #[test]
    fn test_deterministic_per_seed() {
        let logits = vec![1.0, 1.1, 0.9, 1.05];
        let params = SamplingParams::default();
        let a = sample(&logits, &params, &mut rng(42)).unwrap();
        let b = sample(&logits, &params, &mut rng(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_temperature_rejected() {
        let params = SamplingParams {
            temperature: 0.0,
            top_k: 40,
            top_p: 0.95,
        };
        let err = sample(&[1.0, 2.0], &params, &mut rng(0)).unwrap_err();
        assert!(matches!(err, InferirError::InvalidInput { .. }));
    }

    #[test]
    fn test_invalid_top_p_rejected() {
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.0,
        };
        assert!(sample(&[1.0, 2.0], &params, &mut rng(0)).is_err());
        let params = SamplingParams {
            top_p: 1.5,
            ..params
        };
        assert!(sample(&[1.0, 2.0], &params, &mut rng(0)).is_err());
    }

    #[test]
    fn test_empty_logits_rejected() {
        assert!(sample(&[], &SamplingParams::default(), &mut rng(0)).is_err());
    }

    #[test]
    fn test_low_temperature_concentrates() {
        let logits = vec![1.0, 1.2];
        let params = SamplingParams {
            temperature: 0.01,
            top_k: 0,
            top_p: 1.0,
        };
        // At near-zero temperature the higher logit dominates completely
        for seed in 0..50 {
            assert_eq!(sample(&logits, &params, &mut rng(seed)).unwrap(), 1);
        }
    }
}
