//! Mixture-of-experts routing
//!
//! The router scores every expert per token, selects the top K, and turns
//! the selected scores into combination weights. How the weights are
//! normalized is a property of the model descriptor, not a constant of the
//! engine: some checkpoints are trained with softmax over the selected K,
//! others with softmax over all experts before selection.

use serde::{Deserialize, Serialize};

use crate::compute::softmax;
use crate::error::{InferirError, Result};

/// How router scores become combination weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoeNormalization {
    /// Softmax over the K selected scores only; weights sum to 1
    SoftmaxTopK,
    /// Softmax over all expert scores first; selected experts keep their
    /// global probabilities, so weights sum to less than 1
    SoftmaxAll,
}

/// One selected expert with its combination weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpertChoice {
    /// Expert index into the layer's expert array
    pub index: usize,
    /// Combination weight under the descriptor's normalization mode
    pub weight: f32,
}

/// Select the top `k` experts from router logits
///
/// Ties are broken by the lowest expert index so routing is deterministic.
/// The returned choices are ordered by expert index.
///
/// # Errors
///
/// Returns `MoeError` when `k` is zero or exceeds the number of experts.
pub fn select_experts(
    router_logits: &[f32],
    k: usize,
    norm: MoeNormalization,
) -> Result<Vec<ExpertChoice>> {
    let num_experts = router_logits.len();
    if k == 0 || k > num_experts {
        return Err(InferirError::MoeError(format!(
            "cannot select {k} experts from {num_experts}"
        )));
    }

    // Stable sort by descending score keeps lowest index first on ties
    let mut order: Vec<usize> = (0..num_experts).collect();
    order.sort_by(|&a, &b| {
        router_logits[b]
            .partial_cmp(&router_logits[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut selected: Vec<usize> = order[..k].to_vec();
    selected.sort_unstable();

    let weights = match norm {
        MoeNormalization::SoftmaxTopK => {
            let mut scores: Vec<f32> = selected.iter().map(|&i| router_logits[i]).collect();
            softmax(&mut scores);
            scores
        }
        MoeNormalization::SoftmaxAll => {
            let mut all = router_logits.to_vec();
            softmax(&mut all);
            selected.iter().map(|&i| all[i]).collect()
        }
    };

    Ok(selected
        .into_iter()
        .zip(weights)
        .map(|(index, weight)| ExpertChoice { index, weight })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selects_exactly_k() {
        let logits = vec![0.1, 3.0, -1.0, 2.0, 0.5];
        let choices = select_experts(&logits, 2, MoeNormalization::SoftmaxTopK).unwrap();
        assert_eq!(choices.len(), 2);
        let indices: Vec<usize> = choices.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[test]
    fn test_weights_sum_to_one_topk() {
        let logits = vec![1.0, 2.0, 3.0, 4.0];
        let choices = select_experts(&logits, 3, MoeNormalization::SoftmaxTopK).unwrap();
        let sum: f32 = choices.iter().map(|c| c.weight).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_softmax_all_keeps_global_probabilities() {
        let logits = vec![1.0, 2.0, 3.0, 4.0];
        let choices = select_experts(&logits, 2, MoeNormalization::SoftmaxAll).unwrap();
        let sum: f32 = choices.iter().map(|c| c.weight).sum();
        // Selected mass is a strict subset of the full distribution
        assert!(sum < 1.0);
        assert!(sum > 0.5);
    }

    #[test]
    fn test_ties_break_by_lowest_index() {
        let logits = vec![1.0, 1.0, 1.0];
        let choices = select_experts(&logits, 2, MoeNormalization::SoftmaxTopK).unwrap();
        let indices: Vec<usize> = choices.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_k_equals_num_experts() {
        let logits = vec![0.5, -0.5];
        let choices = select_experts(&logits, 2, MoeNormalization::SoftmaxTopK).unwrap();
        assert_eq!(choices.len(), 2);
        assert!(choices[0].weight > choices[1].weight);
    }

    #[test]
    fn test_invalid_k_is_error() {
        let logits = vec![1.0, 2.0];
        assert!(select_experts(&logits, 0, MoeNormalization::SoftmaxTopK).is_err());
        assert!(select_experts(&logits, 3, MoeNormalization::SoftmaxTopK).is_err());
    }

    #[test]
    fn test_normalization_modes_select_same_experts() {
        let logits = vec![5.0, 1.0, 0.0];
        let topk = select_experts(&logits, 2, MoeNormalization::SoftmaxTopK).unwrap();
        let all = select_experts(&logits, 2, MoeNormalization::SoftmaxAll).unwrap();
        let topk_idx: Vec<usize> = topk.iter().map(|c| c.index).collect();
        let all_idx: Vec<usize> = all.iter().map(|c| c.index).collect();
        assert_eq!(topk_idx, all_idx);
        // TopK renormalizes over the selection, All does not
        let topk_sum: f32 = topk.iter().map(|c| c.weight).sum();
        let all_sum: f32 = all.iter().map(|c| c.weight).sum();
        assert!((topk_sum - 1.0).abs() < 1e-5);
        assert!(all_sum < 1.0);
    }
}
