//! Key-value cache for autoregressive decoding
//!
//! Per-layer K and V buffers sized for the full context window, written
//! through a single cursor. Storing all layers for a position and then
//! advancing the cursor gives O(1) per-token attention input instead of
//! recomputing the whole prefix.
//!
//! The cursor never exceeds the capacity; a full cache reports
//! [`InferirError::ContextOverflow`], which the generation session treats
//! as a clean stop rather than a failure.

use crate::error::{InferirError, Result};

/// KV cache over all layers of a model
#[derive(Clone)]
pub struct KvCache {
    /// Key buffers: one `[capacity * kv_dim]` slab per layer
    k: Vec<Vec<f32>>,
    /// Value buffers, same shape as keys
    v: Vec<Vec<f32>>,
    /// Positions currently cached
    cursor: usize,
    kv_dim: usize,
    capacity: usize,
}

impl KvCache {
    /// Allocate a cache for `num_layers` layers of `kv_dim` wide K/V
    /// vectors, holding up to `capacity` positions
    #[must_use]
    pub fn new(num_layers: usize, kv_dim: usize, capacity: usize) -> Self {
        Self {
            k: vec![vec![0.0; capacity * kv_dim]; num_layers],
            v: vec![vec![0.0; capacity * kv_dim]; num_layers],
            cursor: 0,
            kv_dim,
            capacity,
        }
    }

    /// Store K and V for one layer at the current cursor position
    ///
    /// Call once per layer, then [`KvCache::advance`] after all layers.
    ///
    /// # Errors
    ///
    /// `ContextOverflow` when the cache is full; `InvalidShape` when the
    /// vectors are not `kv_dim` long.
    pub fn store(&mut self, layer: usize, k: &[f32], v: &[f32]) -> Result<()> {
        if self.cursor >= self.capacity {
            return Err(InferirError::ContextOverflow {
                position: self.cursor,
                capacity: self.capacity,
            });
        }
        if k.len() != self.kv_dim || v.len() != self.kv_dim {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "kv vectors are {}/{} wide, cache expects {}",
                    k.len(),
                    v.len(),
                    self.kv_dim
                ),
            });
        }

        let start = self.cursor * self.kv_dim;
        self.k[layer][start..start + self.kv_dim].copy_from_slice(k);
        self.v[layer][start..start + self.kv_dim].copy_from_slice(v);
        Ok(())
    }

    /// Advance the cursor after all layers stored the current position
    ///
    /// # Errors
    ///
    /// `ContextOverflow` when the cache is already full.
    pub fn advance(&mut self) -> Result<()> {
        if self.cursor >= self.capacity {
            return Err(InferirError::ContextOverflow {
                position: self.cursor,
                capacity: self.capacity,
            });
        }
        self.cursor += 1;
        Ok(())
    }

    /// Cached keys for a layer: positions `0..cursor`, excluding the
    /// position currently being computed
    #[must_use]
    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.k[layer][..self.cursor * self.kv_dim]
    }

    /// Cached values for a layer
    #[must_use]
    pub fn values(&self, layer: usize) -> &[f32] {
        &self.v[layer][..self.cursor * self.kv_dim]
    }

    /// Number of cached positions
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursor
    }

    /// True when nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Maximum positions this cache can hold
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining positions before the cache is full
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Reset the cursor; allocated memory is kept
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}
