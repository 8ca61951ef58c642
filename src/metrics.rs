//! Generation throughput metrics
//!
//! Tracks token counts and wall-clock time for one generation pass.
//! Throughput counts output tokens only; prompt tokens are recorded but do
//! not inflate tokens-per-second.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Live metrics for a generation pass
#[derive(Debug, Clone, Default)]
pub struct InferenceMetrics {
    input_tokens: usize,
    output_tokens: usize,
    started_at: Option<Instant>,
    elapsed_ms: u64,
}

/// Immutable snapshot of finished (or in-flight) metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Prompt tokens fed during prefill
    pub input_tokens: usize,
    /// Tokens produced during decode
    pub output_tokens: usize,
    /// Input plus output
    pub total_tokens: usize,
    /// Wall-clock generation time in milliseconds
    pub elapsed_ms: u64,
    /// Output tokens per second; zero when no time has elapsed
    pub tokens_per_second: f64,
}

impl InferenceMetrics {
    /// Fresh, unstarted metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of generation
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
        self.elapsed_ms = 0;
    }

    /// Record the prompt token count
    pub fn record_input(&mut self, count: usize) {
        self.input_tokens = count;
    }

    /// Record one produced token
    pub fn record_token(&mut self) {
        self.output_tokens += 1;
    }

    /// Mark the end of generation, freezing elapsed time
    pub fn stop(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }
    }

    /// Clear all counters and timing
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Elapsed milliseconds: frozen after [`InferenceMetrics::stop`], live
    /// while running
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        match self.started_at {
            Some(started) => u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            None => self.elapsed_ms,
        }
    }

    /// Output tokens per second of elapsed time
    ///
    /// `output_tokens * 1000 / elapsed_ms`, zero when no time has elapsed.
    #[must_use]
    pub fn tokens_per_second(&self) -> f64 {
        let elapsed = self.elapsed_ms();
        if elapsed == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.output_tokens as f64 * 1000.0 / elapsed as f64
        }
    }

    /// Snapshot the current state
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            elapsed_ms: self.elapsed_ms(),
            tokens_per_second: self.tokens_per_second(),
        }
    }
}
