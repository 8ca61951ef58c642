//! Generation sessions: the decode loop and its event stream
//!
//! A session moves through `Idle -> Prefilling -> Decoding` and ends in
//! exactly one of `Completed`, `Cancelled`, or `Failed`. Consumers observe
//! it through a channel of [`GenerationEvent`]s: one `Token` per produced
//! fragment, then a single terminal event. Streamed tokens are never
//! retracted; cancellation keeps everything already emitted.
//!
//! Events travel over a rendezvous channel, so the worker cannot run ahead
//! of the consumer: a cancel issued before receiving a token is observed
//! by the worker before it produces the next one.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::compute::argmax;
use crate::error::InferirError;
use crate::kv_cache::KvCache;
use crate::metrics::{InferenceMetrics, MetricsSnapshot};
use crate::model::Model;
use crate::sampler::{sample, SamplingParams};
use crate::template::{Template, Turn};
use crate::tokenizer::Tokenizer;

/// Where a generation session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session running
    Idle,
    /// Feeding prompt tokens through the model
    Prefilling,
    /// Producing output tokens
    Decoding,
    /// Finished normally
    Completed,
    /// Stopped on request; emitted tokens remain valid
    Cancelled,
    /// Stopped on error
    Failed,
}

impl SessionState {
    fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Prefilling => 1,
            Self::Decoding => 2,
            Self::Completed => 3,
            Self::Cancelled => 4,
            Self::Failed => 5,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Prefilling,
            2 => Self::Decoding,
            3 => Self::Completed,
            4 => Self::Cancelled,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Why a completed session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The model produced the end-of-sequence token
    StopToken,
    /// The template's stop sequence appeared in the output
    StopSequence,
    /// The configured token budget was reached
    MaxTokens,
    /// The context window filled up; a clean stop, not an error
    ContextFull,
}

/// One event in a session's output stream
#[derive(Debug)]
pub enum GenerationEvent {
    /// A produced token's text fragment
    Token(String),
    /// Terminal: finished normally
    Completed {
        /// Full generated text
        text: String,
        /// Why generation stopped
        stop_reason: StopReason,
        /// Throughput for this pass
        metrics: MetricsSnapshot,
    },
    /// Terminal: stopped by the consumer
    Cancelled {
        /// Text produced before the cancel took effect
        text: String,
        /// Throughput for the partial pass
        metrics: MetricsSnapshot,
    },
    /// Terminal: stopped on error
    Failed {
        /// What went wrong
        error: InferirError,
        /// Text produced before the failure
        text: String,
    },
}

/// Decoding parameters for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Logit divisor; 0.0 selects greedy decoding
    pub temperature: f32,
    /// Top-k restriction; 1 selects greedy decoding, 0 disables
    pub top_k: usize,
    /// Nucleus mass in (0, 1]
    pub top_p: f32,
    /// Maximum tokens to produce
    pub max_tokens: usize,
    /// RNG seed; `None` draws one from the system
    pub seed: Option<u64>,
    /// Token ids that end generation; `None` uses the model's eos token,
    /// an empty list disables token-based stopping
    pub stop_tokens: Option<Vec<u32>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            max_tokens: 256,
            seed: None,
            stop_tokens: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding: temperature zero or a top-k of one
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0 || self.top_k == 1
    }
}

/// One generation request
#[derive(Debug, Clone)]
pub struct RespondRequest {
    /// The new user input
    pub input: String,
    /// Prior turns; ignored when the engine holds retained session state
    pub history: Vec<Turn>,
    /// Decoding parameters
    pub config: GenerationConfig,
}

/// Receiving side of a session's event stream
#[derive(Debug)]
pub struct TokenStream {
    rx: Receiver<GenerationEvent>,
}

impl TokenStream {
    pub(crate) fn new(rx: Receiver<GenerationEvent>) -> Self {
        Self { rx }
    }

    /// Block for the next event; `None` once the stream is exhausted
    #[must_use]
    pub fn recv(&self) -> Option<GenerationEvent> {
        self.rx.recv().ok()
    }
}

impl Iterator for TokenStream {
    type Item = GenerationEvent;

    fn next(&mut self) -> Option<GenerationEvent> {
        self.rx.recv().ok()
    }
}

/// Cooperative cancellation for one session
///
/// Cloneable; cancelling is idempotent. The worker checks the flag once
/// per token boundary, so cancellation never interrupts a token mid-step.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Request the session stop at the next token boundary
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Shared phase indicator updated by the worker
#[derive(Clone, Default)]
pub(crate) struct PhaseCell {
    code: Arc<AtomicU8>,
}

impl PhaseCell {
    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_code(self.code.load(Ordering::SeqCst))
    }

    fn set(&self, state: SessionState) {
        self.code.store(state.code(), Ordering::SeqCst);
    }
}

/// KV state retained between turns of one conversation
pub(crate) struct SavedSession {
    cache: KvCache,
    position: usize,
}

/// Everything the worker thread needs
pub(crate) struct WorkerContext {
    pub model: Arc<Model>,
    pub tokenizer: Arc<Tokenizer>,
    pub template: Template,
    pub request: RespondRequest,
    pub cancel: Arc<AtomicBool>,
    pub phase: PhaseCell,
    pub memory: Arc<Mutex<Option<SavedSession>>>,
    pub last_metrics: Arc<Mutex<Option<MetricsSnapshot>>>,
    pub tx: SyncSender<GenerationEvent>,
}

/// Outcome of the decode loop, before event emission
enum Outcome {
    Completed(StopReason),
    Cancelled,
    Failed(InferirError),
}

/// Drive one full generation session on the current thread
///
/// Emits token events followed by exactly one terminal event, updates the
/// shared metrics cell, and retains KV state for continuation unless the
/// session failed.
pub(crate) fn run_session(ctx: &WorkerContext) {
    let mut metrics = InferenceMetrics::new();
    metrics.start();

    let mut text = String::new();
    let outcome = generate(ctx, &mut metrics, &mut text);

    metrics.stop();
    let snapshot = metrics.snapshot();
    if let Ok(mut slot) = ctx.last_metrics.lock() {
        *slot = Some(snapshot);
    }

    let (state, event) = match outcome {
        Outcome::Completed(stop_reason) => (
            SessionState::Completed,
            GenerationEvent::Completed {
                text,
                stop_reason,
                metrics: snapshot,
            },
        ),
        Outcome::Cancelled => (
            SessionState::Cancelled,
            GenerationEvent::Cancelled {
                text,
                metrics: snapshot,
            },
        ),
        Outcome::Failed(error) => {
            // A failed session's KV state is not trustworthy
            if let Ok(mut memory) = ctx.memory.lock() {
                *memory = None;
            }
            (SessionState::Failed, GenerationEvent::Failed { error, text })
        }
    };

    ctx.phase.set(state);
    let _ = ctx.tx.send(event);
}

fn generate(
    ctx: &WorkerContext,
    metrics: &mut InferenceMetrics,
    text: &mut String,
) -> Outcome {
    ctx.phase.set(SessionState::Prefilling);

    let saved = ctx.memory.lock().ok().and_then(|mut m| m.take());
    let continuing = saved.is_some();
    let (mut cache, mut position) = match saved {
        Some(s) => (s.cache, s.position),
        None => (ctx.model.new_cache(), 0),
    };

    let prompt = ctx
        .template
        .render(&ctx.request.input, &ctx.request.history, continuing);
    let prompt_ids = match ctx.tokenizer.encode(&prompt) {
        Ok(ids) => ids,
        Err(e) => return Outcome::Failed(e),
    };
    if prompt_ids.is_empty() {
        return Outcome::Failed(InferirError::InvalidInput {
            reason: "rendered prompt produced no tokens".to_string(),
        });
    }
    metrics.record_input(prompt_ids.len());
    if let Ok(mut slot) = ctx.last_metrics.lock() {
        *slot = Some(metrics.snapshot());
    }

    let mut scratch = match ctx.model.scratch() {
        Ok(s) => s,
        Err(e) => return Outcome::Failed(e),
    };

    // Prefill: the prompt must fit; overflow here is a hard failure since
    // nothing was generated yet
    for &token in &prompt_ids {
        if let Err(e) = ctx.model.forward_step(token, position, &mut cache, &mut scratch) {
            return Outcome::Failed(e);
        }
        position += 1;
    }

    ctx.phase.set(SessionState::Decoding);

    let config = &ctx.request.config;
    let params = SamplingParams {
        temperature: config.temperature,
        top_k: config.top_k,
        top_p: config.top_p,
    };
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let default_stops = [ctx.model.descriptor().eos_token_id];
    let stop_tokens: &[u32] = config.stop_tokens.as_deref().unwrap_or(&default_stops);
    let stop_sequence = ctx.template.stop_sequence.clone();

    let mut produced = 0usize;
    let outcome = loop {
        let token = if config.is_greedy() {
            argmax(&scratch.logits) as u32
        } else {
            match sample(&scratch.logits, &params, &mut rng) {
                Ok(t) => t,
                Err(e) => break Outcome::Failed(e),
            }
        };

        if stop_tokens.contains(&token) {
            break Outcome::Completed(StopReason::StopToken);
        }

        let fragment = match ctx.tokenizer.decode(token) {
            Ok(f) => f.to_string(),
            Err(e) => break Outcome::Failed(e),
        };
        text.push_str(&fragment);

        if let Some(stop) = &stop_sequence {
            if let Some(at) = text.find(stop.as_str()) {
                text.truncate(at);
                break Outcome::Completed(StopReason::StopSequence);
            }
        }

        metrics.record_token();
        produced += 1;
        if let Ok(mut slot) = ctx.last_metrics.lock() {
            *slot = Some(metrics.snapshot());
        }
        if ctx.tx.send(GenerationEvent::Token(fragment)).is_err() {
            // Consumer went away; treat like a cancel
            break Outcome::Cancelled;
        }

        // Feed the emitted token before any stop check, so retained state
        // always covers the text the consumer saw
        match ctx.model.forward_step(token, position, &mut cache, &mut scratch) {
            Ok(()) => position += 1,
            Err(InferirError::ContextOverflow { .. }) => {
                break Outcome::Completed(StopReason::ContextFull);
            }
            Err(e) => break Outcome::Failed(e),
        }

        if ctx.cancel.load(Ordering::SeqCst) {
            break Outcome::Cancelled;
        }
        if produced >= config.max_tokens {
            break Outcome::Completed(StopReason::MaxTokens);
        }
    };

    // Retain KV state for continuation on any non-failed outcome
    if !matches!(outcome, Outcome::Failed(_)) {
        if let Ok(mut memory) = ctx.memory.lock() {
            *memory = Some(SavedSession { cache, position });
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{factory, write_model_file, ModelFile};

    fn toy_worker_parts() -> (Arc<Model>, Arc<Tokenizer>) {
        let (descriptor, tensors) = factory::toy_model();
        let file = tempfile::NamedTempFile::new().unwrap();
        write_model_file(file.path(), &descriptor, &tensors).unwrap();
        let model = Model::from_file(ModelFile::load(file.path()).unwrap()).unwrap();
        let tokenizer = Tokenizer::new(descriptor.vocab.clone(), descriptor.merges.clone());
        (Arc::new(model), Arc::new(tokenizer))
    }

    #[test]
    fn test_retained_state_covers_all_emitted_tokens() {
        let (model, tokenizer) = toy_worker_parts();
        let (tx, rx) = std::sync::mpsc::sync_channel(0);
        let memory = Arc::new(Mutex::new(None));

        let ctx = WorkerContext {
            model,
            tokenizer,
            template: Template::default(),
            // Prompt "<bos>hi" is 2 tokens; budget allows 2 more
            request: RespondRequest {
                input: "<bos>hi".to_string(),
                history: vec![],
                config: GenerationConfig {
                    temperature: 0.0,
                    max_tokens: 2,
                    stop_tokens: Some(vec![]),
                    ..GenerationConfig::default()
                },
            },
            cancel: Arc::new(AtomicBool::new(false)),
            phase: PhaseCell::default(),
            memory: Arc::clone(&memory),
            last_metrics: Arc::new(Mutex::new(None)),
            tx,
        };

        let worker = std::thread::spawn(move || run_session(&ctx));
        let mut emitted = 0;
        for event in rx.iter() {
            if matches!(event, GenerationEvent::Token(_)) {
                emitted += 1;
            }
        }
        worker.join().unwrap();

        assert_eq!(emitted, 2);
        let saved = memory.lock().unwrap();
        let saved = saved.as_ref().expect("completed session retains state");
        // Every streamed token was fed through the model, so the cache
        // covers the full visible conversation: prompt plus output
        assert_eq!(saved.position, 2 + emitted);
        assert_eq!(saved.cache.len(), saved.position);
    }

    #[test]
    fn test_greedy_detection() {
        let mut config = GenerationConfig::default();
        assert!(!config.is_greedy());
        config.temperature = 0.0;
        assert!(config.is_greedy());
        config = GenerationConfig {
            top_k: 1,
            ..GenerationConfig::default()
        };
        assert!(config.is_greedy());
    }

    #[test]
    fn test_session_state_codes_roundtrip() {
        for state in [
            SessionState::Idle,
            SessionState::Prefilling,
            SessionState::Decoding,
            SessionState::Completed,
            SessionState::Cancelled,
            SessionState::Failed,
        ] {
            assert_eq!(SessionState::from_code(state.code()), state);
        }
    }

    #[test]
    fn test_cancel_handle_is_idempotent() {
        let handle = CancelHandle::new(Arc::new(AtomicBool::new(false)));
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_default_config_matches_chat_defaults() {
        let config = GenerationConfig::default();
        assert!((config.temperature - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.top_k, 40);
        assert!((config.top_p - 0.95).abs() < f32::EPSILON);
    }
}
