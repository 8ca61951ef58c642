//! # Inferir
//!
//! Pure Rust on-device LLM inference engine for chat applications.
//!
//! Inferir (Spanish: "to infer") loads a quantized transformer from a
//! single validated model file and runs it on the CPU: BPE tokenization,
//! KV-cached autoregressive decoding, mixture-of-experts routing, and
//! temperature/top-k/top-p sampling, streamed token by token over a
//! channel with cooperative cancellation.
//!
//! ## Layers
//!
//! - [`format`] - model file parsing, validation, and the owned weight store
//! - [`tokenizer`] - BPE encode/decode driven by the model descriptor
//! - [`compute`] / [`quantize`] - SIMD primitives over quantized weights
//! - [`model`] - the transformer forward pass (cached and batched paths)
//! - [`kv_cache`] / [`moe`] / [`sampler`] - decoding machinery
//! - [`template`] / [`metrics`] - chat formatting and throughput tracking
//! - [`session`] / [`engine`] - the streaming generation state machine
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use inferir::{Engine, GenerationEvent, RespondRequest, Template};
//!
//! let mut engine = Engine::new();
//! engine.load(Path::new("olmoe.infr"), Template::olmoe(None))?;
//!
//! let (stream, cancel) = engine.respond(RespondRequest {
//!     input: "What is a mixture of experts?".to_string(),
//!     history: vec![],
//!     config: Default::default(),
//! })?;
//!
//! for event in stream {
//!     match event {
//!         GenerationEvent::Token(fragment) => print!("{fragment}"),
//!         GenerationEvent::Completed { metrics, .. } => {
//!             println!("\n{:.1} tok/s", metrics.tokens_per_second);
//!         }
//!         _ => break,
//!     }
//! }
//! # drop(cancel);
//! # Ok::<(), inferir::InferirError>(())
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::float_cmp)]

pub mod compute;
pub mod engine;
pub mod error;
pub mod format;
pub mod kv_cache;
pub mod metrics;
pub mod model;
pub mod moe;
pub mod quantize;
pub mod sampler;
pub mod session;
pub mod template;
pub mod tokenizer;

pub use engine::Engine;
pub use error::{InferirError, ModelLoadError, Result};
pub use format::{ModelDescriptor, ModelFile};
pub use metrics::{InferenceMetrics, MetricsSnapshot};
pub use model::Model;
pub use sampler::SamplingParams;
pub use session::{
    CancelHandle, GenerationConfig, GenerationEvent, RespondRequest, SessionState, StopReason,
    TokenStream,
};
pub use template::{Role, Template, Turn};
pub use tokenizer::Tokenizer;
