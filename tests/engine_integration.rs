//! End-to-end engine tests against the deterministic toy model
//!
//! The toy model is a real 2-layer MoE transformer with vocabulary
//! `<bos>`=0, `hi`=1, ` there`=2, `<eos>`=3, written to a temp file and
//! loaded through the full validation path.

use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use inferir::format::{factory, write_model_file};
use inferir::{
    Engine, GenerationConfig, GenerationEvent, InferirError, ModelLoadError, RespondRequest,
    SessionState, StopReason, Template,
};

fn toy_model_file() -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    let (descriptor, tensors) = factory::toy_model();
    write_model_file(file.path(), &descriptor, &tensors).unwrap();
    file
}

fn loaded_engine(path: &Path) -> Engine {
    // Empty template: the raw input is the prompt
    let mut engine = Engine::new();
    engine.load(path, Template::default()).unwrap();
    engine
}

fn greedy_config(max_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        temperature: 0.0,
        max_tokens,
        // Never stop on a token id: budget and cancellation control length
        stop_tokens: Some(vec![]),
        ..GenerationConfig::default()
    }
}

fn request(input: &str, config: GenerationConfig) -> RespondRequest {
    RespondRequest {
        input: input.to_string(),
        history: vec![],
        config,
    }
}

/// Wait for the worker thread to release the engine after the terminal
/// event was consumed
fn wait_ready(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !engine.is_ready() {
        assert!(Instant::now() < deadline, "engine never became ready");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn collect(engine: &Engine, req: RespondRequest) -> (Vec<String>, GenerationEvent) {
    let (stream, _cancel) = engine.respond(req).unwrap();
    let mut tokens = Vec::new();
    for event in stream {
        match event {
            GenerationEvent::Token(fragment) => tokens.push(fragment),
            terminal => return (tokens, terminal),
        }
    }
    panic!("stream ended without a terminal event");
}

#[test]
fn greedy_decoding_is_deterministic_across_runs() {
    let file = toy_model_file();

    let run = || {
        let engine = loaded_engine(file.path());
        let (tokens, terminal) = collect(&engine, request("<bos>hi", greedy_config(8)));
        assert!(matches!(terminal, GenerationEvent::Completed { .. }));
        tokens
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first.len(), 8);
}

#[test]
fn cancel_before_first_token_yields_exactly_one_token() {
    let file = toy_model_file();
    let engine = loaded_engine(file.path());

    let (stream, cancel) = engine.respond(request("<bos>hi", greedy_config(20))).unwrap();
    // The worker is paused at the rendezvous with token 1 already produced;
    // cancelling now is observed at the next token boundary
    cancel.cancel();

    let mut tokens = Vec::new();
    let mut terminal = None;
    for event in stream {
        match event {
            GenerationEvent::Token(fragment) => tokens.push(fragment),
            other => {
                terminal = Some(other);
                break;
            }
        }
    }

    assert_eq!(tokens.len(), 1, "expected exactly one streamed token");
    match terminal.expect("missing terminal event") {
        GenerationEvent::Cancelled { text, metrics } => {
            assert_eq!(text, tokens[0]);
            assert_eq!(metrics.output_tokens, 1);
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
    wait_ready(&engine);
    assert_eq!(engine.state(), SessionState::Cancelled);
}

#[test]
fn truncated_model_file_reports_truncated() {
    let file = toy_model_file();
    let bytes = std::fs::read(file.path()).unwrap();

    let cut = NamedTempFile::new().unwrap();
    std::fs::write(cut.path(), &bytes[..bytes.len() / 3]).unwrap();

    let mut engine = Engine::new();
    let err = engine.load(cut.path(), Template::default()).unwrap_err();
    assert!(matches!(
        err,
        InferirError::ModelLoad(ModelLoadError::Truncated { .. })
    ));
    assert!(!engine.is_ready());
}

#[test]
fn second_respond_and_unload_fail_while_busy() {
    let file = toy_model_file();
    let mut engine = loaded_engine(file.path());

    let (stream, _cancel) = engine.respond(request("<bos>hi", greedy_config(4))).unwrap();

    // Worker is alive and paused at the first rendezvous
    let err = engine
        .respond(request("<bos>hi", greedy_config(4)))
        .unwrap_err();
    assert!(matches!(err, InferirError::ModelBusy { .. }));
    assert!(matches!(
        engine.unload().unwrap_err(),
        InferirError::ModelBusy { .. }
    ));
    assert!(!engine.is_ready());

    // Drain and the engine becomes usable again
    for _ in stream {}
    wait_ready(&engine);
    engine.unload().unwrap();
}

#[test]
fn completed_session_exposes_metrics() {
    let file = toy_model_file();
    let engine = loaded_engine(file.path());

    let (tokens, terminal) = collect(&engine, request("<bos>hi", greedy_config(4)));
    assert_eq!(tokens.len(), 4);

    match terminal {
        GenerationEvent::Completed {
            text,
            stop_reason,
            metrics,
        } => {
            assert_eq!(stop_reason, StopReason::MaxTokens);
            assert_eq!(text, tokens.concat());
            assert_eq!(metrics.input_tokens, 2);
            assert_eq!(metrics.output_tokens, 4);
            assert_eq!(metrics.total_tokens, 6);
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    wait_ready(&engine);
    let snapshot = engine.last_metrics().unwrap();
    assert_eq!(snapshot.output_tokens, 4);
    assert_eq!(engine.state(), SessionState::Completed);
}

#[test]
fn metrics_are_pollable_mid_generation() {
    let file = toy_model_file();
    let engine = loaded_engine(file.path());

    let (stream, _cancel) = engine.respond(request("<bos>hi", greedy_config(4))).unwrap();

    // The worker publishes a snapshot before handing over each token, so
    // after receiving one the shared cell reflects it already
    let first = stream.recv().expect("first event");
    assert!(matches!(first, GenerationEvent::Token(_)));
    let live = engine.last_metrics().expect("live snapshot");
    assert_eq!(live.input_tokens, 2);
    assert!(live.output_tokens >= 1);

    for _ in stream {}
    wait_ready(&engine);
    assert_eq!(engine.last_metrics().unwrap().output_tokens, 4);
}

#[test]
fn follow_up_turn_continues_from_retained_state() {
    let file = toy_model_file();
    let mut engine = loaded_engine(file.path());

    let (first, terminal) = collect(&engine, request("<bos>hi", greedy_config(2)));
    assert_eq!(first.len(), 2);
    assert!(matches!(terminal, GenerationEvent::Completed { .. }));
    wait_ready(&engine);

    // Second turn reuses the cached prefix instead of reprocessing it
    let (second, terminal) = collect(&engine, request(" there", greedy_config(2)));
    assert_eq!(second.len(), 2);
    assert!(matches!(terminal, GenerationEvent::Completed { .. }));
    wait_ready(&engine);

    // clear() drops the retained state; a fresh turn still works
    engine.clear().unwrap();
    let (third, terminal) = collect(&engine, request("<bos>hi", greedy_config(2)));
    assert_eq!(third.len(), 2);
    assert!(matches!(terminal, GenerationEvent::Completed { .. }));
    // Same prompt from a fresh cache reproduces the first turn
    assert_eq!(third, first);
}

#[test]
fn eos_token_stops_generation() {
    let file = toy_model_file();
    let engine = loaded_engine(file.path());

    // Stop on every vocabulary token: the very first sample terminates
    let config = GenerationConfig {
        temperature: 0.0,
        max_tokens: 8,
        stop_tokens: Some(vec![0, 1, 2, 3]),
        ..GenerationConfig::default()
    };
    let (tokens, terminal) = collect(&engine, request("<bos>hi", config));
    assert!(tokens.is_empty());
    match terminal {
        GenerationEvent::Completed { stop_reason, .. } => {
            assert_eq!(stop_reason, StopReason::StopToken);
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[test]
fn tiny_context_window_stops_cleanly() {
    let file = NamedTempFile::new().unwrap();
    let (descriptor, tensors) = factory::toy_model_with_context(4);
    write_model_file(file.path(), &descriptor, &tensors).unwrap();
    let engine = loaded_engine(file.path());

    // Prompt takes 2 positions; decode can feed 2 more before the window
    // fills, which ends the session without an error
    let (tokens, terminal) = collect(&engine, request("<bos>hi", greedy_config(20)));
    assert!(!tokens.is_empty());
    match terminal {
        GenerationEvent::Completed { stop_reason, .. } => {
            assert_eq!(stop_reason, StopReason::ContextFull);
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[test]
fn seeded_sampling_is_reproducible() {
    let file = toy_model_file();

    let run = |seed: u64| {
        let engine = loaded_engine(file.path());
        let config = GenerationConfig {
            temperature: 0.9,
            top_k: 3,
            top_p: 0.95,
            max_tokens: 6,
            seed: Some(seed),
            stop_tokens: Some(vec![]),
        };
        let (tokens, _) = collect(&engine, request("<bos>hi", config));
        tokens
    };

    assert_eq!(run(7), run(7));
}
