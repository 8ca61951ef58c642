//! Engine: model lifecycle and session entry points
//!
//! One engine owns at most one loaded model and runs at most one
//! generation session at a time. [`Engine::respond`] spawns the session on
//! a worker thread and hands back an event stream plus a cancel handle;
//! everything else is a synchronous query or a lifecycle call.
//!
//! Single-flight is enforced with an atomic busy flag: a second `respond`,
//! an `unload`, or a `clear` during an active session fails with
//! `ModelBusy` instead of blocking.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{InferirError, Result};
use crate::format::ModelFile;
use crate::metrics::MetricsSnapshot;
use crate::model::Model;
use crate::session::{
    run_session, CancelHandle, PhaseCell, RespondRequest, SavedSession, SessionState,
    TokenStream, WorkerContext,
};
use crate::template::Template;
use crate::tokenizer::Tokenizer;

struct LoadedModel {
    model: Arc<Model>,
    tokenizer: Arc<Tokenizer>,
    template: Template,
}

/// Inference engine handle
///
/// ```no_run
/// use std::path::Path;
/// use inferir::{Engine, GenerationEvent, RespondRequest, Template};
///
/// let mut engine = Engine::new();
/// engine.load(Path::new("model.infr"), Template::olmoe(None)).unwrap();
///
/// let request = RespondRequest {
///     input: "hello".to_string(),
///     history: vec![],
///     config: Default::default(),
/// };
/// let (stream, _cancel) = engine.respond(request).unwrap();
/// for event in stream {
///     if let GenerationEvent::Token(fragment) = event {
///         print!("{fragment}");
///     }
/// }
/// ```
pub struct Engine {
    loaded: Option<LoadedModel>,
    busy: Arc<AtomicBool>,
    phase: PhaseCell,
    memory: Arc<Mutex<Option<SavedSession>>>,
    last_metrics: Arc<Mutex<Option<MetricsSnapshot>>>,
}

impl Engine {
    /// An engine with no model loaded
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaded: None,
            busy: Arc::new(AtomicBool::new(false)),
            phase: PhaseCell::default(),
            memory: Arc::new(Mutex::new(None)),
            last_metrics: Arc::new(Mutex::new(None)),
        }
    }

    /// Load a model file and the conversation template to use with it
    ///
    /// Replaces any previously loaded model and drops retained session
    /// state.
    ///
    /// # Errors
    ///
    /// `ModelBusy` during an active session; otherwise the
    /// [`crate::ModelLoadError`] taxonomy from file validation.
    pub fn load(&mut self, path: &Path, template: Template) -> Result<()> {
        self.ensure_not_busy("load")?;

        let file = ModelFile::load(path)?;
        let tokenizer = Tokenizer::new(
            file.descriptor.vocab.clone(),
            file.descriptor.merges.clone(),
        );
        let model = Model::from_file(file)?;

        self.loaded = Some(LoadedModel {
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
            template,
        });
        self.clear_session_memory();
        Ok(())
    }

    /// Drop the loaded model and all session state
    ///
    /// # Errors
    ///
    /// `ModelBusy` during an active session.
    pub fn unload(&mut self) -> Result<()> {
        self.ensure_not_busy("unload")?;
        self.loaded = None;
        self.clear_session_memory();
        Ok(())
    }

    /// Drop retained conversation state but keep the model
    ///
    /// The next [`Engine::respond`] renders the full history again instead
    /// of continuing from cached KV state.
    ///
    /// # Errors
    ///
    /// `ModelBusy` during an active session.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_not_busy("clear")?;
        self.clear_session_memory();
        Ok(())
    }

    /// Whether a model is loaded and no session is running
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.loaded.is_some() && !self.busy.load(Ordering::SeqCst)
    }

    /// Current session phase
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.phase.get()
    }

    /// Metrics of the running session, or of the most recently finished one
    ///
    /// Updated at prefill and after every produced token, so a UI can poll
    /// throughput mid-generation.
    #[must_use]
    pub fn last_metrics(&self) -> Option<MetricsSnapshot> {
        self.last_metrics.lock().ok().and_then(|m| *m)
    }

    /// Start a generation session on a worker thread
    ///
    /// Returns the event stream and a cancel handle. Events arrive over a
    /// rendezvous channel: the worker pauses until each event is consumed,
    /// so a cancel issued between events takes effect at the next token
    /// boundary.
    ///
    /// # Errors
    ///
    /// `ModelBusy` when a session is already running;
    /// `UnsupportedOperation` when no model is loaded.
    pub fn respond(&self, request: RespondRequest) -> Result<(TokenStream, CancelHandle)> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| InferirError::UnsupportedOperation {
                operation: "respond".to_string(),
                reason: "no model loaded".to_string(),
            })?;

        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(InferirError::ModelBusy {
                reason: "a generation session is already running".to_string(),
            });
        }

        let (tx, rx) = sync_channel(0);
        let cancel = Arc::new(AtomicBool::new(false));

        let ctx = WorkerContext {
            model: Arc::clone(&loaded.model),
            tokenizer: Arc::clone(&loaded.tokenizer),
            template: loaded.template.clone(),
            request,
            cancel: Arc::clone(&cancel),
            phase: self.phase.clone(),
            memory: Arc::clone(&self.memory),
            last_metrics: Arc::clone(&self.last_metrics),
            tx,
        };

        let busy = Arc::clone(&self.busy);
        thread::spawn(move || {
            let _guard = BusyGuard(busy);
            run_session(&ctx);
        });

        Ok((TokenStream::new(rx), CancelHandle::new(cancel)))
    }

    fn ensure_not_busy(&self, operation: &str) -> Result<()> {
        if self.busy.load(Ordering::SeqCst) {
            return Err(InferirError::ModelBusy {
                reason: format!("cannot {operation} during an active session"),
            });
        }
        Ok(())
    }

    fn clear_session_memory(&self) {
        if let Ok(mut memory) = self.memory.lock() {
            *memory = None;
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the busy flag when the worker exits, panics included
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
