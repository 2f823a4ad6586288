//! Engine lifecycle, status tracking and cancellable streaming

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::{
    normalize_progress, CompletionChunk, CompletionRequest, Engine, EngineLoader,
    GenerationOptions, InitProgress, ProgressCallback,
};
use crate::error::{Error, Result};
use crate::message::PromptMessage;

/// Returned to callers that send before the engine is ready
pub const WARMING_UP_MESSAGE: &str = "The intelligence engine is still warming up. Please wait.";

/// Used when an initialization failure carries no message
pub const INIT_FAILED_MESSAGE: &str = "Failed to initialize the local intelligence engine.";

const GENERATION_FAILED_MESSAGE: &str = "Something went wrong while generating a response.";

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Idle,
    Initializing,
    Ready,
    Generating,
    Error,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineStatus::Idle => write!(f, "idle"),
            EngineStatus::Initializing => write!(f, "initializing"),
            EngineStatus::Ready => write!(f, "ready"),
            EngineStatus::Generating => write!(f, "generating"),
            EngineStatus::Error => write!(f, "error"),
        }
    }
}

/// Observable engine state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub status: EngineStatus,

    /// Initialization progress (0.0 - 1.0)
    pub progress: f64,

    /// Last initialization or generation failure
    pub error: Option<String>,

    /// Model the engine was (or is being) loaded with
    pub model: String,
}

/// One item of a generation stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "text", rename_all = "lowercase")]
pub enum GenerationEvent {
    /// A non-empty content increment
    Token(String),

    /// The full response, trimmed
    Completed(String),

    /// A human-readable failure message
    Failed(String),
}

/// Finite, non-restartable stream of generation events. A cancelled
/// generation simply ends.
pub type GenerationStream = BoxStream<'static, GenerationEvent>;

/// Callback form of a generation
pub trait GenerationCallbacks: Send {
    fn on_token(&mut self, delta: &str);
    fn on_complete(&mut self, content: String);
    fn on_error(&mut self, message: String);
}

struct ActiveGeneration {
    id: u64,
    token: CancellationToken,
}

enum Finish {
    Completed,
    Cancelled,
    Failed(String),
}

struct Inner {
    loader: Arc<dyn EngineLoader>,
    options: Mutex<GenerationOptions>,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    active: Mutex<Option<ActiveGeneration>>,
    state: watch::Sender<EngineSnapshot>,
    generations: AtomicU64,
    init_epoch: AtomicU64,
}

impl Inner {
    /// Settle status for generation `id`, unless a newer generation or a
    /// stop already took ownership of it.
    async fn finish(&self, id: u64, finish: Finish) {
        {
            let mut active = self.active.lock().await;
            if active.as_ref().map(|a| a.id) != Some(id) {
                return;
            }
            *active = None;
        }

        match finish {
            Finish::Completed | Finish::Cancelled => self.back_to_ready(),
            Finish::Failed(message) => {
                tracing::error!("Generation failed: {}", message);
                self.state.send_modify(|s| {
                    s.status = EngineStatus::Error;
                    s.error = Some(message);
                });
            }
        }
    }

    fn back_to_ready(&self) {
        self.state.send_if_modified(|s| {
            if s.status != EngineStatus::Generating {
                return false;
            }
            s.status = EngineStatus::Ready;
            true
        });
    }
}

/// Cancels and settles a generation whose stream is dropped before it
/// finished on its own.
struct GenerationGuard {
    inner: Arc<Inner>,
    id: u64,
    token: CancellationToken,
    settled: bool,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.token.cancel();

        if let Ok(mut active) = self.inner.active.try_lock() {
            if active.as_ref().map(|a| a.id) == Some(self.id) {
                *active = None;
                self.inner.back_to_ready();
                tracing::debug!("Generation {} dropped before finishing", self.id);
            }
            return;
        }

        // Lock is busy; settle once it frees up.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            let id = self.id;
            handle.spawn(async move { inner.finish(id, Finish::Cancelled).await });
        }
    }
}

/// Drives an external engine: lazy creation, status, streaming, stop.
#[derive(Clone)]
pub struct EngineAdapter {
    inner: Arc<Inner>,
}

impl EngineAdapter {
    pub fn new(loader: Arc<dyn EngineLoader>, options: GenerationOptions) -> Self {
        let options = options.clamped();
        let (state, _rx) = watch::channel(EngineSnapshot {
            status: EngineStatus::Idle,
            progress: 0.0,
            error: None,
            model: options.model.clone(),
        });

        Self {
            inner: Arc::new(Inner {
                loader,
                options: Mutex::new(options),
                engine: Mutex::new(None),
                active: Mutex::new(None),
                state,
                generations: AtomicU64::new(0),
                init_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.state.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.inner.state.subscribe()
    }

    pub async fn options(&self) -> GenerationOptions {
        self.inner.options.lock().await.clone()
    }

    /// Replace generation settings. A new model id only takes effect on the
    /// next [`initialize`](Self::initialize).
    pub async fn set_options(&self, options: GenerationOptions) -> GenerationOptions {
        let options = options.clamped();
        *self.inner.options.lock().await = options.clone();
        options
    }

    /// (Re)create the engine for the configured model.
    ///
    /// Any running generation is cancelled and the previous engine disposed.
    /// On failure the adapter stays in [`EngineStatus::Error`] until the next
    /// call.
    pub async fn initialize(&self) -> Result<()> {
        let epoch = self.inner.init_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel_active().await;

        let model = self.inner.options.lock().await.model.clone();
        self.inner.state.send_modify(|s| {
            s.status = EngineStatus::Initializing;
            s.progress = 0.0;
            s.error = None;
            s.model = model.clone();
        });

        if let Some(previous) = self.inner.engine.lock().await.take() {
            previous.dispose();
        }

        tracing::info!("Initializing engine for model {}", model);
        let result = self
            .inner
            .loader
            .create_engine(&model, progress_callback(Arc::downgrade(&self.inner), epoch))
            .await;

        if self.inner.init_epoch.load(Ordering::SeqCst) != epoch {
            // A newer initialize owns the state now.
            if let Ok(engine) = result {
                engine.dispose();
            }
            return Err(Error::engine("initialization superseded"));
        }

        match result {
            Ok(engine) => {
                *self.inner.engine.lock().await = Some(engine);
                self.inner.state.send_modify(|s| {
                    s.status = EngineStatus::Ready;
                    s.progress = 1.0;
                });
                tracing::info!("Engine ready: {}", model);
                Ok(())
            }
            Err(e) => {
                let mut message = e.user_message();
                if message.trim().is_empty() {
                    message = INIT_FAILED_MESSAGE.to_string();
                }
                tracing::error!("Engine initialization failed: {}", message);
                self.inner.state.send_modify(|s| {
                    s.status = EngineStatus::Error;
                    s.error = Some(message);
                });
                Err(e)
            }
        }
    }

    /// Start a generation over an assembled prompt.
    ///
    /// Rejected unless an engine is loaded and ready. A generation already
    /// in flight is cancelled first.
    pub async fn generate(&self, messages: Vec<PromptMessage>) -> Result<GenerationStream> {
        let engine = self
            .inner
            .engine
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::engine_not_ready(WARMING_UP_MESSAGE))?;
        if !matches!(
            self.status(),
            EngineStatus::Ready | EngineStatus::Generating
        ) {
            return Err(Error::engine_not_ready(WARMING_UP_MESSAGE));
        }

        let options = self.inner.options.lock().await.clone();
        let token = CancellationToken::new();
        let id = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut active = self.inner.active.lock().await;
            let previous = active.replace(ActiveGeneration {
                id,
                token: token.clone(),
            });
            if let Some(previous) = previous {
                tracing::debug!("Generation {} superseded by {}", previous.id, id);
                previous.token.cancel();
            }
        }
        self.inner.state.send_modify(|s| s.status = EngineStatus::Generating);

        let request = CompletionRequest {
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        tracing::debug!(
            "Generation {} started: {} prompt messages",
            id,
            request.messages.len()
        );

        Ok(Box::pin(generation_stream(
            Arc::clone(&self.inner),
            engine,
            request,
            id,
            token,
        )))
    }

    /// Callback form of [`generate`](Self::generate). A rejected request
    /// reports through `on_error`; a cancelled one returns silently.
    pub async fn send_message(
        &self,
        messages: Vec<PromptMessage>,
        callbacks: &mut dyn GenerationCallbacks,
    ) {
        let mut stream = match self.generate(messages).await {
            Ok(stream) => stream,
            Err(e) => {
                callbacks.on_error(e.user_message());
                return;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                GenerationEvent::Token(delta) => callbacks.on_token(&delta),
                GenerationEvent::Completed(content) => callbacks.on_complete(content),
                GenerationEvent::Failed(message) => callbacks.on_error(message),
            }
        }
    }

    /// Abort the in-flight generation, if any
    pub async fn stop(&self) {
        let stopped = self.cancel_active().await;
        if stopped {
            if let Some(engine) = self.inner.engine.lock().await.clone() {
                engine.interrupt().await;
            }
        }
        self.inner.back_to_ready();
    }

    /// Stop, dispose the engine and go back to idle
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(engine) = self.inner.engine.lock().await.take() {
            engine.dispose();
        }
        self.inner.state.send_modify(|s| {
            s.status = EngineStatus::Idle;
            s.progress = 0.0;
        });
    }

    async fn cancel_active(&self) -> bool {
        match self.inner.active.lock().await.take() {
            Some(active) => {
                tracing::debug!("Cancelling generation {}", active.id);
                active.token.cancel();
                true
            }
            None => false,
        }
    }
}

fn progress_callback(inner: Weak<Inner>, epoch: u64) -> ProgressCallback {
    Arc::new(move |report: InitProgress| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.init_epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        inner.state.send_if_modified(|s| {
            if s.status != EngineStatus::Initializing {
                return false;
            }
            let next = normalize_progress(s.progress, &report);
            let changed = next != s.progress;
            s.progress = next;
            changed
        });
    })
}

enum Step {
    Cancelled,
    Chunk(Option<Result<CompletionChunk>>),
}

fn failure_text(error: &Error) -> String {
    let message = error.user_message();
    if message.trim().is_empty() {
        GENERATION_FAILED_MESSAGE.to_string()
    } else {
        message
    }
}

fn generation_stream(
    inner: Arc<Inner>,
    engine: Arc<dyn Engine>,
    request: CompletionRequest,
    id: u64,
    token: CancellationToken,
) -> impl futures::Stream<Item = GenerationEvent> + Send + 'static {
    // Created outside the generator so an unpolled stream settles too.
    let guard = GenerationGuard {
        inner,
        id,
        token,
        settled: false,
    };

    async_stream::stream! {
        let mut guard = guard;
        let inner = Arc::clone(&guard.inner);
        let token = guard.token.clone();

        let started = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = engine.stream_chat(request) => Some(result),
        };
        let mut chunks = match started {
            None => {
                inner.finish(id, Finish::Cancelled).await;
                guard.settled = true;
                return;
            }
            Some(Ok(chunks)) => chunks,
            Some(Err(e)) => {
                if token.is_cancelled() {
                    inner.finish(id, Finish::Cancelled).await;
                    guard.settled = true;
                    return;
                }
                let message = failure_text(&e);
                inner.finish(id, Finish::Failed(message.clone())).await;
                guard.settled = true;
                yield GenerationEvent::Failed(message);
                return;
            }
        };

        let mut response = String::new();
        loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::Cancelled,
                next = chunks.next() => Step::Chunk(next),
            };

            match step {
                Step::Cancelled => {
                    inner.finish(id, Finish::Cancelled).await;
                    guard.settled = true;
                    return;
                }
                Step::Chunk(None) => break,
                Step::Chunk(Some(Err(e))) => {
                    if token.is_cancelled() {
                        inner.finish(id, Finish::Cancelled).await;
                        guard.settled = true;
                        return;
                    }
                    let message = failure_text(&e);
                    inner.finish(id, Finish::Failed(message.clone())).await;
                    guard.settled = true;
                    yield GenerationEvent::Failed(message);
                    return;
                }
                Step::Chunk(Some(Ok(chunk))) => {
                    if let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) {
                        response.push_str(&delta);
                        yield GenerationEvent::Token(delta);
                    }
                    if chunk.finish_reason.is_some() {
                        break;
                    }
                }
            }
        }

        if token.is_cancelled() {
            inner.finish(id, Finish::Cancelled).await;
            guard.settled = true;
            return;
        }
        inner.finish(id, Finish::Completed).await;
        guard.settled = true;
        tracing::debug!("Generation {} completed: {} chars", id, response.len());
        yield GenerationEvent::Completed(response.trim().to_string());
    }
}
