//! Deterministic engine that replays a fixed script

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ChunkStream, CompletionChunk, CompletionRequest, Engine, EngineLoader, InitProgress,
    ProgressCallback,
};
use crate::error::{Error, Result};

/// One step of a scripted response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Emit a content increment
    Delta(String),

    /// Emit the finish signal and end
    Finish,

    /// Fail the stream with this message
    Fail(String),

    /// Never produce another chunk
    Stall,
}

/// Replays the same steps for every request
pub struct ScriptedEngine {
    steps: Vec<ScriptStep>,
    delay: Duration,
    interrupted: AtomicBool,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            delay: Duration::ZERO,
            interrupted: AtomicBool::new(false),
            last_request: Mutex::new(None),
        }
    }

    /// Stream `reply` word by word, then finish
    pub fn replying(reply: &str) -> Self {
        let mut steps: Vec<ScriptStep> = reply
            .split_inclusive(' ')
            .map(|word| ScriptStep::Delta(word.to_string()))
            .collect();
        steps.push(ScriptStep::Finish);
        Self::new(steps)
    }

    /// Pause before each step
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// The most recent request received
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request
            .lock()
            .ok()
            .and_then(|request| request.clone())
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn stream_chat(&self, request: CompletionRequest) -> Result<ChunkStream> {
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request);
        }

        let steps = self.steps.clone();
        let delay = self.delay;
        let stream = async_stream::stream! {
            for step in steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    ScriptStep::Delta(text) => {
                        yield Ok(CompletionChunk::delta(text));
                    }
                    ScriptStep::Finish => {
                        yield Ok(CompletionChunk::finished("stop"));
                        return;
                    }
                    ScriptStep::Fail(message) => {
                        yield Err(Error::engine(message));
                        return;
                    }
                    ScriptStep::Stall => futures::future::pending::<()>().await,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

/// Hands out one shared [`ScriptedEngine`]
pub struct ScriptedLoader {
    engine: Arc<ScriptedEngine>,
    progress: Vec<InitProgress>,
    failure: Option<String>,
}

impl ScriptedLoader {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self::shared(Arc::new(engine))
    }

    /// Use an engine the caller keeps a handle to
    pub fn shared(engine: Arc<ScriptedEngine>) -> Self {
        Self {
            engine,
            progress: Vec::new(),
            failure: None,
        }
    }

    /// Reports emitted before the engine is returned
    pub fn with_progress(mut self, progress: Vec<InitProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Fail every load with `message`
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

#[async_trait]
impl EngineLoader for ScriptedLoader {
    async fn create_engine(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<Arc<dyn Engine>> {
        for report in &self.progress {
            on_progress(report.clone());
        }
        if let Some(message) = &self.failure {
            return Err(Error::engine(message.clone()));
        }

        tracing::debug!("Scripted engine loaded for {}", model_id);
        let engine: Arc<dyn Engine> = self.engine.clone();
        Ok(engine)
    }
}
