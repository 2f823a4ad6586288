//! External inference engine seam
//!
//! The console never runs a model itself. An [`EngineLoader`] resolved from
//! configuration creates an [`Engine`] for a model id, and the
//! [`EngineAdapter`] drives it: lifecycle, status, streaming and
//! cancellation.

mod adapter;
mod openai;
mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::{EngineBackend, EngineConfig};
use crate::error::Result;
use crate::message::PromptMessage;

pub use adapter::{
    EngineAdapter, EngineSnapshot, EngineStatus, GenerationCallbacks, GenerationEvent,
    GenerationStream, INIT_FAILED_MESSAGE, WARMING_UP_MESSAGE,
};
pub use openai::{OpenAiCompatEngine, OpenAiCompatLoader};
pub use scripted::{ScriptStep, ScriptedEngine, ScriptedLoader};

pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 1.5;
pub const MIN_MAX_TOKENS: u32 = 32;
pub const MAX_MAX_TOKENS: u32 = 2048;

/// A streaming chat-completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One increment of a streamed completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionChunk {
    /// New content, if any
    pub delta: Option<String>,

    /// Set on the final chunk
    pub finish_reason: Option<String>,
}

impl CompletionChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            finish_reason: None,
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            delta: None,
            finish_reason: Some(reason.into()),
        }
    }
}

/// Finite stream of completion chunks
pub type ChunkStream = BoxStream<'static, Result<CompletionChunk>>;

/// Progress report emitted while an engine loads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitProgress {
    pub progress: f64,
    pub total: Option<f64>,
    pub text: Option<String>,
}

impl InitProgress {
    pub fn fraction(progress: f64, text: impl Into<String>) -> Self {
        Self {
            progress,
            total: None,
            text: Some(text.into()),
        }
    }
}

/// Receives [`InitProgress`] reports during engine creation
pub type ProgressCallback = Arc<dyn Fn(InitProgress) + Send + Sync>;

/// Fold a progress report into the current fraction.
///
/// With a positive `total` the report is absolute; otherwise progress never
/// moves backwards. The result is always within 0.0 - 1.0.
pub fn normalize_progress(previous: f64, report: &InitProgress) -> f64 {
    match report.total {
        Some(total) if total > 0.0 => (report.progress / total).clamp(0.0, 1.0),
        _ => previous.max(report.progress.min(1.0)).max(0.0),
    }
}

/// A loaded model instance inside the external runtime
#[async_trait]
pub trait Engine: Send + Sync {
    /// Start a streaming chat completion
    async fn stream_chat(&self, request: CompletionRequest) -> Result<ChunkStream>;

    /// Ask the runtime to stop the current generation
    async fn interrupt(&self) {}

    /// Release runtime resources
    fn dispose(&self) {}
}

/// Creates engines; the substitution point for tests
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn create_engine(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<Arc<dyn Engine>>;
}

/// Per-request generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationOptions {
    /// Clamp temperature and max tokens into the supported ranges
    pub fn clamped(mut self) -> Self {
        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
        } else {
            EngineConfig::default().temperature
        };
        self.max_tokens = self.max_tokens.clamp(MIN_MAX_TOKENS, MAX_MAX_TOKENS);
        self
    }
}

impl From<&EngineConfig> for GenerationOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
        .clamped()
    }
}

/// Resolve the configured engine loader
pub fn loader_from_config(config: &EngineConfig) -> Result<Arc<dyn EngineLoader>> {
    match config.backend {
        EngineBackend::OpenAiCompat => Ok(Arc::new(OpenAiCompatLoader::new(config)?)),
        EngineBackend::Scripted => Ok(Arc::new(ScriptedLoader::new(ScriptedEngine::replying(
            &config.scripted_reply,
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_with_total_is_absolute() {
        let report = InitProgress {
            progress: 30.0,
            total: Some(120.0),
            text: None,
        };
        assert_eq!(normalize_progress(0.9, &report), 0.25);

        let overshoot = InitProgress {
            progress: 200.0,
            total: Some(100.0),
            text: None,
        };
        assert_eq!(normalize_progress(0.0, &overshoot), 1.0);
    }

    #[test]
    fn progress_without_total_never_regresses() {
        assert_eq!(normalize_progress(0.5, &InitProgress::fraction(0.2, "x")), 0.5);
        assert_eq!(normalize_progress(0.5, &InitProgress::fraction(0.7, "x")), 0.7);
        assert_eq!(normalize_progress(0.5, &InitProgress::fraction(3.0, "x")), 1.0);
    }

    #[test]
    fn options_are_clamped() {
        let options = GenerationOptions {
            model: "m".into(),
            temperature: 4.0,
            max_tokens: 8,
        }
        .clamped();
        assert_eq!(options.temperature, MAX_TEMPERATURE);
        assert_eq!(options.max_tokens, MIN_MAX_TOKENS);

        let nan = GenerationOptions {
            model: "m".into(),
            temperature: f32::NAN,
            max_tokens: 9000,
        }
        .clamped();
        assert_eq!(nan.temperature, 0.6);
        assert_eq!(nan.max_tokens, MAX_MAX_TOKENS);
    }
}
