//! Engine backed by a local runtime speaking the OpenAI chat-completions
//! protocol (llama.cpp server, Ollama, vLLM, LM Studio)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use super::{
    ChunkStream, CompletionChunk, CompletionRequest, Engine, EngineLoader, InitProgress,
    ProgressCallback,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Creates [`OpenAiCompatEngine`]s after probing the runtime
pub struct OpenAiCompatLoader {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiCompatLoader {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "engine base_url must be http(s): {}",
                config.base_url
            )));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let mut request = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::engine(format!(
                "Runtime at {} answered {}",
                self.base_url,
                response.status()
            )));
        }
        let models: ModelList = response.json().await?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl EngineLoader for OpenAiCompatLoader {
    async fn create_engine(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<Arc<dyn Engine>> {
        on_progress(InitProgress::fraction(
            0.1,
            format!("Connecting to {}", self.base_url),
        ));

        let models = self.list_models().await.map_err(|e| {
            Error::engine(format!(
                "Could not reach the inference runtime at {}: {}",
                self.base_url,
                e.user_message()
            ))
        })?;
        on_progress(InitProgress::fraction(0.6, "Runtime reachable"));

        if !models.is_empty() && !models.iter().any(|m| m == model_id) {
            tracing::warn!(
                "Model {} not listed by runtime (available: {}); requests may fail",
                model_id,
                models.join(", ")
            );
        }

        on_progress(InitProgress::fraction(1.0, format!("{} ready", model_id)));
        Ok(Arc::new(OpenAiCompatEngine {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: model_id.to_string(),
        }))
    }
}

/// Streams completions from `/chat/completions`
pub struct OpenAiCompatEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[async_trait]
impl Engine for OpenAiCompatEngine {
    async fn stream_chat(&self, request: CompletionRequest) -> Result<ChunkStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::engine(format!("Runtime answered {}: {}", status, text.trim())));
        }

        let mut byte_stream = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            while let Some(bytes) = byte_stream.next().await {
                let bytes = match bytes {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(Error::engine(format!("Stream error: {}", e)));
                        return;
                    }
                };

                for data in decoder.push(&bytes) {
                    if let Some(chunk) = parse_sse_data(&data) {
                        let finished = matches!(&chunk, Ok(c) if c.finish_reason.is_some());
                        let failed = chunk.is_err();
                        yield chunk;
                        if finished || failed {
                            return;
                        }
                    }
                }
            }

            for data in decoder.finish() {
                if let Some(chunk) = parse_sse_data(&data) {
                    yield chunk;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Incremental SSE decoder. Bytes of a UTF-8 character split across network
/// chunks are held back until the character is complete.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    /// Feed one network chunk; returns the `data:` payloads of every event
    /// completed by it.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let text = decode_utf8_prefix(&mut self.pending);
        self.buffer.push_str(&text.replace('\r', ""));
        drain_sse_data(&mut self.buffer)
    }

    /// Flush at end of stream; the last event may lack its blank line.
    fn finish(&mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.buffer.push_str(&rest);
        }
        self.buffer.push_str("\n\n");
        drain_sse_data(&mut self.buffer)
    }
}

/// Take the longest decodable prefix out of `pending`, leaving an
/// incomplete trailing character in place. Invalid sequences become U+FFFD.
fn decode_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending.as_slice()) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + len);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Remove every complete SSE event from `buffer` and return their `data:`
/// payloads (multi-line data joined with newlines).
fn drain_sse_data(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let event: String = buffer.drain(..pos + 2).collect();
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if !data.is_empty() {
            payloads.push(data.join("\n"));
        }
    }
    payloads
}

/// Interpret one `data:` payload. `None` for payloads carrying nothing.
fn parse_sse_data(data: &str) -> Option<Result<CompletionChunk>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(CompletionChunk::finished("stop")));
    }

    let parsed: StreamResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Skipping unparseable stream event: {}", e);
            return None;
        }
    };
    if let Some(error) = parsed.error {
        return Some(Err(Error::engine(error.message)));
    }

    let choice = parsed.choices.into_iter().next()?;
    let chunk = CompletionChunk {
        delta: choice.delta.content.filter(|c| !c.is_empty()),
        finish_reason: choice.finish_reason,
    };
    if chunk.delta.is_none() && chunk.finish_reason.is_none() {
        return None;
    }
    Some(Ok(chunk))
}
