//! Configuration for astra

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Model used when nothing else is configured
pub const DEFAULT_MODEL: &str = "Llama-3-8B-Instruct-q4f16_1-MLC";

/// Which engine loader to resolve at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineBackend {
    /// Local runtime speaking the OpenAI chat-completions protocol
    OpenAiCompat,

    /// Built-in engine that replays `scripted_reply`, for offline smoke runs
    Scripted,
}

/// Settings for the external inference engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: EngineBackend,

    /// Base URL of the runtime, including the `/v1` prefix
    pub base_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model identifier passed to the runtime
    pub model: String,

    /// Sampling temperature (0.0 - 1.5)
    pub temperature: f32,

    /// Maximum tokens per response (32 - 2048)
    pub max_tokens: u32,

    /// Per-request timeout for the initialization check against `/models`
    pub request_timeout_secs: u64,

    /// Reply used by the scripted backend
    pub scripted_reply: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::OpenAiCompat,
            base_url: "http://127.0.0.1:8080/v1".to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.6,
            max_tokens: 512,
            request_timeout_secs: 30,
            scripted_reply: "Noted. Tell me more about what you want to achieve.".to_string(),
        }
    }
}

/// Configuration for the whole console
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    pub engine: EngineConfig,

    /// Maximum number of memories kept in the store
    pub memory_limit: usize,

    /// How many recent memories are activated when nothing is selected
    pub default_active_memories: usize,

    /// Append memories pushed out by the cap to the archive log
    pub archive_evicted_memories: bool,

    /// Context window of the model, in tokens
    pub context_window: u32,

    /// Context window warning threshold (0.0 - 1.0)
    pub context_warning_threshold: f32,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("astra");

        Self {
            data_dir,
            engine: EngineConfig::default(),
            memory_limit: 100,
            default_active_memories: 3,
            archive_evicted_memories: true,
            context_window: 8192,
            context_warning_threshold: 0.8,
            server_port: 8421,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration: defaults, then `settings.json` in the data
    /// directory, then `ASTRA_*` environment variables.
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("ASTRA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Config::default().data_dir);

        let mut config = Self::from_settings_file(&data_dir.join("settings.json"))?
            .unwrap_or_else(|| Self::with_data_dir(&data_dir));
        config.data_dir = data_dir;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a settings file; `None` when it does not exist.
    pub fn from_settings_file(path: &Path) -> Result<Option<Self>> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        Ok(Some(config))
    }

    /// Apply `ASTRA_*` overrides from the given lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ASTRA_ENGINE_URL") {
            self.engine.base_url = url;
        }
        if let Some(model) = lookup("ASTRA_MODEL") {
            self.engine.model = model;
        }
        if let Some(key) = lookup("ASTRA_API_KEY") {
            self.engine.api_key = Some(key);
        }
        if let Some(port) = lookup("ASTRA_PORT") {
            self.server_port = port
                .parse()
                .map_err(|_| Error::config(format!("ASTRA_PORT is not a port: {}", port)))?;
        }
        Ok(())
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    /// Get the path to the evicted-memory archive
    pub fn memory_archive_path(&self) -> PathBuf {
        self.data_dir.join("archive").join("memories.jsonl")
    }

    /// Get the directory for exported sessions and memories
    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.data_dir.join("archive"))?;
        std::fs::create_dir_all(self.exports_dir())?;
        Ok(())
    }
}
