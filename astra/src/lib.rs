//! # Astra
//!
//! A private chat console for a locally-running language model.
//!
//! ## Architecture
//!
//! - **Stores** - persona, memories and sessions, each a persisted
//!   [`state::StateContainer`] over a [`storage::KvStore`]
//! - **Engine** - [`engine::EngineAdapter`] drives an external inference
//!   runtime behind [`engine::EngineLoader`]
//! - **Chat** - [`ChatService`] assembles the prompt and streams the
//!   response into the active session
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use astra::{engine, storage::SqliteStorage, ChatService, Config};
//!
//! let config = Config::load()?;
//! let storage = Arc::new(SqliteStorage::new(&config)?);
//! let loader = engine::loader_from_config(&config.engine)?;
//! let chat = ChatService::new(&config, storage, loader);
//!
//! chat.initialize_engine().await?;
//! let outcome = chat.send("What should I focus on this week?").await?;
//! ```

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod message;
pub mod persona;
pub mod prompt;
pub mod session;
pub mod state;
pub mod storage;

pub use chat::{ChatService, TurnOutcome, TurnStatus};
pub use config::Config;
pub use error::{Error, Result};
pub use memory::{MemoryItem, MemoryStore};
pub use message::{Message, Role};
pub use persona::{PersonaSettings, PersonaStore};
pub use session::{Session, SessionStore};
