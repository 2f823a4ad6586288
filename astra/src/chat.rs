//! Chat orchestration: prompt assembly, generation and writing the streamed
//! response back into the active session

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{
    EngineAdapter, EngineLoader, GenerationCallbacks, GenerationEvent, GenerationOptions,
};
use crate::error::{Error, Result};
use crate::memory::{MemoryItem, MemorySelection, MemoryStore, MemoryUpdate, NewMemory};
use crate::message::{Message, PromptMessage};
use crate::persona::PersonaStore;
use crate::prompt::{self, ContextBudget, TokenCounter};
use crate::session::{Session, SessionStore};
use crate::storage::KvStore;

pub const SYNTHESIZING_STATUS: &str = "Synthesizing insight...";
pub const READY_STATUS: &str = "Response ready.";
pub const INTERRUPTED_STATUS: &str = "Generation interrupted.";

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum TurnStatus {
    Completed,
    Stopped,
    Failed(String),
}

/// Result of one user turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: Uuid,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,

    /// Assistant message content once the turn settled
    pub content: String,

    pub status: TurnStatus,
}

/// Writes generation callbacks into the placeholder assistant message
struct SessionWriter<'a, F> {
    sessions: &'a SessionStore,
    session_id: Uuid,
    message_id: Uuid,
    observer: F,
    outcome: Option<TurnStatus>,
}

impl<F> SessionWriter<'_, F> {
    /// Apply `change`; tokens stay in memory until the turn settles
    fn write(&self, change: impl FnOnce(&mut Message), settled: bool) {
        let result = if settled {
            self.sessions
                .update_message(self.session_id, self.message_id, change)
        } else {
            self.sessions
                .stream_into_message(self.session_id, self.message_id, change)
        };
        if let Err(e) = result {
            // The session was removed mid-turn; keep draining the stream.
            tracing::debug!("Dropping streamed update: {}", e);
        }
    }
}

impl<F> GenerationCallbacks for SessionWriter<'_, F>
where
    F: FnMut(&GenerationEvent) + Send,
{
    fn on_token(&mut self, delta: &str) {
        self.write(|m| m.content.push_str(delta), false);
        (self.observer)(&GenerationEvent::Token(delta.to_string()));
    }

    fn on_complete(&mut self, content: String) {
        self.write(|m| m.content = content.clone(), true);
        (self.observer)(&GenerationEvent::Completed(content));
        self.outcome = Some(TurnStatus::Completed);
    }

    fn on_error(&mut self, message: String) {
        self.write(|m| m.content = prompt::warning_content(&message), true);
        (self.observer)(&GenerationEvent::Failed(message.clone()));
        self.outcome = Some(TurnStatus::Failed(message));
    }
}

/// Ties the stores and the engine together for one user
pub struct ChatService {
    sessions: Arc<SessionStore>,
    memories: Arc<MemoryStore>,
    persona: Arc<PersonaStore>,
    engine: EngineAdapter,
    selection: Mutex<MemorySelection>,
    counter: Option<TokenCounter>,
    context_window: u32,
    warning_threshold: f32,
    status: watch::Sender<String>,

    /// Id of the most recent turn; only that turn writes the status line
    turns: AtomicU64,
}

impl ChatService {
    pub fn new(config: &Config, storage: Arc<dyn KvStore>, loader: Arc<dyn EngineLoader>) -> Self {
        let mut memories = MemoryStore::new(storage.clone()).with_limit(config.memory_limit);
        if config.archive_evicted_memories {
            memories = memories.with_archive(config.memory_archive_path());
        }

        let counter = match TokenCounter::cl100k() {
            Ok(counter) => Some(counter),
            Err(e) => {
                tracing::warn!("Tokenizer unavailable, estimating prompt size: {}", e);
                None
            }
        };

        let mut selection = MemorySelection::new(config.default_active_memories);
        selection.sync(&memories.list());

        let (status, _rx) = watch::channel(String::new());

        Self {
            sessions: Arc::new(SessionStore::new(storage.clone())),
            memories: Arc::new(memories),
            persona: Arc::new(PersonaStore::new(storage)),
            engine: EngineAdapter::new(loader, GenerationOptions::from(&config.engine)),
            selection: Mutex::new(selection),
            counter,
            context_window: config.context_window,
            warning_threshold: config.context_warning_threshold,
            status,
            turns: AtomicU64::new(0),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn memories(&self) -> &Arc<MemoryStore> {
        &self.memories
    }

    pub fn persona(&self) -> &Arc<PersonaStore> {
        &self.persona
    }

    pub fn engine(&self) -> &EngineAdapter {
        &self.engine
    }

    /// Last user-facing status line
    pub fn status_message(&self) -> String {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    fn set_status(&self, message: impl Into<String>) {
        self.status.send_replace(message.into());
    }

    /// Initialize the engine, mirroring a failure into the status line
    pub async fn initialize_engine(&self) -> Result<()> {
        match self.engine.initialize().await {
            Ok(()) => {
                self.set_status(String::new());
                Ok(())
            }
            Err(e) => {
                if let Some(message) = self.engine.snapshot().error {
                    self.set_status(message);
                }
                Err(e)
            }
        }
    }

    fn selection(&self) -> MutexGuard<'_, MemorySelection> {
        self.selection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_memory(&self, input: NewMemory) -> Option<MemoryItem> {
        let added = self.memories.add(input)?;
        self.selection().sync(&self.memories.list());
        Some(added)
    }

    pub fn update_memory(&self, id: Uuid, changes: MemoryUpdate) -> Option<MemoryItem> {
        self.memories.update(id, changes)
    }

    /// Remove a memory and drop it from the selection
    pub fn remove_memory(&self, id: Uuid) -> bool {
        let removed = self.memories.remove(id);
        if removed {
            self.selection().prune(&self.memories.list());
        }
        removed
    }

    /// Flip whether a memory is injected into the next turn
    pub fn toggle_memory(&self, id: Uuid) -> Result<bool> {
        if self.memories.get(id).is_none() {
            return Err(Error::not_found(format!("memory {}", id)));
        }
        Ok(self.selection().toggle(id))
    }

    pub fn selected_memory_ids(&self) -> Vec<Uuid> {
        let mut selection = self.selection();
        selection.sync(&self.memories.list());
        selection.ids().to_vec()
    }

    /// Build the prompt for `input` against `session`
    fn build_prompt(&self, session: &Session, input: &str, max_tokens: u32) -> Vec<PromptMessage> {
        let persona = self.persona.get();
        let memories = self.memories.list();
        let selected = {
            let mut selection = self.selection();
            selection.sync(&memories);
            selection.selected(&memories)
        };

        let mut messages = prompt::assemble(&persona, &selected, &session.messages, input);

        let mut budget = ContextBudget::new(self.context_window, self.warning_threshold);
        budget.add(prompt::count_prompt(self.counter.as_ref(), &messages) + max_tokens);
        if budget.is_warning() {
            tracing::warn!(
                "Prompt uses {:.0}% of the {} token context window ({})",
                budget.utilization() * 100.0,
                budget.limit,
                budget.status()
            );
        }
        if budget.is_exceeded() {
            let dropped = prompt::fit_to_window(
                &mut messages,
                self.counter.as_ref(),
                self.context_window,
                max_tokens,
            );
            tracing::info!("Dropped {} oldest messages to fit the context window", dropped);
        }

        messages
    }

    /// Send one user turn, reporting every generation event to `observer`.
    ///
    /// Blank input is ignored (`Ok(None)`). The user message and an empty
    /// assistant message are appended to the active session (created if
    /// missing) before generation starts; tokens stream into the assistant
    /// message. A stop leaves the partial content as is.
    pub async fn send_with<F>(&self, input: &str, observer: F) -> Result<Option<TurnOutcome>>
    where
        F: FnMut(&GenerationEvent) + Send,
    {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }

        let session = match self.sessions.active() {
            Some(session) => session,
            None => self.sessions.hydrate_initial(),
        };
        let options = self.engine.options().await;
        let prompt = self.build_prompt(&session, input, options.max_tokens);

        let user = Message::user(input);
        let assistant = Message::assistant_placeholder();
        let user_message_id = user.id;
        let assistant_message_id = assistant.id;
        self.sessions.append_message(session.id, user)?;
        self.sessions.append_message(session.id, assistant)?;

        tracing::debug!(
            "Turn in session {}: {} prompt messages",
            session.id,
            prompt.len()
        );
        let turn = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(SYNTHESIZING_STATUS);

        let mut writer = SessionWriter {
            sessions: &self.sessions,
            session_id: session.id,
            message_id: assistant_message_id,
            observer,
            outcome: None,
        };
        self.engine.send_message(prompt, &mut writer).await;
        // A stopped turn ends without a final write.
        self.sessions.flush();

        let status = writer.outcome.unwrap_or(TurnStatus::Stopped);
        if self.turns.load(Ordering::SeqCst) == turn {
            match &status {
                TurnStatus::Completed => self.set_status(READY_STATUS),
                TurnStatus::Stopped => self.set_status(INTERRUPTED_STATUS),
                TurnStatus::Failed(message) => self.set_status(message.clone()),
            }
        } else {
            tracing::debug!("Turn {} superseded, leaving the status line alone", turn);
        }

        let content = self
            .sessions
            .get(session.id)
            .and_then(|s| s.message(assistant_message_id).map(|m| m.content.clone()))
            .unwrap_or_default();

        Ok(Some(TurnOutcome {
            session_id: session.id,
            user_message_id,
            assistant_message_id,
            content,
            status,
        }))
    }

    pub async fn send(&self, input: &str) -> Result<Option<TurnOutcome>> {
        self.send_with(input, |_| {}).await
    }

    /// Interrupt the running turn; streamed content is kept
    pub async fn stop(&self) {
        self.engine.stop().await;
        self.set_status(INTERRUPTED_STATUS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptStep, ScriptedEngine, ScriptedLoader, WARMING_UP_MESSAGE};
    use crate::message::Role;
    use crate::storage::InMemoryStorage;

    fn service(engine: ScriptedEngine) -> (ChatService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let service = ChatService::new(
            &config,
            Arc::new(InMemoryStorage::new()),
            Arc::new(ScriptedLoader::new(engine)),
        );
        (service, dir)
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let (chat, _dir) = service(ScriptedEngine::replying("hi"));
        chat.initialize_engine().await.unwrap();

        assert!(chat.send("   ").await.unwrap().is_none());
        assert!(chat.sessions().list().is_empty());
    }

    #[tokio::test]
    async fn completed_turn_writes_trimmed_response() {
        let (chat, _dir) = service(ScriptedEngine::replying("Focus on one goal. "));
        chat.initialize_engine().await.unwrap();

        let mut tokens = Vec::new();
        let outcome = chat
            .send_with("  What next?  ", |event| {
                if let GenerationEvent::Token(t) = event {
                    tokens.push(t.clone());
                }
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.content, "Focus on one goal.");
        assert_eq!(tokens.concat(), "Focus on one goal. ");

        let session = chat.sessions().active().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].content, "What next?");
        assert_eq!(session.messages[1].id, outcome.assistant_message_id);
        assert_eq!(chat.status_message(), READY_STATUS);
    }

    #[tokio::test]
    async fn not_ready_engine_leaves_warning_message() {
        let (chat, _dir) = service(ScriptedEngine::replying("hi"));

        let outcome = chat.send("hello").await.unwrap().unwrap();

        assert_eq!(outcome.status, TurnStatus::Failed(WARMING_UP_MESSAGE.to_string()));
        assert_eq!(outcome.content, format!("⚠️ {}", WARMING_UP_MESSAGE));
    }

    #[tokio::test]
    async fn engine_failure_is_written_as_warning() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::Delta("Part".into()),
            ScriptStep::Fail("device lost".into()),
        ]);
        let (chat, _dir) = service(engine);
        chat.initialize_engine().await.unwrap();

        let outcome = chat.send("hello").await.unwrap().unwrap();

        assert_eq!(outcome.content, "⚠️ device lost");
        assert_eq!(chat.status_message(), "device lost");
    }

    #[tokio::test]
    async fn prompt_includes_selected_memories_and_history_once() {
        let engine = Arc::new(ScriptedEngine::replying("ok"));
        let dir = tempfile::tempdir().unwrap();
        let chat = ChatService::new(
            &Config::with_data_dir(dir.path()),
            Arc::new(InMemoryStorage::new()),
            Arc::new(ScriptedLoader::shared(engine.clone())),
        );
        chat.initialize_engine().await.unwrap();
        chat.add_memory(NewMemory {
            title: "Goal".into(),
            details: "Ship v1".into(),
            tags: Vec::new(),
        })
        .unwrap();

        chat.send("first").await.unwrap();
        chat.send("second").await.unwrap();

        let request = engine.last_request().unwrap();
        let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents[1], "Context memory: Goal: Ship v1");
        assert_eq!(&contents[2..], &["first", "ok", "second"]);
    }

    #[tokio::test]
    async fn removing_a_memory_prunes_the_selection() {
        let (chat, _dir) = service(ScriptedEngine::replying("ok"));
        let memory = chat
            .add_memory(NewMemory {
                title: "Diet".into(),
                details: "Vegetarian".into(),
                tags: Vec::new(),
            })
            .unwrap();
        assert_eq!(chat.selected_memory_ids(), vec![memory.id]);

        assert!(chat.remove_memory(memory.id));
        assert!(chat.selected_memory_ids().is_empty());
        assert!(chat.toggle_memory(memory.id).is_err());
    }

    #[tokio::test]
    async fn superseded_turn_leaves_the_newer_status_alone() {
        let engine = ScriptedEngine::new(vec![ScriptStep::Delta("a".into()), ScriptStep::Stall]);
        let (chat, _dir) = service(engine);
        let chat = Arc::new(chat);
        chat.initialize_engine().await.unwrap();

        let spawn_turn = |input: &'static str| {
            let chat = chat.clone();
            let (tx, rx) = tokio::sync::oneshot::channel();
            let mut tx = Some(tx);
            let handle = tokio::spawn(async move {
                chat.send_with(input, move |_| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(());
                    }
                })
                .await
            });
            (handle, rx)
        };

        let (first, first_started) = spawn_turn("one");
        first_started.await.unwrap();
        let (second, second_started) = spawn_turn("two");
        second_started.await.unwrap();

        let first = first.await.unwrap().unwrap().unwrap();
        assert_eq!(first.status, TurnStatus::Stopped);
        assert_eq!(chat.status_message(), SYNTHESIZING_STATUS);

        chat.stop().await;
        let second = second.await.unwrap().unwrap().unwrap();
        assert_eq!(second.status, TurnStatus::Stopped);
        assert_eq!(chat.status_message(), INTERRUPTED_STATUS);
    }

    #[tokio::test]
    async fn emptied_selection_reseeds_on_next_memory() {
        let (chat, _dir) = service(ScriptedEngine::replying("ok"));
        let new = |title: &str| NewMemory {
            title: title.into(),
            details: "details".into(),
            tags: Vec::new(),
        };

        let first = chat.add_memory(new("First")).unwrap();
        assert!(chat.remove_memory(first.id));
        assert!(chat.selected_memory_ids().is_empty());

        let second = chat.add_memory(new("Second")).unwrap();
        assert_eq!(chat.selected_memory_ids(), vec![second.id]);
    }

    #[tokio::test]
    async fn streamed_tokens_are_written_back_when_the_turn_settles() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let engine = ScriptedEngine::new(vec![
            ScriptStep::Delta("Hel".into()),
            ScriptStep::Delta("lo".into()),
            ScriptStep::Stall,
        ]);
        let chat = Arc::new(ChatService::new(
            &Config::with_data_dir(dir.path()),
            storage.clone(),
            Arc::new(ScriptedLoader::new(engine)),
        ));
        chat.initialize_engine().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let turn = {
            let chat = chat.clone();
            tokio::spawn(async move {
                chat.send_with("hello", move |event| {
                    let _ = tx.send(event.clone());
                })
                .await
            })
        };
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        let persisted_reply = || -> String {
            let raw = storage.get(crate::session::SESSIONS_KEY).unwrap().unwrap();
            let snapshot: crate::session::SessionsSnapshot = serde_json::from_str(&raw).unwrap();
            snapshot.sessions[0].messages[1].content.clone()
        };
        assert_eq!(chat.sessions().active().unwrap().messages[1].content, "Hello");
        assert_eq!(persisted_reply(), "");

        chat.stop().await;
        turn.await.unwrap().unwrap();
        assert_eq!(persisted_reply(), "Hello");
    }
}
