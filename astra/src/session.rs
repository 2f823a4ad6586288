//! Conversation sessions and the active-session pointer

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::state::StateContainer;
use crate::storage::{export_json, KvStore};

/// Storage key of the session snapshot
pub const SESSIONS_KEY: &str = "astra-sessions";

/// Title used when none is given
pub const DEFAULT_SESSION_TITLE: &str = "New Session";

/// Title of the session created on first start
pub const FIRST_SESSION_TITLE: &str = "First Conversation";

/// A named conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn message(&self, message_id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persisted form of the session store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsSnapshot {
    /// Newest first
    pub sessions: Vec<Session>,
    pub active_session_id: Option<Uuid>,
}

impl SessionsSnapshot {
    fn find_mut(&mut self, id: Uuid) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }
}

/// Persisted collection of sessions with at most one active
pub struct SessionStore {
    state: StateContainer<SessionsSnapshot>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KvStore>) -> Self {
        Self {
            state: StateContainer::load(SESSIONS_KEY, storage, SessionsSnapshot::default),
        }
    }

    /// All sessions, newest first
    pub fn list(&self) -> Vec<Session> {
        self.state.read(|s| s.sessions.clone())
    }

    pub fn get(&self, id: Uuid) -> Option<Session> {
        self.state
            .read(|s| s.sessions.iter().find(|session| session.id == id).cloned())
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.state.read(|s| s.active_session_id)
    }

    pub fn active(&self) -> Option<Session> {
        self.active_id().and_then(|id| self.get(id))
    }

    pub fn snapshot(&self) -> SessionsSnapshot {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionsSnapshot> {
        self.state.subscribe()
    }

    /// Create a session at the front of the list and make it active
    pub fn create(&self, title: Option<&str>) -> Session {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_SESSION_TITLE);
        let session = Session::new(title);

        self.state.modify(|s| {
            s.sessions.insert(0, session.clone());
            s.active_session_id = Some(session.id);
            true
        });

        tracing::debug!("Created session {} ({})", session.id, session.title);
        session
    }

    /// Point the active pointer at `id`; unknown ids are ignored
    pub fn select(&self, id: Uuid) -> bool {
        self.state.modify(|s| {
            if s.active_session_id == Some(id) || !s.sessions.iter().any(|x| x.id == id) {
                return false;
            }
            s.active_session_id = Some(id);
            true
        })
    }

    /// Delete a session. If it was active, the first remaining session (or
    /// none) becomes active.
    pub fn remove(&self, id: Uuid) -> bool {
        self.state.modify(|s| {
            let before = s.sessions.len();
            s.sessions.retain(|session| session.id != id);
            if s.sessions.len() == before {
                return false;
            }
            if s.active_session_id == Some(id) {
                s.active_session_id = s.sessions.first().map(|session| session.id);
            }
            true
        })
    }

    /// Set a session title. Blank titles keep the old one.
    pub fn rename(&self, id: Uuid, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }
        self.state.modify(|s| {
            let Some(session) = s.find_mut(id) else {
                return false;
            };
            session.title = title.to_string();
            session.touch();
            true
        })
    }

    /// Append a message to a session
    pub fn append_message(&self, id: Uuid, message: Message) -> Result<()> {
        let mut outcome = Err(Error::not_found(format!("session {}", id)));
        self.state.modify(|s| {
            let Some(session) = s.find_mut(id) else {
                return false;
            };
            if session.message(message.id).is_some() {
                outcome = Err(Error::invalid_input(format!(
                    "duplicate message id {} in session {}",
                    message.id, id
                )));
                return false;
            }
            session.messages.push(message);
            session.touch();
            outcome = Ok(());
            true
        });
        outcome
    }

    /// Mutate one message in place
    pub fn update_message(
        &self,
        id: Uuid,
        message_id: Uuid,
        change: impl FnOnce(&mut Message),
    ) -> Result<()> {
        self.change_message(id, message_id, change, true)
    }

    /// [`update_message`](Self::update_message) without the storage write,
    /// for streamed tokens. Call [`flush`](Self::flush) once the stream ends.
    pub fn stream_into_message(
        &self,
        id: Uuid,
        message_id: Uuid,
        change: impl FnOnce(&mut Message),
    ) -> Result<()> {
        self.change_message(id, message_id, change, false)
    }

    /// Write back changes made by [`stream_into_message`](Self::stream_into_message)
    pub fn flush(&self) {
        self.state.flush();
    }

    fn change_message(
        &self,
        id: Uuid,
        message_id: Uuid,
        change: impl FnOnce(&mut Message),
        persist: bool,
    ) -> Result<()> {
        let mut outcome = Err(Error::not_found(format!("session {}", id)));
        let apply = |s: &mut SessionsSnapshot| {
            let Some(session) = s.find_mut(id) else {
                return false;
            };
            let Some(message) = session.messages.iter_mut().find(|m| m.id == message_id) else {
                outcome = Err(Error::not_found(format!("message {}", message_id)));
                return false;
            };
            change(message);
            session.touch();
            outcome = Ok(());
            true
        };
        if persist {
            self.state.modify(apply);
        } else {
            self.state.modify_deferred(apply);
        }
        outcome
    }

    /// Replace the whole message list of a session
    pub fn replace_messages(&self, id: Uuid, messages: Vec<Message>) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        if !messages.iter().all(|m| seen.insert(m.id)) {
            return Err(Error::invalid_input("duplicate message ids"));
        }

        let found = self.state.modify(|s| {
            let Some(session) = s.find_mut(id) else {
                return false;
            };
            session.messages = messages;
            session.touch();
            true
        });
        if found {
            Ok(())
        } else {
            Err(Error::not_found(format!("session {}", id)))
        }
    }

    /// Ensure there is an active session on startup
    pub fn hydrate_initial(&self) -> Session {
        let mut hydrated = None;
        self.state.modify(|s| {
            let Some(first) = s.sessions.first() else {
                return false;
            };
            let active = s
                .active_session_id
                .and_then(|id| s.sessions.iter().find(|session| session.id == id))
                .unwrap_or(first)
                .clone();
            let changed = s.active_session_id != Some(active.id);
            s.active_session_id = Some(active.id);
            hydrated = Some(active);
            changed
        });

        match hydrated {
            Some(session) => session,
            None => self.create(Some(FIRST_SESSION_TITLE)),
        }
    }

    /// Write one session to a pretty JSON file
    pub fn export(&self, id: Uuid, output_path: &Path) -> Result<()> {
        let session = self
            .get(id)
            .ok_or_else(|| Error::not_found(format!("session {}", id)))?;
        export_json(&session, output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::storage::InMemoryStorage;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryStorage::new()))
    }

    #[test]
    fn create_prepends_and_activates() {
        let store = store();
        let a = store.create(Some("A"));
        let b = store.create(Some("B"));

        assert_ne!(a.id, b.id);
        assert_eq!(store.active_id(), Some(b.id));
        let titles: Vec<String> = store.list().into_iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["B", "A"]);
    }

    #[test]
    fn default_title_when_missing_or_blank() {
        let store = store();
        assert_eq!(store.create(None).title, DEFAULT_SESSION_TITLE);
        assert_eq!(store.create(Some("  ")).title, DEFAULT_SESSION_TITLE);
    }

    #[test]
    fn removing_active_selects_first_remaining_or_none() {
        let store = store();
        let a = store.create(Some("A"));
        let b = store.create(Some("B"));
        let c = store.create(Some("C"));

        store.select(a.id);
        assert!(store.remove(b.id));
        assert_eq!(store.active_id(), Some(a.id));

        assert!(store.remove(a.id));
        assert_eq!(store.active_id(), Some(c.id));

        assert!(store.remove(c.id));
        assert_eq!(store.active_id(), None);
        assert!(!store.remove(c.id));
    }

    #[test]
    fn select_ignores_unknown_ids() {
        let store = store();
        let a = store.create(Some("A"));
        assert!(!store.select(Uuid::new_v4()));
        assert_eq!(store.active_id(), Some(a.id));
    }

    #[test]
    fn rename_is_idempotent_and_ignores_blank() {
        let store = store();
        let a = store.create(Some("A"));

        assert!(store.rename(a.id, "Plans"));
        assert!(store.rename(a.id, "Plans"));
        assert!(!store.rename(a.id, "   "));
        assert_eq!(store.get(a.id).unwrap().title, "Plans");
    }

    #[test]
    fn messages_keep_order_and_are_found_by_id() {
        let store = store();
        let session = store.create(None);
        let user = Message::user("hello");
        let assistant = Message::assistant_placeholder();

        store.append_message(session.id, user.clone()).unwrap();
        store.append_message(session.id, assistant.clone()).unwrap();

        let stored = store.get(session.id).unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].role, Role::User);
        assert_eq!(stored.messages[1].role, Role::Assistant);
        assert_eq!(stored.message(user.id).unwrap().content, "hello");
        assert!(stored.message(assistant.id).is_some());
        assert!(stored.updated_at >= session.updated_at);
    }

    #[test]
    fn duplicate_message_ids_are_rejected() {
        let store = store();
        let session = store.create(None);
        let message = Message::user("once");

        store.append_message(session.id, message.clone()).unwrap();
        let err = store.append_message(session.id, message).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(store.get(session.id).unwrap().messages.len(), 1);
    }

    #[test]
    fn update_message_mutates_content_in_place() {
        let store = store();
        let session = store.create(None);
        let reply = Message::assistant_placeholder();
        store.append_message(session.id, reply.clone()).unwrap();

        store
            .update_message(session.id, reply.id, |m| m.content.push_str("Hi"))
            .unwrap();
        store
            .update_message(session.id, reply.id, |m| m.content.push_str(" there"))
            .unwrap();
        assert_eq!(
            store.get(session.id).unwrap().message(reply.id).unwrap().content,
            "Hi there"
        );

        let missing = store.update_message(session.id, Uuid::new_v4(), |_| {});
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn streamed_tokens_reach_storage_on_flush() {
        let storage: Arc<dyn KvStore> = Arc::new(InMemoryStorage::new());
        let store = SessionStore::new(storage.clone());
        let session = store.create(None);
        let reply = Message::assistant_placeholder();
        store.append_message(session.id, reply.clone()).unwrap();

        for token in ["Str", "eam"] {
            store
                .stream_into_message(session.id, reply.id, |m| m.content.push_str(token))
                .unwrap();
        }
        assert_eq!(store.get(session.id).unwrap().message(reply.id).unwrap().content, "Stream");

        let stored = || -> SessionsSnapshot {
            serde_json::from_str(&storage.get(SESSIONS_KEY).unwrap().unwrap()).unwrap()
        };
        let persisted = stored().sessions[0].messages[0].content.clone();
        assert!(persisted.is_empty());

        store.flush();
        assert_eq!(stored().sessions[0].messages[0].content, "Stream");
    }

    #[test]
    fn hydrate_creates_first_conversation_then_restores_active() {
        let storage: Arc<dyn KvStore> = Arc::new(InMemoryStorage::new());
        let store = SessionStore::new(storage.clone());

        let first = store.hydrate_initial();
        assert_eq!(first.title, FIRST_SESSION_TITLE);
        let second = store.create(Some("Second"));
        store.select(first.id);

        let reloaded = SessionStore::new(storage);
        assert_eq!(reloaded.list().len(), 2);
        assert_eq!(reloaded.hydrate_initial().id, first.id);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn replace_messages_rejects_duplicates() {
        let store = store();
        let session = store.create(None);
        let message = Message::user("x");

        assert!(store
            .replace_messages(session.id, vec![message.clone(), message.clone()])
            .is_err());
        store.replace_messages(session.id, vec![message]).unwrap();
        assert_eq!(store.get(session.id).unwrap().messages.len(), 1);
    }
}
