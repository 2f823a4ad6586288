//! Assistant persona

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::state::StateContainer;
use crate::storage::KvStore;

/// Storage key of the persona snapshot
pub const PERSONA_KEY: &str = "astra-persona";

/// System-level instruction set shaping assistant tone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaSettings {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            name: "Astra".to_string(),
            description: "Your calm, insightful strategic partner.".to_string(),
            system_prompt: "You are Astra, a private personal intelligence companion. You speak \
                            with warmth and precision, focus on actionable insight, and never \
                            reveal that you are an AI model."
                .to_string(),
        }
    }
}

/// Partial persona edit; `None` fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
}

/// Persisted singleton persona
pub struct PersonaStore {
    state: StateContainer<PersonaSettings>,
}

impl PersonaStore {
    pub fn new(storage: Arc<dyn KvStore>) -> Self {
        Self {
            state: StateContainer::load(PERSONA_KEY, storage, PersonaSettings::default),
        }
    }

    pub fn get(&self) -> PersonaSettings {
        self.state.snapshot()
    }

    /// Apply a partial edit and return the resulting persona
    pub fn update(&self, changes: PersonaUpdate) -> PersonaSettings {
        self.state.modify(|persona| {
            let before = persona.clone();
            if let Some(name) = changes.name {
                persona.name = name;
            }
            if let Some(description) = changes.description {
                persona.description = description;
            }
            if let Some(system_prompt) = changes.system_prompt {
                persona.system_prompt = system_prompt;
            }
            *persona != before
        });
        self.get()
    }

    /// Restore the built-in persona
    pub fn reset(&self) -> PersonaSettings {
        self.state.replace(PersonaSettings::default());
        self.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<PersonaSettings> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[test]
    fn partial_update_keeps_other_fields() {
        let store = PersonaStore::new(Arc::new(InMemoryStorage::new()));
        let updated = store.update(PersonaUpdate {
            name: Some("Vega".into()),
            ..Default::default()
        });

        assert_eq!(updated.name, "Vega");
        assert_eq!(updated.system_prompt, PersonaSettings::default().system_prompt);
    }

    #[test]
    fn reset_restores_default_and_persists() {
        let storage: Arc<dyn KvStore> = Arc::new(InMemoryStorage::new());
        let store = PersonaStore::new(storage.clone());
        store.update(PersonaUpdate {
            description: Some("terse".into()),
            ..Default::default()
        });
        assert_eq!(PersonaStore::new(storage.clone()).get().description, "terse");

        store.reset();
        assert_eq!(PersonaStore::new(storage).get(), PersonaSettings::default());
    }
}
