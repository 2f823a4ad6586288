//! User-authored memories injected as conversation context

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;
use crate::state::StateContainer;
use crate::storage::{JsonlStorage, KvStore};

/// Storage key of the memory snapshot
pub const MEMORIES_KEY: &str = "astra-memories";

/// Default number of memories kept
pub const DEFAULT_MEMORY_LIMIT: usize = 100;

/// A fact the user wants surfaced during conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique memory ID
    pub id: Uuid,

    /// Short headline
    pub title: String,

    /// The fact itself
    pub details: String,

    /// When the memory was created
    pub created_at: DateTime<Utc>,

    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MemoryItem {
    /// Create a new memory
    pub fn new(title: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            details: details.into(),
            created_at: Utc::now(),
            tags: Vec::new(),
        }
    }

    /// Add tags to the memory
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Line injected into the prompt for this memory
    pub fn as_context(&self) -> String {
        format!("{}: {}", self.title, self.details)
    }
}

/// Input for a new memory
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMemory {
    pub title: String,
    pub details: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial memory edit; `None` fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryUpdate {
    pub title: Option<String>,
    pub details: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// A memory pushed out by the cap, as written to the archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMemory {
    #[serde(flatten)]
    pub memory: MemoryItem,
    pub archived_at: DateTime<Utc>,
}

/// Split comma-separated tag input, dropping blanks
pub fn parse_tags(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(String::from)
        .collect()
}

/// Persisted memory collection, newest first, capped at `limit`
pub struct MemoryStore {
    state: StateContainer<Vec<MemoryItem>>,
    limit: usize,
    archive: Option<JsonlStorage>,
}

impl MemoryStore {
    pub fn new(storage: Arc<dyn KvStore>) -> Self {
        Self {
            state: StateContainer::load(MEMORIES_KEY, storage, Vec::new),
            limit: DEFAULT_MEMORY_LIMIT,
            archive: None,
        }
    }

    /// Override the cap
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Write evicted memories to `path` instead of discarding them
    pub fn with_archive(mut self, path: impl AsRef<Path>) -> Self {
        self.archive = Some(JsonlStorage::new(path.as_ref()));
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// All memories, newest first
    pub fn list(&self) -> Vec<MemoryItem> {
        self.state.snapshot()
    }

    pub fn get(&self, id: Uuid) -> Option<MemoryItem> {
        self.state.read(|memories| memories.iter().find(|m| m.id == id).cloned())
    }

    pub fn len(&self) -> usize {
        self.state.read(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a new memory at the front. Blank title or details is a no-op.
    pub fn add(&self, input: NewMemory) -> Option<MemoryItem> {
        let title = input.title.trim();
        let details = input.details.trim();
        if title.is_empty() || details.is_empty() {
            return None;
        }

        let tags = input
            .tags
            .iter()
            .map(|tag| tag.trim())
            .filter(|tag| !tag.is_empty())
            .map(String::from)
            .collect();
        let memory = MemoryItem::new(title, details).with_tags(tags);

        let mut evicted = Vec::new();
        self.state.modify(|memories| {
            memories.insert(0, memory.clone());
            if memories.len() > self.limit {
                evicted = memories.split_off(self.limit);
            }
            true
        });
        self.archive_evicted(evicted);

        tracing::debug!("Stored memory {} ({})", memory.id, memory.title);
        Some(memory)
    }

    /// Edit a memory in place
    pub fn update(&self, id: Uuid, changes: MemoryUpdate) -> Option<MemoryItem> {
        let mut updated = None;
        self.state.modify(|memories| {
            let Some(memory) = memories.iter_mut().find(|m| m.id == id) else {
                return false;
            };
            if let Some(title) = changes.title {
                memory.title = title;
            }
            if let Some(details) = changes.details {
                memory.details = details;
            }
            if let Some(tags) = changes.tags {
                memory.tags = tags;
            }
            updated = Some(memory.clone());
            true
        });
        updated
    }

    /// Delete a memory; returns whether it existed
    pub fn remove(&self, id: Uuid) -> bool {
        self.state.modify(|memories| {
            let before = memories.len();
            memories.retain(|m| m.id != id);
            memories.len() != before
        })
    }

    pub fn clear(&self) {
        self.state.modify(|memories| {
            let had_any = !memories.is_empty();
            memories.clear();
            had_any
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<MemoryItem>> {
        self.state.subscribe()
    }

    /// Write all memories to a JSONL file
    pub fn export_jsonl(&self, path: &Path) -> Result<usize> {
        let memories = self.list();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        JsonlStorage::new(path).append_all(&memories)?;
        Ok(memories.len())
    }

    /// Merge memories from a JSONL file. Ids already present are skipped;
    /// the result is re-sorted newest first and capped.
    pub fn import_jsonl(&self, path: &Path) -> Result<usize> {
        let incoming: Vec<MemoryItem> = JsonlStorage::new(path).read_all()?;

        let mut imported = 0;
        let mut evicted = Vec::new();
        self.state.modify(|memories| {
            for item in incoming {
                if memories.iter().any(|m| m.id == item.id) {
                    continue;
                }
                memories.push(item);
                imported += 1;
            }
            memories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if memories.len() > self.limit {
                evicted = memories.split_off(self.limit);
            }
            imported > 0
        });
        self.archive_evicted(evicted);

        Ok(imported)
    }

    fn archive_evicted(&self, evicted: Vec<MemoryItem>) {
        if evicted.is_empty() {
            return;
        }
        let Some(archive) = &self.archive else {
            tracing::debug!("Dropped {} memories over the cap", evicted.len());
            return;
        };

        let archived_at = Utc::now();
        let records: Vec<ArchivedMemory> = evicted
            .into_iter()
            .map(|memory| ArchivedMemory { memory, archived_at })
            .collect();
        if let Err(e) = archive.append_all(&records) {
            tracing::warn!("Failed to archive evicted memories: {}", e);
        }
    }
}

/// Which memories are injected into the next turn. Ephemeral, never persisted.
#[derive(Debug, Clone)]
pub struct MemorySelection {
    ids: Vec<Uuid>,
    default_count: usize,
}

impl MemorySelection {
    pub fn new(default_count: usize) -> Self {
        Self {
            ids: Vec::new(),
            default_count,
        }
    }

    /// Reconcile with the current memories: drop ids that no longer exist,
    /// then fall back to the most recent memories when nothing is selected.
    pub fn sync(&mut self, memories: &[MemoryItem]) {
        self.prune(memories);
        if self.ids.is_empty() {
            self.ids = memories
                .iter()
                .take(self.default_count)
                .map(|m| m.id)
                .collect();
        }
    }

    /// Drop ids that are not in `memories`
    pub fn prune(&mut self, memories: &[MemoryItem]) {
        self.ids.retain(|id| memories.iter().any(|m| m.id == *id));
    }

    /// Flip one id; returns whether it is now selected
    pub fn toggle(&mut self, id: Uuid) -> bool {
        if let Some(pos) = self.ids.iter().position(|selected| *selected == id) {
            self.ids.remove(pos);
            false
        } else {
            self.ids.push(id);
            true
        }
    }

    pub fn is_selected(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    /// Selected memories in store order
    pub fn selected<'a>(&self, memories: &'a [MemoryItem]) -> Vec<&'a MemoryItem> {
        memories.iter().filter(|m| self.is_selected(m.id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(InMemoryStorage::new()))
    }

    fn new_memory(title: &str) -> NewMemory {
        NewMemory {
            title: title.to_string(),
            details: format!("details of {}", title),
            tags: Vec::new(),
        }
    }

    #[test]
    fn blank_title_or_details_is_a_noop() {
        let store = store();
        assert!(store.add(new_memory("  ")).is_none());
        assert!(store
            .add(NewMemory {
                title: "t".into(),
                details: "\n".into(),
                tags: vec![],
            })
            .is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn add_trims_fields_and_tags() {
        let store = store();
        let memory = store
            .add(NewMemory {
                title: "  Coffee ".into(),
                details: " Oat milk flat white ".into(),
                tags: parse_tags(" drinks, ,morning,"),
            })
            .unwrap();

        assert_eq!(memory.title, "Coffee");
        assert_eq!(memory.details, "Oat milk flat white");
        assert_eq!(memory.tags, vec!["drinks", "morning"]);
        assert_eq!(memory.as_context(), "Coffee: Oat milk flat white");
    }

    #[test]
    fn cap_evicts_oldest_into_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("archive.jsonl");
        let store = store().with_limit(3).with_archive(&archive_path);

        for title in ["one", "two", "three", "four", "five"] {
            store.add(new_memory(title));
        }

        let titles: Vec<String> = store.list().into_iter().map(|m| m.title).collect();
        assert_eq!(titles, vec!["five", "four", "three"]);

        let archived: Vec<ArchivedMemory> = JsonlStorage::new(&archive_path).read_all().unwrap();
        let archived_titles: Vec<&str> =
            archived.iter().map(|a| a.memory.title.as_str()).collect();
        assert_eq!(archived_titles, vec!["one", "two"]);
    }

    #[test]
    fn never_exceeds_default_cap() {
        let store = store();
        for i in 0..(DEFAULT_MEMORY_LIMIT + 7) {
            store.add(new_memory(&format!("m{}", i)));
        }
        assert_eq!(store.len(), DEFAULT_MEMORY_LIMIT);
        assert_eq!(store.list()[0].title, format!("m{}", DEFAULT_MEMORY_LIMIT + 6));
    }

    #[test]
    fn update_and_remove() {
        let store = store();
        let memory = store.add(new_memory("city")).unwrap();

        let updated = store
            .update(
                memory.id,
                MemoryUpdate {
                    details: Some("Lisbon".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "city");
        assert_eq!(updated.details, "Lisbon");
        assert!(store.update(Uuid::new_v4(), MemoryUpdate::default()).is_none());

        assert!(store.remove(memory.id));
        assert!(!store.remove(memory.id));
        assert!(store.is_empty());
    }

    #[test]
    fn export_then_import_skips_known_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memories.jsonl");

        let source = store();
        source.add(new_memory("a"));
        source.add(new_memory("b"));
        assert_eq!(source.export_jsonl(&path).unwrap(), 2);
        assert_eq!(source.import_jsonl(&path).unwrap(), 0);

        let target = store();
        target.add(new_memory("c"));
        assert_eq!(target.import_jsonl(&path).unwrap(), 2);
        assert_eq!(target.len(), 3);
    }

    #[test]
    fn empty_selection_falls_back_to_three_most_recent() {
        let store = store();
        let mut selection = MemorySelection::new(3);
        selection.sync(&store.list());
        assert!(selection.ids().is_empty());

        for title in ["a", "b", "c", "d"] {
            store.add(new_memory(title));
        }
        let memories = store.list();
        selection.sync(&memories);
        let titles: Vec<&str> = selection
            .selected(&memories)
            .iter()
            .map(|m| m.title.as_str())
            .collect();
        assert_eq!(titles, vec!["d", "c", "b"]);

        // Deselecting everything falls back to the defaults again.
        for id in selection.ids().to_vec() {
            selection.toggle(id);
        }
        assert!(selection.ids().is_empty());
        selection.sync(&memories);
        assert_eq!(selection.ids().len(), 3);
    }

    #[test]
    fn selection_reseeds_after_every_memory_is_removed() {
        let store = store();
        let first = store.add(new_memory("a")).unwrap();
        let mut selection = MemorySelection::new(3);
        selection.sync(&store.list());
        assert_eq!(selection.ids(), &[first.id]);

        store.remove(first.id);
        selection.prune(&store.list());
        assert!(selection.ids().is_empty());

        let second = store.add(new_memory("b")).unwrap();
        selection.sync(&store.list());
        assert_eq!(selection.ids(), &[second.id]);
    }

    #[test]
    fn selection_is_pruned_on_removal() {
        let store = store();
        let keep = store.add(new_memory("keep")).unwrap();
        let gone = store.add(new_memory("gone")).unwrap();

        let mut selection = MemorySelection::new(3);
        selection.sync(&store.list());
        assert!(selection.is_selected(gone.id));

        store.remove(gone.id);
        selection.prune(&store.list());
        assert_eq!(selection.ids(), &[keep.id]);
    }
}
