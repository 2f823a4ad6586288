//! Injectable, persisted state containers
//!
//! Every store (persona, memories, sessions) is a [`StateContainer`]: a
//! value behind a `watch` channel plus a key in a [`KvStore`]. Reads borrow
//! the current value, mutations go through [`StateContainer::modify`] and
//! subscribers receive a notification for every effective change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::storage::KvStore;

/// A persisted value with read / mutate / subscribe contracts
pub struct StateContainer<T> {
    key: &'static str,
    tx: watch::Sender<T>,
    storage: Arc<dyn KvStore>,

    /// Set by deferred changes not yet written back
    dirty: AtomicBool,
}

impl<T> StateContainer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Rehydrate the value stored under `key`, or start from `default`.
    ///
    /// An unreadable snapshot is logged and replaced by the default.
    pub fn load(key: &'static str, storage: Arc<dyn KvStore>, default: impl FnOnce() -> T) -> Self {
        let initial = match storage.get(key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Discarding unreadable snapshot {}: {}", key, e);
                    default()
                }
            },
            Ok(None) => default(),
            Err(e) => {
                tracing::warn!("Failed to read snapshot {}: {}", key, e);
                default()
            }
        };

        let (tx, _rx) = watch::channel(initial);
        Self {
            key,
            tx,
            storage,
            dirty: AtomicBool::new(false),
        }
    }

    /// Storage key of this container
    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Run `f` against the current value
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Clone the current value
    pub fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Mutate in place. `f` returns whether it changed anything; only
    /// effective changes notify subscribers and are written back.
    pub fn modify(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        let changed = self.tx.send_if_modified(f);
        if changed {
            self.persist();
        }
        changed
    }

    /// Like [`modify`](Self::modify) but only notifies subscribers. The
    /// write happens on the next [`flush`](Self::flush) or persisted change.
    pub fn modify_deferred(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        let changed = self.tx.send_if_modified(f);
        if changed {
            self.dirty.store(true, Ordering::SeqCst);
        }
        changed
    }

    /// Write back pending deferred changes, if any
    pub fn flush(&self) {
        if self.dirty.load(Ordering::SeqCst) {
            self.persist();
        }
    }

    /// Replace the whole value
    pub fn replace(&self, value: T) {
        self.tx.send_replace(value);
        self.persist();
    }

    /// Receive a notification on every effective change
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Fire-and-forget write of the current snapshot; last write wins.
    fn persist(&self) {
        self.dirty.store(false, Ordering::SeqCst);
        let serialized = serde_json::to_string(&*self.tx.borrow());
        let result = serialized
            .map_err(crate::Error::from)
            .and_then(|raw| self.storage.put(self.key, &raw));
        if let Err(e) = result {
            tracing::warn!("Failed to persist {}: {}", self.key, e);
        }
    }
}
