use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, Receiver, Sender};

/// Full contents of a store as published on change.
pub type Snapshot = Map<String, Value>;

/// Last-known key/value snapshot that notifies subscribers when a merge
/// actually changes it.
pub struct StateStore {
    name: &'static str,
    data: Mutex<Snapshot>,
    changes: Sender<Snapshot>,
}

impl StateStore {
    pub fn new(name: &'static str) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            name,
            data: Mutex::new(Snapshot::new()),
            changes,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self) -> Snapshot {
        self.lock().clone()
    }

    /// Receives the resulting full snapshot after each effective merge.
    pub fn subscribe(&self) -> Receiver<Snapshot> {
        self.changes.subscribe()
    }

    /// Overwrites the given keys, leaving all others untouched.
    ///
    /// Returns the new snapshot if anything changed, `None` otherwise. A
    /// change notification is sent only in the first case.
    pub fn merge(&self, partial: Snapshot) -> Option<Snapshot> {
        let snapshot = {
            let mut data = self.lock();
            let mut changed = false;
            for (key, value) in partial {
                if data.get(&key) != Some(&value) {
                    data.insert(key, value);
                    changed = true;
                }
            }
            if !changed {
                return None;
            }
            data.clone()
        };

        // No subscribers is not an error
        let _ = self.changes.send(snapshot.clone());
        Some(snapshot)
    }

    /// Merges the fields of any struct that serializes to a JSON object.
    pub fn merge_from<T: Serialize>(&self, partial: &T) -> Option<Snapshot> {
        match serde_json::to_value(partial) {
            Ok(Value::Object(map)) => self.merge(map),
            Ok(other) => {
                tracing::warn!("{} store ignoring non-object merge: {other}", self.name);
                None
            }
            Err(e) => {
                tracing::warn!("{} store could not serialize merge: {e}", self.name);
                None
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        // A poisoned lock still holds a consistent map: writers never panic mid-update
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
