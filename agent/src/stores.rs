//! Two JSON-file-backed `map(id -> string)` stores for aliases and PSKs
//!. Each store is serialized by its own lock; a mutation is
//! write-through under that lock so the in-memory map and the file never
//! observably diverge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;

/// A single `map(String, String)` store, write-through to a JSON file.
pub struct Store {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl Store {
    /// Loads `path` if it exists and parses as a JSON object; a missing or
    /// corrupt file is treated as an empty store (logged, not a failure) —
    /// a fresh agent instance with no prior pairing history is normal.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| match serde_json::from_str(&text) {
                Ok(map) => Some(map),
                Err(e) => {
                    warn!("stores: {} is not valid JSON ({e}), starting empty", path.display());
                    None
                }
            })
            .unwrap_or_default();

        Store {
            path,
            map: Mutex::new(map),
        }
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.map.lock().unwrap().get(id).cloned()
    }

    /// Inserts `id -> value` and rewrites the backing file under the same
    /// lock held for the in-memory update.
    pub fn set(&self, id: &str, value: &str) -> hqv_protocol::Result<()> {
        let mut map = self.map.lock().unwrap();
        map.insert(id.to_string(), value.to_string());
        write_json(&self.path, &map)
    }

    pub fn remove(&self, id: &str) -> hqv_protocol::Result<()> {
        let mut map = self.map.lock().unwrap();
        map.remove(id);
        write_json(&self.path, &map)
    }
}

fn write_json(path: &Path, map: &HashMap<String, String>) -> hqv_protocol::Result<()> {
    let text = serde_json::to_string_pretty(map)?;
    std::fs::write(path, text).map_err(hqv_protocol::AgentError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty_and_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.json");

        let store = Store::open(&path);
        assert_eq!(store.get("device-1"), None);

        store.set("device-1", "kitchen-sensor").unwrap();
        assert_eq!(store.get("device-1").as_deref(), Some("kitchen-sensor"));

        let reopened = Store::open(&path);
        assert_eq!(reopened.get("device-1").as_deref(), Some("kitchen-sensor"));
    }

    #[test]
    fn corrupt_file_starts_empty_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.json");
        std::fs::write(&path, "not json").unwrap();

        let store = Store::open(&path);
        assert_eq!(store.get("anything"), None);
    }

    #[test]
    fn remove_drops_entry_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("psks.json");
        let store = Store::open(&path);
        store.set("ep-1", "secret").unwrap();
        store.remove("ep-1").unwrap();
        assert_eq!(store.get("ep-1"), None);
    }
}
