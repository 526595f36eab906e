//! Generic keyed persistent store.
//!
//! The orchestration teacher backed this with a blockchain-SDK local
//! database; that dependency has no place outside a chain node, so this
//! keeps the same `open`/`get`/`find`/`values`/`insert`/`remove`/`update`
//! method shape but backs it with an in-memory `DashMap` snapshotted to a
//! JSON file on disk, reloaded at `open`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SandboxError};

/// A keyed store of JSON-serializable values, persisted to a single file.
///
/// Every mutating call rewrites the backing file. This is adequate for the
/// session/document volumes this crate deals with; it is not meant for
/// high-frequency writers.
pub struct PersistentStore<V> {
    path: PathBuf,
    entries: DashMap<String, V>,
}

impl<V> PersistentStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (creating if absent) the store backed by `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|err| SandboxError::Storage(format!("reading {}: {err}", path.display())))?;
            if raw.trim().is_empty() {
                DashMap::new()
            } else {
                let map: std::collections::HashMap<String, V> = serde_json::from_str(&raw)
                    .map_err(|err| SandboxError::Storage(format!("parsing {}: {err}", path.display())))?;
                map.into_iter().collect()
            }
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| SandboxError::Storage(format!("creating {}: {err}", parent.display())))?;
            }
            DashMap::new()
        };
        Ok(Arc::new(Self { path, entries }))
    }

    fn flush(&self) -> Result<()> {
        let snapshot: std::collections::HashMap<String, V> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let raw = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| SandboxError::Storage(format!("serializing store: {err}")))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .map_err(|err| SandboxError::Storage(format!("writing {}: {err}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| SandboxError::Storage(format!("renaming into {}: {err}", self.path.display())))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn values(&self) -> Vec<V> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Return every value for which `predicate` returns true.
    pub fn find(&self, predicate: impl Fn(&V) -> bool) -> Vec<V> {
        self.entries
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn insert(&self, key: impl Into<String>, value: V) -> Result<()> {
        self.entries.insert(key.into(), value);
        self.flush()
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        let removed = self.entries.remove(key).map(|(_, v)| v);
        self.flush()?;
        Ok(removed)
    }

    /// Apply `f` to the existing value at `key`, if present, and persist the result.
    pub fn update(&self, key: &str, f: impl FnOnce(&mut V)) -> Result<Option<V>> {
        let updated = if let Some(mut entry) = self.entries.get_mut(key) {
            f(&mut entry);
            Some(entry.clone())
        } else {
            None
        };
        if updated.is_some() {
            self.flush()?;
        }
        Ok(updated)
    }

    /// Replace the value at `key` wholesale, inserting if absent.
    pub fn replace(&self, key: impl Into<String>, value: V) -> Result<()> {
        self.insert(key, value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[test]
    fn insert_get_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widgets.json");

        let store = PersistentStore::<Widget>::open(&path).unwrap();
        store
            .insert(
                "a",
                Widget {
                    name: "alpha".into(),
                    count: 1,
                },
            )
            .unwrap();

        let reopened = PersistentStore::<Widget>::open(&path).unwrap();
        assert_eq!(
            reopened.get("a"),
            Some(Widget {
                name: "alpha".into(),
                count: 1
            })
        );
    }

    #[test]
    fn update_mutates_existing_entry_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::<Widget>::open(dir.path().join("w.json")).unwrap();

        assert!(store.update("missing", |w| w.count += 1).unwrap().is_none());

        store
            .insert(
                "a",
                Widget {
                    name: "alpha".into(),
                    count: 1,
                },
            )
            .unwrap();
        let updated = store.update("a", |w| w.count += 1).unwrap().unwrap();
        assert_eq!(updated.count, 2);
    }

    #[test]
    fn remove_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::<Widget>::open(dir.path().join("w.json")).unwrap();
        store
            .insert(
                "a",
                Widget {
                    name: "alpha".into(),
                    count: 1,
                },
            )
            .unwrap();
        let removed = store.remove("a").unwrap();
        assert!(removed.is_some());
        assert!(store.get("a").is_none());
    }

    #[test]
    fn find_filters_by_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::<Widget>::open(dir.path().join("w.json")).unwrap();
        store
            .insert(
                "a",
                Widget {
                    name: "alpha".into(),
                    count: 1,
                },
            )
            .unwrap();
        store
            .insert(
                "b",
                Widget {
                    name: "beta".into(),
                    count: 5,
                },
            )
            .unwrap();
        let found = store.find(|w| w.count > 2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "beta");
    }
}
