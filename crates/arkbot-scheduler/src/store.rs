//! File-based state store: small JSON documents, one file per key.
//! Writes go to a temp file in the same directory, are fsynced, then renamed
//! over the target, so readers only ever see a complete document.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use arkbot_core::error::{ArkError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Directory-backed JSON document store.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| ArkError::persistence(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Default store path (~/.arkbot/state).
    pub fn default_path() -> PathBuf {
        arkbot_core::ArkConfig::home_dir().join("state")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`. Keys are plain names, never paths.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ArkError::persistence(format!("invalid document key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// Load a document. `Ok(None)` when it has never been written.
    /// A document that exists but does not parse is reported as corrupt.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ArkError::persistence(format!("read {}: {e}", path.display())));
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ArkError::corrupt(key, e.to_string()))
    }

    /// Load a document, falling back to `T::default()` when absent.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        Ok(self.load(key)?.unwrap_or_default())
    }

    /// Atomically replace the document stored under `key`.
    pub fn save<T: Serialize>(&self, key: &str, doc: &T) -> Result<()> {
        let path = self.path_for(key)?;
        let json = serde_json::to_vec_pretty(doc)
            .map_err(|e| ArkError::persistence(format!("serialize {key}: {e}")))?;

        let tmp_path = self.dir.join(format!(".{key}.json.tmp"));
        if let Err(e) = write_synced(&tmp_path, &json) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(ArkError::persistence(format!(
                "write temp file for {key}: {e}"
            )));
        }
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(ArkError::persistence(format!("finalize {key}: {e}")));
        }
        sync_dir(&self.dir);

        tracing::debug!("💾 Saved document '{}' ({} bytes)", key, json.len());
        Ok(())
    }

    /// Append one entry to a list document (read, push, atomic rewrite).
    pub fn append<T: Serialize + DeserializeOwned>(&self, key: &str, entry: T) -> Result<()> {
        let mut list: Vec<T> = self.load_or_default(key)?;
        list.push(entry);
        self.save(key, &list)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

/// Make the rename itself durable. Best effort: not every platform lets a
/// directory be opened for syncing.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// A typed document cached in memory and owned by exactly one component.
///
/// Mutations go through [`Document::update`], which marks the cache dirty;
/// [`Document::flush`] writes it back. A failed flush keeps the cache dirty so
/// the next flush retries.
#[derive(Debug)]
pub struct Document<T> {
    store: StateStore,
    key: String,
    value: T,
    dirty: bool,
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Load `key` from `store` into memory.
    pub fn load(store: &StateStore, key: &str) -> Result<Self> {
        let value = store.load_or_default(key)?;
        Ok(Self {
            store: store.clone(),
            key: key.to_string(),
            value,
            dirty: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mutate the cached value. The closure's return value is passed through.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        self.dirty = true;
        f(&mut self.value)
    }

    /// Persist the cached value if it changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.store.save(&self.key, &self.value)?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn temp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_load_missing_is_none() {
        let (_dir, store) = temp_store();
        let doc: Option<BTreeMap<String, i64>> = store.load("nothing").unwrap();
        assert!(doc.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, store) = temp_store();
        let mut doc = BTreeMap::new();
        doc.insert("match-1".to_string(), vec![-3600_i64, 0]);
        store.save("scheduled", &doc).unwrap();
        store.save("scheduled", &doc).unwrap();

        let loaded: BTreeMap<String, Vec<i64>> = store.load("scheduled").unwrap().unwrap();
        assert_eq!(loaded, doc);
        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_document_is_reported() {
        let (_dir, store) = temp_store();
        std::fs::write(store.path_for("sent").unwrap(), b"{ not json").unwrap();
        let err = store.load::<BTreeMap<String, i64>>("sent").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let (_dir, store) = temp_store();
        assert!(store.path_for("../escape").is_err());
        assert!(store.path_for("").is_err());
        assert!(store.path_for("failure_log").is_ok());
    }

    #[test]
    fn test_failed_write_leaves_previous_document() {
        let (_dir, store) = temp_store();
        store.save("applied", &vec!["lock".to_string()]).unwrap();

        // Occupy the temp path with a directory so the temp write fails.
        std::fs::create_dir(store.dir().join(".applied.json.tmp")).unwrap();
        let err = store.save("applied", &vec!["lock".to_string(), "complete".to_string()]);
        assert!(matches!(err, Err(ArkError::Persistence(_))));

        let still: Vec<String> = store.load("applied").unwrap().unwrap();
        assert_eq!(still, vec!["lock".to_string()]);
    }

    #[test]
    fn test_append() {
        let (_dir, store) = temp_store();
        store.append("failure_log", "a".to_string()).unwrap();
        store.append("failure_log", "b".to_string()).unwrap();
        let all: Vec<String> = store.load("failure_log").unwrap().unwrap();
        assert_eq!(all, vec!["a", "b"]);
    }

    #[test]
    fn test_document_flush_only_when_dirty() {
        let (_dir, store) = temp_store();
        let mut doc: Document<BTreeMap<String, u32>> = Document::load(&store, "counts").unwrap();
        doc.flush().unwrap();
        assert!(store.load::<BTreeMap<String, u32>>("counts").unwrap().is_none());

        doc.update(|m| m.insert("x".into(), 1));
        assert!(doc.is_dirty());
        doc.flush().unwrap();
        assert!(!doc.is_dirty());

        let reloaded: Document<BTreeMap<String, u32>> = Document::load(&store, "counts").unwrap();
        assert_eq!(reloaded.value().get("x"), Some(&1));
    }
}
