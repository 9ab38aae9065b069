//! Durable state store.
//!
//! Flags, rollout states, trigger states, and rollback history are
//! persisted as JSON documents under the state directory so in-flight
//! deliveries survive a daemon restart. Writes go through a temp file and
//! an atomic rename; a torn write can never corrupt the last good state.

use pdc_common::ControlError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Document names used by the controller.
pub const FLAGS_DOC: &str = "flags";
pub const ROLLOUTS_DOC: &str = "rollouts";
pub const TRIGGERS_DOC: &str = "triggers";
pub const ROLLBACKS_DOC: &str = "rollback_history";

/// JSON-document store rooted at a directory.
#[derive(Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) a store at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ControlError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ControlError::Store(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn doc_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Persist a document atomically.
    pub async fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ControlError> {
        let path = self.doc_path(name);
        let tmp = self.dir.join(format!(".{name}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| ControlError::Store(format!("serialize {name}: {e}")))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ControlError::Store(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ControlError::Store(format!("{}: {e}", path.display())))?;
        debug!("Persisted {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Persist without surfacing errors; persistence failures must never
    /// break a state transition that already happened in memory.
    pub async fn save_best_effort<T: Serialize>(&self, name: &str, value: &T) {
        if let Err(err) = self.save(name, value).await {
            warn!("State persistence failed: {}", err);
        }
    }

    /// Load a document, `None` when it does not exist yet.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ControlError> {
        let path = self.doc_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ControlError::Store(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ControlError::Store(format!("{}: {e}", path.display())))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut doc: HashMap<String, u32> = HashMap::new();
        doc.insert("alpha".into(), 1);
        store.save("test_doc", &doc).await.unwrap();

        let loaded: Option<HashMap<String, u32>> = store.load("test_doc").unwrap();
        assert_eq!(loaded, Some(doc));
    }

    #[tokio::test]
    async fn missing_document_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let loaded: Option<Vec<String>> = store.load("absent").unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_overwrites_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.save("doc", &vec![1, 2, 3]).await.unwrap();
        store.save("doc", &vec![4]).await.unwrap();
        let loaded: Option<Vec<i32>> = store.load("doc").unwrap();
        assert_eq!(loaded, Some(vec![4]));
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();
        let loaded: Result<Option<Vec<i32>>, _> = store.load("bad");
        assert!(loaded.is_err());
    }
}
