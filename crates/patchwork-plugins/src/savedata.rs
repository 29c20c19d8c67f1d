//! Per-plugin persisted configuration
//!
//! Each plugin owns one free-form `Savedata` table, stored in a TOML document
//! keyed by the plugin's relative source path. A missing document yields an
//! empty section.

use crate::{PluginError, PluginResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use toml::{Table, Value};
use tracing::debug;

/// A plugin's hierarchical configuration section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Savedata(Table);

impl Savedata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a dotted path such as `camera.zoom`
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Insert `value` unless the key is already present
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Child table, created when missing
    pub fn section(&mut self, key: &str) -> &mut Table {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        match entry {
            Value::Table(table) => table,
            _ => unreachable!("entry was just replaced with a table"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_table(&self) -> &Table {
        &self.0
    }
}

/// Savedata as loaded from storage
#[derive(Debug, Clone, PartialEq)]
pub struct SavedataDocument {
    pub savedata: Savedata,
    /// No document existed; this one was freshly created
    pub created: bool,
}

#[derive(Serialize, Deserialize)]
struct DocumentFile {
    #[serde(rename = "Savedata", default)]
    savedata: Savedata,
}

/// Storage backend for savedata documents
#[async_trait]
pub trait SavedataStore: Send + Sync {
    fn load(&self, identity: &str) -> PluginResult<SavedataDocument>;

    async fn save(&self, identity: String, savedata: Savedata) -> PluginResult<()>;
}

/// TOML files under a root directory, one per plugin identity
#[derive(Debug, Clone)]
pub struct TomlSavedataStore {
    root: PathBuf,
}

impl TomlSavedataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<identity>.toml`; identities may not escape the root
    pub fn document_path(&self, identity: &str) -> PluginResult<PathBuf> {
        let relative = Path::new(identity);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if identity.is_empty() || escapes {
            return Err(PluginError::Savedata(format!(
                "invalid plugin identity {identity:?}"
            )));
        }
        let mut path = self.root.join(relative).into_os_string();
        path.push(".toml");
        Ok(PathBuf::from(path))
    }
}

#[async_trait]
impl SavedataStore for TomlSavedataStore {
    fn load(&self, identity: &str) -> PluginResult<SavedataDocument> {
        let path = self.document_path(identity)?;
        if !path.exists() {
            debug!(plugin = %identity, "No savedata document, starting empty");
            return Ok(SavedataDocument {
                savedata: Savedata::new(),
                created: true,
            });
        }

        let contents = fs::read_to_string(&path)?;
        let file: DocumentFile = toml::from_str(&contents).map_err(|e| {
            PluginError::Savedata(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(SavedataDocument {
            savedata: file.savedata,
            created: false,
        })
    }

    async fn save(&self, identity: String, savedata: Savedata) -> PluginResult<()> {
        let path = self.document_path(&identity)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = toml::to_string_pretty(&DocumentFile { savedata })
            .map_err(|e| PluginError::Savedata(format!("failed to serialize savedata: {e}")))?;
        tokio::fs::write(&path, contents).await?;
        debug!(plugin = %identity, path = %path.display(), "Savedata persisted");
        Ok(())
    }
}

/// Process-local store, for hosts without persistent storage
#[derive(Debug, Default)]
pub struct MemorySavedataStore {
    documents: Mutex<HashMap<String, Savedata>>,
}

impl MemorySavedataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, identity: &str, savedata: Savedata) -> Self {
        if let Ok(mut docs) = self.documents.lock() {
            docs.insert(identity.to_string(), savedata);
        }
        self
    }

    pub fn snapshot(&self, identity: &str) -> Option<Savedata> {
        self.documents.lock().ok()?.get(identity).cloned()
    }
}

#[async_trait]
impl SavedataStore for MemorySavedataStore {
    fn load(&self, identity: &str) -> PluginResult<SavedataDocument> {
        let docs = self
            .documents
            .lock()
            .map_err(|_| PluginError::Savedata("store lock poisoned".to_string()))?;
        Ok(match docs.get(identity) {
            Some(savedata) => SavedataDocument {
                savedata: savedata.clone(),
                created: false,
            },
            None => SavedataDocument {
                savedata: Savedata::new(),
                created: true,
            },
        })
    }

    async fn save(&self, identity: String, savedata: Savedata) -> PluginResult<()> {
        let mut docs = self
            .documents
            .lock()
            .map_err(|_| PluginError::Savedata("store lock poisoned".to_string()))?;
        docs.insert(identity, savedata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savedata_paths_and_defaults() {
        let mut data = Savedata::new();
        data.set("enabled", true);
        data.set_default("enabled", false);
        data.section("camera").insert("zoom".to_string(), Value::Float(1.5));

        assert_eq!(data.get("enabled"), Some(&Value::Boolean(true)));
        assert_eq!(data.get_path("camera.zoom"), Some(&Value::Float(1.5)));
        assert!(data.get_path("camera.missing").is_none());
        assert!(data.get_path("enabled.deeper").is_none());
    }

    #[test]
    fn test_section_replaces_scalar() {
        let mut data = Savedata::new();
        data.set("camera", 3);
        data.section("camera").insert("fov".to_string(), Value::Integer(90));
        assert_eq!(data.get_path("camera.fov"), Some(&Value::Integer(90)));
    }

    #[test]
    fn test_document_path_rejects_escape() {
        let store = TomlSavedataStore::new("/data");
        assert_eq!(
            store.document_path("mods/zoom.cs").expect("path"),
            PathBuf::from("/data/mods/zoom.cs.toml")
        );
        assert!(store.document_path("../etc/passwd").is_err());
        assert!(store.document_path("/abs.cs").is_err());
        assert!(store.document_path("").is_err());
    }

    #[test]
    fn test_missing_document_is_created_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TomlSavedataStore::new(dir.path());
        let doc = store.load("fresh.cs").expect("load");
        assert!(doc.created);
        assert!(doc.savedata.is_empty());
    }

    #[tokio::test]
    async fn test_toml_store_save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TomlSavedataStore::new(dir.path());

        let mut data = Savedata::new();
        data.set("greeting", "hello");
        data.section("limits").insert("max".to_string(), Value::Integer(3));
        store
            .save("nested/plugin.cs".to_string(), data.clone())
            .await
            .expect("save");

        let written =
            std::fs::read_to_string(dir.path().join("nested/plugin.cs.toml")).expect("read");
        assert!(written.contains("[Savedata]"));

        let doc = store.load("nested/plugin.cs").expect("load");
        assert!(!doc.created);
        assert_eq!(doc.savedata, data);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("bad.cs.toml"), "[Savedata\n").expect("write");
        let store = TomlSavedataStore::new(dir.path());
        assert!(matches!(store.load("bad.cs"), Err(PluginError::Savedata(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySavedataStore::new();
        assert!(store.load("a").expect("load").created);

        let mut data = Savedata::new();
        data.set("k", 1);
        store.save("a".to_string(), data.clone()).await.expect("save");
        assert_eq!(store.snapshot("a"), Some(data));
        assert!(!store.load("a").expect("load").created);
    }
}
