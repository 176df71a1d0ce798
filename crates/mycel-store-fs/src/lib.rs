#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-store-fs** – Filesystem storage drivers for Mycel.
//!
//! Two drivers live here:
//!
//! - [`FsDocumentStore`]: one `<id>.json` file per entity inside an
//!   agent-owned directory, written atomically (temp file + rename) so a
//!   crash never leaves a half-written document.
//! - [`JsonlSink`]: an append-only file of newline-terminated JSON objects,
//!   used by the audit trail. Writes are serialized internally; rotation is
//!   an external concern.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use mycel_store_core::{atomic_write, DocumentStore, StoreError};

//─────────────────────────────
//  Document store
//─────────────────────────────

/// Per-entity JSON document store rooted at a single directory.
///
/// The directory is exclusively owned by one agent; ids become file names, so
/// anything that would escape the directory is rejected.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Open (creating if needed) a document store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// The owned directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty()
            || id.contains(['/', '\\'])
            || id.contains("..")
            || id.starts_with('.')
        {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(format!("{id}.json")))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn put(&self, id: &str, document: &serde_json::Value) -> Result<(), StoreError> {
        let path = self.entity_path(id)?;
        let mut bytes = serde_json::to_vec_pretty(document)?;
        bytes.push(b'\n');
        atomic_write(&path, &bytes).await?;
        debug!(id, path = %path.display(), "document persisted");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.entity_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.entity_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                if !id.starts_with('.') {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }
}

//─────────────────────────────
//  JSONL sink
//─────────────────────────────

/// Append-only sink of newline-terminated JSON objects.
///
/// An internal mutex serializes appends so concurrent writers never interleave
/// lines. The file is opened in append mode and flushed per record.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlSink {
    /// Open (creating if needed) the sink at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    /// The sink's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON object as a single newline-terminated line.
    pub async fn append(&self, value: &serde_json::Value) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn document_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::open(dir.path()).await.unwrap();

        let doc = json!({ "id": "b1", "species": "P. ostreatus", "status": "active" });
        store.put("b1", &doc).await.unwrap();

        assert_eq!(store.get("b1").await.unwrap(), Some(doc));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::open(dir.path()).await.unwrap();

        store.put("b1", &json!({})).await.unwrap();
        assert!(store.delete("b1").await.unwrap());
        assert!(!store.delete("b1").await.unwrap());
    }

    #[tokio::test]
    async fn list_ids_sees_only_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::open(dir.path()).await.unwrap();

        store.put("a", &json!(1)).await.unwrap();
        store.put("b", &json!(2)).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"x").await.unwrap();

        let mut ids = store.list_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn path_escaping_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::open(dir.path()).await.unwrap();

        for bad in ["../evil", "a/b", "", ".hidden"] {
            assert!(matches!(
                store.put(bad, &json!(null)).await,
                Err(StoreError::InvalidId(_))
            ));
        }
    }

    #[tokio::test]
    async fn jsonl_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlSink::open(&path).await.unwrap();

        sink.append(&json!({ "request_id": "r1", "status": "ok" })).await.unwrap();
        sink.append(&json!({ "request_id": "r2", "status": "denied" })).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["request_id"], "r1");
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test]
    async fn jsonl_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let sink = JsonlSink::open(&path).await.unwrap();
            sink.append(&json!({ "n": 1 })).await.unwrap();
        }
        {
            let sink = JsonlSink::open(&path).await.unwrap();
            sink.append(&json!({ "n": 2 })).await.unwrap();
        }
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
