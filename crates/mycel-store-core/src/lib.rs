#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-store-core** – Core storage abstractions for Mycel.
//!
//! This crate defines the contracts for entity persistence without providing
//! concrete drivers. Storage drivers (filesystem, SQLite) implement these
//! traits in separate crates that depend on this core abstraction. It also
//! hosts the canonical-JSON SHA-256 digest used by the audit trail and the
//! write-temp-then-rename helper every file-backed driver uses.

use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Serialization of an entity failed.
    #[error("failed to serialize entity: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Underlying I/O failure.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The entity id is not usable as a storage key.
    #[error("invalid entity id '{0}'")]
    InvalidId(String),
    /// Driver-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

//─────────────────────────────
//  Document store trait
//─────────────────────────────

/// Abstraction over a key/value JSON document store.
///
/// Each entity is one JSON document keyed by its id. Writes replace the whole
/// document atomically; drivers must guarantee readers never observe a
/// partially written document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist `document` under `id`, replacing any previous version.
    async fn put(&self, id: &str, document: &serde_json::Value) -> Result<(), StoreError>;

    /// Fetch the document stored under `id`, or `None`.
    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Delete the document under `id`; returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// List all stored entity ids, in unspecified order.
    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;
}

//─────────────────────────────
//  Canonical hashing
//─────────────────────────────

/// SHA-256 of the canonical JSON serialization of `value`, lowercase hex.
///
/// `serde_json` maps are key-sorted, so any value round-tripped through
/// [`serde_json::Value`] serializes deterministically across runs and
/// processes. Callers hash the `Value` form, never raw request bytes.
pub fn canonical_sha256(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

//─────────────────────────────
//  Atomic file write
//─────────────────────────────

/// Write `contents` to `path` atomically: write a temp file in the same
/// directory, then rename it over the target.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let directory = path
        .parent()
        .ok_or_else(|| StoreError::Backend(format!("path '{}' has no parent", path.display())))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::Backend(format!("path '{}' has no file name", path.display())))?;
    let tmp = directory.join(format!(".{}.tmp", file_name.to_string_lossy()));

    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_hash_is_deterministic_across_key_order() {
        let a = json!({ "b": 2, "a": 1 });
        let b = json!({ "a": 1, "b": 2 });
        assert_eq!(canonical_sha256(&a), canonical_sha256(&b));
    }

    #[test]
    fn canonical_hash_distinguishes_values() {
        let a = json!({ "a": 1 });
        let b = json!({ "a": 2 });
        assert_ne!(canonical_sha256(&a), canonical_sha256(&b));
    }

    #[test]
    fn canonical_hash_of_null_matches_known_digest() {
        // sha256("null")
        assert_eq!(
            canonical_sha256(&serde_json::Value::Null),
            "74234e98afe7498fb5daf1f36ac2d78acc339464f950703b8c019892f982b90b"
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entity.json");

        atomic_write(&path, b"{\"v\":1}").await.unwrap();
        atomic_write(&path, b"{\"v\":2}").await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "{\"v\":2}");
        // No temp files left behind.
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["entity.json"]);
    }
}
