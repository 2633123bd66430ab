// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Filesystem-based stores
//!
//! Run records are JSON files grouped in one directory per cache key;
//! artifacts are JSON files at their URI below the store root.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use super::{latest_completed, ArtifactRef, ArtifactStore, MetadataStore, RunRecord};
use crate::cache::CacheKey;
use crate::errors::{StepflowError, StepflowResult};

fn store_error(context: &str, e: impl std::fmt::Display) -> StepflowError {
    StepflowError::Store {
        message: format!("{}: {}", context, e),
    }
}

/// Store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of run records
    pub entries: usize,
    /// Total size in bytes
    pub size_bytes: u64,
}

impl StoreStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.2} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }
}

/// Filesystem-based metadata store
#[derive(Debug, Clone)]
pub struct FilesystemMetadataStore {
    root: PathBuf,
}

impl FilesystemMetadataStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: PathBuf) -> StepflowResult<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .map_err(|e| store_error("Failed to create metadata directory", e))?;
        }
        Ok(Self { root })
    }

    /// Directory holding the records of one key. Only lowercase hex
    /// digests are accepted, so a key never leaves the store root.
    fn key_dir(&self, key: &CacheKey) -> StepflowResult<PathBuf> {
        let key = key.as_str();
        let is_digest =
            key.len() > 2 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !is_digest {
            return Err(StepflowError::Store {
                message: format!("cache key '{}' is not a hex digest", key),
            });
        }
        // Use first 2 chars as directory for better filesystem performance
        let (prefix, rest) = key.split_at(2);
        Ok(self.root.join(prefix).join(rest))
    }

    fn record_path(&self, record: &RunRecord) -> StepflowResult<PathBuf> {
        Ok(self
            .key_dir(&record.cache_key)?
            .join(format!("{}_{}.json", record.run_id, record.slot)))
    }

    /// Read every record file below `dir`
    async fn read_records(dir: &Path) -> StepflowResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        if !dir.exists() {
            return Ok(records);
        }

        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|e| store_error("Failed to read metadata directory", e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| store_error("Failed to read metadata entry", e))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }

                // Unreadable entries are skipped rather than failing the lookup
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => match serde_json::from_str::<RunRecord>(&content) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "skipping corrupt run record")
                        }
                    },
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run record")
                    }
                }
            }
        }

        Ok(records)
    }

    /// Count records and bytes on disk
    pub async fn stats(&self) -> StepflowResult<StoreStats> {
        let entries = Self::read_records(&self.root).await?.len();
        let size_bytes = if self.root.exists() {
            dir_size(&self.root)?
        } else {
            0
        };
        Ok(StoreStats {
            entries,
            size_bytes,
        })
    }
}

#[async_trait]
impl MetadataStore for FilesystemMetadataStore {
    async fn lookup(&self, key: &CacheKey) -> StepflowResult<Option<Vec<ArtifactRef>>> {
        let records = Self::read_records(&self.key_dir(key)?).await?;
        Ok(latest_completed(records.iter().filter(|r| &r.cache_key == key))
            .map(|r| r.artifacts.clone()))
    }

    async fn record(&self, record: RunRecord) -> StepflowResult<()> {
        let path = self.record_path(&record)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_error("Failed to create metadata directory", e))?;
        }

        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| store_error("Failed to serialize run record", e))?;

        tokio::fs::write(&path, json)
            .await
            .map_err(|e| store_error("Failed to write run record", e))
    }

    async fn run_records(&self, run_id: Uuid) -> StepflowResult<Vec<RunRecord>> {
        let records = Self::read_records(&self.root).await?;
        Ok(records.into_iter().filter(|r| r.run_id == run_id).collect())
    }

    async fn records(&self) -> StepflowResult<Vec<RunRecord>> {
        let mut records = Self::read_records(&self.root).await?;
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn clear(&self) -> StepflowResult<()> {
        if self.root.exists() {
            tokio::fs::remove_dir_all(&self.root)
                .await
                .map_err(|e| store_error("Failed to clear metadata store", e))?;

            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| store_error("Failed to recreate metadata directory", e))?;
        }

        Ok(())
    }
}

/// Filesystem-based artifact store
#[derive(Debug, Clone)]
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: PathBuf) -> StepflowResult<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .map_err(|e| store_error("Failed to create artifact directory", e))?;
        }
        Ok(Self { root })
    }

    /// Resolve a URI below the root. URIs may not escape it.
    fn path_for(&self, uri: &str) -> StepflowResult<PathBuf> {
        let relative = Path::new(uri);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StepflowError::Store {
                message: format!("artifact URI '{}' must be a relative path", uri),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn save(&self, uri: &str, value: &Value) -> StepflowResult<()> {
        let path = self.path_for(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_error("Failed to create artifact directory", e))?;
        }
        let json = serde_json::to_vec(value)
            .map_err(|e| store_error("Failed to serialize artifact", e))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| store_error("Failed to write artifact", e))
    }

    async fn load(&self, uri: &str) -> StepflowResult<Value> {
        let path = self.path_for(uri)?;
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| store_error(&format!("Failed to read artifact '{}'", uri), e))?;
        serde_json::from_slice(&content).map_err(|e| store_error("Failed to parse artifact", e))
    }

    async fn exists(&self, uri: &str) -> StepflowResult<bool> {
        Ok(self.path_for(uri)?.exists())
    }
}

/// Calculate directory size recursively
fn dir_size(path: &Path) -> StepflowResult<u64> {
    let mut size = 0;

    if path.is_file() {
        return Ok(path.metadata().map(|m| m.len()).unwrap_or(0));
    }

    for entry in std::fs::read_dir(path).map_err(|e| store_error("Failed to read directory", e))? {
        let entry = entry.map_err(|e| store_error("Failed to read entry", e))?;

        let path = entry.path();
        if path.is_dir() {
            size += dir_size(&path)?;
        } else {
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(key: &str, run_id: Uuid, status: RecordStatus) -> RunRecord {
        RunRecord::new(
            CacheKey::from(key.to_string()),
            run_id,
            "pipeline",
            "trainer",
            vec![ArtifactRef {
                output: "model".into(),
                uri: format!("runs/{}/trainer/model.json", run_id),
                type_name: "Model".into(),
                fingerprint: "abc".into(),
            }],
            status,
        )
    }

    #[tokio::test]
    async fn test_record_and_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemMetadataStore::new(temp_dir.path().to_path_buf()).unwrap();
        let key = CacheKey::from("deadbeef".to_string());
        let run = Uuid::new_v4();

        assert!(store.lookup(&key).await.unwrap().is_none());

        store
            .record(record("deadbeef", run, RecordStatus::Completed))
            .await
            .unwrap();

        let found = store.lookup(&key).await.unwrap().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].output, "model");
        assert_eq!(store.run_records(run).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_records_are_not_hits() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemMetadataStore::new(temp_dir.path().to_path_buf()).unwrap();

        store
            .record(record("feedface", Uuid::new_v4(), RecordStatus::Failed))
            .await
            .unwrap();

        let key = CacheKey::from("feedface".to_string());
        assert!(store.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemMetadataStore::new(temp_dir.path().to_path_buf()).unwrap();

        store
            .record(record("cafebabe", Uuid::new_v4(), RecordStatus::Completed))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert!(stats.size_bytes > 0);

        store.clear().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_artifact_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(temp_dir.path().to_path_buf()).unwrap();
        let uri = store.uri_for(Uuid::new_v4(), "loader", "data");

        store.save(&uri, &json!([1, 2, 3])).await.unwrap();
        assert!(store.exists(&uri).await.unwrap());
        assert_eq!(store.load(&uri).await.unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_artifact_uri_cannot_escape_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(temp_dir.path().join("artifacts")).unwrap();

        assert!(store.save("../outside.json", &json!(1)).await.is_err());
        assert!(store.load("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_metadata_key_cannot_escape_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemMetadataStore::new(temp_dir.path().join("metadata")).unwrap();
        let outside = temp_dir.path().join("outside");
        let escaping = format!("..{}", outside.display());

        assert!(store
            .record(record(&escaping, Uuid::new_v4(), RecordStatus::Completed))
            .await
            .is_err());
        assert!(!outside.exists());
        assert!(store
            .lookup(&CacheKey::from(escaping))
            .await
            .is_err());

        // Multi-byte characters are refused, not split
        assert!(store.lookup(&CacheKey::from("aé".to_string())).await.is_err());
        assert!(store.lookup(&CacheKey::from("AB12".to_string())).await.is_err());
        assert_eq!(store.stats().await.unwrap().entries, 0);
    }

    #[test]
    fn test_formatted_size() {
        let stats = StoreStats {
            entries: 1,
            size_bytes: 2048,
        };
        assert_eq!(stats.formatted_size(), "2.00 KB");
    }
}
