// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! In-memory stores

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{latest_completed, ArtifactRef, ArtifactStore, MetadataStore, RunRecord};
use crate::cache::CacheKey;
use crate::errors::{StepflowError, StepflowResult};

/// Metadata store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<Vec<RunRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn lookup(&self, key: &CacheKey) -> StepflowResult<Option<Vec<ArtifactRef>>> {
        let records = self.records.read().await;
        Ok(latest_completed(records.iter().filter(|r| &r.cache_key == key))
            .map(|r| r.artifacts.clone()))
    }

    async fn record(&self, record: RunRecord) -> StepflowResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn run_records(&self, run_id: Uuid) -> StepflowResult<Vec<RunRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| r.run_id == run_id).cloned().collect())
    }

    async fn records(&self) -> StepflowResult<Vec<RunRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn clear(&self) -> StepflowResult<()> {
        self.records.write().await.clear();
        Ok(())
    }
}

/// Artifact store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an artifact, e.g. to simulate external deletion
    pub async fn remove(&self, uri: &str) {
        self.values.write().await.remove(uri);
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save(&self, uri: &str, value: &Value) -> StepflowResult<()> {
        self.values
            .write()
            .await
            .insert(uri.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, uri: &str) -> StepflowResult<Value> {
        self.values
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| StepflowError::Store {
                message: format!("artifact '{}' not found", uri),
            })
    }

    async fn exists(&self, uri: &str) -> StepflowResult<bool> {
        Ok(self.values.read().await.contains_key(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStatus;
    use serde_json::json;

    fn artifact(uri: &str) -> ArtifactRef {
        ArtifactRef {
            output: "out".into(),
            uri: uri.into(),
            type_name: "int".into(),
            fingerprint: "f".into(),
        }
    }

    #[tokio::test]
    async fn test_lookup_only_completed() {
        let store = InMemoryMetadataStore::new();
        let key = CacheKey::from("k".to_string());
        let run = Uuid::new_v4();

        store
            .record(RunRecord::new(key.clone(), run, "p", "s", vec![], RecordStatus::Failed))
            .await
            .unwrap();
        assert!(store.lookup(&key).await.unwrap().is_none());

        store
            .record(RunRecord::new(
                key.clone(),
                run,
                "p",
                "s",
                vec![artifact("a")],
                RecordStatus::Completed,
            ))
            .await
            .unwrap();
        assert_eq!(store.lookup(&key).await.unwrap(), Some(vec![artifact("a")]));
        assert_eq!(store.run_records(run).await.unwrap().len(), 2);

        store.clear().await.unwrap();
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_artifact_round_trip() {
        let store = InMemoryArtifactStore::new();
        let uri = store.uri_for(Uuid::nil(), "trainer", "model");

        assert!(!store.exists(&uri).await.unwrap());
        store.save(&uri, &json!({"w": [1, 2]})).await.unwrap();
        assert_eq!(store.load(&uri).await.unwrap(), json!({"w": [1, 2]}));

        store.remove(&uri).await;
        assert!(store.load(&uri).await.is_err());
    }
}
