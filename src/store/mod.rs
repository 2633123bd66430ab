// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Metadata and artifact stores
//!
//! The metadata store keeps run history keyed by cache key; the artifact
//! store keeps the values steps produce. Both are consumed through traits so
//! any backend can sit behind them. In-memory and filesystem implementations
//! back the local stack.

mod filesystem;
mod memory;

pub use filesystem::{FilesystemArtifactStore, FilesystemMetadataStore, StoreStats};
pub use memory::{InMemoryArtifactStore, InMemoryMetadataStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::errors::StepflowResult;

/// Reference to a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Output name on the producing step
    pub output: String,
    pub uri: String,
    pub type_name: String,
    /// Digest of the artifact's canonical JSON value
    pub fingerprint: String,
}

/// Outcome recorded for one node of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Completed,
    Failed,
    Cached,
}

/// One entry of run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub cache_key: CacheKey,
    pub run_id: Uuid,
    pub pipeline: String,
    pub slot: String,
    pub artifacts: Vec<ArtifactRef>,
    pub status: RecordStatus,
    pub recorded_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        cache_key: CacheKey,
        run_id: Uuid,
        pipeline: impl Into<String>,
        slot: impl Into<String>,
        artifacts: Vec<ArtifactRef>,
        status: RecordStatus,
    ) -> Self {
        Self {
            cache_key,
            run_id,
            pipeline: pipeline.into(),
            slot: slot.into(),
            artifacts,
            status,
            recorded_at: Utc::now(),
        }
    }
}

/// Run history keyed by cache key
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Artifacts of the latest completed run with this key
    async fn lookup(&self, key: &CacheKey) -> StepflowResult<Option<Vec<ArtifactRef>>>;

    /// Append a record
    async fn record(&self, record: RunRecord) -> StepflowResult<()>;

    /// All records of one run
    async fn run_records(&self, run_id: Uuid) -> StepflowResult<Vec<RunRecord>>;

    /// Entire history, oldest first
    async fn records(&self) -> StepflowResult<Vec<RunRecord>>;

    /// Drop all history
    async fn clear(&self) -> StepflowResult<()>;
}

/// Storage for artifact values
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// URI for an output of a step in a run
    fn uri_for(&self, run_id: Uuid, slot: &str, output: &str) -> String {
        format!("runs/{}/{}/{}.json", run_id, slot, output)
    }

    async fn save(&self, uri: &str, value: &Value) -> StepflowResult<()>;

    async fn load(&self, uri: &str) -> StepflowResult<Value>;

    async fn exists(&self, uri: &str) -> StepflowResult<bool>;
}

/// Pick the newest completed record from a set
pub(crate) fn latest_completed<'a>(
    records: impl Iterator<Item = &'a RunRecord>,
) -> Option<&'a RunRecord> {
    records
        .filter(|r| r.status == RecordStatus::Completed)
        .max_by_key(|r| r.recorded_at)
}
