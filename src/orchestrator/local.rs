// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Local orchestrator
//!
//! Runs a pipeline instance in-process. Nodes run in waves: every node whose
//! upstream nodes all succeeded is ready, and ready nodes run concurrently on
//! a [`JoinSet`] up to `max_parallelism` at a time. A failed node blocks its
//! descendants only.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::{NodeResult, NodeState, Orchestrator, RunOptions, RunResult};
use crate::cache::{hash_value, CacheKey, CacheKeyComputer};
use crate::config::ResolvedConfiguration;
use crate::errors::{StepflowError, StepflowResult};
use crate::params::Parameters;
use crate::pipeline::PipelineInstance;
use crate::settings::Settings;
use crate::stack::Stack;
use crate::step::{RunContext, Step, StepConfiguration, StepInputs};
use crate::store::{
    ArtifactRef, ArtifactStore, FilesystemArtifactStore, FilesystemMetadataStore,
    InMemoryArtifactStore, InMemoryMetadataStore, MetadataStore, RecordStatus, RunRecord,
};

/// In-process orchestrator
pub struct LocalOrchestrator {
    metadata: Arc<dyn MetadataStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl LocalOrchestrator {
    pub fn new(metadata: Arc<dyn MetadataStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            metadata,
            artifacts,
        }
    }

    /// Orchestrator whose history lives only as long as it does
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryArtifactStore::new()),
        )
    }

    /// Orchestrator persisting history and artifacts below `root`
    pub fn on_disk(root: &Path) -> StepflowResult<Self> {
        Ok(Self::new(
            Arc::new(FilesystemMetadataStore::new(root.join("metadata"))?),
            Arc::new(FilesystemArtifactStore::new(root.join("artifacts"))?),
        ))
    }

    /// Orchestrator using the store root from project settings
    pub fn from_settings(settings: &Settings) -> StepflowResult<Self> {
        Self::on_disk(&settings.store_root)
    }

    pub fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn artifact_store(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Everything needed to run one node, computed once its upstream nodes
    /// are terminal
    fn prepare(
        pipeline: &PipelineInstance,
        config: &ResolvedConfiguration,
        keys: &CacheKeyComputer,
        nodes: &BTreeMap<String, NodeResult>,
        slot: &str,
    ) -> StepflowResult<PreparedNode> {
        let step = pipeline
            .step(slot)
            .map(|i| i.step().clone())
            .ok_or_else(|| StepflowError::StepFailed {
                step: slot.to_string(),
                message: "slot is not bound".into(),
            })?;
        let config = config.get(slot).cloned().ok_or_else(|| {
            StepflowError::configuration(slot, "no resolved configuration for this slot")
        })?;

        let params = match step.parameter_schema() {
            Some(schema) => schema.complete(slot, &config.parameters)?,
            None => Parameters::empty(),
        };

        let mut inputs = Vec::new();
        let mut upstream = BTreeMap::new();
        for edge in pipeline.upstream(slot) {
            let artifact = nodes
                .get(&edge.from)
                .and_then(|n| n.artifact(&edge.output))
                .cloned()
                .ok_or_else(|| StepflowError::StepFailed {
                    step: slot.to_string(),
                    message: format!("upstream output {}.{} is missing", edge.from, edge.output),
                })?;
            upstream.insert(edge.input.clone(), artifact.fingerprint.clone());
            inputs.push((edge.input, artifact));
        }

        let key = keys.fingerprint(&step, &config, &upstream);

        Ok(PreparedNode {
            slot: slot.to_string(),
            step,
            config,
            params,
            inputs,
            key,
        })
    }

    /// Artifacts of an earlier run with the same key, if they are all still
    /// present
    async fn cached(&self, node: &PreparedNode) -> Option<Vec<ArtifactRef>> {
        let refs = match self.metadata.lookup(&node.key).await {
            Ok(Some(refs)) => refs,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(slot = %node.slot, error = %e, "cache lookup failed");
                return None;
            }
        };

        for output in node.step.outputs() {
            let Some(artifact) = refs.iter().find(|r| r.output == output.name) else {
                return None;
            };
            if !matches!(self.artifacts.exists(&artifact.uri).await, Ok(true)) {
                tracing::debug!(
                    slot = %node.slot,
                    uri = %artifact.uri,
                    "cached artifact is gone; running step"
                );
                return None;
            }
        }

        Some(refs)
    }

    async fn record(
        &self,
        run_id: Uuid,
        pipeline: &str,
        slot: &str,
        node: &NodeResult,
        status: RecordStatus,
    ) {
        let Some(key) = node.cache_key.clone() else {
            return;
        };
        let record = RunRecord::new(key, run_id, pipeline, slot, node.artifacts.clone(), status);
        if let Err(e) = self.metadata.record(record).await {
            tracing::warn!(slot = %slot, error = %e, "failed to record run");
        }
    }
}

struct PreparedNode {
    slot: String,
    step: Step,
    config: StepConfiguration,
    params: Parameters,
    inputs: Vec<(String, ArtifactRef)>,
    key: CacheKey,
}

/// A node handed to a task
struct NodeTask {
    run_id: Uuid,
    pipeline: String,
    slot: String,
    step: Step,
    params: Parameters,
    inputs: Vec<(String, ArtifactRef)>,
    stack: Arc<Stack>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl NodeTask {
    async fn run(self) -> StepflowResult<Vec<ArtifactRef>> {
        let mut values = BTreeMap::new();
        for (input, artifact) in &self.inputs {
            values.insert(input.clone(), self.artifacts.load(&artifact.uri).await?);
        }

        let context = self.step.takes_context().then(|| {
            RunContext::new(
                self.run_id,
                self.pipeline.clone(),
                self.slot.clone(),
                Some(Arc::clone(&self.stack)),
            )
        });

        let outputs = self
            .step
            .body()
            .run(StepInputs::new(values, self.params.clone(), context))
            .await?;

        let mut produced: BTreeMap<String, Value> = outputs.into_values();
        let mut refs = Vec::with_capacity(self.step.outputs().len());

        for output in self.step.outputs() {
            let value = produced.remove(&output.name).ok_or_else(|| StepflowError::StepFailed {
                step: self.slot.clone(),
                message: format!("did not produce output '{}'", output.name),
            })?;
            let uri = self.artifacts.uri_for(self.run_id, &self.slot, &output.name);
            self.artifacts.save(&uri, &value).await?;
            refs.push(ArtifactRef {
                output: output.name.clone(),
                uri,
                type_name: output.type_name.clone(),
                fingerprint: hash_value(&value),
            });
        }

        if let Some(extra) = produced.keys().next() {
            return Err(StepflowError::StepFailed {
                step: self.slot.clone(),
                message: format!("produced undeclared output '{}'", extra),
            });
        }

        Ok(refs)
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    fn flavor(&self) -> &str {
        "local"
    }

    async fn execute(
        &self,
        pipeline: &PipelineInstance,
        config: &ResolvedConfiguration,
        stack: Arc<Stack>,
        options: &RunOptions,
    ) -> StepflowResult<RunResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let keys = CacheKeyComputer::for_stack(&stack);
        let dag = pipeline.dag();
        let order: Vec<String> = dag
            .topological_order()
            .into_iter()
            .map(String::from)
            .collect();
        let parallelism = options.max_parallelism.max(1);

        let mut nodes: BTreeMap<String, NodeResult> = order
            .iter()
            .map(|slot| (slot.clone(), NodeResult::with_state(NodeState::Pending)))
            .collect();

        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.name(),
            stack = %stack.name(),
            steps = order.len(),
            "starting run"
        );

        loop {
            // Topological order makes one pass enough to block transitively
            for slot in &order {
                if nodes[slot].state != NodeState::Pending {
                    continue;
                }
                let deps = dag.dependencies(slot).unwrap_or_default();
                let blocked = if deps.iter().any(|d| {
                    matches!(nodes[d].state, NodeState::Failed | NodeState::UpstreamFailed)
                }) {
                    Some(NodeState::UpstreamFailed)
                } else if deps.iter().any(|d| nodes[d].state == NodeState::Cancelled) {
                    Some(NodeState::Cancelled)
                } else {
                    None
                };
                if let Some(state) = blocked {
                    tracing::debug!(slot = %slot, state = %state, "node blocked");
                    if let Some(node) = nodes.get_mut(slot) {
                        node.state = state;
                    }
                }
            }

            let ready: Vec<String> = order
                .iter()
                .filter(|slot| nodes[*slot].state == NodeState::Pending)
                .filter(|slot| {
                    dag.dependencies(slot)
                        .unwrap_or_default()
                        .iter()
                        .all(|d| nodes[d].state.is_success())
                })
                .take(parallelism)
                .cloned()
                .collect();

            if ready.is_empty() {
                break;
            }

            if options.cancel.is_cancelled() {
                tracing::info!(run_id = %run_id, "run cancelled; remaining steps will not start");
                for node in nodes.values_mut() {
                    if node.state == NodeState::Pending {
                        node.state = NodeState::Cancelled;
                    }
                }
                break;
            }

            let mut tasks = JoinSet::new();

            for slot in ready {
                let prepared = match Self::prepare(pipeline, config, &keys, &nodes, &slot) {
                    Ok(prepared) => prepared,
                    Err(e) => {
                        tracing::warn!(slot = %slot, error = %e, "step could not be prepared");
                        if let Some(node) = nodes.get_mut(&slot) {
                            node.state = NodeState::Failed;
                            node.error_kind = Some(e.kind());
                            node.error = Some(e.to_string());
                        }
                        continue;
                    }
                };

                if prepared.config.enable_cache && !options.no_cache {
                    if let Some(refs) = self.cached(&prepared).await {
                        tracing::info!(slot = %slot, key = %prepared.key, "using cached result");
                        if let Some(node) = nodes.get_mut(&slot) {
                            node.state = NodeState::Skipped;
                            node.cache_key = Some(prepared.key.clone());
                            node.artifacts = refs;
                            self.record(run_id, pipeline.name(), &slot, node, RecordStatus::Cached)
                                .await;
                        }
                        continue;
                    }
                }

                if let Some(node) = nodes.get_mut(&slot) {
                    node.state = NodeState::Running;
                    node.cache_key = Some(prepared.key.clone());
                }

                tracing::debug!(slot = %slot, key = %prepared.key, "running step");

                let task = NodeTask {
                    run_id,
                    pipeline: pipeline.name().to_string(),
                    slot: slot.clone(),
                    step: prepared.step,
                    params: prepared.params,
                    inputs: prepared.inputs,
                    stack: Arc::clone(&stack),
                    artifacts: Arc::clone(&self.artifacts),
                };

                tasks.spawn(async move {
                    let started = Instant::now();
                    // Inner task so a panicking body still reports its slot
                    let outcome = match tokio::spawn(task.run()).await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(StepflowError::StepFailed {
                            step: slot.clone(),
                            message: format!("step task aborted: {}", e),
                        }),
                    };
                    (slot, outcome, started.elapsed())
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (slot, outcome, duration) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        tracing::warn!(error = %e, "step task failed to join");
                        continue;
                    }
                };
                let Some(node) = nodes.get_mut(&slot) else {
                    continue;
                };
                node.duration = duration;

                let status = match outcome {
                    Ok(artifacts) => {
                        tracing::info!(
                            slot = %slot,
                            duration_ms = duration.as_millis() as u64,
                            "step succeeded"
                        );
                        node.state = NodeState::Succeeded;
                        node.artifacts = artifacts;
                        RecordStatus::Completed
                    }
                    Err(e) => {
                        tracing::warn!(slot = %slot, error = %e, "step failed");
                        node.state = NodeState::Failed;
                        node.error_kind = Some(e.kind());
                        node.error = Some(e.to_string());
                        RecordStatus::Failed
                    }
                };
                self.record(run_id, pipeline.name(), &slot, node, status).await;
            }

            // Tasks lost to a join error
            for node in nodes.values_mut() {
                if node.state == NodeState::Running {
                    node.state = NodeState::Failed;
                    node.error = Some("step task did not complete".into());
                }
            }
        }

        let result = RunResult::new(
            run_id,
            pipeline,
            &stack,
            nodes,
            started_at,
            start.elapsed(),
        );

        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.name(),
            status = ?result.status,
            duration_ms = result.duration.as_millis() as u64,
            "run finished"
        );

        Ok(result)
    }
}

impl std::fmt::Debug for LocalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOrchestrator").finish_non_exhaustive()
    }
}
