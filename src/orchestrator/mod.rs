// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Orchestrators
//!
//! An [`Orchestrator`] executes a validated, configured pipeline instance on
//! a stack. Its `flavor` must match the flavor of the stack's orchestrator
//! component; [`PipelineInstance::run`] checks this before dispatch.

mod local;

pub use local::LocalOrchestrator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::config::ResolvedConfiguration;
use crate::errors::{ErrorKind, StepflowResult};
use crate::pipeline::PipelineInstance;
use crate::settings::Settings;
use crate::stack::Stack;
use crate::store::ArtifactRef;

/// Executes pipeline instances
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Backend implementation name, e.g. `local`
    fn flavor(&self) -> &str;

    /// Run every node of `pipeline` with its resolved configuration
    async fn execute(
        &self,
        pipeline: &PipelineInstance,
        config: &ResolvedConfiguration,
        stack: Arc<Stack>,
        options: &RunOptions,
    ) -> StepflowResult<RunResult>;
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Nodes already running finish on their own.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run options
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Skip cache lookups (results are still recorded)
    pub no_cache: bool,
    /// Upper bound on nodes running at once
    pub max_parallelism: usize,
    pub cancel: CancelFlag,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            no_cache: false,
            max_parallelism: default_parallelism(),
            cancel: CancelFlag::new(),
        }
    }
}

impl RunOptions {
    /// Options taken from project settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            no_cache: !settings.enable_cache,
            max_parallelism: settings.max_parallelism.max(1),
            ..Self::default()
        }
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn max_parallelism(mut self, n: usize) -> Self {
        self.max_parallelism = n.max(1);
        self
    }

    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }
}

pub(crate) fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// State of one node in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Running,
    /// Cache hit; earlier artifacts reused
    Skipped,
    Succeeded,
    Failed,
    /// Not run because a node it depends on failed
    UpstreamFailed,
    /// Not started because the run was cancelled
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether downstream nodes may consume this node's artifacts
    pub fn is_success(self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Skipped => "skipped",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::UpstreamFailed => "upstream_failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one node
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub state: NodeState,
    /// Cache key the node ran (or was skipped) under
    pub cache_key: Option<CacheKey>,
    pub artifacts: Vec<ArtifactRef>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub duration: Duration,
}

impl NodeResult {
    pub(crate) fn with_state(state: NodeState) -> Self {
        Self {
            state,
            cache_key: None,
            artifacts: Vec::new(),
            error: None,
            error_kind: None,
            duration: Duration::ZERO,
        }
    }

    pub fn artifact(&self, output: &str) -> Option<&ArtifactRef> {
        self.artifacts.iter().find(|a| a.output == output)
    }
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Result of executing a pipeline instance
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub pipeline: String,
    pub stack: String,
    pub status: RunStatus,
    /// Node outcomes keyed by slot
    pub nodes: BTreeMap<String, NodeResult>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl RunResult {
    pub(crate) fn new(
        run_id: Uuid,
        pipeline: &PipelineInstance,
        stack: &Stack,
        nodes: BTreeMap<String, NodeResult>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let status = if nodes
            .values()
            .any(|n| matches!(n.state, NodeState::Failed | NodeState::UpstreamFailed))
        {
            RunStatus::Failed
        } else if nodes.values().any(|n| n.state == NodeState::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        Self {
            run_id,
            pipeline: pipeline.name().to_string(),
            stack: stack.name().to_string(),
            status,
            nodes,
            started_at,
            duration,
        }
    }

    /// A run cancelled before dispatch: every node is `Cancelled`
    pub(crate) fn cancelled(pipeline: &PipelineInstance, stack: &Stack) -> Self {
        let nodes = pipeline
            .slots()
            .map(|slot| (slot.to_string(), NodeResult::with_state(NodeState::Cancelled)))
            .collect();
        Self::new(Uuid::new_v4(), pipeline, stack, nodes, Utc::now(), Duration::ZERO)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn node(&self, slot: &str) -> Option<&NodeResult> {
        self.nodes.get(slot)
    }

    /// Number of nodes in `state`
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_predicates() {
        assert!(NodeState::Skipped.is_success());
        assert!(NodeState::Succeeded.is_success());
        assert!(!NodeState::UpstreamFailed.is_success());
        assert!(!NodeState::Running.is_terminal());
        assert!(NodeState::Cancelled.is_terminal());
        assert_eq!(NodeState::UpstreamFailed.to_string(), "upstream_failed");
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let options = RunOptions::default().max_parallelism(0);
        let flag = options.cancel.clone();

        assert_eq!(options.max_parallelism, 1);
        assert!(!options.cancel.is_cancelled());
        flag.cancel();
        assert!(options.cancel.is_cancelled());
    }

    #[test]
    fn test_options_from_settings() {
        let settings = Settings {
            enable_cache: false,
            max_parallelism: 2,
            ..Settings::default()
        };
        let options = RunOptions::from_settings(&settings);

        assert!(options.no_cache);
        assert_eq!(options.max_parallelism, 2);
    }
}
