// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Bound pipelines
//!
//! A [`PipelineInstance`] owns its step instances and the dependency graph
//! derived while binding them. The graph never changes; configuration can be
//! re-resolved and the instance can be run any number of times.

use std::sync::Arc;

use super::arena::{StepArena, StepHandle};
use super::dag::{DependencyEdge, PipelineDag};
use super::template::PipelineTemplate;
use crate::config::{ConfigMerger, OverrideDocument, ResolvedConfiguration};
use crate::errors::{StepflowError, StepflowResult};
use crate::orchestrator::{Orchestrator, RunOptions, RunResult};
use crate::stack::{Stack, StackRegistry, StackValidator};
use crate::step::StepInstance;

/// Lifecycle of a pipeline instance
///
/// The `Defined` stage is the [`PipelineTemplate`] itself: an instance only
/// exists once a template is instantiated, so it starts at `Instantiated`.
/// Running again re-enters at `Configured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Instantiated,
    Configured,
    Validated,
    Dispatched,
    Completed,
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Instantiated => "instantiated",
            Self::Configured => "configured",
            Self::Validated => "validated",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A template with every slot bound to a step instance
#[derive(Debug)]
pub struct PipelineInstance {
    template: PipelineTemplate,
    arena: StepArena,
    bindings: Vec<(String, StepHandle)>,
    dag: PipelineDag,
    state: PipelineState,
}

impl PipelineInstance {
    pub(crate) fn new(
        template: PipelineTemplate,
        arena: StepArena,
        bindings: Vec<(String, StepHandle)>,
        dag: PipelineDag,
    ) -> Self {
        Self {
            template,
            arena,
            bindings,
            dag,
            state: PipelineState::Instantiated,
        }
    }

    pub fn name(&self) -> &str {
        self.template.name()
    }

    pub fn template(&self) -> &PipelineTemplate {
        &self.template
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn dag(&self) -> &PipelineDag {
        &self.dag
    }

    /// Slot names in template order
    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|(slot, _)| slot.as_str())
    }

    /// Instance bound to a slot
    pub fn step(&self, slot: &str) -> Option<&StepInstance> {
        let (_, handle) = self.bindings.iter().find(|(s, _)| s == slot)?;
        self.arena.get(*handle)
    }

    /// All bound instances in template order
    pub fn steps(&self) -> impl Iterator<Item = (&str, &StepInstance)> {
        self.bindings
            .iter()
            .filter_map(|(slot, handle)| self.arena.get(*handle).map(|i| (slot.as_str(), i)))
    }

    /// Edges feeding a slot's inputs
    pub fn upstream(&self, slot: &str) -> Vec<DependencyEdge> {
        self.dag.incoming(slot)
    }

    /// Current configuration of every slot
    pub fn configuration(&self) -> ResolvedConfiguration {
        ResolvedConfiguration::from_steps(
            self.steps()
                .map(|(slot, instance)| (slot.to_string(), instance.configuration().clone())),
        )
    }

    /// Numbered execution order, one line per slot
    pub fn execution_plan(&self) -> String {
        self.dag.to_text(|slot| {
            self.step(slot)
                .map(|i| i.step().name().to_string())
                .unwrap_or_default()
        })
    }

    /// Resolve configuration against an optional override document and
    /// commit it. On error the instance is left untouched.
    pub fn configure(
        &mut self,
        document: Option<&OverrideDocument>,
        overwrite_parameters: bool,
    ) -> StepflowResult<()> {
        let resolved = ConfigMerger::resolve(self, document, overwrite_parameters)?;

        for (slot, handle) in &self.bindings {
            if let (Some(instance), Some(config)) = (self.arena.get_mut(*handle), resolved.get(slot)) {
                instance.set_configuration(config.clone());
            }
        }

        self.state = PipelineState::Configured;
        Ok(())
    }

    /// Builder-style [`configure`](Self::configure)
    pub fn with_config(
        mut self,
        document: &OverrideDocument,
        overwrite_parameters: bool,
    ) -> StepflowResult<Self> {
        self.configure(Some(document), overwrite_parameters)?;
        Ok(self)
    }

    /// Resolve, validate against `stack` and dispatch to `orchestrator`.
    ///
    /// Every error returned before dispatch leaves the stores untouched.
    /// Running the same instance again starts a fresh run.
    pub async fn run(
        &mut self,
        orchestrator: &dyn Orchestrator,
        stack: Arc<Stack>,
        options: &RunOptions,
    ) -> StepflowResult<RunResult> {
        self.configure(None, false)?;

        let report = StackValidator::validate(self, &stack);
        for warning in report.warnings() {
            tracing::warn!(pipeline = %self.name(), stack = %stack.name(), "{}", warning);
        }
        report.into_result(stack.name())?;

        let expected = &stack.orchestrator().flavor;
        if orchestrator.flavor() != expected {
            return Err(StepflowError::stack_validation(
                stack.name(),
                format!(
                    "orchestrator flavor '{}' cannot run a stack whose orchestrator is '{}'",
                    orchestrator.flavor(),
                    expected
                ),
            ));
        }
        self.state = PipelineState::Validated;

        if options.cancel.is_cancelled() {
            tracing::info!(pipeline = %self.name(), "run cancelled before dispatch");
            return Ok(RunResult::cancelled(self, &stack));
        }

        self.state = PipelineState::Dispatched;
        let config = self.configuration();
        tracing::info!(pipeline = %self.name(), stack = %stack.name(), "dispatching run");

        let result = orchestrator.execute(self, &config, stack, options).await;
        self.state = match &result {
            Ok(run) if run.is_success() => PipelineState::Completed,
            _ => PipelineState::Failed,
        };
        result
    }

    /// [`run`](Self::run) on the registry's active stack
    pub async fn run_on_active(
        &mut self,
        orchestrator: &dyn Orchestrator,
        registry: &StackRegistry,
        options: &RunOptions,
    ) -> StepflowResult<RunResult> {
        let stack = registry.active_stack()?;
        self.run(orchestrator, stack, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{LocalOrchestrator, NodeState, RunStatus};
    use crate::pipeline::tests::{consumer, producer, two_step_template};
    use crate::pipeline::StepArena;
    use crate::stack::{ComponentRole, StackComponent};

    fn instance() -> PipelineInstance {
        let mut arena = StepArena::new();
        let p = arena.invoke(&producer()).unwrap();
        let c = arena.add(consumer().invocation().param("factor", 2)).unwrap();
        two_step_template()
            .instantiate(arena, vec![p.into(), c.into()], vec![])
            .unwrap()
    }

    #[test]
    fn test_accessors() {
        let pipeline = instance();

        assert_eq!(pipeline.name(), "training");
        assert_eq!(pipeline.state(), PipelineState::Instantiated);
        assert_eq!(pipeline.slots().collect::<Vec<_>>(), vec!["load", "train"]);
        assert_eq!(pipeline.step("train").unwrap().step().name(), "consumer");
        assert!(pipeline.step("missing").is_none());
        assert_eq!(pipeline.upstream("train")[0].from, "load");
        assert!(pipeline.execution_plan().contains("2. train (consumer) [depends: load]"));
    }

    #[test]
    fn test_state_follows_lifecycle() {
        let mut pipeline = instance();
        assert_eq!(pipeline.state().to_string(), "instantiated");

        pipeline.configure(None, false).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Configured);
        assert_eq!(pipeline.state().to_string(), "configured");
    }

    #[tokio::test]
    async fn test_run_twice_gives_independent_results() {
        let mut pipeline = instance();
        let orchestrator = LocalOrchestrator::in_memory();
        let stack = Arc::new(Stack::local("default"));
        let options = RunOptions::default().no_cache();

        let first = pipeline
            .run(&orchestrator, Arc::clone(&stack), &options)
            .await
            .unwrap();
        let order_before = pipeline.dag().topological_order().join(",");
        let second = pipeline.run(&orchestrator, stack, &options).await.unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert!(first.is_success() && second.is_success());
        assert_eq!(pipeline.dag().topological_order().join(","), order_before);
        assert_eq!(pipeline.state(), PipelineState::Completed);
    }

    #[tokio::test]
    async fn test_orchestrator_flavor_must_match_stack() {
        let mut pipeline = instance();
        let stack = Stack::local("remote")
            .with_component(StackComponent::new(ComponentRole::Orchestrator, "vertex", "vertex"));

        let err = pipeline
            .run(&LocalOrchestrator::in_memory(), Arc::new(stack), &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::StackValidation { .. }));
        assert_ne!(pipeline.state(), PipelineState::Dispatched);
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_runs_nothing() {
        let mut pipeline = instance();
        let orchestrator = LocalOrchestrator::in_memory();
        let options = RunOptions::default();
        options.cancel.cancel();

        let result = pipeline
            .run(&orchestrator, Arc::new(Stack::local("default")), &options)
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.nodes.values().all(|n| n.state == NodeState::Cancelled));
        assert!(orchestrator
            .metadata_store()
            .run_records(result.run_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_run_on_active_requires_stack() {
        let mut pipeline = instance();
        let registry = StackRegistry::new();

        let err = pipeline
            .run_on_active(&LocalOrchestrator::in_memory(), &registry, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::NoActiveStack));

        registry.register(Stack::local("default"));
        registry.set_active("default").unwrap();
        let result = pipeline
            .run_on_active(&LocalOrchestrator::in_memory(), &registry, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stack, "default");
    }
}
