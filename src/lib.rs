// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! # stepflow - Declarative Step Pipelines
//!
//! `stepflow` composes steps into a DAG, resolves their configuration from
//! layered sources and dispatches the run to an orchestrator on a stack of
//! backend components.
//!
//! ## Features
//!
//! - **Typed steps** - Declared inputs, outputs and parameter schemas
//! - **Pipeline templates** - Named slots wired into a dependency graph
//! - **Layered configuration** - Defaults, explicit values and override documents
//! - **Cache keys** - Deterministic fingerprints so unchanged steps are skipped
//! - **Stacks** - Backend components by role, validated before dispatch
//!
//! ## Lifecycle
//!
//! 1. Declare [`Step`]s with [`Step::builder`]
//! 2. Declare a [`PipelineTemplate`] with slots and a wiring function
//! 3. Invoke steps into a [`StepArena`] and instantiate the template
//! 4. Optionally apply an [`OverrideDocument`]
//! 5. [`PipelineInstance::run`] on a [`Stack`] with an [`Orchestrator`]

pub mod cache;
pub mod config;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod params;
pub mod pipeline;
pub mod settings;
pub mod stack;
pub mod step;
pub mod store;

// Re-export commonly used types
pub use config::{OverrideDocument, ResolvedConfiguration, StepOverride};
pub use errors::{ErrorKind, StepflowError, StepflowResult};
pub use orchestrator::{LocalOrchestrator, NodeState, Orchestrator, RunOptions, RunResult};
pub use params::{FieldSpec, ParamType, ParameterSchema, Parameters};
pub use pipeline::{PipelineInstance, PipelineTemplate, StepArena, StepArg};
pub use settings::Settings;
pub use stack::{ComponentRole, Stack, StackComponent, StackRegistry};
pub use step::{Step, StepInputs, StepOutputs};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
