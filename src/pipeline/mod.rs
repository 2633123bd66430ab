// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Pipeline templates, binding and the dependency graph
//!
//! A [`PipelineTemplate`] declares named slots and a wiring function.
//! Instantiating it with step instances from a [`StepArena`] checks the
//! binding and yields a [`PipelineInstance`] that owns its DAG.

mod arena;
mod dag;
mod instance;
mod template;

pub use arena::{StepArena, StepArg, StepHandle};
pub use dag::{DependencyEdge, PipelineDag};
pub use instance::{PipelineInstance, PipelineState};
pub use template::{OutputRef, Outputs, PipelineTemplate, TemplateBuilder, Wiring, WiringFn};
