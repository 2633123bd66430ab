// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Step bodies and what they receive at run time

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{StepflowError, StepflowResult};
use crate::params::Parameters;
use crate::stack::{ComponentRole, Stack, StackComponent};

/// The work a step performs
#[async_trait]
pub trait StepBody: Send + Sync {
    /// Run the step on its resolved inputs
    async fn run(&self, inputs: StepInputs) -> StepflowResult<StepOutputs>;
}

/// Adapter turning an async closure into a [`StepBody`]
pub struct FnBody<F> {
    f: F,
}

impl<F> FnBody<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> StepBody for FnBody<F>
where
    F: Fn(StepInputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepflowResult<StepOutputs>> + Send + 'static,
{
    async fn run(&self, inputs: StepInputs) -> StepflowResult<StepOutputs> {
        (self.f)(inputs).await
    }
}

/// Run context injected into steps that ask for it
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub pipeline: String,
    pub slot: String,
    stack: Option<Arc<Stack>>,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        pipeline: impl Into<String>,
        slot: impl Into<String>,
        stack: Option<Arc<Stack>>,
    ) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            slot: slot.into(),
            stack,
        }
    }

    /// The stack the run executes on
    pub fn stack(&self) -> StepflowResult<&Stack> {
        self.stack.as_deref().ok_or(StepflowError::NoActiveStack)
    }

    /// Component for a role the step needs at run time. Absence is only
    /// discovered here, when the step actually asks for it.
    pub fn component(&self, role: ComponentRole) -> StepflowResult<&StackComponent> {
        let stack = self.stack()?;
        stack.get_component(role, None).ok_or_else(|| {
            StepflowError::missing_component(
                role,
                format!(
                    "step '{}' needs a {} but stack '{}' has none",
                    self.slot,
                    role,
                    stack.name()
                ),
            )
        })
    }
}

/// Everything a step body receives
#[derive(Debug, Clone)]
pub struct StepInputs {
    artifacts: BTreeMap<String, Value>,
    params: Parameters,
    context: Option<RunContext>,
}

impl StepInputs {
    pub fn new(
        artifacts: BTreeMap<String, Value>,
        params: Parameters,
        context: Option<RunContext>,
    ) -> Self {
        Self {
            artifacts,
            params,
            context,
        }
    }

    /// Value of an artifact input
    pub fn artifact(&self, name: &str) -> StepflowResult<&Value> {
        self.artifacts.get(name).ok_or_else(|| StepflowError::StepFailed {
            step: self
                .context
                .as_ref()
                .map(|c| c.slot.clone())
                .unwrap_or_default(),
            message: format!("no input artifact named '{}'", name),
        })
    }

    /// Typed value of an artifact input
    pub fn artifact_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> StepflowResult<T> {
        serde_json::from_value(self.artifact(name)?.clone()).map_err(Into::into)
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// The run context, present only when the step declared it
    pub fn context(&self) -> Option<&RunContext> {
        self.context.as_ref()
    }
}

/// Values produced by a step, keyed by output name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutputs {
    values: BTreeMap<String, Value>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output value
    pub fn with(mut self, name: impl Into<String>, value: impl Serialize) -> StepflowResult<Self> {
        self.values
            .insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }
}
