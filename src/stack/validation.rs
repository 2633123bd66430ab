// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Stack validation
//!
//! Checks a configured pipeline instance against a stack before dispatch.
//! Only statically declared requirements are checked here; components a
//! step asks for at run time are resolved through the run context.

use super::Stack;
use crate::errors::{StepflowError, StepflowResult};
use crate::pipeline::PipelineInstance;

/// Stack validator
pub struct StackValidator;

impl StackValidator {
    /// Validate every step's required capabilities against `stack`, using
    /// each step's current configuration
    pub fn validate(instance: &PipelineInstance, stack: &Stack) -> ValidationResult {
        let mut result = ValidationResult::new();

        for (slot, step) in instance.steps() {
            let config = step.configuration();

            for capability in config.required_capabilities() {
                match stack.get_component(capability.role, None) {
                    Some(component) if component.name == capability.name => {}
                    Some(component) => result.add_error(&format!(
                        "Step '{}' requires {} but the stack's {} is '{}'",
                        slot, capability, capability.role, component.name
                    )),
                    None => result.add_error(&format!(
                        "Step '{}' requires {} but the stack has no {}",
                        slot, capability, capability.role
                    )),
                }
            }

            if step.step().takes_context() && config.enable_cache {
                result.add_warning(&format!(
                    "Step '{}': Uses the run context with caching enabled. \
                     Cached results will not observe a different context.",
                    slot
                ));
            }

            if !config.resources.is_empty() && config.step_operator().is_none() {
                result.add_warning(&format!(
                    "Step '{}': Resource settings have no effect without a step operator",
                    slot
                ));
            }
        }

        tracing::debug!(
            pipeline = %instance.name(),
            stack = %stack.name(),
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "validated stack"
        );

        result
    }
}

/// Result of stack validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Turn errors into a [`StepflowError::StackValidation`]
    pub fn into_result(self, stack: &str) -> StepflowResult<Self> {
        if self.is_valid() {
            return Ok(self);
        }
        Err(
            StepflowError::stack_validation(stack, self.errors.join("; ")).with_help(
                "Register the missing component in the stack or change the step configuration",
            ),
        )
    }
}
