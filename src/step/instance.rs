// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Step invocations and their runtime configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{is_capability_name, Step};
use crate::errors::{StepflowError, StepflowResult};
use crate::stack::ComponentRole;

/// Compute resources requested by a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    /// Memory with unit suffix, e.g. `4GB`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceSettings {
    /// Overlay the fields set in `other`
    pub fn merged_with(&self, other: &ResourceSettings) -> ResourceSettings {
        ResourceSettings {
            cpu_count: other.cpu_count.or(self.cpu_count),
            gpu_count: other.gpu_count.or(self.gpu_count),
            memory: other.memory.clone().or_else(|| self.memory.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_count.is_none() && self.gpu_count.is_none() && self.memory.is_none()
    }
}

/// A named component a step needs from the stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub role: ComponentRole,
    pub name: String,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}'", self.role, self.name)
    }
}

/// Runtime configuration of a step instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfiguration {
    pub parameters: BTreeMap<String, Value>,
    pub enable_cache: bool,
    #[serde(default)]
    pub capabilities: BTreeMap<ComponentRole, String>,
    #[serde(default)]
    pub resources: ResourceSettings,
}

impl StepConfiguration {
    pub fn step_operator(&self) -> Option<&str> {
        self.capabilities
            .get(&ComponentRole::StepOperator)
            .map(String::as_str)
    }

    /// Required components as capabilities
    pub fn required_capabilities(&self) -> Vec<Capability> {
        self.capabilities
            .iter()
            .map(|(role, name)| Capability {
                role: *role,
                name: name.clone(),
            })
            .collect()
    }
}

/// An invocation of a step, before it is added to an arena
#[derive(Debug, Clone)]
pub struct StepInvocation {
    step: Step,
    explicit: BTreeMap<String, Value>,
    enable_cache: Option<bool>,
    capabilities: BTreeMap<ComponentRole, String>,
    resources: Option<ResourceSettings>,
}

impl StepInvocation {
    pub(crate) fn new(step: Step) -> Self {
        Self {
            step,
            explicit: BTreeMap::new(),
            enable_cache: None,
            capabilities: BTreeMap::new(),
            resources: None,
        }
    }

    /// Set a parameter explicitly
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.explicit.insert(name.into(), value.into());
        self
    }

    /// Set several parameters explicitly
    pub fn params<I, K>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.explicit
            .extend(values.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = Some(enabled);
        self
    }

    pub fn step_operator(mut self, name: impl Into<String>) -> Self {
        self.capabilities
            .insert(ComponentRole::StepOperator, name.into());
        self
    }

    pub fn resources(mut self, resources: ResourceSettings) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    /// Check the explicit values and produce the instance.
    ///
    /// Rejected values are configuration errors, not definition errors: the
    /// step declaration is sound, only a value layered onto it is not. The
    /// reason starts with `invocation:` so these errors can be told apart
    /// from the same problem in an override document.
    pub(crate) fn into_instance(self) -> StepflowResult<StepInstance> {
        let name = self.step.name().to_string();

        match self.step.parameter_schema() {
            Some(schema) => schema
                .check_partial(&name, &self.explicit)
                .map_err(from_invocation)?,
            None if !self.explicit.is_empty() => {
                return Err(StepflowError::configuration(
                    &name,
                    "invocation: step declares no parameters but values were supplied",
                ));
            }
            None => {}
        }

        for (role, component) in &self.capabilities {
            if !is_capability_name(component) {
                return Err(StepflowError::definition(
                    &name,
                    format!("'{}' is not a valid {} name", component, role),
                ));
            }
        }

        let mut configuration = self.step.default_configuration();
        configuration.parameters = self.explicit.clone();
        if let Some(enabled) = self.enable_cache {
            configuration.enable_cache = enabled;
        }
        configuration.capabilities.extend(self.capabilities);
        if let Some(resources) = &self.resources {
            configuration.resources = configuration.resources.merged_with(resources);
        }

        Ok(StepInstance {
            step: self.step,
            explicit: self.explicit,
            configuration,
            slot_name: None,
        })
    }
}

fn from_invocation(error: StepflowError) -> StepflowError {
    match error {
        StepflowError::Configuration { step, reason, help } => StepflowError::Configuration {
            step,
            reason: format!("invocation: {}", reason),
            help,
        },
        other => other,
    }
}

/// A step instance owned by a pipeline arena
#[derive(Debug, Clone)]
pub struct StepInstance {
    step: Step,
    explicit: BTreeMap<String, Value>,
    configuration: StepConfiguration,
    slot_name: Option<String>,
}

impl StepInstance {
    pub fn step(&self) -> &Step {
        &self.step
    }

    /// Parameter values given when the step was invoked
    pub fn explicit_parameters(&self) -> &BTreeMap<String, Value> {
        &self.explicit
    }

    pub fn is_explicit(&self, field: &str) -> bool {
        self.explicit.contains_key(field)
    }

    pub fn configuration(&self) -> &StepConfiguration {
        &self.configuration
    }

    pub fn enable_cache(&self) -> bool {
        self.configuration.enable_cache
    }

    /// Template slot this instance is bound to
    pub fn slot_name(&self) -> Option<&str> {
        self.slot_name.as_deref()
    }

    pub(crate) fn set_slot_name(&mut self, slot: &str) {
        self.slot_name = Some(slot.to_string());
    }

    pub(crate) fn set_configuration(&mut self, configuration: StepConfiguration) {
        self.configuration = configuration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{FieldSpec, ParamType, ParameterSchema};
    use crate::step::StepOutputs;
    use serde_json::json;

    fn step_with_value() -> Step {
        Step::builder("step_with_params")
            .parameters(ParameterSchema::new("Params").field(FieldSpec::new("value", ParamType::Int)))
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap()
    }

    #[test]
    fn test_invocation_records_explicit_values() {
        let instance = step_with_value()
            .invocation()
            .param("value", 0)
            .into_instance()
            .unwrap();

        assert!(instance.is_explicit("value"));
        assert_eq!(instance.configuration().parameters["value"], json!(0));
        assert!(instance.enable_cache());
        assert!(instance.slot_name().is_none());
    }

    #[test]
    fn test_invocation_rejects_unknown_parameter() {
        let result = step_with_value()
            .invocation()
            .param("other", 1)
            .into_instance();
        match result {
            Err(StepflowError::Configuration { reason, help, .. }) => {
                assert_eq!(reason, "invocation: unknown parameter 'other'");
                assert!(help.unwrap().contains("value"));
            }
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_invocation_overrides_defaults() {
        let instance = step_with_value()
            .invocation()
            .enable_cache(false)
            .step_operator("vertex")
            .resources(ResourceSettings {
                cpu_count: Some(2.0),
                ..Default::default()
            })
            .into_instance()
            .unwrap();

        let config = instance.configuration();
        assert!(!config.enable_cache);
        assert_eq!(config.step_operator(), Some("vertex"));
        assert_eq!(config.resources.cpu_count, Some(2.0));
    }

    #[test]
    fn test_resources_merge() {
        let base = ResourceSettings {
            cpu_count: Some(1.0),
            memory: Some("1GB".into()),
            ..Default::default()
        };
        let merged = base.merged_with(&ResourceSettings {
            memory: Some("4GB".into()),
            ..Default::default()
        });
        assert_eq!(merged.cpu_count, Some(1.0));
        assert_eq!(merged.memory.as_deref(), Some("4GB"));
    }
}
