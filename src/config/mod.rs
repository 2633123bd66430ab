// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Configuration override documents and the merger
//!
//! An [`OverrideDocument`] maps slot names to per-step overrides. The
//! [`ConfigMerger`] layers it over what the instance already holds:
//! schema defaults, values given at invocation and earlier commits.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{StepflowError, StepflowResult};
use crate::pipeline::PipelineInstance;
use crate::stack::ComponentRole;
use crate::step::{is_capability_name, ResourceSettings, StepConfiguration, StepInstance};

/// Key under `parameters` that is lifted to the cache flag
const ENABLE_CACHE_KEY: &str = "enable_cache";

/// Overrides for a single step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepOverride {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_cache: Option<bool>,

    /// Shorthand for a `step_operator` capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_operator: Option<String>,

    /// Named components required per role
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities: BTreeMap<ComponentRole, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSettings>,
}

/// Per-slot overrides loaded from YAML, JSON or TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideDocument {
    #[serde(default)]
    pub steps: BTreeMap<String, StepOverride>,
}

impl OverrideDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add overrides for a slot
    pub fn step(mut self, slot: impl Into<String>, overrides: StepOverride) -> Self {
        self.steps.insert(slot.into(), overrides);
        self
    }

    /// Load a document, choosing the format by file extension. Anything
    /// that is not `.json` or `.toml` is read as YAML.
    pub fn from_file(path: &Path) -> StepflowResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StepflowError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn from_yaml(yaml: &str) -> StepflowResult<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    pub fn from_json(json: &str) -> StepflowResult<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }

    pub fn from_toml(content: &str) -> StepflowResult<Self> {
        toml::from_str(content).map_err(Into::into)
    }

    pub fn to_yaml(&self) -> StepflowResult<String> {
        serde_yaml::to_string(self).map_err(Into::into)
    }
}

/// Resolved configuration of every slot of an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResolvedConfiguration {
    steps: BTreeMap<String, StepConfiguration>,
}

impl ResolvedConfiguration {
    pub(crate) fn from_steps(
        steps: impl IntoIterator<Item = (String, StepConfiguration)>,
    ) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }

    pub fn get(&self, slot: &str) -> Option<&StepConfiguration> {
        self.steps.get(slot)
    }

    /// Slots in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepConfiguration)> {
        self.steps.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Layers override documents over an instance's configuration
pub struct ConfigMerger;

impl ConfigMerger {
    /// Resolve the configuration of every slot without changing the
    /// instance.
    ///
    /// Parameters given explicitly at invocation keep their value unless
    /// `overwrite_parameters` is set; the cache flag, capabilities and
    /// resources from the document always apply. Resolving the result again
    /// with the same document yields the same configuration.
    pub fn resolve(
        instance: &PipelineInstance,
        document: Option<&OverrideDocument>,
        overwrite_parameters: bool,
    ) -> StepflowResult<ResolvedConfiguration> {
        if let Some(document) = document {
            for slot in document.steps.keys() {
                if instance.step(slot).is_none() {
                    return Err(StepflowError::UnknownStep {
                        step: slot.clone(),
                        available: instance.slots().collect::<Vec<_>>().join(", "),
                    });
                }
            }
        }

        let mut resolved = BTreeMap::new();
        for (slot, step) in instance.steps() {
            let overrides = document.and_then(|d| d.steps.get(slot));
            let config = Self::resolve_step(slot, step, overrides, overwrite_parameters)?;
            resolved.insert(slot.to_string(), config);
        }

        Ok(ResolvedConfiguration { steps: resolved })
    }

    fn resolve_step(
        slot: &str,
        instance: &StepInstance,
        overrides: Option<&StepOverride>,
        overwrite_parameters: bool,
    ) -> StepflowResult<StepConfiguration> {
        let mut config = instance.configuration().clone();
        let schema = instance.step().parameter_schema();

        if let Some(overrides) = overrides {
            let mut parameters = overrides.parameters.clone();

            // Only lifted when the schema does not own a field of that name
            let declares_key = schema.is_some_and(|s| s.get(ENABLE_CACHE_KEY).is_some());
            if !declares_key {
                if let Some(value) = parameters.remove(ENABLE_CACHE_KEY) {
                    config.enable_cache = value.as_bool().ok_or_else(|| {
                        StepflowError::configuration(
                            slot,
                            format!("'{}' must be a boolean, got {}", ENABLE_CACHE_KEY, value),
                        )
                    })?;
                }
            }
            if let Some(enabled) = overrides.enable_cache {
                config.enable_cache = enabled;
            }

            let mut capabilities = overrides.capabilities.clone();
            if let Some(operator) = &overrides.step_operator {
                capabilities.insert(ComponentRole::StepOperator, operator.clone());
            }
            for (role, name) in capabilities {
                if !is_capability_name(&name) {
                    return Err(StepflowError::configuration(
                        slot,
                        format!("'{}' is not a valid {} name", name, role),
                    ));
                }
                config.capabilities.insert(role, name);
            }

            if let Some(resources) = &overrides.resources {
                config.resources = config.resources.merged_with(resources);
            }

            if !parameters.is_empty() {
                let Some(schema) = schema else {
                    return Err(StepflowError::configuration(
                        slot,
                        "step declares no parameters but the document sets some",
                    ));
                };
                schema.check_partial(slot, &parameters)?;

                for (field, value) in parameters {
                    if instance.is_explicit(&field) && !overwrite_parameters {
                        tracing::debug!(
                            slot = %slot,
                            field = %field,
                            "keeping explicit parameter value over override"
                        );
                        continue;
                    }
                    config.parameters.insert(field, value);
                }
            }
        }

        if let Some(schema) = schema {
            let completed = schema.complete(slot, &config.parameters)?;
            config.parameters = completed.as_map().clone();
        }

        Ok(config)
    }
}
