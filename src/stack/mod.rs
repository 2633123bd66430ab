// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Stacks of backend components
//!
//! A [`Stack`] holds exactly one component for each mandatory role
//! (orchestrator, artifact store, metadata store) and at most one for each
//! optional role. Components are descriptors only: the code that talks to a
//! backend lives outside this crate and is selected by `flavor`.

mod registry;
mod validation;

pub use registry::StackRegistry;
pub use validation::{StackValidator, ValidationResult};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cache::canonical_json;
use crate::errors::{StepflowError, StepflowResult};

/// Role a component plays in a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentRole {
    Orchestrator,
    ArtifactStore,
    MetadataStore,
    StepOperator,
    SecretsManager,
    FeatureStore,
    ModelDeployer,
}

impl ComponentRole {
    pub const MANDATORY: [ComponentRole; 3] = [
        ComponentRole::Orchestrator,
        ComponentRole::ArtifactStore,
        ComponentRole::MetadataStore,
    ];

    /// Whether every stack must provide this role
    pub fn is_mandatory(self) -> bool {
        Self::MANDATORY.contains(&self)
    }
}

impl std::fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::ArtifactStore => write!(f, "artifact_store"),
            Self::MetadataStore => write!(f, "metadata_store"),
            Self::StepOperator => write!(f, "step_operator"),
            Self::SecretsManager => write!(f, "secrets_manager"),
            Self::FeatureStore => write!(f, "feature_store"),
            Self::ModelDeployer => write!(f, "model_deployer"),
        }
    }
}

/// A backend component registered in a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackComponent {
    pub name: String,
    pub role: ComponentRole,
    /// Backend implementation, e.g. `local`, `vertex`, `gcp`
    pub flavor: String,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

impl StackComponent {
    pub fn new(role: ComponentRole, name: impl Into<String>, flavor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            flavor: flavor.into(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Serialized form of a stack
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StackDefinition {
    name: String,
    components: Vec<StackComponent>,
}

/// Named collection of backend components, one per role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StackDefinition", into = "StackDefinition")]
pub struct Stack {
    name: String,
    components: BTreeMap<ComponentRole, StackComponent>,
}

impl TryFrom<StackDefinition> for Stack {
    type Error = StepflowError;

    fn try_from(def: StackDefinition) -> Result<Self, Self::Error> {
        Stack::new(def.name, def.components)
    }
}

impl From<Stack> for StackDefinition {
    fn from(stack: Stack) -> Self {
        Self {
            name: stack.name,
            components: stack.components.into_values().collect(),
        }
    }
}

impl Stack {
    /// Build a stack, checking that every mandatory role is filled and no
    /// role appears twice
    pub fn new(
        name: impl Into<String>,
        components: impl IntoIterator<Item = StackComponent>,
    ) -> StepflowResult<Self> {
        let name = name.into();
        let mut by_role = BTreeMap::new();

        for component in components {
            let role = component.role;
            if let Some(existing) = by_role.insert(role, component) {
                return Err(StepflowError::stack_validation(
                    &name,
                    format!("role {} is filled twice (first by '{}')", role, existing.name),
                ));
            }
        }

        for role in ComponentRole::MANDATORY {
            if !by_role.contains_key(&role) {
                return Err(StepflowError::stack_validation(
                    &name,
                    format!("mandatory role {} has no component", role),
                ));
            }
        }

        Ok(Self {
            name,
            components: by_role,
        })
    }

    /// A stack made of `local` flavored components
    pub fn local(name: impl Into<String>) -> Self {
        let mut components = BTreeMap::new();
        for role in ComponentRole::MANDATORY {
            components.insert(role, StackComponent::new(role, "default", "local"));
        }
        Self {
            name: name.into(),
            components,
        }
    }

    /// Add or replace the component for its role
    pub fn with_component(mut self, component: StackComponent) -> Self {
        self.components.insert(component.role, component);
        self
    }

    /// Load a stack from YAML
    pub fn from_yaml(yaml: &str) -> StepflowResult<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component for a role; when `name` is given it must match as well
    pub fn get_component(&self, role: ComponentRole, name: Option<&str>) -> Option<&StackComponent> {
        let component = self.components.get(&role)?;
        match name {
            Some(wanted) if component.name != wanted => None,
            _ => Some(component),
        }
    }

    pub fn orchestrator(&self) -> &StackComponent {
        &self.components[&ComponentRole::Orchestrator]
    }

    pub fn step_operator(&self) -> Option<&StackComponent> {
        self.components.get(&ComponentRole::StepOperator)
    }

    pub fn feature_store(&self) -> Option<&StackComponent> {
        self.components.get(&ComponentRole::FeatureStore)
    }

    pub fn components(&self) -> impl Iterator<Item = &StackComponent> {
        self.components.values()
    }

    /// Stable digest of the stack's name and components
    pub fn identity(&self) -> String {
        let value = serde_json::json!({
            "name": self.name,
            "components": self.components.values().collect::<Vec<_>>(),
        });
        crate::cache::hash_string(&canonical_json(&value))
    }
}
