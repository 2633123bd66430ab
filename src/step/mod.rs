// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Step declarations
//!
//! A [`Step`] is an immutable descriptor built once from an explicit
//! signature: artifact inputs, at most one parameter schema, an optional run
//! context and typed outputs. Using a step inside a pipeline requires an
//! invocation (see [`StepInvocation`]); the descriptor itself is never bound.

mod body;
mod instance;

pub use body::{FnBody, RunContext, StepBody, StepInputs, StepOutputs};
pub use instance::{
    Capability, ResourceSettings, StepConfiguration, StepInstance, StepInvocation,
};

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::errors::{StepflowError, StepflowResult};
use crate::params::ParameterSchema;
use crate::stack::ComponentRole;

/// One argument of a step signature
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepArgument {
    /// Filled by an upstream step's output
    Artifact { name: String, type_name: String },
    /// Filled from the parameter schema
    Parameters { schema: ParameterSchema },
    /// Injected run context; never counted as an input slot
    Context,
}

/// Declared output of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSpec {
    pub name: String,
    pub type_name: String,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
    })
}

fn capability_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("capability pattern is valid")
    })
}

/// Whether `name` can be used as a step, slot, input or output name
pub fn is_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}

/// Whether `name` can be used as a capability (component) name
pub fn is_capability_name(name: &str) -> bool {
    capability_pattern().is_match(name)
}

pub(crate) struct StepDefinition {
    name: String,
    arguments: Vec<StepArgument>,
    outputs: Vec<OutputSpec>,
    enable_cache: bool,
    capabilities: BTreeMap<ComponentRole, String>,
    resources: ResourceSettings,
    code_identity: String,
    body: Arc<dyn StepBody>,
}

/// Immutable step descriptor. Cloning is cheap and keeps the same identity.
#[derive(Clone)]
pub struct Step {
    inner: Arc<StepDefinition>,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.inner.name)
            .field("arguments", &self.inner.arguments)
            .field("outputs", &self.inner.outputs)
            .field("code_identity", &self.inner.code_identity)
            .finish()
    }
}

impl Step {
    /// Start declaring a step
    pub fn builder(name: impl Into<String>) -> StepBuilder {
        StepBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Arguments in declaration order
    pub fn arguments(&self) -> &[StepArgument] {
        &self.inner.arguments
    }

    /// Artifact inputs in declaration order as `(name, type)`
    pub fn artifact_inputs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.arguments.iter().filter_map(|arg| match arg {
            StepArgument::Artifact { name, type_name } => Some((name.as_str(), type_name.as_str())),
            _ => None,
        })
    }

    /// Type of an artifact input
    pub fn input_type(&self, name: &str) -> Option<&str> {
        self.artifact_inputs()
            .find(|(input, _)| *input == name)
            .map(|(_, ty)| ty)
    }

    pub fn parameter_schema(&self) -> Option<&ParameterSchema> {
        self.inner.arguments.iter().find_map(|arg| match arg {
            StepArgument::Parameters { schema } => Some(schema),
            _ => None,
        })
    }

    pub fn takes_context(&self) -> bool {
        self.inner.arguments.contains(&StepArgument::Context)
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.inner.outputs
    }

    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.inner.outputs.iter().find(|o| o.name == name)
    }

    /// Digest identifying the step's code
    pub fn code_identity(&self) -> &str {
        &self.inner.code_identity
    }

    pub(crate) fn body(&self) -> Arc<dyn StepBody> {
        Arc::clone(&self.inner.body)
    }

    /// Configuration every invocation starts from
    pub fn default_configuration(&self) -> StepConfiguration {
        StepConfiguration {
            parameters: BTreeMap::new(),
            enable_cache: self.inner.enable_cache,
            capabilities: self.inner.capabilities.clone(),
            resources: self.inner.resources.clone(),
        }
    }

    /// Begin an invocation of this step
    pub fn invocation(&self) -> StepInvocation {
        StepInvocation::new(self.clone())
    }

    /// Whether two descriptors are the same declaration
    pub fn same_declaration(&self, other: &Step) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Builder for [`Step`]
pub struct StepBuilder {
    name: String,
    arguments: Vec<StepArgument>,
    outputs: Vec<OutputSpec>,
    enable_cache: bool,
    capabilities: Vec<(ComponentRole, String)>,
    resources: ResourceSettings,
    code_version: Option<String>,
    body: Option<Arc<dyn StepBody>>,
}

impl StepBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            outputs: Vec::new(),
            enable_cache: true,
            capabilities: Vec::new(),
            resources: ResourceSettings::default(),
            code_version: None,
            body: None,
        }
    }

    /// Declare an artifact input
    pub fn input(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.arguments.push(StepArgument::Artifact {
            name: name.into(),
            type_name: type_name.into(),
        });
        self
    }

    /// Declare the parameter schema argument
    pub fn parameters(mut self, schema: ParameterSchema) -> Self {
        self.arguments.push(StepArgument::Parameters { schema });
        self
    }

    /// Request the run context
    pub fn context(mut self) -> Self {
        self.arguments.push(StepArgument::Context);
        self
    }

    /// Declare an output
    pub fn output(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            name: name.into(),
            type_name: type_name.into(),
        });
        self
    }

    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    /// Require a named step operator in the stack
    pub fn step_operator(self, name: impl Into<String>) -> Self {
        self.requires(ComponentRole::StepOperator, name)
    }

    /// Require a named component for a role
    pub fn requires(mut self, role: ComponentRole, name: impl Into<String>) -> Self {
        self.capabilities.push((role, name.into()));
        self
    }

    pub fn resources(mut self, resources: ResourceSettings) -> Self {
        self.resources = resources;
        self
    }

    /// Version string folded into the code identity
    pub fn code_version(mut self, version: impl Into<String>) -> Self {
        self.code_version = Some(version.into());
        self
    }

    pub fn body(mut self, body: impl StepBody + 'static) -> Self {
        self.body = Some(Arc::new(body));
        self
    }

    /// Use an async closure as the body
    pub fn body_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(StepInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepflowResult<StepOutputs>> + Send + 'static,
    {
        self.body(FnBody::new(f))
    }

    /// Validate the signature and produce the descriptor
    pub fn build(self) -> StepflowResult<Step> {
        let name = self.name;
        let err = |reason: String| StepflowError::definition(name.as_str(), reason);

        if !is_identifier(&name) {
            return Err(err(format!("'{}' is not a valid step name", name)));
        }

        let mut seen = HashSet::new();
        let mut schema: Option<&ParameterSchema> = None;
        let mut has_context = false;

        for arg in &self.arguments {
            match arg {
                StepArgument::Artifact { name: input, type_name } => {
                    if !is_identifier(input) {
                        return Err(err(format!("'{}' is not a valid input name", input)));
                    }
                    if type_name.is_empty() {
                        return Err(err(format!("input '{}' has no type", input)));
                    }
                    if !seen.insert(input.as_str()) {
                        return Err(err(format!("input '{}' is declared twice", input)));
                    }
                }
                StepArgument::Parameters { schema: s } => {
                    if schema.is_some() {
                        return Err(err("more than one parameter schema argument".into())
                            .with_help("Merge the fields into a single schema"));
                    }
                    s.validate_definition()?;
                    schema = Some(s);
                }
                StepArgument::Context => {
                    if has_context {
                        return Err(err("run context requested twice".into()));
                    }
                    has_context = true;
                }
            }
        }

        if let Some(schema) = schema {
            for field in schema.field_names() {
                if seen.contains(field) {
                    return Err(err(format!(
                        "'{}' is both an artifact input and a parameter field",
                        field
                    ))
                    .with_help("Rename the input or the parameter so each slot is unambiguous"));
                }
            }
        }

        let mut output_names = HashSet::new();
        for output in &self.outputs {
            if !is_identifier(&output.name) {
                return Err(err(format!("'{}' is not a valid output name", output.name)));
            }
            if !output_names.insert(output.name.as_str()) {
                return Err(err(format!("output '{}' is declared twice", output.name)));
            }
        }

        let mut capabilities = BTreeMap::new();
        for (role, component) in self.capabilities {
            if !is_capability_name(&component) {
                return Err(err(format!(
                    "'{}' is not a valid {} name",
                    component, role
                )));
            }
            if capabilities.insert(role, component).is_some() {
                return Err(err(format!("{} is required twice", role)));
            }
        }

        let body = self
            .body
            .ok_or_else(|| err("step has no body".into()))?;

        let code_identity = {
            let declaration = serde_json::json!({
                "name": name,
                "arguments": self.arguments,
                "outputs": self.outputs,
                "code_version": self.code_version,
            });
            crate::cache::hash_string(&crate::cache::canonical_json(&declaration))
        };

        tracing::debug!(step = %name, identity = %code_identity, "declared step");

        Ok(Step {
            inner: Arc::new(StepDefinition {
                name,
                arguments: self.arguments,
                outputs: self.outputs,
                enable_cache: self.enable_cache,
                capabilities,
                resources: self.resources,
                code_identity,
                body,
            }),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::params::{FieldSpec, ParamType};

    /// A step with no inputs, outputs or parameters
    pub(crate) fn noop_step(name: &str) -> Step {
        Step::builder(name)
            .body_fn(|_inputs| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_minimal_step() {
        let step = noop_step("empty");
        assert_eq!(step.name(), "empty");
        assert_eq!(step.artifact_inputs().count(), 0);
        assert!(step.parameter_schema().is_none());
        assert!(!step.takes_context());
    }

    #[test]
    fn test_context_not_counted_as_input() {
        let step = Step::builder("trainer")
            .input("data", "DataFrame")
            .context()
            .parameters(ParameterSchema::new("P").field(FieldSpec::new("lr", ParamType::Float)))
            .output("model", "Model")
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap();

        assert_eq!(step.artifact_inputs().collect::<Vec<_>>(), vec![("data", "DataFrame")]);
        assert!(step.takes_context());
        assert_eq!(step.input_type("data"), Some("DataFrame"));
        assert_eq!(step.output("model").unwrap().type_name, "Model");
    }

    #[test]
    fn test_two_parameter_schemas_rejected() {
        let result = Step::builder("s")
            .parameters(ParameterSchema::new("A"))
            .parameters(ParameterSchema::new("B"))
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build();
        assert!(matches!(result, Err(StepflowError::Definition { .. })));
    }

    #[test]
    fn test_input_shadowing_parameter_rejected() {
        let result = Step::builder("s")
            .input("value", "int")
            .parameters(ParameterSchema::new("P").field(FieldSpec::new("value", ParamType::Int)))
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build();
        assert!(matches!(result, Err(StepflowError::Definition { .. })));
    }

    #[test]
    fn test_invalid_step_operator_name() {
        let result = Step::builder("s")
            .step_operator("not valid!")
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build();
        assert!(matches!(result, Err(StepflowError::Definition { .. })));

        let ok = Step::builder("s")
            .step_operator("azureml")
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap();
        assert_eq!(
            ok.default_configuration().step_operator(),
            Some("azureml")
        );
    }

    #[test]
    fn test_missing_body_rejected() {
        assert!(Step::builder("s").build().is_err());
    }

    #[test]
    fn test_code_identity_tracks_declaration() {
        let a = Step::builder("s")
            .output("out", "int")
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap();
        let b = Step::builder("s")
            .output("out", "int")
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap();
        let c = Step::builder("s")
            .output("out", "int")
            .code_version("2")
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap();

        assert_eq!(a.code_identity(), b.code_identity());
        assert_ne!(a.code_identity(), c.code_identity());
        assert!(!a.same_declaration(&b));
        assert!(a.same_declaration(&a.clone()));
    }
}
