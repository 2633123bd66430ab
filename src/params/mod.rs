// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Parameter schemas
//!
//! A [`ParameterSchema`] is an explicit field table: each field has a type,
//! an optional default and optional rules. Values are checked against the
//! table by lookup, so unknown fields are rejected without any reflection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::{StepflowError, StepflowResult};

/// Type of a parameter field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    /// Floating point; integer values are accepted
    Float,
    String,
    List(Box<ParamType>),
    Map,
    Any,
}

impl ParamType {
    /// Check whether a JSON value has this type
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::List(inner), Value::Array(items)) => items.iter().all(|v| inner.accepts(v)),
            (Self::Map, Value::Object(_)) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::String => write!(f, "string"),
            Self::List(inner) => write!(f, "list<{}>", inner),
            Self::Map => write!(f, "map"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Validation rule attached to a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    /// Numeric lower bound (inclusive)
    Min(f64),
    /// Numeric upper bound (inclusive)
    Max(f64),
    /// Value must equal one of these
    OneOf(Vec<Value>),
    /// Strings, lists and maps must not be empty
    NonEmpty,
}

impl FieldRule {
    fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::Min(min) => match value.as_f64() {
                Some(v) if v < *min => Err(format!("{} is below the minimum {}", v, min)),
                _ => Ok(()),
            },
            Self::Max(max) => match value.as_f64() {
                Some(v) if v > *max => Err(format!("{} is above the maximum {}", v, max)),
                _ => Ok(()),
            },
            Self::OneOf(allowed) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    Err(format!("{} is not one of {}", value, Value::Array(allowed.clone())))
                }
            }
            Self::NonEmpty => {
                let empty = match value {
                    Value::String(s) => s.is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    _ => false,
                };
                if empty {
                    Err("value must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// A single field in a parameter schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub default: Option<Value>,
    /// Resolves to `null` when nothing supplies a value
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub rules: Vec<FieldRule>,
}

impl FieldSpec {
    /// A required field with no default
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            optional: false,
            rules: Vec::new(),
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Check a value against the field type and rules
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if value.is_null() && self.optional {
            return Ok(());
        }
        if !self.ty.accepts(value) {
            return Err(format!(
                "field '{}' expects {} but got {}",
                self.name, self.ty, value
            ));
        }
        for rule in &self.rules {
            rule.check(value)
                .map_err(|reason| format!("field '{}': {}", self.name, reason))?;
        }
        Ok(())
    }
}

/// Typed, declarative field table for a step's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl ParameterSchema {
    /// Start an empty schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field names in declaration order
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Check the table itself: unique names and defaults that satisfy their
    /// own field
    pub fn validate_definition(&self) -> StepflowResult<()> {
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(StepflowError::definition(
                    &self.name,
                    format!("duplicate parameter field '{}'", field.name),
                ));
            }
            if let Some(default) = &field.default {
                field.check(default).map_err(|reason| {
                    StepflowError::definition(&self.name, format!("invalid default: {}", reason))
                })?;
            }
        }
        Ok(())
    }

    /// Validate a partial set of values: every key must be a known field and
    /// every value must satisfy its field. Missing fields are allowed.
    pub fn check_partial(
        &self,
        step: &str,
        values: &BTreeMap<String, Value>,
    ) -> StepflowResult<()> {
        for (key, value) in values {
            let field = self.get(key).ok_or_else(|| {
                StepflowError::configuration(step, format!("unknown parameter '{}'", key))
                    .with_help(format!(
                        "Fields of '{}': {}",
                        self.name,
                        self.field_names().join(", ")
                    ))
            })?;
            field
                .check(value)
                .map_err(|reason| StepflowError::configuration(step, reason))?;
        }
        Ok(())
    }

    /// Complete a set of values with defaults. Fails when a required field is
    /// still unresolved.
    pub fn complete(
        &self,
        step: &str,
        values: &BTreeMap<String, Value>,
    ) -> StepflowResult<Parameters> {
        self.check_partial(step, values)?;

        let mut out = BTreeMap::new();
        for field in &self.fields {
            let value = match values.get(&field.name) {
                Some(v) => v.clone(),
                None => match (&field.default, field.optional) {
                    (Some(default), _) => default.clone(),
                    (None, true) => Value::Null,
                    (None, false) => {
                        return Err(StepflowError::configuration(
                            step,
                            format!("parameter '{}' has no value and no default", field.name),
                        )
                        .with_help("Set it when invoking the step or in an override document"));
                    }
                },
            };
            out.insert(field.name.clone(), value);
        }

        Ok(Parameters { values: out })
    }
}

/// Fully resolved parameter values for one step instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: BTreeMap<String, Value>,
}

impl Parameters {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Raw value of a field
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Typed value of a field
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> StepflowResult<T> {
        let value = self.values.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(Into::into)
    }

    /// Deserialize all values into a typed struct
    pub fn deserialize<T: DeserializeOwned>(&self) -> StepflowResult<T> {
        let object: serde_json::Map<String, Value> = self.values.clone().into_iter().collect();
        serde_json::from_value(Value::Object(object)).map_err(Into::into)
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
