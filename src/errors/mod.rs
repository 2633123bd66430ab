// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Error types
//!
//! Every fallible operation returns a [`StepflowError`]. The variants map onto
//! the phases of a run: declaring steps, binding them into a pipeline,
//! resolving configuration, validating the stack and finally executing.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::stack::ComponentRole;

/// Result type for stepflow operations
pub type StepflowResult<T> = Result<T, StepflowError>;

/// Main error type for stepflow
#[derive(Error, Debug, Diagnostic)]
pub enum StepflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Declaration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Invalid definition of '{name}': {reason}")]
    #[diagnostic(code(stepflow::definition))]
    Definition {
        name: String,
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Binding Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Cannot bind pipeline '{pipeline}': {reason}")]
    #[diagnostic(code(stepflow::binding))]
    Binding {
        pipeline: String,
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Configuration override references unknown step '{step}'")]
    #[diagnostic(
        code(stepflow::configuration::unknown_step),
        help("Available steps: {available}")
    )]
    UnknownStep { step: String, available: String },

    #[error("Invalid configuration for step '{step}': {reason}")]
    #[diagnostic(code(stepflow::configuration))]
    Configuration {
        step: String,
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Stack Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Stack '{stack}' failed validation: {reason}")]
    #[diagnostic(code(stepflow::stack_validation))]
    StackValidation {
        stack: String,
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Missing {role} component: {reason}")]
    #[diagnostic(
        code(stepflow::missing_component),
        help("Register a {role} component in the active stack")
    )]
    MissingComponent { role: ComponentRole, reason: String },

    #[error("No active stack is set")]
    #[diagnostic(
        code(stepflow::no_active_stack),
        help("Register a stack and mark it active before running a pipeline")
    )]
    NoActiveStack,

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step '{step}' failed: {message}")]
    #[diagnostic(code(stepflow::step_failed))]
    StepFailed { step: String, message: String },

    #[error("Store error: {message}")]
    #[diagnostic(code(stepflow::store))]
    Store { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(stepflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(stepflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(stepflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(stepflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(stepflow::toml_error))]
    Toml { message: String },
}

/// Broad error category, one per phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Definition,
    Binding,
    Configuration,
    StackValidation,
    MissingComponent,
    Execution,
    Io,
}

impl From<std::io::Error> for StepflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for StepflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for StepflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for StepflowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl StepflowError {
    /// Create a definition error without help text
    pub fn definition(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Definition {
            name: name.into(),
            reason: reason.into(),
            help: None,
        }
    }

    /// Create a binding error without help text
    pub fn binding(pipeline: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Binding {
            pipeline: pipeline.into(),
            reason: reason.into(),
            help: None,
        }
    }

    /// Create a configuration error without help text
    pub fn configuration(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            step: step.into(),
            reason: reason.into(),
            help: None,
        }
    }

    /// Create a stack validation error without help text
    pub fn stack_validation(stack: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StackValidation {
            stack: stack.into(),
            reason: reason.into(),
            help: None,
        }
    }

    /// Create a missing component error
    pub fn missing_component(role: ComponentRole, reason: impl Into<String>) -> Self {
        Self::MissingComponent {
            role,
            reason: reason.into(),
        }
    }

    /// Attach help text to errors that carry it
    pub fn with_help(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Self::Definition { help, .. }
            | Self::Binding { help, .. }
            | Self::Configuration { help, .. }
            | Self::StackValidation { help, .. } => *help = Some(text.into()),
            _ => {}
        }
        self
    }

    /// The phase this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Definition { .. } => ErrorKind::Definition,
            Self::Binding { .. } => ErrorKind::Binding,
            Self::UnknownStep { .. } | Self::Configuration { .. } => ErrorKind::Configuration,
            Self::StackValidation { .. } => ErrorKind::StackValidation,
            Self::MissingComponent { .. } | Self::NoActiveStack => ErrorKind::MissingComponent,
            Self::StepFailed { .. } | Self::Store { .. } => ErrorKind::Execution,
            Self::FileReadError { .. }
            | Self::Io { .. }
            | Self::Yaml { .. }
            | Self::Json { .. }
            | Self::Toml { .. } => ErrorKind::Io,
        }
    }

    /// Whether this error aborts a run before any step is dispatched
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Definition
                | ErrorKind::Binding
                | ErrorKind::Configuration
                | ErrorKind::StackValidation
        )
    }
}
