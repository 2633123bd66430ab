// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Project settings
//!
//! Loaded from `.stepflow.yaml` in the project root. Every field has a
//! default, so a missing file yields a usable configuration with a single
//! local stack.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::errors::{StepflowError, StepflowResult};
use crate::orchestrator::default_parallelism;
use crate::stack::Stack;

/// File name looked up in the project root
pub const SETTINGS_FILE: &str = ".stepflow.yaml";

/// Name of the stack activated when none is configured
pub const DEFAULT_STACK: &str = "default";

/// Settings from .stepflow.yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Settings version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Where the local orchestrator keeps metadata and artifacts
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Whether cached results may be reused
    #[serde(default = "default_true")]
    pub enable_cache: bool,

    /// Upper bound on steps running at once
    #[serde(default = "default_parallelism")]
    pub max_parallelism: usize,

    /// Declared stacks
    #[serde(default = "default_stacks")]
    pub stacks: Vec<Stack>,

    /// Stack to activate
    #[serde(default)]
    pub active_stack: Option<String>,
}

fn default_version() -> String {
    "1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stacks() -> Vec<Stack> {
    vec![Stack::local(DEFAULT_STACK)]
}

/// Per-user data directory, falling back to a project-relative path
fn default_store_root() -> PathBuf {
    ProjectDirs::from("dev", "stepflow", "stepflow")
        .map(|dirs| dirs.data_local_dir().join("store"))
        .unwrap_or_else(|| PathBuf::from(".stepflow").join("store"))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            store_root: default_store_root(),
            enable_cache: true,
            max_parallelism: default_parallelism(),
            stacks: default_stacks(),
            active_stack: None,
        }
    }
}

impl Settings {
    /// Load from file; a missing file gives the defaults
    pub fn load(path: &Path) -> StepflowResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| StepflowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_yaml(&content)
    }

    /// Load from project directory (looks for .stepflow.yaml)
    pub fn load_from_project(project_root: &Path) -> StepflowResult<Self> {
        let mut settings = Self::load(&project_root.join(SETTINGS_FILE))?;
        if settings.store_root.is_relative() {
            settings.store_root = project_root.join(&settings.store_root);
        }
        Ok(settings)
    }

    pub fn from_yaml(yaml: &str) -> StepflowResult<Self> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        if settings.max_parallelism == 0 {
            return Err(StepflowError::configuration(
                "settings",
                "max_parallelism must be at least 1",
            ));
        }
        Ok(settings)
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> StepflowResult<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Stack to activate: the configured one, else `default` when declared
    pub fn active_stack_name(&self) -> Option<&str> {
        match &self.active_stack {
            Some(name) => Some(name.as_str()),
            None => self
                .stacks
                .iter()
                .find(|s| s.name() == DEFAULT_STACK)
                .map(|s| s.name()),
        }
    }
}
