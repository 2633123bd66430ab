// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Stack registry and the active stack
//!
//! Pipelines never read the registry on their own. The caller passes a
//! registry (or a stack taken from it) into validation and dispatch. A
//! process-wide instance is available through [`StackRegistry::global`] for
//! hosts that want one; it starts empty and is only changed by explicit
//! `register` / `set_active` calls.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::Stack;
use crate::errors::{StepflowError, StepflowResult};
use crate::settings::Settings;

static GLOBAL: OnceLock<StackRegistry> = OnceLock::new();

/// Registered stacks plus the active-stack pointer
#[derive(Debug, Default)]
pub struct StackRegistry {
    stacks: RwLock<BTreeMap<String, Arc<Stack>>>,
    active: RwLock<Option<String>>,
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static StackRegistry {
        GLOBAL.get_or_init(StackRegistry::new)
    }

    /// Build a registry from project settings
    pub fn from_settings(settings: &Settings) -> StepflowResult<Self> {
        let registry = Self::new();
        for stack in &settings.stacks {
            registry.register(stack.clone());
        }
        if let Some(active) = settings.active_stack_name() {
            registry.set_active(active)?;
        }
        Ok(registry)
    }

    /// Register a stack, replacing any stack with the same name
    pub fn register(&self, stack: Stack) -> Arc<Stack> {
        let stack = Arc::new(stack);
        tracing::debug!(stack = stack.name(), "registering stack");
        self.write_stacks()
            .insert(stack.name().to_string(), Arc::clone(&stack));
        stack
    }

    /// Remove a stack. The active stack cannot be removed.
    pub fn deregister(&self, name: &str) -> StepflowResult<()> {
        if self.active_name().as_deref() == Some(name) {
            return Err(StepflowError::stack_validation(
                name,
                "cannot deregister the active stack",
            ));
        }
        self.write_stacks().remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stack>> {
        self.read_stacks().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.read_stacks().keys().cloned().collect()
    }

    /// Mark a registered stack as active
    pub fn set_active(&self, name: &str) -> StepflowResult<()> {
        if !self.read_stacks().contains_key(name) {
            return Err(StepflowError::stack_validation(name, "stack is not registered")
                .with_help(format!("Registered stacks: {}", self.names().join(", "))));
        }
        tracing::info!(stack = name, "activating stack");
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
        Ok(())
    }

    /// Clear the active stack
    pub fn clear_active(&self) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn active_name(&self) -> Option<String> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The active stack, or [`StepflowError::NoActiveStack`]
    pub fn active_stack(&self) -> StepflowResult<Arc<Stack>> {
        let name = self.active_name().ok_or(StepflowError::NoActiveStack)?;
        self.get(&name).ok_or(StepflowError::NoActiveStack)
    }

    fn read_stacks(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<Stack>>> {
        self.stacks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_stacks(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<Stack>>> {
        self.stacks.write().unwrap_or_else(|e| e.into_inner())
    }
}
