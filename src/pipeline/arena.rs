// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Arena of step instances
//!
//! Every invocation lives in a [`StepArena`] and is referred to by a
//! [`StepHandle`]. Two handles name the same instance exactly when they are
//! equal, which is how reuse of one instance in two slots is detected.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::StepflowResult;
use crate::step::{Step, StepInstance, StepInvocation};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Stable reference to an instance in an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepHandle {
    arena: u64,
    index: usize,
}

impl StepHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Owner of the step instances used by one pipeline instance
#[derive(Debug)]
pub struct StepArena {
    id: u64,
    entries: Vec<StepInstance>,
}

impl Default for StepArena {
    fn default() -> Self {
        Self::new()
    }
}

impl StepArena {
    pub fn new() -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            entries: Vec::new(),
        }
    }

    /// Add an invocation
    pub fn add(&mut self, invocation: StepInvocation) -> StepflowResult<StepHandle> {
        let instance = invocation.into_instance()?;
        self.entries.push(instance);
        Ok(StepHandle {
            arena: self.id,
            index: self.entries.len() - 1,
        })
    }

    /// Add a plain invocation of `step`
    pub fn invoke(&mut self, step: &Step) -> StepflowResult<StepHandle> {
        self.add(step.invocation())
    }

    /// Whether the handle was issued by this arena
    pub fn owns(&self, handle: StepHandle) -> bool {
        handle.arena == self.id && handle.index < self.entries.len()
    }

    pub fn get(&self, handle: StepHandle) -> Option<&StepInstance> {
        if handle.arena != self.id {
            return None;
        }
        self.entries.get(handle.index)
    }

    pub(crate) fn get_mut(&mut self, handle: StepHandle) -> Option<&mut StepInstance> {
        if handle.arena != self.id {
            return None;
        }
        self.entries.get_mut(handle.index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An argument passed when instantiating a template
#[derive(Debug, Clone)]
pub enum StepArg {
    /// A step instance (the only valid kind)
    Instance(StepHandle),
    /// A step descriptor that was never invoked
    Descriptor(Step),
    /// Anything else
    Value(Value),
}

impl StepArg {
    /// Short description used in error messages
    pub fn describe(&self) -> String {
        match self {
            Self::Instance(handle) => format!("step instance #{}", handle.index),
            Self::Descriptor(step) => format!("step descriptor '{}'", step.name()),
            Self::Value(value) => format!("value {}", value),
        }
    }
}

impl From<StepHandle> for StepArg {
    fn from(handle: StepHandle) -> Self {
        Self::Instance(handle)
    }
}

impl From<Step> for StepArg {
    fn from(step: Step) -> Self {
        Self::Descriptor(step)
    }
}

impl From<&Step> for StepArg {
    fn from(step: &Step) -> Self {
        Self::Descriptor(step.clone())
    }
}

impl From<Value> for StepArg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::tests::noop_step;

    #[test]
    fn test_handles_are_distinct_per_invocation() {
        let step = noop_step("empty");
        let mut arena = StepArena::new();
        let a = arena.invoke(&step).unwrap();
        let b = arena.invoke(&step).unwrap();

        assert_ne!(a, b);
        assert_eq!(a, a);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_foreign_handles_rejected() {
        let step = noop_step("empty");
        let mut first = StepArena::new();
        let mut second = StepArena::new();
        let handle = first.invoke(&step).unwrap();
        second.invoke(&step).unwrap();

        assert!(first.owns(handle));
        assert!(!second.owns(handle));
        assert!(second.get(handle).is_none());
    }

    #[test]
    fn test_describe() {
        let step = noop_step("empty");
        assert_eq!(StepArg::from(&step).describe(), "step descriptor 'empty'");
        assert_eq!(StepArg::from(serde_json::json!(1)).describe(), "value 1");
    }
}
