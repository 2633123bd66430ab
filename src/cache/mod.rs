// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Cache keys for step invocations
//!
//! A key identifies a step invocation's reproducibility class: the step's
//! code identity, its resolved parameters, the fingerprints of the artifacts
//! it consumes (each tied to the input slot that consumed it) and the stack
//! the run targets. Keys are only used to look up earlier runs in the
//! metadata store.

mod hash;

pub use hash::{canonical_json, hash_string, hash_value, ContentHasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::stack::Stack;
use crate::step::{Step, StepConfiguration};

/// Opaque fingerprint of a step invocation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Computes cache keys, optionally scoped to one stack
#[derive(Debug, Clone, Default)]
pub struct CacheKeyComputer {
    stack_identity: Option<String>,
}

impl CacheKeyComputer {
    /// Keys not scoped to any stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys scoped to a stack: the same invocation on another stack gets a
    /// different key
    pub fn for_stack(stack: &Stack) -> Self {
        Self {
            stack_identity: Some(stack.identity()),
        }
    }

    /// Fingerprint one invocation. `upstream` maps input slot name to the
    /// fingerprint of the artifact that filled it.
    pub fn fingerprint(
        &self,
        step: &Step,
        config: &StepConfiguration,
        upstream: &BTreeMap<String, String>,
    ) -> CacheKey {
        let mut hasher = ContentHasher::for_cache_keys();

        hasher.field("code", step.code_identity().as_bytes());

        let params: serde_json::Map<String, Value> = config
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        hasher.json_field("parameters", &Value::Object(params));

        // BTreeMap iteration is sorted by slot, so supply order is irrelevant
        for (slot, fingerprint) in upstream {
            hasher.field("input", slot.as_bytes());
            hasher.field("fingerprint", fingerprint.as_bytes());
        }

        if let Some(identity) = &self.stack_identity {
            hasher.field("stack", identity.as_bytes());
        }

        CacheKey(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{FieldSpec, ParamType, ParameterSchema};
    use crate::step::StepOutputs;
    use serde_json::json;

    fn step(version: &str) -> Step {
        Step::builder("trainer")
            .input("data", "DataFrame")
            .input("labels", "DataFrame")
            .parameters(ParameterSchema::new("P").field(FieldSpec::new("lr", ParamType::Float)))
            .code_version(version)
            .body_fn(|_| async { Ok(StepOutputs::new()) })
            .build()
            .unwrap()
    }

    fn config(lr: f64) -> StepConfiguration {
        let mut config = StepConfiguration::default();
        config.parameters.insert("lr".into(), json!(lr));
        config
    }

    fn upstream(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identical_inputs_identical_key() {
        let s = step("1");
        let computer = CacheKeyComputer::new();
        let up = upstream(&[("data", "aaa"), ("labels", "bbb")]);

        let k1 = computer.fingerprint(&s, &config(0.1), &up);
        let k2 = computer.fingerprint(&s, &config(0.1), &up);
        assert_eq!(k1, k2);
        assert_eq!(k1.as_str().len(), 64);
    }

    #[test]
    fn test_any_difference_changes_key() {
        let computer = CacheKeyComputer::new();
        let up = upstream(&[("data", "aaa"), ("labels", "bbb")]);
        let base = computer.fingerprint(&step("1"), &config(0.1), &up);

        assert_ne!(base, computer.fingerprint(&step("2"), &config(0.1), &up));
        assert_ne!(base, computer.fingerprint(&step("1"), &config(0.2), &up));
        assert_ne!(
            base,
            computer.fingerprint(&step("1"), &config(0.1), &upstream(&[("data", "aaa"), ("labels", "ccc")]))
        );
    }

    #[test]
    fn test_slot_identity_is_part_of_key() {
        let computer = CacheKeyComputer::new();
        let s = step("1");
        let a = computer.fingerprint(&s, &config(0.1), &upstream(&[("data", "aaa"), ("labels", "bbb")]));
        let swapped =
            computer.fingerprint(&s, &config(0.1), &upstream(&[("data", "bbb"), ("labels", "aaa")]));
        assert_ne!(a, swapped);
    }

    #[test]
    fn test_supply_order_irrelevant() {
        let computer = CacheKeyComputer::new();
        let s = step("1");
        let mut forward = BTreeMap::new();
        forward.insert("data".to_string(), "aaa".to_string());
        forward.insert("labels".to_string(), "bbb".to_string());
        let mut backward = BTreeMap::new();
        backward.insert("labels".to_string(), "bbb".to_string());
        backward.insert("data".to_string(), "aaa".to_string());

        assert_eq!(
            computer.fingerprint(&s, &config(0.1), &forward),
            computer.fingerprint(&s, &config(0.1), &backward)
        );
    }

    #[test]
    fn test_stack_scoped_keys() {
        let s = step("1");
        let up = upstream(&[]);
        let local = CacheKeyComputer::for_stack(&Stack::local("local"));
        let remote = CacheKeyComputer::for_stack(&Stack::local("remote"));

        assert_ne!(
            local.fingerprint(&s, &config(0.1), &up),
            remote.fingerprint(&s, &config(0.1), &up)
        );
        assert_ne!(
            local.fingerprint(&s, &config(0.1), &up),
            CacheKeyComputer::new().fingerprint(&s, &config(0.1), &up)
        );
    }
}
