// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Pipeline templates
//!
//! A template is an ordered set of named slots plus a wiring function. The
//! wiring function calls every slot once through a [`Wiring`], passing the
//! outputs of earlier calls as inputs; those calls are the only source of
//! graph edges.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::arena::{StepArena, StepArg, StepHandle};
use super::dag::{DependencyEdge, PipelineDag};
use super::instance::PipelineInstance;
use crate::errors::{StepflowError, StepflowResult};
use crate::step::{is_identifier, Step};

/// Signature of a wiring function
pub type WiringFn = dyn Fn(&mut Wiring<'_>) -> StepflowResult<()> + Send + Sync;

static NEXT_WIRING_ID: AtomicU64 = AtomicU64::new(1);

struct TemplateDefinition {
    name: String,
    slots: Vec<String>,
    wiring: Option<Arc<WiringFn>>,
}

/// Immutable pipeline template. Cloning keeps the same definition.
#[derive(Clone)]
pub struct PipelineTemplate {
    inner: Arc<TemplateDefinition>,
}

impl std::fmt::Debug for PipelineTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineTemplate")
            .field("name", &self.inner.name)
            .field("slots", &self.inner.slots)
            .finish()
    }
}

impl PipelineTemplate {
    pub fn builder(name: impl Into<String>) -> TemplateBuilder {
        TemplateBuilder {
            name: name.into(),
            slots: Vec::new(),
            wiring: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Slot names in declaration order
    pub fn slots(&self) -> &[String] {
        &self.inner.slots
    }

    /// Bind step instances from `arena` to the slots.
    ///
    /// Positional arguments fill slots left to right; keyword arguments fill
    /// the slot they name. The arena moves into the resulting instance.
    pub fn instantiate(
        &self,
        mut arena: StepArena,
        positional: Vec<StepArg>,
        keyword: Vec<(&str, StepArg)>,
    ) -> StepflowResult<PipelineInstance> {
        let pipeline = self.name();
        let slots = self.slots();

        let given = positional.len() + keyword.len();
        if given > slots.len() {
            return Err(StepflowError::binding(
                pipeline,
                format!("takes {} steps but {} were given", slots.len(), given),
            ));
        }

        let mut assigned: Vec<(String, StepArg)> = slots
            .iter()
            .cloned()
            .zip(positional)
            .collect();

        for (slot, arg) in keyword {
            let slot = slot.to_string();
            if !slots.contains(&slot) {
                return Err(StepflowError::binding(
                    pipeline,
                    format!("unexpected keyword argument '{}'", slot),
                )
                .with_help(format!("Slots: {}", slots.join(", "))));
            }
            if assigned.iter().any(|(s, _)| *s == slot) {
                return Err(StepflowError::binding(
                    pipeline,
                    format!("slot '{}' is given more than once", slot),
                ));
            }
            assigned.push((slot, arg));
        }

        let mut handles: HashMap<String, StepHandle> = HashMap::new();
        let mut owners: HashMap<StepHandle, String> = HashMap::new();

        for (slot, arg) in assigned {
            let handle = match arg {
                StepArg::Instance(handle) => handle,
                StepArg::Descriptor(step) => {
                    return Err(StepflowError::binding(
                        pipeline,
                        format!(
                            "slot '{}' received step '{}' without invoking it",
                            slot,
                            step.name()
                        ),
                    )
                    .with_help("Add an invocation to the arena and pass its handle"));
                }
                other => {
                    return Err(StepflowError::binding(
                        pipeline,
                        format!(
                            "slot '{}' expects a step instance but got {}",
                            slot,
                            other.describe()
                        ),
                    ));
                }
            };

            if !arena.owns(handle) {
                return Err(StepflowError::binding(
                    pipeline,
                    format!("slot '{}' received an instance from another arena", slot),
                ));
            }

            if let Some(previous) = owners.get(&handle) {
                return Err(StepflowError::binding(
                    pipeline,
                    format!(
                        "the same step instance is bound to slots '{}' and '{}'",
                        previous, slot
                    ),
                )
                .with_help("Invoke the step once for each slot"));
            }

            owners.insert(handle, slot.clone());
            handles.insert(slot, handle);
        }

        if let Some(missing) = slots.iter().find(|s| !handles.contains_key(*s)) {
            return Err(StepflowError::binding(
                pipeline,
                format!("slot '{}' was not filled", missing),
            ));
        }

        let signatures: BTreeMap<String, Step> = handles
            .iter()
            .filter_map(|(slot, handle)| {
                arena.get(*handle).map(|i| (slot.clone(), i.step().clone()))
            })
            .collect();

        let mut wiring = Wiring::new(pipeline, &signatures);
        match &self.inner.wiring {
            Some(connect) => connect(&mut wiring)?,
            None => {
                for slot in slots {
                    wiring.call(slot, &[])?;
                }
            }
        }
        let edges = wiring.finish(slots)?;
        let dag = PipelineDag::build(pipeline, slots, &edges)?;

        let mut bindings = Vec::with_capacity(slots.len());
        for slot in slots {
            let handle = handles[slot];
            if let Some(instance) = arena.get_mut(handle) {
                instance.set_slot_name(slot);
            }
            bindings.push((slot.clone(), handle));
        }

        tracing::debug!(
            pipeline = %pipeline,
            steps = bindings.len(),
            edges = edges.len(),
            "instantiated pipeline"
        );

        Ok(PipelineInstance::new(self.clone(), arena, bindings, dag))
    }
}

/// Builder for [`PipelineTemplate`]
pub struct TemplateBuilder {
    name: String,
    slots: Vec<String>,
    wiring: Option<Arc<WiringFn>>,
}

impl TemplateBuilder {
    pub fn slot(mut self, name: impl Into<String>) -> Self {
        self.slots.push(name.into());
        self
    }

    pub fn slots<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slots.extend(names.into_iter().map(Into::into));
        self
    }

    /// Set the wiring function. Without one, every slot is called in order
    /// with no inputs.
    pub fn connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Wiring<'_>) -> StepflowResult<()> + Send + Sync + 'static,
    {
        self.wiring = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> StepflowResult<PipelineTemplate> {
        let name = self.name;

        if !is_identifier(&name) {
            return Err(StepflowError::definition(
                name.as_str(),
                format!("'{}' is not a valid pipeline name", name),
            ));
        }
        if self.slots.is_empty() {
            return Err(StepflowError::definition(name.as_str(), "pipeline declares no slots"));
        }

        let mut seen = HashSet::new();
        for slot in &self.slots {
            if !is_identifier(slot) {
                return Err(StepflowError::definition(
                    name.as_str(),
                    format!("'{}' is not a valid slot name", slot),
                ));
            }
            if !seen.insert(slot.as_str()) {
                return Err(StepflowError::definition(
                    name.as_str(),
                    format!("slot '{}' is declared twice", slot),
                ));
            }
        }

        Ok(PipelineTemplate {
            inner: Arc::new(TemplateDefinition {
                name,
                slots: self.slots,
                wiring: self.wiring,
            }),
        })
    }
}

/// Handle to one output of a called slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    wiring: u64,
    slot: String,
    output: String,
    type_name: String,
}

impl OutputRef {
    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// Outputs returned from [`Wiring::call`]
#[derive(Debug, Clone)]
pub struct Outputs {
    pipeline: String,
    slot: String,
    refs: Vec<OutputRef>,
}

impl Outputs {
    /// Output by name
    pub fn get(&self, name: &str) -> StepflowResult<&OutputRef> {
        self.refs.iter().find(|r| r.output == name).ok_or_else(|| {
            StepflowError::binding(
                &self.pipeline,
                format!("slot '{}' has no output named '{}'", self.slot, name),
            )
        })
    }

    /// The only output of a single-output step
    pub fn single(&self) -> StepflowResult<&OutputRef> {
        match self.refs.as_slice() {
            [only] => Ok(only),
            refs => Err(StepflowError::binding(
                &self.pipeline,
                format!(
                    "slot '{}' has {} outputs; pick one by name",
                    self.slot,
                    refs.len()
                ),
            )),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputRef> {
        self.refs.iter()
    }
}

/// Records slot calls made by a wiring function
pub struct Wiring<'a> {
    id: u64,
    pipeline: &'a str,
    signatures: &'a BTreeMap<String, Step>,
    called: HashSet<String>,
    edges: Vec<DependencyEdge>,
}

impl<'a> Wiring<'a> {
    fn new(pipeline: &'a str, signatures: &'a BTreeMap<String, Step>) -> Self {
        Self {
            id: NEXT_WIRING_ID.fetch_add(1, Ordering::Relaxed),
            pipeline,
            signatures,
            called: HashSet::new(),
            edges: Vec::new(),
        }
    }

    fn error(&self, reason: String) -> StepflowError {
        StepflowError::binding(self.pipeline, reason)
    }

    /// Call a slot, feeding each named input from an earlier call's output
    pub fn call(&mut self, slot: &str, inputs: &[(&str, &OutputRef)]) -> StepflowResult<Outputs> {
        let step = self
            .signatures
            .get(slot)
            .ok_or_else(|| self.error(format!("wiring calls unknown slot '{}'", slot)))?;

        if self.called.contains(slot) {
            return Err(self.error(format!("slot '{}' is called twice", slot)));
        }

        let mut supplied = HashSet::new();
        let mut edges = Vec::with_capacity(inputs.len());

        for (input, source) in inputs {
            if source.wiring != self.id {
                return Err(self.error(format!(
                    "input '{}' of slot '{}' comes from a different pipeline",
                    input, slot
                )));
            }
            let expected = step.input_type(input).ok_or_else(|| {
                self.error(format!(
                    "step '{}' in slot '{}' has no input named '{}'",
                    step.name(),
                    slot,
                    input
                ))
            })?;
            if !supplied.insert(*input) {
                return Err(self.error(format!(
                    "input '{}' of slot '{}' is supplied twice",
                    input, slot
                )));
            }
            if !types_compatible(expected, &source.type_name) {
                return Err(self.error(format!(
                    "input '{}' of slot '{}' expects {} but {}.{} produces {}",
                    input, slot, expected, source.slot, source.output, source.type_name
                )));
            }
            edges.push(DependencyEdge {
                from: source.slot.clone(),
                output: source.output.clone(),
                to: slot.to_string(),
                input: input.to_string(),
            });
        }

        if let Some((missing, _)) = step
            .artifact_inputs()
            .find(|(name, _)| !supplied.contains(name))
        {
            return Err(self.error(format!(
                "input '{}' of slot '{}' is not connected",
                missing, slot
            )));
        }

        self.called.insert(slot.to_string());
        self.edges.extend(edges);

        Ok(Outputs {
            pipeline: self.pipeline.to_string(),
            slot: slot.to_string(),
            refs: step
                .outputs()
                .iter()
                .map(|o| OutputRef {
                    wiring: self.id,
                    slot: slot.to_string(),
                    output: o.name.clone(),
                    type_name: o.type_name.clone(),
                })
                .collect(),
        })
    }

    fn finish(self, slots: &[String]) -> StepflowResult<Vec<DependencyEdge>> {
        if let Some(slot) = slots.iter().find(|s| !self.called.contains(*s)) {
            return Err(self.error(format!("slot '{}' is never called by the wiring", slot)));
        }
        Ok(self.edges)
    }
}

fn types_compatible(expected: &str, actual: &str) -> bool {
    expected == actual || expected.eq_ignore_ascii_case("any") || actual.eq_ignore_ascii_case("any")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{consumer, producer, two_step_template};
    use crate::step::tests::noop_step;
    use serde_json::json;

    #[test]
    fn test_template_definition_errors() {
        let dup = PipelineTemplate::builder("p").slot("a").slot("a").build();
        assert!(matches!(dup, Err(StepflowError::Definition { .. })));

        let invalid = PipelineTemplate::builder("p").slot("not a slot").build();
        assert!(matches!(invalid, Err(StepflowError::Definition { .. })));

        let empty = PipelineTemplate::builder("p").build();
        assert!(matches!(empty, Err(StepflowError::Definition { .. })));
    }

    #[test]
    fn test_too_many_arguments() {
        let template = PipelineTemplate::builder("single").slot("only").build().unwrap();
        let step = noop_step("empty");
        let mut arena = StepArena::new();
        let a = arena.invoke(&step).unwrap();
        let b = arena.invoke(&step).unwrap();

        let result = template.instantiate(arena, vec![a.into(), b.into()], vec![]);
        assert!(matches!(result, Err(StepflowError::Binding { .. })));
    }

    #[test]
    fn test_same_instance_twice() {
        let template = PipelineTemplate::builder("pair").slots(["a", "b"]).build().unwrap();
        let mut arena = StepArena::new();
        let handle = arena.invoke(&noop_step("empty")).unwrap();

        let err = template
            .instantiate(arena, vec![handle.into(), handle.into()], vec![])
            .unwrap_err();
        assert!(matches!(err, StepflowError::Binding { .. }));
        assert!(err.to_string().contains("same step instance"));
    }

    #[test]
    fn test_descriptor_and_value_rejected() {
        let template = PipelineTemplate::builder("single").slot("only").build().unwrap();
        let step = noop_step("empty");

        let err = template
            .instantiate(StepArena::new(), vec![StepArg::from(&step)], vec![])
            .unwrap_err();
        assert!(err.to_string().contains("without invoking it"));

        let err = template
            .instantiate(StepArena::new(), vec![StepArg::from(json!(3))], vec![])
            .unwrap_err();
        assert!(matches!(err, StepflowError::Binding { .. }));
    }

    #[test]
    fn test_keyword_errors() {
        let template = PipelineTemplate::builder("pair").slots(["a", "b"]).build().unwrap();
        let step = noop_step("empty");

        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let err = template
            .instantiate(arena, vec![], vec![("c", x.into())])
            .unwrap_err();
        assert!(err.to_string().contains("unexpected keyword"));

        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let y = arena.invoke(&step).unwrap();
        let err = template
            .instantiate(arena, vec![x.into()], vec![("a", y.into())])
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let err = template
            .instantiate(arena, vec![x.into()], vec![])
            .unwrap_err();
        assert!(err.to_string().contains("'b' was not filled"));
    }

    #[test]
    fn test_too_many_positional_and_keyword_arguments() {
        let template = PipelineTemplate::builder("pair").slots(["a", "b"]).build().unwrap();
        let step = noop_step("empty");
        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let y = arena.invoke(&step).unwrap();
        let z = arena.invoke(&step).unwrap();

        let err = template
            .instantiate(arena, vec![z.into()], vec![("a", x.into()), ("b", y.into())])
            .unwrap_err();
        assert!(matches!(err, StepflowError::Binding { .. }));
        assert!(err.to_string().contains("takes 2 steps but 3 were given"));
    }

    #[test]
    fn test_same_instance_through_keywords() {
        let template = PipelineTemplate::builder("pair").slots(["a", "b"]).build().unwrap();
        let step = noop_step("empty");

        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let err = template
            .instantiate(arena, vec![], vec![("a", x.into()), ("b", x.into())])
            .unwrap_err();
        assert!(err.to_string().contains("same step instance"));

        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let err = template
            .instantiate(arena, vec![x.into()], vec![("b", x.into())])
            .unwrap_err();
        assert!(matches!(err, StepflowError::Binding { .. }));
        assert!(err.to_string().contains("slots 'a' and 'b'"));
    }

    #[test]
    fn test_keyword_descriptor_and_value_rejected() {
        let template = PipelineTemplate::builder("pair").slots(["a", "b"]).build().unwrap();
        let step = noop_step("empty");

        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let err = template
            .instantiate(arena, vec![x.into()], vec![("b", StepArg::from(&step))])
            .unwrap_err();
        assert!(err.to_string().contains("without invoking it"));

        let mut arena = StepArena::new();
        let x = arena.invoke(&step).unwrap();
        let err = template
            .instantiate(arena, vec![x.into()], vec![("b", StepArg::from(json!("step")))])
            .unwrap_err();
        assert!(matches!(err, StepflowError::Binding { .. }));
        assert!(err.to_string().contains("expects a step instance"));
    }

    #[test]
    fn test_positional_and_keyword_mix() {
        let mut arena = StepArena::new();
        let p = arena.invoke(&producer()).unwrap();
        let c = arena.invoke(&consumer()).unwrap();

        let instance = two_step_template()
            .instantiate(arena, vec![p.into()], vec![("train", c.into())])
            .unwrap();

        assert_eq!(instance.step("load").unwrap().step().name(), "producer");
        assert_eq!(instance.step("train").unwrap().step().name(), "consumer");
        assert!(instance.dag().depends_on("train", "load"));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let template = PipelineTemplate::builder("single").slot("only").build().unwrap();
        let mut other = StepArena::new();
        let foreign = other.invoke(&noop_step("empty")).unwrap();

        let result =
            template.instantiate(StepArena::new(), vec![foreign.into()], vec![]);
        assert!(matches!(result, Err(StepflowError::Binding { .. })));
    }

    #[test]
    fn test_wiring_builds_edges_and_slot_names() {
        let template = two_step_template();
        let mut arena = StepArena::new();
        let p = arena.invoke(&producer()).unwrap();
        let c = arena.invoke(&consumer()).unwrap();

        let instance = template
            .instantiate(arena, vec![], vec![("load", p.into()), ("train", c.into())])
            .unwrap();

        assert_eq!(instance.dag().topological_order(), vec!["load", "train"]);
        assert_eq!(instance.step("train").unwrap().slot_name(), Some("train"));
        assert!(instance.dag().depends_on("train", "load"));
    }

    #[test]
    fn test_wiring_errors() {
        let unconnected = PipelineTemplate::builder("p")
            .slots(["load", "train"])
            .connect(|w| {
                w.call("load", &[])?;
                w.call("train", &[])?;
                Ok(())
            })
            .build()
            .unwrap();
        let uncalled = PipelineTemplate::builder("p")
            .slots(["load", "train"])
            .connect(|w| {
                w.call("load", &[])?;
                Ok(())
            })
            .build()
            .unwrap();
        let twice = PipelineTemplate::builder("p")
            .slots(["load", "train"])
            .connect(|w| {
                let out = w.call("load", &[])?;
                w.call("train", &[("data", out.single()?)])?;
                w.call("load", &[])?;
                Ok(())
            })
            .build()
            .unwrap();

        for template in [unconnected, uncalled, twice] {
            let mut arena = StepArena::new();
            let p = arena.invoke(&producer()).unwrap();
            let c = arena.invoke(&consumer()).unwrap();
            let result = template.instantiate(arena, vec![p.into(), c.into()], vec![]);
            assert!(matches!(result, Err(StepflowError::Binding { .. })));
        }
    }

    #[test]
    fn test_input_type_mismatch() {
        let mismatched = Step::builder("typed_consumer")
            .input("data", "Model")
            .body_fn(|_| async { Ok(crate::step::StepOutputs::new()) })
            .build()
            .unwrap();
        let template = two_step_template();
        let mut arena = StepArena::new();
        let p = arena.invoke(&producer()).unwrap();
        let c = arena.invoke(&mismatched).unwrap();

        let err = template
            .instantiate(arena, vec![p.into(), c.into()], vec![])
            .unwrap_err();
        assert!(err.to_string().contains("expects Model"));
    }
}
