//! Execution ordering and pre-flight reference checks.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;

use contentgen_types::{AssetManifest, PipelineError, Result};

use crate::bindings::LookupTables;
use crate::definitions::{
    BindingSource, CollectionSource, DefinitionBundle, PipelineDefinition, PipelineStep,
};

/// Order steps so every dependency precedes its dependents.
///
/// Among steps that are ready at the same time the earlier-declared one runs
/// first, so a pipeline without `dependsOn` runs in declaration order.
pub fn order_steps(pipeline: &PipelineDefinition) -> Result<Vec<&PipelineStep>> {
    let mut lookup: IndexMap<&str, usize> = IndexMap::new();
    for (position, step) in pipeline.steps.iter().enumerate() {
        if lookup.insert(step.id.as_str(), position).is_some() {
            return Err(PipelineError::DuplicateStep {
                pipeline: pipeline.name.clone(),
                step: step.id.clone(),
            });
        }
    }

    let mut in_degrees = vec![0usize; pipeline.steps.len()];
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();

    for (position, step) in pipeline.steps.iter().enumerate() {
        let mut seen = HashSet::new();
        for dependency in &step.depends_on {
            let Some(&dep_position) = lookup.get(dependency.as_str()) else {
                return Err(PipelineError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            };
            if dep_position == position {
                return Err(PipelineError::CyclicDependency {
                    steps: vec![step.id.clone()],
                });
            }
            if !seen.insert(dep_position) {
                continue;
            }
            in_degrees[position] += 1;
            dependents.entry(dep_position).or_default().push(position);
        }
    }

    let mut ready: BTreeSet<usize> = in_degrees
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(position, _)| position)
        .collect();

    let mut ordered = Vec::with_capacity(pipeline.steps.len());
    while let Some(position) = ready.pop_first() {
        ordered.push(&pipeline.steps[position]);
        for &child in dependents.get(&position).into_iter().flatten() {
            in_degrees[child] -= 1;
            if in_degrees[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if ordered.len() != pipeline.steps.len() {
        let mut remaining: Vec<String> = in_degrees
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(position, _)| pipeline.steps[position].id.clone())
            .collect();
        remaining.sort();
        return Err(PipelineError::CyclicDependency { steps: remaining });
    }

    Ok(ordered)
}

/// The steps a run will visit, in execution order.
///
/// With a `target`, only that step and the dependencies it still needs are
/// included: a dependency that already SUCCEEDED in `manifest` is left out
/// together with everything behind it.
pub fn plan_execution<'p>(
    pipeline: &'p PipelineDefinition,
    manifest: &AssetManifest,
    target: Option<&str>,
) -> Result<Vec<&'p PipelineStep>> {
    let ordered = order_steps(pipeline)?;
    let Some(target) = target else {
        return Ok(ordered);
    };

    let target_step = pipeline
        .step(target)
        .ok_or_else(|| PipelineError::UnknownStep {
            pipeline: pipeline.name.clone(),
            step: target.to_string(),
        })?;

    let mut needed: HashSet<&str> = HashSet::new();
    let mut stack = vec![target_step];
    while let Some(step) = stack.pop() {
        if !needed.insert(step.id.as_str()) {
            continue;
        }
        for dependency in &step.depends_on {
            if manifest.step_succeeded(dependency) {
                continue;
            }
            if let Some(dep) = pipeline.step(dependency) {
                stack.push(dep);
            }
        }
    }

    Ok(ordered
        .into_iter()
        .filter(|step| needed.contains(step.id.as_str()))
        .collect())
}

/// Dangling-reference checks run before any task is submitted: every step's
/// task is loaded, every step reference names a step of this pipeline, and
/// every lookup table is registered.
pub fn check_references(
    definitions: &DefinitionBundle,
    pipeline: &PipelineDefinition,
    lookups: &LookupTables,
) -> Result<()> {
    for step in &pipeline.steps {
        let task = definitions
            .task(&step.task)
            .ok_or_else(|| PipelineError::UnknownTask {
                step: step.id.clone(),
                task: step.task.clone(),
            })?;

        if let Some(for_each) = &step.for_each {
            match &for_each.source {
                CollectionSource::Step { step: source, .. } if !pipeline.has_step(source) => {
                    return Err(PipelineError::UnknownStepReference {
                        step: source.clone(),
                        binding: for_each.var.clone(),
                    });
                }
                CollectionSource::Lookup { table, .. } if !lookups.contains_key(table) => {
                    return Err(PipelineError::UnknownLookupTable {
                        table: table.clone(),
                        binding: for_each.var.clone(),
                    });
                }
                _ => {}
            }
        }

        for binding in task.inputs.iter().chain(&step.inputs) {
            match &binding.source {
                BindingSource::Step { step: source, .. } if !pipeline.has_step(source) => {
                    return Err(PipelineError::UnknownStepReference {
                        step: source.clone(),
                        binding: binding.name.clone(),
                    });
                }
                BindingSource::Lookup { table, .. } if !lookups.contains_key(table) => {
                    return Err(PipelineError::UnknownLookupTable {
                        table: table.clone(),
                        binding: binding.name.clone(),
                    });
                }
                _ => {}
            }
        }
    }
    Ok(())
}
