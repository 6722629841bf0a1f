//! Turns binding declarations into concrete values.
//!
//! Inputs resolve against a [`ResolutionContext`]: the manifest document, the
//! outputs of steps that have run, lookup tables, an environment snapshot, and
//! the template scope. Outputs resolve against a task's result payload.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use contentgen_types::{AssetManifest, PipelineError, Result};

use crate::definitions::{BindingSource, CollectionSource, ForEach, InputBinding, OutputBinding};
use crate::document::get_path;
use crate::template::{expand, expand_value, Scope};

/// Named read-only documents referenced by `lookup` bindings.
pub type LookupTables = HashMap<String, Value>;

/// Everything an input binding may read from.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    pub manifest: &'a Value,
    /// Recorded outputs per step id, each an object of output name to value.
    pub step_outputs: &'a HashMap<String, Value>,
    pub lookups: &'a LookupTables,
    pub environment: &'a HashMap<String, String>,
    pub scope: &'a Scope,
}

/// Template variables every step sees: `seed` and `assetId`.
pub fn base_scope(manifest: &AssetManifest) -> Scope {
    let mut scope = Scope::new();
    scope.insert("seed".into(), Value::from(manifest.seed.unwrap_or(0)));
    scope.insert("assetId".into(), Value::String(manifest.id.clone()));
    scope
}

/// Outputs of steps the manifest records as SUCCEEDED, keyed by step id.
pub fn recorded_outputs(manifest: &AssetManifest) -> HashMap<String, Value> {
    manifest
        .tasks
        .iter()
        .filter(|(_, state)| state.is_succeeded())
        .map(|(step, state)| (step.clone(), Value::Object(state.outputs.clone())))
        .collect()
}

/// `scope` extended with the `forEach` element and its position.
pub fn iteration_scope(scope: &Scope, for_each: &ForEach, item: &Value, index: usize) -> Scope {
    let mut scope = scope.clone();
    scope.insert(for_each.var.clone(), item.clone());
    scope.insert(for_each.index_var(), Value::from(index));
    scope
}

/// Task-level bindings overlaid with step-level ones, matched by `name`.
///
/// A step binding replaces the task binding of the same name in place, so
/// the order of task inputs is kept; new names are appended.
pub fn merge_input_bindings<'a>(
    task_inputs: &'a [InputBinding],
    step_inputs: &'a [InputBinding],
) -> Vec<&'a InputBinding> {
    let mut merged: IndexMap<&str, &InputBinding> = IndexMap::new();
    for binding in task_inputs.iter().chain(step_inputs) {
        merged.insert(binding.name.as_str(), binding);
    }
    merged.into_values().collect()
}

/// Resolve one input binding.
///
/// `Ok(None)` means the input is absent and must be omitted. A null result
/// counts as absent, so the binding's default applies to absent or null
/// values but never to `0`, `false`, or `""`.
pub fn resolve_input(binding: &InputBinding, ctx: &ResolutionContext<'_>) -> Result<Option<Value>> {
    let resolved = match &binding.source {
        BindingSource::Manifest { path } => get_path(ctx.manifest, &expand(path, ctx.scope)).cloned(),
        BindingSource::Step { step, path } => {
            step_value(ctx, step, path, &binding.name)?
        }
        BindingSource::Literal { value } => Some(expand_value(value, ctx.scope)),
        BindingSource::Env { path } => env_value(ctx, path),
        BindingSource::Lookup { table, key } => {
            lookup_value(ctx, table, Some(key), &binding.name)?
        }
    };

    Ok(resolved
        .filter(|v| !v.is_null())
        .or_else(|| binding.default.as_ref().map(|d| expand_value(d, ctx.scope))))
}

/// Resolve every binding into the task-input object, skipping absent values.
pub fn resolve_inputs(
    bindings: &[&InputBinding],
    ctx: &ResolutionContext<'_>,
) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for binding in bindings {
        if let Some(value) = resolve_input(binding, ctx)? {
            inputs.insert(binding.name.clone(), value);
        }
    }
    Ok(inputs)
}

/// Resolve the collection a `forEach` step iterates over.
pub fn resolve_collection(
    for_each: &ForEach,
    step_id: &str,
    ctx: &ResolutionContext<'_>,
) -> Result<Vec<Value>> {
    let resolved = match &for_each.source {
        CollectionSource::Manifest { path } => {
            get_path(ctx.manifest, &expand(path, ctx.scope)).cloned()
        }
        CollectionSource::Step { step, path } => step_value(ctx, step, path, &for_each.var)?,
        CollectionSource::Literal { value } => Some(value.clone()),
        CollectionSource::Env { path } => env_value(ctx, path),
        CollectionSource::Lookup { table, key } => {
            lookup_value(ctx, table, key.as_deref(), &for_each.var)?
        }
    };

    match resolved {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(PipelineError::ForEachNotArray {
            step: step_id.to_string(),
        }),
    }
}

/// Read an output binding's value from a task result. Absent paths give `None`.
pub fn resolve_output(binding: &OutputBinding, payload: &Value) -> Option<Value> {
    get_path(payload, &binding.response_path).cloned()
}

/// Resolve every output binding into an object, omitting absent values.
pub fn resolve_outputs(bindings: &[OutputBinding], payload: &Value) -> Map<String, Value> {
    bindings
        .iter()
        .filter_map(|b| resolve_output(b, payload).map(|v| (b.name.clone(), v)))
        .collect()
}

fn step_value(
    ctx: &ResolutionContext<'_>,
    step: &str,
    path: &str,
    binding: &str,
) -> Result<Option<Value>> {
    let outputs = ctx
        .step_outputs
        .get(step)
        .ok_or_else(|| PipelineError::UnknownStepReference {
            step: step.to_string(),
            binding: binding.to_string(),
        })?;
    Ok(get_path(outputs, &expand(path, ctx.scope)).cloned())
}

fn env_value(ctx: &ResolutionContext<'_>, name: &str) -> Option<Value> {
    ctx.environment
        .get(&expand(name, ctx.scope))
        .map(|v| Value::String(v.clone()))
}

/// A key is tried as a literal top-level entry first (table keys often
/// contain dots), then as a dotted path. No key yields every table value.
fn lookup_value(
    ctx: &ResolutionContext<'_>,
    table: &str,
    key: Option<&str>,
    binding: &str,
) -> Result<Option<Value>> {
    let document = ctx
        .lookups
        .get(table)
        .ok_or_else(|| PipelineError::UnknownLookupTable {
            table: table.to_string(),
            binding: binding.to_string(),
        })?;

    let Some(key) = key else {
        return Ok(match document {
            Value::Object(map) => Some(Value::Array(map.values().cloned().collect())),
            Value::Array(_) => Some(document.clone()),
            _ => None,
        });
    };

    let key = expand(key, ctx.scope);
    let direct = document.as_object().and_then(|map| map.get(&key));
    Ok(direct.or_else(|| get_path(document, &key)).cloned())
}
