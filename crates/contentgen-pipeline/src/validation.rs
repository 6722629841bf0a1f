//! Static manifest validation.
//!
//! [`validate`] checks that a manifest carries everything a pipeline needs
//! before anything is submitted. It never fails: every problem is reported as
//! a [`Diagnostic`] in a [`ValidationReport`], in a stable order, so calling
//! it twice on the same inputs yields the same report.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use contentgen_types::{AssetManifest, PipelineError};

use crate::bindings::{
    base_scope, iteration_scope, merge_input_bindings, recorded_outputs, resolve_collection,
    resolve_input, LookupTables, ResolutionContext,
};
use crate::definitions::{
    BindingSource, CollectionSource, DefinitionBundle, ForEach, InputBinding, PipelineDefinition,
    PipelineStep, TaskDefinition,
};
use crate::planning::order_steps;
use crate::template::Scope;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        !self
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages(Severity::Error)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages(Severity::Warning)
    }

    fn messages(&self, severity: Severity) -> Vec<String> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .map(|d| d.message.clone())
            .collect()
    }

    fn push(&mut self, severity: Severity, step_id: Option<&str>, message: String) {
        // forEach steps check their inputs once per item; report each problem
        // once per step.
        let step_id = step_id.map(str::to_string);
        if self.diagnostics.iter().any(|d| {
            d.severity == severity && d.step_id == step_id && d.message == message
        }) {
            return;
        }
        self.diagnostics.push(Diagnostic {
            severity,
            message,
            step_id,
        });
    }

    fn error(&mut self, step_id: Option<&str>, err: PipelineError) {
        self.push(Severity::Error, step_id, err.to_string());
    }

    fn warning(&mut self, step_id: &str, message: String) {
        self.push(Severity::Warning, Some(step_id), message);
    }
}

/// Lookup tables and environment snapshot the validator resolves against.
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    pub lookups: LookupTables,
    pub environment: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Check `manifest` against the pipeline named `pipeline_name`.
///
/// A manifest that fails its own schema check, or a pipeline that does not
/// exist, is reported alone; otherwise graph problems come first, followed by
/// per-step findings in declaration order.
pub fn validate(
    definitions: &DefinitionBundle,
    pipeline_name: &str,
    manifest: &Value,
    options: &ValidationOptions,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    let asset = match AssetManifest::from_document(manifest.clone()) {
        Ok(asset) => asset,
        Err(err) => {
            report.error(None, err);
            return report;
        }
    };

    let pipeline = match definitions.pipeline(pipeline_name) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            report.error(None, err);
            return report;
        }
    };

    check_graph(pipeline, &mut report);

    let step_outputs = recorded_outputs(&asset);
    let base = base_scope(&asset);

    for step in &pipeline.steps {
        let Some(task) = definitions.task(&step.task) else {
            report.error(
                Some(&step.id),
                PipelineError::UnknownTask {
                    step: step.id.clone(),
                    task: step.task.clone(),
                },
            );
            continue;
        };

        let ctx = ResolutionContext {
            manifest,
            step_outputs: &step_outputs,
            lookups: &options.lookups,
            environment: &options.environment,
            scope: &base,
        };

        let scopes = match &step.for_each {
            None => vec![base.clone()],
            Some(for_each) => {
                match iteration_scopes(pipeline, step, for_each, &ctx, &mut report) {
                    Some(scopes) => scopes,
                    None => continue,
                }
            }
        };

        let bindings = merge_input_bindings(&task.inputs, &step.inputs);
        for scope in &scopes {
            let ctx = ResolutionContext { scope, ..ctx };
            for binding in &bindings {
                check_binding(pipeline, step, task, binding, &ctx, &mut report);
            }
        }
    }

    tracing::debug!(
        pipeline = %pipeline_name,
        errors = report.errors().len(),
        warnings = report.warnings().len(),
        "Validation finished"
    );
    report
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check_graph(pipeline: &PipelineDefinition, report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    let mut structural = false;

    for step in &pipeline.steps {
        if !seen.insert(step.id.as_str()) {
            structural = true;
            report.error(
                Some(&step.id),
                PipelineError::DuplicateStep {
                    pipeline: pipeline.name.clone(),
                    step: step.id.clone(),
                },
            );
        }
    }

    for step in &pipeline.steps {
        for dependency in &step.depends_on {
            if !pipeline.has_step(dependency) {
                structural = true;
                report.error(
                    Some(&step.id),
                    PipelineError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    },
                );
            }
        }
    }

    if structural {
        return;
    }
    if let Err(err @ PipelineError::CyclicDependency { .. }) = order_steps(pipeline) {
        report.error(None, err);
    }
}

/// One scope per collection item, or `None` when the step's inputs cannot be
/// checked yet.
fn iteration_scopes(
    pipeline: &PipelineDefinition,
    step: &PipelineStep,
    for_each: &ForEach,
    ctx: &ResolutionContext<'_>,
    report: &mut ValidationReport,
) -> Option<Vec<Scope>> {
    if let CollectionSource::Step { step: source, .. } = &for_each.source {
        if !pipeline.has_step(source) {
            report.error(
                Some(&step.id),
                PipelineError::UnknownStepReference {
                    step: source.clone(),
                    binding: for_each.var.clone(),
                },
            );
            return None;
        }
        if !ctx.step_outputs.contains_key(source) {
            report.warning(
                &step.id,
                format!("forEach source uses step '{source}' and cannot be resolved at validate-time."),
            );
            return None;
        }
    }

    match resolve_collection(for_each, &step.id, ctx) {
        Ok(items) => Some(
            items
                .iter()
                .enumerate()
                .map(|(index, item)| iteration_scope(ctx.scope, for_each, item, index))
                .collect(),
        ),
        Err(err) => {
            report.error(Some(&step.id), err);
            None
        }
    }
}

fn check_binding(
    pipeline: &PipelineDefinition,
    step: &PipelineStep,
    task: &TaskDefinition,
    binding: &InputBinding,
    ctx: &ResolutionContext<'_>,
    report: &mut ValidationReport,
) {
    match &binding.source {
        BindingSource::Step { step: source, .. } => {
            if !pipeline.has_step(source) {
                report.error(
                    Some(&step.id),
                    PipelineError::UnknownStepReference {
                        step: source.clone(),
                        binding: binding.name.clone(),
                    },
                );
                return;
            }
            if !ctx.step_outputs.contains_key(source) {
                report.warning(
                    &step.id,
                    format!(
                        "Step binding '{}' resolved at runtime from step '{source}'.",
                        binding.name
                    ),
                );
                return;
            }
        }
        BindingSource::Literal { value } if value.is_null() && binding.default.is_none() => {
            report.warning(
                &step.id,
                format!(
                    "Optional literal input '{}' has no value for step '{}'.",
                    binding.name, step.id
                ),
            );
            return;
        }
        _ => {}
    }

    match resolve_input(binding, ctx) {
        Ok(Some(_)) => {}
        Ok(None) => report.error(
            Some(&step.id),
            PipelineError::MissingRequiredInput {
                input: binding.name.clone(),
                step: step.id.clone(),
                task: task.id.clone(),
            },
        ),
        Err(err) => report.error(Some(&step.id), err),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
