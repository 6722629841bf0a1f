//! Declarative content pipeline engine.
//!
//! This crate loads pipeline and task definitions, resolves input and output
//! bindings, validates manifests statically, and runs pipelines step by step
//! against a task client, persisting the asset manifest as it goes.

pub mod artifacts;
pub mod bindings;
pub mod client;
pub mod definitions;
pub mod document;
pub mod events;
pub mod planning;
pub mod runner;
pub mod store;
pub mod template;
pub mod validation;

pub use artifacts::{plan_artifacts, ArtifactStore, FsArtifactStore, PlannedArtifact};
pub use bindings::{
    base_scope, iteration_scope, merge_input_bindings, recorded_outputs, resolve_collection,
    resolve_input, resolve_inputs, resolve_output, resolve_outputs, LookupTables,
    ResolutionContext,
};
pub use client::{
    CompletionStatus, EchoTaskClient, JobHandle, TaskClient, TaskCompletion, TaskRequest,
};
pub use definitions::{
    load_definitions, load_lookup_tables, parse_pipeline, parse_task, BindingSource,
    CollectionSource, DefinitionBundle, ForEach, HttpMethod, InputBinding, OutputBinding,
    PipelineDefinition, PipelineStep, PollSpec, PollStrategy, TaskDefinition,
};
pub use document::{get_path, set_path};
pub use events::{EventEmitter, PipelineEvent};
pub use planning::{check_references, order_steps, plan_execution};
pub use runner::{PipelineRunner, RunHandle, RunOptions};
pub use store::{load_manifest, save_manifest, FsManifestStore, ManifestStore, MANIFEST_FILE};
pub use template::{expand, expand_value, Scope};
pub use validation::{validate, Diagnostic, Severity, ValidationOptions, ValidationReport};
