//! Shared types and errors for the content pipeline engine.
//!
//! This crate provides the foundational types used across the other crates:
//! - `PipelineError`: unified error taxonomy
//! - `AssetManifest`: the durable per-asset document a run reads and writes
//! - `TaskState` / `TaskStatus`: recorded progress of a single pipeline step

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Unified error type for definition loading, validation, and execution.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // === Definition Errors ===
    #[error("Schema violation in {file} at '{path}': {message}")]
    SchemaViolation {
        file: String,
        path: String,
        message: String,
    },

    #[error("Duplicate {kind} definition '{id}' in {file}")]
    DuplicateDefinition {
        kind: String,
        id: String,
        file: String,
    },

    // === Reference Errors ===
    #[error("Pipeline definition not found: {name}")]
    UnknownPipeline { name: String },

    #[error("Task definition not found for step '{step}': {task}")]
    UnknownTask { step: String, task: String },

    #[error("Step '{step}' is not part of pipeline '{pipeline}'")]
    UnknownStep { pipeline: String, step: String },

    #[error("Step binding references missing step '{step}' for '{binding}'")]
    UnknownStepReference { step: String, binding: String },

    #[error("Lookup table '{table}' missing for '{binding}'")]
    UnknownLookupTable { table: String, binding: String },

    #[error("Step '{step}' depends on missing step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Duplicate step id '{step}' in pipeline '{pipeline}'")]
    DuplicateStep { pipeline: String, step: String },

    #[error("Cyclic dependency detected between steps: {}", steps.join(", "))]
    CyclicDependency { steps: Vec<String> },

    // === Validation Errors ===
    #[error("Missing required input '{input}' for step '{step}' (task '{task}').")]
    MissingRequiredInput {
        input: String,
        step: String,
        task: String,
    },

    // === Execution Errors ===
    #[error("forEach source for step '{step}' did not resolve to an array")]
    ForEachNotArray { step: String },

    #[error("Manifest not found at {path}")]
    ManifestNotFound { path: String },

    #[error("Manifest schema invalid: {0}")]
    InvalidManifest(String),

    #[error("Task client error: {message}")]
    TaskClient { message: String },

    #[error("Artifact '{name}' could not be stored: {message}")]
    Artifact { name: String, message: String },

    #[error("Step '{step}' failed: {cause}")]
    StepExecutionFailed {
        step: String,
        cause: String,
        manifest: Box<AssetManifest>,
    },

    #[error("Pipeline run was canceled")]
    Canceled { manifest: Box<AssetManifest> },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Returns `true` for definition and graph problems that prevent any
    /// step from executing.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PipelineError::SchemaViolation { .. }
                | PipelineError::DuplicateDefinition { .. }
                | PipelineError::UnknownPipeline { .. }
                | PipelineError::UnknownTask { .. }
                | PipelineError::UnknownStep { .. }
                | PipelineError::UnknownStepReference { .. }
                | PipelineError::UnknownLookupTable { .. }
                | PipelineError::UnknownDependency { .. }
                | PipelineError::DuplicateStep { .. }
                | PipelineError::CyclicDependency { .. }
        )
    }

    /// The partial manifest persisted before the run stopped, if any.
    pub fn manifest(&self) -> Option<&AssetManifest> {
        match self {
            PipelineError::StepExecutionFailed { manifest, .. }
            | PipelineError::Canceled { manifest } => Some(manifest),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, PipelineError>`.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// TaskStatus: lifecycle of a recorded step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskState: per-step record inside the manifest
// ---------------------------------------------------------------------------

/// Recorded progress of one step. Unknown fields survive a load/save cycle
/// through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Map::is_empty"
    )]
    pub outputs: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskState {
    pub fn is_succeeded(&self) -> bool {
        self.status == Some(TaskStatus::Succeeded)
    }

    /// Reset the transient fields for a fresh attempt, keeping passthrough data.
    pub fn begin(&mut self) {
        self.task_id = None;
        self.status = Some(TaskStatus::Pending);
        self.outputs.clear();
        self.artifacts.clear();
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
    }

    /// Move to a terminal status and stamp the completion time.
    pub fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = Some(status);
        self.completed_at = Some(Utc::now());
        self.error = error;
    }
}

// ---------------------------------------------------------------------------
// AssetManifest: the durable document a pipeline run reads and writes
// ---------------------------------------------------------------------------

/// The manifest for one asset. Only `id`, `name`, and `type` are required;
/// every other top-level field is carried through `extra` unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tasks: BTreeMap<String, TaskState>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssetManifest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        asset_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            asset_type: asset_type.into(),
            seed: None,
            tasks: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Parse a manifest from an untyped document, reporting every schema
    /// problem at once as [`PipelineError::InvalidManifest`].
    pub fn from_document(document: Value) -> Result<Self> {
        let problems = Self::check_document(&document);
        if !problems.is_empty() {
            return Err(PipelineError::InvalidManifest(problems.join("; ")));
        }
        serde_json::from_value(document).map_err(|e| PipelineError::InvalidManifest(e.to_string()))
    }

    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn task(&self, step_id: &str) -> Option<&TaskState> {
        self.tasks.get(step_id)
    }

    /// The state for `step_id`, created empty when the step has no record yet.
    pub fn task_mut(&mut self, step_id: &str) -> &mut TaskState {
        self.tasks.entry(step_id.to_string()).or_default()
    }

    pub fn step_succeeded(&self, step_id: &str) -> bool {
        self.task(step_id).is_some_and(TaskState::is_succeeded)
    }

    /// Structural checks over an untyped manifest document.
    ///
    /// Returns one `"<path>: <problem>"` entry per violation, in field order.
    /// An empty list means the document can be deserialized.
    pub fn check_document(document: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        let Some(object) = document.as_object() else {
            problems.push("manifest: expected an object".to_string());
            return problems;
        };

        for field in ["id", "name", "type"] {
            match object.get(field) {
                None => problems.push(format!("{field}: required")),
                Some(Value::String(_)) => {}
                Some(other) => problems.push(format!(
                    "{field}: expected string, received {}",
                    kind_of(other)
                )),
            }
        }

        if let Some(seed) = object.get("seed") {
            if !seed.is_null() && seed.as_u64().is_none() {
                problems.push("seed: expected a non-negative integer".to_string());
            }
        }

        match object.get("tasks") {
            None | Some(Value::Null) => {}
            Some(Value::Object(tasks)) => {
                for (step_id, state) in tasks {
                    check_task_state(&format!("tasks.{step_id}"), state, &mut problems);
                }
            }
            Some(other) => problems.push(format!(
                "tasks: expected object, received {}",
                kind_of(other)
            )),
        }

        problems
    }
}

fn check_task_state(prefix: &str, state: &Value, problems: &mut Vec<String>) {
    let Some(state) = state.as_object() else {
        problems.push(format!("{prefix}: expected object, received {}", kind_of(state)));
        return;
    };

    if let Some(task_id) = state.get("taskId") {
        if !task_id.is_string() && !task_id.is_null() {
            problems.push(format!(
                "{prefix}.taskId: expected string, received {}",
                kind_of(task_id)
            ));
        }
    }

    if let Some(status) = state.get("status") {
        let known = status
            .as_str()
            .is_some_and(|s| TaskStatus::ALL.iter().any(|t| t.as_str() == s));
        if !known && !status.is_null() {
            let expected: Vec<&str> = TaskStatus::ALL.iter().map(TaskStatus::as_str).collect();
            problems.push(format!(
                "{prefix}.status: expected one of {}",
                expected.join(" | ")
            ));
        }
    }

    match state.get("outputs") {
        None | Some(Value::Null) | Some(Value::Object(_)) => {}
        Some(other) => problems.push(format!(
            "{prefix}.outputs: expected object, received {}",
            kind_of(other)
        )),
    }

    match state.get("artifacts") {
        None | Some(Value::Null) => {}
        Some(Value::Object(artifacts)) => {
            for (name, reference) in artifacts {
                if !reference.is_string() {
                    problems.push(format!(
                        "{prefix}.artifacts.{name}: expected string, received {}",
                        kind_of(reference)
                    ));
                }
            }
        }
        Some(other) => problems.push(format!(
            "{prefix}.artifacts: expected object, received {}",
            kind_of(other)
        )),
    }
}

/// A `null` map field reads as an empty map, matching what the manifest
/// check accepts.
fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Short JSON type name used in diagnostics.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
