//! Pipeline and task definitions, and the file-system loader that reads them.
//!
//! Pipelines live in `*.pipeline.json` files; tasks are any `*.json` document
//! carrying an `id`. Loading checks each document's shape but leaves
//! cross-references (step to task, `dependsOn`) to validation and planning.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use contentgen_types::{PipelineError, Result};

pub const PIPELINE_SUFFIX: &str = ".pipeline.json";

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// How one named task input is obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub name: String,
    #[serde(flatten)]
    pub source: BindingSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Where an input value comes from. Each variant carries exactly the fields
/// its source needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum BindingSource {
    Manifest { path: String },
    Step { step: String, path: String },
    Literal { value: Value },
    Env { path: String },
    Lookup { table: String, key: String },
}

impl BindingSource {
    pub fn kind(&self) -> &'static str {
        match self {
            BindingSource::Manifest { .. } => "manifest",
            BindingSource::Step { .. } => "step",
            BindingSource::Literal { .. } => "literal",
            BindingSource::Env { .. } => "env",
            BindingSource::Lookup { .. } => "lookup",
        }
    }
}

/// How one field of a task result is folded back into the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBinding {
    pub name: String,
    pub response_path: String,
    /// Filename template; when present the value is an artifact reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

// ---------------------------------------------------------------------------
// Task definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStrategy {
    #[default]
    Stream,
    Poll,
}

/// Completion-watching parameters handed to the task client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSpec {
    #[serde(default)]
    pub strategy: PollStrategy,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub outputs: Vec<OutputBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollSpec>,
}

impl TaskDefinition {
    /// The endpoint to submit to; defaults to the task id.
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(&self.id)
    }

    pub fn has_artifacts(&self) -> bool {
        self.outputs.iter().any(|o| o.artifact.is_some())
    }
}

// ---------------------------------------------------------------------------
// Pipeline definitions
// ---------------------------------------------------------------------------

/// Collection a `forEach` step iterates over. Same sources as an input
/// binding, except a lookup without a key yields every value of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum CollectionSource {
    Manifest {
        path: String,
    },
    Step {
        step: String,
        path: String,
    },
    Literal {
        value: Value,
    },
    Env {
        path: String,
    },
    Lookup {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEach {
    #[serde(flatten)]
    pub source: CollectionSource,
    /// Scope variable bound to the current element.
    #[serde(rename = "as")]
    pub var: String,
}

impl ForEach {
    /// Scope variable holding the current element's position.
    pub fn index_var(&self) -> String {
        format!("{}_index", self.var)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub id: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEach>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputBinding>,
    /// Manifest path to output path, applied after the step succeeds.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub state_mapping: IndexMap<String, String>,
    #[serde(default)]
    pub skip_artifacts: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub steps: Vec<PipelineStep>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub state_mapping: IndexMap<String, String>,
}

impl PipelineDefinition {
    pub fn step(&self, id: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn has_step(&self, id: &str) -> bool {
        self.step(id).is_some()
    }
}

// ---------------------------------------------------------------------------
// DefinitionBundle
// ---------------------------------------------------------------------------

/// Every loaded pipeline (by name) and task (by id).
#[derive(Debug, Clone, Default)]
pub struct DefinitionBundle {
    pub pipelines: BTreeMap<String, PipelineDefinition>,
    pub tasks: BTreeMap<String, TaskDefinition>,
}

impl DefinitionBundle {
    /// Build a bundle from already-parsed definitions, rejecting duplicate
    /// pipeline names and task ids.
    pub fn from_parts(
        pipelines: impl IntoIterator<Item = PipelineDefinition>,
        tasks: impl IntoIterator<Item = TaskDefinition>,
    ) -> Result<Self> {
        let mut bundle = Self::default();
        for pipeline in pipelines {
            bundle.insert_pipeline(pipeline, "<memory>")?;
        }
        for task in tasks {
            bundle.insert_task(task, "<memory>")?;
        }
        Ok(bundle)
    }

    pub fn pipeline(&self, name: &str) -> Result<&PipelineDefinition> {
        self.pipelines
            .get(name)
            .ok_or_else(|| PipelineError::UnknownPipeline {
                name: name.to_string(),
            })
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.get(id)
    }

    fn insert_pipeline(&mut self, pipeline: PipelineDefinition, file: &str) -> Result<()> {
        if self.pipelines.contains_key(&pipeline.name) {
            return Err(PipelineError::DuplicateDefinition {
                kind: "pipeline".into(),
                id: pipeline.name,
                file: file.to_string(),
            });
        }
        self.pipelines.insert(pipeline.name.clone(), pipeline);
        Ok(())
    }

    fn insert_task(&mut self, task: TaskDefinition, file: &str) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(PipelineError::DuplicateDefinition {
                kind: "task".into(),
                id: task.id,
                file: file.to_string(),
            });
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load every pipeline and task definition from the two directories.
pub fn load_definitions(pipelines_dir: &Path, tasks_dir: &Path) -> Result<DefinitionBundle> {
    let mut bundle = DefinitionBundle::default();

    for path in json_files(pipelines_dir)? {
        let is_pipeline = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PIPELINE_SUFFIX));
        if !is_pipeline {
            continue;
        }
        let label = path.display().to_string();
        let text = std::fs::read_to_string(&path)?;
        let pipeline = parse_pipeline(&label, &text)?;
        tracing::debug!(file = %label, pipeline = %pipeline.name, "Loaded pipeline definition");
        bundle.insert_pipeline(pipeline, &label)?;
    }

    for path in json_files(tasks_dir)? {
        let label = path.display().to_string();
        let text = std::fs::read_to_string(&path)?;
        let document = parse_json(&label, &text)?;
        if document.get("id").is_none() {
            tracing::debug!(file = %label, "Skipping document without an id");
            continue;
        }
        let task = parse_task_document(&label, &document)?;
        tracing::debug!(file = %label, task = %task.id, "Loaded task definition");
        bundle.insert_task(task, &label)?;
    }

    tracing::info!(
        pipelines = bundle.pipelines.len(),
        tasks = bundle.tasks.len(),
        "Definitions loaded"
    );
    Ok(bundle)
}

/// Read every `*.json` file in `dir` as a lookup table named after its stem.
pub fn load_lookup_tables(dir: &Path) -> Result<HashMap<String, Value>> {
    let mut tables = HashMap::new();
    for path in json_files(dir)? {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let label = path.display().to_string();
        let text = std::fs::read_to_string(&path)?;
        let table = parse_json(&label, &text)?;
        tracing::debug!(file = %label, table = %name, "Loaded lookup table");
        tables.insert(name.to_string(), table);
    }
    Ok(tables)
}

/// Parse one pipeline document. `file` only labels errors.
pub fn parse_pipeline(file: &str, text: &str) -> Result<PipelineDefinition> {
    let document = parse_json(file, text)?;
    PipelineDefinition::deserialize(&document).map_err(|err| {
        let (path, message) = locate_pipeline_violation(&document, err);
        PipelineError::SchemaViolation {
            file: file.to_string(),
            path,
            message,
        }
    })
}

/// Parse one task document. `file` only labels errors.
pub fn parse_task(file: &str, text: &str) -> Result<TaskDefinition> {
    let document = parse_json(file, text)?;
    parse_task_document(file, &document)
}

fn parse_task_document(file: &str, document: &Value) -> Result<TaskDefinition> {
    TaskDefinition::deserialize(document).map_err(|err| {
        let (path, message) = locate_task_violation(document, err);
        PipelineError::SchemaViolation {
            file: file.to_string(),
            path,
            message,
        }
    })
}

fn parse_json(file: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|err| PipelineError::SchemaViolation {
        file: file.to_string(),
        path: "$".into(),
        message: err.to_string(),
    })
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Violation paths
// ---------------------------------------------------------------------------

// serde reports *what* is wrong but not *where*; re-deserialize the nested
// parts one at a time to find the innermost failing element.

fn first_failure<T: DeserializeOwned>(items: &[Value]) -> Option<(usize, serde_json::Error)> {
    items
        .iter()
        .enumerate()
        .find_map(|(i, item)| T::deserialize(item).err().map(|e| (i, e)))
}

fn array_at<'a>(document: &'a Value, key: &str) -> &'a [Value] {
    document
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn locate_pipeline_violation(document: &Value, err: serde_json::Error) -> (String, String) {
    for (i, step) in array_at(document, "steps").iter().enumerate() {
        let Err(step_err) = PipelineStep::deserialize(step) else {
            continue;
        };
        let prefix = format!("steps[{i}]");
        if let Some((j, e)) = first_failure::<InputBinding>(array_at(step, "inputs")) {
            return (format!("{prefix}.inputs[{j}]"), e.to_string());
        }
        if let Some(Err(e)) = step.get("forEach").map(|v| ForEach::deserialize(v)) {
            return (format!("{prefix}.forEach"), e.to_string());
        }
        return (prefix, step_err.to_string());
    }
    ("$".into(), err.to_string())
}

fn locate_task_violation(document: &Value, err: serde_json::Error) -> (String, String) {
    if let Some((i, e)) = first_failure::<InputBinding>(array_at(document, "inputs")) {
        return (format!("inputs[{i}]"), e.to_string());
    }
    if let Some((i, e)) = first_failure::<OutputBinding>(array_at(document, "outputs")) {
        return (format!("outputs[{i}]"), e.to_string());
    }
    if let Some(Err(e)) = document.get("poll").map(|v| PollSpec::deserialize(v)) {
        return ("poll".into(), e.to_string());
    }
    ("$".into(), err.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
