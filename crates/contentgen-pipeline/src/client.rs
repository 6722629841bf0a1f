//! Task client trait: the seam between the engine and remote job execution.
//!
//! The runner only submits work and waits for a terminal result; transport,
//! authentication, retries, and timeouts all live behind [`TaskClient`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use contentgen_types::{PipelineError, Result};

use crate::definitions::{HttpMethod, PollSpec, TaskDefinition};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// One unit of remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub step_id: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub api_version: Option<String>,
    pub inputs: Map<String, Value>,
}

impl TaskRequest {
    pub fn new(task: &TaskDefinition, step_id: &str, inputs: Map<String, Value>) -> Self {
        Self {
            task_id: task.id.clone(),
            step_id: step_id.to_string(),
            endpoint: task.endpoint().to_string(),
            method: task.method.unwrap_or_default(),
            api_version: task.api_version.clone(),
            inputs,
        }
    }
}

/// Identifier of an accepted remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Succeeded,
    Failed,
    Canceled,
}

/// Terminal result of a remote job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub status: CompletionStatus,
    pub payload: Value,
    pub error: Option<String>,
}

impl TaskCompletion {
    pub fn succeeded(payload: Value) -> Self {
        Self {
            status: CompletionStatus::Succeeded,
            payload,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Failed,
            payload: Value::Null,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskClient trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TaskClient: Send + Sync {
    /// Submit work and return as soon as the remote side accepts it.
    async fn submit(&self, request: &TaskRequest) -> Result<JobHandle>;

    /// Wait until the job is terminal. Whether that means streaming or
    /// polling is decided by `poll.strategy`.
    async fn await_completion(&self, job: &JobHandle, poll: &PollSpec) -> Result<TaskCompletion>;
}

// ---------------------------------------------------------------------------
// EchoTaskClient
// ---------------------------------------------------------------------------

/// Dry-run client: every job succeeds at once and its payload is the
/// submitted input object, so pipelines can be exercised without a backend.
#[derive(Default)]
pub struct EchoTaskClient {
    jobs: Mutex<HashMap<String, Map<String, Value>>>,
}

impl EchoTaskClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskClient for EchoTaskClient {
    async fn submit(&self, request: &TaskRequest) -> Result<JobHandle> {
        let id = format!("echo-{}", uuid::Uuid::new_v4());
        tracing::debug!(
            job_id = %id,
            task = %request.task_id,
            endpoint = %request.endpoint,
            "Dry-run submission"
        );
        self.jobs
            .lock()
            .await
            .insert(id.clone(), request.inputs.clone());
        Ok(JobHandle { id })
    }

    async fn await_completion(&self, job: &JobHandle, _poll: &PollSpec) -> Result<TaskCompletion> {
        let inputs = self
            .jobs
            .lock()
            .await
            .remove(&job.id)
            .ok_or_else(|| PipelineError::TaskClient {
                message: format!("unknown job '{}'", job.id),
            })?;
        Ok(TaskCompletion::succeeded(Value::Object(inputs)))
    }
}
