//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (progress printers, API run records) can follow a run
//! without coupling to the runner internals.

use serde::{Deserialize, Serialize};

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        pipeline_name: String,
        asset_id: String,
        step_count: usize,
    },
    PipelineCompleted {
        pipeline_name: String,
        executed_steps: Vec<String>,
        duration_ms: u64,
    },
    PipelineFailed {
        pipeline_name: String,
        step_id: String,
        error: String,
    },
    PipelineCanceled {
        pipeline_name: String,
    },
    StepStarted {
        step_id: String,
        task_id: String,
    },
    StepSkipped {
        step_id: String,
    },
    IterationStarted {
        step_id: String,
        index: usize,
        total: usize,
    },
    StepSubmitted {
        step_id: String,
        job_id: String,
    },
    StepCompleted {
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    ArtifactStored {
        step_id: String,
        key: String,
        filename: String,
    },
    ManifestSaved {
        path: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
