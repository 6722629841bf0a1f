//! Pipeline runner: drives the steps of one pipeline against one manifest.
//!
//! Lifecycle: resolve the pipeline and check its references, load the
//! manifest, plan the steps, then execute them one at a time in dependency
//! order. The manifest is persisted after every unit of work so an
//! interrupted run can be resumed; steps already SUCCEEDED are skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use contentgen_types::{AssetManifest, PipelineError, Result, TaskStatus};

use crate::artifacts::{plan_artifacts, ArtifactStore, PlannedArtifact};
use crate::bindings::{
    base_scope, iteration_scope, merge_input_bindings, recorded_outputs, resolve_collection,
    resolve_inputs, resolve_outputs, LookupTables, ResolutionContext,
};
use crate::client::{CompletionStatus, TaskClient, TaskRequest};
use crate::definitions::{DefinitionBundle, PipelineDefinition, PipelineStep, TaskDefinition};
use crate::document::{get_path, set_path};
use crate::events::{EventEmitter, PipelineEvent};
use crate::planning::{check_references, plan_execution};
use crate::store::{manifest_path, FsManifestStore, ManifestStore};
use crate::template::Scope;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Parameters for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pipeline_name: String,
    pub asset_dir: PathBuf,
    /// Run only this step plus the dependencies it still needs.
    pub step: Option<String>,
    /// Used when the asset directory has no manifest yet.
    pub initial_manifest: Option<AssetManifest>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(pipeline_name: impl Into<String>, asset_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            asset_dir: asset_dir.into(),
            step: None,
            initial_manifest: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_manifest(mut self, manifest: AssetManifest) -> Self {
        self.initial_manifest = Some(manifest);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A run started with [`PipelineRunner::spawn`].
pub struct RunHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<AssetManifest>>,
}

impl RunHandle {
    /// Ask the run to stop at the next step or iteration boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<AssetManifest> {
        self.join
            .await
            .map_err(|e| PipelineError::Other(format!("Pipeline task aborted: {e}")))?
    }
}

enum StepFlow {
    Completed,
    Canceled,
}

/// Mutable state threaded through one run.
struct RunState<'a> {
    pipeline: &'a PipelineDefinition,
    asset_dir: &'a Path,
    manifest: AssetManifest,
    step_outputs: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

/// Executes pipelines from a [`DefinitionBundle`] through a [`TaskClient`].
///
/// Collaborators are injected: the runner never reads process environment
/// or global state on its own.
pub struct PipelineRunner {
    definitions: Arc<DefinitionBundle>,
    client: Arc<dyn TaskClient>,
    manifests: Arc<dyn ManifestStore>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    lookups: LookupTables,
    environment: HashMap<String, String>,
    events: EventEmitter,
}

impl PipelineRunner {
    pub fn new(definitions: Arc<DefinitionBundle>, client: Arc<dyn TaskClient>) -> Self {
        Self {
            definitions,
            client,
            manifests: Arc::new(FsManifestStore),
            artifacts: None,
            lookups: LookupTables::new(),
            environment: HashMap::new(),
            events: EventEmitter::default(),
        }
    }

    pub fn with_manifest_store(mut self, store: Arc<dyn ManifestStore>) -> Self {
        self.manifests = store;
        self
    }

    /// Without an artifact store, `artifact` output bindings are recorded
    /// as outputs only.
    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn with_lookups(mut self, lookups: LookupTables) -> Self {
        self.lookups = lookups;
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Run in a background task. Cancel through the returned handle.
    pub fn spawn(self: Arc<Self>, options: RunOptions) -> RunHandle {
        let cancel = options.cancel.clone();
        let join = tokio::spawn(async move { self.run(options).await });
        RunHandle { cancel, join }
    }

    /// Execute the pipeline and return the final manifest.
    ///
    /// Structural problems (unknown pipeline, task, step, or lookup table,
    /// and dependency cycles) are returned before any task is submitted. A
    /// failing step yields [`PipelineError::StepExecutionFailed`] carrying the
    /// manifest as persisted, and cancellation yields
    /// [`PipelineError::Canceled`] likewise.
    pub async fn run(&self, options: RunOptions) -> Result<AssetManifest> {
        let started = Instant::now();
        let pipeline = self.definitions.pipeline(&options.pipeline_name)?;
        check_references(&self.definitions, pipeline, &self.lookups)?;

        let asset_dir = options.asset_dir.as_path();
        let mut manifest = match self.manifests.load(asset_dir).await? {
            Some(manifest) => manifest,
            None => options
                .initial_manifest
                .clone()
                .ok_or_else(|| PipelineError::ManifestNotFound {
                    path: manifest_path(asset_dir).display().to_string(),
                })?,
        };

        let plan = plan_execution(pipeline, &manifest, options.step.as_deref())?;

        if manifest.seed.is_none() {
            let seed = u64::from(uuid::Uuid::new_v4().as_u128() as u32);
            tracing::debug!(seed, "Generated asset seed");
            manifest.seed = Some(seed);
        }
        self.persist(asset_dir, &manifest).await?;

        tracing::info!(
            pipeline = %pipeline.name,
            asset = %manifest.id,
            steps = plan.len(),
            "Pipeline started"
        );
        self.events.emit(PipelineEvent::PipelineStarted {
            pipeline_name: pipeline.name.clone(),
            asset_id: manifest.id.clone(),
            step_count: plan.len(),
        });

        let mut run = RunState {
            pipeline,
            asset_dir,
            step_outputs: recorded_outputs(&manifest),
            manifest,
        };
        let mut executed = Vec::new();

        for step in plan {
            if options.cancel.is_cancelled() {
                return self.cancel_run(run).await;
            }

            let task = self
                .definitions
                .task(&step.task)
                .ok_or_else(|| PipelineError::UnknownTask {
                    step: step.id.clone(),
                    task: step.task.clone(),
                })?;

            if run.manifest.step_succeeded(&step.id) {
                tracing::info!(step = %step.id, "Step already succeeded, skipping");
                self.events.emit(PipelineEvent::StepSkipped {
                    step_id: step.id.clone(),
                });
                self.restore_artifacts(&mut run, step, task).await;
                continue;
            }

            match self.execute_step(&mut run, step, task, &options.cancel).await {
                Ok(StepFlow::Completed) => executed.push(step.id.clone()),
                Ok(StepFlow::Canceled) => return self.cancel_run(run).await,
                Err(err) => return Err(self.fail_step(run, step, err).await),
            }
        }

        self.persist(asset_dir, &run.manifest).await?;
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            pipeline = %pipeline.name,
            executed = executed.len(),
            duration_ms,
            "Pipeline completed"
        );
        self.events.emit(PipelineEvent::PipelineCompleted {
            pipeline_name: pipeline.name.clone(),
            executed_steps: executed,
            duration_ms,
        });
        Ok(run.manifest)
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    async fn execute_step(
        &self,
        run: &mut RunState<'_>,
        step: &PipelineStep,
        task: &TaskDefinition,
        cancel: &CancellationToken,
    ) -> Result<StepFlow> {
        let started = Instant::now();
        tracing::info!(step = %step.id, task = %task.id, "Executing step");
        self.events.emit(PipelineEvent::StepStarted {
            step_id: step.id.clone(),
            task_id: task.id.clone(),
        });
        run.manifest.task_mut(&step.id).begin();

        let base = base_scope(&run.manifest);
        let outputs = match &step.for_each {
            None => self.invoke(run, step, task, &base, None).await?.1,
            Some(for_each) => {
                let document = run.manifest.to_document()?;
                let items = {
                    let ctx = self.context(&document, &run.step_outputs, &base);
                    resolve_collection(for_each, &step.id, &ctx)?
                };
                run.manifest.task_mut(&step.id).extra.remove("iterations");

                let mut per_item: Vec<Map<String, Value>> = Vec::with_capacity(items.len());
                let mut iterations = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    if cancel.is_cancelled() {
                        tracing::warn!(step = %step.id, index, "Canceled between iterations");
                        run.manifest
                            .task_mut(&step.id)
                            .finish(TaskStatus::Canceled, Some("run canceled".into()));
                        return Ok(StepFlow::Canceled);
                    }
                    self.events.emit(PipelineEvent::IterationStarted {
                        step_id: step.id.clone(),
                        index,
                        total: items.len(),
                    });

                    let scope = iteration_scope(&base, for_each, item, index);
                    let (job_id, outputs) = self.invoke(run, step, task, &scope, Some(index)).await?;
                    iterations.push(json!({ "index": index, "taskId": job_id }));
                    run.manifest
                        .task_mut(&step.id)
                        .extra
                        .insert("iterations".into(), Value::Array(iterations.clone()));
                    per_item.push(outputs);
                }
                aggregate_outputs(task, &per_item)
            }
        };

        let state = run.manifest.task_mut(&step.id);
        state.outputs = outputs.clone();
        state.finish(TaskStatus::Succeeded, None);
        run.step_outputs
            .insert(step.id.clone(), Value::Object(outputs.clone()));
        apply_state_mapping(&mut run.manifest, run.pipeline, step, &Value::Object(outputs))?;
        self.persist(run.asset_dir, &run.manifest).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(step = %step.id, duration_ms, "Step succeeded");
        self.events.emit(PipelineEvent::StepCompleted {
            step_id: step.id.clone(),
            duration_ms,
        });
        Ok(StepFlow::Completed)
    }

    /// One submission: resolve inputs, submit, wait, map outputs, and record
    /// artifacts (copied only when a store is attached). Returns the job id
    /// and the mapped outputs.
    async fn invoke(
        &self,
        run: &mut RunState<'_>,
        step: &PipelineStep,
        task: &TaskDefinition,
        scope: &Scope,
        iteration: Option<usize>,
    ) -> Result<(String, Map<String, Value>)> {
        let document = run.manifest.to_document()?;
        let inputs = {
            let ctx = self.context(&document, &run.step_outputs, scope);
            let bindings = merge_input_bindings(&task.inputs, &step.inputs);
            resolve_inputs(&bindings, &ctx)?
        };

        let request = TaskRequest::new(task, &step.id, inputs);
        let job = self.client.submit(&request).await?;
        tracing::debug!(step = %step.id, job_id = %job.id, "Task submitted");
        self.events.emit(PipelineEvent::StepSubmitted {
            step_id: step.id.clone(),
            job_id: job.id.clone(),
        });

        let state = run.manifest.task_mut(&step.id);
        state.task_id = Some(job.id.clone());
        state.status = Some(TaskStatus::InProgress);
        self.persist(run.asset_dir, &run.manifest).await?;

        let poll = task.poll.clone().unwrap_or_default();
        let completion = self.client.await_completion(&job, &poll).await?;
        let status = match completion.status {
            CompletionStatus::Succeeded => None,
            CompletionStatus::Failed => Some(TaskStatus::Failed),
            CompletionStatus::Canceled => Some(TaskStatus::Canceled),
        };
        if let Some(status) = status {
            let message = completion
                .error
                .unwrap_or_else(|| format!("job {} ended {status}", job.id));
            run.manifest
                .task_mut(&step.id)
                .finish(status, Some(message.clone()));
            return Err(PipelineError::TaskClient { message });
        }

        let mut outputs = resolve_outputs(&task.outputs, &completion.payload);
        outputs.insert("taskId".into(), Value::String(job.id.clone()));

        if !step.skip_artifacts {
            for artifact in plan_artifacts(&task.outputs, &outputs, scope, iteration) {
                if let Some(store) = self.artifact_store(step) {
                    store
                        .store(run.asset_dir, &artifact.filename, &artifact.source)
                        .await?;
                    self.announce_artifact(step, &artifact);
                }
                self.record_artifact(run, step, artifact);
            }
        }

        Ok((job.id, outputs))
    }

    /// Re-materialize artifacts of a SUCCEEDED step that are missing from
    /// the store. Failures are logged and never fail the run.
    async fn restore_artifacts(
        &self,
        run: &mut RunState<'_>,
        step: &PipelineStep,
        task: &TaskDefinition,
    ) {
        let Some(store) = self.artifact_store(step) else {
            return;
        };
        if !task.has_artifacts() {
            return;
        }
        let Some(outputs) = run.manifest.task(&step.id).map(|s| s.outputs.clone()) else {
            return;
        };

        let base = base_scope(&run.manifest);
        let planned: Vec<PlannedArtifact> = match &step.for_each {
            None => plan_artifacts(&task.outputs, &outputs, &base, None),
            Some(for_each) => {
                let document = match run.manifest.to_document() {
                    Ok(document) => document,
                    Err(err) => {
                        tracing::warn!(step = %step.id, error = %err, "Cannot inspect manifest");
                        return;
                    }
                };
                let ctx = self.context(&document, &run.step_outputs, &base);
                let items = match resolve_collection(for_each, &step.id, &ctx) {
                    Ok(items) => items,
                    Err(err) => {
                        tracing::warn!(step = %step.id, error = %err, "Cannot re-resolve forEach items");
                        return;
                    }
                };
                items
                    .iter()
                    .enumerate()
                    .flat_map(|(index, item)| {
                        let scope = iteration_scope(&base, for_each, item, index);
                        let slice: Map<String, Value> = outputs
                            .iter()
                            .filter_map(|(name, values)| {
                                values.get(index).map(|v| (name.clone(), v.clone()))
                            })
                            .collect();
                        plan_artifacts(&task.outputs, &slice, &scope, Some(index))
                    })
                    .collect()
            }
        };

        let mut restored = false;
        for artifact in planned {
            match store.exists(run.asset_dir, &artifact.filename).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(step = %step.id, file = %artifact.filename, error = %err, "Cannot check artifact");
                    continue;
                }
            }
            match store
                .store(run.asset_dir, &artifact.filename, &artifact.source)
                .await
            {
                Ok(()) => {
                    tracing::info!(step = %step.id, file = %artifact.filename, "Restored missing artifact");
                    self.announce_artifact(step, &artifact);
                    self.record_artifact(run, step, artifact);
                    restored = true;
                }
                Err(err) => {
                    tracing::warn!(step = %step.id, file = %artifact.filename, error = %err, "Artifact restore failed");
                }
            }
        }

        if restored {
            if let Err(err) = self.persist(run.asset_dir, &run.manifest).await {
                tracing::warn!(error = %err, "Failed to persist restored artifacts");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Terminal paths
    // -----------------------------------------------------------------------

    async fn fail_step(
        &self,
        mut run: RunState<'_>,
        step: &PipelineStep,
        err: PipelineError,
    ) -> PipelineError {
        let cause = err.to_string();
        let state = run.manifest.task_mut(&step.id);
        if !matches!(
            state.status,
            Some(TaskStatus::Failed | TaskStatus::Canceled)
        ) {
            state.finish(TaskStatus::Failed, Some(cause.clone()));
        }
        if let Err(save_err) = self.persist(run.asset_dir, &run.manifest).await {
            tracing::error!(error = %save_err, "Failed to persist manifest after step failure");
        }

        tracing::error!(step = %step.id, error = %cause, "Step failed");
        self.events.emit(PipelineEvent::StepFailed {
            step_id: step.id.clone(),
            error: cause.clone(),
        });
        self.events.emit(PipelineEvent::PipelineFailed {
            pipeline_name: run.pipeline.name.clone(),
            step_id: step.id.clone(),
            error: cause.clone(),
        });

        PipelineError::StepExecutionFailed {
            step: step.id.clone(),
            cause,
            manifest: Box::new(run.manifest),
        }
    }

    async fn cancel_run(&self, run: RunState<'_>) -> Result<AssetManifest> {
        self.persist(run.asset_dir, &run.manifest).await?;
        tracing::warn!(pipeline = %run.pipeline.name, "Pipeline canceled");
        self.events.emit(PipelineEvent::PipelineCanceled {
            pipeline_name: run.pipeline.name.clone(),
        });
        Err(PipelineError::Canceled {
            manifest: Box::new(run.manifest),
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn context<'a>(
        &'a self,
        document: &'a Value,
        step_outputs: &'a HashMap<String, Value>,
        scope: &'a Scope,
    ) -> ResolutionContext<'a> {
        ResolutionContext {
            manifest: document,
            step_outputs,
            lookups: &self.lookups,
            environment: &self.environment,
            scope,
        }
    }

    fn artifact_store(&self, step: &PipelineStep) -> Option<&dyn ArtifactStore> {
        if step.skip_artifacts {
            return None;
        }
        self.artifacts.as_deref()
    }

    fn announce_artifact(&self, step: &PipelineStep, artifact: &PlannedArtifact) {
        self.events.emit(PipelineEvent::ArtifactStored {
            step_id: step.id.clone(),
            key: artifact.key.clone(),
            filename: artifact.filename.clone(),
        });
    }

    /// Artifact references are recorded whether or not a store is attached.
    fn record_artifact(&self, run: &mut RunState<'_>, step: &PipelineStep, artifact: PlannedArtifact) {
        run.manifest
            .task_mut(&step.id)
            .artifacts
            .insert(artifact.key, artifact.filename);
    }

    async fn persist(&self, asset_dir: &Path, manifest: &AssetManifest) -> Result<()> {
        let path = self.manifests.save(asset_dir, manifest).await?;
        self.events.emit(PipelineEvent::ManifestSaved {
            path: path.display().to_string(),
        });
        Ok(())
    }
}

/// Per-item outputs folded into one array per output name, aligned by item
/// index; an item without a value contributes `null`.
fn aggregate_outputs(task: &TaskDefinition, per_item: &[Map<String, Value>]) -> Map<String, Value> {
    let names = task
        .outputs
        .iter()
        .map(|o| o.name.as_str())
        .chain(std::iter::once("taskId"));

    let mut aggregated = Map::new();
    for name in names {
        let values = per_item
            .iter()
            .map(|outputs| outputs.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        aggregated.insert(name.to_string(), Value::Array(values));
    }
    aggregated
}

/// Copy output values into manifest paths. Keys are manifest paths, values
/// are paths into the step outputs; step entries override pipeline ones.
fn apply_state_mapping(
    manifest: &mut AssetManifest,
    pipeline: &PipelineDefinition,
    step: &PipelineStep,
    outputs: &Value,
) -> Result<()> {
    let mut mapping = pipeline.state_mapping.clone();
    for (target, source) in &step.state_mapping {
        mapping.insert(target.clone(), source.clone());
    }
    if mapping.is_empty() {
        return Ok(());
    }

    let mut document = manifest.to_document()?;
    for (target, source) in &mapping {
        if let Some(value) = get_path(outputs, source) {
            set_path(&mut document, target, value.clone());
        }
    }
    *manifest = AssetManifest::from_document(document)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
