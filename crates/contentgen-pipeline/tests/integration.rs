//! End-to-end tests: fixture definitions on disk, a scripted task client,
//! and manifests persisted in temporary asset directories.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use contentgen_pipeline::{
    load_definitions, load_lookup_tables, load_manifest, parse_pipeline, save_manifest,
    validate, ArtifactStore, DefinitionBundle, JobHandle, LookupTables, PipelineRunner,
    PollSpec, RunOptions, TaskClient, TaskCompletion, TaskRequest, ValidationOptions,
};
use contentgen_types::{AssetManifest, PipelineError, Result, TaskStatus};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn definitions() -> DefinitionBundle {
    load_definitions(&fixtures().join("pipelines"), &fixtures().join("tasks")).unwrap()
}

fn lookups() -> LookupTables {
    load_lookup_tables(&fixtures().join("lookups")).unwrap()
}

fn prop_manifest() -> AssetManifest {
    AssetManifest::from_document(json!({
        "id": "crate",
        "name": "Wooden Crate",
        "type": "prop",
        "textToImageTask": { "prompt": "Test" },
        "notes": { "reviewer": "kim", "tags": ["wood", "container"] }
    }))
    .unwrap()
}

fn character_manifest() -> AssetManifest {
    AssetManifest::from_document(json!({
        "id": "knight",
        "name": "Knight",
        "type": "character",
        "seed": 1234,
        "textTo3DPreviewTask": { "prompt": "A knight in plate armor" },
        "animations": ["walk", "run"]
    }))
    .unwrap()
}

/// Answers every task with a canned payload and records what it saw.
#[derive(Default)]
struct ScriptedClient {
    submits: AtomicUsize,
    requests: Mutex<Vec<TaskRequest>>,
    jobs: Mutex<HashMap<String, TaskRequest>>,
    fail_task: Option<String>,
    cancel_on: Option<(String, CancellationToken)>,
}

impl ScriptedClient {
    fn failing(task: &str) -> Self {
        Self {
            fail_task: Some(task.to_string()),
            ..Self::default()
        }
    }

    fn canceling_on(task: &str, token: CancellationToken) -> Self {
        Self {
            cancel_on: Some((task.to_string(), token)),
            ..Self::default()
        }
    }

    fn submitted_tasks(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.task_id.clone())
            .collect()
    }

    fn request_for(&self, task: &str) -> TaskRequest {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.task_id == task)
            .cloned()
            .unwrap()
    }

    fn payload(request: &TaskRequest) -> Value {
        match request.task_id.as_str() {
            "multi-image-to-3d" => json!({
                "model_urls": { "glb": "https://x/model.glb" },
                "thumbnail_url": "https://x/thumb.png"
            }),
            "text-to-3d-preview" | "text-to-3d-refine" => json!({
                "model_urls": { "glb": format!("https://x/{}.glb", request.step_id) }
            }),
            "rigging" => json!({
                "result": { "rigged_character_glb_url": "https://x/rigged.glb" }
            }),
            "animation" => json!({
                "result": {
                    "animation_glb_url": format!("https://x/anim-{}.glb", request.inputs["action_id"])
                }
            }),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl TaskClient for ScriptedClient {
    async fn submit(&self, request: &TaskRequest) -> Result<JobHandle> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        let id = format!("job-{n}");
        self.requests.lock().unwrap().push(request.clone());
        self.jobs.lock().unwrap().insert(id.clone(), request.clone());
        if let Some((task, token)) = &self.cancel_on {
            if *task == request.task_id {
                token.cancel();
            }
        }
        Ok(JobHandle { id })
    }

    async fn await_completion(&self, job: &JobHandle, _poll: &PollSpec) -> Result<TaskCompletion> {
        let request = self
            .jobs
            .lock()
            .unwrap()
            .remove(&job.id)
            .ok_or_else(|| PipelineError::TaskClient {
                message: format!("unknown job {}", job.id),
            })?;
        if self.fail_task.as_deref() == Some(request.task_id.as_str()) {
            return Ok(TaskCompletion::failed("remote job failed"));
        }
        Ok(TaskCompletion::succeeded(Self::payload(&request)))
    }
}

/// Remembers stored files in memory instead of copying anything.
#[derive(Default)]
struct MemoryArtifactStore {
    files: Mutex<HashSet<String>>,
    stored: Mutex<Vec<(String, String)>>,
}

impl MemoryArtifactStore {
    fn stored(&self) -> Vec<(String, String)> {
        self.stored.lock().unwrap().clone()
    }

    fn forget_all(&self) {
        self.files.lock().unwrap().clear();
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn exists(&self, _asset_dir: &Path, filename: &str) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains(filename))
    }

    async fn store(&self, _asset_dir: &Path, filename: &str, source: &str) -> Result<()> {
        self.files.lock().unwrap().insert(filename.to_string());
        self.stored
            .lock()
            .unwrap()
            .push((filename.to_string(), source.to_string()));
        Ok(())
    }
}

fn runner(defs: DefinitionBundle, client: Arc<ScriptedClient>) -> PipelineRunner {
    PipelineRunner::new(Arc::new(defs), client).with_lookups(lookups())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// Test 1: Loader reads fixtures and ignores documents without an id
#[test]
fn loader_reads_fixture_directories() {
    let defs = definitions();
    assert_eq!(defs.pipelines.len(), 2);
    assert_eq!(defs.tasks.len(), 5);
    assert!(defs.task("multi-image-to-3d").is_some());
    assert!(lookups().contains_key("ANIMATION_IDS"));
}

// Test 2: The prop pipeline maps the GLB URL and keeps passthrough fields
#[tokio::test]
async fn prop_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    save_manifest(&prop_manifest(), dir.path()).await.unwrap();

    let client = Arc::new(ScriptedClient::default());
    let result = runner(definitions(), client.clone())
        .run(RunOptions::new("prop", dir.path()))
        .await
        .unwrap();

    let state = result.task("multi-image-to-3d").unwrap();
    assert_eq!(state.status, Some(TaskStatus::Succeeded));
    assert_eq!(state.outputs["glb"], json!("https://x/model.glb"));
    assert_eq!(state.outputs["thumbnail"], json!("https://x/thumb.png"));
    assert_eq!(state.task_id.as_deref(), Some("job-0"));
    assert_eq!(result.extra["notes"], json!({ "reviewer": "kim", "tags": ["wood", "container"] }));

    let request = client.request_for("multi-image-to-3d");
    assert_eq!(request.inputs["prompt"], json!("Test"));
    assert_eq!(request.inputs["image_urls"], json!([]));

    let persisted = load_manifest(dir.path()).await.unwrap().unwrap();
    assert_eq!(persisted, result);
}

// Test 3: A cyclic pipeline is rejected before the client is called
#[tokio::test]
async fn cycle_rejected_before_any_submission() {
    let dir = tempfile::tempdir().unwrap();
    let mut defs = definitions();
    let cyclic = parse_pipeline(
        "loop.pipeline.json",
        r#"{ "name": "loop", "steps": [
            { "id": "a", "task": "multi-image-to-3d", "dependsOn": ["b"] },
            { "id": "b", "task": "multi-image-to-3d", "dependsOn": ["a"] }
        ] }"#,
    )
    .unwrap();
    defs.pipelines.insert(cyclic.name.clone(), cyclic);

    let client = Arc::new(ScriptedClient::default());
    let err = runner(defs, client.clone())
        .run(RunOptions::new("loop", dir.path()).with_manifest(prop_manifest()))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::CyclicDependency { .. }));
    assert!(err.is_structural());
    assert_eq!(client.submits.load(Ordering::SeqCst), 0);
}

// Test 4: Re-running skips the succeeded preview and still runs what follows
#[tokio::test]
async fn rerun_skips_succeeded_steps() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = character_manifest();
    {
        let preview = manifest.task_mut("preview");
        preview.task_id = Some("job-prev".into());
        preview.status = Some(TaskStatus::Succeeded);
        preview.outputs.insert("taskId".into(), json!("job-prev"));
    }
    save_manifest(&manifest, dir.path()).await.unwrap();

    let client = Arc::new(ScriptedClient::default());
    let result = runner(definitions(), client.clone())
        .run(RunOptions::new("character-full", dir.path()))
        .await
        .unwrap();

    let submitted = client.submitted_tasks();
    assert!(!submitted.contains(&"text-to-3d-preview".to_string()));
    assert_eq!(
        submitted,
        vec!["text-to-3d-refine", "rigging", "animation", "animation"]
    );
    assert_eq!(
        client.request_for("text-to-3d-refine").inputs["preview_task_id"],
        json!("job-prev")
    );
    for step in ["preview", "refine", "rigging", "animation"] {
        assert!(result.step_succeeded(step), "{step} should be SUCCEEDED");
    }
}

// Test 5: forEach runs once per item and aggregates outputs and artifacts
#[tokio::test]
async fn for_each_fans_out_and_maps_state() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::default());
    let store = Arc::new(MemoryArtifactStore::default());
    let result = runner(definitions(), client.clone())
        .with_artifact_store(store.clone())
        .run(RunOptions::new("character-full", dir.path()).with_manifest(character_manifest()))
        .await
        .unwrap();

    let animation = result.task("animation").unwrap();
    assert_eq!(
        animation.outputs["glb"],
        json!(["https://x/anim-1.glb", "https://x/anim-14.glb"])
    );
    assert_eq!(animation.artifacts["glb.0"], "animations/knight_walk.glb");
    assert_eq!(animation.artifacts["glb.1"], "animations/knight_run.glb");

    let action_ids: Vec<Value> = client
        .requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.task_id == "animation")
        .map(|r| r.inputs["action_id"].clone())
        .collect();
    assert_eq!(action_ids, vec![json!(1), json!(14)]);

    // rigging sets skipArtifacts
    assert!(result.task("rigging").unwrap().artifacts.is_empty());
    assert!(!store
        .stored()
        .iter()
        .any(|(file, _)| file == "knight_rigged.glb"));

    assert_eq!(result.extra["model"]["refinedGlb"], json!("https://x/refine.glb"));
    assert_eq!(result.extra["model"]["riggedGlb"], json!("https://x/rigged.glb"));
    assert_eq!(
        client.request_for("text-to-3d-preview").inputs["seed"],
        json!(1234)
    );
}

// Test 6: A failed step halts the run, keeps earlier states, and resumes
#[tokio::test]
async fn failure_halts_and_resume_continues() {
    let dir = tempfile::tempdir().unwrap();
    save_manifest(&character_manifest(), dir.path()).await.unwrap();

    let failing = Arc::new(ScriptedClient::failing("rigging"));
    let err = runner(definitions(), failing.clone())
        .run(RunOptions::new("character-full", dir.path()))
        .await
        .unwrap_err();

    match &err {
        PipelineError::StepExecutionFailed { step, cause, .. } => {
            assert_eq!(step, "rigging");
            assert!(cause.contains("remote job failed"), "{cause}");
        }
        other => panic!("Expected StepExecutionFailed, got: {other:?}"),
    }
    assert!(!failing.submitted_tasks().contains(&"animation".to_string()));

    let partial = err.manifest().unwrap();
    assert!(partial.step_succeeded("preview"));
    assert!(partial.step_succeeded("refine"));
    let rigging = partial.task("rigging").unwrap();
    assert_eq!(rigging.status, Some(TaskStatus::Failed));
    assert_eq!(rigging.error.as_deref(), Some("remote job failed"));
    assert!(partial.task("animation").is_none());

    let persisted = load_manifest(dir.path()).await.unwrap().unwrap();
    assert_eq!(&persisted, partial);

    let healthy = Arc::new(ScriptedClient::default());
    let result = runner(definitions(), healthy.clone())
        .run(RunOptions::new("character-full", dir.path()))
        .await
        .unwrap();
    assert_eq!(
        healthy.submitted_tasks(),
        vec!["rigging", "animation", "animation"]
    );
    assert!(result.step_succeeded("animation"));
}

// Test 7: Cancellation lets the in-flight step finish, then stops
#[tokio::test]
async fn cancellation_waits_for_in_flight_step() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let client = Arc::new(ScriptedClient::canceling_on("text-to-3d-refine", token.clone()));
    let runner = Arc::new(runner(definitions(), client.clone()));

    let handle = runner.spawn(
        RunOptions::new("character-full", dir.path())
            .with_manifest(character_manifest())
            .with_cancellation(token),
    );
    let err = handle.wait().await.unwrap_err();

    let manifest = match err {
        PipelineError::Canceled { manifest } => manifest,
        other => panic!("Expected Canceled, got: {other:?}"),
    };
    assert!(manifest.step_succeeded("refine"));
    assert!(manifest.task("rigging").is_none());
    assert_eq!(
        client.submitted_tasks(),
        vec!["text-to-3d-preview", "text-to-3d-refine"]
    );

    let persisted = load_manifest(dir.path()).await.unwrap().unwrap();
    assert_eq!(persisted, *manifest);
}

// Test 8: A step filter runs the step and only its unmet dependencies
#[tokio::test]
async fn step_filter_runs_dependencies_only() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::default());
    let result = runner(definitions(), client.clone())
        .run(
            RunOptions::new("character-full", dir.path())
                .with_manifest(character_manifest())
                .with_step("refine"),
        )
        .await
        .unwrap();

    assert_eq!(
        client.submitted_tasks(),
        vec!["text-to-3d-preview", "text-to-3d-refine"]
    );
    assert!(result.task("rigging").is_none());

    let err = runner(definitions(), client)
        .run(RunOptions::new("character-full", dir.path()).with_step("teleport"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownStep { .. }));
}

// Test 9: Missing artifacts of a succeeded step are restored without resubmitting
#[tokio::test]
async fn missing_artifacts_are_restored_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    save_manifest(&prop_manifest(), dir.path()).await.unwrap();
    let store = Arc::new(MemoryArtifactStore::default());

    let client = Arc::new(ScriptedClient::default());
    let result = runner(definitions(), client.clone())
        .with_artifact_store(store.clone())
        .run(RunOptions::new("prop", dir.path()))
        .await
        .unwrap();
    assert_eq!(
        result.task("multi-image-to-3d").unwrap().artifacts["glb"],
        "crate_model.glb"
    );
    assert_eq!(
        store.stored(),
        vec![("crate_model.glb".to_string(), "https://x/model.glb".to_string())]
    );

    store.forget_all();
    let again = Arc::new(ScriptedClient::default());
    runner(definitions(), again.clone())
        .with_artifact_store(store.clone())
        .run(RunOptions::new("prop", dir.path()))
        .await
        .unwrap();
    assert_eq!(again.submits.load(Ordering::SeqCst), 0);
    assert_eq!(store.stored().len(), 2);
}

// Test 10: Validation reports the exact missing-input message, repeatably
#[test]
fn validation_against_fixtures() {
    let defs = definitions();
    let options = ValidationOptions {
        lookups: lookups(),
        environment: HashMap::new(),
    };

    let mut doc = character_manifest().to_document().unwrap();
    doc.as_object_mut().unwrap().remove("textTo3DPreviewTask");

    let first = validate(&defs, "character-full", &doc, &options);
    let second = validate(&defs, "character-full", &doc, &options);
    assert_eq!(
        first.errors(),
        vec!["Missing required input 'prompt' for step 'preview' (task 'text-to-3d-preview')."]
    );
    assert_eq!(first, second);

    let complete = character_manifest().to_document().unwrap();
    assert!(validate(&defs, "character-full", &complete, &options).is_ok());
}

// Test 11: A manifest without an id fails schema checks everywhere
#[tokio::test]
async fn manifest_without_id_is_rejected() {
    let defs = definitions();
    let mut doc = prop_manifest().to_document().unwrap();
    doc.as_object_mut().unwrap().remove("id");

    let report = validate(&defs, "prop", &doc, &ValidationOptions::default());
    assert!(!report.errors().is_empty());
    assert!(report.errors()[0].contains("id"));

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("manifest.json"),
        serde_json::to_string_pretty(&doc).unwrap(),
    )
    .unwrap();
    let client = Arc::new(ScriptedClient::default());
    let err = runner(defs, client.clone())
        .run(RunOptions::new("prop", dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidManifest(_)));
    assert_eq!(client.submits.load(Ordering::SeqCst), 0);
}

// Test 12: Artifact references are recorded even when no store is attached
#[tokio::test]
async fn artifact_references_recorded_without_store() {
    let dir = tempfile::tempdir().unwrap();
    save_manifest(&prop_manifest(), dir.path()).await.unwrap();

    let client = Arc::new(ScriptedClient::default());
    let result = runner(definitions(), client)
        .run(RunOptions::new("prop", dir.path()))
        .await
        .unwrap();

    let state = result.task("multi-image-to-3d").unwrap();
    assert_eq!(state.artifacts.get("glb").map(String::as_str), Some("crate_model.glb"));
    assert!(!state.artifacts.contains_key("thumbnail"));
    assert!(!dir.path().join("crate_model.glb").exists());

    let persisted = load_manifest(dir.path()).await.unwrap().unwrap();
    assert_eq!(persisted.task("multi-image-to-3d").unwrap().artifacts, state.artifacts);
}
