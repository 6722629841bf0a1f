//! CLI binary for listing, validating, planning, and running content pipelines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use contentgen_pipeline::{
    load_definitions, load_lookup_tables, load_manifest, plan_execution, validate,
    DefinitionBundle, EchoTaskClient, FsArtifactStore, LookupTables, PipelineEvent,
    PipelineRunner, RunOptions, Severity, ValidationOptions, MANIFEST_FILE,
};
use contentgen_types::{AssetManifest, PipelineError};

#[derive(Parser)]
#[command(name = "content-gen", version, about = "Declarative content pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory of `*.pipeline.json` definitions
    #[arg(long, global = true, env = "CONTENTGEN_PIPELINES_DIR", default_value = "pipelines/definitions")]
    pipelines: PathBuf,

    /// Directory of task definitions
    #[arg(long, global = true, env = "CONTENTGEN_TASKS_DIR", default_value = "tasks/definitions")]
    tasks: PathBuf,

    /// Directory of lookup tables, one `<TABLE>.json` per table
    #[arg(long, global = true, env = "CONTENTGEN_LOOKUPS_DIR")]
    lookups: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded pipelines and tasks
    List,

    /// Check an asset manifest against a pipeline without running anything
    Validate {
        /// Asset directory containing manifest.json
        asset_dir: PathBuf,

        /// Pipeline to validate against
        #[arg(short, long)]
        pipeline: String,
    },

    /// Show the steps a run would visit, in order
    Plan {
        /// Pipeline name
        pipeline: String,

        /// Asset directory whose manifest marks steps already done
        asset_dir: Option<PathBuf>,

        /// Restrict to this step and its unmet dependencies
        #[arg(short, long)]
        step: Option<String>,
    },

    /// Run a pipeline against an asset directory (dry-run task client)
    Run {
        /// Pipeline name
        pipeline: String,

        /// Asset directory containing manifest.json
        asset_dir: PathBuf,

        /// Run only this step plus its unmet dependencies
        #[arg(short, long)]
        step: Option<String>,

        /// Record artifact outputs without copying files
        #[arg(long)]
        no_artifacts: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let definitions = load_definitions(&cli.pipelines, &cli.tasks)?;
    let lookups = match &cli.lookups {
        Some(dir) => load_lookup_tables(dir)?,
        None => LookupTables::new(),
    };
    let environment: HashMap<String, String> = std::env::vars().collect();

    match cli.command {
        Commands::List => cmd_list(&definitions),
        Commands::Validate {
            asset_dir,
            pipeline,
        } => cmd_validate(&definitions, &pipeline, &asset_dir, lookups, environment),
        Commands::Plan {
            pipeline,
            asset_dir,
            step,
        } => cmd_plan(&definitions, &pipeline, asset_dir.as_deref(), step.as_deref()).await,
        Commands::Run {
            pipeline,
            asset_dir,
            step,
            no_artifacts,
        } => {
            cmd_run(
                definitions,
                pipeline,
                asset_dir,
                step,
                no_artifacts,
                lookups,
                environment,
            )
            .await
        }
    }
}

fn cmd_list(definitions: &DefinitionBundle) -> anyhow::Result<()> {
    println!("Pipelines:");
    for pipeline in definitions.pipelines.values() {
        let description = pipeline.description.as_deref().unwrap_or("");
        println!(
            "  {} ({} steps) {}",
            pipeline.name,
            pipeline.steps.len(),
            description
        );
    }

    println!("\nTasks:");
    for task in definitions.tasks.values() {
        println!("  {} -> {} {}", task.id, task.endpoint(), task.description.as_deref().unwrap_or(""));
    }
    Ok(())
}

fn cmd_validate(
    definitions: &DefinitionBundle,
    pipeline: &str,
    asset_dir: &Path,
    lookups: LookupTables,
    environment: HashMap<String, String>,
) -> anyhow::Result<()> {
    let path = asset_dir.join(MANIFEST_FILE);
    let source = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
    let manifest: serde_json::Value = serde_json::from_str(&source)?;

    let options = ValidationOptions {
        lookups,
        environment,
    };
    let report = validate(definitions, pipeline, &manifest, &options);

    if report.diagnostics.is_empty() {
        println!("Manifest is valid for pipeline '{pipeline}'");
        return Ok(());
    }

    for diag in &report.diagnostics {
        let severity = match diag.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN",
        };
        println!("[{}] {}", severity, diag.message);
    }

    if !report.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_plan(
    definitions: &DefinitionBundle,
    pipeline: &str,
    asset_dir: Option<&Path>,
    step: Option<&str>,
) -> anyhow::Result<()> {
    let pipeline = definitions.pipeline(pipeline)?;
    let manifest = match asset_dir {
        Some(dir) => load_manifest(dir).await?,
        None => None,
    }
    .unwrap_or_else(|| AssetManifest::new("", "", ""));

    let plan = plan_execution(pipeline, &manifest, step)?;
    println!("Pipeline: {}", pipeline.name);
    for (position, step) in plan.iter().enumerate() {
        let status = manifest
            .task(&step.id)
            .and_then(|s| s.status)
            .map(|s| s.as_str())
            .unwrap_or("-");
        let mut line = format!("  {}. {} [{}] status={}", position + 1, step.id, step.task, status);
        if !step.depends_on.is_empty() {
            line.push_str(&format!(" after={}", step.depends_on.join(",")));
        }
        if let Some(for_each) = &step.for_each {
            line.push_str(&format!(" forEach={}", for_each.var));
        }
        println!("{line}");
    }
    Ok(())
}

async fn cmd_run(
    definitions: DefinitionBundle,
    pipeline: String,
    asset_dir: PathBuf,
    step: Option<String>,
    no_artifacts: bool,
    lookups: LookupTables,
    environment: HashMap<String, String>,
) -> anyhow::Result<()> {
    let mut runner = PipelineRunner::new(Arc::new(definitions), Arc::new(EchoTaskClient::new()))
        .with_lookups(lookups)
        .with_environment(environment);
    if !no_artifacts {
        runner = runner.with_artifact_store(Arc::new(FsArtifactStore));
    }
    let runner = Arc::new(runner);

    let mut events = runner.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::StepStarted { step_id, task_id } => {
                    println!("> {step_id} ({task_id})");
                }
                PipelineEvent::StepSkipped { step_id } => println!("- {step_id} already succeeded"),
                PipelineEvent::IterationStarted { index, total, .. } => {
                    println!("  item {}/{}", index + 1, total);
                }
                PipelineEvent::ArtifactStored { filename, .. } => println!("  stored {filename}"),
                PipelineEvent::StepCompleted { step_id, duration_ms } => {
                    println!("  {step_id} done in {duration_ms}ms");
                }
                _ => {}
            }
        }
    });

    let mut options = RunOptions::new(pipeline, &asset_dir);
    if let Some(step) = step {
        options = options.with_step(step);
    }
    println!("Running pipeline: {}", options.pipeline_name);
    println!("Asset: {}", asset_dir.display());
    println!("(dry run: task inputs are echoed back as results)");

    let handle = runner.spawn(options);
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::warn!("Interrupt received, stopping after the current task");
        cancel.cancel();
    });

    match handle.wait().await {
        Ok(manifest) => {
            let succeeded = manifest.tasks.values().filter(|s| s.is_succeeded()).count();
            println!("Pipeline completed: {succeeded} step(s) succeeded");
            Ok(())
        }
        Err(PipelineError::Canceled { .. }) => {
            println!("Pipeline canceled; progress saved to {}", asset_dir.join(MANIFEST_FILE).display());
            std::process::exit(130);
        }
        Err(err @ PipelineError::StepExecutionFailed { .. }) => {
            eprintln!("{err}");
            eprintln!("Progress saved; re-run to resume from the failed step.");
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}
