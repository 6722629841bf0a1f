//! Artifact materialization.
//!
//! Output bindings with an `artifact` filename template name files that must
//! exist in the asset directory once their step succeeds. Fetching the bytes
//! is delegated to an [`ArtifactStore`].

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};

use contentgen_types::{PipelineError, Result};

use crate::definitions::OutputBinding;
use crate::template::{expand, Scope};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether `filename` is already present for this asset.
    async fn exists(&self, asset_dir: &Path, filename: &str) -> Result<bool>;

    /// Materialize `source` (usually a URL from a task result) as `filename`.
    async fn store(&self, asset_dir: &Path, filename: &str, source: &str) -> Result<()>;
}

/// One file an output binding asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedArtifact {
    /// Key under `TaskState.artifacts`: the output name, plus `.<index>` per
    /// array element and per `forEach` iteration.
    pub key: String,
    pub filename: String,
    pub source: String,
}

/// Work out which files a step's outputs call for.
///
/// String values produce one artifact; arrays produce one per non-empty
/// string element with `index` added to the template scope. `iteration`
/// prefixes keys for `forEach` steps.
pub fn plan_artifacts(
    outputs: &[OutputBinding],
    values: &Map<String, Value>,
    scope: &Scope,
    iteration: Option<usize>,
) -> Vec<PlannedArtifact> {
    let mut planned = Vec::new();
    for output in outputs {
        let Some(template) = &output.artifact else {
            continue;
        };
        let base_key = match iteration {
            Some(i) => format!("{}.{i}", output.name),
            None => output.name.clone(),
        };

        match values.get(&output.name) {
            Some(Value::String(source)) if !source.trim().is_empty() => {
                planned.push(PlannedArtifact {
                    key: base_key,
                    filename: expand(template, scope),
                    source: source.clone(),
                });
            }
            Some(Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    let Some(source) = item.as_str().filter(|s| !s.trim().is_empty()) else {
                        continue;
                    };
                    let mut scope = scope.clone();
                    scope.insert("index".into(), Value::from(index));
                    planned.push(PlannedArtifact {
                        key: format!("{base_key}.{index}"),
                        filename: expand(template, &scope),
                        source: source.to_string(),
                    });
                }
            }
            _ => {}
        }
    }
    planned
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

/// Copies local sources (`file://` URLs or absolute paths) into the asset
/// directory. Remote schemes need a store backed by a network client.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsArtifactStore;

impl FsArtifactStore {
    fn local_source(source: &str) -> Option<PathBuf> {
        let path = match source.strip_prefix("file://") {
            Some(path) => Path::new(path),
            None if source.contains("://") => return None,
            None => Path::new(source),
        };
        path.is_absolute().then(|| path.to_path_buf())
    }

    /// Resolve `filename` inside `asset_dir`. Absolute names and `..`
    /// components are rejected so artifacts never land outside the asset.
    fn target(asset_dir: &Path, filename: &str) -> Result<PathBuf> {
        let relative = Path::new(filename);
        let contained = !filename.trim().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(PipelineError::Artifact {
                name: filename.to_string(),
                message: "filename must be a relative path inside the asset directory".into(),
            });
        }
        Ok(asset_dir.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn exists(&self, asset_dir: &Path, filename: &str) -> Result<bool> {
        let target = Self::target(asset_dir, filename)?;
        Ok(tokio::fs::try_exists(target).await?)
    }

    async fn store(&self, asset_dir: &Path, filename: &str, source: &str) -> Result<()> {
        let target = Self::target(asset_dir, filename)?;
        let Some(from) = Self::local_source(source) else {
            return Err(PipelineError::Artifact {
                name: filename.to_string(),
                message: format!("no transport configured for '{source}'"),
            });
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&from, &target)
            .await
            .map_err(|e| PipelineError::Artifact {
                name: filename.to_string(),
                message: format!("copy from {}: {e}", from.display()),
            })?;
        tracing::debug!(target = %target.display(), "Artifact stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> Vec<OutputBinding> {
        serde_json::from_value(json!([
            { "name": "glb", "responsePath": "model_urls.glb", "artifact": "{{assetId}}.glb" },
            { "name": "thumbnail", "responsePath": "thumbnail_url" },
            { "name": "textures", "responsePath": "texture_urls", "artifact": "tex_{{index}}.png" }
        ]))
        .unwrap()
    }

    fn scope() -> Scope {
        let mut scope = Scope::new();
        scope.insert("assetId".into(), json!("hero"));
        scope
    }

    #[test]
    fn plans_strings_and_arrays() {
        let mut values = Map::new();
        values.insert("glb".into(), json!("https://x/model.glb"));
        values.insert("thumbnail".into(), json!("https://x/thumb.png"));
        values.insert("textures".into(), json!(["https://x/0.png", "", "https://x/2.png"]));

        let planned = plan_artifacts(&outputs(), &values, &scope(), None);
        let keys: Vec<_> = planned.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["glb", "textures.0", "textures.2"]);
        assert_eq!(planned[0].filename, "hero.glb");
        assert_eq!(planned[2].filename, "tex_2.png");
        assert_eq!(planned[2].source, "https://x/2.png");
    }

    #[test]
    fn iteration_prefixes_keys() {
        let mut values = Map::new();
        values.insert("glb".into(), json!("https://x/walk.glb"));
        let planned = plan_artifacts(&outputs(), &values, &scope(), Some(3));
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].key, "glb.3");
    }

    #[test]
    fn blank_and_missing_values_are_skipped() {
        let mut values = Map::new();
        values.insert("glb".into(), json!("   "));
        assert!(plan_artifacts(&outputs(), &values, &scope(), None).is_empty());
    }

    #[tokio::test]
    async fn fs_store_copies_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.glb");
        std::fs::write(&source, b"glTF").unwrap();
        let asset_dir = dir.path().join("asset");

        let store = FsArtifactStore;
        assert!(!store.exists(&asset_dir, "models/hero.glb").await.unwrap());
        store
            .store(&asset_dir, "models/hero.glb", &format!("file://{}", source.display()))
            .await
            .unwrap();
        assert!(store.exists(&asset_dir, "models/hero.glb").await.unwrap());
        assert_eq!(std::fs::read(asset_dir.join("models/hero.glb")).unwrap(), b"glTF");
    }

    #[tokio::test]
    async fn fs_store_refuses_remote_sources() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsArtifactStore
            .store(dir.path(), "hero.glb", "https://x/model.glb")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Artifact { .. }));
    }

    #[tokio::test]
    async fn fs_store_keeps_files_inside_asset_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.glb");
        std::fs::write(&source, b"glTF").unwrap();
        let asset_dir = dir.path().join("asset");
        let source = format!("file://{}", source.display());

        for filename in ["../escaped.glb", "models/../../escaped.glb", "/tmp/escaped.glb", ""] {
            let err = FsArtifactStore
                .store(&asset_dir, filename, &source)
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::Artifact { .. }), "{filename}");
        }
        assert!(!dir.path().join("escaped.glb").exists());
        assert!(FsArtifactStore.exists(&asset_dir, "../source.glb").await.is_err());
    }

    #[tokio::test]
    async fn fs_store_refuses_relative_sources() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsArtifactStore
            .store(dir.path(), "hero.glb", "models/hero.glb")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Artifact { .. }));
    }
}
