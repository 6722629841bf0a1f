//! Manifest persistence.
//!
//! The runner saves the manifest after every completed unit of work. The
//! file-backed store writes `<asset_dir>/manifest.json` through a temporary
//! file and a rename, so a reader never observes a half-written document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use contentgen_types::{AssetManifest, PipelineError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Load the manifest for `asset_dir`; `Ok(None)` when none exists yet.
    async fn load(&self, asset_dir: &Path) -> Result<Option<AssetManifest>>;

    /// Persist the whole manifest, returning where it was written.
    async fn save(&self, asset_dir: &Path, manifest: &AssetManifest) -> Result<PathBuf>;
}

/// Stores each manifest as pretty-printed JSON inside its asset directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsManifestStore;

#[async_trait]
impl ManifestStore for FsManifestStore {
    async fn load(&self, asset_dir: &Path) -> Result<Option<AssetManifest>> {
        load_manifest(asset_dir).await
    }

    async fn save(&self, asset_dir: &Path, manifest: &AssetManifest) -> Result<PathBuf> {
        save_manifest(manifest, asset_dir).await
    }
}

pub fn manifest_path(asset_dir: &Path) -> PathBuf {
    asset_dir.join(MANIFEST_FILE)
}

/// Save a manifest into `asset_dir`, creating the directory if needed.
pub async fn save_manifest(manifest: &AssetManifest, asset_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(asset_dir).await?;
    let path = manifest_path(asset_dir);
    let staging = asset_dir.join(format!(".{MANIFEST_FILE}.tmp"));
    let json = serde_json::to_string_pretty(manifest)?;
    tokio::fs::write(&staging, json).await?;
    tokio::fs::rename(&staging, &path).await?;
    tracing::debug!(path = %path.display(), "Manifest saved");
    Ok(path)
}

/// Load the manifest from `asset_dir`.
///
/// Returns `Ok(None)` when no manifest file exists. A file that does not
/// satisfy the manifest schema is an [`PipelineError::InvalidManifest`].
pub async fn load_manifest(asset_dir: &Path) -> Result<Option<AssetManifest>> {
    let path = manifest_path(asset_dir);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    let document: serde_json::Value = serde_json::from_str(&json)
        .map_err(|e| PipelineError::InvalidManifest(format!("{}: {e}", path.display())))?;
    AssetManifest::from_document(document).map(Some)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use contentgen_types::TaskStatus;

    fn sample_manifest() -> AssetManifest {
        let mut manifest = AssetManifest::new("hero", "Hero", "character");
        manifest.seed = Some(7);
        manifest
            .extra
            .insert("textToImageTask".into(), serde_json::json!({ "prompt": "Test" }));
        let state = manifest.task_mut("preview");
        state.task_id = Some("job-1".into());
        state.status = Some(TaskStatus::Succeeded);
        manifest
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest();

        let path = save_manifest(&manifest, dir.path()).await.unwrap();
        assert!(path.ends_with(MANIFEST_FILE));
        assert!(!dir.path().join(".manifest.json.tmp").exists());

        let loaded = load_manifest(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn load_from_empty_directory_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does_not_exist");
        assert!(load_manifest(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_rejects_manifest_without_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{ "name": "Hero", "type": "prop" }"#,
        )
        .unwrap();
        let err = load_manifest(dir.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidManifest(ref m) if m.contains("id")));
    }

    #[tokio::test]
    async fn store_trait_delegates_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsManifestStore;
        store.save(dir.path(), &sample_manifest()).await.unwrap();
        let loaded = store.load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.id, "hero");
        assert!(loaded.step_succeeded("preview"));
    }
}
