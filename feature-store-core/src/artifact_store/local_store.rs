use crate::artifact_store::arrow_codec::{read_file, to_record_batch, write_file};
use crate::artifact_store::{ArtifactLayout, ArtifactLocation, ArtifactStore};
use crate::config::ArtifactFormat;
use crate::dataset::Dataset;
use crate::error::FeatureStoreError;
use crate::profiler::Profile;
use anyhow::{Result, anyhow};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Artifact store on the local filesystem. Files are written to a uniquely
/// named temp file next to their target, fsynced and then moved into place.
pub struct LocalArtifactStore {
    layout: ArtifactLayout,
}

impl LocalArtifactStore {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }
}

fn storage_fault(path: &Path, err: anyhow::Error) -> anyhow::Error {
    FeatureStoreError::storage_fault(path.display().to_string(), format!("{:#}", err)).into()
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(storage_fault(path, err.into())),
    }
}

fn temp_file_for(path: &Path) -> Result<NamedTempFile> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("Artifact path has no parent directory"))?;
    Ok(tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(parent)?)
}

/// Writes the batch to a temp file and links it at `path` only if nothing
/// is there yet. The temp file is removed on every failure.
fn publish_new_dataset(batch: &RecordBatch, path: &Path, format: ArtifactFormat) -> Result<()> {
    let tmp = temp_file_for(path).map_err(|err| storage_fault(path, err))?;
    let file = tmp
        .as_file()
        .try_clone()
        .map_err(|err| storage_fault(path, err.into()))?;
    write_file(batch, file, format).map_err(|err| storage_fault(path, err))?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
            Err(FeatureStoreError::conflict(format!(
                "artifact {} already exists",
                path.display()
            ))
            .into())
        }
        Err(err) => Err(storage_fault(path, err.error.into())),
    }
}

fn replace_file(content: &[u8], path: &Path) -> Result<()> {
    let mut tmp = temp_file_for(path)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    async fn write_dataset(&self, dataset: &Dataset, path: &Path) -> Result<()> {
        let batch = to_record_batch(dataset)?;
        let format = self.layout.format();
        let target = path.to_path_buf();
        ensure_parent(path)
            .await
            .map_err(|err| storage_fault(path, err))?;
        tokio::task::spawn_blocking(move || publish_new_dataset(&batch, &target, format))
            .await
            .map_err(|e| storage_fault(path, anyhow!("Artifact writer task failed: {}", e)))
            .and_then(|res| res)?;
        debug!("Wrote {} rows to {}", dataset.row_count(), path.display());
        Ok(())
    }

    async fn read_dataset(&self, path: &Path) -> Result<Dataset> {
        let format = ArtifactFormat::from_path(path).unwrap_or_else(|| self.layout.format());
        let source = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_file(&source, format))
            .await
            .map_err(|e| anyhow!("Artifact reader task failed: {}", e))
            .and_then(|res| res)
            .map_err(|err| storage_fault(path, err))
    }

    async fn artifact_exists(&self, path: &Path) -> Result<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|err| storage_fault(path, err.into()))
    }

    async fn remove_version(&self, location: &ArtifactLocation) -> Result<()> {
        remove_if_exists(&location.stats).await?;
        remove_if_exists(&location.artifact).await
    }

    async fn write_profile(&self, profile: &Profile, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(profile)?;
        let target = path.to_path_buf();
        ensure_parent(path)
            .await
            .map_err(|err| storage_fault(path, err))?;
        tokio::task::spawn_blocking(move || replace_file(&content, &target))
            .await
            .map_err(|e| anyhow!("Stats writer task failed: {}", e))
            .and_then(|res| res)
            .map_err(|err| storage_fault(path, err))
    }

    async fn read_profile(&self, path: &Path) -> Result<Option<Profile>> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(storage_fault(path, err.into())),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|err| storage_fault(path, err.into()))
    }

    async fn remove_feature(&self, feature_name: &str) -> Result<()> {
        let dir = self.layout.feature_dir(feature_name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("No artifact directory at {}", dir.display());
                Ok(())
            }
            Err(err) => Err(storage_fault(&dir, err.into())),
        }
    }
}
