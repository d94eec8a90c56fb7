//! Persistence of version artifacts (columnar data) and their stats files.

mod arrow_codec;
pub mod local_store;

use crate::config::{ArtifactFormat, ArtifactStoreConfig};
use crate::dataset::Dataset;
use crate::model::VersionLabel;
use crate::profiler::Profile;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub use local_store::LocalArtifactStore;

const STATS_SUFFIX: &str = "_stats.json";

/// Where one version's artifact and stats file live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub artifact: PathBuf,
    pub stats: PathBuf,
}

/// `{root}/{feature}/{version}.{ext}` next to `{root}/{feature}/{version}_stats.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactLayout {
    root: PathBuf,
    format: ArtifactFormat,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>, format: ArtifactFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    pub fn feature_dir(&self, feature_name: &str) -> PathBuf {
        self.root.join(feature_name)
    }

    pub fn location(&self, feature_name: &str, version: VersionLabel) -> ArtifactLocation {
        let artifact = self
            .feature_dir(feature_name)
            .join(format!("{}.{}", version, self.format.extension()));
        let stats = stats_path_for(&artifact);
        ArtifactLocation { artifact, stats }
    }
}

/// Stats path of an artifact: the extension is replaced by `_stats.json`.
pub fn stats_path_for(artifact: &Path) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    artifact.with_file_name(format!("{}{}", stem, STATS_SUFFIX))
}

#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    fn layout(&self) -> &ArtifactLayout;

    /// Must not leave a partially written file at `path` on failure, and must
    /// never replace an existing file: that is a `ConflictOrIntegrity` error.
    async fn write_dataset(&self, dataset: &Dataset, path: &Path) -> Result<()>;

    /// Decodes using the format named by the extension of `path`, falling
    /// back to the configured format.
    async fn read_dataset(&self, path: &Path) -> Result<Dataset>;

    async fn artifact_exists(&self, path: &Path) -> Result<bool>;

    /// Removes one version's artifact and stats file; missing files are ignored.
    async fn remove_version(&self, location: &ArtifactLocation) -> Result<()>;

    async fn write_profile(&self, profile: &Profile, path: &Path) -> Result<()>;

    /// `Ok(None)` when no stats file exists at `path`.
    async fn read_profile(&self, path: &Path) -> Result<Option<Profile>>;

    /// Removes every artifact of a feature; a missing directory is not an error.
    async fn remove_feature(&self, feature_name: &str) -> Result<()>;
}

pub fn get_artifact_store(
    config: &ArtifactStoreConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn ArtifactStore>> {
    let root = match cwd {
        Some(prefix) if Path::new(&config.path).is_relative() => {
            Path::new(prefix).join(&config.path)
        }
        _ => PathBuf::from(&config.path),
    };
    debug!(
        "Create local artifact store at {} using {:?}",
        root.display(),
        config.format
    );
    let layout = ArtifactLayout::new(root, config.format);
    Ok(Arc::new(LocalArtifactStore::new(layout)) as Arc<dyn ArtifactStore>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() -> Result<()> {
        let layout = ArtifactLayout::new("/data/features", ArtifactFormat::Parquet);
        let location = layout.location("logins", VersionLabel::new(3)?);
        assert_eq!(
            location.artifact,
            PathBuf::from("/data/features/logins/v3.parquet")
        );
        assert_eq!(
            location.stats,
            PathBuf::from("/data/features/logins/v3_stats.json")
        );
        Ok(())
    }

    #[test]
    fn arrow_ipc_layout_uses_its_extension() -> Result<()> {
        let layout = ArtifactLayout::new("root", ArtifactFormat::ArrowIpc);
        let location = layout.location("clicks", VersionLabel::FIRST);
        assert_eq!(location.artifact, PathBuf::from("root/clicks/v1.arrow"));
        assert_eq!(location.stats, PathBuf::from("root/clicks/v1_stats.json"));
        Ok(())
    }

    #[test]
    fn stats_path_is_derived_from_artifact_path() {
        assert_eq!(
            stats_path_for(Path::new("/a/b/v12.parquet")),
            PathBuf::from("/a/b/v12_stats.json")
        );
    }

    #[test]
    fn relative_root_resolves_against_cwd() -> Result<()> {
        let config = ArtifactStoreConfig {
            path: "data/features".to_string(),
            format: ArtifactFormat::Parquet,
        };
        let store = get_artifact_store(&config, Some("/repo"))?;
        assert_eq!(store.layout().root(), Path::new("/repo/data/features"));
        Ok(())
    }
}
