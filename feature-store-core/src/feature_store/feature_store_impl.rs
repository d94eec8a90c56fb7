use crate::artifact_store::{ArtifactStore, stats_path_for};
use crate::dataset::{Dataset, Record};
use crate::error::FeatureStoreError;
use crate::feature_store::{FeatureLocks, STATS_FILE_NOT_FOUND, StatsLookup};
use crate::model::{
    EntityId, Feature, FeatureDetails, FeatureSummary, FeatureVersion, Registration,
    VersionSelector, validate_feature_name,
};
use crate::observer::{FeatureStoreObserver, IngestionEvent};
use crate::profiler::calculate_statistics;
use crate::registry::FeatureRegistry;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FeatureStore {
    registry: Arc<dyn FeatureRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    observers: Vec<Arc<dyn FeatureStoreObserver>>,
    ingestion_locks: FeatureLocks,
}

fn report(hook: &str, result: Result<()>) {
    if let Err(err) = result {
        warn!("Observer hook {} failed: {:#}", hook, err);
    }
}

impl FeatureStore {
    pub fn new(registry: Arc<dyn FeatureRegistry>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            registry,
            artifacts,
            observers: Vec::new(),
            ingestion_locks: FeatureLocks::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FeatureStoreObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_observers(
        mut self,
        observers: impl IntoIterator<Item = Arc<dyn FeatureStoreObserver>>,
    ) -> Self {
        self.observers.extend(observers);
        self
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Creates the feature, or updates description and owner of an existing one.
    pub async fn register_feature(
        &self,
        name: &str,
        description: &str,
        owner: &str,
    ) -> Result<Registration> {
        validate_feature_name(name)?;
        let registration = self
            .registry
            .upsert_feature(name, description, owner)
            .await?;
        if registration.created {
            info!("Registered feature {}", name);
        } else {
            info!("Feature {} already exists, updated metadata", name);
        }
        for observer in &self.observers {
            report(
                "feature_registered",
                observer.feature_registered(&registration).await,
            );
        }
        Ok(registration)
    }

    pub async fn list_features(&self) -> Result<Vec<FeatureSummary>> {
        self.registry.list_features().await
    }

    pub async fn get_feature(&self, name: &str) -> Result<FeatureDetails> {
        self.registry
            .get_feature(name)
            .await?
            .ok_or_else(|| FeatureStoreError::feature_not_found(name).into())
    }

    async fn require_feature(&self, name: &str) -> Result<Feature> {
        self.registry
            .find_feature(name)
            .await?
            .ok_or_else(|| FeatureStoreError::feature_not_found(name).into())
    }

    async fn resolve_version(
        &self,
        feature_name: &str,
        selector: VersionSelector,
    ) -> Result<FeatureVersion> {
        let feature = self.require_feature(feature_name).await?;
        self.registry
            .find_version(&feature, selector)
            .await?
            .ok_or_else(|| {
                let label = selector.label().map(|l| l.to_string());
                FeatureStoreError::version_not_found(feature_name, label.as_deref()).into()
            })
    }

    /// Persists `dataset` as the next version of `feature_name`.
    ///
    /// The artifact and its stats file are written before the version row is
    /// recorded, so a recorded version always points at a complete artifact.
    /// An artifact is never written over: if the allocated label already has
    /// a file and a version row, another writer sharing the registry won the
    /// label and this ingestion fails with `ConflictOrIntegrity` without
    /// touching any file. A file without a row was left by a failed
    /// ingestion and is removed before writing.
    pub async fn ingest_feature_data(
        &self,
        feature_name: &str,
        dataset: &Dataset,
        commit_hash: Option<&str>,
    ) -> Result<FeatureVersion> {
        let feature = self.require_feature(feature_name).await?;
        if dataset.columns().is_empty() {
            return Err(FeatureStoreError::invalid_input("dataset has no columns").into());
        }

        let lock = self.ingestion_locks.get(&feature.name);
        let guard = lock.lock().await;
        let version = self.registry.allocate_next_version(&feature).await?;
        let location = self.artifacts.layout().location(&feature.name, version);
        if self.artifacts.artifact_exists(&location.artifact).await? {
            let recorded = self
                .registry
                .find_version(&feature, VersionSelector::Label(version))
                .await?;
            if recorded.is_some() {
                return Err(FeatureStoreError::conflict(format!(
                    "version {} of feature '{}' already exists",
                    version, feature.name
                ))
                .into());
            }
            warn!("Removing unrecorded artifact {}", location.artifact.display());
            self.artifacts.remove_version(&location).await?;
        }
        info!(
            "Ingest {} rows into {} {}",
            dataset.row_count(),
            feature.name,
            version
        );
        for observer in &self.observers {
            report(
                "ingestion_started",
                observer.ingestion_started(&feature, version).await,
            );
        }

        let profile = calculate_statistics(dataset);
        self.artifacts
            .write_dataset(dataset, &location.artifact)
            .await?;
        self.artifacts
            .write_profile(&profile, &location.stats)
            .await?;
        let path = location.artifact.to_string_lossy();
        let recorded = self
            .registry
            .record_version(&feature, version, &path, commit_hash)
            .await?;
        drop(guard);
        info!("Ingested {} {}", feature.name, recorded.version);

        let event = IngestionEvent {
            feature: &feature,
            version: &recorded,
            profile: &profile,
        };
        for observer in &self.observers {
            report(
                "ingestion_completed",
                observer.ingestion_completed(event).await,
            );
        }
        Ok(recorded)
    }

    /// Reads the dataset of an explicit version, or of the latest one when
    /// `version` is `None` or `"latest"`.
    pub async fn get_feature_data(
        &self,
        feature_name: &str,
        version: Option<&str>,
    ) -> Result<Dataset> {
        let selector = VersionSelector::parse(version)?;
        let resolved = self.resolve_version(feature_name, selector).await?;
        debug!("Load {} {} from {}", feature_name, resolved.version, resolved.path);
        self.artifacts.read_dataset(Path::new(&resolved.path)).await
    }

    /// First row of the latest version whose `entity_key` column equals
    /// `entity_id`, or `None` when no row matches.
    pub async fn get_online_value(
        &self,
        feature_name: &str,
        entity_id: &EntityId,
        entity_key: &str,
    ) -> Result<Option<Record>> {
        let dataset = self.get_feature_data(feature_name, None).await?;
        let record = dataset.find_first(entity_key, entity_id)?;
        if record.is_none() {
            debug!(
                "No row with {} = {} in latest {}",
                entity_key, entity_id, feature_name
            );
            for observer in &self.observers {
                report(
                    "lookup_missed",
                    observer
                        .lookup_missed(feature_name, entity_key, entity_id)
                        .await,
                );
            }
        }
        Ok(record)
    }

    /// Profile stored next to the version's artifact. Unknown features and
    /// versions are errors, a missing stats file is not.
    pub async fn get_feature_stats(&self, feature_name: &str, version: &str) -> Result<StatsLookup> {
        let selector = VersionSelector::parse(Some(version))?;
        let resolved = self.resolve_version(feature_name, selector).await?;
        let stats_path = stats_path_for(Path::new(&resolved.path));
        match self.artifacts.read_profile(&stats_path).await {
            Ok(Some(profile)) => Ok(StatsLookup::Profile(profile)),
            Ok(None) => Ok(StatsLookup::Unavailable {
                error: STATS_FILE_NOT_FOUND.to_string(),
            }),
            Err(err) => {
                warn!("Failed to read stats {}: {:#}", stats_path.display(), err);
                Ok(StatsLookup::Unavailable {
                    error: format!("{:#}", err),
                })
            }
        }
    }

    /// Deletes the feature with all of its versions, then its artifacts.
    pub async fn delete_feature(&self, name: &str) -> Result<()> {
        let lock = self.ingestion_locks.get(name);
        let guard = lock.lock().await;
        if !self.registry.delete_feature(name).await? {
            return Err(FeatureStoreError::feature_not_found(name).into());
        }
        if let Err(err) = self.artifacts.remove_feature(name).await {
            warn!("Failed to remove artifacts of {}: {:#}", name, err);
        }
        drop(guard);
        self.ingestion_locks.forget(name);
        info!("Deleted feature {}", name);
        Ok(())
    }
}
