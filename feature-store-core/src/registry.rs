//! Registry module for feature and feature version metadata.

use crate::config::RegistryConfig;
use crate::model::{
    Feature, FeatureDetails, FeatureSummary, FeatureVersion, Registration, VersionLabel,
    VersionSelector,
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub mod sql_registry;

pub use sql_registry::SqlFeatureRegistry;

/// Transactional CRUD over features and their versions. Every call runs in
/// its own transaction and rolls it back on failure.
#[async_trait]
pub trait FeatureRegistry: Send + Sync {
    /// Inserts the feature, or updates description and owner when the name exists.
    async fn upsert_feature(&self, name: &str, description: &str, owner: &str)
    -> Result<Registration>;

    async fn list_features(&self) -> Result<Vec<FeatureSummary>>;

    /// Feature with all versions loaded.
    async fn get_feature(&self, name: &str) -> Result<Option<FeatureDetails>>;

    async fn find_feature(&self, name: &str) -> Result<Option<Feature>>;

    /// Successor of the highest existing label, or `v1`.
    async fn allocate_next_version(&self, feature: &Feature) -> Result<VersionLabel>;

    /// Inserts a version row. Fails with a conflict when `version` is taken or
    /// is not the direct successor of the current latest version.
    async fn record_version(
        &self,
        feature: &Feature,
        version: VersionLabel,
        path: &str,
        commit_hash: Option<&str>,
    ) -> Result<FeatureVersion>;

    async fn find_version(
        &self,
        feature: &Feature,
        selector: VersionSelector,
    ) -> Result<Option<FeatureVersion>>;

    /// Deletes a feature and, by cascade, all of its versions.
    async fn delete_feature(&self, name: &str) -> Result<bool>;
}

pub async fn get_registry(
    config: &RegistryConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn FeatureRegistry>> {
    let registry = SqlFeatureRegistry::connect(config, cwd).await?;
    Ok(Arc::new(registry))
}
