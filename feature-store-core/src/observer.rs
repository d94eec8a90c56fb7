//! Hooks invoked by [`crate::feature_store::FeatureStore`] around registrations,
//! ingestions and lookups. Observer errors are logged and never fail the operation.

pub mod mlflow;

use crate::config::ExperimentTrackingConfig;
use crate::model::{EntityId, Feature, FeatureVersion, Registration, VersionLabel};
use crate::profiler::Profile;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub use mlflow::MlflowObserver;

/// A committed ingestion, handed to observers after the version row exists.
#[derive(Debug, Clone, Copy)]
pub struct IngestionEvent<'a> {
    pub feature: &'a Feature,
    pub version: &'a FeatureVersion,
    pub profile: &'a Profile,
}

#[async_trait]
pub trait FeatureStoreObserver: Send + Sync {
    async fn feature_registered(&self, _registration: &Registration) -> Result<()> {
        Ok(())
    }

    async fn ingestion_started(&self, _feature: &Feature, _version: VersionLabel) -> Result<()> {
        Ok(())
    }

    async fn ingestion_completed(&self, _event: IngestionEvent<'_>) -> Result<()> {
        Ok(())
    }

    async fn lookup_missed(
        &self,
        _feature_name: &str,
        _entity_key: &str,
        _entity_id: &EntityId,
    ) -> Result<()> {
        Ok(())
    }
}

/// Observers enabled by the store configuration. An observer that cannot be
/// set up is skipped with a warning.
pub fn get_observers(
    config: Option<&ExperimentTrackingConfig>,
) -> Vec<Arc<dyn FeatureStoreObserver>> {
    let mut observers: Vec<Arc<dyn FeatureStoreObserver>> = Vec::new();
    if let Some(tracking) = config {
        match MlflowObserver::new(tracking) {
            Ok(observer) => observers.push(Arc::new(observer)),
            Err(err) => warn!("Experiment tracking disabled: {:#}", err),
        }
    }
    observers
}
