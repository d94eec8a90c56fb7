//! Feature Store module. Orchestrates registration, versioned ingestion and
//! retrieval across the registry and the artifact store.

mod feature_store_impl;

pub use feature_store_impl::FeatureStore;

use crate::profiler::Profile;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};

pub(crate) const STATS_FILE_NOT_FOUND: &str = "Stats file not found";

/// Outcome of a stats lookup. A missing or unreadable stats file is reported
/// in-band instead of failing the call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatsLookup {
    Profile(Profile),
    Unavailable { error: String },
}

impl StatsLookup {
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            StatsLookup::Profile(profile) => Some(profile),
            StatsLookup::Unavailable { .. } => None,
        }
    }
}

/// One async lock per feature name, serializing version allocation and
/// recording for that feature only.
#[derive(Default)]
pub(crate) struct FeatureLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FeatureLocks {
    pub(crate) fn get(&self, feature_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(feature_name.to_string()).or_default().clone()
    }

    pub(crate) fn forget(&self, feature_name: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(feature_name);
    }
}
