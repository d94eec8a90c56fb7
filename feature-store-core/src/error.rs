use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureStoreError {
    FeatureNotFound {
        name: String,
    },
    VersionNotFound {
        feature_name: String,
        version: Option<String>,
    },
    InvalidInput {
        message: String,
    },
    ConflictOrIntegrity {
        message: String,
    },
    StorageFault {
        path: String,
        message: String,
    },
}

impl FeatureStoreError {
    pub fn feature_not_found(name: impl Into<String>) -> Self {
        Self::FeatureNotFound { name: name.into() }
    }

    /// `version` is `None` when the latest version was requested.
    pub fn version_not_found(feature_name: impl Into<String>, version: Option<&str>) -> Self {
        Self::VersionNotFound {
            feature_name: feature_name.into(),
            version: version.map(str::to_owned),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::ConflictOrIntegrity {
            message: message.into(),
        }
    }

    pub fn storage_fault(path: impl Into<String>, cause: impl Display) -> Self {
        Self::StorageFault {
            path: path.into(),
            message: cause.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FeatureNotFound { .. } | Self::VersionNotFound { .. }
        )
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConflictOrIntegrity { .. })
    }

    pub fn is_storage_fault(&self) -> bool {
        matches!(self, Self::StorageFault { .. })
    }
}

impl Display for FeatureStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeatureNotFound { name } => {
                write!(f, "Feature '{}' not found. Register it first.", name)
            }
            Self::VersionNotFound {
                feature_name,
                version: Some(version),
            } => write!(
                f,
                "No data found for feature '{}' (Version: {})",
                feature_name, version
            ),
            Self::VersionNotFound {
                feature_name,
                version: None,
            } => write!(
                f,
                "No data found for feature '{}' (Version: Latest)",
                feature_name
            ),
            Self::InvalidInput { message } => write!(f, "Invalid input: {}", message),
            Self::ConflictOrIntegrity { message } => write!(f, "Conflict: {}", message),
            Self::StorageFault { path, message } => {
                write!(f, "Storage failure at '{}': {}", path, message)
            }
        }
    }
}

impl std::error::Error for FeatureStoreError {}

/// Finds a [`FeatureStoreError`] anywhere in an `anyhow` error chain.
pub fn find_store_error(err: &anyhow::Error) -> Option<&FeatureStoreError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<FeatureStoreError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classifies_variants() {
        assert!(FeatureStoreError::feature_not_found("logins").is_not_found());
        assert!(FeatureStoreError::version_not_found("logins", Some("v3")).is_not_found());
        assert!(FeatureStoreError::invalid_input("bad").is_invalid_input());
        assert!(FeatureStoreError::conflict("dup").is_conflict());
        assert!(FeatureStoreError::storage_fault("/tmp/x", "disk full").is_storage_fault());
    }

    #[test]
    fn version_not_found_message_names_latest() {
        let err = FeatureStoreError::version_not_found("logins", None);
        assert_eq!(
            err.to_string(),
            "No data found for feature 'logins' (Version: Latest)"
        );
    }

    #[test]
    fn finds_error_behind_context() {
        let err: anyhow::Error = Err::<(), _>(FeatureStoreError::conflict("v2 taken"))
            .context("ingesting logins")
            .unwrap_err();
        let found = find_store_error(&err).map(FeatureStoreError::is_conflict);
        assert_eq!(found, Some(true));
    }
}
