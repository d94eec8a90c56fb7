use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_EXPERIMENT_NAME: &str = "feature_store_ingestion";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RegistryConfigDef")]
pub struct RegistryConfig {
    /// sqlx connection string, e.g. `sqlite://data/registry.db`.
    pub path: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RegistryConfigDef {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        max_connections: Option<u32>,
        #[serde(default)]
        min_connections: Option<u32>,
    },
}

impl From<RegistryConfigDef> for RegistryConfig {
    fn from(value: RegistryConfigDef) -> Self {
        match value {
            RegistryConfigDef::Path(path) => RegistryConfig {
                path,
                ..Default::default()
            },
            RegistryConfigDef::Detailed {
                path,
                max_connections,
                min_connections,
            } => RegistryConfig {
                path,
                max_connections,
                min_connections,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    #[default]
    Parquet,
    ArrowIpc,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Parquet => "parquet",
            ArtifactFormat::ArrowIpc => "arrow",
        }
    }

    /// Format named by the extension of `path`, if it is one we write.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "parquet" => Some(ArtifactFormat::Parquet),
            "arrow" => Some(ArtifactFormat::ArrowIpc),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ArtifactStoreConfigDef")]
pub struct ArtifactStoreConfig {
    pub path: String,
    pub format: ArtifactFormat,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum ArtifactStoreConfigDef {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        format: Option<ArtifactFormat>,
    },
}

impl From<ArtifactStoreConfigDef> for ArtifactStoreConfig {
    fn from(value: ArtifactStoreConfigDef) -> Self {
        match value {
            ArtifactStoreConfigDef::Path(path) => ArtifactStoreConfig {
                path,
                ..Default::default()
            },
            ArtifactStoreConfigDef::Detailed { path, format } => ArtifactStoreConfig {
                path,
                format: format.unwrap_or_default(),
            },
        }
    }
}

fn default_experiment_name() -> String {
    DEFAULT_EXPERIMENT_NAME.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTrackingConfig {
    /// Base URL of an MLflow tracking server.
    pub tracking_uri: String,
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub project: String,
    pub project_description: Option<String>,
    pub registry: RegistryConfig,
    pub artifact_store: ArtifactStoreConfig,
    #[serde(default)]
    pub experiment_tracking: Option<ExperimentTrackingConfig>,
}

impl StoreConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(anyhow!("Empty configuration file"));
        }
        let config: StoreConfig = serde_saphyr::from_str(yaml).map_err(|err| anyhow!(err))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn artifact_format_from_extension() {
        assert_eq!(
            ArtifactFormat::from_path(Path::new("/data/logins/v1.parquet")),
            Some(ArtifactFormat::Parquet)
        );
        assert_eq!(
            ArtifactFormat::from_path(Path::new("logins/v2.arrow")),
            Some(ArtifactFormat::ArrowIpc)
        );
        assert_eq!(ArtifactFormat::from_path(Path::new("logins/v3.csv")), None);
        assert_eq!(ArtifactFormat::from_path(Path::new("logins/v3")), None);
    }

    #[test]
    fn parse_config_local_parquet() -> Result<()> {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        let config_path = format!("{}/test_data/local_parquet.yaml", project_dir);
        let yaml_str = fs::read_to_string(config_path)?;
        let config = StoreConfig::from_yaml_str(&yaml_str)?;
        assert_eq!(config.project, "local_parquet");
        let expected_registry = RegistryConfig {
            path: "sqlite://data/registry.db".to_string(),
            ..Default::default()
        };
        assert_eq!(config.registry, expected_registry);
        let expected_artifacts = ArtifactStoreConfig {
            path: "data/features".to_string(),
            format: ArtifactFormat::Parquet,
        };
        assert_eq!(config.artifact_store, expected_artifacts);
        assert_eq!(config.experiment_tracking, None);
        Ok(())
    }

    #[test]
    fn parse_config_arrow_ipc_with_mlflow() -> Result<()> {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        let config_path = format!("{}/test_data/arrow_ipc_mlflow.yaml", project_dir);
        let yaml_str = fs::read_to_string(config_path)?;
        let config = StoreConfig::from_yaml_str(&yaml_str)?;
        assert_eq!(config.project, "arrow_ipc_mlflow");
        let expected_registry = RegistryConfig {
            path: "sqlite:///var/lib/features/registry.db".to_string(),
            max_connections: Some(8),
            min_connections: Some(2),
        };
        assert_eq!(config.registry, expected_registry);
        assert_eq!(config.artifact_store.format, ArtifactFormat::ArrowIpc);
        assert_eq!(
            config.experiment_tracking,
            Some(ExperimentTrackingConfig {
                tracking_uri: "http://localhost:5000".to_string(),
                experiment_name: DEFAULT_EXPERIMENT_NAME.to_string(),
            })
        );
        Ok(())
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(StoreConfig::from_yaml_str("  \n").is_err());
    }
}
