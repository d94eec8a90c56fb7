use clap::{Parser, Subcommand, ValueEnum};
use feature_store_core::model::{DEFAULT_ENTITY_KEY, DEFAULT_OWNER, EntityId};
use std::path::PathBuf;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

/// Integers are looked up as integers, anything else as a string.
pub fn parse_entity_id(value: &str) -> Result<EntityId, String> {
    Ok(value
        .parse::<i64>()
        .map(EntityId::Int)
        .unwrap_or_else(|_| EntityId::String(value.to_string())))
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Start the HTTP server locally on a given port
    Serve {
        /// Specify a host for the server
        #[arg(short = 'n', long = "host", default_value = "127.0.0.1")]
        host: String,
        /// Specify a port for the server
        #[arg(short = 'p', long = "port", default_value_t = 8000)]
        port: u16,
        /// path to TLS certificate private key. You need to pass --cert as well to start server in TLS mode
        #[arg(short='k', long="key", default_value = None)]
        key: Option<String>,
        /// path to TLS certificate public key. You need to pass --key as well to start server in TLS mode
        #[arg(short='c', long="cert", default_value = None)]
        cert: Option<String>,
        /// Enable the Metrics Server
        #[arg(short = 'm', long = "metrics", default_value_t = false)]
        metrics_enabled: bool,
    },
    /// Register a feature, or update description and owner of an existing one
    Register {
        name: String,
        #[arg(short = 'd', long = "description", default_value = "")]
        description: String,
        #[arg(short = 'o', long = "owner", default_value = DEFAULT_OWNER)]
        owner: String,
    },
    /// List registered features with their version counts
    List,
    /// Show a feature with all of its versions
    Show { name: String },
    /// Ingest a JSON column payload as the next version of a feature
    Ingest {
        name: String,
        /// File containing `{"columns": [{"name", "dtype", "values"}]}`
        #[arg(long = "file")]
        file: PathBuf,
        #[arg(long = "commit-hash", default_value = None)]
        commit_hash: Option<String>,
    },
    /// Print the statistics profile of a feature version
    Stats { name: String, version: String },
    /// Look up the first row of the latest version matching an entity
    Lookup {
        name: String,
        #[arg(value_parser = parse_entity_id)]
        entity_id: EntityId,
        #[arg(short = 'k', long = "entity-key", default_value = DEFAULT_ENTITY_KEY)]
        entity_key: String,
    },
    /// Delete a feature, its versions and its artifacts
    Delete { name: String },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliOptions {
    #[arg(short = 'c', long = "chdir", default_value = None)]
    /// Switch to a different feature repository directory before executing the given subcommand.
    /// Can also be set via the FEATURE_REPO_DIR environment variable.
    pub chdir: Option<String>,
    /// The logging level. Case-insensitive.
    #[arg(
        value_enum,
        long = "log-level",
        ignore_case = true,
        default_value = "info"
    )]
    pub log_level: LogLevel,
    /// Override the path of the feature_store.yaml file, relative to the repository directory.
    /// Can also be set via the FEATURE_STORE_YAML_FILE_PATH environment variable
    #[arg(short='f', long="feature-store-yaml", default_value = None)]
    pub feature_store_yaml: Option<String>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_prefer_integers() {
        assert_eq!(parse_entity_id("42"), Ok(EntityId::Int(42)));
        assert_eq!(
            parse_entity_id("user-42"),
            Ok(EntityId::String("user-42".to_string()))
        );
    }

    #[test]
    fn parses_lookup_with_defaults() -> anyhow::Result<()> {
        let options = CliOptions::try_parse_from(["feature-store", "lookup", "logins", "3"])?;
        match options.command {
            CliCommand::Lookup {
                name,
                entity_id,
                entity_key,
            } => {
                assert_eq!(name, "logins");
                assert_eq!(entity_id, EntityId::Int(3));
                assert_eq!(entity_key, DEFAULT_ENTITY_KEY);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(options.log_level, LogLevel::Info);
        Ok(())
    }

    #[test]
    fn parses_ingest_options() -> anyhow::Result<()> {
        let options = CliOptions::try_parse_from([
            "feature-store",
            "--chdir",
            "/repo",
            "ingest",
            "logins",
            "--file",
            "logins.json",
            "--commit-hash",
            "abc123",
        ])?;
        assert_eq!(options.chdir.as_deref(), Some("/repo"));
        match options.command {
            CliCommand::Ingest {
                name,
                file,
                commit_hash,
            } => {
                assert_eq!(name, "logins");
                assert_eq!(file, PathBuf::from("logins.json"));
                assert_eq!(commit_hash.as_deref(), Some("abc123"));
            }
            other => panic!("unexpected command {:?}", other),
        }
        Ok(())
    }
}
