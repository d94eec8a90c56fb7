use crate::cli_options::{CliCommand, CliOptions};
use anyhow::{Result, anyhow};
use clap::Parser;
use feature_store_core::artifact_store::get_artifact_store;
use feature_store_core::config::StoreConfig;
use feature_store_core::dataset::{Dataset, DatasetPayload};
use feature_store_core::feature_store::FeatureStore;
use feature_store_core::observer::get_observers;
use feature_store_core::registry::get_registry;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_options;

const FEATURE_REPO_DIR_ENV_VAR_NAME: &str = "FEATURE_REPO_DIR";
const FEATURE_STORE_YAML_FILE_PATH_ENV_VAR: &str = "FEATURE_STORE_YAML_FILE_PATH";
const DEFAULT_FEATURE_STORE_FILE_NAME: &str = "feature_store.yaml";
const ENTITY_NOT_FOUND: &str = "Entity not found in latest version";

async fn build_feature_store(config: &StoreConfig, cwd: &str) -> Result<FeatureStore> {
    let registry = get_registry(&config.registry, Some(cwd)).await?;
    let artifacts = get_artifact_store(&config.artifact_store, Some(cwd))?;
    let observers = get_observers(config.experiment_tracking.as_ref());
    Ok(FeatureStore::new(registry, artifacts).with_observers(observers))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(
    feature_store: FeatureStore,
    server_config: rest_server::server::ServerConfig,
    metrics_enabled: bool,
) -> Result<()> {
    let handler = axum_server::Handle::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = rest_server::server::start_server(server_config, feature_store, metrics_enabled, handler.clone()) => {
            res?
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down...");
            handler.graceful_shutdown(Some(Duration::from_secs(5)));
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
            handler.graceful_shutdown(Some(Duration::from_secs(5)));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_opts = CliOptions::parse();
    let CliOptions {
        chdir,
        log_level,
        feature_store_yaml,
        command,
    } = cli_opts;

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::from(log_level).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cwd =
        if let Some(path) = chdir.or_else(|| std::env::var(FEATURE_REPO_DIR_ENV_VAR_NAME).ok()) {
            PathBuf::from(path)
        } else {
            std::env::current_dir()?
        };
    let cwd_str = cwd
        .to_str()
        .ok_or_else(|| anyhow!("Feature repository path contains invalid UTF-8"))?;

    let feature_store_yaml = feature_store_yaml
        .or(std::env::var(FEATURE_STORE_YAML_FILE_PATH_ENV_VAR).ok())
        .unwrap_or(DEFAULT_FEATURE_STORE_FILE_NAME.to_string());
    let config_path = cwd.join(&feature_store_yaml);
    let yaml_str = fs::read_to_string(&config_path)
        .map_err(|e| anyhow!("Failed to read {}: {}", config_path.display(), e))?;
    let store_config = StoreConfig::from_yaml_str(&yaml_str)?;
    tracing::debug!("Loaded project {}", store_config.project);
    let feature_store = build_feature_store(&store_config, cwd_str).await?;

    match command {
        CliCommand::Serve {
            host,
            port,
            key,
            cert,
            metrics_enabled,
        } => {
            if key.is_some() && cert.is_none() || key.is_none() && cert.is_some() {
                return Err(anyhow!(
                    "Both --key and --cert must be provided to enable TLS"
                ));
            }
            tracing::info!("Start serving {} on {}:{}", store_config.project, host, port);
            let tls_enabled = key.is_some() && cert.is_some();
            let server_config = rest_server::server::ServerConfig {
                host,
                port,
                tls_enabled,
                tls_cert_path: cert,
                tls_key_path: key,
            };
            serve(feature_store, server_config, metrics_enabled).await?;
        }
        CliCommand::Register {
            name,
            description,
            owner,
        } => {
            let registration = feature_store
                .register_feature(&name, &description, &owner)
                .await?;
            print_json(&registration.feature)?;
        }
        CliCommand::List => {
            print_json(&feature_store.list_features().await?)?;
        }
        CliCommand::Show { name } => {
            print_json(&feature_store.get_feature(&name).await?)?;
        }
        CliCommand::Ingest {
            name,
            file,
            commit_hash,
        } => {
            let payload = fs::read_to_string(&file)
                .map_err(|e| anyhow!("Failed to read {}: {}", file.display(), e))?;
            let dataset = Dataset::try_from(DatasetPayload::from_json_str(&payload)?)?;
            let version = feature_store
                .ingest_feature_data(&name, &dataset, commit_hash.as_deref())
                .await?;
            print_json(&version)?;
        }
        CliCommand::Stats { name, version } => {
            print_json(&feature_store.get_feature_stats(&name, &version).await?)?;
        }
        CliCommand::Lookup {
            name,
            entity_id,
            entity_key,
        } => {
            let data = feature_store
                .get_online_value(&name, &entity_id, &entity_key)
                .await?;
            let error = data.is_none().then_some(ENTITY_NOT_FOUND);
            print_json(&json!({
                "feature_name": name,
                "entity_id": entity_id,
                "data": data,
                "error": error,
            }))?;
        }
        CliCommand::Delete { name } => {
            feature_store.delete_feature(&name).await?;
            tracing::info!("Deleted feature {}", name);
        }
    }
    Ok(())
}
