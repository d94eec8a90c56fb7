use crate::config::ExperimentTrackingConfig;
use crate::observer::{FeatureStoreObserver, IngestionEvent};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Logs one MLflow run per completed ingestion through the tracking server's
/// REST API.
pub struct MlflowObserver {
    client: Client,
    base_url: Url,
    experiment_name: String,
    experiment_id: OnceCell<String>,
}

impl MlflowObserver {
    pub fn new(config: &ExperimentTrackingConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.tracking_uri)
            .map_err(|e| anyhow!("Invalid MLflow tracking uri {}: {}", config.tracking_uri, e))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url,
            experiment_name: config.experiment_name.clone(),
            experiment_id: OnceCell::new(),
        })
    }

    fn endpoint(&self, method: &str) -> Result<Url> {
        Ok(self.base_url.join(&format!("api/2.0/mlflow/{}", method))?)
    }

    async fn post(&self, method: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(self.endpoint(method)?)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("MLflow {} failed with {}: {}", method, status, text));
        }
        Ok(response.json().await?)
    }

    async fn experiment_id(&self) -> Result<&str> {
        self.experiment_id
            .get_or_try_init(|| self.resolve_experiment())
            .await
            .map(String::as_str)
    }

    async fn resolve_experiment(&self) -> Result<String> {
        let response = self
            .client
            .get(self.endpoint("experiments/get-by-name")?)
            .query(&[("experiment_name", self.experiment_name.as_str())])
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {
                let body: Value = response.json().await?;
                experiment_id_of(&body["experiment"])
            }
            StatusCode::NOT_FOUND => {
                info!("Create MLflow experiment {}", self.experiment_name);
                let body = self
                    .post("experiments/create", &json!({ "name": self.experiment_name }))
                    .await?;
                experiment_id_of(&body)
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(anyhow!(
                    "MLflow experiment lookup failed with {}: {}",
                    status,
                    text
                ))
            }
        }
    }
}

fn experiment_id_of(value: &Value) -> Result<String> {
    value["experiment_id"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("MLflow response has no experiment_id"))
}

fn run_name(event: &IngestionEvent<'_>) -> String {
    format!("{}_{}", event.feature.name, event.version.version)
}

fn run_params(event: &IngestionEvent<'_>) -> Vec<Value> {
    let mut params = vec![
        json!({ "key": "feature_name", "value": event.feature.name }),
        json!({ "key": "version", "value": event.version.version.to_string() }),
        json!({ "key": "path", "value": event.version.path }),
        json!({ "key": "owner", "value": event.feature.owner }),
    ];
    if let Some(commit_hash) = &event.version.commit_hash {
        params.push(json!({ "key": "commit_hash", "value": commit_hash }));
    }
    params
}

fn run_metrics(event: &IngestionEvent<'_>, timestamp: i64) -> Vec<Value> {
    event
        .profile
        .numeric_metrics()
        .into_iter()
        .map(|(column, stat, value)| {
            json!({
                "key": format!("{}_{}", column, stat),
                "value": value,
                "timestamp": timestamp,
                "step": 0,
            })
        })
        .collect()
}

#[async_trait]
impl FeatureStoreObserver for MlflowObserver {
    async fn ingestion_completed(&self, event: IngestionEvent<'_>) -> Result<()> {
        let experiment_id = self.experiment_id().await?;
        let started = Utc::now().timestamp_millis();
        let run = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name(&event),
                    "start_time": started,
                }),
            )
            .await?;
        let run_id = run["run"]["info"]["run_id"]
            .as_str()
            .ok_or_else(|| anyhow!("MLflow response has no run_id"))?
            .to_owned();
        self.post(
            "runs/log-batch",
            &json!({
                "run_id": run_id,
                "params": run_params(&event),
                "metrics": run_metrics(&event, started),
            }),
        )
        .await?;
        self.post(
            "runs/update",
            &json!({
                "run_id": run_id,
                "status": "FINISHED",
                "end_time": Utc::now().timestamp_millis(),
            }),
        )
        .await?;
        debug!("Logged MLflow run {} for {}", run_id, run_name(&event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, ColumnValues, Dataset};
    use crate::model::{DriftStatus, Feature, FeatureVersion, VersionLabel};
    use crate::profiler::calculate_statistics;

    fn feature() -> Feature {
        Feature {
            id: 1,
            name: "logins".to_string(),
            description: String::new(),
            owner: "data-team".to_string(),
            created_at: Utc::now(),
        }
    }

    fn version(commit_hash: Option<&str>) -> Result<FeatureVersion> {
        Ok(FeatureVersion {
            id: 4,
            feature_id: 1,
            version: VersionLabel::new(2)?,
            path: "/data/logins/v2.parquet".to_string(),
            computed_at: Utc::now(),
            commit_hash: commit_hash.map(str::to_owned),
            drift_status: DriftStatus::Ok,
        })
    }

    #[test]
    fn endpoints_keep_tracking_uri_prefix() -> Result<()> {
        let observer = MlflowObserver::new(&ExperimentTrackingConfig {
            tracking_uri: "http://mlflow.internal:5000/tracking".to_string(),
            experiment_name: "features".to_string(),
        })?;
        assert_eq!(
            observer.endpoint("runs/create")?.as_str(),
            "http://mlflow.internal:5000/tracking/api/2.0/mlflow/runs/create"
        );
        Ok(())
    }

    #[test]
    fn params_and_metrics_follow_run_naming() -> Result<()> {
        let dataset = Dataset::try_new(vec![
            Column::new("user_id", ColumnValues::Int64(vec![Some(1), Some(2)])),
            Column::new("count", ColumnValues::Int64(vec![Some(5), Some(0)])),
            Column::new(
                "country",
                ColumnValues::String(vec![Some("DE".to_string()), None]),
            ),
        ])?;
        let profile = calculate_statistics(&dataset);
        let feature = feature();
        let version = version(Some("abc123"))?;
        let event = IngestionEvent {
            feature: &feature,
            version: &version,
            profile: &profile,
        };
        assert_eq!(run_name(&event), "logins_v2");

        let params = run_params(&event);
        let keys: Vec<&str> = params.iter().filter_map(|p| p["key"].as_str()).collect();
        assert_eq!(
            keys,
            vec!["feature_name", "version", "path", "owner", "commit_hash"]
        );

        let metrics = run_metrics(&event, 1_700_000_000_000);
        let find = |key: &str| {
            metrics
                .iter()
                .find(|m| m["key"] == key)
                .and_then(|m| m["value"].as_f64())
        };
        assert_eq!(find("count_mean"), Some(2.5));
        assert_eq!(find("country_null_count"), Some(1.0));
        assert_eq!(find("country_mean"), None);
        Ok(())
    }

    #[test]
    fn commit_hash_param_is_skipped_when_absent() -> Result<()> {
        let profile = calculate_statistics(&Dataset::try_new(vec![Column::new(
            "user_id",
            ColumnValues::Int64(vec![]),
        )])?);
        let feature = feature();
        let version = version(None)?;
        let event = IngestionEvent {
            feature: &feature,
            version: &version,
            profile: &profile,
        };
        assert!(run_params(&event).iter().all(|p| p["key"] != "commit_hash"));
        Ok(())
    }
}
