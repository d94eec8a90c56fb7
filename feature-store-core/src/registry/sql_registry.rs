use crate::config::RegistryConfig;
use crate::error::FeatureStoreError;
use crate::model::{
    DriftStatus, Feature, FeatureDetails, FeatureSummary, FeatureVersion, Registration,
    VersionLabel, VersionSelector,
};
use crate::registry::FeatureRegistry;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::pool::PoolOptions;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Database, FromRow, Pool, Row, Sqlite};
use std::borrow::Cow;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const FEATURE_REGISTRY_MAX_CONNECTIONS_ENV_VAR: &str = "FEATURE_REGISTRY_MAX_CONNECTIONS";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const FEATURE_REGISTRY_MIN_CONNECTIONS_ENV_VAR: &str = "FEATURE_REGISTRY_MIN_CONNECTIONS";
const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS features (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        owner TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS feature_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        feature_id INTEGER NOT NULL REFERENCES features(id) ON DELETE CASCADE,
        version TEXT NOT NULL,
        path TEXT NOT NULL UNIQUE,
        computed_at TEXT NOT NULL,
        commit_hash TEXT,
        drift_status TEXT NOT NULL DEFAULT 'ok',
        UNIQUE (feature_id, version)
    )",
    "CREATE INDEX IF NOT EXISTS idx_feature_versions_feature_id ON feature_versions (feature_id)",
];

const FEATURE_COLUMNS: &str = "id, name, description, owner, created_at";
const VERSION_COLUMNS: &str =
    "id, feature_id, version, path, computed_at, commit_hash, drift_status";

fn read_pool_options<DB: Database>(
    options: PoolOptions<DB>,
    config: &RegistryConfig,
) -> Result<PoolOptions<DB>> {
    fn from_env_variable<T: FromStr + ToString>(key: &str, default: T) -> Result<T> {
        std::env::var(key)
            .or_else(|_| Ok(default.to_string()))
            .and_then(|conns| {
                conns
                    .parse::<T>()
                    .map_err(|_| anyhow!("Failed to parse {}", key))
            })
    }

    let max_connections: u32 = from_env_variable(
        FEATURE_REGISTRY_MAX_CONNECTIONS_ENV_VAR,
        config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
    )?;
    let min_connections: u32 = from_env_variable(
        FEATURE_REGISTRY_MIN_CONNECTIONS_ENV_VAR,
        config.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS),
    )?;
    Ok(options
        .max_connections(max_connections)
        .min_connections(min_connections.min(max_connections)))
}

fn is_in_memory(path: &str) -> bool {
    path.contains(":memory:") || path.contains("mode=memory")
}

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
fn is_busy(code: Option<Cow<'_, str>>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}

/// Unique violations and lock contention surface as conflicts so callers can retry.
fn classify(err: sqlx::Error) -> anyhow::Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return FeatureStoreError::conflict(db_err.message().to_string()).into();
        }
        if is_busy(db_err.code()) {
            return FeatureStoreError::conflict(format!("registry is busy: {}", db_err.message()))
                .into();
        }
    }
    err.into()
}

struct FeatureRow(Feature);

impl FromRow<'_, SqliteRow> for FeatureRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let description: Option<String> = row.try_get("description")?;
        Ok(Self(Feature {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: description.unwrap_or_default(),
            owner: row.try_get("owner")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

struct FeatureVersionRow(FeatureVersion);

impl FromRow<'_, SqliteRow> for FeatureVersionRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let version: String = row.try_get("version")?;
        let drift_status: String = row.try_get("drift_status")?;
        Ok(Self(FeatureVersion {
            id: row.try_get("id")?,
            feature_id: row.try_get("feature_id")?,
            version: version
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            path: row.try_get("path")?,
            computed_at: row.try_get("computed_at")?,
            commit_hash: row.try_get("commit_hash")?,
            drift_status: drift_status
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
        }))
    }
}

async fn version_labels(conn: &mut SqliteConnection, feature_id: i64) -> Result<Vec<VersionLabel>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT version FROM feature_versions WHERE feature_id = ?")
            .bind(feature_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(classify)?;
    rows.into_iter().map(|(label,)| label.parse()).collect()
}

async fn latest_label(conn: &mut SqliteConnection, feature_id: i64) -> Result<Option<VersionLabel>> {
    Ok(version_labels(conn, feature_id).await?.into_iter().max())
}

async fn fetch_version(
    conn: &mut SqliteConnection,
    feature_id: i64,
    version: VersionLabel,
) -> Result<Option<FeatureVersion>> {
    let query = format!(
        "SELECT {} FROM feature_versions WHERE feature_id = ? AND version = ?",
        VERSION_COLUMNS
    );
    let row: Option<FeatureVersionRow> = sqlx::query_as(&query)
        .bind(feature_id)
        .bind(version.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify)?;
    Ok(row.map(|r| r.0))
}

async fn fetch_feature(conn: &mut SqliteConnection, name: &str) -> Result<Option<Feature>> {
    let query = format!("SELECT {} FROM features WHERE name = ?", FEATURE_COLUMNS);
    let row: Option<FeatureRow> = sqlx::query_as(&query)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify)?;
    Ok(row.map(|r| r.0))
}

/// SQLite backed registry. Version rows are unique per `(feature_id, version)`
/// and are removed together with their feature.
pub struct SqlFeatureRegistry {
    connection_pool: Pool<Sqlite>,
}

impl SqlFeatureRegistry {
    /// Opens (creating if needed) the registry database and its schema.
    ///
    /// # Parameters
    /// - `config.path`: sqlx SQLite connection string, e.g. `"sqlite://data/registry.db"`
    ///   or `"sqlite::memory:"`. Pool sizes can be overridden with the
    ///   `FEATURE_REGISTRY_MAX_CONNECTIONS` and `FEATURE_REGISTRY_MIN_CONNECTIONS`
    ///   environment variables.
    /// - `cwd`: directory that relative database paths are resolved against.
    pub async fn connect(config: &RegistryConfig, cwd: Option<&str>) -> Result<Self> {
        if !config.path.starts_with("sqlite:") {
            return Err(anyhow!(
                "Unsupported registry connection string: {}, only sqlite is available",
                config.path
            ));
        }
        let mut options = SqliteConnectOptions::from_str(&config.path)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let mut pool_options: SqlitePoolOptions = read_pool_options(PoolOptions::new(), config)?;
        if is_in_memory(&config.path) {
            // each connection to an in-memory database sees its own database
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            let filename = options.get_filename().to_path_buf();
            let filename = match cwd {
                Some(prefix) if filename.is_relative() => Path::new(prefix).join(filename),
                _ => filename,
            };
            if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            debug!("Open SQLite registry at {}", filename.display());
            options = options
                .filename(filename)
                .journal_mode(SqliteJournalMode::Wal);
        }
        let connection_pool = pool_options.connect_with(options).await?;
        let registry = Self { connection_pool };
        registry.init_schema().await?;
        Ok(registry)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut tx = self.connection_pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl FeatureRegistry for SqlFeatureRegistry {
    async fn upsert_feature(
        &self,
        name: &str,
        description: &str,
        owner: &str,
    ) -> Result<Registration> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        let inserted = sqlx::query(
            "INSERT INTO features (name, description, owner, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(description)
        .bind(owner)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(classify)?
        .rows_affected();
        let created = inserted == 1;
        if !created {
            sqlx::query("UPDATE features SET description = ?, owner = ? WHERE name = ?")
                .bind(description)
                .bind(owner)
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        let feature = fetch_feature(&mut tx, name)
            .await?
            .ok_or_else(|| anyhow!("Feature '{}' vanished during registration", name))?;
        tx.commit().await.map_err(classify)?;
        Ok(Registration { feature, created })
    }

    async fn list_features(&self) -> Result<Vec<FeatureSummary>> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            "SELECT f.id, f.name, f.owner, COUNT(v.id) \
             FROM features f LEFT JOIN feature_versions v ON v.feature_id = f.id \
             GROUP BY f.id, f.name, f.owner ORDER BY f.id",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|(id, name, owner, version_count)| FeatureSummary {
                id,
                name,
                owner,
                version_count,
            })
            .collect())
    }

    async fn get_feature(&self, name: &str) -> Result<Option<FeatureDetails>> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        let Some(feature) = fetch_feature(&mut tx, name).await? else {
            return Ok(None);
        };
        let query = format!(
            "SELECT {} FROM feature_versions WHERE feature_id = ? ORDER BY id",
            VERSION_COLUMNS
        );
        let rows: Vec<FeatureVersionRow> = sqlx::query_as(&query)
            .bind(feature.id)
            .fetch_all(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(Some(FeatureDetails {
            feature,
            versions: rows.into_iter().map(|r| r.0).collect(),
        }))
    }

    async fn find_feature(&self, name: &str) -> Result<Option<Feature>> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        let feature = fetch_feature(&mut tx, name).await?;
        tx.commit().await.map_err(classify)?;
        Ok(feature)
    }

    async fn allocate_next_version(&self, feature: &Feature) -> Result<VersionLabel> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        let latest = latest_label(&mut tx, feature.id).await?;
        tx.commit().await.map_err(classify)?;
        match latest {
            Some(label) => label.next(),
            None => Ok(VersionLabel::FIRST),
        }
    }

    async fn record_version(
        &self,
        feature: &Feature,
        version: VersionLabel,
        path: &str,
        commit_hash: Option<&str>,
    ) -> Result<FeatureVersion> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        // the insert comes first so this transaction takes the write lock up front
        let inserted = sqlx::query(
            "INSERT INTO feature_versions \
             (feature_id, version, path, computed_at, commit_hash, drift_status) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(feature.id)
        .bind(version.to_string())
        .bind(path)
        .bind(Utc::now())
        .bind(commit_hash)
        .bind(DriftStatus::default().as_str())
        .fetch_one(&mut *tx)
        .await;
        let id: i64 = match inserted {
            Ok(row) => row.try_get("id")?,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(FeatureStoreError::conflict(format!(
                    "version {} of feature '{}' already exists",
                    version, feature.name
                ))
                .into());
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                return Err(FeatureStoreError::feature_not_found(feature.name.as_str()).into());
            }
            Err(err) => return Err(classify(err)),
        };

        let labels = version_labels(&mut tx, feature.id).await?;
        let contiguous = labels.len() == version.number() as usize
            && labels.iter().max() == Some(&version);
        if !contiguous {
            return Err(FeatureStoreError::conflict(format!(
                "version {} of feature '{}' does not follow the latest version",
                version, feature.name
            ))
            .into());
        }

        let query = format!("SELECT {} FROM feature_versions WHERE id = ?", VERSION_COLUMNS);
        let row: FeatureVersionRow = sqlx::query_as(&query)
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(row.0)
    }

    async fn find_version(
        &self,
        feature: &Feature,
        selector: VersionSelector,
    ) -> Result<Option<FeatureVersion>> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        let label = match selector {
            VersionSelector::Label(label) => Some(label),
            VersionSelector::Latest => latest_label(&mut tx, feature.id).await?,
        };
        let version = match label {
            Some(label) => fetch_version(&mut tx, feature.id, label).await?,
            None => None,
        };
        tx.commit().await.map_err(classify)?;
        Ok(version)
    }

    async fn delete_feature(&self, name: &str) -> Result<bool> {
        let mut tx = self.connection_pool.begin().await.map_err(classify)?;
        let deleted = sqlx::query("DELETE FROM features WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();
        tx.commit().await.map_err(classify)?;
        Ok(deleted > 0)
    }
}
