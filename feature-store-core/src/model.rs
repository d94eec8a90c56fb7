use crate::error::FeatureStoreError;
use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;

pub const DEFAULT_ENTITY_KEY: &str = "user_id";
pub const DEFAULT_OWNER: &str = "system";
/// Path segments that cannot name a feature directory, plus `online`, which
/// is taken by the `/features/online` lookup route.
pub const RESERVED_FEATURE_NAMES: [&str; 3] = [".", "..", "online"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub feature: Feature,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub version_count: i64,
}

/// A feature together with all of its versions, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureDetails {
    #[serde(flatten)]
    pub feature: Feature,
    pub versions: Vec<FeatureVersion>,
}

impl FeatureDetails {
    pub fn latest_version(&self) -> Option<&FeatureVersion> {
        self.versions.iter().max_by_key(|v| v.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVersion {
    pub id: i64,
    pub feature_id: i64,
    pub version: VersionLabel,
    pub path: String,
    pub computed_at: DateTime<Utc>,
    pub commit_hash: Option<String>,
    pub drift_status: DriftStatus,
}

/// Version label of the form `v{n}`, `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionLabel(u32);

impl VersionLabel {
    pub const FIRST: VersionLabel = VersionLabel(1);

    pub fn new(number: u32) -> Result<Self> {
        if number == 0 {
            return Err(FeatureStoreError::invalid_input("version numbers start at 1").into());
        }
        Ok(Self(number))
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Result<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| Error::from(FeatureStoreError::conflict("version counter overflow")))
    }
}

impl fmt::Display for VersionLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VersionLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix('v').ok_or_else(|| {
            FeatureStoreError::invalid_input(format!("version label '{}' must start with 'v'", s))
        })?;
        let canonical = digits.starts_with(|c: char| matches!(c, '1'..='9'))
            && digits.chars().all(|c| c.is_ascii_digit());
        let number = digits
            .parse::<u32>()
            .ok()
            .filter(|_| canonical)
            .ok_or_else(|| {
                FeatureStoreError::invalid_input(format!("version label '{}' is not v<number>", s))
            })?;
        Self::new(number)
    }
}

impl Serialize for VersionLabel {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionLabel {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Label(VersionLabel),
}

impl VersionSelector {
    /// `None` and `"latest"` select the latest version.
    pub fn parse(version: Option<&str>) -> Result<Self> {
        match version {
            None => Ok(Self::Latest),
            Some(v) if v.eq_ignore_ascii_case("latest") => Ok(Self::Latest),
            Some(v) => v.parse().map(Self::Label),
        }
    }

    pub fn label(&self) -> Option<VersionLabel> {
        match self {
            Self::Latest => None,
            Self::Label(label) => Some(*label),
        }
    }
}

/// Reserved for a drift detection pass; every version is written as `Ok`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    #[default]
    Ok,
    Warning,
    Drift,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftStatus::Ok => "ok",
            DriftStatus::Warning => "warning",
            DriftStatus::Drift => "drift",
        }
    }
}

impl FromStr for DriftStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(DriftStatus::Ok),
            "warning" => Ok(DriftStatus::Warning),
            "drift" => Ok(DriftStatus::Drift),
            other => Err(FeatureStoreError::invalid_input(format!(
                "unknown drift status '{}'",
                other
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    String(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{}", i),
            EntityId::String(s) => f.write_str(s),
        }
    }
}

/// Feature names become directory names under the artifact root.
pub fn validate_feature_name(name: &str) -> Result<()> {
    if name.is_empty() || RESERVED_FEATURE_NAMES.contains(&name) {
        return Err(FeatureStoreError::invalid_input(format!(
            "'{}' is not a valid feature name",
            name
        ))
        .into());
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(FeatureStoreError::invalid_input(format!(
            "feature name '{}' contains unsupported character '{}'",
            name, bad
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_store_error;

    #[test]
    fn version_label_parsing() -> Result<()> {
        let label: VersionLabel = "v12".parse()?;
        assert_eq!(label.number(), 12);
        assert_eq!(label.to_string(), "v12");
        assert_eq!(label.next()?.to_string(), "v13");
        assert!("12".parse::<VersionLabel>().is_err());
        assert!("v0".parse::<VersionLabel>().is_err());
        assert!("vx".parse::<VersionLabel>().is_err());
        assert!("v01".parse::<VersionLabel>().is_err());
        assert!("v+1".parse::<VersionLabel>().is_err());
        assert!("v".parse::<VersionLabel>().is_err());
        Ok(())
    }

    #[test]
    fn version_labels_order_numerically() -> Result<()> {
        let v9: VersionLabel = "v9".parse()?;
        let v10: VersionLabel = "v10".parse()?;
        assert!(v10 > v9);
        Ok(())
    }

    #[test]
    fn version_selector_parse() -> Result<()> {
        assert_eq!(VersionSelector::parse(None)?, VersionSelector::Latest);
        assert_eq!(
            VersionSelector::parse(Some("latest"))?,
            VersionSelector::Latest
        );
        assert_eq!(
            VersionSelector::parse(Some("v2"))?,
            VersionSelector::Label(VersionLabel::new(2)?)
        );
        let err = VersionSelector::parse(Some("two")).unwrap_err();
        assert!(find_store_error(&err).is_some_and(|e| e.is_invalid_input()));
        Ok(())
    }

    #[test]
    fn entity_id_is_untagged() -> Result<()> {
        let int: EntityId = serde_json::from_str("3")?;
        let string: EntityId = serde_json::from_str("\"abc\"")?;
        assert_eq!(int, EntityId::Int(3));
        assert_eq!(string, EntityId::String("abc".to_string()));
        assert!(serde_json::from_str::<EntityId>("1.5").is_err());
        Ok(())
    }

    #[test]
    fn feature_name_validation() {
        assert!(validate_feature_name("user_login_counts").is_ok());
        assert!(validate_feature_name("logins-v2.daily").is_ok());
        assert!(validate_feature_name("").is_err());
        assert!(validate_feature_name("..").is_err());
        assert!(validate_feature_name("a/b").is_err());
        assert!(validate_feature_name("with space").is_err());
        assert!(validate_feature_name("online").is_err());
    }

    #[test]
    fn drift_status_round_trips_through_str() -> Result<()> {
        for status in [DriftStatus::Ok, DriftStatus::Warning, DriftStatus::Drift] {
            assert_eq!(status.as_str().parse::<DriftStatus>()?, status);
        }
        Ok(())
    }
}
