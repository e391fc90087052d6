//! Engine configuration.
//!
//! Every monitored domain is described by an explicit [`DomainConfig`]. The
//! CLI builds them from a TOML file of `[[domain]]` tables:
//!
//! ```toml
//! [[domain]]
//! name = "live-sessions"
//! period_ms = 3000
//! timeout_ms = 2500
//! thresholds = [55.0, 80.0]
//! scale = "live_status"
//!
//! [domain.source]
//! type = "http"
//! url = "http://localhost:5000/api/session/live"
//! decoder = "live_sessions"
//! ```
//!
//! Environment variables read by the binary:
//! - `RUST_LOG`: log filter (default: "info,engagement_monitor=debug")
//! - `DATABASE_URL`: required when any domain uses a `postgres` source
//! - `ENGAGEMENT_API_TOKEN`: default bearer token for `http` sources

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::aggregate::GroupBy;
use crate::alerts::AlertPolicy;
use crate::error::ConfigError;
use crate::fetch::ResponseDecoder;
use crate::risk::{Thresholds, TierScale};

#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub name: String,
    /// `None` fetches once and never repeats.
    pub period: Option<Duration>,
    pub fetch_timeout: Duration,
    pub thresholds: Thresholds,
    pub urgent_below: Option<f64>,
    pub group_by: GroupBy,
    pub declared_groups: Vec<String>,
    /// Records older than this, relative to the fetch time, are ignored.
    pub window: Option<Duration>,
    pub scale: TierScale,
}

impl DomainConfig {
    pub fn new(name: impl Into<String>, thresholds: Thresholds, fetch_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            period: None,
            fetch_timeout,
            thresholds,
            urgent_below: None,
            group_by: GroupBy::default(),
            declared_groups: Vec::new(),
            window: None,
            scale: TierScale::default(),
        }
    }

    pub fn every(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn urgent_below(mut self, urgent: f64) -> Self {
        self.urgent_below = Some(urgent);
        self
    }

    pub fn group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn declare_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn scale(mut self, scale: TierScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn alert_policy(&self) -> Result<AlertPolicy, ConfigError> {
        AlertPolicy::new(self.thresholds, self.urgent_below, self.scale)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidDomain {
            domain: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("domain name must not be empty"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(invalid("fetch timeout must be positive"));
        }
        if let Some(period) = self.period {
            if period.is_zero() {
                return Err(invalid("poll period must be positive"));
            }
            if self.fetch_timeout >= period {
                return Err(ConfigError::TimeoutNotBelowPeriod {
                    domain: self.name.clone(),
                    timeout: self.fetch_timeout,
                    period,
                });
            }
        }
        // Cut points are checked by `Thresholds` itself; re-check in case the
        // value was assembled without going through its constructor.
        Thresholds::new(self.thresholds.low(), self.thresholds.high())?;
        self.alert_policy()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Http {
        url: String,
        decoder: ResponseDecoder,
        /// Name of the env var holding the bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
    Postgres {
        lookback_secs: u64,
        #[serde(default)]
        classroom: Option<String>,
    },
    Csv {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainSection {
    pub name: String,
    #[serde(default)]
    pub period_ms: Option<u64>,
    pub timeout_ms: u64,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub urgent_below: Option<f64>,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default)]
    pub declared_groups: Vec<String>,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub scale: TierScale,
    pub source: SourceConfig,
}

impl DomainSection {
    pub fn domain_config(&self) -> DomainConfig {
        DomainConfig {
            name: self.name.clone(),
            period: self.period_ms.map(Duration::from_millis),
            fetch_timeout: Duration::from_millis(self.timeout_ms),
            thresholds: self.thresholds,
            urgent_below: self.urgent_below,
            group_by: self.group_by.clone(),
            declared_groups: self.declared_groups.clone(),
            window: self.window_secs.map(Duration::from_secs),
            scale: self.scale,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(rename = "domain", default)]
    pub domains: Vec<DomainSection>,
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for section in &self.domains {
            if !seen.insert(section.name.as_str()) {
                return Err(ConfigError::DuplicateDomain(section.name.clone()));
            }
            section.domain_config().validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[domain]]
name = "dashboard"
timeout_ms = 5000
thresholds = [60.0, 80.0]
urgent_below = 50.0

[domain.source]
type = "http"
url = "http://localhost:5000/api/analytics/dashboard/admin"
decoder = "dashboard_totals"

[[domain]]
name = "live-sessions"
period_ms = 3000
timeout_ms = 2500
thresholds = [55.0, 80.0]
scale = "live_status"
window_secs = 120

[domain.source]
type = "csv"
path = "records.csv"
"#;

    #[test]
    fn parses_domains_and_sources() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.domains.len(), 2);

        let dashboard = config.domains[0].domain_config();
        assert_eq!(dashboard.period, None);
        assert_eq!(dashboard.urgent_below, Some(50.0));
        assert!(matches!(
            config.domains[0].source,
            SourceConfig::Http {
                decoder: ResponseDecoder::DashboardTotals,
                ..
            }
        ));

        let live = config.domains[1].domain_config();
        assert_eq!(live.period, Some(Duration::from_millis(3000)));
        assert_eq!(live.scale, TierScale::LiveStatus);
        assert_eq!(live.window, Some(Duration::from_secs(120)));
        assert_eq!(live.thresholds.low(), 55.0);
    }

    #[test]
    fn inverted_thresholds_fail_at_load() {
        let raw = SAMPLE.replace("[55.0, 80.0]", "[80.0, 55.0]");
        assert!(matches!(
            EngineConfig::from_toml_str(&raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn timeout_must_be_shorter_than_period() {
        let raw = SAMPLE.replace("timeout_ms = 2500", "timeout_ms = 3000");
        assert!(matches!(
            EngineConfig::from_toml_str(&raw),
            Err(ConfigError::TimeoutNotBelowPeriod { .. })
        ));
    }

    #[test]
    fn duplicate_domains_are_rejected() {
        let raw = SAMPLE.replace("name = \"live-sessions\"", "name = \"dashboard\"");
        assert!(matches!(
            EngineConfig::from_toml_str(&raw),
            Err(ConfigError::DuplicateDomain(name)) if name == "dashboard"
        ));
    }

    #[test]
    fn urgent_threshold_outside_lowest_tier_is_rejected() {
        let config = DomainConfig::new(
            "d",
            Thresholds::new(60.0, 80.0).unwrap(),
            Duration::from_secs(1),
        )
        .urgent_below(70.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrgentThreshold { .. })
        ));
    }

    #[test]
    fn example_config_is_valid() {
        let config = EngineConfig::from_toml_str(include_str!("../engine.example.toml")).unwrap();
        let names: Vec<_> = config.domains.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["dashboard", "live-sessions", "ai-health", "teacher-classes"]);
        assert!(matches!(
            config.domains[3].group_by,
            GroupBy::Classroom
        ));
    }

    #[test]
    fn reads_config_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(EngineConfig::from_path(&path).unwrap().domains.len(), 2);
        assert!(matches!(
            EngineConfig::from_path(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
