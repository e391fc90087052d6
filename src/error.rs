use std::path::PathBuf;
use std::time::Duration;

/// Invalid engine configuration. Always surfaced before any domain starts
/// polling.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid thresholds [{low}, {high}]: cut points must satisfy 0 <= low < high <= 100")]
    InvalidThresholds { low: f64, high: f64 },

    #[error("urgent sub-threshold {urgent} must lie within the lowest tier (0, {low}]")]
    InvalidUrgentThreshold { urgent: f64, low: f64 },

    #[error("domain '{domain}': fetch timeout {timeout:?} must be shorter than the poll period {period:?}")]
    TimeoutNotBelowPeriod {
        domain: String,
        timeout: Duration,
        period: Duration,
    },

    #[error("domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("domain '{0}' is configured more than once")]
    DuplicateDomain(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The collaborator answered, but not with something the engine can use.
#[derive(Debug, thiserror::Error)]
pub enum MalformedDataError {
    #[error("response is not valid JSON for this domain: {0}")]
    Json(#[from] serde_json::Error),

    #[error("response missing field '{0}'")]
    MissingField(&'static str),

    #[error("CSV input rejected: {0}")]
    Csv(String),

    #[error("row rejected: {0}")]
    Row(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream reported failure: {0}")]
    Rejected(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Malformed(#[from] MalformedDataError),

    #[error("fetch task failed: {0}")]
    Task(String),
}

impl FetchError {
    /// Short tag recorded alongside the error in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http(_) | FetchError::Status { .. } => "network",
            FetchError::Rejected(_) => "rejected",
            FetchError::Timeout(_) => "timeout",
            FetchError::Database(_) => "database",
            FetchError::Io(_) => "io",
            FetchError::Malformed(_) => "malformed",
            FetchError::Task(_) => "task",
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, FetchError::Malformed(_))
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(err: tokio::task::JoinError) -> Self {
        FetchError::Task(err.to_string())
    }
}

impl From<csv::Error> for FetchError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            if let csv::ErrorKind::Io(io) = err.into_kind() {
                return FetchError::Io(io);
            }
            return FetchError::Task("CSV reader I/O failure".to_string());
        }
        FetchError::Malformed(MalformedDataError::Csv(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_errors_are_tagged_distinctly() {
        let err = FetchError::from(MalformedDataError::MissingField("data"));
        assert!(err.is_malformed());
        assert_eq!(err.kind(), "malformed");
        assert!(err.to_string().contains("'data'"));

        let timeout = FetchError::Timeout(Duration::from_millis(2500));
        assert!(!timeout.is_malformed());
        assert_eq!(timeout.kind(), "timeout");
    }

    #[test]
    fn config_errors_name_the_domain() {
        let err = ConfigError::TimeoutNotBelowPeriod {
            domain: "live-sessions".to_string(),
            timeout: Duration::from_secs(5),
            period: Duration::from_secs(3),
        };
        assert!(err.to_string().contains("live-sessions"));
    }
}
