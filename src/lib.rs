pub mod aggregate;
pub mod alerts;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod models;
pub mod report;
pub mod risk;
pub mod scheduler;
pub mod store;

pub use aggregate::{aggregate, aggregate_declared, AggregateOrder, GroupBy};
pub use alerts::{derive_alerts, AlertPolicy};
pub use config::{DomainConfig, EngineConfig, SourceConfig};
pub use error::{ConfigError, FetchError, MalformedDataError};
pub use fetch::{FetchPayload, Fetcher, ResponseDecoder};
pub use models::{Aggregate, AlertEvent, EngagementRecord, EntityKind, Severity, Snapshot};
pub use risk::{classify, Thresholds, Tier, TierScale};
pub use scheduler::RefreshScheduler;
pub use store::SnapshotStore;
