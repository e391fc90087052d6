use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::risk::{clamp_score, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Student,
    Class,
    Session,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Student => "student",
            EntityKind::Class => "class",
            EntityKind::Session => "session",
        }
    }
}

/// One engagement measurement as handed over by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementRecord {
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub classroom_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl EngagementRecord {
    pub fn new(
        entity_id: impl Into<String>,
        entity_kind: EntityKind,
        score: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_kind,
            score: clamp_score(score),
            timestamp,
            classroom_id: None,
            session_id: None,
        }
    }

    pub fn in_classroom(mut self, classroom_id: impl Into<String>) -> Self {
        self.classroom_id = Some(classroom_id.into());
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A group the upstream has already averaged (dashboard classrooms, live
/// sessions, service health).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTotal {
    pub group_key: String,
    pub label: Option<String>,
    pub count: usize,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub group_key: String,
    pub label: Option<String>,
    pub count: usize,
    pub mean: f64,
    pub tier_counts: BTreeMap<Tier, usize>,
    pub tier: Tier,
}

impl Aggregate {
    pub fn has_data(&self) -> bool {
        self.count > 0
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.group_key)
    }
}

pub fn empty_tier_counts() -> BTreeMap<Tier, usize> {
    Tier::ALL.iter().map(|tier| (*tier, 0)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Urgent,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub domain: String,
    pub group_key: String,
    pub severity: Severity,
    pub tier: Tier,
    pub mean: f64,
    pub message: String,
    pub produced_at: DateTime<Utc>,
}

/// Latest published result for one domain. `fetched_at` is the time of the
/// last successful fetch and stays put while the domain is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub domain: String,
    pub seq: u64,
    pub aggregates: Vec<Aggregate>,
    pub alerts: Vec<AlertEvent>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub last_error: Option<String>,
}

impl Snapshot {
    pub fn empty(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            seq: 0,
            aggregates: Vec::new(),
            alerts: Vec::new(),
            fetched_at: None,
            stale: true,
            last_error: None,
        }
    }

    pub fn aggregate(&self, group_key: &str) -> Option<&Aggregate> {
        self.aggregates.iter().find(|a| a.group_key == group_key)
    }

    /// Aggregates from the last successful refresh, `None` before the first.
    pub fn last_good(&self) -> Option<&[Aggregate]> {
        self.fetched_at.map(|_| self.aggregates.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub bucket_start: DateTime<Utc>,
    pub count: usize,
    pub mean: f64,
}
