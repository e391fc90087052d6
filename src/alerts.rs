use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::models::{Aggregate, AlertEvent, Severity};
use crate::risk::{Thresholds, Tier, TierScale};

/// Namespace for name-based alert ids.
const ALERT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_93a4_52d0_4e7b_9a83_0d5e_44c2_b1f7);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertPolicy {
    thresholds: Thresholds,
    urgent_below: Option<f64>,
    scale: TierScale,
}

impl AlertPolicy {
    /// `urgent_below` must sit inside the lowest tier, i.e. in `(0, low]`.
    pub fn new(
        thresholds: Thresholds,
        urgent_below: Option<f64>,
        scale: TierScale,
    ) -> Result<Self, ConfigError> {
        if let Some(urgent) = urgent_below {
            if !urgent.is_finite() || urgent <= 0.0 || urgent > thresholds.low() {
                return Err(ConfigError::InvalidUrgentThreshold {
                    urgent,
                    low: thresholds.low(),
                });
            }
        }
        Ok(Self {
            thresholds,
            urgent_below,
            scale,
        })
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn severity_for(&self, mean: f64) -> Severity {
        match self.urgent_below {
            Some(urgent) if mean < urgent => Severity::Urgent,
            _ => Severity::Warning,
        }
    }
}

/// A group is alerting while it has data and sits in the lowest tier.
pub fn is_alerting(aggregate: &Aggregate) -> bool {
    aggregate.has_data() && aggregate.tier.is_lowest()
}

fn prior_state(previous: Option<&Aggregate>) -> &'static str {
    match previous {
        None => "new",
        Some(agg) if !agg.has_data() => "no-data",
        Some(agg) => agg.tier.as_str(),
    }
}

/// Stable for a given transition within one UTC day, so consumers keyed by id
/// keep their read state across re-polls.
pub fn alert_id(
    domain: &str,
    group_key: &str,
    from: &str,
    to: Tier,
    produced_at: DateTime<Utc>,
) -> Uuid {
    let name = format!(
        "{domain}/{group_key}/{from}->{to}/{}",
        produced_at.date_naive()
    );
    Uuid::new_v5(&ALERT_NAMESPACE, name.as_bytes())
}

/// Edge-triggered: a group alerts only on entering the alerting state.
/// `previous = None` means this is the first observation of the domain.
pub fn derive_alerts(
    domain: &str,
    current: &[Aggregate],
    previous: Option<&[Aggregate]>,
    policy: &AlertPolicy,
    produced_at: DateTime<Utc>,
) -> Vec<AlertEvent> {
    let prior: Option<HashMap<&str, &Aggregate>> =
        previous.map(|aggs| aggs.iter().map(|a| (a.group_key.as_str(), a)).collect());

    let mut alerts: Vec<AlertEvent> = current
        .iter()
        .filter(|agg| is_alerting(agg))
        .filter_map(|agg| {
            let before = prior
                .as_ref()
                .and_then(|map| map.get(agg.group_key.as_str()).copied());
            if before.is_some_and(is_alerting) {
                return None;
            }

            let severity = policy.severity_for(agg.mean);
            Some(AlertEvent {
                id: alert_id(domain, &agg.group_key, prior_state(before), agg.tier, produced_at),
                domain: domain.to_string(),
                group_key: agg.group_key.clone(),
                severity,
                tier: agg.tier,
                mean: agg.mean,
                message: format!(
                    "{} engagement at {:.0}% - {}",
                    agg.display_name(),
                    agg.mean,
                    policy.scale.label(agg.tier).to_lowercase()
                ),
                produced_at,
            })
        })
        .collect();

    sort_alerts(&mut alerts);
    alerts
}

/// Most severe first, then lowest mean.
pub fn sort_alerts(alerts: &mut [AlertEvent]) {
    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.mean.total_cmp(&b.mean))
            .then_with(|| a.group_key.cmp(&b.group_key))
    });
}
