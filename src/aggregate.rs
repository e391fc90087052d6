use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::models::{empty_tier_counts, Aggregate, EngagementRecord, GroupTotal, TimelinePoint};
use crate::risk::{clamp_score, Thresholds, Tier};

pub const PLATFORM_GROUP: &str = "platform";
pub const UNASSIGNED_GROUP: &str = "unassigned";

type KeyFn = Arc<dyn Fn(&EngagementRecord) -> String + Send + Sync>;

/// How records are folded into groups: per student, per class, per session,
/// or everything into one platform-wide figure.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    Entity,
    Classroom,
    Session,
    Kind,
    Platform,
    #[serde(skip)]
    Custom(KeyFn),
}

impl GroupBy {
    pub fn custom<F>(key: F) -> Self
    where
        F: Fn(&EngagementRecord) -> String + Send + Sync + 'static,
    {
        GroupBy::Custom(Arc::new(key))
    }

    pub fn key(&self, record: &EngagementRecord) -> String {
        match self {
            GroupBy::Entity => record.entity_id.clone(),
            GroupBy::Classroom => record
                .classroom_id
                .clone()
                .unwrap_or_else(|| UNASSIGNED_GROUP.to_string()),
            GroupBy::Session => record
                .session_id
                .clone()
                .unwrap_or_else(|| UNASSIGNED_GROUP.to_string()),
            GroupBy::Kind => record.entity_kind.as_str().to_string(),
            GroupBy::Platform => PLATFORM_GROUP.to_string(),
            GroupBy::Custom(key) => key(record),
        }
    }
}

impl fmt::Debug for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::Entity => f.write_str("Entity"),
            GroupBy::Classroom => f.write_str("Classroom"),
            GroupBy::Session => f.write_str("Session"),
            GroupBy::Kind => f.write_str("Kind"),
            GroupBy::Platform => f.write_str("Platform"),
            GroupBy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOrder {
    ByKey,
    MeanDescending,
    MeanAscending,
}

#[derive(Default)]
struct Accumulator {
    sum: f64,
    count: usize,
    tier_counts: BTreeMap<Tier, usize>,
}

/// Groups records and summarises each group. The result is unordered; use
/// [`sort_aggregates`] when a presentation order matters.
pub fn aggregate<F>(records: &[EngagementRecord], group_by: F, thresholds: &Thresholds) -> Vec<Aggregate>
where
    F: Fn(&EngagementRecord) -> String,
{
    let mut groups: HashMap<String, Accumulator> = HashMap::new();

    for record in records {
        let score = clamp_score(record.score);
        let entry = groups.entry(group_by(record)).or_insert_with(|| Accumulator {
            tier_counts: empty_tier_counts(),
            ..Accumulator::default()
        });
        entry.sum += score;
        entry.count += 1;
        *entry.tier_counts.entry(thresholds.classify(score)).or_insert(0) += 1;
    }

    groups
        .into_iter()
        .map(|(group_key, acc)| {
            let mean = acc.sum / acc.count as f64;
            Aggregate {
                group_key,
                label: None,
                count: acc.count,
                mean,
                tier_counts: acc.tier_counts,
                tier: thresholds.classify(mean),
            }
        })
        .collect()
}

/// Like [`aggregate`], but every declared group is present in the output.
/// Declared groups without records report `count = 0, mean = 0`.
pub fn aggregate_declared<F>(
    records: &[EngagementRecord],
    group_by: F,
    declared: &[String],
    thresholds: &Thresholds,
) -> Vec<Aggregate>
where
    F: Fn(&EngagementRecord) -> String,
{
    let mut aggregates = aggregate(records, group_by, thresholds);
    fill_declared(&mut aggregates, declared, thresholds);
    aggregates
}

pub fn fill_declared(aggregates: &mut Vec<Aggregate>, declared: &[String], thresholds: &Thresholds) {
    for key in declared {
        if !aggregates.iter().any(|a| &a.group_key == key) {
            aggregates.push(empty_aggregate(key.clone(), thresholds));
        }
    }
}

pub fn empty_aggregate(group_key: String, thresholds: &Thresholds) -> Aggregate {
    Aggregate {
        group_key,
        label: None,
        count: 0,
        mean: 0.0,
        tier_counts: empty_tier_counts(),
        tier: thresholds.classify(0.0),
    }
}

/// Pre-averaged groups carry no per-member scores, so all members are
/// counted under the tier of the group mean.
pub fn from_totals(totals: &[GroupTotal], thresholds: &Thresholds) -> Vec<Aggregate> {
    totals
        .iter()
        .map(|total| {
            let mean = if total.count == 0 { 0.0 } else { clamp_score(total.mean) };
            let tier = thresholds.classify(mean);
            let mut tier_counts = empty_tier_counts();
            tier_counts.insert(tier, total.count);
            Aggregate {
                group_key: total.group_key.clone(),
                label: total.label.clone(),
                count: total.count,
                mean,
                tier_counts,
                tier,
            }
        })
        .collect()
}

pub fn sort_aggregates(aggregates: &mut [Aggregate], order: AggregateOrder) {
    match order {
        AggregateOrder::ByKey => aggregates.sort_by(|a, b| a.group_key.cmp(&b.group_key)),
        AggregateOrder::MeanDescending => aggregates.sort_by(|a, b| {
            b.mean
                .total_cmp(&a.mean)
                .then_with(|| a.group_key.cmp(&b.group_key))
        }),
        AggregateOrder::MeanAscending => aggregates.sort_by(|a, b| {
            a.mean
                .total_cmp(&b.mean)
                .then_with(|| a.group_key.cmp(&b.group_key))
        }),
    }
}

/// Number of groups in each tier.
pub fn tier_distribution(aggregates: &[Aggregate]) -> BTreeMap<Tier, usize> {
    let mut counts = empty_tier_counts();
    for aggregate in aggregates {
        *counts.entry(aggregate.tier).or_insert(0) += 1;
    }
    counts
}

pub fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now - window
}

pub fn retain_recent(records: Vec<EngagementRecord>, since: DateTime<Utc>) -> Vec<EngagementRecord> {
    records.into_iter().filter(|r| r.timestamp >= since).collect()
}

/// Mean score per fixed-width time bucket, oldest bucket first.
pub fn timeline(records: &[EngagementRecord], bucket: Duration) -> Vec<TimelinePoint> {
    let width = bucket.num_milliseconds();
    if width <= 0 {
        return Vec::new();
    }

    let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for record in records {
        let index = record.timestamp.timestamp_millis().div_euclid(width);
        let entry = buckets.entry(index).or_insert((0.0, 0));
        entry.0 += clamp_score(record.score);
        entry.1 += 1;
    }

    buckets
        .into_iter()
        .filter_map(|(index, (sum, count))| {
            DateTime::from_timestamp_millis(index * width).map(|bucket_start| TimelinePoint {
                bucket_start,
                count,
                mean: sum / count as f64,
            })
        })
        .collect()
}
