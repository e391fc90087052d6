use std::fmt::Write;

use crate::aggregate::{sort_aggregates, tier_distribution, AggregateOrder};
use crate::models::{Aggregate, AlertEvent, TimelinePoint};
use crate::risk::{Tier, TierScale};

pub fn build_report(
    title: &str,
    scale: TierScale,
    aggregates: &[Aggregate],
    alerts: &[AlertEvent],
    timeline: &[TimelinePoint],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Engagement Report: {title}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Tier Mix");

    if aggregates.is_empty() {
        let _ = writeln!(output, "No engagement records for this window.");
    } else {
        let distribution = tier_distribution(aggregates);
        for tier in Tier::ALL.iter().rev() {
            let _ = writeln!(
                output,
                "- {}: {} groups",
                scale.label(*tier),
                distribution.get(tier).copied().unwrap_or(0)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Lowest Engagement First");

    if aggregates.is_empty() {
        let _ = writeln!(output, "No groups to rank.");
    } else {
        let mut ranked = aggregates.to_vec();
        sort_aggregates(&mut ranked, AggregateOrder::MeanAscending);
        let _ = writeln!(output, "| Group | Records | Mean | Status |");
        let _ = writeln!(output, "| --- | ---: | ---: | --- |");
        for aggregate in &ranked {
            let status = if aggregate.has_data() {
                scale.label(aggregate.tier)
            } else {
                "No data"
            };
            let _ = writeln!(
                output,
                "| {} | {} | {:.1}% | {} |",
                aggregate.display_name(),
                aggregate.count,
                aggregate.mean,
                status
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Alerts");

    if alerts.is_empty() {
        let _ = writeln!(output, "No groups need attention.");
    } else {
        for alert in alerts {
            let _ = writeln!(output, "- [{}] {}", alert.severity.as_str(), alert.message);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Engagement Timeline");

    if timeline.is_empty() {
        let _ = writeln!(output, "No timeline points for this window.");
    } else {
        for point in timeline {
            let _ = writeln!(
                output,
                "- {}: {:.1}% across {} records",
                point.bucket_start.format("%Y-%m-%d %H:%M"),
                point.mean,
                point.count
            );
        }
    }

    output
}
