use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

/// Ordered classification bucket. `Low < Medium < High` regardless of how a
/// domain chooses to name the tiers on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Low, Tier::Medium, Tier::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }

    pub fn is_lowest(self) -> bool {
        self == Tier::Low
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display names a dashboard gives the three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierScale {
    #[default]
    Risk,
    LiveStatus,
    Health,
}

impl TierScale {
    pub fn label(self, tier: Tier) -> &'static str {
        match (self, tier) {
            (TierScale::Risk, Tier::Low) => "Low",
            (TierScale::Risk, Tier::Medium) => "Medium",
            (TierScale::Risk, Tier::High) => "High",
            (TierScale::LiveStatus, Tier::Low) => "Needs Attention",
            (TierScale::LiveStatus, Tier::Medium) => "Good",
            (TierScale::LiveStatus, Tier::High) => "Excellent",
            (TierScale::Health, Tier::Low) => "Offline",
            (TierScale::Health, Tier::Medium) => "Degraded",
            (TierScale::Health, Tier::High) => "Online",
        }
    }
}

/// Two cut points splitting `[0, 100]` into `[0, low)`, `[low, high)` and
/// `[high, 100]`. Only constructible with `0 <= low < high <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 2]", into = "[f64; 2]")]
pub struct Thresholds {
    low: f64,
    high: f64,
}

impl Thresholds {
    pub fn new(low: f64, high: f64) -> Result<Self, ConfigError> {
        let in_range = |v: f64| v.is_finite() && (MIN_SCORE..=MAX_SCORE).contains(&v);
        if !in_range(low) || !in_range(high) || low >= high {
            return Err(ConfigError::InvalidThresholds { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn classify(&self, score: f64) -> Tier {
        let score = clamp_score(score);
        if score >= self.high {
            Tier::High
        } else if score >= self.low {
            Tier::Medium
        } else {
            Tier::Low
        }
    }
}

impl TryFrom<[f64; 2]> for Thresholds {
    type Error = ConfigError;

    fn try_from([low, high]: [f64; 2]) -> Result<Self, Self::Error> {
        Thresholds::new(low, high)
    }
}

impl From<Thresholds> for [f64; 2] {
    fn from(value: Thresholds) -> Self {
        [value.low, value.high]
    }
}

pub fn classify(score: f64, thresholds: &Thresholds) -> Tier {
    thresholds.classify(score)
}

/// Upstream noise is expected: out-of-range scores are pulled back into
/// `[0, 100]` and NaN counts as zero engagement.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        MIN_SCORE
    } else {
        score.clamp(MIN_SCORE, MAX_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Thresholds {
        Thresholds::new(60.0, 80.0).unwrap()
    }

    #[test]
    fn tiers_follow_closed_open_intervals() {
        let t = admin();
        assert_eq!(t.classify(0.0), Tier::Low);
        assert_eq!(t.classify(59.99), Tier::Low);
        assert_eq!(t.classify(60.0), Tier::Medium);
        assert_eq!(t.classify(79.9), Tier::Medium);
        assert_eq!(t.classify(80.0), Tier::High);
        assert_eq!(t.classify(100.0), Tier::High);
    }

    #[test]
    fn classification_is_monotonic() {
        let t = Thresholds::new(55.0, 80.0).unwrap();
        let mut last = Tier::Low;
        for step in -20..=240 {
            let tier = classify(step as f64 * 0.5, &t);
            assert!(tier >= last, "tier dropped at score {}", step as f64 * 0.5);
            last = tier;
        }
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let t = admin();
        assert_eq!(t.classify(-15.0), Tier::Low);
        assert_eq!(t.classify(250.0), Tier::High);
        assert_eq!(t.classify(f64::NAN), Tier::Low);
        assert_eq!(clamp_score(130.0), 100.0);
        assert_eq!(clamp_score(-1.0), 0.0);
    }

    #[test]
    fn rejects_inverted_or_out_of_range_cut_points() {
        assert!(Thresholds::new(80.0, 60.0).is_err());
        assert!(Thresholds::new(70.0, 70.0).is_err());
        assert!(Thresholds::new(-5.0, 60.0).is_err());
        assert!(Thresholds::new(60.0, 120.0).is_err());
        assert!(Thresholds::new(f64::NAN, 60.0).is_err());
        assert!(Thresholds::try_from([50.0, 75.0]).is_ok());
    }

    #[test]
    fn scales_name_the_same_order_differently() {
        assert_eq!(TierScale::LiveStatus.label(Tier::Low), "Needs Attention");
        assert_eq!(TierScale::LiveStatus.label(Tier::High), "Excellent");
        assert_eq!(TierScale::Risk.label(Tier::Medium), "Medium");
        assert_eq!(TierScale::Health.label(Tier::Low), "Offline");
    }
}
