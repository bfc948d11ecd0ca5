//! Risk levels and assessments
//!
//! Scores are bucketed with fixed boundaries so that identical scores
//! always land in the same level, whatever strategy produced them.

use serde::{Deserialize, Serialize};

/// Score at or above which a step is `critical`
pub const CRITICAL_BOUNDARY: f64 = 0.8;
/// Score at or above which a step is `high`
pub const HIGH_BOUNDARY: f64 = 0.6;
/// Score at or above which a step is `medium`
pub const MEDIUM_BOUNDARY: f64 = 0.3;

/// Bucketed risk of a proposed step
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Bucket a score in [0, 1]. Out-of-range scores are clamped first.
    pub fn from_score(score: f64) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        if score >= CRITICAL_BOUNDARY {
            Self::Critical
        } else if score >= HIGH_BOUNDARY {
            Self::High
        } else if score >= MEDIUM_BOUNDARY {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Lowest score that buckets into this level
    pub fn floor_score(&self) -> f64 {
        match self {
            Self::Low => 0.0,
            Self::Medium => MEDIUM_BOUNDARY,
            Self::High => HIGH_BOUNDARY,
            Self::Critical => CRITICAL_BOUNDARY,
        }
    }

    /// The next stricter level, saturating at `critical`
    pub fn raised(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// The next looser level, saturating at `low`
    pub fn lowered(&self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// The outcome of scoring one proposed step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Score in [0, 1]
    pub score: f64,
    /// Human-readable contributing factors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub factors: Vec<String>,
}

impl RiskAssessment {
    /// Build an assessment whose level is derived from the score
    pub fn from_score(score: f64) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Self {
            level: RiskLevel::from_score(score),
            score,
            factors: Vec::new(),
        }
    }

    pub fn with_factor(mut self, factor: impl Into<String>) -> Self {
        self.factors.push(factor.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucketing_boundaries() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.29), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.3), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.6), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.8), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(1.7), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(-3.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(f64::NAN), RiskLevel::Low);
    }

    #[test]
    fn test_floor_score_round_trips_through_bucketing() {
        for level in [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ] {
            assert_eq!(RiskLevel::from_score(level.floor_score()), level);
        }
    }

    #[test]
    fn test_ordering_and_steps() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.raised(), RiskLevel::Critical);
        assert_eq!(RiskLevel::Medium.lowered(), RiskLevel::Low);
        assert_eq!("HIGH".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert!("extreme".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&RiskLevel::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }
}
