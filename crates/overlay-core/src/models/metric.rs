//! Spatial metric rows and their state machine.

use crate::models::fragment::FragmentHash;
use crate::models::geography::{DatasetFormat, GeographyId};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a spatial metric row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricId(pub u64);

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a metric computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricState {
    Queued,
    Processing,
    Complete,
    Error,
}

impl MetricState {
    /// Forward-only transition rule. Resubmission is handled separately.
    pub fn can_transition_to(&self, next: MetricState) -> bool {
        use MetricState::*;
        matches!(
            (self, next),
            (Queued, Processing) | (Queued, Error) | (Processing, Complete) | (Processing, Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MetricState::Complete | MetricState::Error)
    }
}

impl fmt::Display for MetricState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricState::Queued => "queued",
            MetricState::Processing => "processing",
            MetricState::Complete => "complete",
            MetricState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Known metric types. Rows store the type as free text and are parsed at
/// processing time so an unknown type becomes a row error, not a load error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    TotalArea,
    OverlayArea,
}

impl MetricType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "total_area" => Some(MetricType::TotalArea),
            "overlay_area" => Some(MetricType::OverlayArea),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::TotalArea => "total_area",
            MetricType::OverlayArea => "overlay_area",
        }
    }
}

/// What a metric measures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSubject {
    Fragment { hash: FragmentHash },
    Geography { id: GeographyId },
}

/// Target dataset for `overlay_area` metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayParams {
    pub source_url: String,
    #[serde(default)]
    pub format: DatasetFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

/// Structured numeric result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricValue {
    TotalArea { square_km: f64 },
    /// Area per class; the `*` key holds the grand total.
    OverlayArea { square_km_by_class: BTreeMap<String, f64> },
}

impl MetricValue {
    pub const TOTAL_CLASS: &'static str = "*";

    /// Total area regardless of variant
    pub fn total_square_km(&self) -> f64 {
        match self {
            MetricValue::TotalArea { square_km } => *square_km,
            MetricValue::OverlayArea { square_km_by_class } => {
                square_km_by_class.get(Self::TOTAL_CLASS).copied().unwrap_or(0.0)
            }
        }
    }
}

/// Request to create a metric row
#[derive(Debug, Clone, PartialEq)]
pub struct NewMetric {
    pub metric_type: String,
    pub subject: MetricSubject,
    pub overlay: Option<OverlayParams>,
}

impl NewMetric {
    pub fn total_area(subject: MetricSubject) -> Self {
        Self { metric_type: MetricType::TotalArea.as_str().to_string(), subject, overlay: None }
    }

    pub fn overlay_area(subject: MetricSubject, overlay: OverlayParams) -> Self {
        Self {
            metric_type: MetricType::OverlayArea.as_str().to_string(),
            subject,
            overlay: Some(overlay),
        }
    }
}

/// A durable metric row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialMetric {
    pub id: MetricId,
    pub metric_type: String,
    pub subject: MetricSubject,
    pub state: MetricState,
    pub value: Option<MetricValue>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when processing starts; the row is considered stuck after this
    pub timeout_at: Option<DateTime<Utc>>,
    /// Whether any worker ever claimed the row
    #[serde(default)]
    pub claimed: bool,
    pub overlay: Option<OverlayParams>,
}

impl SpatialMetric {
    pub fn new(id: MetricId, request: NewMetric, now: DateTime<Utc>) -> Self {
        Self {
            id,
            metric_type: request.metric_type,
            subject: request.subject,
            state: MetricState::Queued,
            value: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            timeout_at: None,
            claimed: false,
            overlay: request.overlay,
        }
    }
}

/// Width of a rollup bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupGranularity {
    Hour,
    Day,
}

impl RollupGranularity {
    pub fn duration(&self) -> Duration {
        match self {
            RollupGranularity::Hour => Duration::hours(1),
            RollupGranularity::Day => Duration::days(1),
        }
    }

    /// Start of the bucket containing `at`
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.duration_trunc(self.duration()).unwrap_or(at)
    }
}

/// Aggregate completion counters for one metric type and time bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRollup {
    pub metric_type: String,
    pub granularity: RollupGranularity,
    pub bucket_start: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_forward_only_transitions() {
        use MetricState::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Complete));
        assert!(Processing.can_transition_to(Error));
        assert!(Queued.can_transition_to(Error));

        assert!(!Processing.can_transition_to(Queued));
        assert!(!Complete.can_transition_to(Processing));
        assert!(!Complete.can_transition_to(Error));
        assert!(!Error.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Complete));
    }

    #[test]
    fn test_metric_type_parse() {
        assert_eq!(MetricType::parse("total_area"), Some(MetricType::TotalArea));
        assert_eq!(MetricType::parse("overlay_area"), Some(MetricType::OverlayArea));
        assert_eq!(MetricType::parse("perimeter"), None);
    }

    #[test]
    fn test_overlay_value_total() {
        let mut by_class = BTreeMap::new();
        by_class.insert("*".to_string(), 12.5);
        by_class.insert("reef".to_string(), 10.0);
        let value = MetricValue::OverlayArea { square_km_by_class: by_class };
        assert_eq!(value.total_square_km(), 12.5);
    }

    #[test]
    fn test_bucket_start() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 42, 5).unwrap();
        assert_eq!(
            RollupGranularity::Hour.bucket_start(at),
            Utc.with_ymd_and_hms(2024, 3, 9, 17, 0, 0).unwrap()
        );
        assert_eq!(
            RollupGranularity::Day.bucket_start(at),
            Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_subject_serialization() {
        let subject = MetricSubject::Geography { id: 3 };
        let json = serde_json::to_value(&subject).unwrap();
        assert_eq!(json["kind"], "geography");
        assert_eq!(json["id"], 3);
    }
}
