use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One visitor matching a step, with the first time they did so.
/// Timestamps are ISO-8601 strings and compare lexically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorObservation {
    pub visitor_id: String,
    pub first_occurrence: String,
}

impl VisitorObservation {
    pub fn new(visitor_id: impl Into<String>, first_occurrence: impl Into<String>) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            first_occurrence: first_occurrence.into(),
        }
    }
}

/// Date range and tenant for one evaluation. Dates are passed through to
/// the backend as supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryScope {
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
}

impl QueryScope {
    pub fn new(date_from: impl Into<String>, date_to: impl Into<String>) -> Self {
        Self {
            date_from: Some(date_from.into()),
            date_to: Some(date_to.into()),
            site_id: None,
        }
    }

    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }
}

/// Visitor count for a step before derived figures are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub step: usize,
    pub visitors: u64,
}

/// Per-step funnel figures. Ratios are rounded to four decimal places.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelMetrics {
    pub step: usize,
    pub visitors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_ids: Option<Vec<String>>,
    pub relative_visitors: f64,
    pub previous_visitors: u64,
    pub relative_previous_visitors: f64,
    pub dropped: u64,
    pub drop_off: f64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropOff {
    pub step: usize,
    pub rate: f64,
    pub absolute: u64,
}

/// Headline numbers for a computed funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelSummary {
    pub total_visitors: u64,
    pub final_conversion: f64,
    pub biggest_drop_off: Option<DropOff>,
    pub average_drop_off: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStepReport {
    pub name: String,
    #[serde(flatten)]
    pub metrics: FunnelMetrics,
}

/// A funnel result packaged for presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelReport {
    pub funnel_id: String,
    pub funnel_name: String,
    pub total_visitors: u64,
    pub total_steps: usize,
    pub steps: Vec<FunnelStepReport>,
    pub overall_conversion_rate: f64,
    pub completion_rate: f64,
    pub summary: FunnelSummary,
    pub date_range: QueryScope,
    pub processing_time_ms: u64,
    pub computed_at: DateTime<Utc>,
}
