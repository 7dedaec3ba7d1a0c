//! Sequential funnel qualification over per-step visitor sets.
//!
//! Step 1 qualifies every observed visitor. Each later step keeps only the
//! visitors that qualified at the previous step and reached this one no
//! earlier than their previous qualifying time (and within the time window,
//! when one is set). The carried timestamp is always the latest step's.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use funnel_core::{FunnelConfig, FunnelMetrics, FunnelStep, SequenceMode, VisitorObservation};
use tracing::debug;

use crate::calculator::calculate_funnel_metrics;

/// Visitor id -> timestamp at which the visitor qualified for a step.
pub type QualifiedSet<'a> = HashMap<&'a str, &'a str>;

/// Constraint on moving from one step to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionRule {
    pub mode: SequenceMode,
    pub window: Option<Duration>,
}

impl Default for TransitionRule {
    fn default() -> Self {
        Self {
            mode: SequenceMode::Ordered,
            window: None,
        }
    }
}

impl TransitionRule {
    /// Rule for the transition into step `index` (0-based).
    pub fn for_step(config: &FunnelConfig, index: usize) -> Self {
        Self {
            mode: config.sequence_mode_for(index),
            window: config
                .time_window_for(index)
                .map(|hours| Duration::milliseconds((hours * 3_600_000.0).round() as i64)),
        }
    }

    pub fn allows(&self, previous: &str, current: &str) -> bool {
        if self.mode == SequenceMode::Ordered && current < previous {
            return false;
        }
        let Some(window) = self.window else {
            return true;
        };
        match (parse_timestamp(previous), parse_timestamp(current)) {
            (Some(prev), Some(cur)) => (cur - prev).abs() <= window,
            _ => false,
        }
    }
}

/// Parse the timestamp formats the backend emits: RFC 3339, ClickHouse
/// `YYYY-MM-DD HH:MM:SS[.fff]` (taken as UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Visitor set for one step's raw observations. A visitor listed more than
/// once keeps the earliest timestamp (first-occurrence semantics), not the
/// last row seen.
fn observed(raw: &[VisitorObservation]) -> QualifiedSet<'_> {
    let mut set: QualifiedSet<'_> = HashMap::with_capacity(raw.len());
    for obs in raw {
        set.entry(obs.visitor_id.as_str())
            .and_modify(|ts| {
                if obs.first_occurrence.as_str() < *ts {
                    *ts = obs.first_occurrence.as_str();
                }
            })
            .or_insert(obs.first_occurrence.as_str());
    }
    set
}

/// Qualified set for a step given the previous step's qualified set.
pub fn qualify_step<'a>(
    previous: Option<&QualifiedSet<'a>>,
    raw: &'a [VisitorObservation],
    rule: TransitionRule,
) -> QualifiedSet<'a> {
    let current = observed(raw);
    let Some(previous) = previous else {
        return current;
    };

    current
        .into_iter()
        .filter(|(visitor, ts)| {
            previous
                .get(visitor)
                .is_some_and(|prev_ts| rule.allows(prev_ts, ts))
        })
        .collect()
}

/// Evaluate a funnel over already fetched observations, one slice per step
/// in step order. Qualified id lists are attached when a step has at most
/// `visitor_id_limit` visitors.
pub fn evaluate_funnel(
    config: &FunnelConfig,
    observations: &[&[VisitorObservation]],
    visitor_id_limit: usize,
) -> Vec<FunnelMetrics> {
    let mut counts = Vec::with_capacity(observations.len());
    let mut id_lists = Vec::with_capacity(observations.len());
    let mut previous: Option<QualifiedSet<'_>> = None;

    for (index, &raw) in observations.iter().enumerate() {
        let rule = TransitionRule::for_step(config, index);
        let qualified = qualify_step(previous.as_ref(), raw, rule);

        debug!(
            funnel_id = %config.id,
            step = index + 1,
            observed = raw.len(),
            qualified = qualified.len(),
            "Qualified funnel step"
        );

        counts.push(FunnelStep {
            step: index + 1,
            visitors: qualified.len() as u64,
        });
        id_lists.push((qualified.len() <= visitor_id_limit).then(|| {
            let mut ids: Vec<String> = qualified.keys().map(|id| id.to_string()).collect();
            ids.sort_unstable();
            ids
        }));

        previous = Some(qualified);
    }

    let mut metrics = calculate_funnel_metrics(&counts);
    for (step, ids) in metrics.iter_mut().zip(id_lists) {
        step.visitor_ids = ids;
    }
    metrics
}
