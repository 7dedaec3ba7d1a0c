use std::time::Duration;

use chrono::Utc;
use funnel_core::{FunnelConfig, FunnelMetrics, FunnelReport, FunnelStepReport, QueryScope};

use crate::calculator::{ratio_of, summarize};

pub fn build_report(
    config: &FunnelConfig,
    scope: &QueryScope,
    metrics: Vec<FunnelMetrics>,
    elapsed: Duration,
) -> FunnelReport {
    let summary = summarize(&metrics);
    let total_visitors = summary.total_visitors;
    let final_visitors = metrics.last().map_or(0, |m| m.visitors);

    let steps = metrics
        .into_iter()
        .map(|m| FunnelStepReport {
            name: config
                .steps
                .get(m.step.saturating_sub(1))
                .map_or_else(|| format!("Step {}", m.step), |s| s.label(m.step)),
            metrics: m,
        })
        .collect::<Vec<_>>();

    FunnelReport {
        funnel_id: config.id.clone(),
        funnel_name: config.name.clone(),
        total_visitors,
        total_steps: steps.len(),
        overall_conversion_rate: summary.final_conversion,
        completion_rate: ratio_of(final_visitors, total_visitors),
        steps,
        summary,
        date_range: scope.clone(),
        processing_time_ms: elapsed.as_millis() as u64,
        computed_at: Utc::now(),
    }
}
