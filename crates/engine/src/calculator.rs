//! Derived funnel figures from per-step visitor counts.

use funnel_core::{DropOff, FunnelMetrics, FunnelStep, FunnelSummary};

/// Round to four decimal places.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// `numerator / denominator` rounded, 0 when the denominator is 0.
pub fn ratio_of(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round4(numerator as f64 / denominator as f64)
    }
}

/// Enrich `(step, visitors)` pairs with relative, previous-step and
/// drop-off figures. Input order does not matter; output is sorted by step.
pub fn calculate_funnel_metrics(steps: &[FunnelStep]) -> Vec<FunnelMetrics> {
    let mut sorted = steps.to_vec();
    sorted.sort_by_key(|s| s.step);

    let first = match sorted.first() {
        Some(first) => first.visitors,
        None => return Vec::new(),
    };

    sorted
        .iter()
        .enumerate()
        .map(|(index, current)| {
            if index == 0 {
                let base = if current.visitors > 0 { 1.0 } else { 0.0 };
                return FunnelMetrics {
                    step: current.step,
                    visitors: current.visitors,
                    visitor_ids: None,
                    relative_visitors: base,
                    previous_visitors: 0,
                    relative_previous_visitors: 1.0,
                    dropped: 0,
                    drop_off: 0.0,
                    conversion_rate: base,
                };
            }

            let previous = sorted[index - 1].visitors;
            let conversion = ratio_of(current.visitors, first).min(1.0);
            let drop_off = if previous == 0 {
                0.0
            } else {
                round4(1.0 - current.visitors as f64 / previous as f64).clamp(0.0, 1.0)
            };

            FunnelMetrics {
                step: current.step,
                visitors: current.visitors,
                visitor_ids: None,
                relative_visitors: conversion,
                previous_visitors: previous,
                relative_previous_visitors: ratio_of(current.visitors, previous),
                dropped: previous.saturating_sub(current.visitors),
                drop_off,
                conversion_rate: conversion,
            }
        })
        .collect()
}

/// Step with the highest drop-off rate, earliest wins ties. None when no
/// step loses visitors.
pub fn find_biggest_drop_off(metrics: &[FunnelMetrics]) -> Option<DropOff> {
    metrics
        .iter()
        .filter(|m| m.drop_off > 0.0)
        .fold(None, |best: Option<&FunnelMetrics>, m| match best {
            Some(b) if b.drop_off >= m.drop_off => Some(b),
            _ => Some(m),
        })
        .map(|m| DropOff {
            step: m.step,
            rate: m.drop_off,
            absolute: m.dropped,
        })
}

/// Mean drop-off over every step after the first.
pub fn average_drop_off(metrics: &[FunnelMetrics]) -> f64 {
    let rates: Vec<f64> = metrics
        .iter()
        .filter(|m| m.step > 1)
        .map(|m| m.drop_off)
        .collect();
    if rates.is_empty() {
        return 0.0;
    }
    round4(rates.iter().sum::<f64>() / rates.len() as f64)
}

pub fn summarize(metrics: &[FunnelMetrics]) -> FunnelSummary {
    FunnelSummary {
        total_visitors: metrics.first().map_or(0, |m| m.visitors),
        final_conversion: metrics.last().map_or(0.0, |m| m.conversion_rate),
        biggest_drop_off: find_biggest_drop_off(metrics),
        average_drop_off: average_drop_off(metrics),
    }
}

/// `0.1234` -> `"12.3%"` with one decimal.
pub fn format_percentage(value: f64, decimals: usize) -> String {
    format!("{:.*}%", decimals, value * 100.0)
}

/// Compact visitor count: `950`, `1.2K`, `3.4M`.
pub fn format_visitor_count(value: u64) -> String {
    if value >= 1_000_000 {
        format!("{:.1}M", value as f64 / 1_000_000.0)
    } else if value >= 1_000 {
        format!("{:.1}K", value as f64 / 1_000.0)
    } else {
        value.to_string()
    }
}
