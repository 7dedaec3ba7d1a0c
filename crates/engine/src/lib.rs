//! Funnel analysis over a hosted analytics backend: per-step visitor
//! queries, cached fetches, sequential qualification and derived metrics.

#![warn(clippy::unwrap_used)]

pub mod analyzer;
pub mod calculator;
pub mod evaluator;
pub mod fetcher;
pub mod query;
pub mod report;
pub mod source;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use analyzer::{AnalysisSession, FunnelAnalyzer, FunnelOutcome, SessionResult};
pub use calculator::{calculate_funnel_metrics, format_percentage, format_visitor_count, summarize};
pub use evaluator::evaluate_funnel;
pub use fetcher::StepFetcher;
pub use query::{build_pipe_query, build_step_query, QueryParam, StepQuery};
pub use source::{StepSource, TinybirdClient};
pub use strategy::{FunnelStrategy, ModularStrategy, PipeStrategy};
