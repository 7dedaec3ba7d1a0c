//! Funnel computation strategies.
//!
//! Both produce the same metrics shape: the modular strategy fetches each
//! step separately and intersects visitor sets locally, the pipe strategy
//! asks one backend pipe for every step's count.

use std::sync::Arc;

use async_trait::async_trait;
use funnel_core::{FunnelConfig, FunnelError, FunnelMetrics, FunnelResult, FunnelStep, QueryScope};
use futures::future::try_join_all;
use serde::Deserialize;

use crate::calculator::calculate_funnel_metrics;
use crate::evaluator::evaluate_funnel;
use crate::fetcher::StepFetcher;
use crate::query::{build_pipe_query, build_step_query};
use crate::source::TinybirdClient;

/// Steps the whole-funnel pipe accepts.
pub const PIPE_MAX_STEPS: usize = 4;

#[async_trait]
pub trait FunnelStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute metrics for a validated, non-empty funnel.
    async fn compute(
        &self,
        config: &FunnelConfig,
        scope: &QueryScope,
    ) -> FunnelResult<Vec<FunnelMetrics>>;
}

/// One cached request per step, fetched concurrently; the first failure
/// fails the funnel.
pub struct ModularStrategy {
    fetcher: StepFetcher,
    row_limit: u64,
    visitor_id_limit: usize,
}

impl ModularStrategy {
    pub fn new(fetcher: StepFetcher, row_limit: u64, visitor_id_limit: usize) -> Self {
        Self {
            fetcher,
            row_limit,
            visitor_id_limit,
        }
    }
}

#[async_trait]
impl FunnelStrategy for ModularStrategy {
    fn name(&self) -> &'static str {
        "modular"
    }

    async fn compute(
        &self,
        config: &FunnelConfig,
        scope: &QueryScope,
    ) -> FunnelResult<Vec<FunnelMetrics>> {
        let queries: Vec<_> = config
            .steps
            .iter()
            .map(|step| build_step_query(step, scope, self.row_limit))
            .collect();

        let rows = try_join_all(queries.iter().map(|q| self.fetcher.fetch(q))).await?;
        let slices: Vec<_> = rows.iter().map(|r| r.as_slice()).collect();

        Ok(evaluate_funnel(config, &slices, self.visitor_id_limit))
    }
}

#[derive(Deserialize)]
struct PipeStepRow {
    step: usize,
    visitors: u64,
}

/// A single request to the whole-funnel pipe. Derived figures are
/// recomputed locally from the returned counts.
pub struct PipeStrategy {
    client: Arc<TinybirdClient>,
    pipe: String,
}

impl PipeStrategy {
    pub fn new(client: Arc<TinybirdClient>, pipe: impl Into<String>) -> Self {
        Self {
            client,
            pipe: pipe.into(),
        }
    }
}

#[async_trait]
impl FunnelStrategy for PipeStrategy {
    fn name(&self) -> &'static str {
        "pipe"
    }

    async fn compute(
        &self,
        config: &FunnelConfig,
        scope: &QueryScope,
    ) -> FunnelResult<Vec<FunnelMetrics>> {
        if config.steps.len() > PIPE_MAX_STEPS {
            return Err(FunnelError::Config(format!(
                "the {} pipe supports at most {PIPE_MAX_STEPS} steps, funnel '{}' has {}",
                self.pipe,
                config.id,
                config.steps.len()
            )));
        }

        let query = build_pipe_query(config, scope);
        let rows: Vec<PipeStepRow> = self.client.query_pipe(&self.pipe, &query).await?;

        let mut counts: Vec<FunnelStep> = (1..=config.steps.len())
            .map(|step| FunnelStep { step, visitors: 0 })
            .collect();
        for row in rows {
            if let Some(slot) = row.step.checked_sub(1).and_then(|i| counts.get_mut(i)) {
                slot.visitors = row.visitors;
            }
        }
        // Counts must never grow from one step to the next.
        for i in 1..counts.len() {
            counts[i].visitors = counts[i].visitors.min(counts[i - 1].visitors);
        }

        Ok(calculate_funnel_metrics(&counts))
    }
}
