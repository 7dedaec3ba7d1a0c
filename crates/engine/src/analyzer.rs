//! Funnel analysis entry point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use funnel_core::{
    AppConfig, FunnelConfig, FunnelError, FunnelMetrics, FunnelReport, FunnelResult, QueryScope,
    StrategyKind,
};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fetcher::StepFetcher;
use crate::report::build_report;
use crate::source::{StepSource, TinybirdClient};
use crate::strategy::{FunnelStrategy, ModularStrategy, PipeStrategy};

/// Result for one funnel of a batch.
#[derive(Debug)]
pub struct FunnelOutcome {
    pub funnel_id: String,
    pub result: FunnelResult<Vec<FunnelMetrics>>,
}

/// Validates funnel definitions and runs them through the configured
/// strategy. Cheap to share behind an `Arc`.
pub struct FunnelAnalyzer {
    strategy: Arc<dyn FunnelStrategy>,
    fetcher: StepFetcher,
    min_steps: usize,
}

impl FunnelAnalyzer {
    pub fn new(strategy: Arc<dyn FunnelStrategy>, fetcher: StepFetcher, min_steps: usize) -> Self {
        Self {
            strategy,
            fetcher,
            min_steps,
        }
    }

    /// Analyzer talking to the Tinybird backend described by `config`.
    pub fn from_config(config: &AppConfig) -> FunnelResult<Self> {
        let client = Arc::new(TinybirdClient::new(&config.backend)?);
        let fetcher = StepFetcher::new(client.clone(), Duration::from_millis(config.cache.ttl_ms));

        let strategy: Arc<dyn FunnelStrategy> = match config.evaluation.strategy {
            StrategyKind::Modular => Arc::new(ModularStrategy::new(
                fetcher.clone(),
                config.backend.row_limit,
                config.evaluation.visitor_id_limit,
            )),
            StrategyKind::Pipe => Arc::new(PipeStrategy::new(
                client,
                config.backend.analysis_pipe.clone(),
            )),
        };

        info!(
            strategy = strategy.name(),
            api = %config.backend.api_base(),
            cache_ttl_ms = config.cache.ttl_ms,
            "Funnel analyzer initialized"
        );
        Ok(Self::new(strategy, fetcher, config.evaluation.min_steps))
    }

    /// Modular analyzer over any step source.
    pub fn with_source(source: Arc<dyn StepSource>, config: &AppConfig) -> Self {
        let fetcher = StepFetcher::new(source, Duration::from_millis(config.cache.ttl_ms));
        let strategy = Arc::new(ModularStrategy::new(
            fetcher.clone(),
            config.backend.row_limit,
            config.evaluation.visitor_id_limit,
        ));
        Self::new(strategy, fetcher, config.evaluation.min_steps)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub async fn analyze_funnel(
        &self,
        config: &FunnelConfig,
        scope: &QueryScope,
    ) -> FunnelResult<Vec<FunnelMetrics>> {
        self.analyze_funnel_with_cancel(config, scope, &CancellationToken::new())
            .await
    }

    /// Validate and compute a funnel. Configuration errors are raised before
    /// any request; cancelling `cancel` abandons outstanding requests.
    pub async fn analyze_funnel_with_cancel(
        &self,
        config: &FunnelConfig,
        scope: &QueryScope,
        cancel: &CancellationToken,
    ) -> FunnelResult<Vec<FunnelMetrics>> {
        config.validate(self.min_steps)?;
        if config.steps.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(FunnelError::Cancelled);
        }

        let started = Instant::now();
        info!(
            funnel_id = %config.id,
            steps = config.steps.len(),
            strategy = self.strategy.name(),
            "Analyzing funnel"
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FunnelError::Cancelled),
            result = self.strategy.compute(config, scope) => result,
        };

        match &result {
            Ok(metrics) => info!(
                funnel_id = %config.id,
                visitors = metrics.first().map_or(0, |m| m.visitors),
                converted = metrics.last().map_or(0, |m| m.visitors),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Funnel analysis complete"
            ),
            Err(FunnelError::Cancelled) => info!(funnel_id = %config.id, "Funnel analysis cancelled"),
            Err(e) => {
                metrics::counter!("funnel.analysis.failed").increment(1);
                warn!(
                    funnel_id = %config.id,
                    upstream = e.is_upstream(),
                    error = %e,
                    "Funnel analysis failed"
                );
            }
        }
        result
    }

    /// Compute a funnel and package it with names, summary and timing.
    pub async fn analyze_report(
        &self,
        config: &FunnelConfig,
        scope: &QueryScope,
    ) -> FunnelResult<FunnelReport> {
        let started = Instant::now();
        let metrics = self.analyze_funnel(config, scope).await?;
        Ok(build_report(config, scope, metrics, started.elapsed()))
    }

    /// Compute several funnels concurrently. Each funnel succeeds or fails
    /// on its own.
    pub async fn analyze_many(
        &self,
        configs: &[FunnelConfig],
        scope: &QueryScope,
    ) -> Vec<FunnelOutcome> {
        join_all(configs.iter().map(|config| async move {
            FunnelOutcome {
                funnel_id: config.id.clone(),
                result: self.analyze_funnel(config, scope).await,
            }
        }))
        .await
    }

    pub fn clear_cache(&self) {
        self.fetcher.clear_cache();
    }

    pub fn set_cache_timeout(&self, ttl: Duration) {
        self.fetcher.set_cache_timeout(ttl);
    }

    /// Drop expired step results; meant for a periodic maintenance task.
    pub fn evict_expired(&self) -> usize {
        self.fetcher.evict_expired()
    }
}

/// Metrics tagged with the run that produced them.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub generation: u64,
    pub metrics: Vec<FunnelMetrics>,
}

/// Runs analyses where only the latest request matters: starting a run
/// cancels the one before it, so a slow stale run can never report after
/// a newer one.
pub struct AnalysisSession {
    analyzer: Arc<FunnelAnalyzer>,
    current: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
}

impl AnalysisSession {
    pub fn new(analyzer: Arc<FunnelAnalyzer>) -> Self {
        Self {
            analyzer,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn run(&self, config: &FunnelConfig, scope: &QueryScope) -> FunnelResult<SessionResult> {
        let token = CancellationToken::new();
        let generation = {
            let mut current = self.current.lock();
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let metrics = self
            .analyzer
            .analyze_funnel_with_cancel(config, scope, &token)
            .await?;

        if self.generation() != generation {
            return Err(FunnelError::Cancelled);
        }
        Ok(SessionResult {
            generation,
            metrics,
        })
    }

    /// Cancel whatever run is in flight.
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSource;
    use funnel_core::{Matcher, StepFilter};

    fn funnel(paths: &[&str]) -> FunnelConfig {
        let steps = paths
            .iter()
            .map(|p| StepFilter::default().with(Matcher::PathExact, *p))
            .collect();
        FunnelConfig::new("signup", "Signup", steps)
    }

    fn scope() -> QueryScope {
        QueryScope::new("2024-01-01", "2024-01-31")
    }

    fn analyzer(source: Arc<FakeSource>) -> FunnelAnalyzer {
        FunnelAnalyzer::with_source(source, &AppConfig::default())
    }

    fn shop() -> FakeSource {
        FakeSource::new()
            .with_step("/", &[("A", "2024-01-02 10:00:01"), ("B", "2024-01-02 10:00:02"), ("C", "2024-01-02 10:00:03")])
            .with_step("/cart", &[("A", "2024-01-02 10:00:04"), ("C", "2024-01-02 10:00:01")])
            .with_step("/paid", &[("A", "2024-01-02 10:00:05")])
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let source = Arc::new(shop());
        let analyzer = analyzer(source.clone());

        let metrics = analyzer
            .analyze_funnel(&funnel(&["/", "/cart", "/paid"]), &scope())
            .await
            .unwrap();

        assert_eq!(
            metrics.iter().map(|m| m.visitors).collect::<Vec<_>>(),
            vec![3, 1, 1]
        );
        assert_eq!(metrics[1].conversion_rate, 0.3333);
        assert_eq!(metrics[1].drop_off, 0.6667);
        assert_eq!(metrics[2].conversion_rate, 0.3333);
        assert_eq!(metrics[2].relative_previous_visitors, 1.0);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_zero_steps_make_no_requests() {
        let source = Arc::new(shop());
        let metrics = analyzer(source.clone())
            .analyze_funnel(&funnel(&[]), &scope())
            .await
            .unwrap();
        assert!(metrics.is_empty());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_config_errors_raised_before_fetching() {
        let source = Arc::new(shop());
        let analyzer = analyzer(source.clone());

        let single = analyzer.analyze_funnel(&funnel(&["/"]), &scope()).await;
        assert!(matches!(single, Err(FunnelError::Config(_))));

        let mut blank = funnel(&["/", "/cart"]);
        blank.steps[1] = StepFilter::default().named("Blank");
        let blank = analyzer.analyze_funnel(&blank, &scope()).await;
        assert!(matches!(blank, Err(FunnelError::Config(_))));

        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_one_failing_step_fails_the_funnel() {
        let source = Arc::new(shop().failing_on("/cart"));
        let result = analyzer(source)
            .analyze_funnel(&funnel(&["/", "/cart", "/paid"]), &scope())
            .await;
        assert!(matches!(result, Err(FunnelError::Backend { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_repeat_analysis_served_from_cache() {
        let source = Arc::new(shop());
        let analyzer = analyzer(source.clone());
        let config = funnel(&["/", "/cart"]);

        analyzer.analyze_funnel(&config, &scope()).await.unwrap();
        analyzer.analyze_funnel(&config, &scope()).await.unwrap();
        assert_eq!(source.calls(), 2);

        analyzer.clear_cache();
        analyzer.analyze_funnel(&config, &scope()).await.unwrap();
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts() {
        let source = Arc::new(shop().with_delay(Duration::from_secs(5)));
        let analyzer = analyzer(source);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = analyzer
            .analyze_funnel_with_cancel(&funnel(&["/", "/cart"]), &scope(), &token)
            .await;
        assert!(matches!(result, Err(FunnelError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_newer_session_run_supersedes_older() {
        let source = Arc::new(shop().with_delay(Duration::from_millis(200)));
        let session = Arc::new(AnalysisSession::new(Arc::new(analyzer(source))));

        let stale = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .run(&funnel(&["/", "/cart"]), &QueryScope::new("2023-12-01", "2023-12-31"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = session.run(&funnel(&["/", "/cart"]), &scope()).await.unwrap();
        assert_eq!(fresh.generation, 2);
        assert_eq!(fresh.metrics[0].visitors, 3);

        let stale = stale.await.unwrap();
        assert!(matches!(stale, Err(FunnelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_batch_is_best_effort() {
        let source = Arc::new(shop().failing_on("/broken"));
        let analyzer = analyzer(source);

        let mut good = funnel(&["/", "/cart"]);
        good.id = "good".to_string();
        let mut bad = funnel(&["/", "/broken"]);
        bad.id = "bad".to_string();

        let outcomes = analyzer.analyze_many(&[good, bad], &scope()).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].funnel_id, "good");
        assert_eq!(outcomes[0].result.as_ref().unwrap()[1].visitors, 1);
        assert_eq!(outcomes[1].funnel_id, "bad");
        assert!(outcomes[1].result.is_err());
    }

    #[tokio::test]
    async fn test_report() {
        let analyzer = analyzer(Arc::new(shop()));
        let mut config = funnel(&["/", "/cart", "/paid"]);
        config.steps[0].name = Some("Landing".to_string());

        let report = analyzer.analyze_report(&config, &scope()).await.unwrap();
        assert_eq!(report.funnel_id, "signup");
        assert_eq!(report.total_steps, 3);
        assert_eq!(report.total_visitors, 3);
        assert_eq!(report.steps[0].name, "Landing");
        assert_eq!(report.steps[1].name, "Step 2");
        assert_eq!(report.overall_conversion_rate, 0.3333);
        assert_eq!(report.summary.biggest_drop_off.map(|d| d.step), Some(2));
    }
}
