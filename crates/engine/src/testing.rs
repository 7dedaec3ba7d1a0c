//! In-process backend double for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use funnel_core::{FunnelError, FunnelResult, Matcher, VisitorObservation};

use crate::query::{QueryParam, StepQuery};
use crate::source::StepSource;

/// Answers step queries by their `path_exact` value and counts calls.
#[derive(Default)]
pub struct FakeSource {
    steps: HashMap<String, Vec<VisitorObservation>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, path: &str, rows: &[(&str, &str)]) -> Self {
        let rows = rows
            .iter()
            .map(|(id, ts)| VisitorObservation::new(*id, *ts))
            .collect();
        self.steps.insert(path.to_string(), rows);
        self
    }

    pub fn failing_on(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepSource for FakeSource {
    async fn fetch_step(&self, query: &StepQuery) -> FunnelResult<Vec<VisitorObservation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let path = query
            .get(QueryParam::Filter(Matcher::PathExact))
            .unwrap_or_default();
        if self.failing.contains(path) {
            return Err(FunnelError::Backend {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(self.steps.get(path).cloned().unwrap_or_default())
    }
}
