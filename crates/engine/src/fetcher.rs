//! Cached per-step visitor fetches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use funnel_cache::TtlCache;
use funnel_core::{FunnelError, FunnelResult, VisitorObservation};
use tracing::debug;

use crate::query::StepQuery;
use crate::source::StepSource;

pub type StepRows = Arc<Vec<VisitorObservation>>;

/// Fetches step visitor sets through a TTL cache keyed by the full query.
/// Clones share the cache.
#[derive(Clone)]
pub struct StepFetcher {
    source: Arc<dyn StepSource>,
    cache: TtlCache<String, StepRows>,
}

impl StepFetcher {
    pub fn new(source: Arc<dyn StepSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: TtlCache::new(ttl),
        }
    }

    pub async fn fetch(&self, query: &StepQuery) -> FunnelResult<StepRows> {
        let key = query.cache_key();
        self.cache
            .get_or_try_insert_with(key, || async {
                let started = Instant::now();
                let rows = self.source.fetch_step(query).await?;
                let elapsed = started.elapsed();

                metrics::histogram!("funnel.step.fetch_ms").record(elapsed.as_secs_f64() * 1000.0);
                debug!(
                    rows = rows.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Fetched funnel step"
                );
                Ok::<_, FunnelError>(Arc::new(rows))
            })
            .await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn set_cache_timeout(&self, ttl: Duration) {
        self.cache.set_ttl(ttl);
    }

    pub fn cache_timeout(&self) -> Duration {
        self.cache.ttl()
    }

    /// Reclaim expired entries; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.cache.evict_expired()
    }

    pub fn cached_queries(&self) -> usize {
        self.cache.len()
    }
}
