//! Backend access for funnel queries.

use std::time::Duration;

use async_trait::async_trait;
use funnel_core::config::BackendConfig;
use funnel_core::{FunnelError, FunnelResult, VisitorObservation};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::query::StepQuery;

/// Anything that can answer a single-step visitor query.
#[async_trait]
pub trait StepSource: Send + Sync {
    async fn fetch_step(&self, query: &StepQuery) -> FunnelResult<Vec<VisitorObservation>>;
}

#[derive(Deserialize)]
struct PipeResponse<T> {
    data: Vec<T>,
}

/// HTTP client for Tinybird pipe endpoints.
pub struct TinybirdClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    step_pipe: String,
    timeout: Duration,
}

impl TinybirdClient {
    pub fn new(config: &BackendConfig) -> FunnelResult<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FunnelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.api_base(),
            token: config.token.clone(),
            step_pipe: config.step_pipe.clone(),
            timeout,
        })
    }

    fn pipe_url(&self, pipe: &str) -> String {
        format!("{}/v0/pipes/{}.json", self.base_url, pipe)
    }

    /// Query a pipe and decode the rows of its `data` array.
    pub async fn query_pipe<T: DeserializeOwned>(
        &self,
        pipe: &str,
        query: &StepQuery,
    ) -> FunnelResult<Vec<T>> {
        let mut params = query.pairs();
        if !self.token.is_empty() {
            params.push(("token".to_string(), self.token.clone()));
        }

        let response = self
            .http
            .get(self.pipe_url(pipe))
            .header(ACCEPT, "application/json")
            .query(&params)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            warn!(pipe = pipe, status = status.as_u16(), "Backend rejected funnel query");
            return Err(FunnelError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let decoded: PipeResponse<T> = serde_json::from_str(&body)
            .map_err(|e| FunnelError::MalformedResponse(format!("{pipe}: {e}")))?;
        debug!(pipe = pipe, rows = decoded.data.len(), "Backend query complete");
        Ok(decoded.data)
    }

    fn transport_error(&self, err: reqwest::Error) -> FunnelError {
        if err.is_timeout() {
            FunnelError::Timeout(self.timeout)
        } else {
            FunnelError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl StepSource for TinybirdClient {
    async fn fetch_step(&self, query: &StepQuery) -> FunnelResult<Vec<VisitorObservation>> {
        self.query_pipe(&self.step_pipe, query).await
    }
}
