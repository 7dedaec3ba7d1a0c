use serde::Deserialize;

use crate::error::FunnelResult;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `FUNNEL_ENGINE__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_step_pipe")]
    pub step_pipe: String,
    #[serde(default = "default_analysis_pipe")]
    pub analysis_pipe: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Upper bound on rows the backend returns for one step query.
    #[serde(default = "default_row_limit")]
    pub row_limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_min_steps")]
    pub min_steps: usize,
    /// Qualified sets larger than this omit the visitor id list.
    #[serde(default = "default_visitor_id_limit")]
    pub visitor_id_limit: usize,
}

/// How a funnel is computed against the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// One request per step, visitor sets intersected locally.
    #[default]
    Modular,
    /// A single backend pipe computes every step at once.
    Pipe,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "modular" => Ok(StrategyKind::Modular),
            "pipe" => Ok(StrategyKind::Pipe),
            other => Err(format!("unknown strategy '{other}' (expected modular or pipe)")),
        }
    }
}

// Default functions
fn default_api_url() -> String {
    "https://api.eu-west-1.aws.tinybird.co".to_string()
}
fn default_step_pipe() -> String {
    "funnel_step_processor".to_string()
}
fn default_analysis_pipe() -> String {
    "funnel_analysis_enhanced".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_row_limit() -> u64 {
    100_000
}
fn default_cache_ttl_ms() -> u64 {
    60_000
}
fn default_min_steps() -> usize {
    2
}
fn default_visitor_id_limit() -> usize {
    1000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: String::new(),
            step_pipe: default_step_pipe(),
            analysis_pipe: default_analysis_pipe(),
            request_timeout_ms: default_request_timeout_ms(),
            row_limit: default_row_limit(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            min_steps: default_min_steps(),
            visitor_id_limit: default_visitor_id_limit(),
        }
    }
}

impl BackendConfig {
    /// API host for the configured URL. Dashboard (UI) hosts are mapped to
    /// their API counterparts and any trailing `/v0` or slash is dropped.
    pub fn api_base(&self) -> String {
        let trimmed = self.api_url.trim_end_matches('/');
        let trimmed = trimmed.strip_suffix("/v0").unwrap_or(trimmed);
        match trimmed {
            "https://ui.tinybird.co" => "https://api.tinybird.co".to_string(),
            "https://ui.us-east.tinybird.co" => "https://api.us-east.tinybird.co".to_string(),
            other => other.to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then environment
    /// variables (`FUNNEL_ENGINE__BACKEND__TOKEN=...`), later sources winning.
    pub fn load(path: Option<&str>) -> FunnelResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("FUNNEL_ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
