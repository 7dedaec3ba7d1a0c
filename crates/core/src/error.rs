use std::time::Duration;

use thiserror::Error;

pub type FunnelResult<T> = Result<T, FunnelError>;

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("Funnel configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend returned HTTP {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("Funnel analysis was cancelled")]
    Cancelled,

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FunnelError {
    /// True for failures caused by the remote backend or the path to it,
    /// as opposed to caller mistakes.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            FunnelError::Network(_)
                | FunnelError::Timeout(_)
                | FunnelError::Backend { .. }
                | FunnelError::MalformedResponse(_)
        )
    }
}
