#![warn(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod funnel;
pub mod types;

pub use config::{AppConfig, StrategyKind};
pub use error::{FunnelError, FunnelResult};
pub use funnel::{FunnelConfig, Matcher, SequenceMode, StepFilter};
pub use types::{
    DropOff, FunnelMetrics, FunnelReport, FunnelStep, FunnelStepReport, FunnelSummary, QueryScope,
    VisitorObservation,
};
