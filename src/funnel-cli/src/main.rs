//! funnel-cli: run funnel analyses against the Tinybird backend from the shell.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use funnel_core::config::AppConfig;
use funnel_core::{FunnelConfig, FunnelMetrics, QueryScope, StrategyKind};
use funnel_engine::{format_percentage, format_visitor_count, FunnelAnalyzer};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "funnel-cli")]
#[command(about = "Conversion funnel analysis over hosted web analytics")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, env = "FUNNEL_ENGINE_CONFIG")]
    config: Option<String>,

    /// Backend API token (overrides config)
    #[arg(long, env = "FUNNEL_ENGINE__BACKEND__TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Backend API URL (overrides config)
    #[arg(long, env = "FUNNEL_ENGINE__BACKEND__API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute a funnel for a date range
    Analyze {
        /// Funnel definition (JSON); the standard checkout funnel when omitted
        #[arg(long)]
        funnel: Option<PathBuf>,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        site_id: Option<String>,

        /// modular or pipe (overrides config)
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Print the full report as JSON
        #[arg(long, conflicts_with = "json")]
        report: bool,

        /// Print per-step metrics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the standard checkout funnel definition
    Standard,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnel_cli=info,funnel_engine=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(token) = cli.token {
        config.backend.token = token;
    }
    if let Some(api_url) = cli.api_url {
        config.backend.api_url = api_url;
    }

    match cli.command {
        Command::Standard => {
            println!("{}", serde_json::to_string_pretty(&FunnelConfig::standard())?);
        }
        Command::Analyze {
            funnel,
            from,
            to,
            site_id,
            strategy,
            report,
            json,
        } => {
            if let Some(strategy) = strategy {
                config.evaluation.strategy = strategy;
            }

            let funnel = match funnel {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading funnel definition {}", path.display()))?;
                    FunnelConfig::from_json(&raw)
                        .with_context(|| format!("parsing funnel definition {}", path.display()))?
                }
                None => FunnelConfig::standard(),
            };

            let mut scope = QueryScope::new(from, to);
            scope.site_id = site_id;

            let analyzer = FunnelAnalyzer::from_config(&config)?;
            info!(
                funnel_id = %funnel.id,
                strategy = analyzer.strategy_name(),
                "Running funnel analysis"
            );

            if report {
                let report = analyzer
                    .analyze_report(&funnel, &scope)
                    .await
                    .with_context(|| format!("analyzing funnel '{}'", funnel.id))?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let metrics = analyzer
                    .analyze_funnel(&funnel, &scope)
                    .await
                    .with_context(|| format!("analyzing funnel '{}'", funnel.id))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&metrics)?);
                } else {
                    print_table(&funnel, &metrics);
                }
            }
        }
    }

    Ok(())
}

fn print_table(funnel: &FunnelConfig, metrics: &[FunnelMetrics]) {
    println!("{} ({})", funnel.name, funnel.id);
    if metrics.is_empty() {
        println!("  no steps");
        return;
    }
    for m in metrics {
        let label = funnel
            .steps
            .get(m.step.saturating_sub(1))
            .map_or_else(|| format!("Step {}", m.step), |s| s.label(m.step));
        println!(
            "  {:>2}. {:<24} {:>8}  conv {:>6}  drop {:>6}",
            m.step,
            label,
            format_visitor_count(m.visitors),
            format_percentage(m.conversion_rate, 1),
            format_percentage(m.drop_off, 1),
        );
    }
}
