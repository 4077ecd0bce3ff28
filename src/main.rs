// =============================================================================
// Alphadesk — Multi-Agent Trading Execution Core, Main Entry Point
// =============================================================================
//
// Each invocation runs exactly one job (a pipeline stage, the full nightly
// sequence, or the intraday monitor) and exits.  An external scheduler owns
// the cadence; no daemon state lives in the core.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod config;
mod engine;
mod executor;
mod factors;
mod monitor;
mod overlay;
mod pipeline;
mod sentiment;
mod store;
mod strategies;
mod types;

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::alpaca::{AlpacaBroker, BrokerMode};
use crate::broker::Broker;
use crate::config::AppConfig;
use crate::store::rows::UserCreds;
use crate::store::Store;

#[derive(Parser)]
#[command(name = "alphadesk", about = "Multi-agent trading execution core")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "alphadesk.json")]
    config: String,

    #[command(subcommand)]
    job: Job,
}

#[derive(Subcommand)]
enum Job {
    /// Run the full nightly pipeline (all five stages in order).
    Nightly,
    /// Refresh derived technicals from stored price history.
    MarketData,
    /// Recombine sentiment scores and append history.
    Sentiment,
    /// Recompute macro indicator statistics.
    MacroData,
    /// Score the stock universe on the five factors.
    FactorScoring,
    /// Run every active agent through the engine and order executor.
    StrategyExecution,
    /// Intraday monitor: enforce stop/target/age exits on live prices.
    Monitor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });
    config.apply_env_overrides();

    info!(
        database = %config.database_path,
        overlay_enabled = config.macro_overlay_enabled,
        "alphadesk starting"
    );

    let store = Store::open(&config.database_path, config.store_busy_timeout_ms)?;
    let now = Utc::now();

    // Each user's stored credentials become one reusable broker connection.
    let broker_timeout = config.broker_timeout_secs;
    let broker_factory = move |creds: &UserCreds| -> Option<Arc<dyn Broker>> {
        let api_key = creds.alpaca_api_key.clone()?;
        let api_secret = creds.alpaca_api_secret.clone()?;
        let mode = if creds.alpaca_paper_mode {
            BrokerMode::Paper
        } else {
            BrokerMode::Live
        };
        Some(Arc::new(AlpacaBroker::new(api_key, api_secret, mode, broker_timeout)))
    };

    match cli.job {
        Job::Nightly => {
            let summaries =
                pipeline::run_nightly_pipeline(&store, &config, &broker_factory, now).await;
            for summary in &summaries {
                println!("{}", serde_json::to_string(summary)?);
            }
        }
        Job::MarketData => {
            let summary = pipeline::run_market_data_stage(&store);
            println!("{}", serde_json::to_string(&summary)?);
        }
        Job::Sentiment => {
            let summary = pipeline::run_sentiment_stage(&store, &config, now);
            println!("{}", serde_json::to_string(&summary)?);
        }
        Job::MacroData => {
            let summary = pipeline::run_macro_data_stage(&store, now);
            println!("{}", serde_json::to_string(&summary)?);
        }
        Job::FactorScoring => {
            let summary = pipeline::run_factor_scoring_stage(&store);
            println!("{}", serde_json::to_string(&summary)?);
        }
        Job::StrategyExecution => {
            let summary =
                pipeline::run_strategy_execution_stage(&store, &config, &broker_factory, now)
                    .await;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Job::Monitor => {
            let summary =
                monitor::run_intraday_monitor(&store, &broker_factory, now.date_naive()).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
    }

    Ok(())
}
