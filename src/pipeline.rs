// =============================================================================
// Pipeline Orchestrator — the five nightly stages
// =============================================================================
//
// Fixed stage order: market-data → sentiment → macro-data → factor-scoring →
// strategy-execution → report-generation.  Each stage reads the store,
// processes, writes back, and returns a structured summary.  A stage failure
// never aborts the stages after it; a per-agent failure never touches the
// other agents.
//
// The strategy-execution stage loads every shared snapshot once and computes
// the macro overlay once, so the whole agent cohort gets identical macro
// treatment within a run.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerFactory};
use crate::config::AppConfig;
use crate::engine::{AgentContext, StrategyEngine};
use crate::executor::OrderExecutor;
use crate::factors::{FactorCalculator, MarketRecord};
use crate::overlay::{
    vol_regime_score, IndicatorStats, MacroRiskOverlay, OverlayInputs, OverlayResult,
    VolRegimeInput,
};
use crate::sentiment::SentimentInput;
use crate::store::rows::{MacroIndicatorRow, StockRow};
use crate::store::Store;
use crate::types::{ActivityType, AgentStatus};

/// Price history window loaded for factor math (~18 months of trading days).
const PRICE_HISTORY_DAYS: usize = 400;

// ---------------------------------------------------------------------------
// Stage summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Partial,
    Warning,
    Error,
}

/// Structured result every stage hands back to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub status: StageStatus,
    pub processed: usize,
    pub failed: usize,
    pub duration_seconds: f64,
    pub first_error: Option<String>,
}

impl StageSummary {
    fn finish(
        stage: &str,
        started: Instant,
        processed: usize,
        failed: usize,
        first_error: Option<String>,
    ) -> Self {
        let status = if first_error.is_some() && processed == 0 {
            StageStatus::Error
        } else if failed > 0 {
            StageStatus::Partial
        } else {
            StageStatus::Success
        };
        let summary = Self {
            stage: stage.to_string(),
            status,
            processed,
            failed,
            duration_seconds: started.elapsed().as_secs_f64(),
            first_error,
        };
        info!(
            stage = %summary.stage,
            status = ?summary.status,
            processed = summary.processed,
            failed = summary.failed,
            duration_s = summary.duration_seconds,
            "stage complete"
        );
        summary
    }
}

// ---------------------------------------------------------------------------
// Nightly pipeline
// ---------------------------------------------------------------------------

/// Run the full nightly pipeline in order.  Downstream stages still run
/// when an earlier stage fails.
pub async fn run_nightly_pipeline(
    store: &Store,
    config: &AppConfig,
    broker_factory: &BrokerFactory<'_>,
    now: DateTime<Utc>,
) -> Vec<StageSummary> {
    info!("nightly pipeline started");

    let mut summaries = Vec::new();
    summaries.push(run_market_data_stage(store));
    summaries.push(run_sentiment_stage(store, config, now));
    summaries.push(run_macro_data_stage(store, now));
    summaries.push(run_factor_scoring_stage(store));
    summaries.push(run_strategy_execution_stage(store, config, broker_factory, now).await);
    summaries.push(run_report_stage());

    info!("nightly pipeline finished");
    summaries
}

// ---------------------------------------------------------------------------
// Stage 1 — market data (derived technicals)
// ---------------------------------------------------------------------------

/// Refresh each stock's price and moving averages from its stored closing
/// history.  External price fetching happens upstream; this stage only
/// derives.
pub fn run_market_data_stage(store: &Store) -> StageSummary {
    let started = Instant::now();
    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut first_error: Option<String> = None;

    let (stocks, history) = match load_stocks_and_history(store) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "market-data stage failed to load");
            return StageSummary::finish("market_data", started, 0, 0, Some(e.to_string()));
        }
    };

    for stock in &stocks {
        let prices = match history.get(&stock.symbol) {
            Some(p) if !p.is_empty() => p,
            _ => continue,
        };

        let price = prices.last().copied();
        let ma = |n: usize| -> Option<f64> {
            if prices.len() >= n {
                Some(prices[prices.len() - n..].iter().sum::<f64>() / n as f64)
            } else {
                None
            }
        };

        match store.update_stock_technicals(&stock.symbol, price, ma(30), ma(100), ma(200)) {
            Ok(()) => processed += 1,
            Err(e) => {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    StageSummary::finish("market_data", started, processed, failed, first_error)
}

// ---------------------------------------------------------------------------
// Stage 2 — sentiment (recombination + history append)
// ---------------------------------------------------------------------------

/// Fold news and social scores into the combined sentiment using the
/// configured weights, derive velocity against the previous observation,
/// and append today's sentiment_history rows.
pub fn run_sentiment_stage(store: &Store, config: &AppConfig, now: DateTime<Utc>) -> StageSummary {
    let started = Instant::now();
    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut first_error: Option<String> = None;

    let stocks = match store.stocks() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "sentiment stage failed to load stocks");
            return StageSummary::finish("sentiment", started, 0, 0, Some(e.to_string()));
        }
    };
    let previous = store.latest_sentiment_before(now).unwrap_or_default();

    for stock in &stocks {
        let (news, social) = (stock.news_sentiment, stock.social_sentiment);
        if news.is_none() && social.is_none() {
            continue;
        }

        let mut weight_sum = 0.0;
        let mut combined = 0.0;
        if let Some(n) = news {
            combined += n * config.sentiment_news_weight;
            weight_sum += config.sentiment_news_weight;
        }
        if let Some(s) = social {
            combined += s * config.sentiment_social_weight;
            weight_sum += config.sentiment_social_weight;
        }
        if weight_sum <= 0.0 {
            continue;
        }
        let combined = (combined / weight_sum).clamp(-100.0, 100.0);

        // Velocity: day-over-day change in the combined reading.
        let velocity = previous
            .get(&stock.symbol)
            .map(|prev| combined - prev)
            .unwrap_or(0.0);

        let result = store
            .update_stock_sentiment(&stock.symbol, combined, velocity)
            .and_then(|_| store.append_sentiment_history(&stock.symbol, combined, now));
        match result {
            Ok(()) => processed += 1,
            Err(e) => {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    StageSummary::finish("sentiment", started, processed, failed, first_error)
}

// ---------------------------------------------------------------------------
// Stage 3 — macro data (series statistics)
// ---------------------------------------------------------------------------

/// Recompute z-score, percentile, and rate-of-change for every stored macro
/// indicator series and upsert the row (conflict on indicator_name).
pub fn run_macro_data_stage(store: &Store, now: DateTime<Utc>) -> StageSummary {
    let started = Instant::now();
    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut first_error: Option<String> = None;

    let indicators = match store.macro_indicators() {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "macro stage failed to load indicators");
            return StageSummary::finish("macro_data", started, 0, 0, Some(e.to_string()));
        }
    };

    for name in indicators.keys() {
        let series = match store.macro_series(name) {
            Ok(s) if s.len() >= 2 => s,
            Ok(_) => continue,
            Err(e) => {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
                continue;
            }
        };

        let last = match series.last() {
            Some(v) => *v,
            None => continue,
        };
        let mean = series.iter().sum::<f64>() / series.len() as f64;
        let variance =
            series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / series.len() as f64;
        let std = variance.sqrt();
        let z_score = if std > 0.0 { (last - mean) / std } else { 0.0 };
        let percentile =
            series.iter().filter(|v| **v < last).count() as f64 / series.len() as f64 * 100.0;

        let roc_window = 5.min(series.len() - 1);
        let base = series[series.len() - 1 - roc_window];
        let rate_of_change = if base.abs() > f64::EPSILON {
            (last - base) / base.abs()
        } else {
            0.0
        };

        let row = MacroIndicatorRow {
            indicator_name: name.clone(),
            value: Some(last),
            z_score,
            percentile,
            rate_of_change,
            recorded_at: now,
        };
        match store.upsert_macro_indicator(&row, &series) {
            Ok(()) => processed += 1,
            Err(e) => {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    StageSummary::finish("macro_data", started, processed, failed, first_error)
}

// ---------------------------------------------------------------------------
// Stage 4 — factor scoring
// ---------------------------------------------------------------------------

/// Score the whole universe with equal factor weights and persist the five
/// factor percentiles plus the composite.
pub fn run_factor_scoring_stage(store: &Store) -> StageSummary {
    let started = Instant::now();
    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut first_error: Option<String> = None;

    let market = match load_market_records(store) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "factor stage failed to load market data");
            return StageSummary::finish("factor_scoring", started, 0, 0, Some(e.to_string()));
        }
    };

    let calculator = FactorCalculator::new(true);
    let scores = calculator.calculate_all(&market, None);

    for (symbol, fs) in &scores {
        match store.update_stock_factors(
            symbol,
            fs.momentum_score,
            fs.value_score,
            fs.quality_score,
            fs.dividend_score,
            fs.volatility_score,
            fs.composite_score,
        ) {
            Ok(()) => processed += 1,
            Err(e) => {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    StageSummary::finish("factor_scoring", started, processed, failed, first_error)
}

// ---------------------------------------------------------------------------
// Stage 5 — strategy execution
// ---------------------------------------------------------------------------

/// Run every active agent through the engine and the order executor.
///
/// Shared snapshots (market, sentiment, macro, overlay) are loaded once;
/// each agent then works on its own copies.  One broker per user is reused
/// across that user's agents.
pub async fn run_strategy_execution_stage(
    store: &Store,
    config: &AppConfig,
    broker_factory: &BrokerFactory<'_>,
    now: DateTime<Utc>,
) -> StageSummary {
    let started = Instant::now();
    let today = now.date_naive();
    let mut processed = 0usize;
    let mut failed = 0usize;
    let mut first_error: Option<String> = None;

    let agents = match store.active_agents() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "failed to load active agents");
            return StageSummary::finish(
                "strategy_execution",
                started,
                0,
                0,
                Some(e.to_string()),
            );
        }
    };
    if agents.is_empty() {
        info!("no active agents to process");
        return StageSummary::finish("strategy_execution", started, 0, 0, None);
    }

    // ── Shared snapshots, loaded once for the whole cohort ──────────────
    let market = match load_market_records(store) {
        Ok(m) => m,
        Err(e) => {
            return StageSummary::finish(
                "strategy_execution",
                started,
                0,
                agents.len(),
                Some(e.to_string()),
            )
        }
    };
    let sentiment = sentiment_inputs_from_market(store);
    let cutoff = now - Duration::days(config.sentiment_lookback_days);
    let sentiment_history = store.sentiment_history_since(cutoff).unwrap_or_default();

    // Short interest is loaded with the cohort snapshot for report and
    // audit consumers; the overlay itself works on portfolio-level signals.
    let short_interest = store.latest_short_interest().unwrap_or_default();
    info!(
        stocks = market.len(),
        with_sentiment = sentiment
            .values()
            .filter(|s| s.combined_sentiment.is_some())
            .count(),
        short_interest = short_interest.len(),
        "cohort snapshot loaded"
    );

    // ── Macro overlay, computed once and shared ─────────────────────────
    let overlay: Option<OverlayResult> = if config.macro_overlay_enabled {
        let inputs = build_overlay_inputs(store, today);
        let result = MacroRiskOverlay::new(config).compute(&inputs);
        if let Err(e) = store.insert_overlay_state(
            result.risk_scale_factor,
            result.composite_risk_score,
            &result.regime_label,
            &serde_json::json!(result.signal_contributions),
            &serde_json::json!(result.warnings),
        ) {
            warn!(error = %e, "failed to persist overlay state");
        }
        Some(result)
    } else {
        info!("macro overlay disabled — no scaling applied");
        None
    };

    // One broker per user, reused across that user's agents.
    let mut brokers: HashMap<String, Option<Arc<dyn Broker>>> = HashMap::new();

    for agent in &agents {
        let positions = match store.open_positions(&agent.id) {
            Ok(p) => p,
            Err(e) => {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
                continue;
            }
        };
        let last_rebalance_at = store.last_rebalance_at(&agent.id).unwrap_or(None);

        let ctx = AgentContext {
            agent_id: agent.id.clone(),
            user_id: agent.user_id.clone(),
            strategy_type: agent.strategy_type.clone(),
            strategy_params: agent.strategy_params.clone(),
            risk_params: agent.risk_params.clone(),
            allocated_capital: agent.allocated_capital,
            cash_balance: agent.cash_balance,
            current_positions: positions,
            last_rebalance_at,
        };

        let result = StrategyEngine::execute_for_agent(
            &ctx,
            &market,
            &sentiment,
            &sentiment_history,
            overlay.as_ref(),
            today,
            now,
        );

        if let Some(reason) = &result.error {
            warn!(agent = %agent.id, name = %agent.name, reason = %reason, "agent skipped");
            failed += 1;
            first_error.get_or_insert_with(|| reason.clone());
            continue;
        }

        let broker = brokers
            .entry(agent.user_id.clone())
            .or_insert_with(|| {
                store
                    .user_broker_creds(&agent.user_id)
                    .ok()
                    .flatten()
                    .and_then(|creds| broker_factory(&creds))
            })
            .clone();

        match OrderExecutor::execute_and_sync(
            store,
            broker.as_deref(),
            agent,
            &result,
            &market,
            today,
        )
        .await
        {
            Ok(report) => {
                processed += 1;
                info!(
                    agent = %agent.id,
                    name = %agent.name,
                    actions = result.order_actions.len(),
                    orders = report.orders_submitted,
                    failed_orders = report.orders_failed,
                    deferred = report.deferred_market_closed,
                    regime = %result.regime,
                    "agent processed"
                );
            }
            Err(e) => {
                failed += 1;
                error!(agent = %agent.id, error = %e, "execution failed");
                first_error.get_or_insert_with(|| e.to_string());
            }
        }

        // A tripped breaker pauses the agent until its owner intervenes.
        if result.regime == "circuit_breaker" {
            if let Err(e) = store.update_agent_status(&agent.id, AgentStatus::Paused) {
                warn!(agent = %agent.id, error = %e, "failed to pause agent");
            }
            let _ = store.insert_activity(
                &agent.id,
                ActivityType::Paused,
                None,
                &serde_json::json!({ "reason": "circuit_breaker" }),
            );
        }
    }

    StageSummary::finish("strategy_execution", started, processed, failed, first_error)
}

// ---------------------------------------------------------------------------
// Stage 6 — report generation (delegated)
// ---------------------------------------------------------------------------

/// Report generation lives in the reporting service; the pipeline slot only
/// records that the hand-off point was reached.
pub fn run_report_stage() -> StageSummary {
    let started = Instant::now();
    info!("report generation delegated to the reporting service");
    StageSummary::finish("report_generation", started, 0, 0, None)
}

// ---------------------------------------------------------------------------
// Snapshot loaders
// ---------------------------------------------------------------------------

fn load_stocks_and_history(
    store: &Store,
) -> Result<(Vec<StockRow>, HashMap<String, Vec<f64>>)> {
    let stocks = store.stocks()?;
    let history = store.price_history_map(PRICE_HISTORY_DAYS)?;
    Ok((stocks, history))
}

/// Market records for the full universe, with price history attached.
pub fn load_market_records(store: &Store) -> Result<HashMap<String, MarketRecord>> {
    let (stocks, mut history) = load_stocks_and_history(store)?;

    let mut market = HashMap::with_capacity(stocks.len());
    for stock in stocks {
        let price_history = history.remove(&stock.symbol).unwrap_or_default();
        market.insert(
            stock.symbol.clone(),
            MarketRecord {
                symbol: stock.symbol.clone(),
                current_price: stock.price.or_else(|| price_history.last().copied()),
                price_history,
                pe_ratio: stock.pe_ratio,
                pb_ratio: stock.pb_ratio,
                roe: stock.roe,
                profit_margin: stock.profit_margin,
                debt_to_equity: stock.debt_to_equity,
                dividend_yield: stock.dividend_yield,
                dividend_growth_5y: stock.dividend_growth_5y,
                ma_30: stock.ma_30,
                ma_100: stock.ma_100,
                ma_200: stock.ma_200,
                atr: stock.atr,
                sector: stock.sector.clone(),
                composite_score: stock.composite_score,
                integrated_composite: None,
            },
        );
    }
    Ok(market)
}

/// Sentiment inputs straight off the stocks table.
fn sentiment_inputs_from_market(store: &Store) -> HashMap<String, SentimentInput> {
    let mut inputs = HashMap::new();
    if let Ok(stocks) = store.stocks() {
        for stock in stocks {
            inputs.insert(
                stock.symbol.clone(),
                SentimentInput {
                    symbol: stock.symbol,
                    news_sentiment: stock.news_sentiment,
                    social_sentiment: stock.social_sentiment,
                    combined_sentiment: stock.combined_sentiment,
                    velocity: stock.sentiment_velocity,
                    ..Default::default()
                },
            );
        }
    }
    inputs
}

/// Overlay inputs from the freshest macro, VIX, and insider rows.
fn build_overlay_inputs(store: &Store, today: NaiveDate) -> OverlayInputs {
    let indicators = store.macro_indicators().unwrap_or_default();

    let stats = |name: &str| -> Option<IndicatorStats> {
        indicators.get(name).map(|row| IndicatorStats {
            current: row.value,
            z_score: row.z_score,
            rate_of_change: row.rate_of_change,
        })
    };

    // VIX level and term structure drive the volatility regime reading.
    let vol_regime = indicators.get("vix").and_then(|vix_row| {
        let vix = vix_row.value?;
        let term_structure = indicators
            .get("vix3m")
            .and_then(|row| row.value)
            .map(|vix3m| if vix > 0.0 { (vix3m - vix) / vix } else { 0.0 })
            .unwrap_or(0.0);
        Some(VolRegimeInput {
            vix_current: Some(vix),
            regime_score: vol_regime_score(vix, term_structure),
        })
    });

    let insider = store.latest_insider_signals().unwrap_or_default();
    if !insider.is_empty() && insider.values().all(|row| row.pending_xml_parse) {
        // Transaction codes are not parsed from the Form-4 XML yet, so the
        // feed reports every filing as a buy and net sentiment saturates.
        warn!(
            symbols = insider.len(),
            "insider signal is filing-count only (transaction-code parsing pending) — \
             breadth reads saturated"
        );
    }
    let insider_net_sentiment = insider.values().map(|row| row.net_sentiment).collect();

    OverlayInputs {
        credit_spread: stats("credit_spread"),
        yield_curve: stats("yield_curve"),
        vol_regime,
        insider_net_sentiment,
        today,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::rows::{AgentRow, RiskParams, StrategyParams, UserCreds};
    use crate::types::AgentStatus;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 31, 2, 0, 0).unwrap()
    }

    fn seed_stock(store: &Store, symbol: &str, days: usize, start: f64, gain: f64) {
        store
            .upsert_stock(&StockRow {
                symbol: symbol.to_string(),
                price: Some(start + days as f64 * gain),
                sector: Some("Technology".to_string()),
                pe_ratio: Some(20.0),
                pb_ratio: Some(3.0),
                roe: Some(0.18),
                profit_margin: Some(0.12),
                debt_to_equity: Some(0.8),
                news_sentiment: Some(30.0),
                social_sentiment: Some(20.0),
                ..Default::default()
            })
            .unwrap();

        let first = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        for i in 0..days {
            let date = first + Duration::days(i as i64);
            store
                .insert_price_row(symbol, date, start + i as f64 * gain)
                .unwrap();
        }
    }

    fn no_broker() -> impl Fn(&UserCreds) -> Option<Arc<dyn Broker>> + Send + Sync {
        |_| None
    }

    #[test]
    fn market_data_stage_derives_moving_averages() {
        let store = Store::open_in_memory().unwrap();
        seed_stock(&store, "AAPL", 250, 100.0, 0.5);

        let summary = run_market_data_stage(&store);
        assert_eq!(summary.status, StageStatus::Success);
        assert_eq!(summary.processed, 1);

        let stocks = store.stocks().unwrap();
        let aapl = stocks.iter().find(|s| s.symbol == "AAPL").unwrap();
        assert!(aapl.ma_30.is_some());
        assert!(aapl.ma_100.is_some());
        assert!(aapl.ma_200.is_some());
        // Rising series: short MA above long MA.
        assert!(aapl.ma_30.unwrap() > aapl.ma_200.unwrap());
    }

    #[test]
    fn sentiment_stage_combines_and_tracks_velocity() {
        let store = Store::open_in_memory().unwrap();
        let config = AppConfig::default();
        seed_stock(&store, "AAPL", 10, 100.0, 0.0);

        // Prior observation for velocity.
        store
            .append_sentiment_history("AAPL", 10.0, now() - Duration::days(1))
            .unwrap();

        let summary = run_sentiment_stage(&store, &config, now());
        assert_eq!(summary.status, StageStatus::Success);
        assert_eq!(summary.processed, 1);

        let stocks = store.stocks().unwrap();
        let aapl = stocks.iter().find(|s| s.symbol == "AAPL").unwrap();
        // news 30 × 0.4 + social 20 × 0.3 over 0.7 → ~25.71.
        let combined = aapl.combined_sentiment.unwrap();
        assert!((combined - (30.0 * 0.4 + 20.0 * 0.3) / 0.7).abs() < 1e-6);
        assert!((aapl.sentiment_velocity.unwrap() - (combined - 10.0)).abs() < 1e-6);

        // Today's row landed in sentiment_history.
        let series = store
            .sentiment_history_since(now() - Duration::days(7))
            .unwrap();
        assert_eq!(series["AAPL"].len(), 2);
    }

    #[test]
    fn macro_stage_recomputes_series_stats() {
        let store = Store::open_in_memory().unwrap();
        let series = vec![3.0, 3.1, 3.0, 3.2, 3.1, 4.5];
        store
            .upsert_macro_indicator(
                &MacroIndicatorRow {
                    indicator_name: "credit_spread".to_string(),
                    value: None,
                    z_score: 0.0,
                    percentile: 50.0,
                    rate_of_change: 0.0,
                    recorded_at: now(),
                },
                &series,
            )
            .unwrap();

        let summary = run_macro_data_stage(&store, now());
        assert_eq!(summary.processed, 1);

        let rows = store.macro_indicators().unwrap();
        let credit = &rows["credit_spread"];
        assert_eq!(credit.value, Some(4.5));
        assert!(credit.z_score > 1.0); // 4.5 is a clear outlier
        assert!(credit.percentile > 80.0);
        assert!(credit.rate_of_change > 0.0);
    }

    #[test]
    fn factor_stage_persists_scores() {
        let store = Store::open_in_memory().unwrap();
        seed_stock(&store, "AAPL", 260, 100.0, 0.5);
        seed_stock(&store, "MSFT", 260, 200.0, 0.1);

        let summary = run_factor_scoring_stage(&store);
        assert_eq!(summary.status, StageStatus::Success);
        assert_eq!(summary.processed, 2);

        let stocks = store.stocks().unwrap();
        for stock in &stocks {
            let composite = stock.composite_score.unwrap();
            assert!((0.0..=100.0).contains(&composite));
        }
        // The faster riser carries the higher momentum score.
        let aapl = stocks.iter().find(|s| s.symbol == "AAPL").unwrap();
        let msft = stocks.iter().find(|s| s.symbol == "MSFT").unwrap();
        assert!(aapl.momentum_score.unwrap() > msft.momentum_score.unwrap());
    }

    #[tokio::test]
    async fn strategy_execution_without_credentials_logs_activity() {
        let store = Store::open_in_memory().unwrap();
        let config = AppConfig::default();
        seed_stock(&store, "AAPL", 260, 100.0, 0.5);
        seed_stock(&store, "MSFT", 260, 200.0, 0.1);
        run_factor_scoring_stage(&store);

        store
            .insert_agent(&AgentRow {
                id: "a1".to_string(),
                user_id: "u1".to_string(),
                name: "Momentum Agent".to_string(),
                persona: "analytical".to_string(),
                status: AgentStatus::Active,
                strategy_type: "momentum".to_string(),
                strategy_params: StrategyParams::default(),
                risk_params: RiskParams::default(),
                allocated_capital: 10_000.0,
                cash_balance: 10_000.0,
                time_horizon_days: 365,
                start_date: None,
                end_date: None,
            })
            .unwrap();
        // User row with no credentials.
        store
            .insert_user(
                "u1",
                &UserCreds {
                    alpaca_api_key: None,
                    alpaca_api_secret: None,
                    alpaca_paper_mode: true,
                },
            )
            .unwrap();

        let factory = no_broker();
        let summary = run_strategy_execution_stage(&store, &config, &factory, now()).await;
        assert_eq!(summary.status, StageStatus::Success);
        assert_eq!(summary.processed, 1);

        // Rebalance activity recorded even though nothing went to a broker.
        assert!(store.last_rebalance_at("a1").unwrap().is_some());
        // No broker confirmation → no position rows created.
        assert!(store.open_positions("a1").unwrap().is_empty());
        // Overlay state persisted for report consumers; with only the
        // seasonality signal available the row records a neutral scale.
        let state = store.latest_overlay_state().unwrap().unwrap();
        assert_eq!(state.risk_scale_factor, 1.0);
        assert_eq!(state.regime_label, "insufficient_data");
    }

    #[tokio::test]
    async fn agent_failures_are_isolated() {
        let store = Store::open_in_memory().unwrap();
        let config = AppConfig::default();
        seed_stock(&store, "AAPL", 260, 100.0, 0.5);

        for (id, strategy_type) in [("good", "momentum"), ("bad", "not_a_strategy")] {
            store
                .insert_agent(&AgentRow {
                    id: id.to_string(),
                    user_id: "u1".to_string(),
                    name: id.to_string(),
                    persona: "analytical".to_string(),
                    status: AgentStatus::Active,
                    strategy_type: strategy_type.to_string(),
                    strategy_params: StrategyParams::default(),
                    risk_params: RiskParams::default(),
                    allocated_capital: 10_000.0,
                    cash_balance: 10_000.0,
                    time_horizon_days: 365,
                    start_date: None,
                    end_date: None,
                })
                .unwrap();
        }

        let factory = no_broker();
        let summary = run_strategy_execution_stage(&store, &config, &factory, now()).await;
        assert_eq!(summary.status, StageStatus::Partial);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.first_error.unwrap().contains("Unknown strategy_type"));

        // The healthy agent still rebalanced.
        assert!(store.last_rebalance_at("good").unwrap().is_some());
        assert!(store.last_rebalance_at("bad").unwrap().is_none());
    }

    #[tokio::test]
    async fn circuit_breaker_pauses_the_agent() {
        use crate::store::rows::NewPosition;
        use crate::types::PositionSide;

        let store = Store::open_in_memory().unwrap();
        let config = AppConfig::default();
        seed_stock(&store, "AAPL", 30, 100.0, 0.0);

        store
            .insert_agent(&AgentRow {
                id: "a1".to_string(),
                user_id: "u1".to_string(),
                name: "Drawdown Agent".to_string(),
                persona: "conservative".to_string(),
                status: AgentStatus::Active,
                strategy_type: "momentum".to_string(),
                strategy_params: StrategyParams::default(),
                risk_params: RiskParams::default(),
                allocated_capital: 10_000.0,
                cash_balance: 0.0,
                time_horizon_days: 365,
                start_date: None,
                end_date: None,
            })
            .unwrap();

        // Open position underwater far past the 20% drawdown limit.
        let id = store
            .insert_position(&NewPosition {
                agent_id: "a1".to_string(),
                ticker: "AAPL".to_string(),
                side: PositionSide::Long,
                shares: 100.0,
                entry_price: 100.0,
                entry_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                entry_rationale: "entry".to_string(),
                current_price: Some(70.0),
                stop_loss_price: None,
                target_price: None,
                max_holding_days: None,
                entry_order_id: None,
                stop_order_id: None,
                tp_order_id: None,
            })
            .unwrap();
        store
            .update_position_price(id, 70.0, -3_000.0, -30.0)
            .unwrap();

        let factory = no_broker();
        let summary = run_strategy_execution_stage(&store, &config, &factory, now()).await;
        assert_eq!(summary.processed, 1);

        // Liquidated in the book and paused for the owner to review.
        assert!(store.open_positions("a1").unwrap().is_empty());
        assert!(store.active_agents().unwrap().is_empty());
    }

    #[test]
    fn overlay_inputs_read_macro_and_insider_rows() {
        use crate::store::rows::InsiderSignalRow;

        let store = Store::open_in_memory().unwrap();
        store
            .upsert_macro_indicator(
                &MacroIndicatorRow {
                    indicator_name: "vix".to_string(),
                    value: Some(34.0),
                    z_score: 1.2,
                    percentile: 85.0,
                    rate_of_change: 0.15,
                    recorded_at: now(),
                },
                &[18.0, 22.0, 28.0, 34.0],
            )
            .unwrap();
        store
            .upsert_macro_indicator(
                &MacroIndicatorRow {
                    indicator_name: "vix3m".to_string(),
                    value: Some(30.0),
                    z_score: 0.8,
                    percentile: 70.0,
                    rate_of_change: 0.05,
                    recorded_at: now(),
                },
                &[22.0, 24.0, 27.0, 30.0],
            )
            .unwrap();
        // The Form-4 feed before transaction-code parsing: every row reads
        // as a buy, so breadth saturates at +100.
        store
            .insert_insider_signal(&InsiderSignalRow {
                symbol: "AAPL".to_string(),
                filing_count: 6,
                buy_ratio: 1.0,
                cluster_score: 60.0,
                net_sentiment: 100.0,
                pending_xml_parse: true,
                recorded_at: now(),
            })
            .unwrap();

        let inputs = build_overlay_inputs(&store, now().date_naive());
        let vol = inputs.vol_regime.unwrap();
        assert_eq!(vol.vix_current, Some(34.0));
        // Elevated VIX in backwardation reads risk-off.
        assert!(vol.regime_score < 0.0);
        assert_eq!(inputs.insider_net_sentiment, vec![100.0]);
        assert!(inputs.credit_spread.is_none());
    }

    #[tokio::test]
    async fn nightly_pipeline_runs_all_stages() {
        let store = Store::open_in_memory().unwrap();
        let config = AppConfig::default();
        seed_stock(&store, "AAPL", 260, 100.0, 0.5);

        let factory = no_broker();
        let summaries = run_nightly_pipeline(&store, &config, &factory, now()).await;
        assert_eq!(summaries.len(), 6);
        let stages: Vec<&str> = summaries.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "market_data",
                "sentiment",
                "macro_data",
                "factor_scoring",
                "strategy_execution",
                "report_generation"
            ]
        );
        // No agents: strategy execution is an empty success.
        assert!(summaries.iter().all(|s| s.status != StageStatus::Error));
    }
}
