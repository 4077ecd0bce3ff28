// =============================================================================
// Strategy Engine — per-agent execution pipeline
// =============================================================================
//
// Maps an agent's configuration to the strategy framework, runs the
// sentiment-factor integration, and turns the resulting target portfolio
// into concrete order actions.
//
// Per-agent pipeline, short-circuiting on the first triggering safety pass:
//   0.  Drawdown circuit breaker (liquidate and halt)
//   0b. Rebalance frequency gate (skip with reason)
//   1.  Resolve agent config → strategy preset
//   2.  Temporal enrichment + factor scoring + sentiment integration
//   3.  Strategy execution (integrated composites injected per-agent)
//   4.  Cash-constrained sizing of new entries
//   5.  Macro overlay scaling of every target weight
//   6.  Diff against held positions → order actions
//   7.  Stop-loss / take-profit / aging overrides
//   8.  Thesis enrichment of buy/increase reasons
//
// The engine is pure CPU: every snapshot it needs is supplied by the
// pipeline, so one agent's run never touches shared mutable state.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::factors::{FactorCalculator, MarketRecord};
use crate::overlay::OverlayResult;
use crate::sentiment::integrator::{
    default_factor_weights, detect_regime, SentimentFactorIntegrator,
};
use crate::sentiment::{temporal, SentimentInput};
use crate::store::rows::{PositionRow, RiskParams, StrategyParams};
use crate::strategies::presets::get_preset;
use crate::strategies::{StrategyOutput, StrategyRegistry, StrategyType, TargetPosition};
use crate::types::{ActionKind, PositionSide};

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Everything needed to execute a strategy for one agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: String,
    pub user_id: String,
    pub strategy_type: String,
    pub strategy_params: StrategyParams,
    pub risk_params: RiskParams,
    pub allocated_capital: f64,
    pub cash_balance: f64,
    pub current_positions: Vec<PositionRow>,
    /// Timestamp of the most recent rebalance activity, loaded by the
    /// pipeline so the engine itself never touches the store.
    pub last_rebalance_at: Option<DateTime<Utc>>,
}

/// A concrete order action produced by diffing recommended vs held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAction {
    pub symbol: String,
    pub action: ActionKind,
    pub target_weight: f64,
    pub current_weight: f64,
    pub signal_strength: f64,
    pub reason: String,
}

/// Output of a strategy execution for one agent.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub agent_id: String,
    pub strategy_output: Option<StrategyOutput>,
    pub integrated_scores: HashMap<String, f64>,
    pub order_actions: Vec<OrderAction>,
    pub regime: String,
    pub macro_overlay: Option<OverlayResult>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionResult {
    fn skipped(agent_id: &str, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            strategy_output: None,
            integrated_scores: HashMap::new(),
            order_actions: Vec::new(),
            regime: "neutral".to_string(),
            macro_overlay: None,
            error: Some(reason),
            executed_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Weight difference below which a held position is left alone.
const HOLD_BAND: f64 = 0.01;

pub struct StrategyEngine;

impl StrategyEngine {
    /// Run the full per-agent pipeline.  `today` and `now` are injected so
    /// runs are reproducible and the aging/gate math is testable.
    pub fn execute_for_agent(
        ctx: &AgentContext,
        market_data: &HashMap<String, MarketRecord>,
        sentiment_data: &HashMap<String, SentimentInput>,
        sentiment_history: &HashMap<String, Vec<f64>>,
        overlay: Option<&OverlayResult>,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> ExecutionResult {
        // ── Step 0: drawdown circuit breaker ────────────────────────────
        if let Some(result) = Self::check_drawdown_breaker(ctx, market_data, now) {
            return result;
        }

        // ── Step 0b: rebalance frequency gate ───────────────────────────
        if let Some(skip_reason) = Self::check_rebalance_frequency(ctx, now) {
            info!(agent = %ctx.agent_id, reason = %skip_reason, "skipping agent");
            return ExecutionResult::skipped(&ctx.agent_id, skip_reason, now);
        }

        // ── Step 1: resolve strategy config from agent settings ─────────
        let mut config = match get_preset(
            &ctx.strategy_type,
            format!("agent-{}", ctx.agent_id),
            ctx.strategy_params.universe.clone(),
            ctx.strategy_params.exclude_tickers.clone(),
            ctx.strategy_params.max_positions,
        ) {
            Some(c) => c,
            None => {
                return ExecutionResult::skipped(
                    &ctx.agent_id,
                    format!("Unknown strategy_type: {}", ctx.strategy_type),
                    now,
                )
            }
        };
        if let Some(weight) = ctx.strategy_params.sentiment_weight {
            config.sentiment.sentiment_alpha_weight = weight;
        }

        info!(
            agent = %ctx.agent_id,
            user = %ctx.user_id,
            strategy = %config.strategy_type,
            sentiment_mode = ?config.sentiment.mode,
            "resolved strategy config"
        );

        // ── Step 2: data assembly ───────────────────────────────────────
        // Temporal enrichment on a per-agent copy of the sentiment map.
        let mut sentiment = sentiment_data.clone();
        temporal::enrich(&mut sentiment, sentiment_history);

        // Factor scores with strategy-specific weights, so the composite
        // reflects this strategy's priorities.
        let strategy_weights = match config.strategy_type {
            StrategyType::CrossSectionalFactor => {
                Some(default_factor_weights(&ctx.strategy_type))
            }
            _ => None,
        };
        let calculator = FactorCalculator::new(true);
        let factor_scores = calculator.calculate_all(market_data, strategy_weights.as_ref());

        let integrator = SentimentFactorIntegrator::new(
            &ctx.strategy_type,
            ctx.strategy_params.sentiment_weight.unwrap_or(0.25),
        );
        let integrated = integrator.integrate(&factor_scores, &sentiment, market_data);

        // Inject integrated composites into a per-agent shallow copy: the
        // composite is agent-specific (strategy factor weights), so the
        // shared snapshot must never be aliased across agents.
        let mut agent_market: HashMap<String, MarketRecord> = market_data.clone();
        for (symbol, score) in &integrated {
            if let Some(record) = agent_market.get_mut(symbol) {
                record.integrated_composite = Some(score.composite_score);
            }
        }

        let regime = detect_regime(&sentiment).label;
        let integrated_scores: HashMap<String, f64> = integrated
            .iter()
            .map(|(symbol, score)| (symbol.clone(), score.composite_score))
            .collect();

        // ── Step 3: strategy execution ──────────────────────────────────
        // Cross-sectional strategies rank on integrated_composite, which
        // already folds sentiment in; running their strategy-level overlay
        // as well would double-count it.  Advanced strategies never read
        // integrated_composite and keep their designed modes (the
        // volatility-premium crisis gate depends on FILTER staying live).
        if config.strategy_type == StrategyType::CrossSectionalFactor {
            config.sentiment.mode = crate::strategies::SentimentMode::Disabled;
        }

        let positions_by_symbol: HashMap<String, PositionRow> = ctx
            .current_positions
            .iter()
            .map(|p| (p.ticker.clone(), p.clone()))
            .collect();

        let strategy = StrategyRegistry::create(config);
        let mut output = strategy.execute(&agent_market, &sentiment, &positions_by_symbol);

        // ── Step 4: cash-constrained sizing ─────────────────────────────
        Self::constrain_to_cash(&mut output, ctx);

        // ── Step 5: macro overlay ───────────────────────────────────────
        if let Some(overlay) = overlay {
            if overlay.risk_scale_factor != 1.0 {
                for pos in &mut output.positions {
                    pos.target_weight *= overlay.risk_scale_factor;
                }
                info!(
                    agent = %ctx.agent_id,
                    scale = overlay.risk_scale_factor,
                    macro_regime = %overlay.regime_label,
                    composite = overlay.composite_risk_score,
                    "macro overlay applied"
                );
                for warning in &overlay.warnings {
                    warn!(agent = %ctx.agent_id, "macro: {}", warning);
                }
            }
        }

        // ── Step 6: diff recommended vs held ────────────────────────────
        let mut order_actions = Self::diff_positions(
            &output,
            &ctx.current_positions,
            ctx.allocated_capital,
            &agent_market,
        );

        // ── Step 7: exit overrides, in priority order ───────────────────
        let mut overridden: HashSet<String> = HashSet::new();

        let stop_exits = Self::check_stop_losses(ctx, &agent_market);
        if !stop_exits.is_empty() {
            warn!(
                agent = %ctx.agent_id,
                count = stop_exits.len(),
                "positions breached stop-loss"
            );
            Self::merge_exits(&mut order_actions, stop_exits, &mut overridden);
        }

        let tp_exits = Self::check_take_profits(ctx, &agent_market, &overridden);
        if !tp_exits.is_empty() {
            info!(
                agent = %ctx.agent_id,
                count = tp_exits.len(),
                "positions hit take-profit"
            );
            Self::merge_exits(&mut order_actions, tp_exits, &mut overridden);
        }

        let age_exits = Self::check_position_aging(ctx, &agent_market, today, &overridden);
        if !age_exits.is_empty() {
            info!(
                agent = %ctx.agent_id,
                count = age_exits.len(),
                "positions exceeded time horizon"
            );
            Self::merge_exits(&mut order_actions, age_exits, &mut overridden);
        }

        // ── Step 8: thesis enrichment ───────────────────────────────────
        Self::enrich_trade_theses(
            &mut order_actions,
            &output,
            &integrated_scores,
            &regime,
            &agent_market,
        );

        info!(
            agent = %ctx.agent_id,
            positions = output.positions.len(),
            actions = order_actions.len(),
            regime = %regime,
            "strategy execution complete"
        );

        ExecutionResult {
            agent_id: ctx.agent_id.clone(),
            strategy_output: Some(output),
            integrated_scores,
            order_actions,
            regime,
            macro_overlay: overlay.cloned(),
            error: None,
            executed_at: now,
        }
    }

    // ------------------------------------------------------------------
    // Step 0 — drawdown circuit breaker
    // ------------------------------------------------------------------

    /// Unrealised loss vs allocated capital; at or past the limit, emit a
    /// full liquidation and halt normal execution.
    fn check_drawdown_breaker(
        ctx: &AgentContext,
        market_data: &HashMap<String, MarketRecord>,
        now: DateTime<Utc>,
    ) -> Option<ExecutionResult> {
        let max_drawdown = ctx.risk_params.max_drawdown_limit;
        if ctx.allocated_capital <= 0.0 || ctx.current_positions.is_empty() {
            return None;
        }

        let total_pnl: f64 = ctx
            .current_positions
            .iter()
            .map(|pos| {
                pos.unrealized_pnl.unwrap_or_else(|| {
                    let price = pos.market_price(
                        market_data.get(&pos.ticker).and_then(|m| m.current_price),
                    );
                    let direction = match pos.side {
                        PositionSide::Long => 1.0,
                        PositionSide::Short => -1.0,
                    };
                    direction * (price - pos.entry_price) * pos.shares
                })
            })
            .sum();

        let drawdown = if total_pnl < 0.0 {
            -total_pnl / ctx.allocated_capital
        } else {
            0.0
        };
        if drawdown < max_drawdown {
            return None;
        }

        warn!(
            agent = %ctx.agent_id,
            drawdown_pct = drawdown * 100.0,
            limit_pct = max_drawdown * 100.0,
            "CIRCUIT BREAKER — halting trading and signalling liquidation"
        );

        let reason = format!(
            "Circuit breaker: drawdown {:.1}% exceeds {:.0}% limit",
            drawdown * 100.0,
            max_drawdown * 100.0
        );

        let sell_actions = ctx
            .current_positions
            .iter()
            .map(|pos| OrderAction {
                symbol: pos.ticker.clone(),
                action: ActionKind::Sell,
                target_weight: 0.0,
                current_weight: Self::position_weight(pos, ctx.allocated_capital, market_data),
                signal_strength: 100.0,
                reason: reason.clone(),
            })
            .collect();

        Some(ExecutionResult {
            agent_id: ctx.agent_id.clone(),
            strategy_output: None,
            integrated_scores: HashMap::new(),
            order_actions: sell_actions,
            regime: "circuit_breaker".to_string(),
            macro_overlay: None,
            error: None,
            executed_at: now,
        })
    }

    // ------------------------------------------------------------------
    // Step 0b — rebalance frequency gate
    // ------------------------------------------------------------------

    /// Skip-reason when insufficient time has passed since the agent's
    /// last rebalance; None when it is time to run.
    fn check_rebalance_frequency(ctx: &AgentContext, now: DateTime<Utc>) -> Option<String> {
        let frequency = ctx.strategy_params.rebalance_frequency;
        let min_hours = frequency.min_hours(ctx.strategy_params.min_interval_hours);

        let last = ctx.last_rebalance_at?;
        let elapsed_hours = (now - last).num_seconds() as f64 / 3600.0;

        if elapsed_hours < min_hours {
            Some(format!(
                "Rebalance frequency is {frequency} (min {min_hours:.0}h) but only \
                 {elapsed_hours:.1}h since last rebalance"
            ))
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Step 4 — cash-constrained sizing
    // ------------------------------------------------------------------

    /// Scale down NEW position weights so their total never exceeds the
    /// fraction of allocated capital still held as cash.  Existing
    /// positions are untouched.
    fn constrain_to_cash(output: &mut StrategyOutput, ctx: &AgentContext) {
        if ctx.allocated_capital <= 0.0 || output.positions.is_empty() {
            return;
        }

        let cash_fraction = (ctx.cash_balance / ctx.allocated_capital).max(0.0);
        if cash_fraction >= 1.0 {
            return;
        }

        let held: HashSet<&str> = ctx
            .current_positions
            .iter()
            .map(|p| p.ticker.as_str())
            .collect();

        let new_weight_total: f64 = output
            .positions
            .iter()
            .filter(|p| !held.contains(p.symbol.as_str()))
            .map(|p| p.target_weight)
            .sum();

        if new_weight_total <= 0.0 || new_weight_total <= cash_fraction {
            return;
        }

        let scale = cash_fraction / new_weight_total;
        for pos in &mut output.positions {
            if !held.contains(pos.symbol.as_str()) {
                pos.target_weight *= scale;
            }
        }

        info!(
            agent = %ctx.agent_id,
            scale,
            cash = ctx.cash_balance,
            allocated = ctx.allocated_capital,
            new_weight = new_weight_total,
            "scaled new positions to available cash"
        );
    }

    // ------------------------------------------------------------------
    // Step 6 — position diffing
    // ------------------------------------------------------------------

    fn position_weight(
        pos: &PositionRow,
        allocated_capital: f64,
        market_data: &HashMap<String, MarketRecord>,
    ) -> f64 {
        if allocated_capital <= 0.0 {
            return 0.0;
        }
        let price =
            pos.market_price(market_data.get(&pos.ticker).and_then(|m| m.current_price));
        if price > 0.0 {
            pos.shares * price / allocated_capital
        } else {
            0.0
        }
    }

    /// Compare recommended positions against current holdings.
    ///
    /// Each held position's current weight is shares · price / allocated
    /// capital.  Emits hold / increase / decrease / buy / sell actions.
    fn diff_positions(
        output: &StrategyOutput,
        current_positions: &[PositionRow],
        allocated_capital: f64,
        market_data: &HashMap<String, MarketRecord>,
    ) -> Vec<OrderAction> {
        let recommended: HashMap<&str, &TargetPosition> = output
            .positions
            .iter()
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        let current: HashMap<&str, &PositionRow> = current_positions
            .iter()
            .map(|p| (p.ticker.as_str(), p))
            .collect();

        let mut actions = Vec::new();

        for (symbol, target) in &recommended {
            if let Some(pos) = current.get(symbol) {
                let cur_weight = Self::position_weight(pos, allocated_capital, market_data);
                let diff = target.target_weight - cur_weight;

                let (action, reason) = if diff.abs() < HOLD_BAND {
                    (ActionKind::Hold, "Weight unchanged".to_string())
                } else if diff > 0.0 {
                    (
                        ActionKind::Increase,
                        format!("Increase weight by {:.1}%", diff * 100.0),
                    )
                } else {
                    (
                        ActionKind::Decrease,
                        format!("Decrease weight by {:.1}%", diff.abs() * 100.0),
                    )
                };

                actions.push(OrderAction {
                    symbol: symbol.to_string(),
                    action,
                    target_weight: target.target_weight,
                    current_weight: cur_weight,
                    signal_strength: target.signal_strength,
                    reason,
                });
            } else {
                actions.push(OrderAction {
                    symbol: symbol.to_string(),
                    action: ActionKind::Buy,
                    target_weight: target.target_weight,
                    current_weight: 0.0,
                    signal_strength: target.signal_strength,
                    reason: "New position recommended".to_string(),
                });
            }
        }

        // Held but no longer recommended: exit.
        for (symbol, pos) in &current {
            if !recommended.contains_key(symbol) {
                actions.push(OrderAction {
                    symbol: symbol.to_string(),
                    action: ActionKind::Sell,
                    target_weight: 0.0,
                    current_weight: Self::position_weight(pos, allocated_capital, market_data),
                    signal_strength: 0.0,
                    reason: "No longer recommended — exit".to_string(),
                });
            }
        }

        actions
    }

    // ------------------------------------------------------------------
    // Step 7 — exit overrides
    // ------------------------------------------------------------------

    /// Replace any action for the exit symbols with the full sell.
    fn merge_exits(
        actions: &mut Vec<OrderAction>,
        exits: Vec<OrderAction>,
        overridden: &mut HashSet<String>,
    ) {
        let exit_symbols: HashSet<&str> = exits.iter().map(|a| a.symbol.as_str()).collect();
        actions.retain(|a| !exit_symbols.contains(a.symbol.as_str()));
        for exit in exits {
            overridden.insert(exit.symbol.clone());
            actions.push(exit);
        }
    }

    fn check_stop_losses(
        ctx: &AgentContext,
        market_data: &HashMap<String, MarketRecord>,
    ) -> Vec<OrderAction> {
        let mut exits = Vec::new();

        for pos in &ctx.current_positions {
            let stop = match pos.stop_loss_price {
                Some(s) => s,
                None => continue,
            };
            let price = match market_data.get(&pos.ticker).and_then(|m| m.current_price) {
                Some(p) => p,
                None => continue,
            };

            let breached = match pos.side {
                PositionSide::Long => price <= stop,
                PositionSide::Short => price >= stop,
            };
            if !breached {
                continue;
            }

            let cmp = match pos.side {
                PositionSide::Long => "<=",
                PositionSide::Short => ">=",
            };
            exits.push(OrderAction {
                symbol: pos.ticker.clone(),
                action: ActionKind::Sell,
                target_weight: 0.0,
                current_weight: Self::position_weight(pos, ctx.allocated_capital, market_data),
                signal_strength: 100.0,
                reason: format!("Stop-loss breached: price {price:.2} {cmp} stop {stop:.2}"),
            });
        }

        exits
    }

    fn check_take_profits(
        ctx: &AgentContext,
        market_data: &HashMap<String, MarketRecord>,
        already_exited: &HashSet<String>,
    ) -> Vec<OrderAction> {
        let mut exits = Vec::new();

        for pos in &ctx.current_positions {
            if already_exited.contains(&pos.ticker) {
                continue;
            }
            let target = match pos.target_price {
                Some(t) => t,
                None => continue,
            };
            let price = match market_data.get(&pos.ticker).and_then(|m| m.current_price) {
                Some(p) => p,
                None => continue,
            };

            let reached = match pos.side {
                PositionSide::Long => price >= target,
                PositionSide::Short => price <= target,
            };
            if !reached {
                continue;
            }

            let cmp = match pos.side {
                PositionSide::Long => ">=",
                PositionSide::Short => "<=",
            };
            exits.push(OrderAction {
                symbol: pos.ticker.clone(),
                action: ActionKind::Sell,
                target_weight: 0.0,
                current_weight: Self::position_weight(pos, ctx.allocated_capital, market_data),
                signal_strength: 100.0,
                reason: format!(
                    "Take-profit reached: price {price:.2} {cmp} target {target:.2}"
                ),
            });
        }

        exits
    }

    fn check_position_aging(
        ctx: &AgentContext,
        market_data: &HashMap<String, MarketRecord>,
        today: NaiveDate,
        already_exited: &HashSet<String>,
    ) -> Vec<OrderAction> {
        let default_max_days = ctx
            .strategy_params
            .max_holding_days
            .or(ctx.risk_params.max_holding_days);

        let mut exits = Vec::new();

        for pos in &ctx.current_positions {
            if already_exited.contains(&pos.ticker) {
                continue;
            }
            let max_days = match pos.max_holding_days.or(default_max_days) {
                Some(d) if d > 0 => d,
                _ => continue,
            };

            let days_held = (today - pos.entry_date).num_days();
            if days_held < max_days {
                continue;
            }

            exits.push(OrderAction {
                symbol: pos.ticker.clone(),
                action: ActionKind::Sell,
                target_weight: 0.0,
                current_weight: Self::position_weight(pos, ctx.allocated_capital, market_data),
                signal_strength: 100.0,
                reason: format!(
                    "Position aged out: held {days_held}d, max horizon {max_days}d"
                ),
            });
        }

        exits
    }

    // ------------------------------------------------------------------
    // Step 8 — trade thesis enrichment
    // ------------------------------------------------------------------

    /// Replace generic buy/increase reasons with a per-position thesis:
    /// signal analysis, price levels, horizon, and regime, like a trade
    /// journal entry.
    fn enrich_trade_theses(
        order_actions: &mut [OrderAction],
        output: &StrategyOutput,
        integrated_scores: &HashMap<String, f64>,
        regime: &str,
        market_data: &HashMap<String, MarketRecord>,
    ) {
        let pos_lookup: HashMap<&str, &TargetPosition> = output
            .positions
            .iter()
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        for action in order_actions.iter_mut() {
            if !matches!(action.action, ActionKind::Buy | ActionKind::Increase) {
                continue;
            }
            let pos = match pos_lookup.get(action.symbol.as_str()) {
                Some(p) => p,
                None => continue,
            };

            let mut parts = vec![format!("Strategy: {}", output.strategy_name)];
            if let Some(score) = integrated_scores.get(&action.symbol) {
                parts.push(format!("Integrated score: {score:.1}/100"));
            }
            parts.push(format!("Signal strength: {:.1}", pos.signal_strength));
            parts.push(format!("Regime: {regime}"));
            parts.push(format!("Weight: {:.1}%", action.target_weight * 100.0));

            if let Some(price) = market_data.get(&action.symbol).and_then(|m| m.current_price)
            {
                parts.push(format!("Entry ~${price:.2}"));
            }
            if let Some(stop) = pos.stop_loss {
                parts.push(format!("Stop: ${stop:.2}"));
            }
            if let Some(target) = pos.take_profit {
                parts.push(format!("Target: ${target:.2}"));
            }
            if let Some(days) = pos.max_holding_days {
                parts.push(format!("Horizon: {days}d"));
            }

            action.reason = parts.join(" | ");
        }
    }
}
