// =============================================================================
// Order Executor & Position Reconciler
// =============================================================================
//
// Translates an agent's order actions into broker orders and keeps the
// persistent position and cash state in sync with what actually filled.
//
// Ordering: sells and decreases first (they free buying power), then buys
// and increases, holds are skipped.  A failed order is logged and skipped;
// the remaining actions still run.  Partial execution is visible in the
// activity log, never rolled back.
//
// Bracket lifecycle: every new or enlarged position gets a GTC stop and a
// GTC take-profit at the broker, sized to the full resulting position.
// Those resting orders are the source of truth for exit enforcement between
// batch runs; the position rows mirror them.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, OrderInfo};
use crate::engine::{ExecutionResult, OrderAction};
use crate::factors::MarketRecord;
use crate::store::rows::{AgentRow, NewPosition, PositionRow};
use crate::store::Store;
use crate::strategies::TargetPosition;
use crate::types::{ActionKind, ActivityType, PositionSide};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Outcome of one order action at the broker.
#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub symbol: String,
    pub action: ActionKind,
    pub order: Option<OrderInfo>,
    pub error: Option<String>,
}

/// Summary of one agent's execution pass.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub orders_submitted: usize,
    pub orders_failed: usize,
    /// Market was closed: nothing was submitted or persisted.
    pub deferred_market_closed: bool,
    pub outcomes: Vec<OrderOutcome>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OrderExecutor;

impl OrderExecutor {
    /// Execute an agent's order actions and reconcile persistent state.
    ///
    /// With no broker (owner has no credentials) the order pass is skipped
    /// entirely, but sell actions still close position rows so a circuit
    /// breaker liquidation is reflected in the book.
    pub async fn execute_and_sync(
        store: &Store,
        broker: Option<&dyn Broker>,
        agent: &AgentRow,
        result: &ExecutionResult,
        market_data: &HashMap<String, MarketRecord>,
        today: NaiveDate,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();

        if let Some(broker) = broker {
            // Market-hours gate: a closed market defers the whole pass and
            // leaves no trace (no orders, no syncs, no activity row).
            match broker.is_market_open().await {
                Ok(clock) if !clock.is_open => {
                    info!(
                        agent = %agent.id,
                        next_open = clock.next_open.as_deref().unwrap_or("unknown"),
                        "market closed — deferring orders"
                    );
                    report.deferred_market_closed = true;
                    return Ok(report);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(agent = %agent.id, error = %e, "could not check market hours — deferring");
                    report.deferred_market_closed = true;
                    return Ok(report);
                }
            }

            report.outcomes = Self::submit_orders(broker, agent, result, market_data).await;
            report.orders_submitted = report
                .outcomes
                .iter()
                .filter(|o| o.order.is_some())
                .count();
            report.orders_failed = report
                .outcomes
                .iter()
                .filter(|o| o.error.is_some())
                .count();
        } else {
            info!(agent = %agent.id, "no broker credentials — syncing positions only");
        }

        Self::sync_positions(store, broker, agent, result, &report.outcomes, market_data, today)
            .await?;
        Self::sync_cash_balance(store, agent, result, &report.outcomes, market_data)?;
        Self::log_activity(store, agent, result)?;

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Order submission
    // -------------------------------------------------------------------------

    async fn submit_orders(
        broker: &dyn Broker,
        agent: &AgentRow,
        result: &ExecutionResult,
        market_data: &HashMap<String, MarketRecord>,
    ) -> Vec<OrderOutcome> {
        let account = match broker.get_account().await {
            Ok(a) => a,
            Err(e) => {
                error!(agent = %agent.id, error = %e, "failed to get account");
                return Vec::new();
            }
        };

        if account.equity <= 0.0 {
            warn!(agent = %agent.id, "account equity is zero");
            return Vec::new();
        }

        // The agent's allocation caps sizing so multiple agents sharing one
        // brokerage account cannot over-allocate.
        let allocated = if agent.allocated_capital > 0.0 {
            agent.allocated_capital
        } else {
            account.equity
        };
        let sizing_basis = allocated.min(account.equity);
        let mut remaining_bp = account.buying_power.min(allocated);

        info!(
            agent = %agent.id,
            equity = account.equity,
            buying_power = account.buying_power,
            allocated,
            sizing_basis,
            "executing order actions"
        );

        // Sells first to free buying power before buys compete for it.
        let mut ordered: Vec<&OrderAction> = Vec::new();
        ordered.extend(result.order_actions.iter().filter(|a| a.action.is_reducing()));
        ordered.extend(
            result
                .order_actions
                .iter()
                .filter(|a| a.action.is_accumulating()),
        );

        let mut outcomes = Vec::new();

        for action in ordered {
            let price = match market_data
                .get(&action.symbol)
                .and_then(|m| m.current_price)
            {
                Some(p) if p > 0.0 => p,
                _ => {
                    warn!(symbol = %action.symbol, "no price — skipping order");
                    continue;
                }
            };

            let outcome = match action.action {
                ActionKind::Buy | ActionKind::Increase => {
                    let delta_weight = if action.action == ActionKind::Buy {
                        action.target_weight
                    } else {
                        action.target_weight - action.current_weight
                    };
                    if delta_weight <= 0.0 {
                        continue;
                    }

                    let mut notional = delta_weight * sizing_basis;
                    if notional > remaining_bp {
                        info!(
                            agent = %agent.id,
                            symbol = %action.symbol,
                            wanted = notional,
                            capped = remaining_bp,
                            "capping buy to remaining buying power"
                        );
                        notional = remaining_bp;
                    }
                    let qty = (notional / price).floor();
                    if qty < 1.0 {
                        continue;
                    }

                    // Limit at +0.5% for fill quality without chasing.
                    let limit_price = round_cents(price * 1.005);
                    let client_order_id = Some(Uuid::new_v4().to_string());
                    match broker
                        .place_limit_order(
                            &action.symbol, qty, "buy", limit_price, "day", client_order_id,
                        )
                        .await
                    {
                        Ok(order) => {
                            remaining_bp -= qty * price;
                            Self::ok(action, order)
                        }
                        Err(e) => Self::failed(action, e),
                    }
                }

                ActionKind::Sell => {
                    // Market exit via close-position: guaranteed out.
                    match broker.close_position(&action.symbol, None).await {
                        Ok(order) => {
                            remaining_bp += order.effective_qty() * price;
                            Self::ok(action, order)
                        }
                        Err(e) => Self::failed(action, e),
                    }
                }

                ActionKind::Decrease => {
                    let delta_weight = action.current_weight - action.target_weight;
                    if delta_weight <= 0.0 {
                        continue;
                    }
                    let qty = (delta_weight * sizing_basis / price).floor();
                    if qty < 1.0 {
                        continue;
                    }

                    let limit_price = round_cents(price * 0.995);
                    let client_order_id = Some(Uuid::new_v4().to_string());
                    match broker
                        .place_limit_order(
                            &action.symbol, qty, "sell", limit_price, "day", client_order_id,
                        )
                        .await
                    {
                        Ok(order) => {
                            remaining_bp += qty * price;
                            Self::ok(action, order)
                        }
                        Err(e) => Self::failed(action, e),
                    }
                }

                ActionKind::Hold => continue,
            };

            outcomes.push(outcome);
        }

        info!(
            agent = %agent.id,
            submitted = outcomes.iter().filter(|o| o.order.is_some()).count(),
            remaining_bp,
            "order pass complete"
        );

        outcomes
    }

    fn ok(action: &OrderAction, order: OrderInfo) -> OrderOutcome {
        OrderOutcome {
            symbol: action.symbol.clone(),
            action: action.action,
            order: Some(order),
            error: None,
        }
    }

    fn failed(action: &OrderAction, e: anyhow::Error) -> OrderOutcome {
        error!(
            symbol = %action.symbol,
            order_action = %action.action,
            error = %e,
            "order failed"
        );
        OrderOutcome {
            symbol: action.symbol.clone(),
            action: action.action,
            order: None,
            error: Some(e.to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Bracket orders
    // -------------------------------------------------------------------------

    /// Place GTC stop and take-profit orders covering the full position so
    /// exits are enforced server-side between batch runs.
    async fn place_bracket_orders(
        broker: &dyn Broker,
        symbol: &str,
        qty: f64,
        stop_price: Option<f64>,
        target_price: Option<f64>,
        side: PositionSide,
    ) -> (Option<String>, Option<String>) {
        if qty <= 0.0 {
            return (None, None);
        }
        let exit_side = match side {
            PositionSide::Long => "sell",
            PositionSide::Short => "buy",
        };

        let mut stop_order_id = None;
        if let Some(stop) = stop_price {
            match broker
                .place_stop_order(symbol, qty, exit_side, round_cents(stop), "gtc", None)
                .await
            {
                Ok(order) => {
                    info!(symbol, stop, order_id = %order.id, "placed GTC stop order");
                    stop_order_id = Some(order.id);
                }
                Err(e) => error!(symbol, error = %e, "failed to place stop order"),
            }
        }

        let mut tp_order_id = None;
        if let Some(target) = target_price {
            match broker
                .place_limit_order(symbol, qty, exit_side, round_cents(target), "gtc", None)
                .await
            {
                Ok(order) => {
                    info!(symbol, target, order_id = %order.id, "placed GTC take-profit order");
                    tp_order_id = Some(order.id);
                }
                Err(e) => error!(symbol, error = %e, "failed to place take-profit order"),
            }
        }

        (stop_order_id, tp_order_id)
    }

    /// Cancel any resting GTC bracket orders recorded on a position row.
    pub async fn cancel_bracket_orders(broker: &dyn Broker, pos: &PositionRow) {
        for order_id in [pos.stop_order_id.as_deref(), pos.tp_order_id.as_deref()]
            .into_iter()
            .flatten()
        {
            match broker.cancel_order(order_id).await {
                Ok(()) => info!(order_id, ticker = %pos.ticker, "cancelled GTC bracket order"),
                Err(_) => debug!(
                    order_id,
                    "could not cancel bracket order (may already be filled or cancelled)"
                ),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Position record synchronization
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn sync_positions(
        store: &Store,
        broker: Option<&dyn Broker>,
        agent: &AgentRow,
        result: &ExecutionResult,
        outcomes: &[OrderOutcome],
        market_data: &HashMap<String, MarketRecord>,
        today: NaiveDate,
    ) -> Result<()> {
        let recommended: HashMap<&str, &TargetPosition> = result
            .strategy_output
            .as_ref()
            .map(|o| {
                o.positions
                    .iter()
                    .map(|p| (p.symbol.as_str(), p))
                    .collect()
            })
            .unwrap_or_default();

        let filled: HashMap<&str, &OrderInfo> = outcomes
            .iter()
            .filter_map(|o| o.order.as_ref().map(|order| (o.symbol.as_str(), order)))
            .collect();

        for action in &result.order_actions {
            let symbol = action.symbol.as_str();
            let snapshot_price = market_data.get(symbol).and_then(|m| m.current_price);
            let rec = recommended.get(symbol);

            let sync = match action.action {
                ActionKind::Buy => {
                    Self::sync_buy(
                        store, broker, agent, action, rec.copied(),
                        filled.get(symbol).copied(), snapshot_price, today,
                    )
                    .await
                }
                ActionKind::Sell => {
                    Self::sync_sell(
                        store, broker, agent, action,
                        filled.get(symbol).copied(), snapshot_price, today,
                    )
                    .await
                }
                ActionKind::Increase | ActionKind::Decrease => {
                    Self::sync_resize(
                        store, broker, agent, action, rec.copied(),
                        filled.get(symbol).copied(), today,
                    )
                    .await
                }
                ActionKind::Hold => Ok(()),
            };

            if let Err(e) = sync {
                error!(
                    agent = %agent.id,
                    symbol,
                    error = %e,
                    "failed to sync position"
                );
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_buy(
        store: &Store,
        broker: Option<&dyn Broker>,
        agent: &AgentRow,
        action: &OrderAction,
        rec: Option<&TargetPosition>,
        order: Option<&OrderInfo>,
        snapshot_price: Option<f64>,
        today: NaiveDate,
    ) -> Result<()> {
        // Position rows are only created once the broker confirmed an order.
        let order = match order {
            Some(o) => o,
            None => return Ok(()),
        };
        let qty = order.effective_qty();
        let entry_price = order.effective_price(snapshot_price.unwrap_or(0.0));
        if qty <= 0.0 || entry_price <= 0.0 {
            return Ok(());
        }

        let side = rec.map(|r| r.side).unwrap_or_default();
        let stop_price = rec.and_then(|r| r.stop_loss);
        let target_price = rec.and_then(|r| r.take_profit);

        let (stop_order_id, tp_order_id) = match broker {
            Some(broker) => {
                Self::place_bracket_orders(broker, &action.symbol, qty, stop_price, target_price, side)
                    .await
            }
            None => (None, None),
        };

        store.insert_position(&NewPosition {
            agent_id: agent.id.clone(),
            ticker: action.symbol.clone(),
            side,
            shares: qty,
            entry_price,
            entry_date: today,
            entry_rationale: action.reason.clone(),
            current_price: snapshot_price,
            stop_loss_price: stop_price,
            target_price,
            max_holding_days: rec.and_then(|r| r.max_holding_days),
            entry_order_id: Some(order.id.clone()),
            stop_order_id,
            tp_order_id,
        })?;

        info!(agent = %agent.id, symbol = %action.symbol, qty, "position record created");
        Ok(())
    }

    async fn sync_sell(
        store: &Store,
        broker: Option<&dyn Broker>,
        agent: &AgentRow,
        action: &OrderAction,
        order: Option<&OrderInfo>,
        snapshot_price: Option<f64>,
        today: NaiveDate,
    ) -> Result<()> {
        let exit_price = order
            .map(|o| o.effective_price(snapshot_price.unwrap_or(0.0)))
            .or(snapshot_price)
            .filter(|p| *p > 0.0);

        // Every open row for this ticker closes; a sell is always a full exit.
        let open = store.open_positions(&agent.id)?;
        for pos in open.iter().filter(|p| p.ticker == action.symbol) {
            if let Some(broker) = broker {
                Self::cancel_bracket_orders(broker, pos).await;
            }

            let (realized_pnl, realized_pnl_pct) = match exit_price {
                Some(exit) if pos.entry_price > 0.0 => {
                    let direction = match pos.side {
                        PositionSide::Long => 1.0,
                        PositionSide::Short => -1.0,
                    };
                    let pnl = direction * (exit - pos.entry_price) * pos.shares;
                    let pct = direction * (exit - pos.entry_price) / pos.entry_price;
                    (
                        Some((pnl * 100.0).round() / 100.0),
                        Some((pct * 10_000.0).round() / 10_000.0),
                    )
                }
                _ => (None, None),
            };

            store.close_position_row(
                pos.id,
                exit_price,
                today,
                &action.reason,
                order.map(|o| o.id.as_str()),
                realized_pnl,
                realized_pnl_pct,
            )?;
        }

        info!(agent = %agent.id, symbol = %action.symbol, "position records closed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_resize(
        store: &Store,
        broker: Option<&dyn Broker>,
        agent: &AgentRow,
        action: &OrderAction,
        rec: Option<&TargetPosition>,
        order: Option<&OrderInfo>,
        today: NaiveDate,
    ) -> Result<()> {
        let order = match order {
            Some(o) => o,
            None => return Ok(()),
        };
        let delta_qty = order.effective_qty();
        if delta_qty <= 0.0 {
            return Ok(());
        }

        let open = store.open_positions(&agent.id)?;
        let pos = match open.iter().find(|p| p.ticker == action.symbol) {
            Some(p) => p,
            None => return Ok(()),
        };

        let new_shares = if action.action == ActionKind::Increase {
            pos.shares + delta_qty
        } else {
            (pos.shares - delta_qty).max(0.0)
        };

        // Shrunk to nothing: treat as a close so ghost positions never
        // pollute future weight calculations.
        if new_shares <= 0.0 {
            if let Some(broker) = broker {
                Self::cancel_bracket_orders(broker, pos).await;
            }
            store.close_position_row(
                pos.id,
                order.filled_avg_price,
                today,
                &action.reason,
                Some(order.id.as_str()),
                None,
                None,
            )?;
            return Ok(());
        }

        store.update_position_shares(pos.id, new_shares)?;

        // Re-cover the full resulting position with fresh brackets.
        let stop_price = rec.and_then(|r| r.stop_loss).or(pos.stop_loss_price);
        let target_price = rec.and_then(|r| r.take_profit).or(pos.target_price);
        if let Some(broker) = broker {
            Self::cancel_bracket_orders(broker, pos).await;
            let (stop_order_id, tp_order_id) = Self::place_bracket_orders(
                broker,
                &action.symbol,
                new_shares,
                stop_price,
                target_price,
                pos.side,
            )
            .await;
            store.set_position_brackets(
                pos.id,
                stop_order_id.as_deref(),
                tp_order_id.as_deref(),
                stop_price,
                target_price,
            )?;
        }

        info!(
            agent = %agent.id,
            symbol = %action.symbol,
            shares = new_shares,
            "position record resized"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cash balance synchronization
    // -------------------------------------------------------------------------

    /// Net filled order values against the agent's cash balance: buys and
    /// increases subtract, sells and decreases add.  Clamped at zero.
    fn sync_cash_balance(
        store: &Store,
        agent: &AgentRow,
        result: &ExecutionResult,
        outcomes: &[OrderOutcome],
        market_data: &HashMap<String, MarketRecord>,
    ) -> Result<()> {
        let mut cash = agent.cash_balance;
        let mut moved = false;

        for action in &result.order_actions {
            if action.action == ActionKind::Hold {
                continue;
            }
            let outcome = outcomes
                .iter()
                .find(|o| o.symbol == action.symbol && o.action == action.action);
            let order = match outcome.and_then(|o| o.order.as_ref()) {
                Some(o) => o,
                None => continue,
            };

            let snapshot_price = market_data
                .get(&action.symbol)
                .and_then(|m| m.current_price)
                .unwrap_or(0.0);
            let filled_price = order.effective_price(snapshot_price);
            let filled_qty = order.effective_qty();
            if filled_price <= 0.0 || filled_qty <= 0.0 {
                continue;
            }

            let trade_value = filled_price * filled_qty;
            if action.action.is_accumulating() {
                cash -= trade_value;
            } else {
                cash += trade_value;
            }
            moved = true;
        }

        if !moved {
            return Ok(());
        }

        cash = (cash.max(0.0) * 100.0).round() / 100.0;
        store.update_agent_cash(&agent.id, cash)?;
        info!(agent = %agent.id, cash, "cash balance updated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Activity log
    // -------------------------------------------------------------------------

    /// One rebalance row summarising the run, plus one row per action with
    /// the full diff snapshot for audit.
    fn log_activity(store: &Store, agent: &AgentRow, result: &ExecutionResult) -> Result<()> {
        if let Some(output) = &result.strategy_output {
            store.insert_activity(
                &agent.id,
                ActivityType::Rebalance,
                None,
                &json!({
                    "strategy": output.strategy_name,
                    "regime": result.regime,
                    "positions_recommended": output.positions.len(),
                    "risk_metrics": output.risk_metrics,
                    "executed_at": result.executed_at.to_rfc3339(),
                }),
            )?;
        } else if result.regime == "circuit_breaker" {
            store.insert_activity(
                &agent.id,
                ActivityType::Rebalance,
                None,
                &json!({
                    "regime": "circuit_breaker",
                    "liquidation": true,
                    "positions_liquidated": result.order_actions.len(),
                    "executed_at": result.executed_at.to_rfc3339(),
                }),
            )?;
        }

        for action in &result.order_actions {
            let activity_type = match action.action {
                ActionKind::Buy | ActionKind::Increase => ActivityType::Buy,
                ActionKind::Sell | ActionKind::Decrease => ActivityType::Sell,
                ActionKind::Hold => ActivityType::Signal,
            };

            store.insert_activity(
                &agent.id,
                activity_type,
                Some(&action.symbol),
                &json!({
                    "order_action": action.action,
                    "target_weight": action.target_weight,
                    "current_weight": action.current_weight,
                    "signal_strength": action.signal_strength,
                    "integrated_score": result.integrated_scores.get(&action.symbol),
                    "reason": action.reason,
                }),
            )?;
        }

        Ok(())
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::store::rows::{RiskParams, StrategyParams};
    use crate::types::{AgentStatus, PositionStatus};
    use chrono::Utc;

    fn agent(allocated: f64, cash: f64) -> AgentRow {
        AgentRow {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            name: "Test".to_string(),
            persona: "analytical".to_string(),
            status: AgentStatus::Active,
            strategy_type: "momentum".to_string(),
            strategy_params: StrategyParams::default(),
            risk_params: RiskParams::default(),
            allocated_capital: allocated,
            cash_balance: cash,
            time_horizon_days: 365,
            start_date: None,
            end_date: None,
        }
    }

    fn buy_action(symbol: &str, weight: f64) -> OrderAction {
        OrderAction {
            symbol: symbol.to_string(),
            action: ActionKind::Buy,
            target_weight: weight,
            current_weight: 0.0,
            signal_strength: 80.0,
            reason: "New position recommended".to_string(),
        }
    }

    fn sell_action(symbol: &str) -> OrderAction {
        OrderAction {
            symbol: symbol.to_string(),
            action: ActionKind::Sell,
            target_weight: 0.0,
            current_weight: 0.10,
            signal_strength: 0.0,
            reason: "No longer recommended — exit".to_string(),
        }
    }

    fn target(symbol: &str, weight: f64, stop: f64, tp: f64) -> TargetPosition {
        TargetPosition {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            target_weight: weight,
            signal_strength: 80.0,
            stop_loss: Some(stop),
            take_profit: Some(tp),
            max_holding_days: None,
        }
    }

    fn exec_result(
        actions: Vec<OrderAction>,
        targets: Vec<TargetPosition>,
    ) -> ExecutionResult {
        ExecutionResult {
            agent_id: "a1".to_string(),
            strategy_output: Some(crate::strategies::StrategyOutput {
                strategy_name: "agent-a1".to_string(),
                positions: targets,
                risk_metrics: HashMap::new(),
            }),
            integrated_scores: HashMap::new(),
            order_actions: actions,
            regime: "neutral".to_string(),
            macro_overlay: None,
            error: None,
            executed_at: Utc::now(),
        }
    }

    fn market_of(prices: &[(&str, f64)]) -> HashMap<String, MarketRecord> {
        prices
            .iter()
            .map(|(symbol, price)| {
                (
                    symbol.to_string(),
                    MarketRecord {
                        symbol: symbol.to_string(),
                        current_price: Some(*price),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 31).unwrap()
    }

    // ── Scenario: clean buy on a 10k agent ──────────────────────────────

    #[tokio::test]
    async fn clean_buy_sizes_and_debits_cash() {
        let store = Store::open_in_memory().unwrap();
        store.insert_agent(&agent(10_000.0, 10_000.0)).unwrap();
        let broker = MockBroker::new(10_000.0, 10_000.0, true);
        broker.set_price("AAPL", 100.0);
        broker.set_price("MSFT", 200.0);

        let agent = agent(10_000.0, 10_000.0);
        let result = exec_result(
            vec![buy_action("AAPL", 0.20), buy_action("MSFT", 0.15)],
            vec![
                target("AAPL", 0.20, 90.0, 120.0),
                target("MSFT", 0.15, 180.0, 240.0),
            ],
        );
        let market = market_of(&[("AAPL", 100.0), ("MSFT", 200.0)]);

        let report = OrderExecutor::execute_and_sync(
            &store, Some(&broker), &agent, &result, &market, today(),
        )
        .await
        .unwrap();

        assert!(!report.deferred_market_closed);

        // Day-limit buys at +0.5%: AAPL 20 @ 100.50, MSFT 7 @ 201.00.
        let limits: Vec<_> = broker
            .submitted_of_type("limit")
            .into_iter()
            .filter(|o| o.side == "buy" && o.status == "filled")
            .collect();
        assert_eq!(limits.len(), 2);
        let aapl = limits.iter().find(|o| o.symbol == "AAPL").unwrap();
        assert_eq!(aapl.qty, 20.0);
        assert_eq!(aapl.limit_price, Some(100.50));
        let msft = limits.iter().find(|o| o.symbol == "MSFT").unwrap();
        assert_eq!(msft.qty, 7.0);
        assert_eq!(msft.limit_price, Some(201.00));

        // Position rows created with brackets recorded.
        let open = store.open_positions("a1").unwrap();
        assert_eq!(open.len(), 2);
        for pos in &open {
            assert!(pos.stop_order_id.is_some());
            assert!(pos.tp_order_id.is_some());
            assert_eq!(pos.status, PositionStatus::Open);
        }

        // Cash: 10000 − 2000 − 1400 = 6600.
        let agents = store_agent_cash(&store);
        assert!((agents - 6600.0).abs() < 1e-6);

        // One GTC stop and one GTC take-profit per fill.
        assert_eq!(broker.submitted_of_type("stop").len(), 2);
        let gtc_limits = broker
            .submitted_of_type("limit")
            .into_iter()
            .filter(|o| o.status == "accepted")
            .count();
        assert_eq!(gtc_limits, 2);
    }

    fn store_agent_cash(store: &Store) -> f64 {
        let agents = store.active_agents().unwrap();
        agents
            .iter()
            .find(|a| a.id == "a1")
            .map(|a| a.cash_balance)
            .unwrap_or(f64::NAN)
    }

    // ── Scenario: macro overlay shrinks the same buys ───────────────────

    #[tokio::test]
    async fn overlay_scaled_weights_shrink_orders() {
        let store = Store::open_in_memory().unwrap();
        store.insert_agent(&agent(10_000.0, 10_000.0)).unwrap();
        let broker = MockBroker::new(10_000.0, 10_000.0, true);
        broker.set_price("AAPL", 100.0);
        broker.set_price("MSFT", 200.0);

        let agent = agent(10_000.0, 10_000.0);
        // Weights already scaled by 0.60 upstream: 0.12 and 0.09.
        let result = exec_result(
            vec![buy_action("AAPL", 0.12), buy_action("MSFT", 0.09)],
            vec![
                target("AAPL", 0.12, 90.0, 120.0),
                target("MSFT", 0.09, 180.0, 240.0),
            ],
        );
        let market = market_of(&[("AAPL", 100.0), ("MSFT", 200.0)]);

        OrderExecutor::execute_and_sync(&store, Some(&broker), &agent, &result, &market, today())
            .await
            .unwrap();

        let limits: Vec<_> = broker
            .submitted_of_type("limit")
            .into_iter()
            .filter(|o| o.side == "buy" && o.status == "filled")
            .collect();
        let aapl = limits.iter().find(|o| o.symbol == "AAPL").unwrap();
        assert_eq!(aapl.qty, 12.0);
        let msft = limits.iter().find(|o| o.symbol == "MSFT").unwrap();
        assert_eq!(msft.qty, 4.0);

        // Cash after fills: 10000 − 1200 − 800 = 8000.
        assert!((store_agent_cash(&store) - 8000.0).abs() < 1e-6);
    }

    // ── Market closed: defer everything ─────────────────────────────────

    #[tokio::test]
    async fn market_closed_defers_without_side_effects() {
        let store = Store::open_in_memory().unwrap();
        store.insert_agent(&agent(10_000.0, 10_000.0)).unwrap();
        let broker = MockBroker::new(10_000.0, 10_000.0, false);
        broker.set_price("AAPL", 100.0);

        let agent = agent(10_000.0, 10_000.0);
        let result = exec_result(
            vec![buy_action("AAPL", 0.20)],
            vec![target("AAPL", 0.20, 90.0, 120.0)],
        );
        let market = market_of(&[("AAPL", 100.0)]);

        let report = OrderExecutor::execute_and_sync(
            &store, Some(&broker), &agent, &result, &market, today(),
        )
        .await
        .unwrap();

        assert!(report.deferred_market_closed);
        assert!(broker.submitted.lock().is_empty());
        assert!(store.open_positions("a1").unwrap().is_empty());
        // No activity row for a deferred run.
        assert!(store.last_rebalance_at("a1").unwrap().is_none());
        assert!((store_agent_cash(&store) - 10_000.0).abs() < 1e-6);
    }

    // ── Sells precede buys ──────────────────────────────────────────────

    #[tokio::test]
    async fn sells_submitted_before_buys() {
        let store = Store::open_in_memory().unwrap();
        let broker = MockBroker::new(10_000.0, 10_000.0, true);
        broker.set_price("OLD", 50.0);
        broker.set_price("NEW", 100.0);

        let agent = agent(10_000.0, 10_000.0);
        // Buy listed first; executor must still sell first.
        let result = exec_result(
            vec![buy_action("NEW", 0.10), sell_action("OLD")],
            vec![target("NEW", 0.10, 90.0, 120.0)],
        );
        let market = market_of(&[("OLD", 50.0), ("NEW", 100.0)]);

        OrderExecutor::execute_and_sync(&store, Some(&broker), &agent, &result, &market, today())
            .await
            .unwrap();

        let submitted = broker.submitted.lock();
        let first_entry = submitted
            .iter()
            .position(|o| o.symbol == "NEW" && o.order_type == "limit")
            .unwrap();
        let close = submitted
            .iter()
            .position(|o| o.symbol == "OLD" && o.order_type == "close")
            .unwrap();
        assert!(close < first_entry);
    }

    // ── Sell closes every open row and cancels brackets ─────────────────

    #[tokio::test]
    async fn sell_closes_rows_and_cancels_brackets() {
        let store = Store::open_in_memory().unwrap();
        store.insert_agent(&agent(10_000.0, 1_000.0)).unwrap();
        let broker = MockBroker::new(10_000.0, 10_000.0, true);
        broker.set_price("AAPL", 120.0);
        broker.positions.lock().push(crate::broker::BrokerPosition {
            symbol: "AAPL".to_string(),
            qty: 10.0,
            avg_entry_price: 100.0,
            market_value: 1_200.0,
            unrealized_pl: 200.0,
            side: "long".to_string(),
        });

        store
            .insert_position(&NewPosition {
                agent_id: "a1".to_string(),
                ticker: "AAPL".to_string(),
                side: PositionSide::Long,
                shares: 10.0,
                entry_price: 100.0,
                entry_date: today(),
                entry_rationale: "entry".to_string(),
                current_price: Some(100.0),
                stop_loss_price: Some(90.0),
                target_price: Some(130.0),
                max_holding_days: None,
                entry_order_id: Some("e1".to_string()),
                stop_order_id: Some("stop-1".to_string()),
                tp_order_id: Some("tp-1".to_string()),
            })
            .unwrap();

        let agent = agent(10_000.0, 1_000.0);
        let result = exec_result(vec![sell_action("AAPL")], Vec::new());
        let market = market_of(&[("AAPL", 120.0)]);

        OrderExecutor::execute_and_sync(&store, Some(&broker), &agent, &result, &market, today())
            .await
            .unwrap();

        // Both bracket orders cancelled before the close.
        let cancelled = broker.cancelled.lock();
        assert!(cancelled.contains(&"stop-1".to_string()));
        assert!(cancelled.contains(&"tp-1".to_string()));
        drop(cancelled);

        assert!(store.open_positions("a1").unwrap().is_empty());
        // Sell proceeds: 1000 + 10 × 120 = 2200.
        assert!((store_agent_cash(&store) - 2_200.0).abs() < 1e-6);
    }

    // ── No credentials: circuit-breaker liquidation still books ─────────

    #[tokio::test]
    async fn no_broker_still_closes_positions_on_sell() {
        let store = Store::open_in_memory().unwrap();
        store.insert_agent(&agent(10_000.0, 0.0)).unwrap();

        store
            .insert_position(&NewPosition {
                agent_id: "a1".to_string(),
                ticker: "AAPL".to_string(),
                side: PositionSide::Long,
                shares: 10.0,
                entry_price: 100.0,
                entry_date: today(),
                entry_rationale: "entry".to_string(),
                current_price: Some(80.0),
                stop_loss_price: None,
                target_price: None,
                max_holding_days: None,
                entry_order_id: None,
                stop_order_id: None,
                tp_order_id: None,
            })
            .unwrap();

        let agent = agent(10_000.0, 0.0);
        let mut result = exec_result(vec![sell_action("AAPL")], Vec::new());
        result.strategy_output = None;
        result.regime = "circuit_breaker".to_string();
        let market = market_of(&[("AAPL", 80.0)]);

        OrderExecutor::execute_and_sync(&store, None, &agent, &result, &market, today())
            .await
            .unwrap();

        assert!(store.open_positions("a1").unwrap().is_empty());
        // Liquidation activity row recorded.
        let last = store.last_rebalance_at("a1").unwrap();
        assert!(last.is_some());
    }

    // ── Buying power caps buys after a prior fill ───────────────────────

    #[tokio::test]
    async fn buys_capped_by_remaining_buying_power() {
        let store = Store::open_in_memory().unwrap();
        // Buying power covers only the first buy fully.
        let broker = MockBroker::new(10_000.0, 2_500.0, true);
        broker.set_price("AAA", 100.0);
        broker.set_price("BBB", 100.0);

        let agent = agent(10_000.0, 10_000.0);
        let result = exec_result(
            vec![buy_action("AAA", 0.20), buy_action("BBB", 0.20)],
            vec![
                target("AAA", 0.20, 90.0, 120.0),
                target("BBB", 0.20, 90.0, 120.0),
            ],
        );
        let market = market_of(&[("AAA", 100.0), ("BBB", 100.0)]);

        OrderExecutor::execute_and_sync(&store, Some(&broker), &agent, &result, &market, today())
            .await
            .unwrap();

        let buys: Vec<_> = broker
            .submitted_of_type("limit")
            .into_iter()
            .filter(|o| o.side == "buy" && o.status == "filled")
            .collect();
        // First buy takes 20 shares (2000); second capped to 500 → 5 shares.
        assert_eq!(buys.len(), 2);
        let total_notional: f64 = buys.iter().map(|o| o.qty * 100.0).sum();
        assert!(total_notional <= 2_500.0 + 1e-9);
    }
}
