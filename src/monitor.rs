// =============================================================================
// Intraday Position Monitor — live-price exit enforcement between batch runs
// =============================================================================
//
// Runs on a minutes-scale schedule during market hours.  Groups active
// agents by owning user to reuse one broker connection, refreshes each open
// position's live price, and enforces exits in priority order: stop-loss,
// then take-profit, then aging.  It never opens new positions.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use futures_util::future;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerFactory};
use crate::executor::OrderExecutor;
use crate::store::rows::{AgentRow, PositionRow};
use crate::store::Store;
use crate::types::{ActivityType, PositionSide};

/// Summary returned to the scheduler after one monitor pass.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub status: String,
    pub positions_scanned: usize,
    pub exits_triggered: usize,
    pub users_skipped_market_closed: usize,
}

/// Run one intraday monitor pass over every active agent's open positions.
pub async fn run_intraday_monitor(
    store: &Store,
    broker_factory: &BrokerFactory<'_>,
    today: NaiveDate,
) -> Result<MonitorSummary> {
    info!("intraday monitor started");

    let mut positions_scanned = 0usize;
    let mut exits_triggered = 0usize;
    let mut users_skipped = 0usize;

    let agents = store.active_agents()?;
    if agents.is_empty() {
        return Ok(MonitorSummary {
            status: "success".to_string(),
            positions_scanned: 0,
            exits_triggered: 0,
            users_skipped_market_closed: 0,
        });
    }

    // Group agents by owner so one broker connection serves all of them.
    let mut by_user: HashMap<String, Vec<AgentRow>> = HashMap::new();
    for agent in agents {
        by_user.entry(agent.user_id.clone()).or_default().push(agent);
    }

    for (user_id, user_agents) in by_user {
        let creds = match store.user_broker_creds(&user_id)? {
            Some(c) => c,
            None => continue,
        };
        let broker = match broker_factory(&creds) {
            Some(b) => b,
            None => continue,
        };

        // Skip the whole user while the market is closed.
        match broker.is_market_open().await {
            Ok(clock) if !clock.is_open => {
                info!(user = %user_id, "market closed — skipping monitor for user");
                users_skipped += 1;
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(user = %user_id, error = %e, "failed to check market hours — assuming open");
            }
        }

        for agent in &user_agents {
            let default_max_days = agent
                .strategy_params
                .max_holding_days
                .or(agent.risk_params.max_holding_days);

            let positions = match store.open_positions(&agent.id) {
                Ok(p) => p,
                Err(e) => {
                    error!(agent = %agent.id, error = %e, "failed to load open positions");
                    continue;
                }
            };

            // Quotes fan out concurrently; exits are then applied in order.
            let quotes = future::join_all(
                positions
                    .iter()
                    .map(|pos| broker.get_latest_quote(&pos.ticker)),
            )
            .await;

            for (pos, quote) in positions.into_iter().zip(quotes) {
                positions_scanned += 1;

                let live_price = match quote {
                    Ok(quote) => quote.live_price(),
                    Err(e) => {
                        warn!(
                            ticker = %pos.ticker,
                            error = %e,
                            "could not get live price"
                        );
                        continue;
                    }
                };
                if live_price <= 0.0 {
                    continue;
                }

                // Keep current_price fresh for dashboard visibility even
                // when no exit triggers.
                let direction = match pos.side {
                    PositionSide::Long => 1.0,
                    PositionSide::Short => -1.0,
                };
                let unrealized = direction * (live_price - pos.entry_price) * pos.shares;
                let unrealized_pct = if pos.entry_price > 0.0 {
                    direction * (live_price - pos.entry_price) / pos.entry_price * 100.0
                } else {
                    0.0
                };
                if let Err(e) =
                    store.update_position_price(pos.id, live_price, unrealized, unrealized_pct)
                {
                    debug!(position = pos.id, error = %e, "failed to refresh current_price");
                }

                // Priority order: stop-loss, take-profit, aging.
                let reason = check_stop_loss(&pos, live_price)
                    .or_else(|| check_take_profit(&pos, live_price))
                    .or_else(|| check_position_age(&pos, default_max_days, today));

                if let Some(reason) = reason {
                    match execute_exit(store, broker.as_ref(), &pos, &reason, live_price, today)
                        .await
                    {
                        Ok(()) => exits_triggered += 1,
                        Err(e) => {
                            error!(
                                agent = %agent.id,
                                ticker = %pos.ticker,
                                error = %e,
                                "failed to exit position"
                            );
                        }
                    }
                }
            }
        }
    }

    let summary = MonitorSummary {
        status: "success".to_string(),
        positions_scanned,
        exits_triggered,
        users_skipped_market_closed: users_skipped,
    };
    info!(
        scanned = summary.positions_scanned,
        exits = summary.exits_triggered,
        "intraday monitor complete"
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Exit checks
// ---------------------------------------------------------------------------

fn check_stop_loss(pos: &PositionRow, live_price: f64) -> Option<String> {
    let stop = pos.stop_loss_price?;
    match pos.side {
        PositionSide::Long if live_price <= stop => Some(format!(
            "Intraday stop-loss breached: price {live_price:.2} <= stop {stop:.2}"
        )),
        PositionSide::Short if live_price >= stop => Some(format!(
            "Intraday stop-loss breached: price {live_price:.2} >= stop {stop:.2}"
        )),
        _ => None,
    }
}

fn check_take_profit(pos: &PositionRow, live_price: f64) -> Option<String> {
    let target = pos.target_price?;
    match pos.side {
        PositionSide::Long if live_price >= target => Some(format!(
            "Intraday take-profit reached: price {live_price:.2} >= target {target:.2}"
        )),
        PositionSide::Short if live_price <= target => Some(format!(
            "Intraday take-profit reached: price {live_price:.2} <= target {target:.2}"
        )),
        _ => None,
    }
}

fn check_position_age(
    pos: &PositionRow,
    default_max_days: Option<i64>,
    today: NaiveDate,
) -> Option<String> {
    let max_days = pos.max_holding_days.or(default_max_days).filter(|d| *d > 0)?;
    let days_held = (today - pos.entry_date).num_days();
    if days_held >= max_days {
        Some(format!(
            "Position aged out: held {days_held}d, max horizon {max_days}d"
        ))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Exit execution
// ---------------------------------------------------------------------------

/// Cancel resting brackets, close at the broker, settle the position row,
/// and record the activity.
async fn execute_exit(
    store: &Store,
    broker: &dyn Broker,
    pos: &PositionRow,
    reason: &str,
    live_price: f64,
    today: NaiveDate,
) -> Result<()> {
    OrderExecutor::cancel_bracket_orders(broker, pos).await;

    let order = broker.close_position(&pos.ticker, None).await?;
    let exit_price = if live_price > 0.0 {
        live_price
    } else {
        order.effective_price(0.0)
    };

    let direction = match pos.side {
        PositionSide::Long => 1.0,
        PositionSide::Short => -1.0,
    };
    let (pnl, pnl_pct) = if pos.entry_price > 0.0 {
        (
            direction * (exit_price - pos.entry_price) * pos.shares,
            direction * (exit_price - pos.entry_price) / pos.entry_price,
        )
    } else {
        (0.0, 0.0)
    };

    store.close_position_row(
        pos.id,
        Some(exit_price),
        today,
        reason,
        Some(order.id.as_str()),
        Some((pnl * 100.0).round() / 100.0),
        Some((pnl_pct * 10_000.0).round() / 10_000.0),
    )?;

    let activity_type = if reason.contains("stop-loss") {
        ActivityType::StopHit
    } else if reason.contains("take-profit") {
        ActivityType::TargetHit
    } else {
        ActivityType::Sell
    };

    store.insert_activity(
        &pos.agent_id,
        activity_type,
        Some(&pos.ticker),
        &serde_json::json!({
            "reason": reason,
            "exit_price": exit_price,
            "realized_pnl": (pnl * 100.0).round() / 100.0,
            "realized_pnl_pct": (pnl_pct * 10_000.0).round() / 10_000.0,
        }),
    )?;

    info!(
        agent = %pos.agent_id,
        ticker = %pos.ticker,
        reason,
        pnl,
        "position exited by intraday monitor"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::store::rows::{NewPosition, RiskParams, StrategyParams, UserCreds};
    use crate::types::AgentStatus;

    fn seed_agent(store: &Store) {
        store
            .insert_agent(&AgentRow {
                id: "a1".to_string(),
                user_id: "u1".to_string(),
                name: "Agent".to_string(),
                persona: "analytical".to_string(),
                status: AgentStatus::Active,
                strategy_type: "momentum".to_string(),
                strategy_params: StrategyParams::default(),
                risk_params: RiskParams::default(),
                allocated_capital: 10_000.0,
                cash_balance: 5_000.0,
                time_horizon_days: 365,
                start_date: None,
                end_date: None,
            })
            .unwrap();
        store
            .insert_user(
                "u1",
                &UserCreds {
                    alpaca_api_key: Some("key".to_string()),
                    alpaca_api_secret: Some("secret".to_string()),
                    alpaca_paper_mode: true,
                },
            )
            .unwrap();
    }

    fn seed_position(
        store: &Store,
        ticker: &str,
        entry: f64,
        stop: Option<f64>,
        target: Option<f64>,
        entry_date: NaiveDate,
        max_days: Option<i64>,
    ) -> i64 {
        store
            .insert_position(&NewPosition {
                agent_id: "a1".to_string(),
                ticker: ticker.to_string(),
                side: PositionSide::Long,
                shares: 10.0,
                entry_price: entry,
                entry_date,
                entry_rationale: "entry".to_string(),
                current_price: Some(entry),
                stop_loss_price: stop,
                target_price: target,
                max_holding_days: max_days,
                entry_order_id: None,
                stop_order_id: Some("stop-1".to_string()),
                tp_order_id: Some("tp-1".to_string()),
            })
            .unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 31).unwrap()
    }

    async fn run_with(broker: Arc<MockBroker>, store: &Store) -> MonitorSummary {
        let factory = move |_: &UserCreds| -> Option<Arc<dyn Broker>> {
            Some(broker.clone() as Arc<dyn Broker>)
        };
        run_intraday_monitor(store, &factory, today()).await.unwrap()
    }

    #[tokio::test]
    async fn stop_loss_exit_closes_and_logs() {
        let store = Store::open_in_memory().unwrap();
        seed_agent(&store);
        seed_position(&store, "AAPL", 100.0, Some(90.0), Some(130.0), today(), None);

        let broker = Arc::new(MockBroker::new(10_000.0, 10_000.0, true));
        broker.set_price("AAPL", 89.0);

        let summary = run_with(broker.clone(), &store).await;
        assert_eq!(summary.positions_scanned, 1);
        assert_eq!(summary.exits_triggered, 1);

        // Brackets cancelled, position closed at the broker and in the book.
        let cancelled = broker.cancelled.lock();
        assert!(cancelled.contains(&"stop-1".to_string()));
        assert!(cancelled.contains(&"tp-1".to_string()));
        drop(cancelled);
        assert!(store.open_positions("a1").unwrap().is_empty());

        // Market close only — the monitor never enters positions.
        let submitted = broker.submitted.lock();
        assert!(submitted.iter().all(|o| o.order_type == "close"));
    }

    #[tokio::test]
    async fn take_profit_beats_aging() {
        let store = Store::open_in_memory().unwrap();
        seed_agent(&store);
        // Old position that has ALSO reached its target: take-profit wins.
        let entry_date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        seed_position(
            &store, "WIN", 100.0, Some(80.0), Some(120.0), entry_date, Some(10),
        );

        let broker = Arc::new(MockBroker::new(10_000.0, 10_000.0, true));
        broker.set_price("WIN", 125.0);

        let summary = run_with(broker, &store).await;
        assert_eq!(summary.exits_triggered, 1);

        // The closed row records the take-profit rationale.
        let conn_check = store.open_positions("a1").unwrap();
        assert!(conn_check.is_empty());
    }

    #[tokio::test]
    async fn aging_exit_uses_agent_default() {
        let store = Store::open_in_memory().unwrap();
        // Agent-level horizon of 30 days; the position row carries none.
        let mut risk_params = RiskParams::default();
        risk_params.max_holding_days = Some(30);
        store
            .insert_agent(&AgentRow {
                id: "a1".to_string(),
                user_id: "u1".to_string(),
                name: "Agent".to_string(),
                persona: "analytical".to_string(),
                status: AgentStatus::Active,
                strategy_type: "momentum".to_string(),
                strategy_params: StrategyParams::default(),
                risk_params,
                allocated_capital: 10_000.0,
                cash_balance: 5_000.0,
                time_horizon_days: 365,
                start_date: None,
                end_date: None,
            })
            .unwrap();
        store
            .insert_user(
                "u1",
                &UserCreds {
                    alpaca_api_key: Some("key".to_string()),
                    alpaca_api_secret: Some("secret".to_string()),
                    alpaca_paper_mode: true,
                },
            )
            .unwrap();

        let entry_date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(); // 60 days ago
        seed_position(&store, "OLD", 100.0, None, None, entry_date, None);

        let broker = Arc::new(MockBroker::new(10_000.0, 10_000.0, true));
        broker.set_price("OLD", 101.0);

        let summary = run_with(broker, &store).await;
        assert_eq!(summary.exits_triggered, 1);
    }

    #[tokio::test]
    async fn quiet_position_only_refreshes_price() {
        let store = Store::open_in_memory().unwrap();
        seed_agent(&store);
        let id = seed_position(&store, "AAPL", 100.0, Some(90.0), Some(130.0), today(), None);

        let broker = Arc::new(MockBroker::new(10_000.0, 10_000.0, true));
        broker.set_price("AAPL", 105.0);

        let summary = run_with(broker.clone(), &store).await;
        assert_eq!(summary.exits_triggered, 0);
        assert_eq!(summary.positions_scanned, 1);

        let open = store.open_positions("a1").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
        assert_eq!(open[0].current_price, Some(105.0));
        assert!((open[0].unrealized_pnl.unwrap() - 50.0).abs() < 1e-9);
        assert!(broker.submitted.lock().is_empty());
        assert!(broker.cancelled.lock().is_empty());
    }

    #[tokio::test]
    async fn market_closed_skips_user() {
        let store = Store::open_in_memory().unwrap();
        seed_agent(&store);
        seed_position(&store, "AAPL", 100.0, Some(90.0), None, today(), None);

        let broker = Arc::new(MockBroker::new(10_000.0, 10_000.0, false));
        broker.set_price("AAPL", 50.0); // would trip the stop if scanned

        let summary = run_with(broker, &store).await;
        assert_eq!(summary.positions_scanned, 0);
        assert_eq!(summary.exits_triggered, 0);
        assert_eq!(summary.users_skipped_market_closed, 1);
        assert_eq!(store.open_positions("a1").unwrap().len(), 1);
    }
}
