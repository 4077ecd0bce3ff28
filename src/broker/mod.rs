// =============================================================================
// Broker contract — account, orders, positions, quotes
// =============================================================================
//
// The execution core talks to the brokerage exclusively through this trait so
// the order executor and intraday monitor can be driven against an in-memory
// double in tests.  The concrete Alpaca REST client lives in `alpaca.rs`.
// =============================================================================

pub mod alpaca;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::rows::UserCreds;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Account snapshot returned by `get_account`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub equity: f64,
    pub buying_power: f64,
    pub cash: f64,
    pub portfolio_value: f64,
    pub status: String,
    #[serde(default)]
    pub daytrade_count: i64,
}

/// Market clock returned by `is_market_open`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketClock {
    pub is_open: bool,
    pub next_open: Option<String>,
    pub next_close: Option<String>,
}

/// A submitted or queried order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderInfo {
    pub id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    #[serde(default)]
    pub qty: f64,
    #[serde(default)]
    pub filled_qty: f64,
    pub side: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub filled_avg_price: Option<f64>,
    #[serde(default)]
    pub submitted_at: Option<String>,
}

impl OrderInfo {
    /// Best-effort fill quantity: filled amount, else submitted quantity.
    pub fn effective_qty(&self) -> f64 {
        if self.filled_qty > 0.0 {
            self.filled_qty
        } else {
            self.qty
        }
    }

    /// Best-effort fill price, falling back to `fallback` when the broker
    /// has not reported one yet.
    pub fn effective_price(&self, fallback: f64) -> f64 {
        match self.filled_avg_price {
            Some(p) if p > 0.0 => p,
            _ => fallback,
        }
    }
}

/// A position as the broker sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    #[serde(default)]
    pub market_value: f64,
    #[serde(default)]
    pub unrealized_pl: f64,
    pub side: String,
}

/// Latest NBBO quote for a symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid_price: f64,
    pub ask_price: f64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl Quote {
    /// Tradeable price: ask when present, else bid.
    pub fn live_price(&self) -> f64 {
        if self.ask_price > 0.0 {
            self.ask_price
        } else {
            self.bid_price
        }
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bar {
    pub t: String,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// Brokerage operations the execution core depends on.
///
/// Implementations must be safe for concurrent use: one instance is shared
/// across all of a user's agents within a single pipeline run.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account(&self) -> Result<AccountInfo>;

    async fn is_market_open(&self) -> Result<MarketClock>;

    async fn place_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo>;

    #[allow(clippy::too_many_arguments)]
    async fn place_limit_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        limit_price: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo>;

    async fn place_stop_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        stop_price: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo>;

    #[allow(clippy::too_many_arguments)]
    async fn place_stop_limit_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        stop_price: f64,
        limit_price: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo>;

    async fn place_trailing_stop_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        trail_percent: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo>;

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo>;

    async fn get_orders(
        &self,
        status: Option<&str>,
        limit: Option<usize>,
        symbols: Option<&[String]>,
    ) -> Result<Vec<OrderInfo>>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn cancel_all_orders(&self) -> Result<()>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>>;

    /// Market exit for `qty` shares (all shares when None).
    async fn close_position(&self, symbol: &str, qty: Option<f64>) -> Result<OrderInfo>;

    async fn close_all_positions(&self) -> Result<Vec<OrderInfo>>;

    async fn get_latest_quote(&self, symbol: &str) -> Result<Quote>;

    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<&str>,
        end: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>>;
}

/// Produces a broker connection for a user's stored credentials, or None
/// when the user has none.  Injected into the monitor and the pipeline so
/// both are testable against the in-memory broker double.
pub type BrokerFactory<'a> = dyn Fn(&UserCreds) -> Option<Arc<dyn Broker>> + Send + Sync + 'a;

// ---------------------------------------------------------------------------
// In-memory broker double for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// Scriptable broker double.  Orders fill immediately at the configured
    /// per-symbol price; every submission and cancellation is recorded for
    /// assertions.
    pub struct MockBroker {
        pub account: Mutex<AccountInfo>,
        pub clock: Mutex<MarketClock>,
        pub prices: Mutex<HashMap<String, f64>>,
        pub submitted: Mutex<Vec<OrderInfo>>,
        pub cancelled: Mutex<Vec<String>>,
        pub positions: Mutex<Vec<BrokerPosition>>,
        next_id: Mutex<u64>,
    }

    impl MockBroker {
        pub fn new(equity: f64, buying_power: f64, market_open: bool) -> Self {
            Self {
                account: Mutex::new(AccountInfo {
                    equity,
                    buying_power,
                    cash: buying_power,
                    portfolio_value: equity,
                    status: "ACTIVE".to_string(),
                    daytrade_count: 0,
                }),
                clock: Mutex::new(MarketClock {
                    is_open: market_open,
                    next_open: None,
                    next_close: None,
                }),
                prices: Mutex::new(HashMap::new()),
                submitted: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                positions: Mutex::new(Vec::new()),
                next_id: Mutex::new(1),
            }
        }

        pub fn set_price(&self, symbol: &str, price: f64) {
            self.prices.lock().insert(symbol.to_string(), price);
        }

        fn fill(&self, symbol: &str, qty: f64, side: &str, order_type: &str) -> OrderInfo {
            let mut next = self.next_id.lock();
            let id = format!("mock-{}", *next);
            *next += 1;

            let price = self.prices.lock().get(symbol).copied().unwrap_or(0.0);
            let order = OrderInfo {
                id,
                client_order_id: None,
                symbol: symbol.to_string(),
                qty,
                filled_qty: qty,
                side: side.to_string(),
                order_type: order_type.to_string(),
                status: "filled".to_string(),
                limit_price: None,
                stop_price: None,
                filled_avg_price: if price > 0.0 { Some(price) } else { None },
                submitted_at: None,
            };
            self.submitted.lock().push(order.clone());
            order
        }

        /// Submitted orders of a given type, for assertions.
        pub fn submitted_of_type(&self, order_type: &str) -> Vec<OrderInfo> {
            self.submitted
                .lock()
                .iter()
                .filter(|o| o.order_type == order_type)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Broker for MockBroker {
        async fn get_account(&self) -> Result<AccountInfo> {
            Ok(self.account.lock().clone())
        }

        async fn is_market_open(&self) -> Result<MarketClock> {
            Ok(self.clock.lock().clone())
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            qty: f64,
            side: &str,
            _time_in_force: &str,
            _client_order_id: Option<String>,
        ) -> Result<OrderInfo> {
            Ok(self.fill(symbol, qty, side, "market"))
        }

        async fn place_limit_order(
            &self,
            symbol: &str,
            qty: f64,
            side: &str,
            limit_price: f64,
            time_in_force: &str,
            _client_order_id: Option<String>,
        ) -> Result<OrderInfo> {
            let mut order = self.fill(symbol, qty, side, "limit");
            order.limit_price = Some(limit_price);
            // GTC take-profit legs rest at the broker instead of filling.
            if time_in_force == "gtc" {
                order.status = "accepted".to_string();
                order.filled_qty = 0.0;
                order.filled_avg_price = None;
                let mut submitted = self.submitted.lock();
                let last = submitted.last_mut().unwrap();
                last.status = "accepted".to_string();
                last.filled_qty = 0.0;
                last.filled_avg_price = None;
                last.limit_price = Some(limit_price);
            } else {
                self.submitted.lock().last_mut().unwrap().limit_price = Some(limit_price);
            }
            Ok(order)
        }

        async fn place_stop_order(
            &self,
            symbol: &str,
            qty: f64,
            side: &str,
            stop_price: f64,
            _time_in_force: &str,
            _client_order_id: Option<String>,
        ) -> Result<OrderInfo> {
            let mut order = self.fill(symbol, qty, side, "stop");
            order.stop_price = Some(stop_price);
            order.status = "accepted".to_string();
            order.filled_qty = 0.0;
            order.filled_avg_price = None;
            let mut submitted = self.submitted.lock();
            let last = submitted.last_mut().unwrap();
            last.stop_price = Some(stop_price);
            last.status = "accepted".to_string();
            last.filled_qty = 0.0;
            last.filled_avg_price = None;
            Ok(order)
        }

        async fn place_stop_limit_order(
            &self,
            symbol: &str,
            qty: f64,
            side: &str,
            stop_price: f64,
            limit_price: f64,
            _time_in_force: &str,
            _client_order_id: Option<String>,
        ) -> Result<OrderInfo> {
            let mut order = self.fill(symbol, qty, side, "stop_limit");
            order.stop_price = Some(stop_price);
            order.limit_price = Some(limit_price);
            Ok(order)
        }

        async fn place_trailing_stop_order(
            &self,
            symbol: &str,
            qty: f64,
            side: &str,
            _trail_percent: f64,
            _time_in_force: &str,
            _client_order_id: Option<String>,
        ) -> Result<OrderInfo> {
            Ok(self.fill(symbol, qty, side, "trailing_stop"))
        }

        async fn get_order(&self, order_id: &str) -> Result<OrderInfo> {
            self.submitted
                .lock()
                .iter()
                .find(|o| o.id == order_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("order {order_id} not found"))
        }

        async fn get_orders(
            &self,
            status: Option<&str>,
            limit: Option<usize>,
            _symbols: Option<&[String]>,
        ) -> Result<Vec<OrderInfo>> {
            let orders: Vec<OrderInfo> = self
                .submitted
                .lock()
                .iter()
                .filter(|o| status.map_or(true, |s| o.status == s))
                .cloned()
                .collect();
            Ok(match limit {
                Some(n) => orders.into_iter().take(n).collect(),
                None => orders,
            })
        }

        async fn cancel_order(&self, order_id: &str) -> Result<()> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(())
        }

        async fn cancel_all_orders(&self) -> Result<()> {
            Ok(())
        }

        async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.positions.lock().clone())
        }

        async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
            Ok(self
                .positions
                .lock()
                .iter()
                .find(|p| p.symbol == symbol)
                .cloned())
        }

        async fn close_position(&self, symbol: &str, qty: Option<f64>) -> Result<OrderInfo> {
            let held = self
                .positions
                .lock()
                .iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.qty);
            let close_qty = qty.or(held).unwrap_or(0.0);
            Ok(self.fill(symbol, close_qty, "sell", "close"))
        }

        async fn close_all_positions(&self) -> Result<Vec<OrderInfo>> {
            let symbols: Vec<(String, f64)> = self
                .positions
                .lock()
                .iter()
                .map(|p| (p.symbol.clone(), p.qty))
                .collect();
            let mut orders = Vec::new();
            for (symbol, qty) in symbols {
                orders.push(self.fill(&symbol, qty, "sell", "close"));
            }
            Ok(orders)
        }

        async fn get_latest_quote(&self, symbol: &str) -> Result<Quote> {
            let price = self.prices.lock().get(symbol).copied().unwrap_or(0.0);
            Ok(Quote {
                symbol: symbol.to_string(),
                bid_price: price,
                ask_price: price,
                timestamp: None,
            })
        }

        async fn get_bars(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _start: Option<&str>,
            _end: Option<&str>,
            _limit: Option<usize>,
        ) -> Result<Vec<Bar>> {
            Ok(Vec::new())
        }
    }
}
