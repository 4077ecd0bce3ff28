// =============================================================================
// Alpaca REST API Client — key-pair header authentication
// =============================================================================
//
// SECURITY: the secret key is only ever sent as a request header and is never
// logged or serialized.  Every request carries a bounded timeout so a hung
// broker call degrades to a logged failure instead of stalling the pipeline.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{AccountInfo, Bar, Broker, BrokerPosition, MarketClock, OrderInfo, Quote};

/// Trading mode for the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Paper,
    Live,
}

impl std::fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

const PAPER_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_URL: &str = "https://api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

/// Alpaca REST client implementing the [`Broker`] contract.
#[derive(Clone)]
pub struct AlpacaBroker {
    base_url: String,
    data_url: String,
    client: reqwest::Client,
}

impl AlpacaBroker {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `AlpacaBroker`.
    ///
    /// # Arguments
    /// * `api_key`    — sent as the APCA-API-KEY-ID header.
    /// * `api_secret` — sent as the APCA-API-SECRET-KEY header, never logged.
    /// * `mode`       — paper or live endpoint selection.
    /// * `timeout_secs` — per-request timeout.
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        mode: BrokerMode,
        timeout_secs: u64,
    ) -> Self {
        let api_key = api_key.into();
        let api_secret = api_secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(mut val) = HeaderValue::from_str(&api_secret) {
            val.set_sensitive(true);
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        let base_url = match mode {
            BrokerMode::Paper => PAPER_URL.to_string(),
            BrokerMode::Live => LIVE_URL.to_string(),
        };

        debug!(mode = %mode, "AlpacaBroker initialised");

        Self {
            base_url,
            data_url: DATA_URL.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Request helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str, what: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {what} request failed"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("Alpaca GET {what} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn post_order(&self, body: Value) -> Result<OrderInfo> {
        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("POST /v2/orders request failed")?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("Alpaca POST /v2/orders returned {status}: {payload}");
        }
        Ok(Self::parse_order(&payload))
    }

    fn parse_order(v: &Value) -> OrderInfo {
        OrderInfo {
            id: v["id"].as_str().unwrap_or_default().to_string(),
            client_order_id: v["client_order_id"].as_str().map(String::from),
            symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
            qty: Self::num_field(v, "qty"),
            filled_qty: Self::num_field(v, "filled_qty"),
            side: v["side"].as_str().unwrap_or_default().to_string(),
            order_type: v["order_type"]
                .as_str()
                .or_else(|| v["type"].as_str())
                .unwrap_or_default()
                .to_string(),
            status: v["status"].as_str().unwrap_or_default().to_string(),
            limit_price: Self::opt_num_field(v, "limit_price"),
            stop_price: Self::opt_num_field(v, "stop_price"),
            filled_avg_price: Self::opt_num_field(v, "filled_avg_price"),
            submitted_at: v["submitted_at"].as_str().map(String::from),
        }
    }

    // Alpaca returns numeric fields as JSON strings.
    fn num_field(v: &Value, key: &str) -> f64 {
        Self::opt_num_field(v, key).unwrap_or(0.0)
    }

    fn opt_num_field(v: &Value, key: &str) -> Option<f64> {
        match &v[key] {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    fn parse_position(v: &Value) -> BrokerPosition {
        BrokerPosition {
            symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
            qty: Self::num_field(v, "qty"),
            avg_entry_price: Self::num_field(v, "avg_entry_price"),
            market_value: Self::num_field(v, "market_value"),
            unrealized_pl: Self::num_field(v, "unrealized_pl"),
            side: v["side"].as_str().unwrap_or("long").to_string(),
        }
    }
}

#[async_trait]
impl Broker for AlpacaBroker {
    async fn get_account(&self) -> Result<AccountInfo> {
        let url = format!("{}/v2/account", self.base_url);
        let body = self.get_json(&url, "/v2/account").await?;

        Ok(AccountInfo {
            equity: Self::num_field(&body, "equity"),
            buying_power: Self::num_field(&body, "buying_power"),
            cash: Self::num_field(&body, "cash"),
            portfolio_value: Self::num_field(&body, "portfolio_value"),
            status: body["status"].as_str().unwrap_or_default().to_string(),
            daytrade_count: body["daytrade_count"].as_i64().unwrap_or(0),
        })
    }

    async fn is_market_open(&self) -> Result<MarketClock> {
        let url = format!("{}/v2/clock", self.base_url);
        let body = self.get_json(&url, "/v2/clock").await?;

        Ok(MarketClock {
            is_open: body["is_open"].as_bool().unwrap_or(false),
            next_open: body["next_open"].as_str().map(String::from),
            next_close: body["next_close"].as_str().map(String::from),
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo> {
        self.post_order(json!({
            "symbol": symbol.to_uppercase(),
            "qty": qty.to_string(),
            "side": side,
            "type": "market",
            "time_in_force": time_in_force,
            "client_order_id": client_order_id,
        }))
        .await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        limit_price: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo> {
        self.post_order(json!({
            "symbol": symbol.to_uppercase(),
            "qty": qty.to_string(),
            "side": side,
            "type": "limit",
            "limit_price": limit_price.to_string(),
            "time_in_force": time_in_force,
            "client_order_id": client_order_id,
        }))
        .await
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        stop_price: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo> {
        self.post_order(json!({
            "symbol": symbol.to_uppercase(),
            "qty": qty.to_string(),
            "side": side,
            "type": "stop",
            "stop_price": stop_price.to_string(),
            "time_in_force": time_in_force,
            "client_order_id": client_order_id,
        }))
        .await
    }

    async fn place_stop_limit_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        stop_price: f64,
        limit_price: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo> {
        self.post_order(json!({
            "symbol": symbol.to_uppercase(),
            "qty": qty.to_string(),
            "side": side,
            "type": "stop_limit",
            "stop_price": stop_price.to_string(),
            "limit_price": limit_price.to_string(),
            "time_in_force": time_in_force,
            "client_order_id": client_order_id,
        }))
        .await
    }

    async fn place_trailing_stop_order(
        &self,
        symbol: &str,
        qty: f64,
        side: &str,
        trail_percent: f64,
        time_in_force: &str,
        client_order_id: Option<String>,
    ) -> Result<OrderInfo> {
        self.post_order(json!({
            "symbol": symbol.to_uppercase(),
            "qty": qty.to_string(),
            "side": side,
            "type": "trailing_stop",
            "trail_percent": trail_percent.to_string(),
            "time_in_force": time_in_force,
            "client_order_id": client_order_id,
        }))
        .await
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let body = self.get_json(&url, "/v2/orders/:id").await?;
        Ok(Self::parse_order(&body))
    }

    async fn get_orders(
        &self,
        status: Option<&str>,
        limit: Option<usize>,
        symbols: Option<&[String]>,
    ) -> Result<Vec<OrderInfo>> {
        let mut url = format!(
            "{}/v2/orders?status={}",
            self.base_url,
            status.unwrap_or("open")
        );
        if let Some(n) = limit {
            url.push_str(&format!("&limit={n}"));
        }
        if let Some(syms) = symbols {
            url.push_str(&format!("&symbols={}", syms.join(",")));
        }

        let body = self.get_json(&url, "/v2/orders").await?;
        let orders = body
            .as_array()
            .map(|arr| arr.iter().map(Self::parse_order).collect())
            .unwrap_or_default();
        Ok(orders)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /v2/orders/:id request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Alpaca cancel order {order_id} returned {}", resp.status());
        }
        Ok(())
    }

    async fn cancel_all_orders(&self) -> Result<()> {
        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /v2/orders request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Alpaca cancel all orders returned {}", resp.status());
        }
        Ok(())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = format!("{}/v2/positions", self.base_url);
        let body = self.get_json(&url, "/v2/positions").await?;
        Ok(body
            .as_array()
            .map(|arr| arr.iter().map(Self::parse_position).collect())
            .unwrap_or_default())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<BrokerPosition>> {
        let url = format!("{}/v2/positions/{}", self.base_url, symbol.to_uppercase());
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /v2/positions/:symbol request failed")?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse position response")?;
        if !status.is_success() {
            anyhow::bail!("Alpaca GET /v2/positions/{symbol} returned {status}: {body}");
        }
        Ok(Some(Self::parse_position(&body)))
    }

    async fn close_position(&self, symbol: &str, qty: Option<f64>) -> Result<OrderInfo> {
        let mut url = format!("{}/v2/positions/{}", self.base_url, symbol.to_uppercase());
        if let Some(q) = qty {
            url.push_str(&format!("?qty={q}"));
        }

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /v2/positions/:symbol request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse close-position response")?;

        if !status.is_success() {
            warn!(symbol, %status, "close position rejected");
            anyhow::bail!("Alpaca close position {symbol} returned {status}: {body}");
        }
        Ok(Self::parse_order(&body))
    }

    async fn close_all_positions(&self) -> Result<Vec<OrderInfo>> {
        let url = format!("{}/v2/positions", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /v2/positions request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse close-all response")?;
        if !status.is_success() {
            anyhow::bail!("Alpaca close all positions returned {status}: {body}");
        }
        Ok(body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| item.get("body").map(Self::parse_order))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_latest_quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!(
            "{}/v2/stocks/{}/quotes/latest",
            self.data_url,
            symbol.to_uppercase()
        );
        let body = self.get_json(&url, "latest quote").await?;
        let quote = &body["quote"];

        Ok(Quote {
            symbol: symbol.to_uppercase(),
            bid_price: quote["bp"].as_f64().unwrap_or(0.0),
            ask_price: quote["ap"].as_f64().unwrap_or(0.0),
            timestamp: quote["t"].as_str().map(String::from),
        })
    }

    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<&str>,
        end: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/v2/stocks/{}/bars?timeframe={}",
            self.data_url,
            symbol.to_uppercase(),
            timeframe
        );
        if let Some(s) = start {
            url.push_str(&format!("&start={s}"));
        }
        if let Some(e) = end {
            url.push_str(&format!("&end={e}"));
        }
        if let Some(n) = limit {
            url.push_str(&format!("&limit={n}"));
        }

        let body = self.get_json(&url, "bars").await?;
        let bars = body["bars"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|b| Bar {
                        t: b["t"].as_str().unwrap_or_default().to_string(),
                        o: b["o"].as_f64().unwrap_or(0.0),
                        h: b["h"].as_f64().unwrap_or(0.0),
                        l: b["l"].as_f64().unwrap_or(0.0),
                        c: b["c"].as_f64().unwrap_or(0.0),
                        v: b["v"].as_f64().unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(bars)
    }
}
