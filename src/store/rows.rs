// =============================================================================
// Row types for the relational store
// =============================================================================
//
// One struct per table the execution core reads or writes.  Strategy and risk
// parameters are typed records with `deny_unknown_fields`: an agent row
// carrying an unrecognised option fails loudly instead of being silently
// ignored.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentStatus, PositionSide, PositionStatus, RebalanceFrequency};

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

fn default_momentum_lookback_days() -> u32 {
    180
}

fn default_min_market_cap() -> u64 {
    1_000_000_000
}

fn default_max_positions() -> usize {
    10
}

fn default_weekly() -> RebalanceFrequency {
    RebalanceFrequency::Weekly
}

fn default_min_interval_hours() -> f64 {
    1.0
}

/// Strategy configuration options recognised on an agent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyParams {
    #[serde(default = "default_momentum_lookback_days")]
    pub momentum_lookback_days: u32,

    #[serde(default = "default_min_market_cap")]
    pub min_market_cap: u64,

    /// Sector whitelist; empty means all sectors.
    #[serde(default)]
    pub sectors: Vec<String>,

    #[serde(default)]
    pub exclude_tickers: Vec<String>,

    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Overrides the preset's sentiment alpha weight when set.
    #[serde(default)]
    pub sentiment_weight: Option<f64>,

    #[serde(default = "default_weekly")]
    pub rebalance_frequency: RebalanceFrequency,

    /// Minimum hours between intraday rebalances.
    #[serde(default = "default_min_interval_hours")]
    pub min_interval_hours: f64,

    #[serde(default)]
    pub max_holding_days: Option<i64>,

    /// Explicit trading universe; empty means the full stocks table.
    #[serde(default)]
    pub universe: Vec<String>,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            momentum_lookback_days: default_momentum_lookback_days(),
            min_market_cap: default_min_market_cap(),
            sectors: Vec::new(),
            exclude_tickers: Vec::new(),
            max_positions: default_max_positions(),
            sentiment_weight: None,
            rebalance_frequency: default_weekly(),
            min_interval_hours: default_min_interval_hours(),
            max_holding_days: None,
            universe: Vec::new(),
        }
    }
}

fn default_max_drawdown_limit() -> f64 {
    0.20
}

fn default_stop_loss_type() -> String {
    "ma_200".to_string()
}

fn default_stop_loss_percentage() -> f64 {
    0.10
}

fn default_max_position_size_pct() -> f64 {
    0.15
}

fn default_min_risk_reward_ratio() -> f64 {
    2.0
}

fn default_max_sector_concentration() -> f64 {
    0.50
}

/// Risk-management options recognised on an agent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskParams {
    /// Unrealised-loss fraction of allocated capital that trips the
    /// circuit breaker.
    #[serde(default = "default_max_drawdown_limit")]
    pub max_drawdown_limit: f64,

    #[serde(default = "default_stop_loss_type")]
    pub stop_loss_type: String,

    #[serde(default = "default_stop_loss_percentage")]
    pub stop_loss_percentage: f64,

    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,

    #[serde(default = "default_min_risk_reward_ratio")]
    pub min_risk_reward_ratio: f64,

    #[serde(default = "default_max_sector_concentration")]
    pub max_sector_concentration: f64,

    #[serde(default)]
    pub max_holding_days: Option<i64>,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_drawdown_limit: default_max_drawdown_limit(),
            stop_loss_type: default_stop_loss_type(),
            stop_loss_percentage: default_stop_loss_percentage(),
            max_position_size_pct: default_max_position_size_pct(),
            min_risk_reward_ratio: default_min_risk_reward_ratio(),
            max_sector_concentration: default_max_sector_concentration(),
            max_holding_days: None,
        }
    }
}

/// A configured trading agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub persona: String,
    pub status: AgentStatus,
    /// One of the eight preset names (e.g. "momentum", "trend_following").
    pub strategy_type: String,
    pub strategy_params: StrategyParams,
    pub risk_params: RiskParams,
    pub allocated_capital: f64,
    pub cash_balance: f64,
    pub time_horizon_days: i64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A persistent position record owned by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub id: i64,
    pub agent_id: String,
    pub ticker: String,
    pub side: PositionSide,
    pub shares: f64,
    pub entry_price: f64,
    pub entry_date: NaiveDate,
    pub entry_rationale: Option<String>,
    pub current_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub target_price: Option<f64>,
    pub max_holding_days: Option<i64>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_date: Option<NaiveDate>,
    pub exit_rationale: Option<String>,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub stop_order_id: Option<String>,
    pub tp_order_id: Option<String>,
}

impl PositionRow {
    /// Market value at `price` (falls back through current and entry price).
    pub fn market_price(&self, snapshot_price: Option<f64>) -> f64 {
        self.current_price
            .or(snapshot_price)
            .unwrap_or(self.entry_price)
    }
}

/// Fields required to open a new position row.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub agent_id: String,
    pub ticker: String,
    pub side: PositionSide,
    pub shares: f64,
    pub entry_price: f64,
    pub entry_date: NaiveDate,
    pub entry_rationale: String,
    pub current_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub target_price: Option<f64>,
    pub max_holding_days: Option<i64>,
    pub entry_order_id: Option<String>,
    pub stop_order_id: Option<String>,
    pub tp_order_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Stocks & history
// ---------------------------------------------------------------------------

/// A stock universe row with fundamentals, technicals, factor scores, and
/// sentiment readings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StockRow {
    pub symbol: String,
    pub price: Option<f64>,
    pub sector: Option<String>,

    // Fundamentals
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub roe: Option<f64>,
    pub profit_margin: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub dividend_growth_5y: Option<f64>,

    // Technicals
    pub ma_30: Option<f64>,
    pub ma_100: Option<f64>,
    pub ma_200: Option<f64>,
    pub atr: Option<f64>,

    // Factor scores (0-100)
    pub momentum_score: Option<f64>,
    pub value_score: Option<f64>,
    pub quality_score: Option<f64>,
    pub dividend_score: Option<f64>,
    pub volatility_score: Option<f64>,
    pub composite_score: Option<f64>,

    // Sentiment (-100..+100)
    pub news_sentiment: Option<f64>,
    pub social_sentiment: Option<f64>,
    pub combined_sentiment: Option<f64>,
    pub sentiment_velocity: Option<f64>,
}

/// One closing price observation.
#[derive(Debug, Clone)]
pub struct PriceHistoryRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub price: f64,
}

/// One combined-sentiment observation.
#[derive(Debug, Clone)]
pub struct SentimentHistoryRow {
    pub symbol: String,
    pub combined_sentiment: f64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Macro & alternative data
// ---------------------------------------------------------------------------

/// Latest state of one macro indicator series (upserted on indicator_name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroIndicatorRow {
    pub indicator_name: String,
    pub value: Option<f64>,
    pub z_score: f64,
    pub percentile: f64,
    pub rate_of_change: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Per-symbol insider filing aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsiderSignalRow {
    pub symbol: String,
    pub filing_count: i64,
    pub buy_ratio: f64,
    pub cluster_score: f64,
    pub net_sentiment: f64,
    /// Transaction codes are not parsed from the Form-4 XML yet; while this
    /// is set, buy_ratio is a filing-count placeholder.
    pub pending_xml_parse: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Per-symbol short-interest aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortInterestRow {
    pub symbol: String,
    pub short_pct_float: Option<f64>,
    pub short_ratio: Option<f64>,
    pub short_interest_score: f64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Users (credential columns only)
// ---------------------------------------------------------------------------

/// Broker credentials stored on the owning user.
#[derive(Debug, Clone)]
pub struct UserCreds {
    pub alpaca_api_key: Option<String>,
    pub alpaca_api_secret: Option<String>,
    pub alpaca_paper_mode: bool,
}
