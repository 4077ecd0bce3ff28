// =============================================================================
// Relational Store — SQLite persistence for the execution core
// =============================================================================
//
// Single shared connection behind a parking_lot::Mutex, WAL mode for
// concurrent reads during writes.  No cross-table transactions: the pipeline
// tolerates partial persistence and recomputes from truth on the next run.
// =============================================================================

pub mod rows;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};

use crate::types::{ActivityType, AgentStatus, PositionSide, PositionStatus};
use rows::{
    AgentRow, InsiderSignalRow, MacroIndicatorRow, NewPosition, PositionRow, RiskParams,
    ShortInterestRow, StockRow, StrategyParams, UserCreds,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    alpaca_api_key TEXT,
    alpaca_api_secret TEXT,
    alpaca_paper_mode INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    persona TEXT NOT NULL DEFAULT 'analytical',
    status TEXT NOT NULL DEFAULT 'active',
    strategy_type TEXT NOT NULL,
    strategy_params TEXT NOT NULL DEFAULT '{}',
    risk_params TEXT NOT NULL DEFAULT '{}',
    allocated_capital REAL NOT NULL DEFAULT 0,
    cash_balance REAL NOT NULL DEFAULT 0,
    time_horizon_days INTEGER NOT NULL DEFAULT 365,
    start_date TEXT,
    end_date TEXT
);

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    side TEXT NOT NULL DEFAULT 'long',
    shares REAL NOT NULL,
    entry_price REAL NOT NULL,
    entry_date TEXT NOT NULL,
    entry_rationale TEXT,
    current_price REAL,
    unrealized_pnl REAL,
    unrealized_pnl_pct REAL,
    stop_loss_price REAL,
    target_price REAL,
    max_holding_days INTEGER,
    status TEXT NOT NULL DEFAULT 'open',
    exit_price REAL,
    exit_date TEXT,
    exit_rationale TEXT,
    realized_pnl REAL,
    realized_pnl_pct REAL,
    entry_order_id TEXT,
    exit_order_id TEXT,
    stop_order_id TEXT,
    tp_order_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_positions_agent_status
    ON positions(agent_id, status);

CREATE TABLE IF NOT EXISTS agent_activity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    ticker TEXT,
    details TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activity_agent_type
    ON agent_activity(agent_id, activity_type, created_at DESC);

CREATE TABLE IF NOT EXISTS stocks (
    symbol TEXT PRIMARY KEY,
    price REAL,
    sector TEXT,
    pe_ratio REAL,
    pb_ratio REAL,
    roe REAL,
    profit_margin REAL,
    debt_to_equity REAL,
    dividend_yield REAL,
    dividend_growth_5y REAL,
    ma_30 REAL,
    ma_100 REAL,
    ma_200 REAL,
    atr REAL,
    momentum_score REAL,
    value_score REAL,
    quality_score REAL,
    dividend_score REAL,
    volatility_score REAL,
    composite_score REAL,
    news_sentiment REAL,
    social_sentiment REAL,
    combined_sentiment REAL,
    sentiment_velocity REAL
);

CREATE TABLE IF NOT EXISTS price_history (
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    price REAL NOT NULL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE IF NOT EXISTS sentiment_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    combined_sentiment REAL NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sentiment_history_symbol
    ON sentiment_history(symbol, recorded_at);

CREATE TABLE IF NOT EXISTS macro_indicators (
    indicator_name TEXT PRIMARY KEY,
    value REAL,
    z_score REAL NOT NULL DEFAULT 0,
    percentile REAL NOT NULL DEFAULT 50,
    rate_of_change REAL NOT NULL DEFAULT 0,
    series TEXT NOT NULL DEFAULT '[]',
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS insider_signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    filing_count INTEGER NOT NULL DEFAULT 0,
    buy_ratio REAL NOT NULL DEFAULT 0.5,
    cluster_score REAL NOT NULL DEFAULT 0,
    net_sentiment REAL NOT NULL DEFAULT 0,
    pending_xml_parse INTEGER NOT NULL DEFAULT 1,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS short_interest (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    short_pct_float REAL,
    short_ratio REAL,
    short_interest_score REAL NOT NULL DEFAULT 0,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS macro_risk_overlay_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    risk_scale_factor REAL NOT NULL,
    composite_risk_score REAL NOT NULL,
    regime_label TEXT NOT NULL,
    signal_contributions TEXT NOT NULL DEFAULT '{}',
    warnings TEXT NOT NULL DEFAULT '[]',
    recorded_at TEXT NOT NULL
);
"#;

/// Freshest persisted macro overlay computation.
#[derive(Debug, Clone)]
pub struct OverlayStateRow {
    pub risk_scale_factor: f64,
    pub composite_risk_score: f64,
    pub regime_label: String,
    pub recorded_at: DateTime<Utc>,
}

/// SQLite-backed store shared by all pipeline stages.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database at {}", path.as_ref().display()))?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
            .context("failed to set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;

        info!(path = %path.as_ref().display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Agents & users
    // -------------------------------------------------------------------------

    /// All agents with status = 'active'.
    pub fn active_agents(&self) -> Result<Vec<AgentRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, persona, status, strategy_type, strategy_params, \
             risk_params, allocated_capital, cash_balance, time_horizon_days, start_date, \
             end_date FROM agents WHERE status = 'active'",
        )?;

        let rows = stmt.query_map([], |row| {
            let strategy_params: String = row.get(6)?;
            let risk_params: String = row.get(7)?;
            let status: String = row.get(4)?;
            let start_date: Option<String> = row.get(11)?;
            let end_date: Option<String> = row.get(12)?;
            Ok((
                AgentRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    persona: row.get(3)?,
                    status: AgentStatus::Active,
                    strategy_type: row.get(5)?,
                    strategy_params: StrategyParams::default(),
                    risk_params: RiskParams::default(),
                    allocated_capital: row.get(8)?,
                    cash_balance: row.get(9)?,
                    time_horizon_days: row.get(10)?,
                    start_date: start_date.and_then(|d| d.parse().ok()),
                    end_date: end_date.and_then(|d| d.parse().ok()),
                },
                status,
                strategy_params,
                risk_params,
            ))
        })?;

        let mut agents = Vec::new();
        for row in rows {
            let (mut agent, status, sp, rp) = row?;
            agent.status = serde_json::from_value(Value::String(status))
                .unwrap_or(AgentStatus::Active);
            // Unknown keys in the stored params are a configuration error;
            // surface them instead of trading on a half-understood config.
            agent.strategy_params = serde_json::from_str(&sp).with_context(|| {
                format!("agent {}: unrecognised strategy_params", agent.id)
            })?;
            agent.risk_params = serde_json::from_str(&rp)
                .with_context(|| format!("agent {}: unrecognised risk_params", agent.id))?;
            agents.push(agent);
        }
        Ok(agents)
    }

    pub fn update_agent_cash(&self, agent_id: &str, cash_balance: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET cash_balance = ?1 WHERE id = ?2",
            params![cash_balance, agent_id],
        )?;
        Ok(())
    }

    pub fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.to_string(), agent_id],
        )?;
        Ok(())
    }

    /// Broker credential columns for a user.
    pub fn user_broker_creds(&self, user_id: &str) -> Result<Option<UserCreds>> {
        let conn = self.conn.lock();
        let creds = conn
            .query_row(
                "SELECT alpaca_api_key, alpaca_api_secret, alpaca_paper_mode \
                 FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(UserCreds {
                        alpaca_api_key: row.get(0)?,
                        alpaca_api_secret: row.get(1)?,
                        alpaca_paper_mode: row.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(creds)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Open positions for one agent.
    pub fn open_positions(&self, agent_id: &str) -> Result<Vec<PositionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, ticker, side, shares, entry_price, entry_date, \
             entry_rationale, current_price, unrealized_pnl, unrealized_pnl_pct, \
             stop_loss_price, target_price, max_holding_days, status, exit_price, \
             exit_date, exit_rationale, realized_pnl, realized_pnl_pct, entry_order_id, \
             exit_order_id, stop_order_id, tp_order_id \
             FROM positions WHERE agent_id = ?1 AND status = 'open'",
        )?;

        let rows = stmt.query_map(params![agent_id], Self::map_position)?;
        let mut positions = Vec::new();
        for row in rows {
            positions.push(row?);
        }
        Ok(positions)
    }

    fn map_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRow> {
        let side: String = row.get(3)?;
        let status: String = row.get(14)?;
        let entry_date: String = row.get(6)?;
        let exit_date: Option<String> = row.get(16)?;
        Ok(PositionRow {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            ticker: row.get(2)?,
            side: if side == "short" {
                PositionSide::Short
            } else {
                PositionSide::Long
            },
            shares: row.get(4)?,
            entry_price: row.get(5)?,
            entry_date: entry_date.parse().unwrap_or_default(),
            entry_rationale: row.get(7)?,
            current_price: row.get(8)?,
            unrealized_pnl: row.get(9)?,
            unrealized_pnl_pct: row.get(10)?,
            stop_loss_price: row.get(11)?,
            target_price: row.get(12)?,
            max_holding_days: row.get(13)?,
            status: if status == "closed" {
                PositionStatus::Closed
            } else {
                PositionStatus::Open
            },
            exit_price: row.get(15)?,
            exit_date: exit_date.and_then(|d| d.parse().ok()),
            exit_rationale: row.get(17)?,
            realized_pnl: row.get(18)?,
            realized_pnl_pct: row.get(19)?,
            entry_order_id: row.get(20)?,
            exit_order_id: row.get(21)?,
            stop_order_id: row.get(22)?,
            tp_order_id: row.get(23)?,
        })
    }

    /// Insert a new open position row and return its id.
    pub fn insert_position(&self, pos: &NewPosition) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions (agent_id, ticker, side, shares, entry_price, entry_date, \
             entry_rationale, current_price, stop_loss_price, target_price, max_holding_days, \
             status, entry_order_id, stop_order_id, tp_order_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'open', ?12, ?13, ?14)",
            params![
                pos.agent_id,
                pos.ticker,
                pos.side.to_string(),
                pos.shares,
                pos.entry_price,
                pos.entry_date.to_string(),
                pos.entry_rationale,
                pos.current_price,
                pos.stop_loss_price,
                pos.target_price,
                pos.max_holding_days,
                pos.entry_order_id,
                pos.stop_order_id,
                pos.tp_order_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_position_shares(&self, position_id: i64, shares: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET shares = ?1 WHERE id = ?2",
            params![shares, position_id],
        )?;
        Ok(())
    }

    /// Refresh bracket order ids and exit levels after a cancel-and-replace.
    pub fn set_position_brackets(
        &self,
        position_id: i64,
        stop_order_id: Option<&str>,
        tp_order_id: Option<&str>,
        stop_loss_price: Option<f64>,
        target_price: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET stop_order_id = ?1, tp_order_id = ?2, \
             stop_loss_price = COALESCE(?3, stop_loss_price), \
             target_price = COALESCE(?4, target_price) WHERE id = ?5",
            params![stop_order_id, tp_order_id, stop_loss_price, target_price, position_id],
        )?;
        Ok(())
    }

    /// Refresh the live price (and derived unrealised P&L) on a position.
    pub fn update_position_price(
        &self,
        position_id: i64,
        current_price: f64,
        unrealized_pnl: f64,
        unrealized_pnl_pct: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET current_price = ?1, unrealized_pnl = ?2, \
             unrealized_pnl_pct = ?3 WHERE id = ?4",
            params![current_price, unrealized_pnl, unrealized_pnl_pct, position_id],
        )?;
        Ok(())
    }

    /// Transition a position to closed with exit bookkeeping.
    #[allow(clippy::too_many_arguments)]
    pub fn close_position_row(
        &self,
        position_id: i64,
        exit_price: Option<f64>,
        exit_date: NaiveDate,
        exit_rationale: &str,
        exit_order_id: Option<&str>,
        realized_pnl: Option<f64>,
        realized_pnl_pct: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET status = 'closed', exit_price = ?1, exit_date = ?2, \
             exit_rationale = ?3, exit_order_id = ?4, realized_pnl = ?5, \
             realized_pnl_pct = ?6, stop_order_id = NULL, tp_order_id = NULL WHERE id = ?7",
            params![
                exit_price,
                exit_date.to_string(),
                exit_rationale,
                exit_order_id,
                realized_pnl,
                realized_pnl_pct,
                position_id,
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stocks & price history
    // -------------------------------------------------------------------------

    pub fn stocks(&self) -> Result<Vec<StockRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, price, sector, pe_ratio, pb_ratio, roe, profit_margin, \
             debt_to_equity, dividend_yield, dividend_growth_5y, ma_30, ma_100, ma_200, atr, \
             momentum_score, value_score, quality_score, dividend_score, volatility_score, \
             composite_score, news_sentiment, social_sentiment, combined_sentiment, \
             sentiment_velocity FROM stocks",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(StockRow {
                symbol: row.get(0)?,
                price: row.get(1)?,
                sector: row.get(2)?,
                pe_ratio: row.get(3)?,
                pb_ratio: row.get(4)?,
                roe: row.get(5)?,
                profit_margin: row.get(6)?,
                debt_to_equity: row.get(7)?,
                dividend_yield: row.get(8)?,
                dividend_growth_5y: row.get(9)?,
                ma_30: row.get(10)?,
                ma_100: row.get(11)?,
                ma_200: row.get(12)?,
                atr: row.get(13)?,
                momentum_score: row.get(14)?,
                value_score: row.get(15)?,
                quality_score: row.get(16)?,
                dividend_score: row.get(17)?,
                volatility_score: row.get(18)?,
                composite_score: row.get(19)?,
                news_sentiment: row.get(20)?,
                social_sentiment: row.get(21)?,
                combined_sentiment: row.get(22)?,
                sentiment_velocity: row.get(23)?,
            })
        })?;

        let mut stocks = Vec::new();
        for row in rows {
            stocks.push(row?);
        }
        Ok(stocks)
    }

    pub fn upsert_stock(&self, stock: &StockRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stocks (symbol, price, sector, pe_ratio, pb_ratio, roe, \
             profit_margin, debt_to_equity, dividend_yield, dividend_growth_5y, ma_30, \
             ma_100, ma_200, atr, news_sentiment, social_sentiment, combined_sentiment, \
             sentiment_velocity) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
             ON CONFLICT(symbol) DO UPDATE SET price = excluded.price, sector = excluded.sector, \
             pe_ratio = excluded.pe_ratio, pb_ratio = excluded.pb_ratio, roe = excluded.roe, \
             profit_margin = excluded.profit_margin, debt_to_equity = excluded.debt_to_equity, \
             dividend_yield = excluded.dividend_yield, dividend_growth_5y = excluded.dividend_growth_5y, \
             ma_30 = excluded.ma_30, ma_100 = excluded.ma_100, ma_200 = excluded.ma_200, \
             atr = excluded.atr, news_sentiment = excluded.news_sentiment, \
             social_sentiment = excluded.social_sentiment, \
             combined_sentiment = excluded.combined_sentiment, \
             sentiment_velocity = excluded.sentiment_velocity",
            params![
                stock.symbol,
                stock.price,
                stock.sector,
                stock.pe_ratio,
                stock.pb_ratio,
                stock.roe,
                stock.profit_margin,
                stock.debt_to_equity,
                stock.dividend_yield,
                stock.dividend_growth_5y,
                stock.ma_30,
                stock.ma_100,
                stock.ma_200,
                stock.atr,
                stock.news_sentiment,
                stock.social_sentiment,
                stock.combined_sentiment,
                stock.sentiment_velocity,
            ],
        )?;
        Ok(())
    }

    pub fn update_stock_technicals(
        &self,
        symbol: &str,
        price: Option<f64>,
        ma_30: Option<f64>,
        ma_100: Option<f64>,
        ma_200: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stocks SET price = COALESCE(?1, price), ma_30 = ?2, ma_100 = ?3, \
             ma_200 = ?4 WHERE symbol = ?5",
            params![price, ma_30, ma_100, ma_200, symbol],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_stock_factors(
        &self,
        symbol: &str,
        momentum: f64,
        value: f64,
        quality: f64,
        dividend: f64,
        volatility: f64,
        composite: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stocks SET momentum_score = ?1, value_score = ?2, quality_score = ?3, \
             dividend_score = ?4, volatility_score = ?5, composite_score = ?6 WHERE symbol = ?7",
            params![momentum, value, quality, dividend, volatility, composite, symbol],
        )?;
        Ok(())
    }

    pub fn update_stock_sentiment(
        &self,
        symbol: &str,
        combined: f64,
        velocity: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stocks SET combined_sentiment = ?1, sentiment_velocity = ?2 WHERE symbol = ?3",
            params![combined, velocity, symbol],
        )?;
        Ok(())
    }

    pub fn insert_price_row(&self, symbol: &str, date: NaiveDate, price: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_history (symbol, date, price) VALUES (?1, ?2, ?3) \
             ON CONFLICT(symbol, date) DO UPDATE SET price = excluded.price",
            params![symbol, date.to_string(), price],
        )?;
        Ok(())
    }

    /// Closing prices per symbol, oldest to newest, capped at the most recent
    /// `max_days` trading days.
    pub fn price_history_map(&self, max_days: usize) -> Result<HashMap<String, Vec<f64>>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT symbol, price FROM price_history ORDER BY symbol, date ASC")?;

        let mut history: HashMap<String, Vec<f64>> = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (symbol, price) = row?;
            history.entry(symbol).or_default().push(price);
        }

        for prices in history.values_mut() {
            if prices.len() > max_days {
                let excess = prices.len() - max_days;
                prices.drain(..excess);
            }
        }

        debug!(symbols = history.len(), "price history loaded");
        Ok(history)
    }

    // -------------------------------------------------------------------------
    // Sentiment history
    // -------------------------------------------------------------------------

    pub fn append_sentiment_history(
        &self,
        symbol: &str,
        combined_sentiment: f64,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sentiment_history (symbol, combined_sentiment, recorded_at) \
             VALUES (?1, ?2, ?3)",
            params![symbol, combined_sentiment, recorded_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Combined-sentiment series per symbol since `cutoff`, oldest first.
    pub fn sentiment_history_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<f64>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, combined_sentiment FROM sentiment_history \
             WHERE recorded_at >= ?1 ORDER BY recorded_at ASC",
        )?;

        let mut grouped: HashMap<String, Vec<f64>> = HashMap::new();
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (symbol, value) = row?;
            grouped.entry(symbol).or_default().push(value);
        }
        Ok(grouped)
    }

    /// Most recent combined sentiment per symbol before `cutoff` (velocity
    /// baseline for the sentiment stage).
    pub fn latest_sentiment_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, combined_sentiment FROM sentiment_history \
             WHERE recorded_at < ?1 ORDER BY recorded_at ASC",
        )?;
        let mut latest: HashMap<String, f64> = HashMap::new();
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (symbol, value) = row?;
            latest.insert(symbol, value);
        }
        Ok(latest)
    }

    // -------------------------------------------------------------------------
    // Macro & alternative data
    // -------------------------------------------------------------------------

    /// Upsert one macro indicator row (conflict column: indicator_name).
    pub fn upsert_macro_indicator(
        &self,
        row: &MacroIndicatorRow,
        series: &[f64],
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO macro_indicators (indicator_name, value, z_score, percentile, \
             rate_of_change, series, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(indicator_name) DO UPDATE SET value = excluded.value, \
             z_score = excluded.z_score, percentile = excluded.percentile, \
             rate_of_change = excluded.rate_of_change, series = excluded.series, \
             recorded_at = excluded.recorded_at",
            params![
                row.indicator_name,
                row.value,
                row.z_score,
                row.percentile,
                row.rate_of_change,
                serde_json::to_string(series)?,
                row.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn macro_indicators(&self) -> Result<HashMap<String, MacroIndicatorRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT indicator_name, value, z_score, percentile, rate_of_change, recorded_at \
             FROM macro_indicators",
        )?;
        let rows = stmt.query_map([], |row| {
            let recorded_at: String = row.get(5)?;
            Ok(MacroIndicatorRow {
                indicator_name: row.get(0)?,
                value: row.get(1)?,
                z_score: row.get(2)?,
                percentile: row.get(3)?,
                rate_of_change: row.get(4)?,
                recorded_at: recorded_at
                    .parse()
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let row = row?;
            map.insert(row.indicator_name.clone(), row);
        }
        Ok(map)
    }

    /// Raw observation series for one indicator (oldest first).
    pub fn macro_series(&self, indicator_name: &str) -> Result<Vec<f64>> {
        let conn = self.conn.lock();
        let series: Option<String> = conn
            .query_row(
                "SELECT series FROM macro_indicators WHERE indicator_name = ?1",
                params![indicator_name],
                |row| row.get(0),
            )
            .optional()?;
        match series {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Latest insider signal per symbol.
    pub fn latest_insider_signals(&self) -> Result<HashMap<String, InsiderSignalRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, filing_count, buy_ratio, cluster_score, net_sentiment, \
             pending_xml_parse, recorded_at FROM insider_signals ORDER BY recorded_at DESC \
             LIMIT 500",
        )?;
        let rows = stmt.query_map([], |row| {
            let recorded_at: String = row.get(6)?;
            Ok(InsiderSignalRow {
                symbol: row.get(0)?,
                filing_count: row.get(1)?,
                buy_ratio: row.get(2)?,
                cluster_score: row.get(3)?,
                net_sentiment: row.get(4)?,
                pending_xml_parse: row.get::<_, i64>(5)? != 0,
                recorded_at: recorded_at.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?;

        let mut map: HashMap<String, InsiderSignalRow> = HashMap::new();
        for row in rows {
            let row = row?;
            map.entry(row.symbol.clone()).or_insert(row);
        }
        Ok(map)
    }

    /// Latest short-interest row per symbol.
    pub fn latest_short_interest(&self) -> Result<HashMap<String, ShortInterestRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, short_pct_float, short_ratio, short_interest_score, recorded_at \
             FROM short_interest ORDER BY recorded_at DESC LIMIT 500",
        )?;
        let rows = stmt.query_map([], |row| {
            let recorded_at: String = row.get(4)?;
            Ok(ShortInterestRow {
                symbol: row.get(0)?,
                short_pct_float: row.get(1)?,
                short_ratio: row.get(2)?,
                short_interest_score: row.get(3)?,
                recorded_at: recorded_at.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?;

        let mut map: HashMap<String, ShortInterestRow> = HashMap::new();
        for row in rows {
            let row = row?;
            map.entry(row.symbol.clone()).or_insert(row);
        }
        Ok(map)
    }

    // -------------------------------------------------------------------------
    // Activity & overlay state
    // -------------------------------------------------------------------------

    pub fn insert_activity(
        &self,
        agent_id: &str,
        activity_type: ActivityType,
        ticker: Option<&str>,
        details: &Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_activity (agent_id, activity_type, ticker, details, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                agent_id,
                activity_type.to_string(),
                ticker,
                serde_json::to_string(details)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Timestamp of the agent's most recent rebalance activity.
    pub fn last_rebalance_at(&self, agent_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ts: Option<String> = conn
            .query_row(
                "SELECT created_at FROM agent_activity WHERE agent_id = ?1 \
                 AND activity_type = 'rebalance' ORDER BY created_at DESC LIMIT 1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.and_then(|t| t.parse().ok()))
    }

    /// Persist one overlay computation for report consumers.
    pub fn insert_overlay_state(
        &self,
        risk_scale_factor: f64,
        composite_risk_score: f64,
        regime_label: &str,
        signal_contributions: &Value,
        warnings: &Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO macro_risk_overlay_state (risk_scale_factor, composite_risk_score, \
             regime_label, signal_contributions, warnings, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                risk_scale_factor,
                composite_risk_score,
                regime_label,
                serde_json::to_string(signal_contributions)?,
                serde_json::to_string(warnings)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Freshest persisted overlay computation, for report consumers.
    pub fn latest_overlay_state(&self) -> Result<Option<OverlayStateRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT risk_scale_factor, composite_risk_score, regime_label, recorded_at \
                 FROM macro_risk_overlay_state ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    let recorded_at: String = row.get(3)?;
                    Ok(OverlayStateRow {
                        risk_scale_factor: row.get(0)?,
                        composite_risk_score: row.get(1)?,
                        regime_label: row.get(2)?,
                        recorded_at: recorded_at.parse().unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Test / seeding helpers
    // -------------------------------------------------------------------------

    pub fn insert_agent(&self, agent: &AgentRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (id, user_id, name, persona, status, strategy_type, \
             strategy_params, risk_params, allocated_capital, cash_balance, \
             time_horizon_days, start_date, end_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                agent.id,
                agent.user_id,
                agent.name,
                agent.persona,
                agent.status.to_string(),
                agent.strategy_type,
                serde_json::to_string(&agent.strategy_params)?,
                serde_json::to_string(&agent.risk_params)?,
                agent.allocated_capital,
                agent.cash_balance,
                agent.time_horizon_days,
                agent.start_date.map(|d| d.to_string()),
                agent.end_date.map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn insert_user(&self, user_id: &str, creds: &UserCreds) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, alpaca_api_key, alpaca_api_secret, alpaca_paper_mode) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                creds.alpaca_api_key,
                creds.alpaca_api_secret,
                creds.alpaca_paper_mode as i64,
            ],
        )?;
        Ok(())
    }

    pub fn insert_insider_signal(&self, row: &InsiderSignalRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO insider_signals (symbol, filing_count, buy_ratio, cluster_score, \
             net_sentiment, pending_xml_parse, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.symbol,
                row.filing_count,
                row.buy_ratio,
                row.cluster_score,
                row.net_sentiment,
                row.pending_xml_parse as i64,
                row.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
