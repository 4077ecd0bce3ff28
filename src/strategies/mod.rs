// =============================================================================
// Strategy Framework — signals, strategies, presets
// =============================================================================
//
// Extensible framework for the five quantitative strategy families.  Signal
// generators produce normalised values in [-100, +100]; strategies compose
// them into target portfolios; presets bind user-facing strategy names to a
// concrete strategy, factor weights, and a sentiment integration mode.
// =============================================================================

pub mod implementations;
pub mod presets;
pub mod signals;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::factors::MarketRecord;
use crate::sentiment::SentimentInput;
use crate::store::rows::PositionRow;
use crate::types::PositionSide;

use implementations::{
    CrossSectionalFactorStrategy, ShortTermReversalStrategy, StatisticalArbitrageStrategy,
    TrendFollowingStrategy, VolatilityPremiumStrategy,
};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The five strategy families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    TrendFollowing,
    CrossSectionalFactor,
    ShortTermReversal,
    StatisticalArbitrage,
    VolatilityPremium,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendFollowing => write!(f, "trend_following"),
            Self::CrossSectionalFactor => write!(f, "cross_sectional_factor"),
            Self::ShortTermReversal => write!(f, "short_term_reversal"),
            Self::StatisticalArbitrage => write!(f, "statistical_arbitrage"),
            Self::VolatilityPremium => write!(f, "volatility_premium"),
        }
    }
}

/// How a strategy folds sentiment into its decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentMode {
    /// No sentiment integration.
    Disabled,
    /// Only trade when sentiment clears the filter threshold.
    Filter,
    /// Blend sentiment into the ranking score.
    Alpha,
    /// Scale position sizes by sentiment.
    RiskAdjustment,
    /// Require sentiment not to oppose the trade direction.
    Confirmation,
}

/// Category a signal generator declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Momentum,
    Value,
    Quality,
    Dividend,
    Volatility,
    Sentiment,
    Reversal,
    Statistical,
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A normalised signal in [-100, +100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    pub signal_type: SignalType,
    pub value: f64,
}

/// One recommended position from a strategy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Recommended fraction of allocated capital.
    pub target_weight: f64,
    /// Per-action severity in [0, 100].
    pub signal_strength: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub max_holding_days: Option<i64>,
}

/// Output of a strategy execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutput {
    pub strategy_name: String,
    pub positions: Vec<TargetPosition>,
    /// Diagnostic metrics recorded on the rebalance activity row.
    pub risk_metrics: HashMap<String, f64>,
}

impl StrategyOutput {
    pub fn empty(strategy_name: impl Into<String>) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            positions: Vec::new(),
            risk_metrics: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sentiment integration settings for one strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentConfig {
    pub mode: SentimentMode,
    pub news_weight: f64,
    pub social_weight: f64,
    pub velocity_weight: f64,
    /// Combined-sentiment floor for FILTER mode (and the vol-premium
    /// crisis gate).
    pub filter_threshold: f64,
    /// Blend weight for ALPHA mode.
    pub sentiment_alpha_weight: f64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            mode: SentimentMode::Disabled,
            news_weight: 0.5,
            social_weight: 0.3,
            velocity_weight: 0.2,
            filter_threshold: -20.0,
            sentiment_alpha_weight: 0.25,
        }
    }
}

/// Risk caps applied during portfolio construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Hard cap on any single position's target weight.
    pub max_position_weight: f64,
    /// Default stop distance as a fraction of entry.
    pub stop_loss_pct: f64,
    /// Default take-profit distance as a fraction of entry.
    pub take_profit_pct: f64,
    pub max_holding_days: Option<i64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_weight: 0.15,
            stop_loss_pct: 0.10,
            take_profit_pct: 0.20,
            max_holding_days: None,
        }
    }
}

/// Options recognised by each strategy family.  Exactly one variant per
/// family; unknown options cannot be smuggled in through a loose map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyOptions {
    TrendFollowing {
        lookback_days: usize,
        entry_threshold: f64,
        allow_short: bool,
        /// Annualised volatility target used for inverse-vol sizing.
        target_volatility: f64,
    },
    CrossSectionalFactor {
        /// Number of names held (agent max_positions overrides this).
        top_n: usize,
    },
    ShortTermReversal {
        lookback_days: usize,
        zscore_entry: f64,
    },
    StatisticalArbitrage {
        lookback_days: usize,
        zscore_entry: f64,
        max_pairs: usize,
    },
    VolatilityPremium {
        vol_lookback_days: usize,
        /// Fraction of the universe held, lowest volatility first.
        low_vol_fraction: f64,
    },
}

/// Full configuration for one strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub strategy_type: StrategyType,
    /// Explicit trading universe; empty means every symbol in the snapshot.
    pub universe: Vec<String>,
    pub exclude_tickers: Vec<String>,
    pub max_positions: usize,
    pub sentiment: SentimentConfig,
    pub risk: RiskConfig,
    pub options: StrategyOptions,
}

// ---------------------------------------------------------------------------
// Strategy trait & registry
// ---------------------------------------------------------------------------

/// A strategy turns the market snapshot into a target portfolio.
///
/// Implementations are pure CPU: all data is supplied by the caller and no
/// suspension points exist inside `execute`.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn execute(
        &self,
        market_data: &HashMap<String, MarketRecord>,
        sentiment_data: &HashMap<String, SentimentInput>,
        current_positions: &HashMap<String, PositionRow>,
    ) -> StrategyOutput;
}

/// Constructs strategy instances from configuration.
pub struct StrategyRegistry;

impl StrategyRegistry {
    pub fn create(config: StrategyConfig) -> Box<dyn Strategy> {
        match config.strategy_type {
            StrategyType::TrendFollowing => Box::new(TrendFollowingStrategy::new(config)),
            StrategyType::CrossSectionalFactor => {
                Box::new(CrossSectionalFactorStrategy::new(config))
            }
            StrategyType::ShortTermReversal => {
                Box::new(ShortTermReversalStrategy::new(config))
            }
            StrategyType::StatisticalArbitrage => {
                Box::new(StatisticalArbitrageStrategy::new(config))
            }
            StrategyType::VolatilityPremium => {
                Box::new(VolatilityPremiumStrategy::new(config))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Universe helpers shared by the implementations
// ---------------------------------------------------------------------------

/// Symbols a strategy may trade: the configured universe (or the whole
/// snapshot) minus exclusions.
pub(crate) fn tradeable_symbols<'a>(
    config: &StrategyConfig,
    market_data: &'a HashMap<String, MarketRecord>,
) -> Vec<&'a String> {
    market_data
        .keys()
        .filter(|symbol| config.universe.is_empty() || config.universe.contains(*symbol))
        .filter(|symbol| !config.exclude_tickers.contains(*symbol))
        .collect()
}
