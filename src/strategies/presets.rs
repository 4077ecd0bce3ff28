// =============================================================================
// Strategy Presets — the eight user-facing strategy configurations
// =============================================================================
//
// Each preset binds a strategy name to a concrete implementation, a default
// sentiment integration mode, and tuned sub-weights.  The four factor
// presets additionally carry strategy-specific factor weights consumed by
// the factor calculator and the sentiment integrator.
// =============================================================================

use super::{
    RiskConfig, SentimentConfig, SentimentMode, StrategyConfig, StrategyOptions, StrategyType,
};

/// All recognised preset names, in display order.
pub const PRESET_NAMES: [&str; 8] = [
    "momentum",
    "quality_value",
    "quality_momentum",
    "dividend_growth",
    "trend_following",
    "short_term_reversal",
    "statistical_arbitrage",
    "volatility_premium",
];

/// Strategy family and default sentiment mode for a preset name.
pub fn preset_binding(preset: &str) -> Option<(StrategyType, SentimentMode)> {
    let binding = match preset {
        "momentum" => (StrategyType::CrossSectionalFactor, SentimentMode::Filter),
        "quality_value" => (
            StrategyType::CrossSectionalFactor,
            SentimentMode::Confirmation,
        ),
        "quality_momentum" => (StrategyType::CrossSectionalFactor, SentimentMode::Alpha),
        "dividend_growth" => (StrategyType::CrossSectionalFactor, SentimentMode::Filter),
        "trend_following" => (StrategyType::TrendFollowing, SentimentMode::RiskAdjustment),
        "short_term_reversal" => (
            StrategyType::ShortTermReversal,
            SentimentMode::Confirmation,
        ),
        "statistical_arbitrage" => (StrategyType::StatisticalArbitrage, SentimentMode::Alpha),
        "volatility_premium" => (StrategyType::VolatilityPremium, SentimentMode::Filter),
        _ => return None,
    };
    Some(binding)
}

/// Build a full strategy configuration from a preset.
///
/// `name` labels the instance (e.g. "agent-<id>"); `universe`, `exclude`,
/// and `max_positions` come from the agent's strategy params.
pub fn get_preset(
    preset: &str,
    name: impl Into<String>,
    universe: Vec<String>,
    exclude_tickers: Vec<String>,
    max_positions: usize,
) -> Option<StrategyConfig> {
    let (strategy_type, mode) = preset_binding(preset)?;

    let sentiment = match preset {
        // Factor presets lean on news; velocity matters most for momentum.
        "momentum" => SentimentConfig {
            mode,
            news_weight: 0.4,
            social_weight: 0.3,
            velocity_weight: 0.3,
            filter_threshold: -20.0,
            sentiment_alpha_weight: 0.25,
        },
        "quality_value" => SentimentConfig {
            mode,
            news_weight: 0.6,
            social_weight: 0.2,
            velocity_weight: 0.2,
            filter_threshold: -30.0,
            sentiment_alpha_weight: 0.25,
        },
        "quality_momentum" => SentimentConfig {
            mode,
            news_weight: 0.45,
            social_weight: 0.30,
            velocity_weight: 0.25,
            filter_threshold: -25.0,
            sentiment_alpha_weight: 0.35,
        },
        "dividend_growth" => SentimentConfig {
            mode,
            news_weight: 0.6,
            social_weight: 0.2,
            velocity_weight: 0.2,
            filter_threshold: -40.0,
            sentiment_alpha_weight: 0.20,
        },
        "trend_following" => SentimentConfig {
            mode,
            news_weight: 0.4,
            social_weight: 0.3,
            velocity_weight: 0.3,
            filter_threshold: -30.0,
            sentiment_alpha_weight: 0.20,
        },
        "short_term_reversal" => SentimentConfig {
            mode,
            news_weight: 0.3,
            social_weight: 0.5,
            velocity_weight: 0.2,
            filter_threshold: -30.0,
            sentiment_alpha_weight: 0.20,
        },
        "statistical_arbitrage" => SentimentConfig {
            mode,
            news_weight: 0.5,
            social_weight: 0.3,
            velocity_weight: 0.2,
            filter_threshold: -40.0,
            sentiment_alpha_weight: 0.15,
        },
        // The crisis gate: vol selling stops dead in bearish regimes.
        "volatility_premium" => SentimentConfig {
            mode,
            news_weight: 0.5,
            social_weight: 0.3,
            velocity_weight: 0.2,
            filter_threshold: -25.0,
            sentiment_alpha_weight: 0.15,
        },
        _ => SentimentConfig::default(),
    };

    let risk = match preset {
        "short_term_reversal" => RiskConfig {
            max_position_weight: 0.10,
            stop_loss_pct: 0.06,
            take_profit_pct: 0.08,
            max_holding_days: Some(5),
        },
        "statistical_arbitrage" => RiskConfig {
            max_position_weight: 0.10,
            stop_loss_pct: 0.08,
            take_profit_pct: 0.12,
            max_holding_days: Some(20),
        },
        "volatility_premium" => RiskConfig {
            max_position_weight: 0.12,
            stop_loss_pct: 0.08,
            take_profit_pct: 0.15,
            max_holding_days: None,
        },
        "dividend_growth" => RiskConfig {
            max_position_weight: 0.15,
            stop_loss_pct: 0.12,
            take_profit_pct: 0.25,
            max_holding_days: None,
        },
        _ => RiskConfig::default(),
    };

    let options = match strategy_type {
        StrategyType::TrendFollowing => StrategyOptions::TrendFollowing {
            lookback_days: 200,
            entry_threshold: 20.0,
            allow_short: false,
            target_volatility: 0.15,
        },
        StrategyType::CrossSectionalFactor => StrategyOptions::CrossSectionalFactor {
            top_n: max_positions,
        },
        StrategyType::ShortTermReversal => StrategyOptions::ShortTermReversal {
            lookback_days: 5,
            zscore_entry: 1.5,
        },
        StrategyType::StatisticalArbitrage => StrategyOptions::StatisticalArbitrage {
            lookback_days: 60,
            zscore_entry: 2.0,
            max_pairs: (max_positions / 2).max(1),
        },
        StrategyType::VolatilityPremium => StrategyOptions::VolatilityPremium {
            vol_lookback_days: 20,
            low_vol_fraction: 0.2,
        },
    };

    Some(StrategyConfig {
        name: name.into(),
        strategy_type,
        universe,
        exclude_tickers,
        max_positions,
        sentiment,
        risk,
        options,
    })
}
