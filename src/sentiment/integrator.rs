// =============================================================================
// Sentiment-Factor Integrator — seven-layer blend
// =============================================================================
//
// Combines quantitative factor scores with sentiment signals:
//   1. Convergence amplification — reward factor/sentiment agreement
//   2. Velocity-momentum resonance — sentiment acceleration confirms trends
//   3. Cross-source triangulation — news/social agreement boosts confidence
//   4. Sentiment dispersion risk — news vs social spread signals uncertainty
//   5. Regime-aware factor tilting — aggregate sentiment shifts factor weights
//   6. Temporal persistence — sustained multi-day sentiment outweighs noise
//   7. MA-sentiment confluence — price vs MA200 aligned with streaks
//
// Output: a composite score in [0, 100] per stock.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::factors::{FactorScores, FactorWeights, MarketRecord};

use super::SentimentInput;

// ---------------------------------------------------------------------------
// Strategy base weights & regime tilts
// ---------------------------------------------------------------------------

/// Base factor weights for the cross-sectional strategy presets.
pub fn default_factor_weights(strategy_type: &str) -> FactorWeights {
    match strategy_type {
        "momentum" => FactorWeights {
            momentum: 0.55,
            value: 0.00,
            quality: 0.10,
            dividend: 0.00,
            volatility: 0.10,
            sentiment: 0.25,
        },
        "quality_value" => FactorWeights {
            momentum: 0.00,
            value: 0.30,
            quality: 0.30,
            dividend: 0.05,
            volatility: 0.10,
            sentiment: 0.25,
        },
        "quality_momentum" => FactorWeights {
            momentum: 0.30,
            value: 0.00,
            quality: 0.25,
            dividend: 0.00,
            volatility: 0.10,
            sentiment: 0.35,
        },
        "dividend_growth" => FactorWeights {
            momentum: 0.00,
            value: 0.15,
            quality: 0.25,
            dividend: 0.25,
            volatility: 0.15,
            sentiment: 0.20,
        },
        _ => default_factor_weights("momentum"),
    }
}

/// Tilt deltas applied on top of base weights, scaled by regime strength.
const RISK_ON_TILTS: FactorWeights = FactorWeights {
    momentum: 0.08,
    value: -0.04,
    quality: -0.04,
    dividend: -0.02,
    volatility: -0.04,
    sentiment: 0.06,
};

const RISK_OFF_TILTS: FactorWeights = FactorWeights {
    momentum: -0.08,
    value: 0.04,
    quality: 0.06,
    dividend: 0.04,
    volatility: 0.04,
    sentiment: -0.10,
};

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Detected market regime from aggregate sentiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    /// "risk_on", "neutral", or "risk_off".
    pub label: String,
    /// Average combined sentiment across the universe.
    pub aggregate_sentiment: f64,
    /// Fraction of stocks with positive sentiment.
    pub breadth: f64,
    /// Continuous [-1, +1]: -1 = risk-off, +1 = risk-on.
    pub regime_strength: f64,
}

/// Output of the integration for a single stock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratedScore {
    pub symbol: String,

    // Original factor scores (0-100 percentile)
    pub momentum_score: f64,
    pub value_score: f64,
    pub quality_score: f64,
    pub dividend_score: f64,
    pub volatility_score: f64,

    /// Combined sentiment normalised to 0-100.
    pub sentiment_score: f64,

    // Layer diagnostics
    pub convergence_bonus: f64,
    pub resonance_multiplier: f64,
    pub triangulation_confidence: f64,
    pub dispersion_risk: f64,
    pub temporal_bonus: f64,
    pub confluence_bonus: f64,

    /// Final blended composite in [0, 100].
    pub composite_score: f64,

    /// Regime-tilted factor weights used for this run.
    pub factor_weights: FactorWeights,
}

// ---------------------------------------------------------------------------
// Integrator
// ---------------------------------------------------------------------------

/// Blends factor scores with sentiment via the seven layers above.
pub struct SentimentFactorIntegrator {
    strategy_type: String,
    convergence_strength: f64,
    resonance_strength: f64,
    base_weights: FactorWeights,
}

impl SentimentFactorIntegrator {
    /// `sentiment_weight` overrides the preset's sentiment blend weight and
    /// is clamped to [0, 0.5].
    pub fn new(strategy_type: &str, sentiment_weight: f64) -> Self {
        let mut base = default_factor_weights(strategy_type);
        base.sentiment = sentiment_weight.clamp(0.0, 0.5);
        normalise(&mut base);

        Self {
            strategy_type: strategy_type.to_string(),
            convergence_strength: 1.0,
            resonance_strength: 1.0,
            base_weights: base,
        }
    }

    /// Run all seven layers and return blended scores per symbol.
    pub fn integrate(
        &self,
        factor_data: &HashMap<String, FactorScores>,
        sentiment_data: &HashMap<String, SentimentInput>,
        market_data: &HashMap<String, MarketRecord>,
    ) -> HashMap<String, IntegratedScore> {
        // Layer 0 — regime detection drives the weight tilt for every stock.
        let regime = detect_regime(sentiment_data);
        let tilted = self.apply_regime_tilts(&regime);

        let empty = SentimentInput::default();
        let mut results = HashMap::new();

        for (symbol, factors) in factor_data {
            let sent = sentiment_data.get(symbol).unwrap_or(&empty);
            let market = market_data.get(symbol);

            let sentiment_score = normalise_sentiment(sent);

            // Layer 1: convergence amplification
            let convergence = calc_convergence(factors, sent);

            // Layer 2: velocity-momentum resonance
            let resonance = self.calc_resonance(factors.momentum_score, sent);

            // Layer 3: cross-source triangulation
            let triangulation = calc_triangulation(sent);

            // Layer 4: dispersion risk
            let dispersion = calc_dispersion(sent);

            // Layer 5: regime tilt (already applied via tilted weights)

            // Layer 6: temporal persistence
            let temporal = calc_temporal_bonus(sent);

            // Layer 7: MA-sentiment confluence
            let confluence = market.map(|m| calc_ma_confluence(sent, m)).unwrap_or(0.0);

            // Resonance scales momentum before the weighted sum.
            let adjusted_momentum = factors.momentum_score * resonance;

            let mut composite = adjusted_momentum * tilted.momentum
                + factors.value_score * tilted.value
                + factors.quality_score * tilted.quality
                + factors.dividend_score * tilted.dividend
                + factors.volatility_score * tilted.volatility
                + sentiment_score * tilted.sentiment;

            composite += convergence * self.convergence_strength;
            composite += temporal;
            composite += confluence;

            // Scale deviation from neutral by confidence, then clamp.
            let confidence_scale = triangulation * (1.0 - 0.3 * dispersion);
            composite = 50.0 + (composite - 50.0) * confidence_scale;
            composite = composite.clamp(0.0, 100.0);

            results.insert(
                symbol.clone(),
                IntegratedScore {
                    symbol: symbol.clone(),
                    momentum_score: factors.momentum_score,
                    value_score: factors.value_score,
                    quality_score: factors.quality_score,
                    dividend_score: factors.dividend_score,
                    volatility_score: factors.volatility_score,
                    sentiment_score,
                    convergence_bonus: convergence,
                    resonance_multiplier: resonance,
                    triangulation_confidence: triangulation,
                    dispersion_risk: dispersion,
                    temporal_bonus: temporal,
                    confluence_bonus: confluence,
                    composite_score: composite,
                    factor_weights: tilted,
                },
            );
        }

        info!(
            stocks = results.len(),
            regime = %regime.label,
            aggregate = regime.aggregate_sentiment,
            strategy = %self.strategy_type,
            "sentiment-factor integration complete"
        );
        results
    }

    /// Adjust base factor weights by the detected regime, scaled by the
    /// continuous regime strength, then clamp non-negative and renormalise.
    pub fn apply_regime_tilts(&self, regime: &MarketRegime) -> FactorWeights {
        let mut weights = self.base_weights;
        let strength = regime.regime_strength;

        if strength.abs() < 0.05 {
            return weights;
        }

        let tilts = if strength > 0.0 {
            RISK_ON_TILTS
        } else {
            RISK_OFF_TILTS
        };
        let scale = strength.abs();

        weights.momentum = (weights.momentum + tilts.momentum * scale).max(0.0);
        weights.value = (weights.value + tilts.value * scale).max(0.0);
        weights.quality = (weights.quality + tilts.quality * scale).max(0.0);
        weights.dividend = (weights.dividend + tilts.dividend * scale).max(0.0);
        weights.volatility = (weights.volatility + tilts.volatility * scale).max(0.0);
        weights.sentiment = (weights.sentiment + tilts.sentiment * scale).max(0.0);

        normalise(&mut weights);
        weights
    }

    /// Layer 2 — sentiment velocity aligned with momentum direction
    /// amplifies the momentum factor; opposing velocity dampens it.
    /// Returns a multiplier in [0.8, 1.2].
    fn calc_resonance(&self, momentum_score: f64, sent: &SentimentInput) -> f64 {
        let velocity = match sent.velocity {
            Some(v) => v,
            None => return 1.0,
        };

        let mom_direction = if momentum_score >= 50.0 { 1.0 } else { -1.0 };
        let norm_velocity = (velocity / 10.0).clamp(-1.0, 1.0);
        let alignment = mom_direction * norm_velocity;

        1.0 + alignment * 0.2 * self.resonance_strength
    }
}

// ---------------------------------------------------------------------------
// Regime detection (Layer 0)
// ---------------------------------------------------------------------------

/// Detect the market regime from aggregate sentiment across the universe.
///
/// Continuous strength = clamp(0.6·tanh(agg/25) + 0.4·(2·breadth − 1), ±1);
/// the label thresholds at ±0.2 are for logging and activity rows.
pub fn detect_regime(sentiment_data: &HashMap<String, SentimentInput>) -> MarketRegime {
    let scores: Vec<f64> = sentiment_data
        .values()
        .filter_map(|s| s.combined_sentiment)
        .collect();

    if scores.is_empty() {
        return MarketRegime {
            label: "neutral".to_string(),
            aggregate_sentiment: 0.0,
            breadth: 0.5,
            regime_strength: 0.0,
        };
    }

    let agg = scores.iter().sum::<f64>() / scores.len() as f64;
    let breadth = scores.iter().filter(|s| **s > 0.0).count() as f64 / scores.len() as f64;

    let tanh_component = (agg / 25.0).tanh();
    let breadth_signal = (breadth - 0.5) * 2.0;
    let regime_strength = (0.6 * tanh_component + 0.4 * breadth_signal).clamp(-1.0, 1.0);

    let label = if regime_strength > 0.2 {
        "risk_on"
    } else if regime_strength < -0.2 {
        "risk_off"
    } else {
        "neutral"
    };

    MarketRegime {
        label: label.to_string(),
        aggregate_sentiment: agg,
        breadth,
        regime_strength,
    }
}

// ---------------------------------------------------------------------------
// Per-stock layers
// ---------------------------------------------------------------------------

/// Layer 1 — reward sentiment agreeing with the dominant factor signal.
/// Returns a value in [-15, +15].
fn calc_convergence(factors: &FactorScores, sent: &SentimentInput) -> f64 {
    let combined = match sent.combined_sentiment {
        Some(c) => c,
        None => return 0.0,
    };

    let avg_factor =
        (factors.momentum_score + factors.quality_score + factors.value_score) / 3.0;
    let factor_z = (avg_factor - 50.0) / 50.0;
    let sentiment_z = combined / 100.0;

    // Product captures agreement: both positive → positive, mixed → negative.
    factor_z * sentiment_z * 15.0
}

/// Layer 3 — confidence in [0.5, 1.0] from news/social agreement.
fn calc_triangulation(sent: &SentimentInput) -> f64 {
    let (news, social) = match (sent.news_sentiment, sent.social_sentiment) {
        (Some(n), Some(s)) => (n, s),
        _ => return 0.75,
    };

    if (news >= 0.0) == (social >= 0.0) {
        let diff = (news - social).abs() / 200.0;
        1.0 - diff * 0.3
    } else {
        let spread = (news - social).abs() / 200.0;
        (0.7 - spread * 0.4).max(0.5)
    }
}

/// Layer 4 — news/social divergence as uncertainty, in [0, 1].
fn calc_dispersion(sent: &SentimentInput) -> f64 {
    let (news, social) = match (sent.news_sentiment, sent.social_sentiment) {
        (Some(n), Some(s)) => (n, s),
        _ => return 0.3,
    };

    let spread = (news - social).abs();
    1.0 - 1.0 / (1.0 + (spread / 60.0).powf(1.5))
}

/// Layer 6 — reward sustained multi-day sentiment, in [-10, +10].
fn calc_temporal_bonus(sent: &SentimentInput) -> f64 {
    let streak = sent.streak_days;
    let persistence = sent.persistence.unwrap_or(0.5);

    let streak_component = if streak == 0 {
        0.0
    } else {
        let sign = if streak > 0 { 1.0 } else { -1.0 };
        sign * (1.0 + streak.abs() as f64).ln() * 2.0
    };

    // persistence = 1.0 → 1.3x, 0.0 → 0.4x
    let persistence_mult = 0.4 + 0.9 * persistence;

    let slope_component = sent
        .trend_slope
        .map(|s| (s * 0.5).clamp(-2.0, 2.0))
        .unwrap_or(0.0);

    let breakout_bonus = if sent.is_breakout {
        match sent.combined_sentiment {
            Some(c) if c < 0.0 => -2.0,
            Some(_) => 2.0,
            None => 0.0,
        }
    } else {
        0.0
    };

    (streak_component * persistence_mult + slope_component + breakout_bonus)
        .clamp(-10.0, 10.0)
}

/// Layer 7 — price vs MA200 aligned with the sentiment streak, in [-12, +12].
fn calc_ma_confluence(sent: &SentimentInput, market: &MarketRecord) -> f64 {
    let price = match market.current_price {
        Some(p) => p,
        None => return 0.0,
    };
    let ma_200 = match market.ma_200 {
        Some(m) if m > 0.0 => m,
        _ => return 0.0,
    };

    let streak = sent.streak_days;
    let ma_deviation = (price - ma_200) / ma_200;

    let price_bullish = ma_deviation > 0.0;
    let sentiment_bullish = streak > 0;
    let price_bearish = ma_deviation < 0.0;
    let sentiment_bearish = streak < 0;

    let streak_factor = (streak.abs() as f64 / 10.0).min(1.0);
    let ma_factor = (ma_deviation.abs() / 0.10).min(1.0);

    if price_bullish && sentiment_bullish {
        return 12.0 * streak_factor * ma_factor;
    }
    if price_bearish && sentiment_bearish {
        return -12.0 * streak_factor * ma_factor;
    }
    if (price_bullish && sentiment_bearish) || (price_bearish && sentiment_bullish) {
        return -3.0 * streak_factor;
    }
    0.0
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert combined sentiment (-100..+100) to the 0..100 scale.
fn normalise_sentiment(sent: &SentimentInput) -> f64 {
    match sent.combined_sentiment {
        Some(c) => ((c + 100.0) / 2.0).clamp(0.0, 100.0),
        None => 50.0,
    }
}

/// Normalise all six weights to sum to 1.0.
fn normalise(weights: &mut FactorWeights) {
    let total = weights.momentum
        + weights.value
        + weights.quality
        + weights.dividend
        + weights.volatility
        + weights.sentiment;
    if total > 0.0 {
        weights.momentum /= total;
        weights.value /= total;
        weights.quality /= total;
        weights.dividend /= total;
        weights.volatility /= total;
        weights.sentiment /= total;
    }
}
