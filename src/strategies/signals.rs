// =============================================================================
// Signal Generators — modular, normalised to [-100, +100]
// =============================================================================
//
// Each generator inspects one symbol's market or sentiment record and emits
// an optional signal.  Generators return None when their inputs are missing
// rather than guessing; the combiner renormalises over whatever arrived.
// =============================================================================

use crate::factors::MarketRecord;
use crate::sentiment::SentimentInput;

use super::{SentimentConfig, SentimentMode, Signal, SignalType};

// ---------------------------------------------------------------------------
// Price-based generators
// ---------------------------------------------------------------------------

/// Time-series momentum: return over the lookback window, scaled so a ±50%
/// move saturates the signal.
pub struct TimeSeriesMomentumSignal {
    pub lookback_days: usize,
}

impl TimeSeriesMomentumSignal {
    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let prices = &record.price_history;
        if prices.len() < self.lookback_days || self.lookback_days == 0 {
            return None;
        }
        let old = prices[prices.len() - self.lookback_days];
        let new = *prices.last()?;
        if old <= 0.0 {
            return None;
        }
        let ret = (new - old) / old;
        Some(Signal {
            name: "ts_momentum".to_string(),
            signal_type: SignalType::Momentum,
            value: (ret * 200.0).clamp(-100.0, 100.0),
        })
    }
}

/// Cross-sectional momentum: 6-month return with the last month skipped,
/// the classic 12-1 construction compressed to the available history.
pub struct CrossSectionalMomentumSignal;

impl CrossSectionalMomentumSignal {
    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let prices = &record.price_history;
        if prices.len() < 126 {
            return None;
        }
        let old = prices[prices.len() - 126];
        let recent = if prices.len() >= 21 {
            prices[prices.len() - 21]
        } else {
            *prices.last()?
        };
        if old <= 0.0 {
            return None;
        }
        let ret = (recent - old) / old;
        Some(Signal {
            name: "xs_momentum".to_string(),
            signal_type: SignalType::Momentum,
            value: (ret * 200.0).clamp(-100.0, 100.0),
        })
    }
}

/// Value: cheap multiples score positive.  P/E of 10 and P/B of 1 are
/// treated as clearly cheap; 40 / 8 as clearly rich.
pub struct ValueSignal;

impl ValueSignal {
    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let pe = record.pe_ratio.filter(|v| *v > 0.0 && *v < 200.0);
        let pb = record.pb_ratio.filter(|v| *v > 0.0 && *v < 50.0);
        if pe.is_none() && pb.is_none() {
            return None;
        }

        let mut parts = Vec::new();
        if let Some(pe) = pe {
            parts.push(((25.0 - pe) / 15.0 * 100.0).clamp(-100.0, 100.0));
        }
        if let Some(pb) = pb {
            parts.push(((4.5 - pb) / 3.5 * 100.0).clamp(-100.0, 100.0));
        }
        let value = parts.iter().sum::<f64>() / parts.len() as f64;

        Some(Signal {
            name: "value".to_string(),
            signal_type: SignalType::Value,
            value,
        })
    }
}

/// Quality: profitable, high-margin, low-leverage names score positive.
pub struct QualitySignal;

impl QualitySignal {
    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let roe = record.roe.filter(|v| v.is_finite());
        let margin = record.profit_margin.filter(|v| v.is_finite());
        let debt = record.debt_to_equity.filter(|v| v.is_finite() && *v >= 0.0);
        if roe.is_none() && margin.is_none() && debt.is_none() {
            return None;
        }

        let mut score = 0.0;
        let mut weight = 0.0;
        if let Some(roe) = roe {
            score += 0.4 * ((roe - 0.10) / 0.15 * 100.0).clamp(-100.0, 100.0);
            weight += 0.4;
        }
        if let Some(margin) = margin {
            score += 0.3 * ((margin - 0.08) / 0.12 * 100.0).clamp(-100.0, 100.0);
            weight += 0.3;
        }
        if let Some(debt) = debt {
            score += 0.3 * ((1.5 - debt) / 1.5 * 100.0).clamp(-100.0, 100.0);
            weight += 0.3;
        }

        Some(Signal {
            name: "quality".to_string(),
            signal_type: SignalType::Quality,
            value: score / weight,
        })
    }
}

/// Dividend yield: 4%+ saturates bullish; non-payers are flat, not bearish.
pub struct DividendYieldSignal;

impl DividendYieldSignal {
    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let div_yield = record.dividend_yield?;
        if !div_yield.is_finite() {
            return None;
        }
        Some(Signal {
            name: "dividend_yield".to_string(),
            signal_type: SignalType::Dividend,
            value: (div_yield / 0.04 * 100.0).clamp(0.0, 100.0),
        })
    }
}

/// Realized volatility over the trailing window, annualised.  Low vol is a
/// positive signal (the vol-premium and defensive books buy it).
pub struct RealizedVolatilitySignal {
    pub lookback_days: usize,
}

impl RealizedVolatilitySignal {
    /// Annualised realized volatility as a fraction (e.g. 0.25 = 25%).
    pub fn realized_vol(&self, record: &MarketRecord) -> Option<f64> {
        let prices = &record.price_history;
        if prices.len() < self.lookback_days + 1 || self.lookback_days < 2 {
            return None;
        }
        let window = &prices[prices.len() - self.lookback_days - 1..];
        let returns: Vec<f64> = window
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.len() < 2 {
            return None;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / returns.len() as f64;
        Some(variance.sqrt() * (252.0_f64).sqrt())
    }

    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let vol = self.realized_vol(record)?;
        // 15% annualised is neutral; 45%+ saturates bearish, ~0% bullish.
        let value = ((0.15 - vol) / 0.30 * 200.0).clamp(-100.0, 100.0);
        Some(Signal {
            name: "realized_vol".to_string(),
            signal_type: SignalType::Volatility,
            value,
        })
    }
}

/// Short-term reversal: the negative of the trailing 1-5 day return.
pub struct ShortTermReversalSignal {
    pub lookback_days: usize,
}

impl ShortTermReversalSignal {
    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let prices = &record.price_history;
        if prices.len() < self.lookback_days + 1 || self.lookback_days == 0 {
            return None;
        }
        let old = prices[prices.len() - 1 - self.lookback_days];
        let new = *prices.last()?;
        if old <= 0.0 {
            return None;
        }
        let ret = (new - old) / old;
        // A 5% short-term selloff saturates the buy signal.
        Some(Signal {
            name: "st_reversal".to_string(),
            signal_type: SignalType::Reversal,
            value: (-ret / 0.05 * 100.0).clamp(-100.0, 100.0),
        })
    }
}

/// Z-score of the latest close against the trailing window; negative z
/// (price stretched below its mean) is a positive mean-reversion signal.
pub struct ZScoreSignal {
    pub lookback_days: usize,
}

impl ZScoreSignal {
    pub fn zscore(&self, record: &MarketRecord) -> Option<f64> {
        let prices = &record.price_history;
        if prices.len() < self.lookback_days || self.lookback_days < 3 {
            return None;
        }
        let window = &prices[prices.len() - self.lookback_days..];
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance = window.iter().map(|p| (p - mean).powi(2)).sum::<f64>()
            / window.len() as f64;
        let std = variance.sqrt();
        if std <= 0.0 {
            return None;
        }
        Some((window.last()? - mean) / std)
    }

    pub fn generate(&self, record: &MarketRecord) -> Option<Signal> {
        let z = self.zscore(record)?;
        Some(Signal {
            name: "zscore".to_string(),
            signal_type: SignalType::Statistical,
            value: (-z / 2.0 * 100.0).clamp(-100.0, 100.0),
        })
    }
}

// ---------------------------------------------------------------------------
// Sentiment generators
// ---------------------------------------------------------------------------

pub struct NewsSentimentSignal;

impl NewsSentimentSignal {
    pub fn generate(&self, sent: &SentimentInput) -> Option<Signal> {
        Some(Signal {
            name: "news_sentiment".to_string(),
            signal_type: SignalType::Sentiment,
            value: sent.news_sentiment?.clamp(-100.0, 100.0),
        })
    }
}

pub struct SocialSentimentSignal;

impl SocialSentimentSignal {
    pub fn generate(&self, sent: &SentimentInput) -> Option<Signal> {
        Some(Signal {
            name: "social_sentiment".to_string(),
            signal_type: SignalType::Sentiment,
            value: sent.social_sentiment?.clamp(-100.0, 100.0),
        })
    }
}

/// Sentiment velocity: ±10 points/day saturates.
pub struct SentimentVelocitySignal;

impl SentimentVelocitySignal {
    pub fn generate(&self, sent: &SentimentInput) -> Option<Signal> {
        Some(Signal {
            name: "sentiment_velocity".to_string(),
            signal_type: SignalType::Sentiment,
            value: (sent.velocity? * 10.0).clamp(-100.0, 100.0),
        })
    }
}

// ---------------------------------------------------------------------------
// Combiner
// ---------------------------------------------------------------------------

/// Result of blending signals for one symbol.
#[derive(Debug, Clone)]
pub struct CombinedSignal {
    /// Blended score in [-100, +100].
    pub score: f64,
    /// Position-size multiplier from RISK_ADJUSTMENT mode (1.0 otherwise).
    pub size_multiplier: f64,
}

/// Blends named signals with configured weights and applies the strategy's
/// sentiment integration mode.
///
/// Returns None when the sentiment gate (FILTER / CONFIRMATION) blocks the
/// symbol outright.
pub struct SignalCombiner {
    weights: Vec<(String, f64)>,
}

impl SignalCombiner {
    pub fn new(weights: Vec<(String, f64)>) -> Self {
        Self { weights }
    }

    pub fn combine(
        &self,
        signals: &[Signal],
        sentiment: Option<&SentimentInput>,
        config: &SentimentConfig,
    ) -> Option<CombinedSignal> {
        if signals.is_empty() {
            return None;
        }

        // Weighted mean over the signals that actually arrived.
        let mut total_weight = 0.0;
        let mut score = 0.0;
        for signal in signals {
            let weight = self
                .weights
                .iter()
                .find(|(name, _)| name == &signal.name)
                .map(|(_, w)| *w)
                .unwrap_or(0.0);
            if weight > 0.0 {
                score += signal.value * weight;
                total_weight += weight;
            }
        }
        if total_weight <= 0.0 {
            return None;
        }
        score /= total_weight;

        let combined = sentiment.and_then(|s| s.combined_sentiment);
        let mut size_multiplier = 1.0;

        match config.mode {
            SentimentMode::Disabled => {}
            SentimentMode::Filter => {
                // Trade only when sentiment clears the floor.
                if let Some(c) = combined {
                    if c < config.filter_threshold {
                        return None;
                    }
                }
            }
            SentimentMode::Confirmation => {
                // Sentiment must not firmly oppose the signal direction.
                if let Some(c) = combined {
                    if score > 0.0 && c < -10.0 {
                        return None;
                    }
                    if score < 0.0 && c > 10.0 {
                        return None;
                    }
                }
            }
            SentimentMode::Alpha => {
                if let Some(c) = combined {
                    let w = config.sentiment_alpha_weight.clamp(0.0, 1.0);
                    score = (1.0 - w) * score + w * c;
                }
            }
            SentimentMode::RiskAdjustment => {
                if let Some(c) = combined {
                    size_multiplier = (1.0 + c / 200.0).clamp(0.5, 1.5);
                }
            }
        }

        Some(CombinedSignal {
            score: score.clamp(-100.0, 100.0),
            size_multiplier,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_prices(prices: Vec<f64>) -> MarketRecord {
        MarketRecord {
            symbol: "TEST".to_string(),
            current_price: prices.last().copied(),
            price_history: prices,
            ..Default::default()
        }
    }

    #[test]
    fn ts_momentum_sign_and_bounds() {
        let up = record_with_prices((0..220).map(|i| 100.0 + i as f64).collect());
        let signal = TimeSeriesMomentumSignal { lookback_days: 200 }
            .generate(&up)
            .unwrap();
        assert!(signal.value > 0.0);
        assert!(signal.value <= 100.0);

        let down = record_with_prices((0..220).map(|i| 300.0 - i as f64).collect());
        let signal = TimeSeriesMomentumSignal { lookback_days: 200 }
            .generate(&down)
            .unwrap();
        assert!(signal.value < 0.0);

        let short = record_with_prices(vec![100.0; 50]);
        assert!(TimeSeriesMomentumSignal { lookback_days: 200 }
            .generate(&short)
            .is_none());
    }

    #[test]
    fn reversal_flips_recent_move() {
        // Five-day selloff produces a positive (buy) reversal signal.
        let mut prices = vec![100.0; 30];
        prices.extend_from_slice(&[98.0, 97.0, 96.5, 96.0, 95.0]);
        let signal = ShortTermReversalSignal { lookback_days: 5 }
            .generate(&record_with_prices(prices))
            .unwrap();
        assert!(signal.value > 0.0);
    }

    #[test]
    fn zscore_detects_stretch() {
        let mut prices = vec![100.0; 30];
        prices.push(80.0); // sharp drop below the rolling mean
        let z = ZScoreSignal { lookback_days: 20 }
            .zscore(&record_with_prices(prices))
            .unwrap();
        assert!(z < -1.0);
    }

    #[test]
    fn value_signal_prefers_cheap() {
        let mut cheap = MarketRecord::default();
        cheap.pe_ratio = Some(8.0);
        cheap.pb_ratio = Some(1.0);
        let mut rich = MarketRecord::default();
        rich.pe_ratio = Some(45.0);
        rich.pb_ratio = Some(9.0);

        let cheap_signal = ValueSignal.generate(&cheap).unwrap().value;
        let rich_signal = ValueSignal.generate(&rich).unwrap().value;
        assert!(cheap_signal > 0.0);
        assert!(rich_signal < 0.0);

        assert!(ValueSignal.generate(&MarketRecord::default()).is_none());
    }

    #[test]
    fn combiner_weighted_mean() {
        let combiner = SignalCombiner::new(vec![
            ("a".to_string(), 0.75),
            ("b".to_string(), 0.25),
        ]);
        let signals = vec![
            Signal {
                name: "a".to_string(),
                signal_type: SignalType::Momentum,
                value: 80.0,
            },
            Signal {
                name: "b".to_string(),
                signal_type: SignalType::Value,
                value: -40.0,
            },
        ];
        let combined = combiner
            .combine(&signals, None, &SentimentConfig::default())
            .unwrap();
        assert!((combined.score - (80.0 * 0.75 - 40.0 * 0.25)).abs() < 1e-9);
        assert_eq!(combined.size_multiplier, 1.0);
    }

    #[test]
    fn filter_mode_blocks_bearish_sentiment() {
        let combiner = SignalCombiner::new(vec![("a".to_string(), 1.0)]);
        let signals = vec![Signal {
            name: "a".to_string(),
            signal_type: SignalType::Momentum,
            value: 50.0,
        }];
        let mut config = SentimentConfig::default();
        config.mode = SentimentMode::Filter;
        config.filter_threshold = -20.0;

        let mut sent = SentimentInput::new("TEST");
        sent.combined_sentiment = Some(-50.0);
        assert!(combiner.combine(&signals, Some(&sent), &config).is_none());

        sent.combined_sentiment = Some(10.0);
        assert!(combiner.combine(&signals, Some(&sent), &config).is_some());
    }

    #[test]
    fn confirmation_mode_blocks_opposing_sentiment() {
        let combiner = SignalCombiner::new(vec![("a".to_string(), 1.0)]);
        let bullish_signal = vec![Signal {
            name: "a".to_string(),
            signal_type: SignalType::Momentum,
            value: 60.0,
        }];
        let mut config = SentimentConfig::default();
        config.mode = SentimentMode::Confirmation;

        let mut sent = SentimentInput::new("TEST");
        sent.combined_sentiment = Some(-30.0);
        assert!(combiner
            .combine(&bullish_signal, Some(&sent), &config)
            .is_none());

        // Mildly negative sentiment does not veto.
        sent.combined_sentiment = Some(-5.0);
        assert!(combiner
            .combine(&bullish_signal, Some(&sent), &config)
            .is_some());
    }

    #[test]
    fn alpha_mode_blends_and_risk_adjustment_scales() {
        let combiner = SignalCombiner::new(vec![("a".to_string(), 1.0)]);
        let signals = vec![Signal {
            name: "a".to_string(),
            signal_type: SignalType::Momentum,
            value: 40.0,
        }];
        let mut sent = SentimentInput::new("TEST");
        sent.combined_sentiment = Some(80.0);

        let mut alpha = SentimentConfig::default();
        alpha.mode = SentimentMode::Alpha;
        alpha.sentiment_alpha_weight = 0.5;
        let combined = combiner.combine(&signals, Some(&sent), &alpha).unwrap();
        assert!((combined.score - 60.0).abs() < 1e-9);

        let mut risk = SentimentConfig::default();
        risk.mode = SentimentMode::RiskAdjustment;
        let combined = combiner.combine(&signals, Some(&sent), &risk).unwrap();
        assert!((combined.size_multiplier - 1.4).abs() < 1e-9);
        assert!((combined.score - 40.0).abs() < 1e-9);
    }
}
