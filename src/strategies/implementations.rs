// =============================================================================
// Strategy Implementations — the five core families
// =============================================================================
//
// Each strategy configures its signal generators, builds a target portfolio,
// and applies its risk caps.  Sentiment integration follows the configured
// mode; the engine disables it for cross-sectional runs because the
// integrator has already folded sentiment into `integrated_composite`.
// =============================================================================

use std::collections::HashMap;

use tracing::debug;

use crate::factors::MarketRecord;
use crate::sentiment::SentimentInput;
use crate::store::rows::PositionRow;
use crate::types::PositionSide;

use super::signals::{
    CrossSectionalMomentumSignal, DividendYieldSignal, NewsSentimentSignal, QualitySignal,
    RealizedVolatilitySignal, SentimentVelocitySignal, ShortTermReversalSignal, SignalCombiner,
    SocialSentimentSignal, TimeSeriesMomentumSignal, ValueSignal, ZScoreSignal,
};
use super::{
    tradeable_symbols, SentimentMode, Strategy, StrategyConfig, StrategyOptions, StrategyOutput,
    TargetPosition,
};

/// Stop and target prices on the correct side of entry.
fn exit_levels(
    price: f64,
    side: PositionSide,
    stop_loss_pct: f64,
    take_profit_pct: f64,
) -> (Option<f64>, Option<f64>) {
    match side {
        PositionSide::Long => (
            Some(price * (1.0 - stop_loss_pct)),
            Some(price * (1.0 + take_profit_pct)),
        ),
        PositionSide::Short => (
            Some(price * (1.0 + stop_loss_pct)),
            Some(price * (1.0 - take_profit_pct)),
        ),
    }
}

/// Scale all weights down proportionally when gross exposure exceeds 1.0.
fn cap_gross_exposure(positions: &mut [TargetPosition]) {
    let gross: f64 = positions.iter().map(|p| p.target_weight.abs()).sum();
    if gross > 1.0 {
        for pos in positions.iter_mut() {
            pos.target_weight /= gross;
        }
    }
}

// =============================================================================
// 1. Trend Following — time-series momentum, volatility-scaled weights
// =============================================================================

pub struct TrendFollowingStrategy {
    config: StrategyConfig,
    lookback_days: usize,
    entry_threshold: f64,
    allow_short: bool,
    target_volatility: f64,
}

impl TrendFollowingStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        let (lookback_days, entry_threshold, allow_short, target_volatility) =
            match config.options {
                StrategyOptions::TrendFollowing {
                    lookback_days,
                    entry_threshold,
                    allow_short,
                    target_volatility,
                } => (lookback_days, entry_threshold, allow_short, target_volatility),
                _ => (200, 20.0, false, 0.15),
            };
        Self {
            config,
            lookback_days,
            entry_threshold,
            allow_short,
            target_volatility,
        }
    }
}

impl Strategy for TrendFollowingStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn execute(
        &self,
        market_data: &HashMap<String, MarketRecord>,
        sentiment_data: &HashMap<String, SentimentInput>,
        _current_positions: &HashMap<String, PositionRow>,
    ) -> StrategyOutput {
        let momentum = TimeSeriesMomentumSignal {
            lookback_days: self.lookback_days,
        };
        let vol = RealizedVolatilitySignal { lookback_days: 20 };
        let combiner = SignalCombiner::new(vec![
            ("ts_momentum".to_string(), 0.60),
            ("news_sentiment".to_string(), 0.15),
            ("social_sentiment".to_string(), 0.10),
            ("sentiment_velocity".to_string(), 0.15),
        ]);

        let mut positions = Vec::new();
        let mut vol_sum = 0.0;
        let mut vol_count = 0usize;

        for symbol in tradeable_symbols(&self.config, market_data) {
            let record = &market_data[symbol];
            let price = match record.price() {
                Some(p) if p > 0.0 => p,
                _ => continue,
            };

            let mut signals = Vec::new();
            if let Some(s) = momentum.generate(record) {
                signals.push(s);
            }
            let sent = sentiment_data.get(symbol);
            if let Some(sent) = sent {
                for signal in [
                    NewsSentimentSignal.generate(sent),
                    SocialSentimentSignal.generate(sent),
                    SentimentVelocitySignal.generate(sent),
                ]
                .into_iter()
                .flatten()
                {
                    signals.push(signal);
                }
            }

            let combined =
                match combiner.combine(&signals, sent, &self.config.sentiment) {
                    Some(c) => c,
                    None => continue,
                };

            // Per-symbol long/short decision on the blended score.
            let side = if combined.score >= self.entry_threshold {
                PositionSide::Long
            } else if combined.score <= -self.entry_threshold && self.allow_short {
                PositionSide::Short
            } else {
                continue;
            };

            // Inverse-volatility sizing toward the portfolio vol target.
            let realized = vol.realized_vol(record).unwrap_or(0.25).max(0.05);
            vol_sum += realized;
            vol_count += 1;
            let raw_weight = (self.target_volatility / realized)
                / self.config.max_positions.max(1) as f64;
            let weight = (raw_weight * combined.size_multiplier)
                .min(self.config.risk.max_position_weight);

            let (stop_loss, take_profit) = exit_levels(
                price,
                side,
                self.config.risk.stop_loss_pct,
                self.config.risk.take_profit_pct,
            );

            positions.push(TargetPosition {
                symbol: symbol.clone(),
                side,
                target_weight: weight,
                signal_strength: combined.score.abs().min(100.0),
                stop_loss,
                take_profit,
                max_holding_days: self.config.risk.max_holding_days,
            });
        }

        // Strongest trends first; respect the position cap.
        positions.sort_by(|a, b| {
            b.signal_strength
                .partial_cmp(&a.signal_strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        positions.truncate(self.config.max_positions);
        cap_gross_exposure(&mut positions);

        let mut risk_metrics = HashMap::new();
        risk_metrics.insert("positions".to_string(), positions.len() as f64);
        if vol_count > 0 {
            risk_metrics.insert(
                "avg_realized_vol".to_string(),
                vol_sum / vol_count as f64,
            );
        }

        debug!(
            strategy = %self.config.name,
            positions = positions.len(),
            "trend-following portfolio constructed"
        );

        StrategyOutput {
            strategy_name: self.config.name.clone(),
            positions,
            risk_metrics,
        }
    }
}

// =============================================================================
// 2. Cross-Sectional Factor — rank by integrated composite, top-N
// =============================================================================

pub struct CrossSectionalFactorStrategy {
    config: StrategyConfig,
    top_n: usize,
}

impl CrossSectionalFactorStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        let top_n = match config.options {
            StrategyOptions::CrossSectionalFactor { top_n } => top_n,
            _ => 10,
        };
        Self { config, top_n }
    }

    /// Ranking score: the agent-specific integrated composite when the
    /// engine injected one, otherwise the nightly factor composite, and as
    /// a last resort a blend of the raw factor signal generators.
    fn ranking_score(record: &MarketRecord) -> Option<f64> {
        record
            .integrated_composite
            .or(record.composite_score)
            .or_else(|| Self::signal_blend_score(record))
    }

    /// Equal-weight blend of the cross-sectional generators, mapped from
    /// [-100, 100] onto the 0-100 composite scale.
    fn signal_blend_score(record: &MarketRecord) -> Option<f64> {
        let signals: Vec<f64> = [
            CrossSectionalMomentumSignal.generate(record),
            ValueSignal.generate(record),
            QualitySignal.generate(record),
            DividendYieldSignal.generate(record),
        ]
        .into_iter()
        .flatten()
        .map(|s| s.value)
        .collect();

        if signals.is_empty() {
            return None;
        }
        let avg = signals.iter().sum::<f64>() / signals.len() as f64;
        Some(((avg + 100.0) / 2.0).clamp(0.0, 100.0))
    }
}

impl Strategy for CrossSectionalFactorStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn execute(
        &self,
        market_data: &HashMap<String, MarketRecord>,
        sentiment_data: &HashMap<String, SentimentInput>,
        _current_positions: &HashMap<String, PositionRow>,
    ) -> StrategyOutput {
        let mut ranked: Vec<(String, f64)> = Vec::new();

        for symbol in tradeable_symbols(&self.config, market_data) {
            let record = &market_data[symbol];
            let mut score = match Self::ranking_score(record) {
                Some(s) => s,
                None => continue,
            };

            let combined = sentiment_data
                .get(symbol)
                .and_then(|s| s.combined_sentiment);

            match self.config.sentiment.mode {
                SentimentMode::Disabled => {}
                SentimentMode::Filter => {
                    if let Some(c) = combined {
                        if c < self.config.sentiment.filter_threshold {
                            continue;
                        }
                    }
                }
                SentimentMode::Confirmation => {
                    if let Some(c) = combined {
                        if c < -10.0 {
                            continue;
                        }
                    }
                }
                SentimentMode::Alpha => {
                    if let Some(c) = combined {
                        let w = self.config.sentiment.sentiment_alpha_weight.clamp(0.0, 1.0);
                        score = (1.0 - w) * score + w * (c + 100.0) / 2.0;
                    }
                }
                SentimentMode::RiskAdjustment => {}
            }

            ranked.push((symbol.clone(), score));
        }

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let top_n = self.top_n.min(self.config.max_positions).max(1);
        ranked.truncate(top_n);

        let weight = (1.0 / top_n as f64).min(self.config.risk.max_position_weight);

        let positions = ranked
            .into_iter()
            .filter_map(|(symbol, score)| {
                let record = &market_data[&symbol];
                let price = record.price()?;
                let (stop_loss, take_profit) = exit_levels(
                    price,
                    PositionSide::Long,
                    self.config.risk.stop_loss_pct,
                    self.config.risk.take_profit_pct,
                );
                Some(TargetPosition {
                    symbol,
                    side: PositionSide::Long,
                    target_weight: weight,
                    signal_strength: score.clamp(0.0, 100.0),
                    stop_loss,
                    take_profit,
                    max_holding_days: self.config.risk.max_holding_days,
                })
            })
            .collect::<Vec<_>>();

        let mut risk_metrics = HashMap::new();
        risk_metrics.insert("positions".to_string(), positions.len() as f64);
        risk_metrics.insert("per_position_weight".to_string(), weight);

        StrategyOutput {
            strategy_name: self.config.name.clone(),
            positions,
            risk_metrics,
        }
    }
}

// =============================================================================
// 3. Short-Term Reversal — 1-5 day mean reversion, tight stops
// =============================================================================

pub struct ShortTermReversalStrategy {
    config: StrategyConfig,
    lookback_days: usize,
    zscore_entry: f64,
}

impl ShortTermReversalStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        let (lookback_days, zscore_entry) = match config.options {
            StrategyOptions::ShortTermReversal {
                lookback_days,
                zscore_entry,
            } => (lookback_days, zscore_entry),
            _ => (5, 1.5),
        };
        Self {
            config,
            lookback_days,
            zscore_entry,
        }
    }
}

impl Strategy for ShortTermReversalStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn execute(
        &self,
        market_data: &HashMap<String, MarketRecord>,
        sentiment_data: &HashMap<String, SentimentInput>,
        _current_positions: &HashMap<String, PositionRow>,
    ) -> StrategyOutput {
        let reversal = ShortTermReversalSignal {
            lookback_days: self.lookback_days,
        };
        let zscore = ZScoreSignal { lookback_days: 20 };
        let combiner = SignalCombiner::new(vec![
            ("st_reversal".to_string(), 0.6),
            ("zscore".to_string(), 0.4),
        ]);

        let mut candidates: Vec<(String, f64, f64)> = Vec::new();

        for symbol in tradeable_symbols(&self.config, market_data) {
            let record = &market_data[symbol];
            let price = match record.price() {
                Some(p) if p > 0.0 => p,
                _ => continue,
            };

            // Entry condition: price stretched below its rolling mean.
            let z = match zscore.zscore(record) {
                Some(z) => z,
                None => continue,
            };
            if z > -self.zscore_entry {
                continue;
            }

            let mut signals = Vec::new();
            if let Some(s) = reversal.generate(record) {
                signals.push(s);
            }
            if let Some(s) = zscore.generate(record) {
                signals.push(s);
            }

            let sent = sentiment_data.get(symbol);
            let combined =
                match combiner.combine(&signals, sent, &self.config.sentiment) {
                    Some(c) => c,
                    None => continue,
                };
            if combined.score <= 0.0 {
                continue;
            }

            candidates.push((symbol.clone(), combined.score, price));
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.config.max_positions);

        let count = candidates.len().max(1);
        let weight = (1.0 / count as f64).min(self.config.risk.max_position_weight);

        let positions = candidates
            .into_iter()
            .map(|(symbol, score, price)| {
                // Mean-reversion trades keep half the normal stop distance.
                let (stop_loss, take_profit) = exit_levels(
                    price,
                    PositionSide::Long,
                    self.config.risk.stop_loss_pct * 0.5,
                    self.config.risk.take_profit_pct * 0.5,
                );
                TargetPosition {
                    symbol,
                    side: PositionSide::Long,
                    target_weight: weight,
                    signal_strength: score.min(100.0),
                    stop_loss,
                    take_profit,
                    max_holding_days: self.config.risk.max_holding_days.or(Some(5)),
                }
            })
            .collect::<Vec<_>>();

        let mut risk_metrics = HashMap::new();
        risk_metrics.insert("positions".to_string(), positions.len() as f64);
        risk_metrics.insert("zscore_entry".to_string(), self.zscore_entry);

        StrategyOutput {
            strategy_name: self.config.name.clone(),
            positions,
            risk_metrics,
        }
    }
}

// =============================================================================
// 4. Statistical Arbitrage — correlated pairs, market-neutral dollar weights
// =============================================================================

pub struct StatisticalArbitrageStrategy {
    config: StrategyConfig,
    lookback_days: usize,
    zscore_entry: f64,
    max_pairs: usize,
}

impl StatisticalArbitrageStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        let (lookback_days, zscore_entry, max_pairs) = match config.options {
            StrategyOptions::StatisticalArbitrage {
                lookback_days,
                zscore_entry,
                max_pairs,
            } => (lookback_days, zscore_entry, max_pairs),
            _ => (60, 2.0, 3),
        };
        Self {
            config,
            lookback_days,
            zscore_entry,
            max_pairs,
        }
    }

    fn daily_returns(prices: &[f64], lookback: usize) -> Option<Vec<f64>> {
        if prices.len() < lookback + 1 {
            return None;
        }
        let window = &prices[prices.len() - lookback - 1..];
        let returns: Vec<f64> = window
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.len() < lookback / 2 {
            return None;
        }
        Some(returns)
    }

    fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
        let n = a.len().min(b.len());
        if n < 10 {
            return None;
        }
        let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);
        let mean_a = a.iter().sum::<f64>() / n as f64;
        let mean_b = b.iter().sum::<f64>() / n as f64;

        let mut cov = 0.0;
        let mut var_a = 0.0;
        let mut var_b = 0.0;
        for i in 0..n {
            let da = a[i] - mean_a;
            let db = b[i] - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }
        if var_a <= 0.0 || var_b <= 0.0 {
            return None;
        }
        Some(cov / (var_a.sqrt() * var_b.sqrt()))
    }

    /// Z-score of the log price ratio over the lookback window.
    fn spread_zscore(a: &[f64], b: &[f64], lookback: usize) -> Option<f64> {
        let n = a.len().min(b.len());
        if n < lookback {
            return None;
        }
        let ratio: Vec<f64> = (n - lookback..n)
            .filter(|i| a[*i] > 0.0 && b[*i] > 0.0)
            .map(|i| (a[i] / b[i]).ln())
            .collect();
        if ratio.len() < lookback / 2 {
            return None;
        }
        let mean = ratio.iter().sum::<f64>() / ratio.len() as f64;
        let variance =
            ratio.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / ratio.len() as f64;
        let std = variance.sqrt();
        if std <= 0.0 {
            return None;
        }
        Some((ratio.last()? - mean) / std)
    }
}

impl Strategy for StatisticalArbitrageStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn execute(
        &self,
        market_data: &HashMap<String, MarketRecord>,
        _sentiment_data: &HashMap<String, SentimentInput>,
        _current_positions: &HashMap<String, PositionRow>,
    ) -> StrategyOutput {
        let symbols = tradeable_symbols(&self.config, market_data);

        // Candidate pairs: same sector, tightly correlated daily returns.
        let mut pairs: Vec<(String, String, f64)> = Vec::new();
        for (i, a) in symbols.iter().enumerate() {
            for b in symbols.iter().skip(i + 1) {
                let rec_a = &market_data[*a];
                let rec_b = &market_data[*b];
                if rec_a.sector != rec_b.sector {
                    continue;
                }

                let ra = Self::daily_returns(&rec_a.price_history, self.lookback_days);
                let rb = Self::daily_returns(&rec_b.price_history, self.lookback_days);
                if let (Some(ra), Some(rb)) = (ra, rb) {
                    if let Some(corr) = Self::correlation(&ra, &rb) {
                        if corr >= 0.7 {
                            pairs.push(((*a).clone(), (*b).clone(), corr));
                        }
                    }
                }
            }
        }

        pairs.sort_by(|x, y| y.2.partial_cmp(&x.2).unwrap_or(std::cmp::Ordering::Equal));

        let leg_weight =
            (1.0 / (2.0 * self.max_pairs.max(1) as f64)).min(self.config.risk.max_position_weight);

        let mut positions = Vec::new();
        let mut pairs_traded = 0usize;

        for (a, b, _corr) in pairs {
            if pairs_traded >= self.max_pairs {
                break;
            }
            let rec_a = &market_data[&a];
            let rec_b = &market_data[&b];

            let z = match Self::spread_zscore(
                &rec_a.price_history,
                &rec_b.price_history,
                self.lookback_days,
            ) {
                Some(z) => z,
                None => continue,
            };
            if z.abs() < self.zscore_entry {
                continue;
            }

            // z > 0: A rich vs B → short A, long B.  z < 0: the reverse.
            let (long_symbol, short_symbol) = if z > 0.0 { (&b, &a) } else { (&a, &b) };
            let strength = (z.abs() * 40.0).min(100.0);

            for (symbol, side) in [
                (long_symbol, PositionSide::Long),
                (short_symbol, PositionSide::Short),
            ] {
                let record = &market_data[symbol.as_str()];
                let price = match record.price() {
                    Some(p) if p > 0.0 => p,
                    _ => continue,
                };
                let (stop_loss, take_profit) = exit_levels(
                    price,
                    side,
                    self.config.risk.stop_loss_pct,
                    self.config.risk.take_profit_pct,
                );
                positions.push(TargetPosition {
                    symbol: (*symbol).clone(),
                    side,
                    target_weight: leg_weight,
                    signal_strength: strength,
                    stop_loss,
                    take_profit,
                    max_holding_days: self.config.risk.max_holding_days,
                });
            }
            pairs_traded += 1;
        }

        let mut risk_metrics = HashMap::new();
        risk_metrics.insert("pairs_traded".to_string(), pairs_traded as f64);
        let net: f64 = positions
            .iter()
            .map(|p| match p.side {
                PositionSide::Long => p.target_weight,
                PositionSide::Short => -p.target_weight,
            })
            .sum();
        risk_metrics.insert("net_exposure".to_string(), net);

        StrategyOutput {
            strategy_name: self.config.name.clone(),
            positions,
            risk_metrics,
        }
    }
}

// =============================================================================
// 5. Volatility Premium — low-vol proxy with a sentiment crisis gate
// =============================================================================

pub struct VolatilityPremiumStrategy {
    config: StrategyConfig,
    vol_lookback_days: usize,
    low_vol_fraction: f64,
}

impl VolatilityPremiumStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        let (vol_lookback_days, low_vol_fraction) = match config.options {
            StrategyOptions::VolatilityPremium {
                vol_lookback_days,
                low_vol_fraction,
            } => (vol_lookback_days, low_vol_fraction),
            _ => (20, 0.2),
        };
        Self {
            config,
            vol_lookback_days,
            low_vol_fraction,
        }
    }
}

impl Strategy for VolatilityPremiumStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn execute(
        &self,
        market_data: &HashMap<String, MarketRecord>,
        sentiment_data: &HashMap<String, SentimentInput>,
        _current_positions: &HashMap<String, PositionRow>,
    ) -> StrategyOutput {
        // Crisis gate: selling volatility into a bearish sentiment regime is
        // how vol-premium books blow up.  FILTER mode halts the whole book
        // when aggregate sentiment breaches the threshold.
        if self.config.sentiment.mode == SentimentMode::Filter {
            let combined: Vec<f64> = sentiment_data
                .values()
                .filter_map(|s| s.combined_sentiment)
                .collect();
            if !combined.is_empty() {
                let aggregate = combined.iter().sum::<f64>() / combined.len() as f64;
                if aggregate < self.config.sentiment.filter_threshold {
                    debug!(
                        strategy = %self.config.name,
                        aggregate,
                        threshold = self.config.sentiment.filter_threshold,
                        "volatility premium crisis gate triggered — flat book"
                    );
                    let mut output = StrategyOutput::empty(self.config.name.clone());
                    output.risk_metrics.insert("crisis_gate".to_string(), 1.0);
                    output
                        .risk_metrics
                        .insert("aggregate_sentiment".to_string(), aggregate);
                    return output;
                }
            }
        }

        let vol_signal = RealizedVolatilitySignal {
            lookback_days: self.vol_lookback_days,
        };

        let mut by_vol: Vec<(String, f64, f64, f64)> = Vec::new();
        for symbol in tradeable_symbols(&self.config, market_data) {
            let record = &market_data[symbol];
            let price = match record.price() {
                Some(p) if p > 0.0 => p,
                _ => continue,
            };
            if let Some(vol) = vol_signal.realized_vol(record) {
                // Signal strength from the generator: calm names score high.
                let strength = vol_signal
                    .generate(record)
                    .map(|s| (s.value + 100.0) / 2.0)
                    .unwrap_or(50.0);
                by_vol.push((symbol.clone(), vol.max(0.02), price, strength));
            }
        }

        // Lowest volatility first.
        by_vol.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let take = ((by_vol.len() as f64 * self.low_vol_fraction).ceil() as usize)
            .min(self.config.max_positions)
            .max(1)
            .min(by_vol.len());
        by_vol.truncate(take);

        // Inverse-vol weights normalised across the book.
        let inv_sum: f64 = by_vol.iter().map(|(_, vol, _, _)| 1.0 / vol).sum();
        let mut positions = Vec::new();
        for (symbol, vol, price, strength) in by_vol {
            let weight = if inv_sum > 0.0 {
                ((1.0 / vol) / inv_sum).min(self.config.risk.max_position_weight)
            } else {
                0.0
            };
            let (stop_loss, take_profit) = exit_levels(
                price,
                PositionSide::Long,
                self.config.risk.stop_loss_pct,
                self.config.risk.take_profit_pct,
            );
            positions.push(TargetPosition {
                symbol,
                side: PositionSide::Long,
                target_weight: weight,
                signal_strength: strength.clamp(0.0, 100.0),
                stop_loss,
                take_profit,
                max_holding_days: self.config.risk.max_holding_days,
            });
        }
        cap_gross_exposure(&mut positions);

        let mut risk_metrics = HashMap::new();
        risk_metrics.insert("positions".to_string(), positions.len() as f64);
        risk_metrics.insert("crisis_gate".to_string(), 0.0);

        StrategyOutput {
            strategy_name: self.config.name.clone(),
            positions,
            risk_metrics,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::{RiskConfig, SentimentConfig, StrategyType};

    fn config(strategy_type: StrategyType, options: StrategyOptions) -> StrategyConfig {
        StrategyConfig {
            name: "test".to_string(),
            strategy_type,
            universe: Vec::new(),
            exclude_tickers: Vec::new(),
            max_positions: 5,
            sentiment: SentimentConfig::default(),
            risk: RiskConfig::default(),
            options,
        }
    }

    fn record(symbol: &str, prices: Vec<f64>) -> MarketRecord {
        MarketRecord {
            symbol: symbol.to_string(),
            current_price: prices.last().copied(),
            price_history: prices,
            sector: Some("Technology".to_string()),
            ..Default::default()
        }
    }

    fn steady_uptrend(days: usize) -> Vec<f64> {
        (0..days).map(|i| 100.0 * (1.0f64 + 0.002).powi(i as i32)).collect()
    }

    #[test]
    fn trend_following_goes_long_uptrends() {
        let cfg = config(
            StrategyType::TrendFollowing,
            StrategyOptions::TrendFollowing {
                lookback_days: 200,
                entry_threshold: 20.0,
                allow_short: false,
                target_volatility: 0.15,
            },
        );
        let strategy = TrendFollowingStrategy::new(cfg);

        let mut market = HashMap::new();
        market.insert("UP".to_string(), record("UP", steady_uptrend(260)));
        // Flat symbol generates no entry.
        market.insert("FLAT".to_string(), record("FLAT", vec![100.0; 260]));

        let output = strategy.execute(&market, &HashMap::new(), &HashMap::new());
        assert_eq!(output.positions.len(), 1);
        let pos = &output.positions[0];
        assert_eq!(pos.symbol, "UP");
        assert_eq!(pos.side, PositionSide::Long);
        assert!(pos.target_weight > 0.0);
        assert!(pos.target_weight <= 0.15);
        // Stop below entry, target above.
        let price = market["UP"].current_price.unwrap();
        assert!(pos.stop_loss.unwrap() < price);
        assert!(pos.take_profit.unwrap() > price);
    }

    #[test]
    fn cross_sectional_ranks_by_integrated_composite() {
        let cfg = config(
            StrategyType::CrossSectionalFactor,
            StrategyOptions::CrossSectionalFactor { top_n: 2 },
        );
        let strategy = CrossSectionalFactorStrategy::new(cfg);

        let mut market = HashMap::new();
        for (symbol, score) in [("A", 90.0), ("B", 70.0), ("C", 40.0)] {
            let mut rec = record(symbol, vec![100.0; 30]);
            rec.integrated_composite = Some(score);
            market.insert(symbol.to_string(), rec);
        }
        // Missing scores are skipped, not defaulted.
        market.insert("NOSCORE".to_string(), record("NOSCORE", vec![100.0; 30]));

        let output = strategy.execute(&market, &HashMap::new(), &HashMap::new());
        let symbols: Vec<&str> =
            output.positions.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols.len(), 2);
        assert!(symbols.contains(&"A"));
        assert!(symbols.contains(&"B"));
        for pos in &output.positions {
            assert!((pos.target_weight - 0.15).abs() < 1e-9); // 1/2 capped at 0.15
        }
    }

    #[test]
    fn cross_sectional_falls_back_to_composite_score() {
        let mut rec = record("A", vec![100.0; 30]);
        rec.composite_score = Some(66.0);
        assert_eq!(CrossSectionalFactorStrategy::ranking_score(&rec), Some(66.0));
        rec.integrated_composite = Some(80.0);
        assert_eq!(CrossSectionalFactorStrategy::ranking_score(&rec), Some(80.0));
    }

    #[test]
    fn reversal_buys_oversold_with_tight_stops() {
        let cfg = config(
            StrategyType::ShortTermReversal,
            StrategyOptions::ShortTermReversal {
                lookback_days: 5,
                zscore_entry: 1.5,
            },
        );
        let strategy = ShortTermReversalStrategy::new(cfg);

        let mut oversold = vec![100.0; 30];
        oversold.extend_from_slice(&[97.0, 94.0, 91.0, 88.0, 82.0]);
        let mut market = HashMap::new();
        market.insert("DIP".to_string(), record("DIP", oversold));
        market.insert("CALM".to_string(), record("CALM", vec![100.0; 35]));

        let output = strategy.execute(&market, &HashMap::new(), &HashMap::new());
        assert_eq!(output.positions.len(), 1);
        let pos = &output.positions[0];
        assert_eq!(pos.symbol, "DIP");
        assert_eq!(pos.max_holding_days, Some(5));
        // Half the default 10% stop distance.
        let price = market["DIP"].current_price.unwrap();
        assert!((pos.stop_loss.unwrap() - price * 0.95).abs() < 1e-9);
    }

    #[test]
    fn stat_arb_is_market_neutral() {
        let cfg = config(
            StrategyType::StatisticalArbitrage,
            StrategyOptions::StatisticalArbitrage {
                lookback_days: 40,
                zscore_entry: 1.5,
                max_pairs: 2,
            },
        );
        let strategy = StatisticalArbitrageStrategy::new(cfg);

        // Two cointegrated-ish names: same return stream, then A dislocates.
        let base: Vec<f64> = (0..80)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 2.0 + i as f64 * 0.1)
            .collect();
        let mut a = base.clone();
        let mut b = base;
        let last = *a.last().unwrap();
        a.push(last * 1.05); // A rips away from the spread
        b.push(*b.last().unwrap());

        let mut market = HashMap::new();
        market.insert("A".to_string(), record("A", a));
        market.insert("B".to_string(), record("B", b));

        let output = strategy.execute(&market, &HashMap::new(), &HashMap::new());
        if output.positions.is_empty() {
            // Spread never breached entry — acceptable only if z was small,
            // which this construction rules out.
            panic!("expected a pair trade");
        }
        assert_eq!(output.positions.len(), 2);
        let long = output
            .positions
            .iter()
            .find(|p| p.side == PositionSide::Long)
            .unwrap();
        let short = output
            .positions
            .iter()
            .find(|p| p.side == PositionSide::Short)
            .unwrap();
        // A outperformed → short A, long B; equal dollar legs.
        assert_eq!(short.symbol, "A");
        assert_eq!(long.symbol, "B");
        assert!((long.target_weight - short.target_weight).abs() < 1e-9);
        assert!((output.risk_metrics["net_exposure"]).abs() < 1e-9);
    }

    #[test]
    fn vol_premium_crisis_gate_halts_book() {
        let mut cfg = config(
            StrategyType::VolatilityPremium,
            StrategyOptions::VolatilityPremium {
                vol_lookback_days: 20,
                low_vol_fraction: 0.5,
            },
        );
        cfg.sentiment.mode = SentimentMode::Filter;
        cfg.sentiment.filter_threshold = -30.0;
        let strategy = VolatilityPremiumStrategy::new(cfg);

        let mut market = HashMap::new();
        market.insert("A".to_string(), record("A", steady_uptrend(60)));
        market.insert("B".to_string(), record("B", steady_uptrend(60)));

        let mut sentiment = HashMap::new();
        for symbol in ["A", "B"] {
            let mut s = SentimentInput::new(symbol);
            s.combined_sentiment = Some(-60.0);
            sentiment.insert(symbol.to_string(), s);
        }

        let output = strategy.execute(&market, &sentiment, &HashMap::new());
        assert!(output.positions.is_empty());
        assert_eq!(output.risk_metrics["crisis_gate"], 1.0);

        // Calm sentiment: the low-vol book is constructed.
        for s in sentiment.values_mut() {
            s.combined_sentiment = Some(10.0);
        }
        let output = strategy.execute(&market, &sentiment, &HashMap::new());
        assert!(!output.positions.is_empty());
        assert_eq!(output.risk_metrics["crisis_gate"], 0.0);
    }
}
